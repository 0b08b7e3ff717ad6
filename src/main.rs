mod clock;
mod config;
mod corpus;
mod db;
mod error;
mod exam;
mod mastery;
mod models;
mod scheduler;
mod submission;
mod users;

use std::io::Read;

use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;

use clock::SystemClock;
use corpus::{CorpusDir, Question, QuestionSource};
use db::Database;
use error::{Result, TrainerError};
use exam::{ExamAssembler, ExamKind, DEFAULT_BOOK_TEST_SIZE};
use mastery::MasteryEngine;
use models::{AnswerResult, JsonOutput, ProgressRecord, SyncRecord, TestSubmission, TestType, User};
use scheduler::ReviewScheduler;
use submission::{SubmissionPipeline, DEFAULT_HISTORY_LIMIT};

const DEFAULT_REVIEW_LIMIT: usize = 20;
const DEFAULT_ERROR_LIST_LIMIT: usize = 100;

#[derive(Parser)]
#[command(name = "cfa-trainer")]
#[command(about = "Exam-prep trainer: module progress, spaced review of missed questions, and mock exams")]
#[command(version)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Act as this user (defaults to $CFA_TRAINER_USER)
    #[arg(long, short, global = true)]
    user: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database
    Init,

    /// Manage users
    #[command(subcommand)]
    User(UserCommands),

    /// List available books
    Books,

    /// Module progress and unlocks
    #[command(subcommand)]
    Progress(ProgressCommands),

    /// Spaced review of missed questions
    #[command(subcommand)]
    Review(ReviewCommands),

    /// Generate and submit tests
    #[command(subcommand)]
    Test(TestCommands),
}

#[derive(Subcommand)]
enum UserCommands {
    /// Register a new user
    Add {
        username: String,

        #[arg(long, short)]
        email: String,
    },

    /// List users
    List,
}

#[derive(Subcommand)]
enum ProgressCommands {
    /// Overall progress, or one book's modules
    Show {
        #[arg(long, short)]
        book: Option<i64>,
    },

    /// Progress for one module
    Module { book: i64, module: i64 },

    /// Record a single answered question
    Answer {
        book: i64,
        module: i64,

        /// correct/incorrect
        #[arg(long, short)]
        result: String,
    },

    /// Merge progress records from a JSON file ("-" for stdin)
    Sync { input: String },
}

#[derive(Subcommand)]
enum ReviewCommands {
    /// Questions due for review now
    Due {
        #[arg(long, short, default_value_t = DEFAULT_REVIEW_LIMIT)]
        limit: usize,
    },

    /// Missed questions, most errors first
    List {
        #[arg(long, short, default_value_t = DEFAULT_ERROR_LIST_LIMIT)]
        limit: usize,

        #[arg(long, short)]
        book: Option<i64>,
    },

    /// Error statistics
    Stats,

    /// Record the outcome of reviewing a question
    Mark {
        question_id: String,

        /// correct/incorrect
        #[arg(long, short)]
        result: String,
    },

    /// Remove a question from review (mastered)
    Delete { question_id: String },
}

#[derive(Subcommand)]
enum TestCommands {
    /// Questions for a module test
    Module {
        book: i64,
        module: i64,

        /// Keep file order
        #[arg(long)]
        no_shuffle: bool,

        #[arg(long, short)]
        limit: Option<usize>,
    },

    /// Random questions across a book
    Book {
        book: i64,

        #[arg(long, short, default_value_t = DEFAULT_BOOK_TEST_SIZE)]
        count: usize,
    },

    /// Adaptive mock exam
    Mock {
        /// Seed for a reproducible exam
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Submit a finished test from a JSON file ("-" for stdin)
    Submit { input: String },

    /// Past test results
    History {
        #[arg(long, short, default_value_t = DEFAULT_HISTORY_LIMIT)]
        limit: usize,

        #[arg(long = "type", short = 't')]
        test_type: Option<String>,
    },
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    let json = cli.json;

    if let Err(e) = run(cli) {
        if json {
            if let Ok(out) = serde_json::to_string(&JsonOutput::<()>::err(e.to_string())) {
                println!("{}", out);
            }
        } else {
            eprintln!("Error: {}", e);
        }
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let db_path = config::get_db_path();
    let db = Database::open(&db_path)?;
    db.init()?;
    let clock = SystemClock;

    match cli.command {
        Commands::Init => {
            if cli.json {
                print_json(())?;
            } else {
                println!("Database initialized at: {}", db_path.display());
            }
        }

        Commands::User(user_cmd) => match user_cmd {
            UserCommands::Add { username, email } => {
                let user = users::add_user(&db, &clock, &username, &email)?;
                if cli.json {
                    print_json(&user)?;
                } else {
                    println!("Added user '{}' with ID: {}", user.username, user.id);
                }
            }

            UserCommands::List => {
                let all = db.list_users()?;
                if cli.json {
                    print_json(&all)?;
                } else if all.is_empty() {
                    println!("No users found.");
                } else {
                    println!("{:<5} {:<24} EMAIL", "ID", "USERNAME");
                    println!("{}", "-".repeat(60));
                    for u in all {
                        println!("{:<5} {:<24} {}", u.id, truncate(&u.username, 22), u.email);
                    }
                }
            }
        },

        Commands::Books => {
            let books = open_corpus()?.books();
            if cli.json {
                print_json(&books)?;
            } else if books.is_empty() {
                println!("No books found in {}.", config::get_data_dir().display());
            } else {
                println!("{:<5} {:<36} {:>8} {:>10}", "BOOK", "NAME", "MODULES", "QUESTIONS");
                println!("{}", "-".repeat(62));
                for b in books {
                    println!(
                        "{:<5} {:<36} {:>8} {:>10}",
                        b.book_id,
                        truncate(&b.book_name, 34),
                        b.modules_count,
                        b.total_questions
                    );
                }
            }
        }

        Commands::Progress(progress_cmd) => {
            let user = current_user(&db, cli.user.as_deref())?;
            let engine = MasteryEngine::new(&db, &clock);

            match progress_cmd {
                ProgressCommands::Show { book: Some(book) } => {
                    let progress = engine.book_progress(user.id, book)?;
                    if cli.json {
                        print_json(&progress)?;
                    } else {
                        println!(
                            "Book {}: {:.1}% mastery ({}/{} correct)",
                            book,
                            progress.book_mastery,
                            progress.total_questions_correct,
                            progress.total_questions_seen
                        );
                        println!();
                        print_module_table(&progress.modules);
                    }
                }

                ProgressCommands::Show { book: None } => {
                    let overall = engine.overall_progress(user.id)?;
                    if cli.json {
                        print_json(&overall)?;
                    } else {
                        println!("=== Progress for {} ===", user.username);
                        println!(
                            "Overall mastery: {:.1}% ({}/{} correct)",
                            overall.overall_mastery,
                            overall.total_questions_correct,
                            overall.total_questions_seen
                        );
                        println!("Books started: {}", overall.books_started);
                        for book in &overall.books {
                            println!();
                            println!("--- Book {} ({:.1}%) ---", book.book_id, book.book_mastery);
                            print_module_table(&book.modules);
                        }
                    }
                }

                ProgressCommands::Module { book, module } => {
                    let p = engine.module_progress(user.id, book, module)?;
                    if cli.json {
                        print_json(&p)?;
                    } else {
                        print_module_table(std::slice::from_ref(&p));
                    }
                }

                ProgressCommands::Answer {
                    book,
                    module,
                    result,
                } => {
                    let outcome = parse_result(&result)?;
                    let was_completed = engine.module_progress(user.id, book, module)?.is_completed();
                    let p = engine.record_answer(user.id, book, module, outcome.is_correct())?;
                    if cli.json {
                        print_json(&p)?;
                    } else {
                        println!(
                            "Book {} module {}: {}/{} ({:.1}%)",
                            book, module, p.questions_correct, p.questions_seen, p.mastery_percent
                        );
                        if let Some(line) = completion_notice(was_completed, &p) {
                            println!("{}", line);
                        }
                    }
                }

                ProgressCommands::Sync { input } => {
                    let records: Vec<SyncRecord> = serde_json::from_str(&read_input(&input)?)?;
                    let synced = engine.sync_batch(user.id, &records)?;
                    if cli.json {
                        print_json(&synced)?;
                    } else {
                        println!("Synced {} records.", synced.len());
                        print_module_table(&synced);
                    }
                }
            }
        }

        Commands::Review(review_cmd) => {
            let user = current_user(&db, cli.user.as_deref())?;
            let scheduler = ReviewScheduler::new(&db, &clock);

            match review_cmd {
                ReviewCommands::Due { limit } => {
                    let corpus = open_corpus()?;
                    let queue = scheduler.review_queue(user.id, limit, &corpus)?;
                    if cli.json {
                        print_json(&queue)?;
                    } else if queue.total_due == 0 {
                        println!("Nothing due for review.");
                    } else {
                        println!("{} question(s) due.", queue.total_due);
                        println!();
                        println!("{:<16} {:>5} {:>7} {:>9} QUESTION", "ID", "BOOK", "ERRORS", "INTERVAL");
                        println!("{}", "-".repeat(80));
                        for item in &queue.questions {
                            println!(
                                "{:<16} {:>5} {:>7} {:>8}d {}",
                                truncate(&item.question_id, 16),
                                item.book_id,
                                item.error_count,
                                item.review_interval_days,
                                truncate(&item.question.question_text, 36)
                            );
                        }
                    }
                }

                ReviewCommands::List { limit, book } => {
                    let errors = scheduler.list_errors(user.id, limit, book)?;
                    if cli.json {
                        print_json(&errors)?;
                    } else if errors.is_empty() {
                        println!("No missed questions.");
                    } else {
                        println!(
                            "{:<16} {:>5} {:>7} {:>7} {:>9} NEXT REVIEW",
                            "ID", "BOOK", "MODULE", "ERRORS", "INTERVAL"
                        );
                        println!("{}", "-".repeat(80));
                        for r in errors {
                            println!(
                                "{:<16} {:>5} {:>7} {:>7} {:>8}d {}",
                                truncate(&r.question_id, 16),
                                r.book_id,
                                r.module_id,
                                r.error_count,
                                r.review_interval_days,
                                r.next_review_at
                                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                                    .unwrap_or_else(|| "-".to_string())
                            );
                        }
                    }
                }

                ReviewCommands::Stats => {
                    let stats = scheduler.error_stats(user.id)?;
                    if cli.json {
                        print_json(&stats)?;
                    } else {
                        println!("=== Review Statistics ===");
                        println!("Questions tracked: {}", stats.total_errors);
                        println!("Due now: {}", stats.due_today);
                        println!("Mastered (30d+ interval): {}", stats.mastered);
                        for (book_id, errors) in &stats.by_book {
                            println!("Book {}: {} question(s)", book_id, errors.count);
                        }
                        if !stats.most_problematic.is_empty() {
                            println!();
                            println!("Most missed:");
                            for r in &stats.most_problematic {
                                println!("  {:<16} {} errors", r.question_id, r.error_count);
                            }
                        }
                    }
                }

                ReviewCommands::Mark {
                    question_id,
                    result,
                } => {
                    let outcome = parse_result(&result)?;
                    let summary = scheduler.mark_reviewed(user.id, &question_id, outcome)?;
                    if cli.json {
                        print_json(&summary)?;
                    } else {
                        println!("Review recorded for {}.", summary.question_id);
                        println!(
                            "Next review in {} day(s): {}",
                            summary.new_interval_days,
                            summary.next_review_at.format("%Y-%m-%d %H:%M")
                        );
                    }
                }

                ReviewCommands::Delete { question_id } => {
                    scheduler.delete_record(user.id, &question_id)?;
                    if cli.json {
                        print_json(())?;
                    } else {
                        println!("Removed {} from review.", question_id);
                    }
                }
            }
        }

        Commands::Test(test_cmd) => match test_cmd {
            TestCommands::Module {
                book,
                module,
                no_shuffle,
                limit,
            } => {
                let corpus = open_corpus()?;
                let mut rng = StdRng::from_entropy();
                let questions = exam::module_test(&corpus, book, module, !no_shuffle, limit, &mut rng)?;
                emit_questions(cli.json, &questions)?;
            }

            TestCommands::Book { book, count } => {
                let corpus = open_corpus()?;
                let mut rng = StdRng::from_entropy();
                let questions = exam::book_test(&corpus, book, count, &mut rng)?;
                emit_questions(cli.json, &questions)?;
            }

            TestCommands::Mock { seed } => {
                let user = current_user(&db, cli.user.as_deref())?;
                let corpus = open_corpus()?;
                let mut rng = seed
                    .map(StdRng::seed_from_u64)
                    .unwrap_or_else(StdRng::from_entropy);
                let mock = exam::mock_exam(&db, &corpus, &ExamAssembler::new(), user.id, &mut rng)?;
                if cli.json {
                    print_json(&mock)?;
                } else {
                    if mock.kind == ExamKind::Degraded {
                        println!("Only {} questions available; using all of them.", mock.total_questions);
                    }
                    println!(
                        "Mock exam: {} questions ({} from errors, {} from weak modules, {} random)",
                        mock.total_questions, mock.from_errors, mock.from_weak_modules, mock.from_fill
                    );
                    println!();
                    print_question_table(&mock.questions);
                }
            }

            TestCommands::Submit { input } => {
                let user = current_user(&db, cli.user.as_deref())?;
                let submission: TestSubmission = serde_json::from_str(&read_input(&input)?)?;
                let result = SubmissionPipeline::new(&db, &clock).submit(user.id, &submission)?;
                if cli.json {
                    print_json(&result)?;
                } else {
                    println!(
                        "Score: {}/{} ({:.1}%) in {}s",
                        result.correct_answers,
                        result.total_questions,
                        result.score_percent,
                        result.time_spent_seconds
                    );
                }
            }

            TestCommands::History { limit, test_type } => {
                let user = current_user(&db, cli.user.as_deref())?;
                let filter = test_type.as_deref().map(parse_test_type).transpose()?;
                let results = SubmissionPipeline::new(&db, &clock).history(user.id, limit, filter)?;
                if cli.json {
                    print_json(&results)?;
                } else if results.is_empty() {
                    println!("No tests taken yet.");
                } else {
                    println!(
                        "{:<5} {:<10} {:<10} {:>5} {:>7} {:>7} TAKEN",
                        "ID", "TYPE", "MODE", "BOOK", "SCORE", "TIME"
                    );
                    println!("{}", "-".repeat(72));
                    for r in results {
                        println!(
                            "{:<5} {:<10} {:<10} {:>5} {:>6.1}% {:>6}s {}",
                            r.id,
                            r.test_type.as_str(),
                            r.test_mode.as_str(),
                            r.book_id.map(|b| b.to_string()).unwrap_or_else(|| "-".to_string()),
                            r.score_percent,
                            r.time_spent_seconds,
                            r.created_at.format("%Y-%m-%d %H:%M")
                        );
                    }
                }
            }
        },
    }

    Ok(())
}

fn print_json<T: Serialize>(data: T) -> Result<()> {
    println!("{}", serde_json::to_string(&JsonOutput::ok(data))?);
    Ok(())
}

fn current_user(db: &Database, flag: Option<&str>) -> Result<User> {
    let name = flag
        .map(str::to_string)
        .or_else(|| std::env::var(config::USER_ENV).ok())
        .ok_or_else(|| {
            TrainerError::validation(format!(
                "no user selected; pass --user or set {}",
                config::USER_ENV
            ))
        })?;
    users::resolve_user(db, &name)
}

fn open_corpus() -> Result<CorpusDir> {
    CorpusDir::open(config::get_data_dir())
}

/// Reads a file, or stdin when `path` is "-".
fn read_input(path: &str) -> Result<String> {
    if path == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        Ok(buf)
    } else {
        Ok(std::fs::read_to_string(path)?)
    }
}

fn parse_result(raw: &str) -> Result<AnswerResult> {
    AnswerResult::from_str(raw).ok_or_else(|| {
        TrainerError::validation(format!("Invalid result '{}'. Use: correct or incorrect", raw))
    })
}

fn parse_test_type(raw: &str) -> Result<TestType> {
    TestType::from_str(raw).ok_or_else(|| {
        TrainerError::validation(format!("Invalid test type '{}'. Use: module, book, or mock_exam", raw))
    })
}

fn emit_questions(json: bool, questions: &[Question]) -> Result<()> {
    if json {
        print_json(questions)
    } else {
        print_question_table(questions);
        Ok(())
    }
}

fn print_question_table(questions: &[Question]) {
    println!("{:<16} {:>5} {:>7} QUESTION", "ID", "BOOK", "MODULE");
    println!("{}", "-".repeat(80));
    for q in questions {
        println!(
            "{:<16} {:>5} {:>7} {}",
            truncate(&q.question_id, 16),
            q.book_id,
            q.module_id,
            truncate(&q.question_text, 48)
        );
    }
}

fn print_module_table(modules: &[ProgressRecord]) {
    println!("{:<7} {:>6} {:>8} {:>9} {:<9} COMPLETED", "MODULE", "SEEN", "CORRECT", "MASTERY", "STATUS");
    println!("{}", "-".repeat(64));
    for m in modules {
        println!(
            "{:<7} {:>6} {:>8} {:>8.1}% {:<9} {}",
            m.module_id,
            m.questions_seen,
            m.questions_correct,
            m.mastery_percent,
            if m.is_unlocked { "unlocked" } else { "locked" },
            m.completed_at
                .map(|t| t.format("%Y-%m-%d").to_string())
                .unwrap_or_else(|| "-".to_string())
        );
    }
}

/// Announces completion only on the answer that crossed the threshold.
fn completion_notice(was_completed: bool, progress: &ProgressRecord) -> Option<String> {
    if was_completed || !progress.is_completed() {
        return None;
    }
    Some(format!(
        "Module completed; module {} is unlocked.",
        progress.module_id + 1
    ))
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
