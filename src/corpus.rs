use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, TrainerError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionOption {
    pub id: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub question_id: String,
    #[serde(default)]
    pub book_id: i64,
    #[serde(default)]
    pub module_id: i64,
    #[serde(default)]
    pub question_text: String,
    #[serde(default)]
    pub options: Vec<QuestionOption>,
    #[serde(default)]
    pub correct_option_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub difficulty: Option<String>,
    /// Content fields this crate does not interpret (translations, formulas, tables).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BookSummary {
    pub book_id: i64,
    pub book_name: String,
    pub modules_count: usize,
    pub total_questions: usize,
}

/// Read-only access to the question content.
pub trait QuestionSource {
    /// Ids of every book that has at least one question, ascending.
    fn book_ids(&self) -> Vec<i64>;

    /// All questions of a book, in module order. `NotFound` for an unknown book.
    fn book_questions(&self, book_id: i64) -> Result<Vec<Question>>;

    fn module_questions(&self, book_id: i64, module_id: i64) -> Result<Vec<Question>>;

    fn all_questions(&self) -> Vec<Question>;

    fn find_question(&self, question_id: &str) -> Option<Question>;

    fn book_name(&self, book_id: i64) -> String {
        format!("Book {}", book_id)
    }

    fn books(&self) -> Vec<BookSummary> {
        self.book_ids()
            .into_iter()
            .filter_map(|book_id| {
                let questions = self.book_questions(book_id).ok()?;
                let modules: HashSet<i64> = questions.iter().map(|q| q.module_id).collect();
                Some(BookSummary {
                    book_id,
                    book_name: self.book_name(book_id),
                    modules_count: modules.len(),
                    total_questions: questions.len(),
                })
            })
            .collect()
    }
}

/// A fully materialized corpus.
#[derive(Debug, Clone, Default)]
pub struct MemoryCorpus {
    questions: Vec<Question>,
}

impl MemoryCorpus {
    pub fn new(questions: Vec<Question>) -> Self {
        Self { questions }
    }
}

impl QuestionSource for MemoryCorpus {
    fn book_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.questions.iter().map(|q| q.book_id).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    fn book_questions(&self, book_id: i64) -> Result<Vec<Question>> {
        let mut found: Vec<Question> = self
            .questions
            .iter()
            .filter(|q| q.book_id == book_id)
            .cloned()
            .collect();
        if found.is_empty() {
            return Err(TrainerError::not_found(format!("book {}", book_id)));
        }
        // stable, so questions keep file order within a module
        found.sort_by_key(|q| q.module_id);
        Ok(found)
    }

    fn module_questions(&self, book_id: i64, module_id: i64) -> Result<Vec<Question>> {
        let found: Vec<Question> = self
            .questions
            .iter()
            .filter(|q| q.book_id == book_id && q.module_id == module_id)
            .cloned()
            .collect();
        if found.is_empty() {
            return Err(TrainerError::not_found(format!(
                "book {} module {}",
                book_id, module_id
            )));
        }
        Ok(found)
    }

    fn all_questions(&self) -> Vec<Question> {
        self.questions.clone()
    }

    fn find_question(&self, question_id: &str) -> Option<Question> {
        self.questions
            .iter()
            .find(|q| q.question_id == question_id)
            .cloned()
    }
}

#[derive(Debug, Deserialize)]
struct ModuleFile {
    #[serde(default)]
    book_name: Option<String>,
    #[serde(default)]
    questions: Vec<Question>,
}

/// Question content laid out on disk as
/// `<root>/book<N>_<slug>/module<M>/questions.json`.
///
/// Book and module ids come from the directory names, overriding whatever
/// the JSON says. The whole tree is read once by [`CorpusDir::open`].
#[derive(Debug, Clone)]
pub struct CorpusDir {
    book_names: BTreeMap<i64, String>,
    questions: MemoryCorpus,
}

impl CorpusDir {
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref();
        if !root.is_dir() {
            return Err(TrainerError::not_found(format!(
                "content directory {}",
                root.display()
            )));
        }

        let mut book_names = BTreeMap::new();
        let mut questions = Vec::new();

        for (book_id, book_path) in numbered_dirs(root, parse_book_dir)? {
            for (module_id, module_path) in numbered_dirs(&book_path, parse_module_dir)? {
                let file = module_path.join("questions.json");
                if !file.exists() {
                    continue;
                }
                let module = match load_module_file(&file) {
                    Ok(module) => module,
                    Err(e) => {
                        warn!("Skipping {}: {}", file.display(), e);
                        continue;
                    }
                };

                if let Some(name) = module.book_name.filter(|n| !n.is_empty()) {
                    book_names.entry(book_id).or_insert(name);
                }
                questions.extend(module.questions.into_iter().map(|mut q| {
                    q.book_id = book_id;
                    q.module_id = module_id;
                    q
                }));
            }
        }

        debug!(
            "Loaded {} questions across {} books from {}",
            questions.len(),
            book_names.len(),
            root.display()
        );

        Ok(Self {
            book_names,
            questions: MemoryCorpus::new(questions),
        })
    }
}

impl QuestionSource for CorpusDir {
    fn book_ids(&self) -> Vec<i64> {
        self.questions.book_ids()
    }

    fn book_questions(&self, book_id: i64) -> Result<Vec<Question>> {
        self.questions.book_questions(book_id)
    }

    fn module_questions(&self, book_id: i64, module_id: i64) -> Result<Vec<Question>> {
        self.questions.module_questions(book_id, module_id)
    }

    fn all_questions(&self) -> Vec<Question> {
        self.questions.all_questions()
    }

    fn find_question(&self, question_id: &str) -> Option<Question> {
        self.questions.find_question(question_id)
    }

    fn book_name(&self, book_id: i64) -> String {
        self.book_names
            .get(&book_id)
            .cloned()
            .unwrap_or_else(|| format!("Book {}", book_id))
    }
}

fn load_module_file(path: &Path) -> Result<ModuleFile> {
    let raw = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

/// Subdirectories of `dir` whose names `parse` accepts, sorted by id.
fn numbered_dirs(dir: &Path, parse: fn(&str) -> Option<i64>) -> Result<Vec<(i64, PathBuf)>> {
    let mut found = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        if let Some(id) = entry.file_name().to_str().and_then(parse) {
            found.push((id, path));
        }
    }
    found.sort_by_key(|(id, _)| *id);
    Ok(found)
}

// "book6_fixed_income" -> 6
fn parse_book_dir(name: &str) -> Option<i64> {
    let rest = name.strip_prefix("book")?;
    let digits = rest.split('_').next()?;
    digits.parse().ok()
}

// "module12" -> 12
fn parse_module_dir(name: &str) -> Option<i64> {
    name.strip_prefix("module")?.parse().ok()
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    mod dir_name_tests {
        use super::*;

        #[test]
        fn parses_book_dirs() {
            assert_eq!(parse_book_dir("book1_quants"), Some(1));
            assert_eq!(parse_book_dir("book10_ethics"), Some(10));
            assert_eq!(parse_book_dir("book7"), Some(7));
            assert_eq!(parse_book_dir("books"), None);
            assert_eq!(parse_book_dir("glossary"), None);
        }

        #[test]
        fn parses_module_dirs() {
            assert_eq!(parse_module_dir("module3"), Some(3));
            assert_eq!(parse_module_dir("module"), None);
            assert_eq!(parse_module_dir("modules_old"), None);
        }
    }

    mod memory_corpus_tests {
        use super::*;

        #[test]
        fn lookups_by_book_and_module() {
            let corpus = grid_corpus(2, 3, 4);
            assert_eq!(corpus.all_questions().len(), 24);
            assert_eq!(corpus.book_ids(), vec![1, 2]);
            assert_eq!(corpus.book_questions(2).unwrap().len(), 12);

            let module = corpus.module_questions(1, 3).unwrap();
            assert_eq!(module.len(), 4);
            assert!(module.iter().all(|q| q.book_id == 1 && q.module_id == 3));
        }

        #[test]
        fn missing_book_or_module_is_not_found() {
            let corpus = grid_corpus(1, 2, 1);
            assert!(corpus.book_questions(9).unwrap_err().is_not_found());
            assert!(corpus.module_questions(1, 5).unwrap_err().is_not_found());
        }

        #[test]
        fn find_question_by_id() {
            let corpus = grid_corpus(1, 1, 3);
            assert_eq!(
                corpus.find_question("B1-M1-Q002").map(|q| q.module_id),
                Some(1)
            );
            assert!(corpus.find_question("nope").is_none());
        }

        #[test]
        fn default_book_summary() {
            let corpus = grid_corpus(2, 3, 2);
            let books = corpus.books();
            assert_eq!(books.len(), 2);
            assert_eq!(books[0].book_name, "Book 1");
            assert_eq!(books[0].modules_count, 3);
            assert_eq!(books[0].total_questions, 6);
        }
    }

    mod corpus_dir_tests {
        use super::*;
        use tempfile::TempDir;

        fn write_module(root: &Path, book_dir: &str, module: i64, body: &str) {
            let dir = root.join(book_dir).join(format!("module{}", module));
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("questions.json"), body).unwrap();
        }

        #[test]
        fn loads_layout_and_takes_ids_from_dirs() {
            let tmp = TempDir::new().unwrap();
            write_module(
                tmp.path(),
                "book1_quants",
                1,
                r#"{
                    "book_name": "Quantitative Methods",
                    "module_id": 99,
                    "questions": [
                        {"question_id": "QM-1-Q001", "question_text": "Rate?",
                         "options": [{"id": "opt1", "text": "5%"}, {"id": "opt2", "text": "6%"}],
                         "correct_option_id": "opt2", "difficulty": "EASY",
                         "question_text_ru": "Ставка?"}
                    ]
                }"#,
            );
            write_module(
                tmp.path(),
                "book1_quants",
                2,
                r#"{"questions": [{"question_id": "QM-2-Q001"}, {"question_id": "QM-2-Q002"}]}"#,
            );

            let corpus = CorpusDir::open(tmp.path()).unwrap();
            assert_eq!(corpus.book_ids(), vec![1]);
            assert_eq!(corpus.all_questions().len(), 3);

            let q = corpus.find_question("QM-1-Q001").unwrap();
            assert_eq!(q.book_id, 1);
            assert_eq!(q.module_id, 1);
            assert_eq!(q.correct_option_id.as_deref(), Some("opt2"));
            assert_eq!(q.difficulty.as_deref(), Some("EASY"));
            assert_eq!(q.extra.get("question_text_ru"), Some(&Value::from("Ставка?")));

            let books = corpus.books();
            assert_eq!(books[0].book_name, "Quantitative Methods");
            assert_eq!(books[0].modules_count, 2);
            assert_eq!(books[0].total_questions, 3);
        }

        #[test]
        fn skips_unparsable_module_files() {
            let tmp = TempDir::new().unwrap();
            write_module(tmp.path(), "book2_economics", 1, "{ not json");
            write_module(
                tmp.path(),
                "book2_economics",
                2,
                r#"{"questions": [{"question_id": "EC-2-Q001"}]}"#,
            );

            let corpus = CorpusDir::open(tmp.path()).unwrap();
            assert_eq!(corpus.all_questions().len(), 1);
            assert!(corpus.module_questions(2, 1).unwrap_err().is_not_found());
            assert_eq!(corpus.book_name(2), "Book 2");
        }

        #[test]
        fn ignores_unrelated_entries() {
            let tmp = TempDir::new().unwrap();
            fs::create_dir_all(tmp.path().join("glossary")).unwrap();
            fs::write(tmp.path().join("README.md"), "content").unwrap();
            write_module(
                tmp.path(),
                "book3_corporate",
                1,
                r#"{"questions": [{"question_id": "CI-1-Q001"}]}"#,
            );

            let corpus = CorpusDir::open(tmp.path()).unwrap();
            assert_eq!(corpus.book_ids(), vec![3]);
        }

        #[test]
        fn missing_root_is_not_found() {
            let tmp = TempDir::new().unwrap();
            let err = CorpusDir::open(tmp.path().join("absent")).unwrap_err();
            assert!(err.is_not_found());
        }
    }
}
