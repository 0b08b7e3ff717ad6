// Several read models are only surfaced through --json output
#![allow(dead_code)]

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TrainerError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
    pub is_active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestType {
    Module,
    Book,
    MockExam,
}

impl TestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestType::Module => "module",
            TestType::Book => "book",
            TestType::MockExam => "mock_exam",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "module" => Some(TestType::Module),
            "book" => Some(TestType::Book),
            "mock_exam" | "mock-exam" | "mock" => Some(TestType::MockExam),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TestMode {
    #[serde(rename = "standard")]
    Standard,
    #[serde(rename = "90_second")]
    NinetySecond,
}

impl TestMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestMode::Standard => "standard",
            TestMode::NinetySecond => "90_second",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "standard" => Some(TestMode::Standard),
            "90_second" | "90s" | "timed" => Some(TestMode::NinetySecond),
            _ => None,
        }
    }
}

// Outcome of answering a single question
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnswerResult {
    Correct,
    Incorrect,
}

impl AnswerResult {
    pub fn is_correct(&self) -> bool {
        matches!(self, AnswerResult::Correct)
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "correct" | "c" | "yes" | "y" | "right" | "1" => Some(AnswerResult::Correct),
            "incorrect" | "i" | "wrong" | "no" | "n" | "0" => Some(AnswerResult::Incorrect),
            _ => None,
        }
    }
}

/// Mastery as a percentage; zero when nothing has been seen.
pub fn mastery_percent(seen: i64, correct: i64) -> f64 {
    if seen <= 0 {
        0.0
    } else {
        (correct as f64 * 100.0) / seen as f64
    }
}

pub fn validate_counts(seen: i64, correct: i64) -> Result<()> {
    if seen < 0 || correct < 0 {
        return Err(TrainerError::validation(format!(
            "counts must be non-negative (seen={}, correct={})",
            seen, correct
        )));
    }
    if correct > seen {
        return Err(TrainerError::validation(format!(
            "correct ({}) cannot exceed seen ({})",
            correct, seen
        )));
    }
    Ok(())
}

/// Book and module ids are 1-based.
pub fn validate_location(book_id: i64, module_id: i64) -> Result<()> {
    if book_id < 1 || module_id < 1 {
        return Err(TrainerError::validation(format!(
            "book and module ids must be positive (book={}, module={})",
            book_id, module_id
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub id: i64,
    pub user_id: i64,
    pub book_id: i64,
    pub module_id: i64,
    pub questions_seen: i64,
    pub questions_correct: i64,
    pub mastery_percent: f64,
    pub is_unlocked: bool,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProgressRecord {
    /// An unsaved record (`id == 0`) with validated counts.
    pub fn new(
        user_id: i64,
        book_id: i64,
        module_id: i64,
        questions_seen: i64,
        questions_correct: i64,
        is_unlocked: bool,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        validate_counts(questions_seen, questions_correct)?;
        Ok(Self {
            id: 0,
            user_id,
            book_id,
            module_id,
            questions_seen,
            questions_correct,
            mastery_percent: mastery_percent(questions_seen, questions_correct),
            is_unlocked,
            completed_at: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn recompute_mastery(&mut self) {
        self.mastery_percent = mastery_percent(self.questions_seen, self.questions_correct);
    }

    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncRecord {
    pub book_id: i64,
    pub module_id: i64,
    pub questions_seen: i64,
    pub questions_correct: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BookProgress {
    pub book_id: i64,
    pub modules: Vec<ProgressRecord>,
    pub total_questions_seen: i64,
    pub total_questions_correct: i64,
    pub book_mastery: f64,
}

impl BookProgress {
    pub fn from_records(book_id: i64, modules: Vec<ProgressRecord>) -> Self {
        let total_questions_seen = modules.iter().map(|m| m.questions_seen).sum();
        let total_questions_correct = modules.iter().map(|m| m.questions_correct).sum();
        Self {
            book_id,
            modules,
            total_questions_seen,
            total_questions_correct,
            book_mastery: mastery_percent(total_questions_seen, total_questions_correct),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OverallProgress {
    pub user_id: i64,
    pub total_questions_seen: i64,
    pub total_questions_correct: i64,
    pub overall_mastery: f64,
    pub books_started: usize,
    pub books: Vec<BookProgress>,
}

// Per-question spaced repetition state, created on the first miss
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewRecord {
    pub id: i64,
    pub user_id: i64,
    pub question_id: String,
    pub book_id: i64,
    pub module_id: i64,
    pub error_count: i64,
    pub last_error_at: DateTime<Utc>,
    pub last_correct_at: Option<DateTime<Utc>>,
    pub next_review_at: Option<DateTime<Utc>>,
    pub review_interval_days: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ReviewRecord {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_review_at.map(|at| at <= now).unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReviewSummary {
    pub question_id: String,
    pub new_interval_days: i64,
    pub next_review_at: DateTime<Utc>,
    pub total_errors: i64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BookErrors {
    pub count: i64,
    pub question_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorStats {
    pub total_errors: i64,
    pub due_today: i64,
    pub mastered: i64,
    pub by_book: BTreeMap<i64, BookErrors>,
    pub most_problematic: Vec<ReviewRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionDetail {
    pub question_id: String,
    #[serde(default)]
    pub user_answer: String,
    pub correct: bool,
    #[serde(default)]
    pub time_spent: i64,
}

/// Raw submission as received from a client; enums are still strings.
#[derive(Debug, Clone, Deserialize)]
pub struct TestSubmission {
    pub test_type: String,
    pub test_mode: String,
    #[serde(default)]
    pub book_id: Option<i64>,
    #[serde(default)]
    pub module_id: Option<i64>,
    pub time_spent_seconds: i64,
    pub question_details: Vec<QuestionDetail>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestResult {
    pub id: i64,
    pub user_id: i64,
    pub test_type: TestType,
    pub test_mode: TestMode,
    pub book_id: Option<i64>,
    pub module_id: Option<i64>,
    pub total_questions: i64,
    pub correct_answers: i64,
    pub score_percent: f64,
    pub time_spent_seconds: i64,
    pub question_details: Vec<QuestionDetail>,
    pub created_at: DateTime<Utc>,
}

// JSON output wrapper for CLI
#[derive(Debug, Serialize)]
pub struct JsonOutput<T: Serialize> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T: Serialize> JsonOutput<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}
