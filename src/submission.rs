use log::debug;

use crate::clock::Clock;
use crate::db::Database;
use crate::error::{Result, TrainerError};
use crate::mastery::MasteryEngine;
use crate::models::{validate_location, TestMode, TestResult, TestSubmission, TestType};
use crate::scheduler::ReviewScheduler;

pub const DEFAULT_HISTORY_LIMIT: usize = 20;

/// A submission whose enums and fields have been checked.
#[derive(Debug)]
struct ValidSubmission<'s> {
    test_type: TestType,
    test_mode: TestMode,
    raw: &'s TestSubmission,
}

fn validate(submission: &TestSubmission) -> Result<ValidSubmission<'_>> {
    let test_type = TestType::from_str(&submission.test_type).ok_or_else(|| {
        TrainerError::validation(format!(
            "unknown test_type '{}'. Use: module, book, or mock_exam",
            submission.test_type
        ))
    })?;
    let test_mode = TestMode::from_str(&submission.test_mode).ok_or_else(|| {
        TrainerError::validation(format!(
            "unknown test_mode '{}'. Use: standard or 90_second",
            submission.test_mode
        ))
    })?;

    if let (TestType::Module, Some(book_id), Some(module_id)) =
        (test_type, submission.book_id, submission.module_id)
    {
        validate_location(book_id, module_id)?;
    }
    if submission.time_spent_seconds < 0 {
        return Err(TrainerError::validation("time_spent_seconds cannot be negative"));
    }
    for (idx, detail) in submission.question_details.iter().enumerate() {
        if detail.question_id.trim().is_empty() {
            return Err(TrainerError::validation(format!(
                "question_details[{}] has an empty question_id",
                idx
            )));
        }
        if detail.time_spent < 0 {
            return Err(TrainerError::validation(format!(
                "question_details[{}] has negative time_spent",
                idx
            )));
        }
    }

    Ok(ValidSubmission {
        test_type,
        test_mode,
        raw: submission,
    })
}

/// Scores a finished test and fans the answers out to review scheduling
/// and module progress, all in one transaction.
pub struct SubmissionPipeline<'a> {
    db: &'a Database,
    clock: &'a dyn Clock,
    scheduler: ReviewScheduler<'a>,
    mastery: MasteryEngine<'a>,
}

impl<'a> SubmissionPipeline<'a> {
    pub fn new(db: &'a Database, clock: &'a dyn Clock) -> Self {
        Self::with_parts(
            db,
            clock,
            ReviewScheduler::new(db, clock),
            MasteryEngine::new(db, clock),
        )
    }

    pub fn with_parts(
        db: &'a Database,
        clock: &'a dyn Clock,
        scheduler: ReviewScheduler<'a>,
        mastery: MasteryEngine<'a>,
    ) -> Self {
        Self {
            db,
            clock,
            scheduler,
            mastery,
        }
    }

    pub fn submit(&self, user_id: i64, submission: &TestSubmission) -> Result<TestResult> {
        let valid = validate(submission)?;
        let details = &valid.raw.question_details;

        let total = details.len() as i64;
        let correct = details.iter().filter(|d| d.correct).count() as i64;
        let score_percent = if total > 0 {
            correct as f64 / total as f64 * 100.0
        } else {
            0.0
        };

        self.db.in_transaction(|| {
            let mut result = TestResult {
                id: 0,
                user_id,
                test_type: valid.test_type,
                test_mode: valid.test_mode,
                book_id: valid.raw.book_id,
                module_id: valid.raw.module_id,
                total_questions: total,
                correct_answers: correct,
                score_percent,
                time_spent_seconds: valid.raw.time_spent_seconds,
                question_details: details.clone(),
                created_at: self.clock.now(),
            };
            result.id = self.db.insert_test_result(&result)?;

            // exam-wide tests carry no provenance; 0 stands in
            let book_id = valid.raw.book_id.unwrap_or(0);
            let module_id = valid.raw.module_id.unwrap_or(0);
            for detail in details {
                if detail.correct {
                    self.scheduler.record_correct(user_id, &detail.question_id)?;
                } else {
                    self.scheduler
                        .record_incorrect(user_id, &detail.question_id, book_id, module_id)?;
                }
            }

            if let (TestType::Module, Some(book_id), Some(module_id)) =
                (valid.test_type, valid.raw.book_id, valid.raw.module_id)
            {
                self.mastery
                    .merge_test_counts(user_id, book_id, module_id, total, correct)?;
            }

            debug!(
                "Recorded {} test {} for user {}: {}/{} ({:.1}%)",
                result.test_type.as_str(),
                result.id,
                user_id,
                correct,
                total,
                score_percent
            );
            Ok(result)
        })
    }

    /// Past results, newest first.
    pub fn history(&self, user_id: i64, limit: usize, test_type: Option<TestType>) -> Result<Vec<TestResult>> {
        Ok(self.db.list_test_results(user_id, test_type, limit)?)
    }
}
