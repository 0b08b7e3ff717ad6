use std::collections::BTreeMap;

use chrono::Duration;
use log::{debug, warn};
use serde::Serialize;

use crate::clock::Clock;
use crate::config::{SchedulerConfig, MASTERED_INTERVAL_DAYS};
use crate::corpus::{Question, QuestionSource};
use crate::db::Database;
use crate::error::{Result, TrainerError};
use crate::models::{AnswerResult, BookErrors, ErrorStats, ReviewRecord, ReviewSummary};

const MOST_PROBLEMATIC_LIMIT: usize = 10;

/// The interval ladder, validated once at construction.
#[derive(Debug, Clone, PartialEq)]
pub struct Ladder {
    rungs: Vec<i64>,
}

impl Ladder {
    pub fn new(config: &SchedulerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            rungs: config.ladder.clone(),
        })
    }

    pub fn first(&self) -> i64 {
        self.rungs[0]
    }

    /// Rung holding `days`. A value that is not on the ladder counts as rung 0.
    pub fn index_of(&self, days: i64) -> usize {
        match self.rungs.iter().position(|&r| r == days) {
            Some(idx) => idx,
            None => {
                warn!(
                    "Review interval {} is not on the ladder {:?}; treating as first rung",
                    days, self.rungs
                );
                0
            }
        }
    }

    /// The next rung up, saturating at the top.
    pub fn advance(&self, days: i64) -> i64 {
        let next = (self.index_of(days) + 1).min(self.rungs.len() - 1);
        self.rungs[next]
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReviewItem {
    pub error_id: i64,
    pub question_id: String,
    pub book_id: i64,
    pub module_id: i64,
    pub error_count: i64,
    pub review_interval_days: i64,
    pub question: Question,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReviewQueue {
    pub total_due: usize,
    pub questions: Vec<ReviewItem>,
}

/// Per-question spaced repetition over the review records table.
pub struct ReviewScheduler<'a> {
    db: &'a Database,
    clock: &'a dyn Clock,
    ladder: Ladder,
}

impl<'a> ReviewScheduler<'a> {
    pub fn new(db: &'a Database, clock: &'a dyn Clock) -> Self {
        Self {
            db,
            clock,
            ladder: Ladder {
                rungs: SchedulerConfig::default().ladder,
            },
        }
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub fn with_config(db: &'a Database, clock: &'a dyn Clock, config: &SchedulerConfig) -> Result<Self> {
        Ok(Self {
            db,
            clock,
            ladder: Ladder::new(config)?,
        })
    }

    /// Creates the record on a first miss, otherwise bumps the error count.
    /// Either way the question drops to the first rung and is due now.
    pub fn record_incorrect(&self, user_id: i64, question_id: &str, book_id: i64, module_id: i64) -> Result<()> {
        let now = self.clock.now();
        self.db.record_miss(
            user_id,
            question_id,
            book_id,
            module_id,
            self.ladder.first(),
            now,
            now,
        )?;
        debug!("{} missed by user {}: reset to first rung", question_id, user_id);
        Ok(())
    }

    /// Climbs one rung. Questions that were never missed have no schedule,
    /// so nothing happens for them.
    pub fn record_correct(&self, user_id: i64, question_id: &str) -> Result<()> {
        let Some(record) = self.db.get_review(user_id, question_id)? else {
            return Ok(());
        };
        self.advance(&record)?;
        Ok(())
    }

    /// Explicit review of an existing record. Unlike the two calls above
    /// this fails with `NotFound` when the question has no record, and a
    /// miss schedules the next review one first-rung interval out.
    pub fn mark_reviewed(&self, user_id: i64, question_id: &str, result: AnswerResult) -> Result<ReviewSummary> {
        self.db.in_transaction(|| {
            let record = self
                .db
                .get_review(user_id, question_id)?
                .ok_or_else(|| TrainerError::not_found(format!("review record for {}", question_id)))?;

            if result.is_correct() {
                self.advance(&record)?;
            } else {
                let now = self.clock.now();
                let interval = self.ladder.first();
                self.db.record_miss(
                    user_id,
                    question_id,
                    record.book_id,
                    record.module_id,
                    interval,
                    now,
                    now + Duration::days(interval),
                )?;
            }

            let updated = self
                .db
                .get_review(user_id, question_id)?
                .ok_or_else(|| TrainerError::not_found(format!("review record for {}", question_id)))?;

            Ok(ReviewSummary {
                question_id: updated.question_id,
                new_interval_days: updated.review_interval_days,
                next_review_at: updated.next_review_at.unwrap_or(updated.updated_at),
                total_errors: updated.error_count,
            })
        })
    }

    fn advance(&self, record: &ReviewRecord) -> Result<()> {
        let now = self.clock.now();
        let interval = self.ladder.advance(record.review_interval_days);
        self.db.record_hit(
            record.user_id,
            &record.question_id,
            interval,
            now,
            now + Duration::days(interval),
        )?;
        debug!(
            "{} answered by user {}: interval {} -> {} days",
            record.question_id, record.user_id, record.review_interval_days, interval
        );
        Ok(())
    }

    /// Records due now, earliest first.
    pub fn get_due(&self, user_id: i64, limit: usize) -> Result<Vec<ReviewRecord>> {
        Ok(self.db.list_due_reviews(user_id, self.clock.now(), limit)?)
    }

    /// Removes a record for good once the user considers it mastered.
    pub fn delete_record(&self, user_id: i64, question_id: &str) -> Result<()> {
        if !self.db.delete_review(user_id, question_id)? {
            return Err(TrainerError::not_found(format!(
                "review record for {}",
                question_id
            )));
        }
        debug!("Deleted review record {} for user {}", question_id, user_id);
        Ok(())
    }

    pub fn list_errors(&self, user_id: i64, limit: usize, book_id: Option<i64>) -> Result<Vec<ReviewRecord>> {
        Ok(self.db.list_reviews_by_errors(user_id, book_id, Some(limit))?)
    }

    pub fn error_stats(&self, user_id: i64) -> Result<ErrorStats> {
        let records = self.db.list_reviews_by_errors(user_id, None, None)?;
        let now = self.clock.now();

        let mut by_book: BTreeMap<i64, BookErrors> = BTreeMap::new();
        for record in &records {
            let entry = by_book.entry(record.book_id).or_default();
            entry.count += 1;
            entry.question_ids.push(record.question_id.clone());
        }

        Ok(ErrorStats {
            total_errors: records.len() as i64,
            due_today: records.iter().filter(|r| r.is_due(now)).count() as i64,
            mastered: records
                .iter()
                .filter(|r| r.review_interval_days >= MASTERED_INTERVAL_DAYS)
                .count() as i64,
            by_book,
            most_problematic: records.into_iter().take(MOST_PROBLEMATIC_LIMIT).collect(),
        })
    }

    /// Due records joined with their question content. Records whose
    /// question has left the corpus still count towards `total_due`.
    pub fn review_queue(&self, user_id: i64, limit: usize, corpus: &dyn QuestionSource) -> Result<ReviewQueue> {
        let due = self.get_due(user_id, limit)?;
        let total_due = due.len();

        let questions = due
            .into_iter()
            .filter_map(|record| {
                let question = corpus.find_question(&record.question_id);
                if question.is_none() {
                    debug!("Due question {} is not in the corpus", record.question_id);
                }
                question.map(|question| ReviewItem {
                    error_id: record.id,
                    question_id: record.question_id,
                    book_id: record.book_id,
                    module_id: record.module_id,
                    error_count: record.error_count,
                    review_interval_days: record.review_interval_days,
                    question,
                })
            })
            .collect();

        Ok(ReviewQueue {
            total_due,
            questions,
        })
    }
}
