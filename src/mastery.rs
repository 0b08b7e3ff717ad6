use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use log::debug;

use crate::clock::Clock;
use crate::config::MasteryConfig;
use crate::db::Database;
use crate::error::{Result, TrainerError};
use crate::models::{
    mastery_percent, validate_counts, validate_location, BookProgress, OverallProgress,
    ProgressRecord, SyncRecord,
};

/// Module mastery and the unlock rule.
///
/// Single answers increment counts ([`MasteryEngine::record_answer`]);
/// sync batches and whole module tests merge by maximum
/// ([`MasteryEngine::sync_batch`], [`MasteryEngine::merge_test_counts`]),
/// so retaking a test never inflates the totals.
pub struct MasteryEngine<'a> {
    db: &'a Database,
    clock: &'a dyn Clock,
    config: MasteryConfig,
}

impl<'a> MasteryEngine<'a> {
    pub fn new(db: &'a Database, clock: &'a dyn Clock) -> Self {
        Self::with_config(db, clock, MasteryConfig::default())
    }

    pub fn with_config(db: &'a Database, clock: &'a dyn Clock, config: MasteryConfig) -> Self {
        Self { db, clock, config }
    }

    pub fn record_answer(&self, user_id: i64, book_id: i64, module_id: i64, is_correct: bool) -> Result<ProgressRecord> {
        validate_location(book_id, module_id)?;
        self.db.in_transaction(|| {
            let now = self.clock.now();
            let mut record = self.load_or_new(user_id, book_id, module_id, now)?;

            record.questions_seen += 1;
            if is_correct {
                record.questions_correct += 1;
            }
            self.save_and_propagate(&mut record, now)?;
            Ok(record)
        })
    }

    /// Opens the module after `module_id`, creating its record if needed.
    /// Never locks anything.
    pub fn unlock_next(&self, user_id: i64, book_id: i64, module_id: i64) -> Result<()> {
        let next_module = module_id.checked_add(1).ok_or_else(|| {
            TrainerError::validation(format!("module {} has no successor", module_id))
        })?;
        let now = self.clock.now();
        let mut record = self.load_or_new(user_id, book_id, next_module, now)?;
        if record.is_unlocked && record.id != 0 {
            return Ok(());
        }

        record.is_unlocked = true;
        record.updated_at = now;
        self.db.save_progress(&record)?;
        debug!(
            "Unlocked book {} module {} for user {}",
            book_id, next_module, user_id
        );
        Ok(())
    }

    /// Merges client-reported counts. The whole batch is checked before
    /// anything is written, and applied in one transaction.
    pub fn sync_batch(&self, user_id: i64, records: &[SyncRecord]) -> Result<Vec<ProgressRecord>> {
        for r in records {
            validate_location(r.book_id, r.module_id)?;
            validate_counts(r.questions_seen, r.questions_correct)?;
        }

        self.db.in_transaction(|| {
            for r in records {
                self.merge(
                    user_id,
                    r.book_id,
                    r.module_id,
                    r.questions_seen,
                    r.questions_correct,
                )?;
            }

            // Modules can arrive out of order, so propagate unlocks over
            // everything the user has, not just this batch.
            for p in self.db.list_progress(user_id)? {
                if p.mastery_percent >= self.config.unlock_threshold {
                    self.unlock_next(user_id, p.book_id, p.module_id)?;
                }
            }

            let mut synced = Vec::with_capacity(records.len());
            for r in records {
                if let Some(p) = self.db.get_progress(user_id, r.book_id, r.module_id)? {
                    synced.push(p);
                }
            }
            debug!("Synced {} progress records for user {}", synced.len(), user_id);
            Ok(synced)
        })
    }

    /// Max-merge path for a finished module test. Runs inside the caller's
    /// transaction.
    pub fn merge_test_counts(
        &self,
        user_id: i64,
        book_id: i64,
        module_id: i64,
        seen: i64,
        correct: i64,
    ) -> Result<ProgressRecord> {
        validate_location(book_id, module_id)?;
        validate_counts(seen, correct)?;
        self.merge(user_id, book_id, module_id, seen, correct)
    }

    fn merge(&self, user_id: i64, book_id: i64, module_id: i64, seen: i64, correct: i64) -> Result<ProgressRecord> {
        let now = self.clock.now();
        let mut record = self.load_or_new(user_id, book_id, module_id, now)?;
        record.questions_seen = record.questions_seen.max(seen);
        record.questions_correct = record.questions_correct.max(correct);
        self.save_and_propagate(&mut record, now)?;
        Ok(record)
    }

    /// Recomputes mastery, completes the module the first time it reaches
    /// the threshold, persists, and opens the next module on completion.
    fn save_and_propagate(&self, record: &mut ProgressRecord, now: DateTime<Utc>) -> Result<()> {
        record.recompute_mastery();
        record.updated_at = now;

        let newly_completed =
            record.mastery_percent >= self.config.unlock_threshold && record.completed_at.is_none();
        if newly_completed {
            record.completed_at = Some(now);
            debug!(
                "Book {} module {} completed by user {} at {:.1}%",
                record.book_id, record.module_id, record.user_id, record.mastery_percent
            );
        }

        record.id = self.db.save_progress(record)?;

        if newly_completed {
            self.unlock_next(record.user_id, record.book_id, record.module_id)?;
        }
        Ok(())
    }

    fn load_or_new(&self, user_id: i64, book_id: i64, module_id: i64, now: DateTime<Utc>) -> Result<ProgressRecord> {
        match self.db.get_progress(user_id, book_id, module_id)? {
            Some(record) => Ok(record),
            None => self.empty_record(user_id, book_id, module_id, now),
        }
    }

    fn empty_record(&self, user_id: i64, book_id: i64, module_id: i64, now: DateTime<Utc>) -> Result<ProgressRecord> {
        let unlocked = module_id == self.config.first_module_id;
        ProgressRecord::new(user_id, book_id, module_id, 0, 0, unlocked, now)
    }

    pub fn overall_progress(&self, user_id: i64) -> Result<OverallProgress> {
        let mut grouped: BTreeMap<i64, Vec<ProgressRecord>> = BTreeMap::new();
        for record in self.db.list_progress(user_id)? {
            grouped.entry(record.book_id).or_default().push(record);
        }

        let books: Vec<BookProgress> = grouped
            .into_iter()
            .map(|(book_id, modules)| BookProgress::from_records(book_id, modules))
            .collect();

        let total_questions_seen = books.iter().map(|b| b.total_questions_seen).sum();
        let total_questions_correct = books.iter().map(|b| b.total_questions_correct).sum();

        Ok(OverallProgress {
            user_id,
            total_questions_seen,
            total_questions_correct,
            overall_mastery: mastery_percent(total_questions_seen, total_questions_correct),
            books_started: books.len(),
            books,
        })
    }

    pub fn book_progress(&self, user_id: i64, book_id: i64) -> Result<BookProgress> {
        let modules = self.db.list_book_progress(user_id, book_id)?;
        Ok(BookProgress::from_records(book_id, modules))
    }

    /// The stored record, or an unsaved empty one when the user has not
    /// touched the module yet.
    pub fn module_progress(&self, user_id: i64, book_id: i64, module_id: i64) -> Result<ProgressRecord> {
        match self.db.get_progress(user_id, book_id, module_id)? {
            Some(record) => Ok(record),
            None => self.empty_record(user_id, book_id, module_id, self.clock.now()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::db::test_support::{add_user, setup_db, t0};
    use chrono::Duration;

    fn sync(book_id: i64, module_id: i64, seen: i64, correct: i64) -> SyncRecord {
        SyncRecord {
            book_id,
            module_id,
            questions_seen: seen,
            questions_correct: correct,
        }
    }

    mod record_answer_tests {
        use super::*;

        #[test]
        fn first_answer_creates_record() {
            let db = setup_db();
            let user = add_user(&db, "alice");
            let clock = FixedClock::new(t0());
            let engine = MasteryEngine::new(&db, &clock);

            let p = engine.record_answer(user, 1, 1, false).unwrap();
            assert!(p.id > 0);
            assert_eq!(p.questions_seen, 1);
            assert_eq!(p.questions_correct, 0);
            assert_eq!(p.mastery_percent, 0.0);
            assert!(p.is_unlocked);
            assert!(p.completed_at.is_none());
        }

        #[test]
        fn completes_on_the_answer_that_reaches_eighty() {
            let db = setup_db();
            let user = add_user(&db, "alice");
            let clock = FixedClock::new(t0());
            let engine = MasteryEngine::new(&db, &clock);

            engine.record_answer(user, 1, 3, false).unwrap();
            engine.record_answer(user, 1, 3, false).unwrap();
            for n in 0..7 {
                clock.advance(Duration::minutes(1));
                let p = engine.record_answer(user, 1, 3, true).unwrap();
                assert!(p.completed_at.is_none(), "completed early at answer {}", n + 3);
            }
            assert!(db.get_progress(user, 1, 4).unwrap().is_none());

            clock.advance(Duration::minutes(1));
            let p = engine.record_answer(user, 1, 3, true).unwrap();
            assert_eq!(p.questions_seen, 10);
            assert_eq!(p.questions_correct, 8);
            assert_eq!(p.mastery_percent, 80.0);
            assert_eq!(p.completed_at, Some(clock.now()));

            let next = db.get_progress(user, 1, 4).unwrap().unwrap();
            assert!(next.is_unlocked);
            assert_eq!(next.questions_seen, 0);
        }

        #[test]
        fn completed_at_never_moves() {
            let db = setup_db();
            let user = add_user(&db, "alice");
            let clock = FixedClock::new(t0());
            let engine = MasteryEngine::new(&db, &clock);

            engine.record_answer(user, 1, 1, true).unwrap();
            clock.advance(Duration::days(1));
            engine.record_answer(user, 1, 1, false).unwrap();
            engine.record_answer(user, 1, 1, true).unwrap();

            let p = db.get_progress(user, 1, 1).unwrap().unwrap();
            assert_eq!(p.completed_at, Some(t0()));
        }

        #[test]
        fn locked_module_still_counts() {
            let db = setup_db();
            let user = add_user(&db, "alice");
            let clock = FixedClock::new(t0());
            let engine = MasteryEngine::new(&db, &clock);

            let p = engine.record_answer(user, 1, 2, true).unwrap();
            assert!(!p.is_unlocked);
            assert_eq!(p.questions_seen, 1);
            assert_eq!(p.questions_correct, 1);
        }

        #[test]
        fn unlock_threshold_comes_from_config() {
            let db = setup_db();
            let user = add_user(&db, "alice");
            let clock = FixedClock::new(t0());
            let engine = MasteryEngine::with_config(
                &db,
                &clock,
                MasteryConfig {
                    unlock_threshold: 50.0,
                    first_module_id: 1,
                },
            );

            engine.record_answer(user, 1, 1, false).unwrap();
            let p = engine.record_answer(user, 1, 1, true).unwrap();
            assert!(p.is_completed());
            assert!(db.get_progress(user, 1, 2).unwrap().unwrap().is_unlocked);
        }
    }

    mod unlock_tests {
        use super::*;

        #[test]
        fn unlock_creates_empty_record() {
            let db = setup_db();
            let user = add_user(&db, "alice");
            let clock = FixedClock::new(t0());
            let engine = MasteryEngine::new(&db, &clock);

            engine.unlock_next(user, 2, 5).unwrap();
            let p = db.get_progress(user, 2, 6).unwrap().unwrap();
            assert!(p.is_unlocked);
            assert_eq!(p.questions_seen, 0);
            assert_eq!(p.mastery_percent, 0.0);
        }

        #[test]
        fn unlock_past_last_module_id_is_rejected() {
            let db = setup_db();
            let user = add_user(&db, "alice");
            let clock = FixedClock::new(t0());
            let engine = MasteryEngine::new(&db, &clock);

            let err = engine.unlock_next(user, 1, i64::MAX).unwrap_err();
            assert!(err.is_validation());

            let err = engine.record_answer(user, 1, i64::MAX, true).unwrap_err();
            assert!(err.is_validation());
            assert!(db.get_progress(user, 1, i64::MAX).unwrap().is_none());
            assert!(db.list_progress(user).unwrap().is_empty());
        }

        #[test]
        fn non_positive_ids_are_rejected_before_writing() {
            let db = setup_db();
            let user = add_user(&db, "alice");
            let clock = FixedClock::new(t0());
            let engine = MasteryEngine::new(&db, &clock);

            assert!(engine.record_answer(user, 0, 1, true).unwrap_err().is_validation());
            assert!(engine.record_answer(user, 1, -3, false).unwrap_err().is_validation());
            assert!(engine
                .merge_test_counts(user, 1, 0, 10, 9)
                .unwrap_err()
                .is_validation());
            assert!(engine
                .sync_batch(user, &[sync(1, 1, 10, 9), sync(-1, 2, 5, 5)])
                .unwrap_err()
                .is_validation());
            assert!(db.list_progress(user).unwrap().is_empty());
        }

        #[test]
        fn unlock_keeps_existing_counts_and_is_repeatable() {
            let db = setup_db();
            let user = add_user(&db, "alice");
            let clock = FixedClock::new(t0());
            let engine = MasteryEngine::new(&db, &clock);

            engine.record_answer(user, 1, 2, false).unwrap();
            engine.unlock_next(user, 1, 1).unwrap();
            engine.unlock_next(user, 1, 1).unwrap();

            let p = db.get_progress(user, 1, 2).unwrap().unwrap();
            assert!(p.is_unlocked);
            assert_eq!(p.questions_seen, 1);
        }

        #[test]
        fn unlock_survives_later_misses() {
            let db = setup_db();
            let user = add_user(&db, "alice");
            let clock = FixedClock::new(t0());
            let engine = MasteryEngine::new(&db, &clock);

            engine.unlock_next(user, 1, 1).unwrap();
            for _ in 0..5 {
                engine.record_answer(user, 1, 2, false).unwrap();
            }
            assert!(db.get_progress(user, 1, 2).unwrap().unwrap().is_unlocked);
        }
    }

    mod sync_tests {
        use super::*;

        #[test]
        fn merges_by_maximum() {
            let db = setup_db();
            let user = add_user(&db, "alice");
            let clock = FixedClock::new(t0());
            let engine = MasteryEngine::new(&db, &clock);

            engine.sync_batch(user, &[sync(1, 1, 10, 6)]).unwrap();
            let out = engine.sync_batch(user, &[sync(1, 1, 8, 7)]).unwrap();

            assert_eq!(out.len(), 1);
            assert_eq!(out[0].questions_seen, 10);
            assert_eq!(out[0].questions_correct, 7);
            assert_eq!(out[0].mastery_percent, 70.0);
        }

        #[test]
        fn repeating_a_batch_changes_nothing() {
            let db = setup_db();
            let user = add_user(&db, "alice");
            let clock = FixedClock::new(t0());
            let engine = MasteryEngine::new(&db, &clock);
            let batch = [sync(1, 1, 10, 9), sync(1, 2, 4, 1)];

            let first = engine.sync_batch(user, &batch).unwrap();
            clock.advance(Duration::hours(1));
            let second = engine.sync_batch(user, &batch).unwrap();

            for (a, b) in first.iter().zip(second.iter()) {
                assert_eq!(a.questions_seen, b.questions_seen);
                assert_eq!(a.questions_correct, b.questions_correct);
                assert_eq!(a.is_unlocked, b.is_unlocked);
                assert_eq!(a.completed_at, b.completed_at);
            }
        }

        #[test]
        fn out_of_order_batch_still_unlocks_successors() {
            let db = setup_db();
            let user = add_user(&db, "alice");
            let clock = FixedClock::new(t0());
            let engine = MasteryEngine::new(&db, &clock);

            let out = engine
                .sync_batch(user, &[sync(1, 3, 5, 1), sync(1, 2, 10, 9)])
                .unwrap();

            // module 3 was written before module 2 completed
            assert!(out[0].is_unlocked);
            assert!(out[1].is_completed());
            assert!(db.get_progress(user, 1, 3).unwrap().unwrap().is_unlocked);
        }

        #[test]
        fn rescan_unlocks_for_previously_completed_modules() {
            let db = setup_db();
            let user = add_user(&db, "alice");
            let clock = FixedClock::new(t0());
            let engine = MasteryEngine::new(&db, &clock);

            // stored at 90% without its successor
            let mut p = ProgressRecord::new(user, 2, 1, 10, 9, true, t0()).unwrap();
            p.completed_at = Some(t0());
            db.save_progress(&p).unwrap();

            engine.sync_batch(user, &[sync(3, 1, 1, 0)]).unwrap();
            assert!(db.get_progress(user, 2, 2).unwrap().unwrap().is_unlocked);
        }

        #[test]
        fn invalid_tuple_rejects_whole_batch() {
            let db = setup_db();
            let user = add_user(&db, "alice");
            let clock = FixedClock::new(t0());
            let engine = MasteryEngine::new(&db, &clock);

            let err = engine
                .sync_batch(user, &[sync(1, 1, 5, 5), sync(1, 2, 3, 4)])
                .unwrap_err();
            assert!(err.is_validation());
            assert!(db.list_progress(user).unwrap().is_empty());
        }

        #[test]
        fn creation_by_sync_uses_default_unlock_rule() {
            let db = setup_db();
            let user = add_user(&db, "alice");
            let clock = FixedClock::new(t0());
            let engine = MasteryEngine::new(&db, &clock);

            let out = engine
                .sync_batch(user, &[sync(1, 1, 2, 1), sync(1, 5, 2, 1)])
                .unwrap();
            assert!(out[0].is_unlocked);
            assert!(!out[1].is_unlocked);
        }
    }

    mod merge_tests {
        use super::*;

        #[test]
        fn retaking_a_test_does_not_inflate() {
            let db = setup_db();
            let user = add_user(&db, "alice");
            let clock = FixedClock::new(t0());
            let engine = MasteryEngine::new(&db, &clock);

            engine.merge_test_counts(user, 1, 1, 10, 6).unwrap();
            let p = engine.merge_test_counts(user, 1, 1, 10, 6).unwrap();
            assert_eq!(p.questions_seen, 10);
            assert_eq!(p.questions_correct, 6);
        }

        #[test]
        fn merge_completes_and_unlocks() {
            let db = setup_db();
            let user = add_user(&db, "alice");
            let clock = FixedClock::new(t0());
            let engine = MasteryEngine::new(&db, &clock);

            let p = engine.merge_test_counts(user, 1, 1, 10, 8).unwrap();
            assert!(p.is_completed());
            assert!(db.get_progress(user, 1, 2).unwrap().unwrap().is_unlocked);
        }

        #[test]
        fn merge_rejects_bad_counts() {
            let db = setup_db();
            let user = add_user(&db, "alice");
            let clock = FixedClock::new(t0());
            let engine = MasteryEngine::new(&db, &clock);
            assert!(engine.merge_test_counts(user, 1, 1, 2, 3).is_err());
        }
    }

    mod view_tests {
        use super::*;

        #[test]
        fn overall_groups_by_book() {
            let db = setup_db();
            let user = add_user(&db, "alice");
            let clock = FixedClock::new(t0());
            let engine = MasteryEngine::new(&db, &clock);

            engine
                .sync_batch(user, &[sync(1, 1, 10, 5), sync(1, 2, 10, 5), sync(4, 1, 20, 20)])
                .unwrap();

            let overall = engine.overall_progress(user).unwrap();
            assert_eq!(overall.total_questions_seen, 40);
            assert_eq!(overall.total_questions_correct, 30);
            assert_eq!(overall.overall_mastery, 75.0);
            assert_eq!(overall.books_started, 2);
            assert_eq!(overall.books[0].book_id, 1);
            assert_eq!(overall.books[0].book_mastery, 50.0);
        }

        #[test]
        fn overall_for_new_user_is_zero() {
            let db = setup_db();
            let user = add_user(&db, "alice");
            let clock = FixedClock::new(t0());
            let engine = MasteryEngine::new(&db, &clock);

            let overall = engine.overall_progress(user).unwrap();
            assert_eq!(overall.overall_mastery, 0.0);
            assert_eq!(overall.books_started, 0);
            assert!(overall.books.is_empty());
        }

        #[test]
        fn book_with_any_record_counts_as_started() {
            let db = setup_db();
            let user = add_user(&db, "alice");
            let clock = FixedClock::new(t0());
            let engine = MasteryEngine::new(&db, &clock);

            engine
                .sync_batch(user, &[sync(1, 1, 0, 0), sync(2, 1, 4, 1)])
                .unwrap();

            let overall = engine.overall_progress(user).unwrap();
            assert_eq!(overall.books_started, 2);
            assert_eq!(overall.total_questions_seen, 4);
        }

        #[test]
        fn book_progress_orders_modules() {
            let db = setup_db();
            let user = add_user(&db, "alice");
            let clock = FixedClock::new(t0());
            let engine = MasteryEngine::new(&db, &clock);

            engine
                .sync_batch(user, &[sync(1, 3, 1, 1), sync(1, 1, 1, 0)])
                .unwrap();
            let book = engine.book_progress(user, 1).unwrap();
            let ids: Vec<i64> = book.modules.iter().map(|m| m.module_id).collect();
            // module 4 was opened by module 3's completion
            assert_eq!(ids, vec![1, 3, 4]);
        }

        #[test]
        fn untouched_module_is_synthesized_not_saved() {
            let db = setup_db();
            let user = add_user(&db, "alice");
            let clock = FixedClock::new(t0());
            let engine = MasteryEngine::new(&db, &clock);

            let first = engine.module_progress(user, 7, 1).unwrap();
            assert!(first.is_unlocked);
            assert_eq!(first.id, 0);

            let later = engine.module_progress(user, 7, 2).unwrap();
            assert!(!later.is_unlocked);
            assert!(db.list_progress(user).unwrap().is_empty());
        }
    }
}
