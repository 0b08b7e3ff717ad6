use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Result, Row};
use std::path::Path;

use crate::models::{ProgressRecord, QuestionDetail, ReviewRecord, TestMode, TestResult, TestType, User};

pub struct Database {
    conn: Connection,
}

const PROGRESS_COLUMNS: &str = "id, user_id, book_id, module_id, questions_seen, questions_correct, \
     mastery_percent, is_unlocked, completed_at, created_at, updated_at";

const REVIEW_COLUMNS: &str = "id, user_id, question_id, book_id, module_id, error_count, \
     last_error_at, last_correct_at, next_review_at, review_interval_days, created_at, updated_at";

const TEST_RESULT_COLUMNS: &str = "id, user_id, test_type, test_mode, book_id, module_id, \
     total_questions, correct_answers, score_percent, time_spent_seconds, question_details, created_at";

impl Database {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        Ok(Self { conn })
    }

    pub fn init(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL UNIQUE,
                email TEXT NOT NULL UNIQUE,
                created_at TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS user_progress (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                book_id INTEGER NOT NULL,
                module_id INTEGER NOT NULL,
                questions_seen INTEGER NOT NULL DEFAULT 0 CHECK(questions_seen >= 0),
                questions_correct INTEGER NOT NULL DEFAULT 0 CHECK(questions_correct >= 0),
                mastery_percent REAL NOT NULL DEFAULT 0,
                is_unlocked INTEGER NOT NULL DEFAULT 0,
                completed_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (user_id, book_id, module_id),
                CHECK (questions_correct <= questions_seen),
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS review_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                question_id TEXT NOT NULL,
                book_id INTEGER NOT NULL,
                module_id INTEGER NOT NULL,
                error_count INTEGER NOT NULL DEFAULT 1,
                last_error_at TEXT NOT NULL,
                last_correct_at TEXT,
                next_review_at TEXT,
                review_interval_days INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (user_id, question_id),
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS test_results (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                test_type TEXT NOT NULL CHECK(test_type IN ('module', 'book', 'mock_exam')),
                test_mode TEXT NOT NULL CHECK(test_mode IN ('standard', '90_second')),
                book_id INTEGER,
                module_id INTEGER,
                total_questions INTEGER NOT NULL,
                correct_answers INTEGER NOT NULL,
                score_percent REAL NOT NULL,
                time_spent_seconds INTEGER NOT NULL,
                question_details TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_progress_user ON user_progress(user_id);
            CREATE INDEX IF NOT EXISTS idx_progress_mastery ON user_progress(user_id, mastery_percent);
            CREATE INDEX IF NOT EXISTS idx_reviews_due ON review_records(user_id, next_review_at);
            CREATE INDEX IF NOT EXISTS idx_reviews_errors ON review_records(user_id, error_count);
            CREATE INDEX IF NOT EXISTS idx_results_user ON test_results(user_id, created_at);
            "#,
        )
    }

    /// Runs `f` inside a single SQLite transaction. Any error rolls back
    /// every write made through this database while `f` ran.
    pub fn in_transaction<T, E, F>(&self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce() -> std::result::Result<T, E>,
        E: From<rusqlite::Error>,
    {
        let tx = self.conn.unchecked_transaction()?;
        let value = f()?;
        tx.commit()?;
        Ok(value)
    }

    // User operations
    pub fn add_user(&self, username: &str, email: &str, now: DateTime<Utc>) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO users (username, email, created_at) VALUES (?1, ?2, ?3)",
            params![username, email, format_ts(&now)],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_user_by_name(&self, username: &str) -> Result<Option<User>> {
        self.conn
            .query_row(
                "SELECT id, username, email, created_at, is_active FROM users WHERE username = ?1",
                params![username],
                user_from_row,
            )
            .optional()
    }

    pub fn list_users(&self) -> Result<Vec<User>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, username, email, created_at, is_active FROM users ORDER BY username",
        )?;
        let rows = stmt.query_map([], user_from_row)?;
        rows.collect()
    }

    // Progress operations
    pub fn get_progress(&self, user_id: i64, book_id: i64, module_id: i64) -> Result<Option<ProgressRecord>> {
        let sql = format!(
            "SELECT {} FROM user_progress WHERE user_id = ?1 AND book_id = ?2 AND module_id = ?3",
            PROGRESS_COLUMNS
        );
        self.conn
            .query_row(&sql, params![user_id, book_id, module_id], progress_from_row)
            .optional()
    }

    /// Inserts or replaces the record keyed by (user, book, module); returns its id.
    pub fn save_progress(&self, record: &ProgressRecord) -> Result<i64> {
        self.conn.query_row(
            r#"
            INSERT INTO user_progress (user_id, book_id, module_id, questions_seen, questions_correct,
                                       mastery_percent, is_unlocked, completed_at, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(user_id, book_id, module_id) DO UPDATE SET
                questions_seen = excluded.questions_seen,
                questions_correct = excluded.questions_correct,
                mastery_percent = excluded.mastery_percent,
                is_unlocked = excluded.is_unlocked,
                completed_at = excluded.completed_at,
                updated_at = excluded.updated_at
            RETURNING id
            "#,
            params![
                record.user_id,
                record.book_id,
                record.module_id,
                record.questions_seen,
                record.questions_correct,
                record.mastery_percent,
                record.is_unlocked,
                record.completed_at.as_ref().map(format_ts),
                format_ts(&record.created_at),
                format_ts(&record.updated_at),
            ],
            |row| row.get(0),
        )
    }

    pub fn list_progress(&self, user_id: i64) -> Result<Vec<ProgressRecord>> {
        let sql = format!(
            "SELECT {} FROM user_progress WHERE user_id = ?1 ORDER BY book_id, module_id",
            PROGRESS_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![user_id], progress_from_row)?;
        rows.collect()
    }

    pub fn list_book_progress(&self, user_id: i64, book_id: i64) -> Result<Vec<ProgressRecord>> {
        let sql = format!(
            "SELECT {} FROM user_progress WHERE user_id = ?1 AND book_id = ?2 ORDER BY module_id",
            PROGRESS_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![user_id, book_id], progress_from_row)?;
        rows.collect()
    }

    pub fn list_progress_below(&self, user_id: i64, mastery_cutoff: f64) -> Result<Vec<ProgressRecord>> {
        let sql = format!(
            "SELECT {} FROM user_progress WHERE user_id = ?1 AND mastery_percent < ?2 ORDER BY book_id, module_id",
            PROGRESS_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![user_id, mastery_cutoff], progress_from_row)?;
        rows.collect()
    }

    // Review record operations
    pub fn get_review(&self, user_id: i64, question_id: &str) -> Result<Option<ReviewRecord>> {
        let sql = format!(
            "SELECT {} FROM review_records WHERE user_id = ?1 AND question_id = ?2",
            REVIEW_COLUMNS
        );
        self.conn
            .query_row(&sql, params![user_id, question_id], review_from_row)
            .optional()
    }

    /// Records a miss in one statement. A new record starts at `error_count = 1`;
    /// an existing one has its count incremented by the database itself, so
    /// concurrent misses on the same key cannot lose an increment.
    /// `book_id`/`module_id` only apply when the record is created.
    #[allow(clippy::too_many_arguments)]
    pub fn record_miss(
        &self,
        user_id: i64,
        question_id: &str,
        book_id: i64,
        module_id: i64,
        interval_days: i64,
        now: DateTime<Utc>,
        next_review_at: DateTime<Utc>,
    ) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO review_records (user_id, question_id, book_id, module_id, error_count,
                                        last_error_at, next_review_at, review_interval_days,
                                        created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6, ?7, ?5, ?5)
            ON CONFLICT(user_id, question_id) DO UPDATE SET
                error_count = review_records.error_count + 1,
                last_error_at = excluded.last_error_at,
                next_review_at = excluded.next_review_at,
                review_interval_days = excluded.review_interval_days,
                updated_at = excluded.updated_at
            "#,
            params![
                user_id,
                question_id,
                book_id,
                module_id,
                format_ts(&now),
                format_ts(&next_review_at),
                interval_days,
            ],
        )?;
        Ok(())
    }

    /// Moves an existing record to a new interval after a correct answer.
    /// Returns false when there is no record to update.
    pub fn record_hit(
        &self,
        user_id: i64,
        question_id: &str,
        interval_days: i64,
        now: DateTime<Utc>,
        next_review_at: DateTime<Utc>,
    ) -> Result<bool> {
        let rows = self.conn.execute(
            r#"
            UPDATE review_records
            SET review_interval_days = ?1,
                last_correct_at = ?2,
                next_review_at = ?3,
                updated_at = ?2
            WHERE user_id = ?4 AND question_id = ?5
            "#,
            params![
                interval_days,
                format_ts(&now),
                format_ts(&next_review_at),
                user_id,
                question_id
            ],
        )?;
        Ok(rows > 0)
    }

    pub fn list_due_reviews(&self, user_id: i64, now: DateTime<Utc>, limit: usize) -> Result<Vec<ReviewRecord>> {
        let sql = format!(
            r#"
            SELECT {} FROM review_records
            WHERE user_id = ?1 AND next_review_at IS NOT NULL AND next_review_at <= ?2
            ORDER BY next_review_at ASC, id ASC
            LIMIT ?3
            "#,
            REVIEW_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![user_id, format_ts(&now), sql_limit(Some(limit))],
            review_from_row,
        )?;
        rows.collect()
    }

    /// Records ordered by error count, highest first.
    pub fn list_reviews_by_errors(
        &self,
        user_id: i64,
        book_id: Option<i64>,
        limit: Option<usize>,
    ) -> Result<Vec<ReviewRecord>> {
        let sql = format!(
            r#"
            SELECT {} FROM review_records
            WHERE user_id = ?1 AND (?2 IS NULL OR book_id = ?2)
            ORDER BY error_count DESC, id ASC
            LIMIT ?3
            "#,
            REVIEW_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![user_id, book_id, sql_limit(limit)], review_from_row)?;
        rows.collect()
    }

    pub fn delete_review(&self, user_id: i64, question_id: &str) -> Result<bool> {
        let rows = self.conn.execute(
            "DELETE FROM review_records WHERE user_id = ?1 AND question_id = ?2",
            params![user_id, question_id],
        )?;
        Ok(rows > 0)
    }

    // Test result operations
    pub fn insert_test_result(&self, result: &TestResult) -> Result<i64> {
        let details = serde_json::to_string(&result.question_details)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;

        self.conn.execute(
            &format!(
                "INSERT INTO test_results ({}) VALUES (NULL, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                TEST_RESULT_COLUMNS
            ),
            params![
                result.user_id,
                result.test_type.as_str(),
                result.test_mode.as_str(),
                result.book_id,
                result.module_id,
                result.total_questions,
                result.correct_answers,
                result.score_percent,
                result.time_spent_seconds,
                details,
                format_ts(&result.created_at),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn list_test_results(
        &self,
        user_id: i64,
        test_type: Option<TestType>,
        limit: usize,
    ) -> Result<Vec<TestResult>> {
        let sql = format!(
            r#"
            SELECT {} FROM test_results
            WHERE user_id = ?1 AND (?2 IS NULL OR test_type = ?2)
            ORDER BY created_at DESC, id DESC
            LIMIT ?3
            "#,
            TEST_RESULT_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![user_id, test_type.map(|t| t.as_str()), sql_limit(Some(limit))],
            test_result_from_row,
        )?;
        rows.collect()
    }
}

/// Fixed-width RFC 3339 so that text order matches time order in SQL.
pub fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(idx: usize, raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn ts_at(row: &Row, idx: usize) -> Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_ts(idx, &raw)
}

fn opt_ts_at(row: &Row, idx: usize) -> Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| parse_ts(idx, &s)).transpose()
}

fn bad_column(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, msg.into())
}

// SQLite treats a negative LIMIT as "no limit"
fn sql_limit(limit: Option<usize>) -> i64 {
    limit.map(|l| l as i64).unwrap_or(-1)
}

fn user_from_row(row: &Row) -> Result<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        email: row.get(2)?,
        created_at: ts_at(row, 3)?,
        is_active: row.get(4)?,
    })
}

fn progress_from_row(row: &Row) -> Result<ProgressRecord> {
    Ok(ProgressRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        book_id: row.get(2)?,
        module_id: row.get(3)?,
        questions_seen: row.get(4)?,
        questions_correct: row.get(5)?,
        mastery_percent: row.get(6)?,
        is_unlocked: row.get(7)?,
        completed_at: opt_ts_at(row, 8)?,
        created_at: ts_at(row, 9)?,
        updated_at: ts_at(row, 10)?,
    })
}

fn review_from_row(row: &Row) -> Result<ReviewRecord> {
    Ok(ReviewRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        question_id: row.get(2)?,
        book_id: row.get(3)?,
        module_id: row.get(4)?,
        error_count: row.get(5)?,
        last_error_at: ts_at(row, 6)?,
        last_correct_at: opt_ts_at(row, 7)?,
        next_review_at: opt_ts_at(row, 8)?,
        review_interval_days: row.get(9)?,
        created_at: ts_at(row, 10)?,
        updated_at: ts_at(row, 11)?,
    })
}

fn test_result_from_row(row: &Row) -> Result<TestResult> {
    let type_str: String = row.get(2)?;
    let mode_str: String = row.get(3)?;
    let details_str: String = row.get(10)?;

    let test_type = TestType::from_str(&type_str)
        .ok_or_else(|| bad_column(2, format!("unknown test_type '{}'", type_str)))?;
    let test_mode = TestMode::from_str(&mode_str)
        .ok_or_else(|| bad_column(3, format!("unknown test_mode '{}'", mode_str)))?;
    let question_details: Vec<QuestionDetail> = serde_json::from_str(&details_str)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(10, Type::Text, Box::new(e)))?;

    Ok(TestResult {
        id: row.get(0)?,
        user_id: row.get(1)?,
        test_type,
        test_mode,
        book_id: row.get(4)?,
        module_id: row.get(5)?,
        total_questions: row.get(6)?,
        correct_answers: row.get(7)?,
        score_percent: row.get(8)?,
        time_spent_seconds: row.get(9)?,
        question_details,
        created_at: ts_at(row, 11)?,
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use chrono::TimeZone;

    pub fn setup_db() -> Database {
        let db = Database::open(":memory:").expect("Failed to create in-memory database");
        db.init().expect("Failed to initialize database");
        db
    }

    pub fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
    }

    pub fn add_user(db: &Database, name: &str) -> i64 {
        db.add_user(name, &format!("{}@example.com", name), t0())
            .expect("Failed to add user")
    }
}
