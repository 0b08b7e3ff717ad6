use std::path::PathBuf;

use crate::error::{Result, TrainerError};

pub const DEFAULT_DB_NAME: &str = "cfa-trainer.db";
pub const APP_DIR: &str = "cfa-trainer";

pub const DB_ENV: &str = "CFA_TRAINER_DB";
pub const DATA_ENV: &str = "CFA_TRAINER_DATA";
pub const USER_ENV: &str = "CFA_TRAINER_USER";

/// Review interval ladder, in days.
pub const REVIEW_LADDER_DAYS: [i64; 6] = [1, 3, 7, 14, 30, 60];

/// Mastery percent at which a module completes and unlocks its successor.
pub const UNLOCK_THRESHOLD_PERCENT: f64 = 80.0;

/// The first module of every book starts unlocked.
pub const FIRST_MODULE_ID: i64 = 1;

/// Modules below this mastery feed the weak-module pool of a mock exam.
pub const WEAK_MODULE_CUTOFF_PERCENT: f64 = 70.0;

pub const MOCK_EXAM_SIZE: usize = 180;
pub const ERROR_POOL_SHARE: f64 = 0.30;
pub const WEAK_POOL_SHARE: f64 = 0.30;

/// Review intervals are counted at or above this many days as "mastered" in stats.
pub const MASTERED_INTERVAL_DAYS: i64 = 30;

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    pub ladder: Vec<i64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            ladder: REVIEW_LADDER_DAYS.to_vec(),
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.ladder.is_empty() {
            return Err(TrainerError::validation("review ladder must have at least one rung"));
        }
        if self.ladder[0] < 0 {
            return Err(TrainerError::validation("review ladder rungs must be non-negative"));
        }
        if self.ladder.windows(2).any(|w| w[0] >= w[1]) {
            return Err(TrainerError::validation(
                "review ladder must be strictly increasing",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MasteryConfig {
    pub unlock_threshold: f64,
    pub first_module_id: i64,
}

impl Default for MasteryConfig {
    fn default() -> Self {
        Self {
            unlock_threshold: UNLOCK_THRESHOLD_PERCENT,
            first_module_id: FIRST_MODULE_ID,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExamConfig {
    pub size: usize,
    pub error_share: f64,
    pub weak_share: f64,
    pub weak_cutoff: f64,
}

impl Default for ExamConfig {
    fn default() -> Self {
        Self {
            size: MOCK_EXAM_SIZE,
            error_share: ERROR_POOL_SHARE,
            weak_share: WEAK_POOL_SHARE,
            weak_cutoff: WEAK_MODULE_CUTOFF_PERCENT,
        }
    }
}

impl ExamConfig {
    pub fn error_quota(&self) -> usize {
        (self.size as f64 * self.error_share).round() as usize
    }

    pub fn weak_quota(&self) -> usize {
        (self.size as f64 * self.weak_share).round() as usize
    }

    pub fn validate(&self) -> Result<()> {
        let shares_ok = (0.0..=1.0).contains(&self.error_share)
            && (0.0..=1.0).contains(&self.weak_share)
            && self.error_share + self.weak_share <= 1.0;
        if !shares_ok {
            return Err(TrainerError::validation(
                "exam pool shares must lie in [0, 1] and sum to at most 1",
            ));
        }
        Ok(())
    }
}

pub fn get_db_path() -> PathBuf {
    resolve_db_path(std::env::var(DB_ENV).ok())
}

pub fn get_data_dir() -> PathBuf {
    resolve_data_dir(std::env::var(DATA_ENV).ok())
}

fn resolve_db_path(env_override: Option<String>) -> PathBuf {
    if let Some(path) = env_override {
        return PathBuf::from(path);
    }

    let config_dir = dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR);

    std::fs::create_dir_all(&config_dir).ok();
    config_dir.join(DEFAULT_DB_NAME)
}

fn resolve_data_dir(env_override: Option<String>) -> PathBuf {
    if let Some(path) = env_override {
        return PathBuf::from(path);
    }

    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
        .join("books")
}
