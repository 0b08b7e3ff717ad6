use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrainerError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TrainerError {
    pub fn not_found(what: impl Into<String>) -> Self {
        TrainerError::NotFound(what.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        TrainerError::Validation(msg.into())
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub fn is_not_found(&self) -> bool {
        matches!(self, TrainerError::NotFound(_))
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub fn is_validation(&self) -> bool {
        matches!(self, TrainerError::Validation(_))
    }
}

pub type Result<T> = std::result::Result<T, TrainerError>;
