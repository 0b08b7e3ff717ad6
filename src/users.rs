use log::debug;
use rusqlite::ErrorCode;

use crate::clock::Clock;
use crate::db::Database;
use crate::error::{Result, TrainerError};
use crate::models::User;

const USERNAME_MIN: usize = 3;
const USERNAME_MAX: usize = 50;

pub fn add_user(db: &Database, clock: &dyn Clock, username: &str, email: &str) -> Result<User> {
    let username = username.trim();
    let email = email.trim();

    let len = username.chars().count();
    if !(USERNAME_MIN..=USERNAME_MAX).contains(&len) {
        return Err(TrainerError::validation(format!(
            "username must be {}-{} characters",
            USERNAME_MIN, USERNAME_MAX
        )));
    }
    if !email.contains('@') {
        return Err(TrainerError::validation(format!("'{}' is not an email address", email)));
    }

    match db.add_user(username, email, clock.now()) {
        Ok(id) => debug!("Registered user {} ({})", username, id),
        Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
            return Err(TrainerError::validation(format!(
                "username '{}' or email '{}' is already registered",
                username, email
            )));
        }
        Err(e) => return Err(e.into()),
    }

    resolve_user(db, username)
}

pub fn resolve_user(db: &Database, username: &str) -> Result<User> {
    db.get_user_by_name(username)?
        .ok_or_else(|| TrainerError::not_found(format!("user '{}'", username)))
}
