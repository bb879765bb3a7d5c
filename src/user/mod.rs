mod builder;
mod repository;
mod service;

pub use builder::*;
pub use repository::*;
pub use service::*;

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidateEmail, ValidationError};

/// Timestamp stored in every "last *" column until the event happens once.
pub const NEVER: DateTime<Utc> = DateTime::UNIX_EPOCH;

static USERNAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_.@+-]+$").expect("username regex is valid")
});

/// User as saved on database.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    #[serde(skip)]
    #[sqlx(rename = "user_id")]
    pub id: i64,
    pub username: String,
    #[serde(skip)]
    pub password_hash: String,
    pub email: String,
    pub password_question: Option<String>,
    /// Argon2id hash of the case-folded answer.
    #[serde(skip)]
    pub password_answer: Option<String>,
    pub approved: bool,
    pub locked: bool,
    #[sqlx(rename = "regdate")]
    pub created_at: DateTime<Utc>,
    #[sqlx(rename = "last_login")]
    pub last_login_at: DateTime<Utc>,
    #[sqlx(rename = "last_activity")]
    pub last_activity_at: DateTime<Utc>,
    #[sqlx(rename = "last_password_changed")]
    pub last_password_changed_at: DateTime<Utc>,
    #[sqlx(rename = "last_lockout")]
    pub last_lockout_at: DateTime<Utc>,
}

impl User {
    /// Whether the account never authenticated successfully.
    pub fn never_logged_in(&self) -> bool {
        self.last_login_at == NEVER
    }

    /// Whether credential checks can succeed for this account.
    pub fn can_authenticate(&self) -> bool {
        self.approved && !self.locked
    }
}

/// Validated input of [`UserStore::create_user`].
#[derive(Clone, Validate)]
pub struct NewUser {
    #[validate(
        length(min = 1, max = 50, message = "Username must contain 1 to 50 characters."),
        custom(function = "validate_username", message = "Username contains forbidden characters.")
    )]
    pub username: String,
    pub password: String,
    #[validate(custom(function = "validate_email", message = "Email must be formatted."))]
    pub email: String,
    pub approved: bool,
    #[validate(length(max = 255))]
    pub password_question: Option<String>,
    #[validate(length(min = 1, max = 255))]
    pub password_answer: Option<String>,
}

impl std::fmt::Debug for NewUser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NewUser")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("email", &self.email)
            .field("approved", &self.approved)
            .field("password_question", &self.password_question)
            .field("password_answer", &self.password_answer.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

fn validate_username(username: &str) -> Result<(), ValidationError> {
    if USERNAME_RE.is_match(username) {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_username"))
    }
}

/// Empty emails are accepted, anything else must be well formed.
pub(crate) fn validate_email(email: &str) -> Result<(), ValidationError> {
    if email.is_empty() || email.validate_email() {
        Ok(())
    } else {
        Err(ValidationError::new("email"))
    }
}
