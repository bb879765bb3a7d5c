//! Error handler for membership stores.

use sqlx::Error as SQLxError;
use thiserror::Error;
use validator::ValidationErrors;

use crate::crypto::CryptoError;

pub type Result<T> = std::result::Result<T, Error>;

/// Enum representing every failure a store can report.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{entity} '{name}' not found")]
    NotFound { entity: &'static str, name: String },

    #[error("username '{0}' is already taken")]
    DuplicateUser(String),

    #[error("role '{0}' already exists")]
    DuplicateRole(String),

    #[error("role '{0}' still has members")]
    RolePopulated(String),

    #[error("credentials or security answer rejected")]
    ValidationFailure,

    #[error("validation error occurred")]
    InvalidInput(#[from] ValidationErrors),

    #[error("`{0}` is not supported by this store")]
    Unsupported(&'static str),

    #[error("SQL request failed: {0}")]
    Storage(#[from] SQLxError),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("invalid configuration, {0}")]
    Configuration(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

impl Error {
    pub(crate) fn user_not_found(username: impl Into<String>) -> Self {
        Self::NotFound {
            entity: "user",
            name: username.into(),
        }
    }

    pub(crate) fn role_not_found(role: impl Into<String>) -> Self {
        Self::NotFound {
            entity: "role",
            name: role.into(),
        }
    }
}

/// Whether `err` comes from a violated unique constraint.
pub(crate) fn is_unique_violation(err: &SQLxError) -> bool {
    err.as_database_error()
        .is_some_and(|e| e.is_unique_violation())
}

/// Build a single field validation error, the way `validator` reports them.
pub(crate) fn invalid_field(
    field: &'static str,
    code: &'static str,
    message: &'static str,
) -> ValidationErrors {
    let mut errors = ValidationErrors::new();
    errors.add(
        field,
        validator::ValidationError::new(code).with_message(message.into()),
    );
    errors
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_message() {
        let err = Error::user_not_found("alice");
        assert_eq!(err.to_string(), "user 'alice' not found");

        let err = Error::role_not_found("admin");
        assert_eq!(err.to_string(), "role 'admin' not found");
    }

    #[test]
    fn test_invalid_field() {
        let errors = invalid_field("username", "empty", "Username is required.");
        let fields = errors.field_errors();
        assert_eq!(fields.len(), 1);
        assert_eq!(fields["username"][0].code, "empty");
    }

    #[test]
    fn test_row_not_found_is_not_unique_violation() {
        assert!(!is_unique_violation(&SQLxError::RowNotFound));
    }
}
