//! Domain errors

use thiserror::Error;

/// Domain result type
pub type Result<T> = std::result::Result<T, DomainError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),

    #[error("Dialog does not exist: {0}")]
    DialogNotFound(String),

    #[error("Request outside of dialog: {0}")]
    OutsideDialog(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}
