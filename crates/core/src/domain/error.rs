// Domain Error Types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DomainError {
    #[error("Invalid content id: {0:?}")]
    InvalidContentId(String),

    #[error("Invalid object type: {0}")]
    InvalidObjectType(i32),

    #[error("Invalid publish operation: {0}")]
    InvalidOperation(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

pub type Result<T> = std::result::Result<T, DomainError>;
