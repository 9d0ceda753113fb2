//! Store Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction. Every backend maps its native
//! failures onto these kinds, so callers above the store boundary only ever
//! see one taxonomy.

use derive_more::{Display, Error};

/// A store error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Transport-level failure talking to the store. The session that raised
    /// it should not be trusted again.
    #[display("connection lost")]
    ConnectionLost,
    /// The store rejected a write for data-integrity reasons (unique key,
    /// foreign key, NOT NULL). Fatal to the current unit of work.
    #[display("constraint violation: {_0}")]
    ConstraintViolation(#[error(not(source))] String),
    /// A filter expression cannot be pushed down to the store, and client-side
    /// evaluation was not explicitly enabled.
    #[display("predicate cannot be translated for the store: {_0}")]
    UntranslatablePredicate(#[error(not(source))] String),
    #[display("unknown entity type: {_0}")]
    UnknownEntity(#[error(not(source))] String),
    #[display("unknown field: {_0}")]
    UnknownField(#[error(not(source))] String),
    #[display("unknown relation: {_0}")]
    UnknownRelation(#[error(not(source))] String),
    /// Schema definition is invalid (bad identifier, duplicate field, ...).
    #[display("invalid schema: {_0}")]
    InvalidSchema(#[error(not(source))] String),
    /// A row or value could not be decoded into the data model.
    #[display("invalid data: {_0}")]
    InvalidData(#[error(not(source))] &'static str),
    /// The field is managed by the store and cannot be written.
    #[display("field is read-only: {_0}")]
    ReadOnlyField(#[error(not(source))] String),
    #[display("entity not found: ({_0}, {_1})")]
    NotFound(#[error(not(source))] String, #[error(not(source))] i64),
    /// Any other database failure.
    #[display("database error")]
    Database,
    #[display("database migration error")]
    Migration,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConnectionLost)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use exn::ResultExt;

    #[test]
    fn error_kind_display() {
        assert_eq!(ErrorKind::ConnectionLost.to_string(), "connection lost");
        assert_eq!(
            ErrorKind::ConstraintViolation("UNIQUE constraint failed: blogs.id".to_string()).to_string(),
            "constraint violation: UNIQUE constraint failed: blogs.id"
        );
        assert_eq!(ErrorKind::NotFound("blog".to_string(), 7).to_string(), "entity not found: (blog, 7)");
    }

    #[test]
    fn error_kind_retryable() {
        assert!(ErrorKind::ConnectionLost.is_retryable());
        assert!(!ErrorKind::ConstraintViolation(String::new()).is_retryable());
        assert!(!ErrorKind::UntranslatablePredicate(String::new()).is_retryable());
    }

    #[test]
    fn error_from_result() {
        let result: std::result::Result<(), std::io::Error> =
            Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "socket closed"));
        let err: Result<()> = result.or_raise(|| ErrorKind::ConnectionLost);
        assert_eq!(*err.unwrap_err(), ErrorKind::ConnectionLost);
    }
}
