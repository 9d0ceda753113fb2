//! Access Layer Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction. Store failures are carried through
//! unchanged as [`ErrorKind::Store`], with the store's own error tree kept as
//! a child.

use derive_more::{Display, Error};
use quarry_store::error::{Error as StoreError, ErrorKind as StoreErrorKind};

/// An access-layer error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for access-layer operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// No session became free within the acquire timeout.
    #[display("connection pool exhausted")]
    PoolExhausted,
    /// The caller's cancellation token fired before the operation finished.
    #[display("operation cancelled")]
    Cancelled,
    #[display("connection pool is closed")]
    PoolClosed,
    /// A projected query must name a strict subset of the entity's fields and
    /// cannot include relations.
    #[display("invalid projection: {_0}")]
    InvalidProjection(#[error(not(source))] String),
    /// Write-back was requested for an entity this scope does not track.
    #[display("entity is not tracked: {_0}")]
    NotTracked(#[error(not(source))] String),
    /// Failure reported by the store, kind unchanged.
    #[display("store error: {_0}")]
    Store(StoreErrorKind),
}

impl ErrorKind {
    /// Convert a store error into an access-layer error, preserving the store
    /// crate's `Exn` frame (error tree) as a child in its own error tree.
    #[track_caller]
    pub fn store(err: StoreError) -> Error {
        let inner = (*err).clone();
        err.raise(ErrorKind::Store(inner))
    }

    /// The store error kind, if this error came from the store.
    pub fn store_kind(&self) -> Option<&StoreErrorKind> {
        match self {
            Self::Store(kind) => Some(kind),
            _ => None,
        }
    }

    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::PoolExhausted => true,
            Self::Store(kind) => kind.is_retryable(),
            _ => false,
        }
    }
}
