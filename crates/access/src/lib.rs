//! Pooled data-access layer for quarry.
//!
//! # Architecture
//! A caller checks a [`SessionScope`] out of a [`ConnectionPool`], builds a
//! [`QueryDescriptor`](quarry_store::QueryDescriptor) and runs it through a
//! [`QueryStrategy`](strategy::QueryStrategy) chain:
//! - **Direct**: terminal, no tracking.
//! - **Tracked**: registers entities for change tracking and write-back.
//! - **Projected**: fetches only named fields.
//! - **Cached**: serves repeated descriptors from the shared [`Cache`].
//! - **Batched**: picks a joined or split fetch for included relations.
//!
//! The pool and cache are built once and shared by `Arc`; there is no global
//! state.

pub mod cache;
pub mod error;
mod pool;
mod scope;
pub mod strategy;
mod tracker;

pub use crate::cache::{Cache, CacheStats};
pub use crate::pool::{ConnectionPool, DEFAULT_ACQUIRE_TIMEOUT, DEFAULT_CAPACITY, PoolOptions, PoolStats, PoolStatus};
pub use crate::scope::SessionScope;
pub use crate::tracker::ChangeTracker;
