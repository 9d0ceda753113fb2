//! Execution policies applied to a query before it reaches the session.
//!
//! Strategies compose by wrapping: each decorator owns the strategy it falls
//! back to, and [`Direct`] terminates the chain.
//!
//! ```
//! use quarry_access::strategy::{Batched, Cached, Direct, QueryStrategy, Tracked};
//! use quarry_access::Cache;
//! use std::sync::Arc;
//!
//! let cache = Arc::new(Cache::new());
//! let strategy = Cached::new(cache, Batched::new(Tracked::new(Direct), 500.0));
//! assert_eq!(strategy.name(), "cached");
//! ```

mod batched;
mod cached;
mod direct;
mod projected;
mod tracked;

pub use self::batched::{Batched, DEFAULT_SPLIT_THRESHOLD};
pub use self::cached::Cached;
pub use self::direct::Direct;
pub use self::projected::Projected;
pub use self::tracked::Tracked;
use crate::error::Result;
use crate::scope::SessionScope;
use async_trait::async_trait;
use quarry_store::{QueryDescriptor, ResultSet};
use std::sync::Arc;

pub type StrategyHandle = Arc<dyn QueryStrategy>;

#[async_trait]
pub trait QueryStrategy: Send + Sync {
    /// Short name of the outermost policy (logging only).
    fn name(&self) -> &'static str;

    async fn execute(&self, scope: &mut SessionScope, query: &QueryDescriptor) -> Result<ResultSet>;
}

#[async_trait]
impl<S: QueryStrategy + ?Sized> QueryStrategy for Arc<S> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    async fn execute(&self, scope: &mut SessionScope, query: &QueryDescriptor) -> Result<ResultSet> {
        (**self).execute(scope, query).await
    }
}

#[async_trait]
impl<S: QueryStrategy + ?Sized> QueryStrategy for Box<S> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    async fn execute(&self, scope: &mut SessionScope, query: &QueryDescriptor) -> Result<ResultSet> {
        (**self).execute(scope, query).await
    }
}
