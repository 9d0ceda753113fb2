//! Store backend traits and implementations.
//!
//! A [`Connector`] opens [`Session`]s; a session is one logical connection to
//! the store. Every data method on a session is exactly one round-trip to the
//! store, which is what the layers above count and optimize. Metadata lookups
//! ([`Session::ping`], [`Session::cardinality`]) are not round-trips in that
//! sense.
//!
//! Sessions are not shared: a session is used by one caller at a time, hence
//! the `&mut self` receivers.

#[cfg(feature = "mock")]
mod mock;
mod sql;
mod sqlite;

#[cfg(feature = "mock")]
pub use self::mock::MockConnector;
pub use self::sqlite::SqliteConnector;
use crate::descriptor::Direction;
use crate::error::Result;
use crate::predicate::Predicate;
use crate::schema::Schema;
use crate::value::Row;
use async_trait::async_trait;
use std::sync::Arc;

pub type ConnectorHandle = Arc<dyn Connector>;
pub type SessionHandle = Box<dyn Session>;

/// One single-table read.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FetchRequest {
    pub entity: String,
    /// Columns to read; `None` reads the identifier and every field.
    pub columns: Option<Vec<String>>,
    /// Must be fully translatable; client-side filters are refused.
    pub filter: Option<Predicate>,
    pub order_by: Vec<(String, Direction)>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl FetchRequest {
    pub fn new(entity: impl Into<String>) -> Self {
        Self { entity: entity.into(), ..Default::default() }
    }
}

/// One row of a parent ⟕ child join. Parents without children appear once
/// with `child: None`.
#[derive(Clone, Debug, PartialEq)]
pub struct JoinedRow {
    pub parent: Row,
    pub child: Option<Row>,
}

/// Table statistics used to estimate join row multiplication.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Cardinality {
    pub parents: u64,
    pub children: u64,
}

impl Cardinality {
    pub fn average_children(&self) -> f64 {
        if self.parents == 0 { 0.0 } else { self.children as f64 / self.parents as f64 }
    }

    /// Estimated rows a joined fetch of `parents` parents would return.
    pub fn estimated_join_rows(&self, parents: u64) -> f64 {
        parents as f64 * self.average_children().max(1.0)
    }
}

/// One logical connection to the store.
///
/// # Examples
///
/// ```no_run
/// use quarry_store::backend::{Connector, FetchRequest};
/// use quarry_store::{Predicate, error::Result};
///
/// async fn count_popular(connector: &dyn Connector) -> Result<usize> {
///     let mut session = connector.connect().await?;
///     let request = FetchRequest {
///         filter: Some(Predicate::ge("rating", 4)),
///         ..FetchRequest::new("blog")
///     };
///     Ok(session.fetch(&request).await?.len())
/// }
/// ```
#[async_trait]
pub trait Session: Send {
    /// Identifier unique among the sessions of one connector (logging only).
    fn id(&self) -> u64;

    /// Cheap liveness check. Fails with
    /// [`ConnectionLost`](crate::error::ErrorKind::ConnectionLost) when the
    /// session can no longer be used.
    async fn ping(&mut self) -> Result<()>;

    /// Read rows of a single entity type.
    async fn fetch(&mut self, request: &FetchRequest) -> Result<Vec<Row>>;

    /// Read parents matching `request` joined with their `relation`
    /// collection, in one round-trip. Ordering, limit and offset apply to the
    /// parents; children follow their parent ordered by identifier.
    async fn fetch_joined(&mut self, request: &FetchRequest, relation: &str) -> Result<Vec<JoinedRow>>;

    /// Row counts of an entity type and of the target of one of its relations.
    async fn cardinality(&mut self, entity: &str, relation: &str) -> Result<Cardinality>;

    /// Insert a row and return its identifier. An explicit `id` value is
    /// honoured; otherwise the store assigns one.
    async fn insert(&mut self, entity: &str, values: &Row) -> Result<i64>;

    /// Update fields of one row. The identifier cannot be updated.
    async fn update(&mut self, entity: &str, id: i64, values: &Row) -> Result<()>;

    async fn delete(&mut self, entity: &str, id: i64) -> Result<()>;
}

/// Opens sessions against one store.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Name of the configured store (logging only).
    fn name(&self) -> &str;

    fn schema(&self) -> &Schema;

    async fn connect(&self) -> Result<SessionHandle>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cardinality_estimates() {
        let stats = Cardinality { parents: 100, children: 2_000 };
        assert_eq!(stats.average_children(), 20.0);
        assert_eq!(stats.estimated_join_rows(10), 200.0);
        // A parent without children still produces one joined row.
        let sparse = Cardinality { parents: 100, children: 10 };
        assert_eq!(sparse.estimated_join_rows(10), 10.0);
        assert_eq!(Cardinality::default().average_children(), 0.0);
    }
}
