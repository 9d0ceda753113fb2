//! One unit of work on one pooled session.

use crate::error::{ErrorKind, Result};
use crate::pool::PoolInner;
use crate::strategy::QueryStrategy;
use crate::tracker::ChangeTracker;
use exn::OptionExt;
use quarry_store::backend::{Cardinality, FetchRequest, JoinedRow, Session, SessionHandle};
use quarry_store::error::{ErrorKind as StoreErrorKind, Result as StoreResult};
use quarry_store::{
    Direction, Entity, EntityKey, FetchMode, Predicate, Projection, ProjectionRow, QueryDescriptor, ResultSet, Row,
    Schema, Value,
};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::OwnedSemaphorePermit;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// A session checked out of a [`ConnectionPool`](crate::ConnectionPool) for
/// the duration of one unit of work.
///
/// The session goes back to the pool exactly once, when the scope is dropped,
/// whatever way the unit of work ends. A scope whose session may be in an
/// unknown state (a round-trip was interrupted, or the store reported the
/// connection lost) hands it back for disposal instead of reuse.
///
/// # Examples
///
/// ```
/// use quarry_access::{ConnectionPool, PoolOptions};
/// use quarry_store::backend::MockConnector;
/// use quarry_store::{Predicate, QueryDescriptor};
/// use std::sync::Arc;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let pool = ConnectionPool::new(Arc::new(MockConnector::default()), PoolOptions::default());
/// let mut scope = pool.acquire().await?;
/// let query = QueryDescriptor::new("blog").filter(Predicate::ge("rating", 4));
/// let result = scope.execute(&query).await?;
/// assert!(result.is_empty());
/// assert_eq!(result.round_trips(), 1);
/// # Ok(())
/// # }
/// ```
pub struct SessionScope {
    session: Option<SessionHandle>,
    pool: Arc<PoolInner>,
    // Released after the session has been handed back (see `Drop`).
    _permit: OwnedSemaphorePermit,
    tracker: ChangeTracker,
    client_evaluation: bool,
    // Set around each round-trip; cleared again when it finishes cleanly.
    tainted: bool,
    // Set by cancellation only; never cleared.
    poisoned: bool,
    round_trips: u64,
}

impl SessionScope {
    pub(crate) fn new(session: SessionHandle, permit: OwnedSemaphorePermit, pool: Arc<PoolInner>) -> Self {
        let client_evaluation = pool.options.client_evaluation;
        Self {
            session: Some(session),
            pool,
            _permit: permit,
            tracker: ChangeTracker::default(),
            client_evaluation,
            tainted: false,
            poisoned: false,
            round_trips: 0,
        }
    }

    pub fn session_id(&self) -> u64 {
        self.session.as_ref().map_or(0, |s| s.id())
    }

    pub fn schema(&self) -> &Schema {
        self.pool.connector.schema()
    }

    /// Store round-trips made through this scope so far.
    pub fn round_trips(&self) -> u64 {
        self.round_trips
    }

    /// Allow (or forbid again) evaluating client-side filters in process for
    /// queries run in this scope.
    pub fn set_client_evaluation(&mut self, enabled: bool) {
        self.client_evaluation = enabled;
    }

    pub fn client_evaluation(&self) -> bool {
        self.client_evaluation
    }

    pub fn tracker(&self) -> &ChangeTracker {
        &self.tracker
    }

    pub(crate) fn tracker_mut(&mut self) -> &mut ChangeTracker {
        &mut self.tracker
    }

    /// Current state of a tracked entity.
    pub fn tracked(&self, key: &EntityKey) -> Option<&Entity> {
        self.tracker.get(key)
    }

    /// Run `query` without tracking: one round-trip for plain and joined
    /// queries, two for split ones.
    pub async fn execute(&mut self, query: &QueryDescriptor) -> Result<ResultSet> {
        self.run(query).await
    }

    /// Like [`execute`](Self::execute), but stops waiting as soon as `token`
    /// fires.
    ///
    /// The round-trip in progress is not guaranteed to stop on the store side,
    /// so the session is discarded instead of reused when the scope ends.
    pub async fn execute_with(&mut self, query: &QueryDescriptor, token: &CancellationToken) -> Result<ResultSet> {
        let outcome = tokio::select! {
            biased;
            () = token.cancelled() => None,
            result = self.run(query) => Some(result),
        };
        outcome.ok_or_else(|| self.cancelled())?
    }

    /// Run `query` through `strategy`, stopping when `token` fires (see
    /// [`execute_with`](Self::execute_with)).
    pub async fn execute_via(
        &mut self,
        strategy: &dyn QueryStrategy,
        query: &QueryDescriptor,
        token: &CancellationToken,
    ) -> Result<ResultSet> {
        let outcome = tokio::select! {
            biased;
            () = token.cancelled() => None,
            result = strategy.execute(self, query) => Some(result),
        };
        outcome.ok_or_else(|| self.cancelled())?
    }

    fn cancelled(&mut self) -> crate::error::Error {
        self.poisoned = true;
        tracing::warn!(session = self.session_id(), "Query cancelled; session will be discarded");
        exn::Exn::from(ErrorKind::Cancelled)
    }

    /// Insert a row and return its identifier.
    pub async fn insert(&mut self, entity: &str, values: Row) -> Result<i64> {
        self.tainted = true;
        let result = self.session()?.insert(entity, &values).await;
        let id = self.settle(result)?;
        self.invalidate(entity);
        Ok(id)
    }

    pub async fn delete(&mut self, entity: &str, id: i64) -> Result<()> {
        self.tainted = true;
        let result = self.session()?.delete(entity, id).await;
        self.settle(result)?;
        self.tracker.forget(&EntityKey::new(entity, id));
        self.invalidate(entity);
        Ok(())
    }

    /// Change a field of a tracked entity; written by
    /// [`save_changes`](Self::save_changes).
    pub fn set(&mut self, key: &EntityKey, field: &str, value: impl Into<Value>) -> Result<()> {
        let entity = self.tracker.get_mut(key).ok_or_raise(|| ErrorKind::NotTracked(key.to_string()))?;
        entity.set(field, value).map_err(ErrorKind::store)
    }

    /// Write every modified tracked entity back, one update each. Returns the
    /// number of entities written.
    ///
    /// Stops at the first failure; entities written before it stay written
    /// and are no longer pending.
    #[instrument("saving changes", skip(self), fields(session = self.session_id()))]
    pub async fn save_changes(&mut self) -> Result<usize> {
        let pending = self.tracker.pending();
        for (key, changes) in &pending {
            self.tainted = true;
            let result = self.session()?.update(&key.entity, key.id, changes).await;
            self.settle(result)?;
            self.tracker.accept(key);
            self.invalidate(&key.entity);
        }
        tracing::debug!(written = pending.len(), "Saved tracked changes");
        Ok(pending.len())
    }

    /// Row counts used to estimate join sizes. Not counted as a round-trip.
    pub async fn cardinality(&mut self, entity: &str, relation: &str) -> Result<Cardinality> {
        self.tainted = true;
        let result = self.session()?.cardinality(entity, relation).await;
        self.tainted = matches!(&result, Err(err) if err.is_retryable());
        result.map_err(ErrorKind::store)
    }

    fn session(&mut self) -> Result<&mut (dyn Session + 'static)> {
        // Only `Drop` takes the session out.
        self.session.as_deref_mut().ok_or_raise(|| ErrorKind::PoolClosed)
    }

    /// Account for one finished round-trip. A session that lost its
    /// connection is not reused.
    fn settle<T>(&mut self, result: StoreResult<T>) -> Result<T> {
        self.round_trips += 1;
        self.tainted = matches!(&result, Err(err) if err.is_retryable());
        result.map_err(ErrorKind::store)
    }

    fn invalidate(&self, entity: &str) {
        if let Some(cache) = &self.pool.cache {
            cache.invalidate(entity);
        }
    }

    async fn fetch(&mut self, request: &FetchRequest) -> Result<Vec<Row>> {
        self.tainted = true;
        let result = self.session()?.fetch(request).await;
        self.settle(result)
    }

    async fn fetch_joined(&mut self, request: &FetchRequest, relation: &str) -> Result<Vec<JoinedRow>> {
        self.tainted = true;
        let result = self.session()?.fetch_joined(request, relation).await;
        self.settle(result)
    }

    /// Terminal execution of a descriptor against the session.
    #[instrument("executing query", skip_all, fields(entity = query.entity(), session = self.session_id()))]
    async fn run(&mut self, query: &QueryDescriptor) -> Result<ResultSet> {
        let pool = Arc::clone(&self.pool);
        let schema = pool.connector.schema();
        query.validate(schema).map_err(ErrorKind::store)?;
        let entity = schema.entity(query.entity()).map_err(ErrorKind::store)?;
        if query.included().is_some() && *query.projection() != Projection::All {
            exn::bail!(ErrorKind::InvalidProjection(format!(
                "{}: a projection cannot include related collections",
                entity.name
            )));
        }

        let (pushed, residual) = match query.predicate() {
            None => (None, None),
            Some(filter) if filter.is_translatable() => (Some(filter.clone()), None),
            Some(filter) if self.client_evaluation => {
                tracing::warn!(entity = entity.name, "Evaluating part of the filter in process");
                filter.clone().split_for_store()
            },
            Some(_) => exn::bail!(ErrorKind::Store(StoreErrorKind::UntranslatablePredicate(format!(
                "{}: client-side filter with client evaluation disabled",
                entity.name
            )))),
        };

        // With an in-process residual, paging and narrowing have to wait until
        // after it has been applied.
        let request = FetchRequest {
            entity: entity.name.clone(),
            columns: match (query.projection(), &residual) {
                (Projection::Fields(fields), None) => Some(fields.clone()),
                _ => None,
            },
            filter: pushed,
            order_by: query.ordering().to_vec(),
            limit: if residual.is_none() { query.limit_value() } else { None },
            offset: if residual.is_none() { query.offset_value() } else { None },
        };
        let before = self.round_trips;

        let result = match query.included() {
            None => {
                let rows = keep(self.fetch(&request).await?, residual.as_ref())?;
                let rows = page(rows, query, residual.is_some());
                match query.projection() {
                    Projection::All => ResultSet::entities(
                        rows.into_iter()
                            .map(|r| Entity::from_row(&entity.name, r))
                            .collect::<StoreResult<_>>()
                            .map_err(ErrorKind::store)?,
                    ),
                    Projection::Fields(fields) => {
                        ResultSet::projections(rows.into_iter().map(|r| project(r, fields)).collect())
                    },
                }
            },
            Some(relation_name) => {
                let relation = entity.relation(relation_name).map_err(ErrorKind::store)?;
                let parents = match query.mode() {
                    FetchMode::Joined => {
                        let rows = self.fetch_joined(&request, relation_name).await?;
                        let rows = match &residual {
                            Some(filter) => {
                                let mut kept = Vec::with_capacity(rows.len());
                                for row in rows {
                                    if filter.matches(&row.parent).map_err(ErrorKind::store)? {
                                        kept.push(row);
                                    }
                                }
                                kept
                            },
                            None => rows,
                        };
                        let parents = group_joined(&entity.name, &relation.target, relation_name, rows)?;
                        page(parents, query, residual.is_some())
                    },
                    FetchMode::Split => {
                        let rows = keep(self.fetch(&request).await?, residual.as_ref())?;
                        let mut parents = page(rows, query, residual.is_some())
                            .into_iter()
                            .map(|r| Entity::from_row(&entity.name, r))
                            .collect::<StoreResult<Vec<_>>>()
                            .map_err(ErrorKind::store)?;
                        let ids: Vec<i64> = parents.iter().map(Entity::id).collect();
                        let mut children: HashMap<i64, Vec<Entity>> = HashMap::new();
                        if !ids.is_empty() {
                            let request = FetchRequest {
                                filter: Some(Predicate::is_in(relation.foreign_key.clone(), ids)),
                                order_by: vec![(relation.foreign_key.clone(), Direction::Asc)],
                                ..FetchRequest::new(relation.target.clone())
                            };
                            for row in self.fetch(&request).await? {
                                let child = Entity::from_row(&relation.target, row).map_err(ErrorKind::store)?;
                                let parent_id = child
                                    .get(&relation.foreign_key)
                                    .and_then(Value::as_i64)
                                    .ok_or_raise(|| ErrorKind::Store(StoreErrorKind::InvalidData("child without parent")))?;
                                children.entry(parent_id).or_default().push(child);
                            }
                        }
                        for parent in &mut parents {
                            let related = children.remove(&parent.id()).unwrap_or_default();
                            parent.attach_related(relation_name, related);
                        }
                        tracing::debug!(parents = parents.len(), "Split fetch stitched by identifier");
                        parents
                    },
                };
                ResultSet::entities(parents)
            },
        };
        let spent = u32::try_from(self.round_trips - before).unwrap_or(u32::MAX);
        Ok(result.with_round_trips(spent))
    }
}

impl fmt::Debug for SessionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionScope")
            .field("session", &self.session_id())
            .field("tracked", &self.tracker.len())
            .field("client_evaluation", &self.client_evaluation)
            .field("round_trips", &self.round_trips)
            .field("reusable", &(!self.tainted && !self.poisoned))
            .finish_non_exhaustive()
    }
}

impl Drop for SessionScope {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.pool.release(session, !self.tainted && !self.poisoned);
        }
    }
}

/// Rows passing the in-process residual filter, if any.
fn keep(rows: Vec<Row>, residual: Option<&Predicate>) -> Result<Vec<Row>> {
    let Some(filter) = residual else {
        return Ok(rows);
    };
    let mut kept = Vec::with_capacity(rows.len());
    for row in rows {
        if filter.matches(&row).map_err(ErrorKind::store)? {
            kept.push(row);
        }
    }
    Ok(kept)
}

/// Apply offset and limit in process; only needed when the store could not
/// page because of a residual filter.
fn page<T>(items: Vec<T>, query: &QueryDescriptor, in_process: bool) -> Vec<T> {
    if !in_process {
        return items;
    }
    let offset = usize::try_from(query.offset_value().unwrap_or(0)).unwrap_or(usize::MAX);
    let limit = query.limit_value().map_or(usize::MAX, |l| usize::try_from(l).unwrap_or(usize::MAX));
    items.into_iter().skip(offset).take(limit).collect()
}

fn project(mut row: Row, fields: &[String]) -> ProjectionRow {
    row.retain(|name, _| fields.contains(name));
    ProjectionRow::new(row)
}

/// Fold joined rows back into parents with their related collection, keeping
/// the store's parent order.
fn group_joined(parent: &str, child: &str, relation: &str, rows: Vec<JoinedRow>) -> Result<Vec<Entity>> {
    let mut parents: Vec<Entity> = Vec::new();
    let mut children: Vec<Vec<Entity>> = Vec::new();
    let mut index: HashMap<i64, usize> = HashMap::new();
    for JoinedRow { parent: parent_row, child: child_row } in rows {
        let id = parent_row
            .get(quarry_store::ID)
            .and_then(Value::as_i64)
            .ok_or_raise(|| ErrorKind::Store(StoreErrorKind::InvalidData("joined row without parent identifier")))?;
        let slot = match index.get(&id) {
            Some(slot) => *slot,
            None => {
                parents.push(Entity::from_row(parent, parent_row).map_err(ErrorKind::store)?);
                children.push(Vec::new());
                index.insert(id, parents.len() - 1);
                parents.len() - 1
            },
        };
        if let Some(child_row) = child_row {
            children[slot].push(Entity::from_row(child, child_row).map_err(ErrorKind::store)?);
        }
    }
    for (parent, related) in parents.iter_mut().zip(children) {
        parent.attach_related(relation, related);
    }
    Ok(parents)
}
