//! In-memory store backend for testing.

use super::{Cardinality, Connector, FetchRequest, JoinedRow, Session, SessionHandle};
use crate::descriptor::Direction;
use crate::error::{ErrorKind, Result};
use crate::schema::{EntityType, FieldKind, ID, Schema};
use crate::value::{Row, Value};
use async_trait::async_trait;
use exn::OptionExt;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::RwLock;

static NULL: Value = Value::Null;

#[derive(Default)]
struct Table {
    rows: BTreeMap<i64, Row>,
    next_id: i64,
}

struct Shared {
    name: String,
    schema: Schema,
    tables: RwLock<HashMap<String, Table>>,
    round_trips: AtomicU64,
    connects: AtomicU64,
    open_sessions: AtomicU64,
    next_session: AtomicU64,
    generation: AtomicU64,
    latency_micros: AtomicU64,
    fail_next: Mutex<Option<ErrorKind>>,
}

/// In-memory store for testing.
///
/// Rows live in a `HashMap` of tables behind a [`RwLock`] shared by every
/// session the connector opens, so writes made through one session are
/// visible to the others. Filters are evaluated in process with the same
/// semantics the SQL backend pushes down, and identifier uniqueness, NOT NULL
/// and foreign keys are enforced from the schema.
///
/// Every data call is counted as one round-trip, which is what tests assert
/// on. Failures can be injected with [`MockConnector::kill_sessions`] and
/// [`MockConnector::fail_next`].
///
/// # Examples
///
/// ```
/// use quarry_store::backend::{Connector, FetchRequest, MockConnector};
/// use quarry_store::{Row, Value};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let connector = MockConnector::default();
/// let mut session = connector.connect().await?;
/// let blog = Row::from([
///     ("name".to_string(), Value::from("Rust")),
///     ("url".to_string(), Value::from("https://rust.example.com")),
///     ("rating".to_string(), Value::from(5)),
///     ("owner".to_string(), Value::from("ferris")),
/// ]);
/// session.insert("blog", &blog).await?;
/// assert_eq!(session.fetch(&FetchRequest::new("blog")).await?.len(), 1);
/// assert_eq!(connector.round_trips(), 2);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct MockConnector {
    shared: Arc<Shared>,
}

impl MockConnector {
    /// Create an empty store over `schema`.
    pub fn new(schema: Schema) -> Self {
        let tables = schema.entities().map(|e| (e.name.clone(), Table { next_id: 1, ..Default::default() })).collect();
        Self {
            shared: Arc::new(Shared {
                name: "mock".to_string(),
                schema,
                tables: RwLock::new(tables),
                round_trips: AtomicU64::new(0),
                connects: AtomicU64::new(0),
                open_sessions: AtomicU64::new(0),
                next_session: AtomicU64::new(1),
                generation: AtomicU64::new(0),
                latency_micros: AtomicU64::new(0),
                fail_next: Mutex::new(None),
            }),
        }
    }

    /// Delay every data call by `latency` before it touches the tables.
    pub fn with_latency(self, latency: Duration) -> Self {
        self.set_latency(latency);
        self
    }

    pub fn set_latency(&self, latency: Duration) {
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.shared.latency_micros.store(micros, Ordering::Relaxed);
    }

    /// Data calls made by all sessions since creation or the last reset.
    pub fn round_trips(&self) -> u64 {
        self.shared.round_trips.load(Ordering::Relaxed)
    }

    /// Sessions opened since creation or the last reset.
    pub fn connects(&self) -> u64 {
        self.shared.connects.load(Ordering::Relaxed)
    }

    /// Sessions currently alive (opened and not yet dropped).
    pub fn open_sessions(&self) -> u64 {
        self.shared.open_sessions.load(Ordering::Relaxed)
    }

    pub fn reset_counters(&self) {
        self.shared.round_trips.store(0, Ordering::Relaxed);
        self.shared.connects.store(0, Ordering::Relaxed);
    }

    /// Break every session opened so far: their pings and data calls fail
    /// with [`ConnectionLost`](ErrorKind::ConnectionLost). Sessions opened
    /// afterwards work normally.
    pub fn kill_sessions(&self) {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Make the next data call, on any session, fail with `kind`.
    pub fn fail_next(&self, kind: ErrorKind) {
        *self.shared.fail_next.lock().unwrap_or_else(PoisonError::into_inner) = Some(kind);
    }
}

impl Default for MockConnector {
    /// An empty store over the benchmark schema.
    fn default() -> Self {
        let Ok(schema) = Schema::benchmark() else {
            // The benchmark schema is static; failing to build it is a bug
            // that every test would hit immediately.
            panic!("MockConnector::default: benchmark schema is invalid");
        };
        Self::new(schema)
    }
}

#[async_trait]
impl Connector for MockConnector {
    fn name(&self) -> &str {
        &self.shared.name
    }

    fn schema(&self) -> &Schema {
        &self.shared.schema
    }

    async fn connect(&self) -> Result<SessionHandle> {
        let shared = &self.shared;
        shared.connects.fetch_add(1, Ordering::Relaxed);
        shared.open_sessions.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(MockSession {
            id: shared.next_session.fetch_add(1, Ordering::Relaxed),
            generation: shared.generation.load(Ordering::SeqCst),
            shared: Arc::clone(shared),
        }))
    }
}

struct MockSession {
    id: u64,
    generation: u64,
    shared: Arc<Shared>,
}

impl Drop for MockSession {
    fn drop(&mut self) {
        self.shared.open_sessions.fetch_sub(1, Ordering::Relaxed);
    }
}

impl MockSession {
    fn check_alive(&self) -> Result<()> {
        if self.shared.generation.load(Ordering::SeqCst) != self.generation {
            exn::bail!(ErrorKind::ConnectionLost);
        }
        Ok(())
    }

    /// Account for one data call reaching the store.
    async fn round_trip(&self) -> Result<()> {
        self.check_alive()?;
        self.shared.round_trips.fetch_add(1, Ordering::Relaxed);
        let latency = self.shared.latency_micros.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_micros(latency)).await;
        }
        let injected = self.shared.fail_next.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(kind) = injected {
            exn::bail!(kind);
        }
        Ok(())
    }

    fn entity(&self, name: &str) -> Result<&EntityType> {
        self.shared.schema.entity(name)
    }
}

#[async_trait]
impl Session for MockSession {
    fn id(&self) -> u64 {
        self.id
    }

    async fn ping(&mut self) -> Result<()> {
        self.check_alive()
    }

    async fn fetch(&mut self, request: &FetchRequest) -> Result<Vec<Row>> {
        self.round_trip().await?;
        let entity = self.entity(&request.entity)?;
        let tables = self.shared.tables.read().await;
        let rows = select(entity, table(&tables, entity)?, request)?;
        Ok(rows.into_iter().map(|row| project(row, request.columns.as_deref(), false)).collect())
    }

    async fn fetch_joined(&mut self, request: &FetchRequest, relation: &str) -> Result<Vec<JoinedRow>> {
        self.round_trip().await?;
        let parent = self.entity(&request.entity)?;
        let relation = parent.relation(relation)?;
        let child = self.entity(&relation.target)?;
        let tables = self.shared.tables.read().await;
        let children = table(&tables, child)?;
        let mut joined = Vec::new();
        for row in select(parent, table(&tables, parent)?, request)? {
            let id = row.get(ID).cloned().unwrap_or_default();
            let parent_row = project(row, request.columns.as_deref(), true);
            let mut matched = children.rows.values().filter(|c| c.get(&relation.foreign_key) == Some(&id)).peekable();
            if matched.peek().is_none() {
                joined.push(JoinedRow { parent: parent_row, child: None });
                continue;
            }
            for child_row in matched {
                joined.push(JoinedRow { parent: parent_row.clone(), child: Some(child_row.clone()) });
            }
        }
        Ok(joined)
    }

    async fn cardinality(&mut self, entity: &str, relation: &str) -> Result<Cardinality> {
        self.check_alive()?;
        let parent = self.entity(entity)?;
        let child = self.entity(&parent.relation(relation)?.target)?;
        let tables = self.shared.tables.read().await;
        Ok(Cardinality {
            parents: table(&tables, parent)?.rows.len() as u64,
            children: table(&tables, child)?.rows.len() as u64,
        })
    }

    async fn insert(&mut self, entity: &str, values: &Row) -> Result<i64> {
        self.round_trip().await?;
        let entity = self.entity(entity)?;
        let mut row = normalize(entity, values)?;
        let mut tables = self.shared.tables.write().await;
        check_references(&self.shared.schema, entity, &row, &tables)?;
        let table = table_mut(&mut tables, entity)?;
        let id = match row.get(ID) {
            Some(value) => value.as_i64().ok_or_raise(|| ErrorKind::InvalidData("non-integer identifier"))?,
            None => table.next_id,
        };
        if table.rows.contains_key(&id) {
            exn::bail!(ErrorKind::ConstraintViolation(format!("duplicate identifier {}.{ID} = {id}", entity.name)));
        }
        for field in entity.fields() {
            if !field.nullable && row.get(&field.name).is_none_or(Value::is_null) {
                exn::bail!(ErrorKind::ConstraintViolation(format!("{}.{} is NOT NULL", entity.name, field.name)));
            }
            row.entry(field.name.clone()).or_insert(Value::Null);
        }
        row.insert(ID.to_string(), Value::Integer(id));
        table.next_id = table.next_id.max(id + 1);
        table.rows.insert(id, row);
        Ok(id)
    }

    async fn update(&mut self, entity: &str, id: i64, values: &Row) -> Result<()> {
        self.round_trip().await?;
        let entity_type = self.entity(entity)?;
        if values.contains_key(ID) {
            exn::bail!(ErrorKind::ReadOnlyField(format!("{entity}.{ID}")));
        }
        let changes = normalize(entity_type, values)?;
        for field in entity_type.fields() {
            if !field.nullable && changes.get(&field.name).is_some_and(Value::is_null) {
                exn::bail!(ErrorKind::ConstraintViolation(format!("{entity}.{} is NOT NULL", field.name)));
            }
        }
        let mut tables = self.shared.tables.write().await;
        check_references(&self.shared.schema, entity_type, &changes, &tables)?;
        let row = table_mut(&mut tables, entity_type)?
            .rows
            .get_mut(&id)
            .ok_or_raise(|| ErrorKind::NotFound(entity.to_string(), id))?;
        row.extend(changes);
        Ok(())
    }

    async fn delete(&mut self, entity: &str, id: i64) -> Result<()> {
        self.round_trip().await?;
        let entity_type = self.entity(entity)?;
        let mut tables = self.shared.tables.write().await;
        if !table(&tables, entity_type)?.rows.contains_key(&id) {
            exn::bail!(ErrorKind::NotFound(entity.to_string(), id));
        }
        for relation in entity_type.relations() {
            let children = table(&tables, self.entity(&relation.target)?)?;
            if children.rows.values().any(|c| c.get(&relation.foreign_key) == Some(&Value::Integer(id))) {
                exn::bail!(ErrorKind::ConstraintViolation(format!(
                    "{entity}#{id} is still referenced by {}",
                    relation.target
                )));
            }
        }
        table_mut(&mut tables, entity_type)?.rows.remove(&id);
        Ok(())
    }
}

fn table<'a>(tables: &'a HashMap<String, Table>, entity: &EntityType) -> Result<&'a Table> {
    tables.get(&entity.name).ok_or_raise(|| ErrorKind::UnknownEntity(entity.name.clone()))
}

fn table_mut<'a>(tables: &'a mut HashMap<String, Table>, entity: &EntityType) -> Result<&'a mut Table> {
    tables.get_mut(&entity.name).ok_or_raise(|| ErrorKind::UnknownEntity(entity.name.clone()))
}

/// Filter, order and page full rows of one table.
fn select(entity: &EntityType, table: &Table, request: &FetchRequest) -> Result<Vec<Row>> {
    if let Some(columns) = &request.columns {
        columns.iter().try_for_each(|c| entity.require_column(c))?;
    }
    request.order_by.iter().try_for_each(|(c, _)| entity.require_column(c))?;
    let filter = request.filter.as_ref();
    if let Some(filter) = filter {
        filter.validate(entity)?;
        if !filter.is_translatable() {
            exn::bail!(ErrorKind::UntranslatablePredicate(format!("client filter on {}", entity.name)));
        }
    }
    let mut rows = Vec::new();
    for row in table.rows.values() {
        if filter.map(|f| f.matches(row)).transpose()?.unwrap_or(true) {
            rows.push(row.clone());
        }
    }
    rows.sort_by(|a, b| compare_rows(a, b, &request.order_by));
    let offset = usize::try_from(request.offset.unwrap_or(0)).unwrap_or(usize::MAX);
    let limit = request.limit.map_or(usize::MAX, |l| usize::try_from(l).unwrap_or(usize::MAX));
    Ok(rows.into_iter().skip(offset).take(limit).collect())
}

/// SQLite ordering: NULLs first when ascending, identifier as the final key.
fn compare_rows(a: &Row, b: &Row, order_by: &[(String, Direction)]) -> CmpOrdering {
    let keys = order_by.iter().map(|(c, d)| (c.as_str(), *d)).chain([(ID, Direction::Asc)]);
    for (column, direction) in keys {
        let (x, y) = (a.get(column).unwrap_or(&NULL), b.get(column).unwrap_or(&NULL));
        let ordering = match (x.is_null(), y.is_null()) {
            (true, true) => CmpOrdering::Equal,
            (true, false) => CmpOrdering::Less,
            (false, true) => CmpOrdering::Greater,
            (false, false) => x.compare(y).unwrap_or(CmpOrdering::Equal),
        };
        let ordering = if direction == Direction::Desc { ordering.reverse() } else { ordering };
        if ordering != CmpOrdering::Equal {
            return ordering;
        }
    }
    CmpOrdering::Equal
}

fn project(row: Row, columns: Option<&[String]>, keep_id: bool) -> Row {
    match columns {
        Some(columns) => {
            row.into_iter().filter(|(name, _)| (keep_id && name == ID) || columns.contains(name)).collect()
        },
        None => row,
    }
}

/// Check column names and store values the way SQLite would hand them back.
fn normalize(entity: &EntityType, values: &Row) -> Result<Row> {
    let mut row = Row::new();
    for (name, value) in values {
        entity.require_column(name)?;
        let kind = entity.fields().iter().find(|f| &f.name == name).map(|f| f.kind);
        let value = match (kind, value) {
            (Some(FieldKind::Bool), Value::Integer(i)) => Value::Bool(*i != 0),
            (Some(FieldKind::Real), Value::Integer(i)) => Value::Real(*i as f64),
            (Some(FieldKind::Integer), Value::Bool(b)) => Value::Integer(i64::from(*b)),
            _ => value.clone(),
        };
        row.insert(name.clone(), value);
    }
    Ok(row)
}

/// Foreign keys: every relation pointing at `entity` must find its parent.
fn check_references(schema: &Schema, entity: &EntityType, row: &Row, tables: &HashMap<String, Table>) -> Result<()> {
    for owner in schema.entities() {
        for relation in owner.relations().iter().filter(|r| r.target == entity.name) {
            let Some(value) = row.get(&relation.foreign_key).filter(|v| !v.is_null()) else {
                continue;
            };
            let exists = value.as_i64().is_some_and(|id| table(tables, owner).is_ok_and(|t| t.rows.contains_key(&id)));
            if !exists {
                exn::bail!(ErrorKind::ConstraintViolation(format!(
                    "{}.{} = {value:?} has no matching {}",
                    entity.name, relation.foreign_key, owner.name
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Predicate;
    use rstest::rstest;

    fn blog(name: &str, rating: i64) -> Row {
        Row::from([
            ("name".to_string(), Value::from(name)),
            ("url".to_string(), Value::from(format!("https://{name}.example.com"))),
            ("rating".to_string(), Value::Integer(rating)),
            ("owner".to_string(), Value::from("alice")),
        ])
    }

    fn post(blog_id: i64, title: &str) -> Row {
        Row::from([
            ("blog_id".to_string(), Value::Integer(blog_id)),
            ("title".to_string(), Value::from(title)),
            ("content".to_string(), Value::from("...")),
            ("published".to_string(), Value::Integer(1)),
            ("views".to_string(), Value::Integer(0)),
        ])
    }

    async fn seeded() -> (MockConnector, SessionHandle) {
        let connector = MockConnector::default();
        let mut session = connector.connect().await.unwrap();
        for (name, rating) in [("a", 1), ("b", 4), ("c", 5)] {
            session.insert("blog", &blog(name, rating)).await.unwrap();
        }
        session.insert("post", &post(1, "first")).await.unwrap();
        session.insert("post", &post(1, "second")).await.unwrap();
        connector.reset_counters();
        (connector, session)
    }

    #[tokio::test]
    async fn test_sessions_share_tables() {
        let (connector, _session) = seeded().await;
        let mut other = connector.connect().await.unwrap();
        assert_eq!(other.fetch(&FetchRequest::new("blog")).await.unwrap().len(), 3);
        assert_eq!(connector.round_trips(), 1);
        assert_eq!(connector.open_sessions(), 2);
        drop(other);
        assert_eq!(connector.open_sessions(), 1);
    }

    #[rstest]
    #[case(Predicate::ge("rating", 4), &["b", "c"])]
    #[case(Predicate::like("name", "A%"), &["a"])]
    #[case(Predicate::is_in("name", ["a", "c"]), &["a", "c"])]
    #[case(Predicate::is_null("description"), &["a", "b", "c"])]
    #[case(Predicate::ge("rating", 4).not(), &["a"])]
    #[tokio::test]
    async fn test_fetch_filters(#[case] filter: Predicate, #[case] expected: &[&str]) {
        let (_connector, mut session) = seeded().await;
        let request = FetchRequest { filter: Some(filter), ..FetchRequest::new("blog") };
        let rows = session.fetch(&request).await.unwrap();
        let names: Vec<_> = rows.iter().filter_map(|r| r.get("name").and_then(Value::as_str)).collect();
        assert_eq!(names, expected);
    }

    #[tokio::test]
    async fn test_fetch_order_page_and_project() {
        let (_connector, mut session) = seeded().await;
        let request = FetchRequest {
            columns: Some(vec!["name".to_string()]),
            order_by: vec![("rating".to_string(), Direction::Desc)],
            limit: Some(2),
            offset: Some(1),
            ..FetchRequest::new("blog")
        };
        let rows = session.fetch(&request).await.unwrap();
        assert_eq!(rows, [Row::from([("name".to_string(), Value::from("b"))]), Row::from([(
            "name".to_string(),
            Value::from("a")
        )])]);
    }

    #[tokio::test]
    async fn test_client_filter_refused() {
        let (connector, mut session) = seeded().await;
        let request = FetchRequest { filter: Some(Predicate::client("any", |_| true)), ..FetchRequest::new("blog") };
        let err = session.fetch(&request).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::UntranslatablePredicate(_)));
        assert_eq!(connector.round_trips(), 1);
    }

    #[tokio::test]
    async fn test_fetch_joined() {
        let (connector, mut session) = seeded().await;
        let rows = session.fetch_joined(&FetchRequest::new("blog"), "posts").await.unwrap();
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0].child.as_ref().and_then(|c| c.get("published")), Some(&Value::Bool(true)));
        assert!(rows[3].child.is_none());
        assert_eq!(connector.round_trips(), 1);
        let stats = session.cardinality("blog", "posts").await.unwrap();
        assert_eq!(stats, Cardinality { parents: 3, children: 2 });
        assert_eq!(connector.round_trips(), 1);
    }

    #[tokio::test]
    async fn test_constraints() {
        let (_connector, mut session) = seeded().await;
        let err = session.insert("post", &post(99, "orphan")).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::ConstraintViolation(_)));
        let err = session.delete("blog", 1).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::ConstraintViolation(_)));
        let mut duplicate = blog("dup", 1);
        duplicate.insert(ID.to_string(), Value::Integer(2));
        let err = session.insert("blog", &duplicate).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::ConstraintViolation(_)));
        let err = session.insert("blog", &Row::from([("name".to_string(), Value::from("x"))])).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::ConstraintViolation(_)));
        let err = session.update("blog", 2, &Row::from([(ID.to_string(), Value::Integer(7))])).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::ReadOnlyField(_)));
        let err = session.delete("blog", 42).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_, 42)));
        session.delete("blog", 2).await.unwrap();
    }

    #[tokio::test]
    async fn test_explicit_identifier_advances_sequence() {
        let (_connector, mut session) = seeded().await;
        let mut explicit = blog("x", 1);
        explicit.insert(ID.to_string(), Value::Integer(10));
        assert_eq!(session.insert("blog", &explicit).await.unwrap(), 10);
        assert_eq!(session.insert("blog", &blog("y", 1)).await.unwrap(), 11);
    }

    #[tokio::test]
    async fn test_kill_sessions() {
        let (connector, mut session) = seeded().await;
        connector.kill_sessions();
        let err = session.ping().await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::ConnectionLost));
        let err = session.fetch(&FetchRequest::new("blog")).await.unwrap_err();
        assert!(err.is_retryable());
        let mut fresh = connector.connect().await.unwrap();
        fresh.ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_fail_next_fires_once() {
        let (connector, mut session) = seeded().await;
        connector.fail_next(ErrorKind::Database);
        let err = session.fetch(&FetchRequest::new("blog")).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Database));
        session.fetch(&FetchRequest::new("blog")).await.unwrap();
    }
}
