//! SQLite storage backend.

use super::sql::{self, CHILD, PARENT, SEPARATOR};
use super::{Cardinality, Connector, FetchRequest, JoinedRow, Session, SessionHandle};
use crate::error::{Error, ErrorKind, Result};
use crate::schema::{EntityType, FieldKind, Schema};
use crate::value::{Row, Value};
use async_trait::async_trait;
use exn::ResultExt;
use sqlx::sqlite::{
    SqliteAutoVacuum, SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqliteRow, SqliteSynchronous,
};
use sqlx::{Column, Connection, Row as _, TypeInfo, ValueRef};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::instrument;

/// Embedded migrations creating the benchmark schema; run on the first
/// connection a connector opens.
static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Opens sessions on a SQLite database (file or shared in-memory).
///
/// Each [`Session`] owns one `SqliteConnection`; pooling is the job of the
/// layer above, not of sqlx.
pub struct SqliteConnector {
    name: String,
    options: SqliteConnectOptions,
    schema: Arc<Schema>,
    // A shared in-memory database lives only as long as one connection to it
    // is open. This one is never handed out.
    anchor: Mutex<Option<SqliteConnection>>,
    next_id: AtomicU64,
}

impl SqliteConnector {
    async fn new(name: &str, options: SqliteConnectOptions, keep_alive: bool) -> Result<Self> {
        let mut conn = Self::open_connection(&options).await?;
        Self::migrate(&mut conn).await?;
        let anchor = if keep_alive {
            Some(conn)
        } else {
            conn.close().await.or_raise(|| ErrorKind::Database)?;
            None
        };
        Ok(Self {
            name: name.to_string(),
            options,
            schema: Arc::new(Schema::benchmark()?),
            anchor: Mutex::new(anchor),
            next_id: AtomicU64::new(1),
        })
    }

    /// Open (creating if missing) the database file at `path` and run
    /// migrations.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let options = Self::tune(SqliteConnectOptions::new()).filename(path.as_ref()).create_if_missing(true);
        Self::new("sqlite", options, false).await
    }

    /// Connect to a fresh shared in-memory database.
    ///
    /// Every session opened by this connector sees the same data; the
    /// database is dropped together with the connector.
    pub async fn in_memory() -> Result<Self> {
        // sqlx turns `:memory:` into a uniquely named shared-cache database,
        // so sessions of one connector share it and separate connectors don't.
        let options = SqliteConnectOptions::from_str("sqlite::memory:").or_raise(|| ErrorKind::Database)?;
        Self::new("sqlite-memory", Self::tune(options), true).await
    }

    /// Connection options shared between file and in-memory databases.
    fn tune(options: SqliteConnectOptions) -> SqliteConnectOptions {
        options
            // Enable WAL mode for better concurrent read performance
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .synchronous(SqliteSynchronous::Normal)
            // Several pooled sessions may write at once; give them a chance
            // to wait on each other instead of failing with SQLITE_BUSY.
            .busy_timeout(Duration::from_millis(1500))
            .auto_vacuum(SqliteAutoVacuum::None)
    }

    async fn open_connection(options: &SqliteConnectOptions) -> Result<SqliteConnection> {
        let mut conn = SqliteConnection::connect_with(options).await.map_err(store_error)?;
        // PRAGMAs not exposed via SqliteConnectOptions, applied to EVERY connection.
        sqlx::query(
            r#"
                PRAGMA cache_size = -8192;
                PRAGMA temp_store = MEMORY;
            "#,
        )
        .execute(&mut conn)
        .await
        .map_err(store_error)?;
        Ok(conn)
    }

    #[instrument("performing database migrations", skip(conn))]
    async fn migrate(conn: &mut SqliteConnection) -> Result<()> {
        MIGRATOR.run(conn).await.or_raise(|| ErrorKind::Migration)
    }

    /// Close the connection keeping an in-memory database alive.
    pub async fn close(&self) {
        if let Some(conn) = self.anchor.lock().await.take() {
            _ = conn.close().await;
        }
    }
}

#[async_trait]
impl Connector for SqliteConnector {
    fn name(&self) -> &str {
        &self.name
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }

    async fn connect(&self) -> Result<SessionHandle> {
        let conn = Self::open_connection(&self.options).await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(connector = %self.name, session = id, "Opened SQLite session");
        Ok(Box::new(SqliteSession { id, conn, schema: Arc::clone(&self.schema) }))
    }
}

struct SqliteSession {
    id: u64,
    conn: SqliteConnection,
    schema: Arc<Schema>,
}

#[async_trait]
impl Session for SqliteSession {
    fn id(&self) -> u64 {
        self.id
    }

    async fn ping(&mut self) -> Result<()> {
        self.conn.ping().await.or_raise(|| ErrorKind::ConnectionLost)
    }

    async fn fetch(&mut self, request: &FetchRequest) -> Result<Vec<Row>> {
        let entity = self.schema.entity(&request.entity)?;
        let mut qb = sql::select(entity, request)?;
        let rows = qb.build().fetch_all(&mut self.conn).await.map_err(store_error)?;
        rows.iter().map(|row| Ok(coerce(entity, decode(row)?))).collect()
    }

    async fn fetch_joined(&mut self, request: &FetchRequest, relation: &str) -> Result<Vec<JoinedRow>> {
        let parent = self.schema.entity(&request.entity)?;
        let relation = parent.relation(relation)?;
        let child = self.schema.entity(&relation.target)?;
        let mut qb = sql::select_joined(parent, child, relation, request)?;
        let rows = qb.build().fetch_all(&mut self.conn).await.map_err(store_error)?;
        let parent_prefix = format!("{PARENT}{SEPARATOR}");
        let child_prefix = format!("{CHILD}{SEPARATOR}");
        rows.iter()
            .map(|row| {
                let (mut parent_row, mut child_row) = (Row::new(), Row::new());
                for (name, value) in decode(row)? {
                    if let Some(name) = name.strip_prefix(&parent_prefix) {
                        parent_row.insert(name.to_string(), value);
                    } else if let Some(name) = name.strip_prefix(&child_prefix) {
                        child_row.insert(name.to_string(), value);
                    }
                }
                // LEFT JOIN: a parent without children has a NULL child id.
                let child_row = child_row.get("id").is_some_and(|id| !id.is_null()).then(|| coerce(child, child_row));
                Ok(JoinedRow { parent: coerce(parent, parent_row), child: child_row })
            })
            .collect()
    }

    async fn cardinality(&mut self, entity: &str, relation: &str) -> Result<Cardinality> {
        let parent = self.schema.entity(entity)?;
        let child = self.schema.entity(&parent.relation(relation)?.target)?;
        let mut qb = sql::count(parent, child);
        let (parents, children): (i64, i64) =
            qb.build_query_as().fetch_one(&mut self.conn).await.map_err(store_error)?;
        Ok(Cardinality {
            parents: u64::try_from(parents).or_raise(|| ErrorKind::InvalidData("row count"))?,
            children: u64::try_from(children).or_raise(|| ErrorKind::InvalidData("row count"))?,
        })
    }

    async fn insert(&mut self, entity: &str, values: &Row) -> Result<i64> {
        let entity = self.schema.entity(entity)?;
        let mut qb = sql::insert(entity, values)?;
        let result = qb.build().execute(&mut self.conn).await.map_err(store_error)?;
        Ok(result.last_insert_rowid())
    }

    async fn update(&mut self, entity: &str, id: i64, values: &Row) -> Result<()> {
        let entity_type = self.schema.entity(entity)?;
        if values.is_empty() {
            return Ok(());
        }
        let mut qb = sql::update(entity_type, id, values)?;
        let result = qb.build().execute(&mut self.conn).await.map_err(store_error)?;
        if result.rows_affected() == 0 {
            exn::bail!(ErrorKind::NotFound(entity.to_string(), id));
        }
        Ok(())
    }

    async fn delete(&mut self, entity: &str, id: i64) -> Result<()> {
        let entity_type = self.schema.entity(entity)?;
        let mut qb = sql::delete(entity_type, id);
        let result = qb.build().execute(&mut self.conn).await.map_err(store_error)?;
        if result.rows_affected() == 0 {
            exn::bail!(ErrorKind::NotFound(entity.to_string(), id));
        }
        Ok(())
    }
}

/// Map a sqlx error onto the store taxonomy, keeping it in the error tree.
fn store_error(err: sqlx::Error) -> Error {
    let kind = match &err {
        sqlx::Error::Database(db) => match db.kind() {
            sqlx::error::ErrorKind::UniqueViolation
            | sqlx::error::ErrorKind::ForeignKeyViolation
            | sqlx::error::ErrorKind::NotNullViolation
            | sqlx::error::ErrorKind::CheckViolation => ErrorKind::ConstraintViolation(db.message().to_string()),
            _ => ErrorKind::Database,
        },
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolClosed
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::WorkerCrashed => ErrorKind::ConnectionLost,
        _ => ErrorKind::Database,
    };
    exn::Exn::from(err).raise(kind)
}

/// Decode every column of a row using the storage class SQLite reports for
/// each value.
fn decode(row: &SqliteRow) -> Result<Row> {
    let mut out = Row::new();
    for column in row.columns() {
        let index = column.ordinal();
        let raw = row.try_get_raw(index).or_raise(|| ErrorKind::InvalidData("column"))?;
        let value = if raw.is_null() {
            Value::Null
        } else {
            let storage = raw.type_info().name().to_string();
            match storage.as_str() {
                "INTEGER" | "BOOLEAN" => Value::Integer(
                    row.try_get_unchecked::<i64, _>(index).or_raise(|| ErrorKind::InvalidData("integer column"))?,
                ),
                "REAL" | "NUMERIC" => {
                    Value::Real(row.try_get_unchecked::<f64, _>(index).or_raise(|| ErrorKind::InvalidData("real column"))?)
                },
                "TEXT" => Value::Text(
                    row.try_get_unchecked::<String, _>(index).or_raise(|| ErrorKind::InvalidData("text column"))?,
                ),
                _ => exn::bail!(ErrorKind::InvalidData("unsupported column storage class")),
            }
        };
        out.insert(column.name().to_string(), value);
    }
    Ok(out)
}

/// SQLite has no boolean storage class; restore the declared field kinds.
fn coerce(entity: &EntityType, mut row: Row) -> Row {
    for field in entity.fields() {
        if let Some(value) = row.get_mut(&field.name) {
            *value = match (field.kind, std::mem::take(value)) {
                (FieldKind::Bool, Value::Integer(i)) => Value::Bool(i != 0),
                (FieldKind::Real, Value::Integer(i)) => Value::Real(i as f64),
                (_, other) => other,
            };
        }
    }
    row
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Predicate;
    use crate::descriptor::Direction;

    fn blog(name: &str, rating: i64) -> Row {
        Row::from([
            ("name".to_string(), Value::from(name)),
            ("url".to_string(), Value::from(format!("https://{name}.example.com"))),
            ("rating".to_string(), Value::Integer(rating)),
            ("owner".to_string(), Value::from("alice")),
        ])
    }

    fn post(blog_id: i64, title: &str, published: bool) -> Row {
        Row::from([
            ("blog_id".to_string(), Value::Integer(blog_id)),
            ("title".to_string(), Value::from(title)),
            ("content".to_string(), Value::from("...")),
            ("published".to_string(), Value::Bool(published)),
            ("views".to_string(), Value::Integer(0)),
        ])
    }

    #[tokio::test]
    async fn test_sessions_share_in_memory_database() {
        let connector = SqliteConnector::in_memory().await.unwrap();
        let mut writer = connector.connect().await.unwrap();
        let mut reader = connector.connect().await.unwrap();
        assert_ne!(writer.id(), reader.id());
        let id = writer.insert("blog", &blog("rust", 5)).await.unwrap();
        let rows = reader.fetch(&FetchRequest::new("blog")).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("id"), Some(&Value::Integer(id)));
        assert_eq!(rows[0].get("description"), Some(&Value::Null));
        connector.close().await;
    }

    #[tokio::test]
    async fn test_separate_connectors_are_isolated() {
        let a = SqliteConnector::in_memory().await.unwrap();
        let b = SqliteConnector::in_memory().await.unwrap();
        a.connect().await.unwrap().insert("blog", &blog("rust", 5)).await.unwrap();
        assert!(b.connect().await.unwrap().fetch(&FetchRequest::new("blog")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fetch_filter_projection_and_order() {
        let connector = SqliteConnector::in_memory().await.unwrap();
        let mut session = connector.connect().await.unwrap();
        for (name, rating) in [("a", 1), ("b", 4), ("c", 5), ("d", 3)] {
            session.insert("blog", &blog(name, rating)).await.unwrap();
        }
        let request = FetchRequest {
            columns: Some(vec!["name".to_string()]),
            filter: Some(Predicate::ge("rating", 3)),
            order_by: vec![("rating".to_string(), Direction::Desc)],
            limit: Some(2),
            ..FetchRequest::new("blog")
        };
        let rows = session.fetch(&request).await.unwrap();
        let names: Vec<_> = rows.iter().map(|r| r.get("name").and_then(Value::as_str).unwrap()).collect();
        assert_eq!(names, ["c", "b"]);
        assert!(rows.iter().all(|r| r.len() == 1));
    }

    #[tokio::test]
    async fn test_raw_predicate_is_bound() {
        let connector = SqliteConnector::in_memory().await.unwrap();
        let mut session = connector.connect().await.unwrap();
        session.insert("blog", &blog("x", 1)).await.unwrap();
        let hostile = "x' OR '1'='1";
        let request = FetchRequest { filter: Some(Predicate::raw("name = ?", [hostile])), ..FetchRequest::new("blog") };
        assert!(session.fetch(&request).await.unwrap().is_empty());
        let request = FetchRequest { filter: Some(Predicate::raw("length(name) = ?", [1])), ..FetchRequest::new("blog") };
        assert_eq!(session.fetch(&request).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_joined_fetch_and_booleans() {
        let connector = SqliteConnector::in_memory().await.unwrap();
        let mut session = connector.connect().await.unwrap();
        let first = session.insert("blog", &blog("first", 5)).await.unwrap();
        let empty = session.insert("blog", &blog("empty", 4)).await.unwrap();
        session.insert("post", &post(first, "one", true)).await.unwrap();
        session.insert("post", &post(first, "two", false)).await.unwrap();

        let rows = session.fetch_joined(&FetchRequest::new("blog"), "posts").await.unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].parent.get("id"), Some(&Value::Integer(first)));
        assert_eq!(rows[0].child.as_ref().unwrap().get("published"), Some(&Value::Bool(true)));
        assert_eq!(rows[1].child.as_ref().unwrap().get("published"), Some(&Value::Bool(false)));
        assert_eq!(rows[2].parent.get("id"), Some(&Value::Integer(empty)));
        assert!(rows[2].child.is_none());

        let stats = session.cardinality("blog", "posts").await.unwrap();
        assert_eq!(stats, Cardinality { parents: 2, children: 2 });
    }

    #[tokio::test]
    async fn test_constraint_violations() {
        let connector = SqliteConnector::in_memory().await.unwrap();
        let mut session = connector.connect().await.unwrap();
        let id = session.insert("blog", &blog("rust", 5)).await.unwrap();

        let mut duplicate = blog("again", 1);
        duplicate.insert("id".to_string(), Value::Integer(id));
        let err = session.insert("blog", &duplicate).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::ConstraintViolation(_)));

        let err = session.insert("post", &post(id + 100, "orphan", true)).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::ConstraintViolation(_)));

        session.insert("post", &post(id, "child", true)).await.unwrap();
        let err = session.delete("blog", id).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::ConstraintViolation(_)));
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let connector = SqliteConnector::in_memory().await.unwrap();
        let mut session = connector.connect().await.unwrap();
        let id = session.insert("blog", &blog("rust", 5)).await.unwrap();
        session.update("blog", id, &Row::from([("rating".to_string(), Value::Integer(2))])).await.unwrap();
        let request = FetchRequest { filter: Some(Predicate::eq("id", id)), ..FetchRequest::new("blog") };
        assert_eq!(session.fetch(&request).await.unwrap()[0].get("rating"), Some(&Value::Integer(2)));
        session.delete("blog", id).await.unwrap();
        let err = session.delete("blog", id).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_, _)));
        let err = session.update("blog", id, &Row::from([("rating".to_string(), Value::Integer(1))])).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_, _)));
    }

    #[tokio::test]
    async fn test_file_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quarry.db");
        let connector = SqliteConnector::open(&path).await.unwrap();
        connector.connect().await.unwrap().insert("blog", &blog("rust", 5)).await.unwrap();
        drop(connector);
        // Reopening runs the migrations again, which must be idempotent.
        let connector = SqliteConnector::open(&path).await.unwrap();
        let mut session = connector.connect().await.unwrap();
        session.ping().await.unwrap();
        assert_eq!(session.fetch(&FetchRequest::new("blog")).await.unwrap().len(), 1);
    }
}
