//! Store boundary for quarry.
//!
//! Everything below the data-access layer lives here: the data model handed
//! across the boundary, the schema, filter predicates, query descriptors and
//! their fingerprints, and the backends that actually talk to a store.
//!
//! # Architecture
//! - **Descriptors**: a [`QueryDescriptor`] is an immutable description of what
//!   to fetch. It never touches a store itself; the access layer turns it into
//!   one or more [`FetchRequest`](backend::FetchRequest)s.
//! - **Backends**: a [`Connector`](backend::Connector) opens
//!   [`Session`](backend::Session)s. Every data call on a session is one
//!   round-trip. The SQLite backend is always available; an in-memory backend
//!   is behind the `mock` feature.

pub mod backend;
mod descriptor;
mod entity;
pub mod error;
mod predicate;
mod schema;
pub mod seed;
mod value;

pub use crate::descriptor::{Direction, FetchMode, Fingerprint, Projection, QueryDescriptor};
pub use crate::entity::{Entity, EntityKey, ProjectionRow, ResultSet, Rows};
pub use crate::predicate::{ClientFilter, Comparison, Predicate};
pub use crate::schema::{EntityType, Field, FieldKind, ID, Relation, Schema};
pub use crate::value::{Row, Value};
