//! Materialized query results.

use crate::error::{ErrorKind, Result};
use crate::schema::ID;
use crate::value::{Row, Value};
use exn::OptionExt;
use std::collections::BTreeMap;
use std::fmt;

/// Identity of an entity: its type plus identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityKey {
    pub entity: String,
    pub id: i64,
}

impl EntityKey {
    pub fn new(entity: impl Into<String>, id: i64) -> Self {
        Self { entity: entity.into(), id }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.entity, self.id)
    }
}

/// A full record: identifier, scalar fields and any loaded related
/// collections.
///
/// The identifier is fixed when the entity is materialized; [`Entity::set`]
/// refuses to touch it.
#[derive(Clone, Debug, PartialEq)]
pub struct Entity {
    key: EntityKey,
    fields: Row,
    related: BTreeMap<String, Vec<Entity>>,
}

impl Entity {
    /// Build an entity from a store row, taking the identifier out of the
    /// `id` column.
    pub fn from_row(entity: impl Into<String>, mut row: Row) -> Result<Self> {
        let id = row
            .remove(ID)
            .and_then(|v| v.as_i64())
            .ok_or_raise(|| ErrorKind::InvalidData("row without integer identifier"))?;
        Ok(Self { key: EntityKey::new(entity, id), fields: row, related: BTreeMap::new() })
    }

    pub fn id(&self) -> i64 {
        self.key.id
    }

    pub fn entity_type(&self) -> &str {
        &self.key.entity
    }

    pub fn key(&self) -> &EntityKey {
        &self.key
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Scalar fields, excluding the identifier.
    pub fn fields(&self) -> &Row {
        &self.fields
    }

    pub fn set(&mut self, field: &str, value: impl Into<Value>) -> Result<()> {
        if field == ID {
            exn::bail!(ErrorKind::ReadOnlyField(format!("{}.{ID}", self.key.entity)));
        }
        if !self.fields.contains_key(field) {
            exn::bail!(ErrorKind::UnknownField(format!("{}.{field}", self.key.entity)));
        }
        self.fields.insert(field.to_string(), value.into());
        Ok(())
    }

    /// A loaded related collection, `None` if the relation was not included.
    pub fn related(&self, relation: &str) -> Option<&[Entity]> {
        self.related.get(relation).map(Vec::as_slice)
    }

    /// Names of the loaded related collections.
    pub fn related_names(&self) -> impl Iterator<Item = &str> {
        self.related.keys().map(String::as_str)
    }

    pub fn attach_related(&mut self, relation: impl Into<String>, children: Vec<Entity>) {
        self.related.insert(relation.into(), children);
    }

    /// Take every loaded related collection out, leaving none loaded.
    pub fn detach_related(&mut self) -> Vec<(String, Vec<Entity>)> {
        std::mem::take(&mut self.related).into_iter().collect()
    }

    /// Fields whose value differs from `original`.
    pub fn changes_since(&self, original: &Entity) -> Row {
        self.fields
            .iter()
            .filter(|(name, value)| original.fields.get(*name) != Some(*value))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }
}

/// A narrower shape holding only the projected fields; it has no identity and
/// cannot be written back.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProjectionRow {
    fields: Row,
}

impl ProjectionRow {
    pub fn new(fields: Row) -> Self {
        Self { fields }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn fields(&self) -> &Row {
        &self.fields
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Rows {
    Entities(Vec<Entity>),
    Projections(Vec<ProjectionRow>),
}

/// Result of executing one [`QueryDescriptor`](crate::QueryDescriptor), with
/// the number of store round-trips spent producing it.
///
/// Equality compares the rows only: a cached copy equals the result it was
/// taken from even though it cost no round-trips.
#[derive(Clone, Debug)]
pub struct ResultSet {
    rows: Rows,
    round_trips: u32,
}

impl PartialEq for ResultSet {
    fn eq(&self, other: &Self) -> bool {
        self.rows == other.rows
    }
}

impl ResultSet {
    pub fn entities(entities: Vec<Entity>) -> Self {
        Self { rows: Rows::Entities(entities), round_trips: 0 }
    }

    pub fn projections(rows: Vec<ProjectionRow>) -> Self {
        Self { rows: Rows::Projections(rows), round_trips: 0 }
    }

    pub fn with_round_trips(mut self, round_trips: u32) -> Self {
        self.round_trips = round_trips;
        self
    }

    /// Store round-trips spent producing this result; zero for a cache hit.
    pub fn round_trips(&self) -> u32 {
        self.round_trips
    }

    pub fn rows(&self) -> &Rows {
        &self.rows
    }

    pub fn rows_mut(&mut self) -> &mut Rows {
        &mut self.rows
    }

    pub fn into_rows(self) -> Rows {
        self.rows
    }

    pub fn len(&self) -> usize {
        match &self.rows {
            Rows::Entities(e) => e.len(),
            Rows::Projections(p) => p.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entities, or an empty slice for projection results.
    pub fn as_entities(&self) -> &[Entity] {
        match &self.rows {
            Rows::Entities(e) => e,
            Rows::Projections(_) => &[],
        }
    }

    /// Projection rows, or an empty slice for entity results.
    pub fn as_projections(&self) -> &[ProjectionRow] {
        match &self.rows {
            Rows::Projections(p) => p,
            Rows::Entities(_) => &[],
        }
    }
}
