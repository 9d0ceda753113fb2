//! Entity types, their fields and one-to-many relations.
//!
//! Every identifier in a [`Schema`] is validated at construction so that the
//! SQL backends can quote table and column names directly into statements.
//! Values are never treated this way; they are always bound as parameters.

use crate::error::{ErrorKind, Result};
use std::collections::{BTreeMap, HashSet};

/// Name of the implicit identifier column every entity type has.
pub const ID: &str = "id";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldKind {
    Integer,
    Real,
    Text,
    Bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub kind: FieldKind,
    pub nullable: bool,
}

/// One-to-many relation: rows of `target` whose `foreign_key` equals the
/// owning entity's identifier.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Relation {
    pub name: String,
    pub target: String,
    pub foreign_key: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntityType {
    pub name: String,
    pub table: String,
    fields: Vec<Field>,
    relations: Vec<Relation>,
}

impl EntityType {
    pub fn new(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self { name: name.into(), table: table.into(), fields: Vec::new(), relations: Vec::new() }
    }

    pub fn field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(Field { name: name.into(), kind, nullable: false });
        self
    }

    pub fn nullable(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(Field { name: name.into(), kind, nullable: true });
        self
    }

    pub fn has_many(mut self, name: impl Into<String>, target: impl Into<String>, foreign_key: impl Into<String>) -> Self {
        self.relations.push(Relation { name: name.into(), target: target.into(), foreign_key: foreign_key.into() });
        self
    }

    /// Scalar fields, excluding the identifier.
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn relations(&self) -> &[Relation] {
        &self.relations
    }

    /// Identifier followed by every scalar field, in declaration order.
    pub fn columns(&self) -> impl Iterator<Item = &str> {
        std::iter::once(ID).chain(self.fields.iter().map(|f| f.name.as_str()))
    }

    pub fn has_column(&self, column: &str) -> bool {
        column == ID || self.fields.iter().any(|f| f.name == column)
    }

    pub fn require_column(&self, column: &str) -> Result<()> {
        if !self.has_column(column) {
            exn::bail!(ErrorKind::UnknownField(format!("{}.{column}", self.name)));
        }
        Ok(())
    }

    pub fn relation(&self, name: &str) -> Result<&Relation> {
        match self.relations.iter().find(|r| r.name == name) {
            Some(relation) => Ok(relation),
            None => exn::bail!(ErrorKind::UnknownRelation(format!("{}.{name}", self.name))),
        }
    }
}

/// The set of entity types a store knows about.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Schema {
    entities: BTreeMap<String, EntityType>,
}

impl Schema {
    /// Validate and assemble a schema.
    ///
    /// Rejects invalid identifiers, duplicate entity/field names, fields
    /// shadowing the identifier, and relations pointing at unknown entity
    /// types or foreign keys.
    pub fn new(entities: impl IntoIterator<Item = EntityType>) -> Result<Self> {
        let mut map = BTreeMap::new();
        for entity in entities {
            validate_identifier(&entity.name)?;
            validate_identifier(&entity.table)?;
            let mut seen = HashSet::new();
            for field in &entity.fields {
                validate_identifier(&field.name)?;
                if field.name == ID || !seen.insert(field.name.as_str()) {
                    exn::bail!(ErrorKind::InvalidSchema(format!("duplicate field {}.{}", entity.name, field.name)));
                }
            }
            if map.insert(entity.name.clone(), entity).is_some() {
                exn::bail!(ErrorKind::InvalidSchema("duplicate entity type".to_string()));
            }
        }
        for entity in map.values() {
            for relation in &entity.relations {
                validate_identifier(&relation.name)?;
                let Some(target) = map.get(&relation.target) else {
                    exn::bail!(ErrorKind::InvalidSchema(format!(
                        "relation {}.{} targets unknown entity {}",
                        entity.name, relation.name, relation.target
                    )));
                };
                if !target.has_column(&relation.foreign_key) || relation.foreign_key == ID {
                    exn::bail!(ErrorKind::InvalidSchema(format!(
                        "relation {}.{} uses unknown foreign key {}",
                        entity.name, relation.name, relation.foreign_key
                    )));
                }
            }
        }
        Ok(Self { entities: map })
    }

    /// The blogs/posts dataset the benchmarks and tests run against.
    pub fn benchmark() -> Result<Self> {
        let blog = EntityType::new("blog", "blogs")
            .field("name", FieldKind::Text)
            .field("url", FieldKind::Text)
            .nullable("description", FieldKind::Text)
            .field("rating", FieldKind::Integer)
            .field("owner", FieldKind::Text)
            .has_many("posts", "post", "blog_id");
        let post = EntityType::new("post", "posts")
            .field("blog_id", FieldKind::Integer)
            .field("title", FieldKind::Text)
            .field("content", FieldKind::Text)
            .field("published", FieldKind::Bool)
            .field("views", FieldKind::Integer);
        Self::new([blog, post])
    }

    pub fn entity(&self, name: &str) -> Result<&EntityType> {
        match self.entities.get(name) {
            Some(entity) => Ok(entity),
            None => exn::bail!(ErrorKind::UnknownEntity(name.to_string())),
        }
    }

    pub fn entities(&self) -> impl Iterator<Item = &EntityType> {
        self.entities.values()
    }
}

fn validate_identifier(ident: &str) -> Result<()> {
    let mut chars = ident.chars();
    let valid = chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        exn::bail!(ErrorKind::InvalidSchema(format!("invalid identifier: {ident:?}")));
    }
    Ok(())
}
