//! Logical query descriptions and their fingerprints.

use crate::error::{ErrorKind, Result};
use crate::predicate::Predicate;
use crate::schema::Schema;
use std::fmt;

/// Which columns a query materializes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Projection {
    /// The whole entity (identifier and every field).
    #[default]
    All,
    /// Only the named fields; the result is a narrower shape without identity.
    Fields(Vec<String>),
}

/// How a parent + related collection is fetched.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FetchMode {
    /// One joined round-trip; parent rows repeat once per child.
    #[default]
    Joined,
    /// Parents first, then children by parent identifier: two round-trips.
    Split,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

/// Immutable description of what to fetch.
///
/// Built by chaining the consuming methods below; once handed to a strategy
/// it is only ever borrowed. Two descriptors built the same way have the same
/// [`Fingerprint`].
///
/// ```
/// use quarry_store::{Predicate, QueryDescriptor};
///
/// let query = QueryDescriptor::new("blog")
///     .filter(Predicate::ge("rating", 3))
///     .include("posts")
///     .order_by("name", Default::default())
///     .limit(20);
/// assert_eq!(query.entity(), "blog");
/// assert_eq!(query.fingerprint(), query.clone().fingerprint());
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct QueryDescriptor {
    entity: String,
    filter: Option<Predicate>,
    projection: Projection,
    include: Option<String>,
    fetch_mode: FetchMode,
    order_by: Vec<(String, Direction)>,
    limit: Option<u64>,
    offset: Option<u64>,
}

impl QueryDescriptor {
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            filter: None,
            projection: Projection::All,
            include: None,
            fetch_mode: FetchMode::default(),
            order_by: Vec::new(),
            limit: None,
            offset: None,
        }
    }

    /// Add a filter; repeated calls are combined with `AND`.
    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.filter = Some(match self.filter.take() {
            Some(existing) => existing.and(predicate),
            None => predicate,
        });
        self
    }

    /// Fetch only the named fields.
    pub fn select(mut self, fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.projection = Projection::Fields(fields.into_iter().map(Into::into).collect());
        self
    }

    /// Load a related collection along with each parent.
    pub fn include(mut self, relation: impl Into<String>) -> Self {
        self.include = Some(relation.into());
        self
    }

    pub fn fetch_mode(mut self, mode: FetchMode) -> Self {
        self.fetch_mode = mode;
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order_by.push((field.into(), direction));
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn predicate(&self) -> Option<&Predicate> {
        self.filter.as_ref()
    }

    pub fn projection(&self) -> &Projection {
        &self.projection
    }

    pub fn included(&self) -> Option<&str> {
        self.include.as_deref()
    }

    pub fn mode(&self) -> FetchMode {
        self.fetch_mode
    }

    pub fn ordering(&self) -> &[(String, Direction)] {
        &self.order_by
    }

    pub fn limit_value(&self) -> Option<u64> {
        self.limit
    }

    pub fn offset_value(&self) -> Option<u64> {
        self.offset
    }

    /// Copy of this descriptor without its filter.
    pub fn without_filter(&self) -> Self {
        Self { filter: None, ..self.clone() }
    }

    /// Check every name the descriptor references against the schema.
    pub fn validate(&self, schema: &Schema) -> Result<()> {
        let entity = schema.entity(&self.entity)?;
        if let Some(filter) = &self.filter {
            filter.validate(entity)?;
        }
        if let Projection::Fields(fields) = &self.projection {
            if fields.is_empty() {
                exn::bail!(ErrorKind::UnknownField(format!("{}: empty projection", self.entity)));
            }
            fields.iter().try_for_each(|f| entity.require_column(f))?;
        }
        self.order_by.iter().try_for_each(|(f, _)| entity.require_column(f))?;
        if let Some(include) = &self.include {
            entity.relation(include)?;
        }
        Ok(())
    }

    /// Entity types whose rows can appear in this query's result.
    pub fn touches(&self, schema: &Schema) -> Result<Vec<String>> {
        let entity = schema.entity(&self.entity)?;
        let mut touched = vec![entity.name.clone()];
        if let Some(include) = &self.include {
            let target = &entity.relation(include)?.target;
            if !touched.contains(target) {
                touched.push(target.clone());
            }
        }
        Ok(touched)
    }

    /// Deterministic, value-based identity of this descriptor.
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = blake3::Hasher::new();
        let text = |hasher: &mut blake3::Hasher, s: &str| {
            hasher.update(&(s.len() as u64).to_le_bytes()).update(s.as_bytes());
        };
        text(&mut hasher, &self.entity);
        match &self.filter {
            Some(filter) => {
                hasher.update(&[1]);
                filter.hash_into(&mut hasher);
            },
            None => {
                hasher.update(&[0]);
            },
        }
        match &self.projection {
            Projection::All => {
                hasher.update(&[0]);
            },
            Projection::Fields(fields) => {
                hasher.update(&[1]).update(&(fields.len() as u64).to_le_bytes());
                fields.iter().for_each(|f| text(&mut hasher, f));
            },
        }
        match &self.include {
            Some(include) => {
                hasher.update(&[1]);
                text(&mut hasher, include);
            },
            None => {
                hasher.update(&[0]);
            },
        }
        hasher.update(&[self.fetch_mode as u8]);
        hasher.update(&(self.order_by.len() as u64).to_le_bytes());
        for (field, direction) in &self.order_by {
            text(&mut hasher, field);
            hasher.update(&[*direction as u8]);
        }
        for bound in [self.limit, self.offset] {
            match bound {
                Some(n) => hasher.update(&[1]).update(&n.to_le_bytes()),
                None => hasher.update(&[0]),
            };
        }
        Fingerprint(hasher.finalize())
    }
}

/// BLAKE3 hash of a descriptor's canonical encoding; the cache key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Fingerprint(blake3::Hash);

impl Fingerprint {
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn base() -> QueryDescriptor {
        QueryDescriptor::new("blog").filter(Predicate::ge("rating", 3)).order_by("name", Direction::Asc).limit(10)
    }

    #[test]
    fn test_fingerprint_is_value_based() {
        assert_eq!(base().fingerprint(), base().fingerprint());
        assert_eq!(base().fingerprint().to_string().len(), 64);
    }

    #[rstest]
    #[case(base().filter(Predicate::eq("owner", "alice")))]
    #[case(QueryDescriptor::new("blog").filter(Predicate::ge("rating", 4)).order_by("name", Direction::Asc).limit(10))]
    #[case(QueryDescriptor::new("blog").filter(Predicate::ge("rating", 3)).order_by("name", Direction::Desc).limit(10))]
    #[case(base().select(["name"]))]
    #[case(base().include("posts"))]
    #[case(base().include("posts").fetch_mode(FetchMode::Split))]
    #[case(base().offset(5))]
    #[case(QueryDescriptor::new("post").filter(Predicate::ge("rating", 3)).order_by("name", Direction::Asc).limit(10))]
    fn test_fingerprint_differs(#[case] other: QueryDescriptor) {
        assert_ne!(base().fingerprint(), other.fingerprint());
    }

    #[test]
    fn test_limit_and_offset_are_not_interchangeable() {
        let a = QueryDescriptor::new("blog").limit(5);
        let b = QueryDescriptor::new("blog").offset(5);
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_filters_combine_with_and() {
        let query = QueryDescriptor::new("blog").filter(Predicate::ge("rating", 3)).filter(Predicate::eq("owner", "bob"));
        assert!(matches!(query.predicate(), Some(Predicate::And(items)) if items.len() == 2));
    }

    #[test]
    fn test_validate() {
        let schema = Schema::benchmark().unwrap();
        base().include("posts").validate(&schema).unwrap();
        let err = base().select(["title"]).validate(&schema).unwrap_err();
        assert!(matches!(&*err, ErrorKind::UnknownField(_)));
        let err = base().include("comments").validate(&schema).unwrap_err();
        assert!(matches!(&*err, ErrorKind::UnknownRelation(_)));
        let err = QueryDescriptor::new("comment").validate(&schema).unwrap_err();
        assert!(matches!(&*err, ErrorKind::UnknownEntity(_)));
    }

    #[test]
    fn test_touches() {
        let schema = Schema::benchmark().unwrap();
        assert_eq!(base().touches(&schema).unwrap(), ["blog"]);
        assert_eq!(base().include("posts").touches(&schema).unwrap(), ["blog", "post"]);
    }
}
