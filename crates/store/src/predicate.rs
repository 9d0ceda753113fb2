//! Filter predicates.
//!
//! Everything except [`Predicate::Client`] can be pushed down to a store.
//! [`Predicate::Raw`] is a parameterized SQL escape hatch: the fragment uses
//! `?` placeholders and its parameters are always bound, never spliced. Every
//! `?` counts as a placeholder, so literals inside the fragment cannot contain
//! one; pass such values as parameters instead.

use crate::error::{ErrorKind, Result};
use crate::schema::EntityType;
use crate::value::{Row, Value};
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Comparison {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Comparison {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "<>",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }

    fn holds(&self, ordering: Ordering) -> bool {
        match self {
            Self::Eq => ordering == Ordering::Equal,
            Self::Ne => ordering != Ordering::Equal,
            Self::Lt => ordering == Ordering::Less,
            Self::Le => ordering != Ordering::Greater,
            Self::Gt => ordering == Ordering::Greater,
            Self::Ge => ordering != Ordering::Less,
        }
    }
}

static NULL: Value = Value::Null;

type FilterFn = dyn Fn(&Row) -> bool + Send + Sync;

/// A named in-process filter.
///
/// The name stands in for the closure wherever a value-based identity is
/// needed (equality, fingerprints), so two filters with the same name must
/// have the same behaviour.
#[derive(Clone)]
pub struct ClientFilter {
    name: String,
    filter: Arc<FilterFn>,
}

impl ClientFilter {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn matches(&self, row: &Row) -> bool {
        (self.filter)(row)
    }
}

impl fmt::Debug for ClientFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ClientFilter").field(&self.name).finish()
    }
}

impl PartialEq for ClientFilter {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Predicate {
    Compare { field: String, op: Comparison, value: Value },
    Like { field: String, pattern: String },
    In { field: String, values: Vec<Value> },
    IsNull(String),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
    Raw { sql: String, params: Vec<Value> },
    Client(ClientFilter),
}

impl Predicate {
    fn compare(field: impl Into<String>, op: Comparison, value: impl Into<Value>) -> Self {
        Self::Compare { field: field.into(), op, value: value.into() }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(field, Comparison::Eq, value)
    }

    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(field, Comparison::Ne, value)
    }

    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(field, Comparison::Lt, value)
    }

    pub fn le(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(field, Comparison::Le, value)
    }

    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(field, Comparison::Gt, value)
    }

    pub fn ge(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(field, Comparison::Ge, value)
    }

    pub fn like(field: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::Like { field: field.into(), pattern: pattern.into() }
    }

    pub fn is_in(field: impl Into<String>, values: impl IntoIterator<Item = impl Into<Value>>) -> Self {
        Self::In { field: field.into(), values: values.into_iter().map(Into::into).collect() }
    }

    pub fn is_null(field: impl Into<String>) -> Self {
        Self::IsNull(field.into())
    }

    pub fn raw(sql: impl Into<String>, params: impl IntoIterator<Item = impl Into<Value>>) -> Self {
        Self::Raw { sql: sql.into(), params: params.into_iter().map(Into::into).collect() }
    }

    pub fn client(name: impl Into<String>, filter: impl Fn(&Row) -> bool + Send + Sync + 'static) -> Self {
        Self::Client(ClientFilter { name: name.into(), filter: Arc::new(filter) })
    }

    /// Conjunction, flattening nested `AND`s.
    pub fn and(self, other: Predicate) -> Self {
        match (self, other) {
            (Self::And(mut a), Self::And(b)) => {
                a.extend(b);
                Self::And(a)
            },
            (Self::And(mut a), b) => {
                a.push(b);
                Self::And(a)
            },
            (a, Self::And(mut b)) => {
                b.insert(0, a);
                Self::And(b)
            },
            (a, b) => Self::And(vec![a, b]),
        }
    }

    pub fn or(self, other: Predicate) -> Self {
        match self {
            Self::Or(mut a) => {
                a.push(other);
                Self::Or(a)
            },
            a => Self::Or(vec![a, other]),
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Self {
        Self::Not(Box::new(self))
    }

    /// Whether the whole predicate can be evaluated by the store.
    pub fn is_translatable(&self) -> bool {
        match self {
            Self::Client(_) => false,
            Self::And(items) | Self::Or(items) => items.iter().all(Self::is_translatable),
            Self::Not(inner) => inner.is_translatable(),
            _ => true,
        }
    }

    /// Split into the part the store can evaluate and the residual that has
    /// to run in process.
    ///
    /// Only top-level conjuncts are separated: a client filter nested under
    /// `OR`/`NOT` makes that whole branch residual.
    pub fn split_for_store(self) -> (Option<Predicate>, Option<Predicate>) {
        if self.is_translatable() {
            return (Some(self), None);
        }
        match self {
            Self::And(items) => {
                let (pushed, residual): (Vec<_>, Vec<_>) = items.into_iter().partition(Self::is_translatable);
                (Self::conjunction(pushed), Self::conjunction(residual))
            },
            other => (None, Some(other)),
        }
    }

    fn conjunction(mut items: Vec<Predicate>) -> Option<Predicate> {
        match items.len() {
            0 => None,
            1 => items.pop(),
            _ => Some(Self::And(items)),
        }
    }

    /// Check every referenced field exists on the entity type.
    pub fn validate(&self, entity: &EntityType) -> Result<()> {
        match self {
            Self::Compare { field, .. } | Self::Like { field, .. } | Self::In { field, .. } | Self::IsNull(field) => {
                entity.require_column(field)
            },
            Self::And(items) | Self::Or(items) => items.iter().try_for_each(|p| p.validate(entity)),
            Self::Not(inner) => inner.validate(entity),
            Self::Raw { sql, params } => {
                if sql.matches('?').count() != params.len() {
                    exn::bail!(ErrorKind::UntranslatablePredicate(format!(
                        "raw SQL has {} placeholders but {} parameters",
                        sql.matches('?').count(),
                        params.len()
                    )));
                }
                Ok(())
            },
            Self::Client(_) => Ok(()),
        }
    }

    /// Evaluate against a row with SQL three-valued logic; `None` is UNKNOWN.
    ///
    /// Raw SQL fragments cannot be evaluated in process.
    pub fn evaluate(&self, row: &Row) -> Result<Option<bool>> {
        let value = |field: &str| row.get(field).unwrap_or(&NULL);
        Ok(match self {
            Self::Compare { field, op, value: rhs } => value(field).compare(rhs).map(|o| op.holds(o)),
            Self::Like { field, pattern } => value(field).as_str().map(|s| like(s, pattern)),
            Self::In { field, values } => {
                let lhs = value(field);
                if lhs.is_null() {
                    None
                } else if values.iter().any(|v| lhs.compare(v) == Some(Ordering::Equal)) {
                    Some(true)
                } else if values.iter().any(Value::is_null) {
                    None
                } else {
                    Some(false)
                }
            },
            Self::IsNull(field) => Some(value(field).is_null()),
            Self::And(items) => {
                let mut result = Some(true);
                for item in items {
                    match item.evaluate(row)? {
                        Some(false) => return Ok(Some(false)),
                        None => result = None,
                        Some(true) => {},
                    }
                }
                result
            },
            Self::Or(items) => {
                let mut result = Some(false);
                for item in items {
                    match item.evaluate(row)? {
                        Some(true) => return Ok(Some(true)),
                        None => result = None,
                        Some(false) => {},
                    }
                }
                result
            },
            Self::Not(inner) => inner.evaluate(row)?.map(|b| !b),
            Self::Raw { sql, .. } => {
                exn::bail!(ErrorKind::UntranslatablePredicate(format!("raw SQL cannot be evaluated in process: {sql}")))
            },
            Self::Client(filter) => Some(filter.matches(row)),
        })
    }

    /// Whether the row passes the filter (UNKNOWN does not pass).
    pub fn matches(&self, row: &Row) -> Result<bool> {
        Ok(self.evaluate(row)? == Some(true))
    }

    pub(crate) fn hash_into(&self, hasher: &mut blake3::Hasher) {
        let text = |hasher: &mut blake3::Hasher, s: &str| {
            hasher.update(&(s.len() as u64).to_le_bytes()).update(s.as_bytes());
        };
        match self {
            Self::Compare { field, op, value } => {
                hasher.update(&[1, *op as u8]);
                text(hasher, field);
                value.hash_into(hasher);
            },
            Self::Like { field, pattern } => {
                hasher.update(&[2]);
                text(hasher, field);
                text(hasher, pattern);
            },
            Self::In { field, values } => {
                hasher.update(&[3]);
                text(hasher, field);
                hasher.update(&(values.len() as u64).to_le_bytes());
                values.iter().for_each(|v| v.hash_into(hasher));
            },
            Self::IsNull(field) => {
                hasher.update(&[4]);
                text(hasher, field);
            },
            Self::And(items) | Self::Or(items) => {
                hasher.update(&[if matches!(self, Self::And(_)) { 5 } else { 6 }]);
                hasher.update(&(items.len() as u64).to_le_bytes());
                items.iter().for_each(|p| p.hash_into(hasher));
            },
            Self::Not(inner) => {
                hasher.update(&[7]);
                inner.hash_into(hasher);
            },
            Self::Raw { sql, params } => {
                hasher.update(&[8]);
                text(hasher, sql);
                hasher.update(&(params.len() as u64).to_le_bytes());
                params.iter().for_each(|v| v.hash_into(hasher));
            },
            Self::Client(filter) => {
                hasher.update(&[9]);
                text(hasher, &filter.name);
            },
        }
    }
}

/// SQLite `LIKE`: `%` matches any run, `_` one character, ASCII letters
/// compare case-insensitively.
fn like(input: &str, pattern: &str) -> bool {
    let input: Vec<char> = input.chars().map(|c| c.to_ascii_lowercase()).collect();
    let pattern: Vec<char> = pattern.chars().map(|c| c.to_ascii_lowercase()).collect();
    let (mut i, mut p) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;
    while i < input.len() {
        match pattern.get(p) {
            Some('%') => {
                backtrack = Some((p, i));
                p += 1;
            },
            Some('_') => {
                i += 1;
                p += 1;
            },
            Some(c) if *c == input[i] => {
                i += 1;
                p += 1;
            },
            _ => match backtrack {
                Some((bp, bi)) => {
                    p = bp + 1;
                    i = bi + 1;
                    backtrack = Some((bp, bi + 1));
                },
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|c| *c == '%')
}
