use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// One column of one row, as returned by a store round-trip.
pub type Row = BTreeMap<String, Value>;

/// A scalar value stored in (or bound to) a column.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum Value {
    #[default]
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Bool(bool),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            Self::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Compare two values the way SQLite does for the types we support:
    /// numbers compare numerically (integers and reals mixed), text compares
    /// bytewise, and `NULL` never compares.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Self::Null, _) | (_, Self::Null) => None,
            (Self::Text(a), Self::Text(b)) => Some(a.as_bytes().cmp(b.as_bytes())),
            (Self::Real(a), Self::Real(b)) => a.partial_cmp(b),
            (Self::Real(a), b) => b.as_i64().and_then(|b| a.partial_cmp(&(b as f64))),
            (a, Self::Real(b)) => a.as_i64().and_then(|a| (a as f64).partial_cmp(b)),
            (a, b) => Some(a.as_i64()?.cmp(&b.as_i64()?)),
        }
    }

    /// Feed a canonical, type-tagged encoding of this value into a hasher.
    pub(crate) fn hash_into(&self, hasher: &mut blake3::Hasher) {
        match self {
            Self::Null => hasher.update(&[0]),
            Self::Integer(i) => hasher.update(&[1]).update(&i.to_le_bytes()),
            Self::Real(r) => hasher.update(&[2]).update(&r.to_bits().to_le_bytes()),
            Self::Text(s) => hasher.update(&[3]).update(&(s.len() as u64).to_le_bytes()).update(s.as_bytes()),
            Self::Bool(b) => hasher.update(&[4, u8::from(*b)]),
        };
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::Integer(v) => write!(f, "{v}"),
            Self::Real(v) => write!(f, "{v}"),
            Self::Text(v) => write!(f, "{v:?}"),
            Self::Bool(v) => write!(f, "{v}"),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}
impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Integer(i64::from(value))
    }
}
impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Real(value)
    }
}
impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}
impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}
impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}
impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}
