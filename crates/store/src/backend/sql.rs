//! SQL statement construction.
//!
//! Identifiers come from a validated [`Schema`](crate::Schema) and are quoted
//! into the statement; every value goes through `push_bind`.

use crate::backend::FetchRequest;
use crate::descriptor::Direction;
use crate::error::{ErrorKind, Result};
use crate::predicate::Predicate;
use crate::schema::{EntityType, ID, Relation};
use crate::value::{Row, Value};
use sqlx::{QueryBuilder, Sqlite};

pub(super) const PARENT: &str = "p";
pub(super) const CHILD: &str = "c";
pub(super) const SEPARATOR: &str = "__";

fn quote(ident: &str) -> String {
    format!("\"{ident}\"")
}

fn column(alias: Option<&str>, name: &str) -> String {
    match alias {
        Some(alias) => format!("{alias}.{}", quote(name)),
        None => quote(name),
    }
}

fn push_value(qb: &mut QueryBuilder<'static, Sqlite>, value: &Value) {
    match value {
        Value::Null => qb.push_bind(Option::<i64>::None),
        Value::Integer(i) => qb.push_bind(*i),
        Value::Real(r) => qb.push_bind(*r),
        Value::Text(s) => qb.push_bind(s.clone()),
        Value::Bool(b) => qb.push_bind(*b),
    };
}

fn push_predicate(qb: &mut QueryBuilder<'static, Sqlite>, predicate: &Predicate, alias: Option<&str>) -> Result<()> {
    match predicate {
        Predicate::Compare { field, op, value } => {
            qb.push(column(alias, field)).push(" ").push(op.as_sql()).push(" ");
            push_value(qb, value);
        },
        Predicate::Like { field, pattern } => {
            qb.push(column(alias, field)).push(" LIKE ");
            qb.push_bind(pattern.clone());
        },
        Predicate::In { values, .. } if values.is_empty() => {
            qb.push("0");
        },
        Predicate::In { field, values } => {
            qb.push(column(alias, field)).push(" IN (");
            for (i, value) in values.iter().enumerate() {
                if i > 0 {
                    qb.push(", ");
                }
                push_value(qb, value);
            }
            qb.push(")");
        },
        Predicate::IsNull(field) => {
            qb.push(column(alias, field)).push(" IS NULL");
        },
        Predicate::And(items) | Predicate::Or(items) if items.is_empty() => {
            qb.push(if matches!(predicate, Predicate::And(_)) { "1" } else { "0" });
        },
        Predicate::And(items) | Predicate::Or(items) => {
            let separator = if matches!(predicate, Predicate::And(_)) { " AND " } else { " OR " };
            qb.push("(");
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    qb.push(separator);
                }
                push_predicate(qb, item, alias)?;
            }
            qb.push(")");
        },
        Predicate::Not(inner) => {
            qb.push("NOT (");
            push_predicate(qb, inner, alias)?;
            qb.push(")");
        },
        Predicate::Raw { sql, params } => {
            // Raw fragments are written against unqualified column names.
            // Every `?` is a placeholder, including one inside a quoted literal.
            let placeholders = sql.matches('?').count();
            if placeholders != params.len() {
                exn::bail!(ErrorKind::UntranslatablePredicate(format!(
                    "{placeholders} placeholders but {} parameters in: {sql}",
                    params.len()
                )));
            }
            qb.push("(");
            for (i, part) in sql.split('?').enumerate() {
                if i > 0 {
                    match params.get(i - 1) {
                        Some(value) => push_value(qb, value),
                        None => exn::bail!(ErrorKind::UntranslatablePredicate(format!("missing parameter in: {sql}"))),
                    }
                }
                qb.push(part);
            }
            qb.push(")");
        },
        Predicate::Client(filter) => {
            exn::bail!(ErrorKind::UntranslatablePredicate(format!("client-side filter `{}`", filter.name())));
        },
    }
    Ok(())
}

fn push_where(qb: &mut QueryBuilder<'static, Sqlite>, filter: Option<&Predicate>, alias: Option<&str>) -> Result<()> {
    if let Some(filter) = filter {
        qb.push(" WHERE ");
        push_predicate(qb, filter, alias)?;
    }
    Ok(())
}

/// `ORDER BY` the requested columns, always ending with the identifier so
/// results are deterministic.
fn push_order(qb: &mut QueryBuilder<'static, Sqlite>, order_by: &[(String, Direction)], alias: Option<&str>) {
    qb.push(" ORDER BY ");
    for (field, direction) in order_by.iter().filter(|(f, _)| f != ID) {
        qb.push(column(alias, field));
        qb.push(if *direction == Direction::Desc { " DESC, " } else { " ASC, " });
    }
    let id_direction = order_by.iter().find(|(f, _)| f == ID).map_or(Direction::Asc, |(_, d)| *d);
    qb.push(column(alias, ID));
    qb.push(if id_direction == Direction::Desc { " DESC" } else { " ASC" });
}

fn push_limit(qb: &mut QueryBuilder<'static, Sqlite>, limit: Option<u64>, offset: Option<u64>) -> Result<()> {
    let to_i64 = |n: u64| i64::try_from(n).map_err(|_| exn::Exn::from(ErrorKind::InvalidData("limit/offset out of range")));
    match (limit, offset) {
        (None, None) => {},
        (limit, offset) => {
            qb.push(" LIMIT ");
            qb.push_bind(limit.map(to_i64).transpose()?.unwrap_or(-1));
            if let Some(offset) = offset {
                qb.push(" OFFSET ");
                qb.push_bind(to_i64(offset)?);
            }
        },
    }
    Ok(())
}

fn columns<'a>(entity: &'a EntityType, request: &'a FetchRequest) -> Result<Vec<&'a str>> {
    match &request.columns {
        Some(columns) => {
            columns.iter().try_for_each(|c| entity.require_column(c))?;
            Ok(columns.iter().map(String::as_str).collect())
        },
        None => Ok(entity.columns().collect()),
    }
}

pub(super) fn select(entity: &EntityType, request: &FetchRequest) -> Result<QueryBuilder<'static, Sqlite>> {
    let mut qb = QueryBuilder::new("SELECT ");
    qb.push(columns(entity, request)?.into_iter().map(quote).collect::<Vec<_>>().join(", "));
    qb.push(" FROM ").push(quote(&entity.table));
    push_where(&mut qb, request.filter.as_ref(), None)?;
    push_order(&mut qb, &request.order_by, None);
    push_limit(&mut qb, request.limit, request.offset)?;
    Ok(qb)
}

/// Parents are filtered, ordered and limited in a subquery, then left-joined
/// with their children. Output columns are prefixed `p__` / `c__`.
pub(super) fn select_joined(
    parent: &EntityType,
    child: &EntityType,
    relation: &Relation,
    request: &FetchRequest,
) -> Result<QueryBuilder<'static, Sqlite>> {
    let mut qb = QueryBuilder::new("SELECT ");
    let parent_columns = columns(parent, request)?;
    let mut selected: Vec<String> = Vec::new();
    for name in parent_columns.iter().copied().chain((!parent_columns.contains(&ID)).then_some(ID)) {
        selected.push(format!("{} AS {}", column(Some(PARENT), name), quote(&format!("{PARENT}{SEPARATOR}{name}"))));
    }
    for name in child.columns() {
        selected.push(format!("{} AS {}", column(Some(CHILD), name), quote(&format!("{CHILD}{SEPARATOR}{name}"))));
    }
    qb.push(selected.join(", "));
    qb.push(" FROM (SELECT * FROM ").push(quote(&parent.table));
    push_where(&mut qb, request.filter.as_ref(), None)?;
    push_order(&mut qb, &request.order_by, None);
    push_limit(&mut qb, request.limit, request.offset)?;
    qb.push(") AS ").push(PARENT);
    qb.push(" LEFT JOIN ").push(quote(&child.table)).push(" AS ").push(CHILD);
    qb.push(" ON ").push(column(Some(CHILD), &relation.foreign_key)).push(" = ").push(column(Some(PARENT), ID));
    push_order(&mut qb, &request.order_by, Some(PARENT));
    qb.push(", ").push(column(Some(CHILD), ID)).push(" ASC");
    Ok(qb)
}

pub(super) fn count(entity: &EntityType, related: &EntityType) -> QueryBuilder<'static, Sqlite> {
    let mut qb = QueryBuilder::new("SELECT (SELECT COUNT(*) FROM ");
    qb.push(quote(&entity.table)).push("), (SELECT COUNT(*) FROM ").push(quote(&related.table)).push(")");
    qb
}

pub(super) fn insert(entity: &EntityType, values: &Row) -> Result<QueryBuilder<'static, Sqlite>> {
    values.keys().try_for_each(|c| entity.require_column(c))?;
    let mut qb = QueryBuilder::new("INSERT INTO ");
    qb.push(quote(&entity.table));
    if values.is_empty() {
        qb.push(" DEFAULT VALUES");
        return Ok(qb);
    }
    qb.push(" (").push(values.keys().map(|k| quote(k)).collect::<Vec<_>>().join(", ")).push(") VALUES (");
    for (i, value) in values.values().enumerate() {
        if i > 0 {
            qb.push(", ");
        }
        push_value(&mut qb, value);
    }
    qb.push(")");
    Ok(qb)
}

pub(super) fn update(entity: &EntityType, id: i64, values: &Row) -> Result<QueryBuilder<'static, Sqlite>> {
    if values.contains_key(ID) {
        exn::bail!(ErrorKind::ReadOnlyField(format!("{}.{ID}", entity.name)));
    }
    values.keys().try_for_each(|c| entity.require_column(c))?;
    let mut qb = QueryBuilder::new("UPDATE ");
    qb.push(quote(&entity.table)).push(" SET ");
    for (i, (name, value)) in values.iter().enumerate() {
        if i > 0 {
            qb.push(", ");
        }
        qb.push(quote(name)).push(" = ");
        push_value(&mut qb, value);
    }
    qb.push(" WHERE ").push(quote(ID)).push(" = ");
    qb.push_bind(id);
    Ok(qb)
}

pub(super) fn delete(entity: &EntityType, id: i64) -> QueryBuilder<'static, Sqlite> {
    let mut qb = QueryBuilder::new("DELETE FROM ");
    qb.push(quote(&entity.table)).push(" WHERE ").push(quote(ID)).push(" = ");
    qb.push_bind(id);
    qb
}
