use super::QueryStrategy;
use crate::error::{ErrorKind, Result};
use crate::scope::SessionScope;
use async_trait::async_trait;
use quarry_store::{ID, Projection, QueryDescriptor, ResultSet};

/// Fetches only the fields a descriptor names and returns projection rows.
///
/// Refuses descriptors that would gain nothing from projecting: no field
/// list, a field list covering the whole entity, or an included relation.
#[derive(Clone, Debug)]
pub struct Projected<S> {
    next: S,
}

impl<S: QueryStrategy> Projected<S> {
    pub fn new(next: S) -> Self {
        Self { next }
    }
}

#[async_trait]
impl<S: QueryStrategy> QueryStrategy for Projected<S> {
    fn name(&self) -> &'static str {
        "projected"
    }

    async fn execute(&self, scope: &mut SessionScope, query: &QueryDescriptor) -> Result<ResultSet> {
        let entity = scope.schema().entity(query.entity()).map_err(ErrorKind::store)?;
        let Projection::Fields(fields) = query.projection() else {
            exn::bail!(ErrorKind::InvalidProjection(format!("{}: no fields selected", entity.name)));
        };
        if fields.is_empty() {
            exn::bail!(ErrorKind::InvalidProjection(format!("{}: no fields selected", entity.name)));
        }
        fields.iter().try_for_each(|f| entity.require_column(f)).map_err(ErrorKind::store)?;
        if entity.columns().filter(|c| *c != ID).all(|c| fields.iter().any(|f| f == c)) {
            exn::bail!(ErrorKind::InvalidProjection(format!("{}: every field selected", entity.name)));
        }
        if let Some(relation) = query.included() {
            exn::bail!(ErrorKind::InvalidProjection(format!("{}: cannot include {relation}", entity.name)));
        }
        self.next.execute(scope, query).await
    }
}
