use super::QueryStrategy;
use crate::error::Result;
use crate::scope::SessionScope;
use async_trait::async_trait;
use quarry_store::{QueryDescriptor, ResultSet};

/// Terminal strategy: runs the descriptor as-is, without tracking.
#[derive(Clone, Copy, Debug, Default)]
pub struct Direct;

#[async_trait]
impl QueryStrategy for Direct {
    fn name(&self) -> &'static str {
        "direct"
    }

    async fn execute(&self, scope: &mut SessionScope, query: &QueryDescriptor) -> Result<ResultSet> {
        scope.execute(query).await
    }
}
