use super::QueryStrategy;
use crate::error::Result;
use crate::scope::SessionScope;
use async_trait::async_trait;
use quarry_store::{FetchMode, QueryDescriptor, ResultSet};

/// Estimated joined rows above which a split fetch is preferred.
pub const DEFAULT_SPLIT_THRESHOLD: f64 = 1_000.0;

/// Chooses between a joined and a split fetch for descriptors that include a
/// related collection.
///
/// A joined fetch repeats every parent row once per child. When the estimated
/// number of joined rows (parents × average children, from store row counts)
/// exceeds the threshold, the descriptor is run as two round-trips instead:
/// parents, then children by parent identifier. Descriptors without an
/// include pass through unchanged.
#[derive(Clone, Debug)]
pub struct Batched<S> {
    next: S,
    threshold: f64,
}

impl<S: QueryStrategy> Batched<S> {
    pub fn new(next: S, threshold: f64) -> Self {
        Self { next, threshold }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Fetch mode this strategy would use for `query`.
    pub async fn plan(&self, scope: &mut SessionScope, query: &QueryDescriptor) -> Result<FetchMode> {
        let Some(relation) = query.included() else {
            return Ok(query.mode());
        };
        let stats = scope.cardinality(query.entity(), relation).await?;
        // The filter is not considered; a limit caps the parent count.
        let parents = query.limit_value().map_or(stats.parents, |limit| stats.parents.min(limit));
        let estimate = stats.estimated_join_rows(parents);
        let mode = if estimate > self.threshold { FetchMode::Split } else { FetchMode::Joined };
        tracing::debug!(entity = query.entity(), relation, estimate, threshold = self.threshold, ?mode, "Planned include fetch");
        Ok(mode)
    }
}

#[async_trait]
impl<S: QueryStrategy> QueryStrategy for Batched<S> {
    fn name(&self) -> &'static str {
        "batched"
    }

    async fn execute(&self, scope: &mut SessionScope, query: &QueryDescriptor) -> Result<ResultSet> {
        if query.included().is_none() {
            return self.next.execute(scope, query).await;
        }
        let mode = self.plan(scope, query).await?;
        let planned = query.clone().fetch_mode(mode);
        self.next.execute(scope, &planned).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::Direct;
    use crate::strategy::testing::seeded;
    use rstest::rstest;

    #[rstest]
    // 10 blogs × 20 posts: an estimated 200 joined rows.
    #[case::over_threshold(100.0, 2, FetchMode::Split)]
    #[case::under_threshold(500.0, 1, FetchMode::Joined)]
    #[tokio::test]
    async fn test_round_trips_follow_estimate(
        #[case] threshold: f64,
        #[case] expected_round_trips: u64,
        #[case] expected_mode: FetchMode,
    ) {
        let (connector, pool) = seeded(10, 20).await;
        let mut scope = pool.acquire().await.unwrap();
        let strategy = Batched::new(Direct, threshold);
        let query = QueryDescriptor::new("blog").include("posts");
        assert_eq!(strategy.plan(&mut scope, &query).await.unwrap(), expected_mode);
        let result = strategy.execute(&mut scope, &query).await.unwrap();
        assert_eq!(connector.round_trips(), expected_round_trips);
        assert_eq!(result.len(), 10);
        assert!(result.as_entities().iter().all(|b| b.related("posts").map(<[_]>::len) == Some(20)));
    }

    #[tokio::test]
    async fn test_limit_caps_estimate() {
        let (_connector, pool) = seeded(10, 20).await;
        let mut scope = pool.acquire().await.unwrap();
        let strategy = Batched::new(Direct, 100.0);
        let query = QueryDescriptor::new("blog").include("posts").limit(2);
        assert_eq!(strategy.plan(&mut scope, &query).await.unwrap(), FetchMode::Joined);
    }

    #[tokio::test]
    async fn test_without_include_passes_through() {
        let (connector, pool) = seeded(3, 5).await;
        let mut scope = pool.acquire().await.unwrap();
        let result = Batched::new(Direct, 0.0).execute(&mut scope, &QueryDescriptor::new("post")).await.unwrap();
        assert_eq!(result.len(), 15);
        assert_eq!(connector.round_trips(), 1);
    }
}
