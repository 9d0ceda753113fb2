use super::QueryStrategy;
use crate::cache::Cache;
use crate::error::{ErrorKind, Result};
use crate::scope::SessionScope;
use async_trait::async_trait;
use quarry_store::{Entity, QueryDescriptor, ResultSet, Rows};
use std::sync::Arc;

/// Serves repeated descriptors from a shared [`Cache`].
///
/// A hit costs no round-trip. On a miss the fingerprint is locked, the cache
/// checked again (another scope may have filled it meanwhile), and only then
/// is the wrapped strategy run and its result stored. Failures are returned
/// as-is and leave no entry behind.
///
/// Only store state is shared. A result carrying unsaved edits of the
/// scope's tracked entities is returned but not stored, and queries with a
/// client-side filter bypass the cache in scopes that have not enabled
/// client evaluation.
#[derive(Clone)]
pub struct Cached<S> {
    cache: Arc<Cache>,
    next: S,
}

impl<S: QueryStrategy> Cached<S> {
    pub fn new(cache: Arc<Cache>, next: S) -> Self {
        Self { cache, next }
    }

    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }
}

#[async_trait]
impl<S: QueryStrategy> QueryStrategy for Cached<S> {
    fn name(&self) -> &'static str {
        "cached"
    }

    async fn execute(&self, scope: &mut SessionScope, query: &QueryDescriptor) -> Result<ResultSet> {
        if !scope.client_evaluation() && query.predicate().is_some_and(|p| !p.is_translatable()) {
            return self.next.execute(scope, query).await;
        }
        let fingerprint = query.fingerprint();
        if let Some(hit) = self.cache.get(&fingerprint) {
            return Ok(hit);
        }
        let _fill = self.cache.lock(fingerprint).await;
        if let Some(hit) = self.cache.get(&fingerprint) {
            return Ok(hit);
        }
        let touches = query.touches(scope.schema()).map_err(ErrorKind::store)?;
        let epoch = self.cache.epoch();
        let result = self.next.execute(scope, query).await?;
        if let Rows::Entities(entities) = result.rows()
            && has_local_changes(scope, entities)
        {
            tracing::debug!(entity = query.entity(), "Not caching a result with unsaved changes");
            return Ok(result);
        }
        self.cache.put_if_current(fingerprint, touches, result.clone(), epoch);
        Ok(result)
    }
}

fn has_local_changes(scope: &SessionScope, entities: &[Entity]) -> bool {
    entities.iter().any(|entity| {
        scope.tracker().is_modified(entity.key())
            || entity.related_names().any(|r| has_local_changes(scope, entity.related(r).unwrap_or_default()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{ConnectionPool, PoolOptions};
    use crate::strategy::testing::seeded;
    use crate::strategy::{Direct, Projected, Tracked};
    use quarry_store::backend::{Connector, MockConnector};
    use quarry_store::error::ErrorKind as StoreErrorKind;
    use quarry_store::seed::SeedLoader;
    use quarry_store::{EntityKey, Predicate, Value};
    use std::time::Duration;

    #[tokio::test]
    async fn test_second_identical_query_is_free() {
        let (connector, pool) = seeded(5, 2).await;
        let strategy = Cached::new(Arc::new(Cache::new()), Direct);
        let mut scope = pool.acquire().await.unwrap();
        let build = || QueryDescriptor::new("blog").filter(Predicate::ge("rating", 3)).include("posts");
        let first = strategy.execute(&mut scope, &build()).await.unwrap();
        let second = strategy.execute(&mut scope, &build()).await.unwrap();
        assert_eq!(connector.round_trips(), 1);
        assert_eq!(first, second);
        assert_eq!((first.round_trips(), second.round_trips()), (1, 0));
        assert_eq!(strategy.cache().stats().hits, 1);
    }

    #[tokio::test]
    async fn test_hit_served_across_scopes() {
        let (connector, pool) = seeded(3, 0).await;
        let strategy = Cached::new(Arc::new(Cache::new()), Projected::new(Direct));
        let query = QueryDescriptor::new("blog").select(["name"]);
        for _ in 0..3 {
            let mut scope = pool.acquire().await.unwrap();
            strategy.execute(&mut scope, &query).await.unwrap();
        }
        assert_eq!(connector.round_trips(), 1);
    }

    #[tokio::test]
    async fn test_failure_is_not_cached() {
        let (connector, pool) = seeded(1, 0).await;
        let strategy = Cached::new(Arc::new(Cache::new()), Direct);
        let mut scope = pool.acquire().await.unwrap();
        connector.fail_next(StoreErrorKind::Database);
        let err = strategy.execute(&mut scope, &QueryDescriptor::new("blog")).await.unwrap_err();
        assert_eq!(err.store_kind(), Some(&StoreErrorKind::Database));
        assert!(strategy.cache().is_empty());
        assert_eq!(strategy.execute(&mut scope, &QueryDescriptor::new("blog")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unsaved_changes_stay_in_scope() {
        let (_connector, pool) = seeded(2, 0).await;
        let cache = Arc::new(Cache::new());
        let strategy = Cached::new(Arc::clone(&cache), Tracked::new(Direct));
        let query = QueryDescriptor::new("blog").limit(10);
        {
            let mut scope = pool.acquire().await.unwrap();
            Tracked::new(Direct).execute(&mut scope, &QueryDescriptor::new("blog")).await.unwrap();
            scope.set(&EntityKey::new("blog", 1), "name", "Unsaved").unwrap();
            let local = strategy.execute(&mut scope, &query).await.unwrap();
            assert_eq!(local.as_entities()[0].get("name"), Some(&Value::from("Unsaved")));
            assert!(cache.is_empty());
        }
        let mut scope = pool.acquire().await.unwrap();
        let stored = strategy.execute(&mut scope, &query).await.unwrap();
        assert_eq!(stored.as_entities()[0].get("name"), Some(&Value::from("Blog 1")));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_client_filter_hit_needs_client_evaluation() {
        let (connector, pool) = seeded(3, 0).await;
        let strategy = Cached::new(Arc::new(Cache::new()), Direct);
        let query = QueryDescriptor::new("blog").filter(Predicate::client("odd", |row| {
            row.get("id").and_then(Value::as_i64).is_some_and(|id| id % 2 == 1)
        }));
        {
            let mut scope = pool.acquire().await.unwrap();
            scope.set_client_evaluation(true);
            assert_eq!(strategy.execute(&mut scope, &query).await.unwrap().len(), 2);
        }
        let mut scope = pool.acquire().await.unwrap();
        let err = strategy.execute(&mut scope, &query).await.unwrap_err();
        assert_eq!(err.store_kind().map(|k| matches!(k, StoreErrorKind::UntranslatablePredicate(_))), Some(true));
        assert_eq!(connector.round_trips(), 1);
    }

    #[tokio::test]
    async fn test_writes_invalidate() {
        let connector = MockConnector::default();
        let cache = Arc::new(Cache::new());
        let pool = ConnectionPool::with_cache(Arc::new(connector.clone()), PoolOptions::default(), Arc::clone(&cache));
        let strategy = Cached::new(Arc::clone(&cache), Direct);
        let blogs = QueryDescriptor::new("blog");
        let posts = QueryDescriptor::new("post");

        let mut scope = pool.acquire().await.unwrap();
        let id = scope.insert("blog", SeedLoader::blog(1)).await.unwrap();
        assert_eq!(strategy.execute(&mut scope, &blogs).await.unwrap().len(), 1);
        assert!(strategy.execute(&mut scope, &posts).await.unwrap().is_empty());
        assert_eq!(cache.len(), 2);

        scope.insert("post", SeedLoader::post(id, 1)).await.unwrap();
        // Only the post entry touched the written type.
        assert_eq!(cache.len(), 1);
        assert_eq!(strategy.execute(&mut scope, &posts).await.unwrap().len(), 1);
        let blog = strategy.execute(&mut scope, &blogs).await.unwrap();
        assert_eq!(blog.round_trips(), 0);
        assert_eq!(blog.as_entities()[0].get("name"), Some(&Value::from("Blog 1")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_misses_fill_once() {
        let (connector, pool) = seeded(3, 0).await;
        connector.set_latency(Duration::from_millis(20));
        let strategy = Arc::new(Cached::new(Arc::new(Cache::new()), Direct));
        let tasks = (0..4).map(|_| {
            let (pool, strategy) = (pool.clone(), Arc::clone(&strategy));
            tokio::spawn(async move {
                let mut scope = pool.acquire().await.unwrap();
                strategy.execute(&mut scope, &QueryDescriptor::new("blog")).await.unwrap()
            })
        });
        let results = futures::future::join_all(tasks).await;
        assert!(results.iter().all(|r| r.as_ref().is_ok_and(|r| r.len() == 3)));
        assert_eq!(connector.round_trips(), 1);
    }

    #[tokio::test]
    async fn test_fill_across_invalidation_is_dropped() {
        let connector = MockConnector::default().with_latency(Duration::from_millis(30));
        let cache = Arc::new(Cache::new());
        let pool = ConnectionPool::with_cache(Arc::new(connector.clone()), PoolOptions::default(), Arc::clone(&cache));
        {
            let mut session = connector.connect().await.unwrap();
            SeedLoader::new(1, 0).seed(session.as_mut()).await.unwrap();
        }
        let strategy = Cached::new(Arc::clone(&cache), Direct);
        let reader = {
            let pool = pool.clone();
            tokio::spawn(async move {
                let mut scope = pool.acquire().await.unwrap();
                strategy.execute(&mut scope, &QueryDescriptor::new("blog")).await.unwrap()
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        cache.invalidate("blog");
        assert_eq!(reader.await.unwrap().len(), 1);
        assert!(cache.is_empty());
    }
}
