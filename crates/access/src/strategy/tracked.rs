use super::QueryStrategy;
use crate::error::Result;
use crate::scope::SessionScope;
use async_trait::async_trait;
use quarry_store::{Entity, QueryDescriptor, ResultSet, Rows};

/// Registers result entities (and their loaded related entities) with the
/// scope's change tracker, so they can be modified and written back.
///
/// Entities the scope already tracks are returned in their tracked state,
/// carrying the related collections this query loaded. Projection rows have
/// no identity and pass through untouched.
#[derive(Clone, Debug)]
pub struct Tracked<S> {
    next: S,
}

impl<S: QueryStrategy> Tracked<S> {
    pub fn new(next: S) -> Self {
        Self { next }
    }
}

fn track(scope: &mut SessionScope, mut entity: Entity) -> Entity {
    let loaded = entity.detach_related();
    let mut entity = scope.tracker_mut().track(entity);
    for (relation, children) in loaded {
        let children = children.into_iter().map(|child| track(scope, child)).collect();
        entity.attach_related(relation, children);
    }
    entity
}

#[async_trait]
impl<S: QueryStrategy> QueryStrategy for Tracked<S> {
    fn name(&self) -> &'static str {
        "tracked"
    }

    async fn execute(&self, scope: &mut SessionScope, query: &QueryDescriptor) -> Result<ResultSet> {
        let result = self.next.execute(scope, query).await?;
        let round_trips = result.round_trips();
        Ok(match result.into_rows() {
            Rows::Entities(entities) => {
                let entities: Vec<Entity> = entities.into_iter().map(|e| track(scope, e)).collect();
                tracing::trace!(tracked = entities.len(), total = scope.tracker().len(), "Tracking entities");
                ResultSet::entities(entities)
            },
            Rows::Projections(rows) => ResultSet::projections(rows),
        }
        .with_round_trips(round_trips))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::testing::seeded;
    use crate::strategy::{Direct, Projected};
    use quarry_store::{EntityKey, Predicate, Value};

    #[tokio::test]
    async fn test_entities_are_tracked() {
        let (_connector, pool) = seeded(3, 2).await;
        let mut scope = pool.acquire().await.unwrap();
        let strategy = Tracked::new(Direct);
        let result = strategy.execute(&mut scope, &QueryDescriptor::new("blog").include("posts")).await.unwrap();
        assert_eq!(result.len(), 3);
        // Three blogs plus their six posts.
        assert_eq!(scope.tracker().len(), 9);
        assert!(scope.tracker().is_tracked(&EntityKey::new("post", 6)));
    }

    #[tokio::test]
    async fn test_identity_map_keeps_local_changes() {
        let (connector, pool) = seeded(2, 0).await;
        let mut scope = pool.acquire().await.unwrap();
        let strategy = Tracked::new(Direct);
        let query = QueryDescriptor::new("blog").filter(Predicate::eq("id", 1));
        strategy.execute(&mut scope, &query).await.unwrap();
        scope.set(&EntityKey::new("blog", 1), "name", "Renamed").unwrap();

        let again = strategy.execute(&mut scope, &query).await.unwrap();
        assert_eq!(again.as_entities()[0].get("name"), Some(&Value::from("Renamed")));
        assert_eq!(connector.round_trips(), 2);

        assert_eq!(scope.save_changes().await.unwrap(), 1);
        let stored = Direct.execute(&mut scope, &query).await.unwrap();
        assert_eq!(stored.as_entities()[0].get("name"), Some(&Value::from("Renamed")));
    }

    #[tokio::test]
    async fn test_include_after_plain_load_keeps_collection() {
        let (_connector, pool) = seeded(2, 3).await;
        let mut scope = pool.acquire().await.unwrap();
        let strategy = Tracked::new(Direct);
        strategy.execute(&mut scope, &QueryDescriptor::new("blog")).await.unwrap();
        scope.set(&EntityKey::new("blog", 1), "name", "Renamed").unwrap();

        let result = strategy.execute(&mut scope, &QueryDescriptor::new("blog").include("posts")).await.unwrap();
        let blogs = result.as_entities();
        assert!(blogs.iter().all(|b| b.related("posts").map(<[_]>::len) == Some(3)));
        assert_eq!(blogs[0].get("name"), Some(&Value::from("Renamed")));
        assert_eq!(scope.tracker().len(), 8);

        // Collections belong to the query that loaded them.
        let plain = strategy.execute(&mut scope, &QueryDescriptor::new("blog")).await.unwrap();
        assert!(plain.as_entities().iter().all(|b| b.related("posts").is_none()));
    }

    #[tokio::test]
    async fn test_direct_does_not_track() {
        let (_connector, pool) = seeded(2, 0).await;
        let mut scope = pool.acquire().await.unwrap();
        Direct.execute(&mut scope, &QueryDescriptor::new("blog")).await.unwrap();
        assert!(scope.tracker().is_empty());
    }

    #[tokio::test]
    async fn test_projections_pass_through() {
        let (_connector, pool) = seeded(2, 0).await;
        let mut scope = pool.acquire().await.unwrap();
        let strategy = Tracked::new(Projected::new(Direct));
        let result = strategy.execute(&mut scope, &QueryDescriptor::new("blog").select(["name"])).await.unwrap();
        assert_eq!(result.as_projections().len(), 2);
        assert!(scope.tracker().is_empty());
    }
}
