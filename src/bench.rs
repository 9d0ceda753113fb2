//! Paired measurements of the access strategies.
//!
//! Every [`Scenario`] runs the same logical query twice over: once the
//! straightforward way and once with the optimization it is named after.
//! Each iteration acquires its own scope, so per-scope state (tracked
//! entities, the session itself) never carries over between iterations.

use crate::error::{ErrorKind, Result};
use clap::ValueEnum;
use derive_more::Display;
use exn::ResultExt;
use quarry_access::error::Result as AccessResult;
use quarry_access::strategy::{Batched, Cached, Direct, Projected, QueryStrategy, Tracked};
use quarry_access::{Cache, ConnectionPool, PoolOptions};
use quarry_store::backend::ConnectorHandle;
use quarry_store::{Predicate, QueryDescriptor, ResultSet, Value};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// Posts with at least this many views pass the filtering scenario.
const POPULAR_VIEWS: i64 = 250;

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash, ValueEnum)]
pub enum Scenario {
    /// Tracked entities against plain materialization.
    #[display("tracking")]
    Tracking,
    /// A fresh session per query against pooled sessions.
    #[display("pooling")]
    Pooling,
    /// Whole entities against a two-field projection.
    #[display("projection")]
    Projection,
    /// One joined round-trip against parents-then-children.
    #[display("splitting")]
    Splitting,
    /// Every query hitting the store against the result cache.
    #[display("caching")]
    Caching,
    /// Filtering rows in process against a translated predicate.
    #[display("filtering")]
    Filtering,
}

impl Scenario {
    pub const ALL: [Scenario; 6] = [
        Scenario::Tracking,
        Scenario::Pooling,
        Scenario::Projection,
        Scenario::Splitting,
        Scenario::Caching,
        Scenario::Filtering,
    ];
}

/// Timing of one variant of one scenario.
#[derive(Clone, Debug, PartialEq)]
pub struct Measurement {
    pub scenario: Scenario,
    pub variant: &'static str,
    pub iterations: u32,
    pub elapsed: Duration,
    /// Store round-trips over all iterations.
    pub round_trips: u64,
    /// Rows returned by the last iteration.
    pub rows: usize,
}

impl Measurement {
    pub fn mean(&self) -> Duration {
        self.elapsed / self.iterations.max(1)
    }

    pub fn round_trips_per_iteration(&self) -> f64 {
        self.round_trips as f64 / f64::from(self.iterations.max(1))
    }
}

impl fmt::Display for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<11} {:<11} {:>12} {:>8.2} {:>7}",
            self.scenario.to_string(),
            self.variant,
            format!("{:.1?}", self.mean()),
            self.round_trips_per_iteration(),
            self.rows,
        )
    }
}

pub struct Bench {
    connector: ConnectorHandle,
    options: PoolOptions,
    pool: ConnectionPool,
    cache: Arc<Cache>,
    split_threshold: f64,
    iterations: u32,
    token: CancellationToken,
}

impl Bench {
    pub fn new(connector: ConnectorHandle, options: PoolOptions, cache: Arc<Cache>, iterations: u32) -> Self {
        let pool = ConnectionPool::with_cache(Arc::clone(&connector), options, Arc::clone(&cache));
        Self {
            connector,
            options,
            pool,
            cache,
            split_threshold: quarry_access::strategy::DEFAULT_SPLIT_THRESHOLD,
            iterations: iterations.max(1),
            token: CancellationToken::new(),
        }
    }

    /// Threshold of the batched strategy in the splitting scenario's
    /// optimized variant.
    pub fn with_split_threshold(mut self, threshold: f64) -> Self {
        self.split_threshold = threshold;
        self
    }

    /// Stop at the next store round-trip once `token` fires.
    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Run both variants of `scenario`, baseline first.
    #[instrument("running benchmark", skip(self), fields(iterations = self.iterations))]
    pub async fn run(&self, scenario: Scenario) -> Result<[Measurement; 2]> {
        let measurements = match scenario {
            Scenario::Tracking => self.tracking().await,
            Scenario::Pooling => self.pooling().await,
            Scenario::Projection => self.projection().await,
            Scenario::Splitting => self.splitting().await,
            Scenario::Caching => self.caching().await,
            Scenario::Filtering => self.filtering().await,
        };
        let measurements = measurements.or_raise(|| ErrorKind::Bench(scenario.to_string()))?;
        for m in &measurements {
            tracing::info!(%scenario, variant = m.variant, mean = ?m.mean(), round_trips = m.round_trips, "Measured");
        }
        Ok(measurements)
    }

    async fn tracking(&self) -> AccessResult<[Measurement; 2]> {
        let query = QueryDescriptor::new("post");
        let tracked = Tracked::new(Direct);
        Ok([
            self.measure(Scenario::Tracking, "tracked", async || self.once(&self.pool, &tracked, &query).await).await?,
            self.measure(Scenario::Tracking, "untracked", async || self.once(&self.pool, &Direct, &query).await).await?,
        ])
    }

    async fn pooling(&self) -> AccessResult<[Measurement; 2]> {
        let query = QueryDescriptor::new("blog").filter(Predicate::eq("id", 1));
        let unpooled = self
            .measure(Scenario::Pooling, "unpooled", async || {
                // A pool of its own per query: every iteration opens a session.
                let pool = ConnectionPool::new(Arc::clone(&self.connector), self.options);
                let result = self.once(&pool, &Direct, &query).await;
                pool.close();
                result
            })
            .await?;
        let pooled = self.measure(Scenario::Pooling, "pooled", async || self.once(&self.pool, &Direct, &query).await).await?;
        Ok([unpooled, pooled])
    }

    async fn projection(&self) -> AccessResult<[Measurement; 2]> {
        let full = QueryDescriptor::new("post");
        let narrow = QueryDescriptor::new("post").select(["title", "views"]);
        let projected = Projected::new(Direct);
        Ok([
            self.measure(Scenario::Projection, "full", async || self.once(&self.pool, &Direct, &full).await).await?,
            self.measure(Scenario::Projection, "projected", async || self.once(&self.pool, &projected, &narrow).await)
                .await?,
        ])
    }

    async fn splitting(&self) -> AccessResult<[Measurement; 2]> {
        let query = QueryDescriptor::new("blog").include("posts");
        // Never over an infinite threshold, so always joined.
        let joined = Batched::new(Direct, f64::INFINITY);
        let split = Batched::new(Direct, self.split_threshold);
        Ok([
            self.measure(Scenario::Splitting, "joined", async || self.once(&self.pool, &joined, &query).await).await?,
            self.measure(Scenario::Splitting, "batched", async || self.once(&self.pool, &split, &query).await).await?,
        ])
    }

    async fn caching(&self) -> AccessResult<[Measurement; 2]> {
        let query = QueryDescriptor::new("blog").filter(Predicate::ge("rating", 3)).include("posts");
        self.cache.clear();
        let cached = Cached::new(Arc::clone(&self.cache), Direct);
        Ok([
            self.measure(Scenario::Caching, "uncached", async || self.once(&self.pool, &Direct, &query).await).await?,
            self.measure(Scenario::Caching, "cached", async || self.once(&self.pool, &cached, &query).await).await?,
        ])
    }

    async fn filtering(&self) -> AccessResult<[Measurement; 2]> {
        let client = QueryDescriptor::new("post").filter(Predicate::client("popular", |row| {
            row.get("views").and_then(Value::as_i64).is_some_and(|views| views >= POPULAR_VIEWS)
        }));
        let server = QueryDescriptor::new("post").filter(Predicate::ge("views", POPULAR_VIEWS));
        let in_process = self
            .measure(Scenario::Filtering, "client", async || {
                let mut scope = self.pool.acquire_with(&self.token).await?;
                scope.set_client_evaluation(true);
                scope.execute_via(&Direct, &client, &self.token).await
            })
            .await?;
        let translated =
            self.measure(Scenario::Filtering, "server", async || self.once(&self.pool, &Direct, &server).await).await?;
        Ok([in_process, translated])
    }

    async fn once(
        &self,
        pool: &ConnectionPool,
        strategy: &dyn QueryStrategy,
        query: &QueryDescriptor,
    ) -> AccessResult<ResultSet> {
        let mut scope = pool.acquire_with(&self.token).await?;
        scope.execute_via(strategy, query, &self.token).await
    }

    async fn measure(
        &self,
        scenario: Scenario,
        variant: &'static str,
        mut run: impl AsyncFnMut() -> AccessResult<ResultSet>,
    ) -> AccessResult<Measurement> {
        let mut round_trips = 0;
        let mut rows = 0;
        let started = Instant::now();
        for _ in 0..self.iterations {
            let result = run().await?;
            round_trips += u64::from(result.round_trips());
            rows = result.len();
        }
        Ok(Measurement { scenario, variant, iterations: self.iterations, elapsed: started.elapsed(), round_trips, rows })
    }
}
