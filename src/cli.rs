use crate::bench::{Bench, Scenario};
use crate::error::{ErrorKind, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use exn::ResultExt;
use quarry_access::ConnectionPool;
use quarry_access::strategy::{Batched, Direct, QueryStrategy, Tracked};
use quarry_config::Config;
use quarry_store::backend::{Connector, ConnectorHandle, SqliteConnector};
use quarry_store::seed::{SeedLoader, SeedSummary};
use quarry_store::{Entity, Predicate, QueryDescriptor, Row, Rows, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "quarry", version, about = "Measure data-access strategies against a seeded SQLite store")]
pub struct Cli {
    /// Configuration file (TOML, YAML or JSON).
    #[arg(short, long, global = true, env = "QUARRY_CONFIG")]
    pub config: Option<PathBuf>,
    /// SQLite database file, overriding the configuration. In-memory when
    /// neither sets one.
    #[arg(long, global = true)]
    pub database: Option<PathBuf>,
    /// More logging: -v info, -vv debug, -vvv trace.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Insert sample blogs and posts.
    Seed(SeedArgs),
    /// Time each scenario's baseline against its optimized variant.
    Bench(BenchArgs),
    /// Run one query and print the rows.
    Query(QueryArgs),
}

#[derive(Args, Debug)]
pub struct SeedArgs {
    #[arg(long)]
    pub blogs: Option<u64>,
    #[arg(long)]
    pub posts_per_blog: Option<u64>,
}

#[derive(Args, Debug)]
pub struct BenchArgs {
    #[arg(short = 'n', long, default_value_t = 50)]
    pub iterations: u32,
    /// Only these scenarios (repeatable); all of them by default.
    #[arg(short, long = "scenario", value_enum)]
    pub scenarios: Vec<Scenario>,
}

#[derive(Args, Debug)]
pub struct QueryArgs {
    /// `blog` or `post`.
    pub entity: String,
    /// Load a related collection, e.g. `posts`.
    #[arg(long)]
    pub include: Option<String>,
    /// Project to these fields (comma separated).
    #[arg(long, value_delimiter = ',')]
    pub select: Vec<String>,
    /// Equality filter `field=value` (repeatable, combined with AND).
    #[arg(long = "where", value_parser = parse_filter)]
    pub filters: Vec<(String, Value)>,
    #[arg(long)]
    pub limit: Option<u64>,
    /// Register loaded entities with the scope's change tracker.
    #[arg(long)]
    pub tracked: bool,
}

impl QueryArgs {
    pub fn descriptor(&self) -> QueryDescriptor {
        let mut query = QueryDescriptor::new(&self.entity);
        for (field, value) in &self.filters {
            query = query.filter(Predicate::eq(field, value.clone()));
        }
        if !self.select.is_empty() {
            query = query.select(&self.select);
        }
        if let Some(relation) = &self.include {
            query = query.include(relation);
        }
        if let Some(limit) = self.limit {
            query = query.limit(limit);
        }
        query
    }
}

/// `field=value`, with integers, booleans and `null` recognized and
/// everything else taken as text.
fn parse_filter(raw: &str) -> std::result::Result<(String, Value), String> {
    let (field, value) = raw.split_once('=').ok_or_else(|| format!("expected field=value, got {raw:?}"))?;
    let value = match value {
        "null" => Value::Null,
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        other => other.parse::<i64>().map_or_else(|_| Value::from(other), Value::Integer),
    };
    Ok((field.trim().to_string(), value))
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        let mut config = Config::load(self.config.as_deref()).or_raise(|| ErrorKind::Config)?;
        if let Some(path) = self.database {
            config.database.path = Some(path);
        }
        let connector = Arc::new(open(&config).await?);
        let handle: ConnectorHandle = connector.clone();
        let result = match self.command {
            Command::Seed(args) => seed(&handle, &config, args).await,
            Command::Bench(args) => bench(handle, &config, args).await,
            Command::Query(args) => query(handle, &config, args).await,
        };
        connector.close().await;
        result
    }
}

async fn open(config: &Config) -> Result<SqliteConnector> {
    let connector = match &config.database.path {
        Some(path) => SqliteConnector::open(path).await,
        None => SqliteConnector::in_memory().await,
    };
    connector.or_raise(|| ErrorKind::Setup)
}

/// Seed the store unless it already holds blogs.
async fn ensure_seeded(connector: &ConnectorHandle, loader: SeedLoader) -> Result<Option<SeedSummary>> {
    let mut session = connector.connect().await.or_raise(|| ErrorKind::Setup)?;
    let existing = session.cardinality("blog", "posts").await.or_raise(|| ErrorKind::Setup)?;
    if existing.parents > 0 {
        tracing::debug!(blogs = existing.parents, posts = existing.children, "Store already seeded");
        return Ok(None);
    }
    let summary = loader.seed(session.as_mut()).await.or_raise(|| ErrorKind::Setup)?;
    Ok(Some(summary))
}

fn loader(config: &Config) -> SeedLoader {
    SeedLoader::new(config.seed.blogs, config.seed.posts_per_blog)
}

async fn seed(connector: &ConnectorHandle, config: &Config, args: SeedArgs) -> Result<()> {
    let loader = SeedLoader::new(
        args.blogs.unwrap_or(config.seed.blogs),
        args.posts_per_blog.unwrap_or(config.seed.posts_per_blog),
    );
    let mut session = connector.connect().await.or_raise(|| ErrorKind::Setup)?;
    let summary = loader.seed(session.as_mut()).await.or_raise(|| ErrorKind::Setup)?;
    println!("Inserted {} blogs and {} posts", summary.blogs, summary.posts);
    Ok(())
}

async fn bench(connector: ConnectorHandle, config: &Config, args: BenchArgs) -> Result<()> {
    ensure_seeded(&connector, loader(config)).await?;
    let token = CancellationToken::new();
    let interrupt = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });
    let scenarios = if args.scenarios.is_empty() { Scenario::ALL.to_vec() } else { args.scenarios };
    let bench = Bench::new(connector, config.pool.options(), Arc::new(config.cache.build()), args.iterations)
        .with_split_threshold(config.batching.split_threshold)
        .with_token(token);
    println!("{:<11} {:<11} {:>12} {:>8} {:>7}", "scenario", "variant", "mean", "trips", "rows");
    for scenario in scenarios {
        for measurement in bench.run(scenario).await? {
            println!("{measurement}");
        }
    }
    let stats = bench.pool().stats();
    tracing::info!(opened = stats.opened, discarded = stats.discarded, "Pool totals");
    Ok(())
}

async fn query(connector: ConnectorHandle, config: &Config, args: QueryArgs) -> Result<()> {
    ensure_seeded(&connector, loader(config)).await?;
    let pool = ConnectionPool::new(connector, config.pool.options());
    let batched = Batched::new(Direct, config.batching.split_threshold);
    let tracked = Tracked::new(batched.clone());
    let strategy: &dyn QueryStrategy = if args.tracked { &tracked } else { &batched };
    let descriptor = args.descriptor();
    let mut scope = pool.acquire().await.or_raise(|| ErrorKind::Query)?;
    let result = strategy.execute(&mut scope, &descriptor).await.or_raise(|| ErrorKind::Query)?;
    match result.rows() {
        Rows::Entities(entities) => entities.iter().for_each(|entity| print_entity(entity, 0)),
        Rows::Projections(rows) => rows.iter().for_each(|row| println!("{}", fields(row.fields()))),
    }
    println!("({} rows, {} round-trips)", result.len(), result.round_trips());
    if args.tracked {
        println!("({} entities tracked)", scope.tracker().len());
    }
    Ok(())
}

fn print_entity(entity: &Entity, depth: usize) {
    println!("{:indent$}{} {}", "", entity.key(), fields(entity.fields()), indent = depth * 2);
    for relation in entity.related_names() {
        for child in entity.related(relation).unwrap_or_default() {
            print_entity(child, depth + 1);
        }
    }
}

fn fields(row: &Row) -> String {
    row.iter().map(|(name, value)| format!("{name}={value}")).collect::<Vec<_>>().join(" ")
}
