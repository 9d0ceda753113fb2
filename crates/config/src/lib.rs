//! Layered configuration for quarry.
//!
//! Values are resolved in order, later sources winning:
//!
//! 1. Built-in defaults ([`Config::default`]).
//! 2. A configuration file (TOML, YAML or JSON, picked by extension). Either
//!    given explicitly, or `quarry.toml` in the platform config directory if
//!    that file exists.
//! 3. `QUARRY_*` environment variables, with `__` separating nested keys
//!    (`QUARRY_POOL__CAPACITY=16`).
//!
//! The merged result is validated before it is handed out.

pub mod error;

use crate::error::{ErrorKind, Result};
use directories::ProjectDirs;
use exn::{OptionExt, ResultExt};
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use quarry_access::cache::Cache;
use quarry_access::strategy::DEFAULT_SPLIT_THRESHOLD;
use quarry_access::{DEFAULT_ACQUIRE_TIMEOUT, DEFAULT_CAPACITY, PoolOptions};
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_PREFIX: &str = "QUARRY_";
const CONFIG_FILE: &str = "quarry.toml";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub pool: PoolConfig,
    pub cache: CacheConfig,
    pub batching: BatchingConfig,
    pub seed: SeedConfig,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite database file; an in-memory database when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub capacity: usize,
    pub acquire_timeout_ms: u64,
    pub client_evaluation: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY.get(),
            acquire_timeout_ms: DEFAULT_ACQUIRE_TIMEOUT.as_millis() as u64,
            client_evaluation: false,
        }
    }
}

impl PoolConfig {
    pub fn options(&self) -> PoolOptions {
        PoolOptions {
            capacity: NonZeroUsize::new(self.capacity).unwrap_or(DEFAULT_CAPACITY),
            acquire_timeout: Duration::from_millis(self.acquire_timeout_ms),
            client_evaluation: self.client_evaluation,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub shards: usize,
    /// Entries older than this read as misses. No expiry when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl_secs: Option<u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { shards: 16, ttl_secs: None }
    }
}

impl CacheConfig {
    pub fn build(&self) -> Cache {
        Cache::with_options(self.shards.max(1), self.ttl_secs.map(Duration::from_secs))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchingConfig {
    /// Estimated joined rows above which an include is split into two
    /// round-trips.
    pub split_threshold: f64,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self { split_threshold: DEFAULT_SPLIT_THRESHOLD }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeedConfig {
    pub blogs: u64,
    pub posts_per_blog: u64,
}

impl Default for SeedConfig {
    fn default() -> Self {
        Self { blogs: 100, posts_per_blog: 10 }
    }
}

impl Config {
    /// Load configuration from `path` (which must exist), or from the default
    /// location when `path` is `None` (skipped if absent), then the
    /// environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let figment = Figment::from(Serialized::defaults(Config::default()));
        let figment = match path {
            Some(path) => {
                if !path.is_file() {
                    exn::bail!(ErrorKind::Load(format!("no such file: {}", path.display())));
                }
                merge_file(figment, path)?
            },
            None => match default_path() {
                Some(path) if path.is_file() => merge_file(figment, &path)?,
                _ => figment,
            },
        };
        let config: Config = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .or_raise(|| ErrorKind::Load("could not parse configuration".to_string()))?;
        config.validate()?;
        tracing::debug!(?config, "Loaded configuration");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool.capacity == 0 {
            exn::bail!(ErrorKind::Invalid("pool.capacity must be at least 1".to_string()));
        }
        if self.pool.acquire_timeout_ms == 0 {
            exn::bail!(ErrorKind::Invalid("pool.acquire_timeout_ms must be positive".to_string()));
        }
        if self.cache.shards == 0 {
            exn::bail!(ErrorKind::Invalid("cache.shards must be at least 1".to_string()));
        }
        let threshold = self.batching.split_threshold;
        if threshold.is_nan() || threshold <= 0.0 {
            exn::bail!(ErrorKind::Invalid("batching.split_threshold must be positive".to_string()));
        }
        Ok(())
    }
}

/// `quarry.toml` in the platform configuration directory.
pub fn default_path() -> Option<PathBuf> {
    ProjectDirs::from("dev", "quarry", "quarry").map(|dirs| dirs.config_dir().join(CONFIG_FILE))
}

fn merge_file(figment: Figment, path: &Path) -> Result<Figment> {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .ok_or_raise(|| ErrorKind::Load(format!("no file extension: {}", path.display())))?;
    Ok(match extension.to_ascii_lowercase().as_str() {
        "toml" => figment.merge(Toml::file_exact(path)),
        "yaml" | "yml" => figment.merge(Yaml::file_exact(path)),
        "json" => figment.merge(Json::file_exact(path)),
        other => exn::bail!(ErrorKind::Load(format!("unsupported format: {other}"))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;
    use rstest::rstest;
    use tempfile::TempDir;

    // Loading reads the process environment; every test that loads runs
    // inside a `Jail` so environment changes stay serialized.
    fn load(name: &str, contents: &str) -> Result<Config> {
        let mut result = None;
        Jail::expect_with(|jail| {
            jail.create_file(name, contents)?;
            result = Some(Config::load(Some(Path::new(name))));
            Ok(())
        });
        result.unwrap()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.pool.options().capacity, DEFAULT_CAPACITY);
        assert_eq!(config.pool.options().acquire_timeout, DEFAULT_ACQUIRE_TIMEOUT);
        assert!(config.database.path.is_none());
    }

    #[rstest]
    #[case("quarry.toml", "[pool]\ncapacity = 3\n[cache]\nttl_secs = 30\n")]
    #[case("quarry.yaml", "pool:\n  capacity: 3\ncache:\n  ttl_secs: 30\n")]
    #[case("quarry.json", r#"{"pool": {"capacity": 3}, "cache": {"ttl_secs": 30}}"#)]
    fn test_file_formats(#[case] name: &str, #[case] contents: &str) {
        let config = load(name, contents).unwrap();
        assert_eq!(config.pool.capacity, 3);
        assert_eq!(config.cache.ttl_secs, Some(30));
        // Untouched sections keep their defaults.
        assert_eq!(config.seed, SeedConfig::default());
        assert_eq!(config.batching, BatchingConfig::default());
    }

    #[test]
    fn test_environment_overrides_file() {
        Jail::expect_with(|jail| {
            jail.create_file("quarry.toml", "[pool]\ncapacity = 3\nclient_evaluation = false\n")?;
            jail.set_env("QUARRY_POOL__CAPACITY", "12");
            jail.set_env("QUARRY_POOL__CLIENT_EVALUATION", "true");
            jail.set_env("QUARRY_DATABASE__PATH", "bench.db");
            let config = Config::load(Some(Path::new("quarry.toml"))).unwrap();
            assert_eq!(config.pool.capacity, 12);
            assert!(config.pool.client_evaluation);
            assert_eq!(config.database.path, Some(PathBuf::from("bench.db")));
            Ok(())
        });
    }

    #[rstest]
    #[case("[pool]\ncapacity = 0\n", "pool.capacity")]
    #[case("[pool]\nacquire_timeout_ms = 0\n", "acquire_timeout_ms")]
    #[case("[cache]\nshards = 0\n", "cache.shards")]
    #[case("[batching]\nsplit_threshold = 0.0\n", "split_threshold")]
    #[case("[batching]\nsplit_threshold = -5.0\n", "split_threshold")]
    fn test_invalid_values(#[case] contents: &str, #[case] field: &str) {
        let err = load("quarry.toml", contents).unwrap_err();
        match &*err {
            ErrorKind::Invalid(message) => assert!(message.contains(field), "{message}"),
            other => panic!("expected Invalid, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_file() {
        let dir = TempDir::new().unwrap();
        let err = Config::load(Some(&dir.path().join("absent.toml"))).unwrap_err();
        assert!(matches!(&*err, ErrorKind::Load(_)));
    }

    #[rstest]
    #[case("quarry.ini", "capacity=3")]
    #[case("quarry.toml", "[pool\ncapacity = ")]
    #[case("quarry.toml", "[pool]\ncapacity = \"many\"\n")]
    fn test_unreadable_file(#[case] name: &str, #[case] contents: &str) {
        let err = load(name, contents).unwrap_err();
        assert!(matches!(&*err, ErrorKind::Load(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_cache_config_builds_cache() {
        let cache = CacheConfig { shards: 4, ttl_secs: Some(60) }.build();
        assert!(cache.is_empty());
    }
}
