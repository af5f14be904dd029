//! Process configuration
//!
//! Loaded from `CONVEYOR_*` environment variables (with `.env` support
//! via dotenvy). Unset or unparsable values fall back to defaults.

use std::path::PathBuf;

/// Recognized configuration options.
#[derive(Debug, Clone)]
pub struct Config {
    /// `memory` or a `postgresql://...` URL. Anything unreachable or
    /// unrecognized falls back to the embedded in-memory store.
    pub database_url: String,

    /// Base path for relative file storage used by handlers
    pub data_dir: PathBuf,

    /// Create/migrate core tables on startup
    pub init_schema: bool,

    /// Queue lane for unclassified work
    pub default_lane: String,

    /// Executor pool size
    pub max_concurrency: usize,

    /// Default TTL for concurrency-guard leases
    pub lease_ttl_seconds: u64,

    pub scheduler_tick_seconds: u64,

    /// Default misfire grace for new schedules
    pub misfire_grace_seconds: u64,

    /// Default retry budget for submissions that don't specify one
    pub dlq_max_retries: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "memory".to_string(),
            data_dir: PathBuf::from("./data"),
            init_schema: true,
            default_lane: "default".to_string(),
            max_concurrency: 8,
            lease_ttl_seconds: 1800,
            scheduler_tick_seconds: 5,
            misfire_grace_seconds: 300,
            dlq_max_retries: 0,
        }
    }
}

impl Config {
    /// Load from the environment, falling back to defaults per field.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        Self {
            database_url: var("CONVEYOR_DATABASE_URL").unwrap_or(defaults.database_url),
            data_dir: var("CONVEYOR_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            init_schema: parsed("CONVEYOR_INIT_SCHEMA", defaults.init_schema),
            default_lane: var("CONVEYOR_DEFAULT_LANE").unwrap_or(defaults.default_lane),
            max_concurrency: parsed("CONVEYOR_MAX_CONCURRENCY", defaults.max_concurrency),
            lease_ttl_seconds: parsed(
                "CONVEYOR_LEASE_TTL_SECONDS",
                defaults.lease_ttl_seconds,
            ),
            scheduler_tick_seconds: parsed(
                "CONVEYOR_SCHEDULER_TICK_SECONDS",
                defaults.scheduler_tick_seconds,
            ),
            misfire_grace_seconds: parsed(
                "CONVEYOR_MISFIRE_GRACE_SECONDS",
                defaults.misfire_grace_seconds,
            ),
            dlq_max_retries: parsed("CONVEYOR_DLQ_MAX_RETRIES", defaults.dlq_max_retries),
        }
    }
}

fn var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn parsed<T: std::str::FromStr>(name: &str, default: T) -> T {
    var(name).and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.database_url, "memory");
        assert_eq!(config.default_lane, "default");
        assert_eq!(config.max_concurrency, 8);
        assert!(config.init_schema);
    }
}
