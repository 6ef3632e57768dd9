//! Engine configuration.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default number of resolution passes before a reference is unresolvable.
pub const DEFAULT_MAX_RESOLUTION_PASSES: u32 = 5;

/// Default Levenshtein distance under which names are alias candidates.
pub const DEFAULT_ALIAS_DISTANCE: usize = 2;

/// Default word-overlap similarity below which two texts conflict.
pub const DEFAULT_TEXT_CONFLICT_SIMILARITY: f64 = 0.25;

/// Default stale-write retries through the merge handler.
pub const DEFAULT_MAX_STALE_RETRIES: u32 = 3;

/// Default number of concurrently running extraction workers.
pub const DEFAULT_WORKERS: usize = 4;

/// Default SQLite busy timeout.
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Where and how the SQLite store is opened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database file. `None` opens a private in-memory database.
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Busy timeout in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: None,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }
}

const fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}

const fn default_max_resolution_passes() -> u32 {
    DEFAULT_MAX_RESOLUTION_PASSES
}

const fn default_alias_distance() -> usize {
    DEFAULT_ALIAS_DISTANCE
}

const fn default_text_conflict_similarity() -> f64 {
    DEFAULT_TEXT_CONFLICT_SIMILARITY
}

const fn default_max_stale_retries() -> u32 {
    DEFAULT_MAX_STALE_RETRIES
}

const fn default_workers() -> usize {
    DEFAULT_WORKERS
}

/// Configuration for an [`crate::Engine`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Passes without a match before a cross-reference becomes unresolvable.
    #[serde(default = "default_max_resolution_passes")]
    pub max_resolution_passes: u32,

    /// Maximum edit distance for reporting alias candidates.
    #[serde(default = "default_alias_distance")]
    pub alias_distance: usize,

    /// Jaccard similarity below which two free-text values go to review.
    #[serde(default = "default_text_conflict_similarity")]
    pub text_conflict_similarity: f64,

    /// How often a stale write is re-merged before the batch fails.
    #[serde(default = "default_max_stale_retries")]
    pub max_stale_retries: u32,

    /// Extraction workers allowed to run at once.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            max_resolution_passes: DEFAULT_MAX_RESOLUTION_PASSES,
            alias_distance: DEFAULT_ALIAS_DISTANCE,
            text_conflict_similarity: DEFAULT_TEXT_CONFLICT_SIMILARITY,
            max_stale_retries: DEFAULT_MAX_STALE_RETRIES,
            workers: DEFAULT_WORKERS,
        }
    }
}

impl EngineConfig {
    /// Create a configuration backed by an in-memory database.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store data in the given SQLite file.
    pub fn with_database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database.path = Some(path.into());
        self
    }

    /// Set how many passes a reference gets before it is unresolvable.
    pub fn with_max_resolution_passes(mut self, passes: u32) -> Self {
        self.max_resolution_passes = passes;
        self
    }

    /// Set the alias-candidate edit distance.
    pub fn with_alias_distance(mut self, distance: usize) -> Self {
        self.alias_distance = distance;
        self
    }

    /// Set the text-conflict similarity threshold.
    pub fn with_text_conflict_similarity(mut self, similarity: f64) -> Self {
        self.text_conflict_similarity = similarity;
        self
    }

    /// Set the stale-write retry budget.
    pub fn with_max_stale_retries(mut self, retries: u32) -> Self {
        self.max_stale_retries = retries;
        self
    }

    /// Set the number of concurrent extraction workers.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Load a configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `LOREGRAPH_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_env_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from a variable lookup.
    ///
    /// Split out from [`EngineConfig::from_env`] so tests don't mutate the
    /// process environment.
    pub fn with_env_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(path) = lookup("LOREGRAPH_DATABASE") {
            self.database.path = match path.trim() {
                "" | ":memory:" => None,
                path => Some(PathBuf::from(path)),
            };
        }
        if let Some(raw) = lookup("LOREGRAPH_MAX_RESOLUTION_PASSES") {
            self.max_resolution_passes = parse_env("LOREGRAPH_MAX_RESOLUTION_PASSES", &raw)?;
        }
        if let Some(raw) = lookup("LOREGRAPH_WORKERS") {
            self.workers = parse_env("LOREGRAPH_WORKERS", &raw)?;
        }
        self.validate()?;
        Ok(self)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_resolution_passes == 0 {
            return Err(invalid("max_resolution_passes", "must be at least 1"));
        }
        if self.workers == 0 {
            return Err(invalid("workers", "must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.text_conflict_similarity) {
            return Err(invalid(
                "text_conflict_similarity",
                "must be between 0.0 and 1.0",
            ));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| invalid(key, &e.to_string()))
}

fn invalid(key: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_from_empty_json() {
        let config: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert!(config.database.path.is_none());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("LOREGRAPH_DATABASE", "/tmp/lore.db"),
            ("LOREGRAPH_MAX_RESOLUTION_PASSES", "9"),
            ("LOREGRAPH_WORKERS", " 2 "),
        ]
        .into_iter()
        .collect();
        let config = EngineConfig::default()
            .with_env_overrides(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.database.path, Some(PathBuf::from("/tmp/lore.db")));
        assert_eq!(config.max_resolution_passes, 9);
        assert_eq!(config.workers, 2);
    }

    #[test]
    fn test_invalid_env_value() {
        let result = EngineConfig::default().with_env_overrides(|k| {
            (k == "LOREGRAPH_WORKERS").then(|| "lots".to_string())
        });
        assert!(matches!(result, Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_validate_rejects_zero_passes() {
        let config = EngineConfig::new().with_max_resolution_passes(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("loregraph.json");
        std::fs::write(&path, r#"{"workers": 8, "database": {"busy_timeout_ms": 100}}"#).unwrap();
        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.workers, 8);
        assert_eq!(config.database.busy_timeout_ms, 100);
        assert_eq!(config.max_resolution_passes, DEFAULT_MAX_RESOLUTION_PASSES);
    }
}
