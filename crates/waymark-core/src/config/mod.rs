//! Configuration system for waymark.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use backon::ExponentialBuilder;
use serde::{Deserialize, Serialize};

use crate::error::{WaymarkError, WaymarkResult};

/// Retry policy of the optimistic diff engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiffConfig {
    /// Wall-clock window for all attempts of one submission (milliseconds).
    pub retry_timeout_ms: u64,
    /// Initial delay before the first retry (milliseconds).
    pub initial_delay_ms: u64,
    /// Maximum delay between retries (milliseconds).
    pub max_delay_ms: u64,
    /// Multiplier for exponential backoff.
    pub multiplier: f32,
    /// Upper bound on retries inside the window.
    pub max_attempts: usize,
}

impl Default for DiffConfig {
    fn default() -> Self {
        Self {
            retry_timeout_ms: 30_000,
            initial_delay_ms: 10,
            max_delay_ms: 1_000,
            multiplier: 2.0,
            max_attempts: 64,
        }
    }
}

impl DiffConfig {
    pub fn retry_timeout(&self) -> Duration {
        Duration::from_millis(self.retry_timeout_ms)
    }

    /// Backoff schedule between attempts.
    pub fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_max_times(self.max_attempts)
            .with_min_delay(Duration::from_millis(self.initial_delay_ms))
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
            .with_factor(self.multiplier)
            .with_jitter()
    }
}

/// Size limits enforced on written elements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ElementLimits {
    pub max_tags: usize,
    pub max_tag_key_length: usize,
    /// Sum of key and value bytes over all tags.
    pub max_tags_size: usize,
    pub max_way_members: usize,
    pub max_relation_members: usize,
}

impl Default for ElementLimits {
    fn default() -> Self {
        Self {
            max_tags: 600,
            max_tag_key_length: 63,
            max_tags_size: 64 * 1024,
            max_way_members: 2_000,
            max_relation_members: 32_000,
        }
    }
}

/// Main engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// SQLite database file. `None` keeps everything in memory.
    pub database_path: Option<PathBuf>,
    /// How long SQLite waits on a locked database before reporting busy.
    pub busy_timeout_ms: u64,
    /// Read-only connections serving reads beside the single writer.
    /// Zero routes reads through the writer. In-memory stores always do.
    pub read_connections: usize,
    /// Versions per history page.
    pub history_page_size: usize,
    /// Diff engine retry policy.
    pub diff: DiffConfig,
    /// Element size limits.
    pub limits: ElementLimits,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let waymark_dir = dirs::home_dir()
            .map(|h| h.join(".waymark"))
            .unwrap_or_else(|| PathBuf::from(".waymark"));

        Self {
            database_path: Some(waymark_dir.join("waymark.db")),
            busy_timeout_ms: 5_000,
            read_connections: 4,
            history_page_size: 10,
            diff: DiffConfig::default(),
            limits: ElementLimits::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a file (TOML, JSON, or YAML).
    pub fn from_file(path: impl AsRef<std::path::Path>) -> WaymarkResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let ext = path.as_ref().extension().and_then(|e| e.to_str());

        let config: Self = match ext {
            Some("toml") => {
                toml::from_str(&content).map_err(|e| WaymarkError::Configuration(e.to_string()))?
            }
            Some("json") => serde_json::from_str(&content)
                .map_err(|e| WaymarkError::Configuration(e.to_string()))?,
            Some("yaml" | "yml") => serde_yaml::from_str(&content)
                .map_err(|e| WaymarkError::Configuration(e.to_string()))?,
            _ => {
                return Err(WaymarkError::Configuration(
                    "Unsupported config file format. Use .toml, .json, or .yaml".to_string(),
                ))
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from `WAYMARK_*` environment variables.
    pub fn from_env() -> WaymarkResult<Self> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("WAYMARK_DATABASE_PATH") {
            config.database_path = match path.as_str() {
                "" | ":memory:" => None,
                _ => Some(PathBuf::from(path)),
            };
        }
        if let Some(ms) = env_number("WAYMARK_BUSY_TIMEOUT_MS")? {
            config.busy_timeout_ms = ms;
        }
        if let Some(count) = env_number("WAYMARK_READ_CONNECTIONS")? {
            config.read_connections = count;
        }
        if let Some(size) = env_number("WAYMARK_HISTORY_PAGE_SIZE")? {
            config.history_page_size = size;
        }
        if let Some(ms) = env_number("WAYMARK_DIFF_RETRY_TIMEOUT_MS")? {
            config.diff.retry_timeout_ms = ms;
        }

        config.validate()?;
        Ok(config)
    }

    /// Build configuration using builder pattern.
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> WaymarkResult<()> {
        if self.history_page_size == 0 {
            return Err(WaymarkError::Configuration(
                "history_page_size must be positive".to_string(),
            ));
        }
        if self.diff.multiplier < 1.0 {
            return Err(WaymarkError::Configuration(
                "diff.multiplier must be at least 1.0".to_string(),
            ));
        }
        if self.diff.retry_timeout_ms == 0 {
            return Err(WaymarkError::Configuration(
                "diff.retry_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

fn env_number<T: FromStr>(name: &str) -> WaymarkResult<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| WaymarkError::Configuration(format!("{} is not a number: {}", name, raw))),
        Err(_) => Ok(None),
    }
}

/// Builder for EngineConfig.
#[derive(Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    /// Set the database file.
    pub fn database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.database_path = Some(path.into());
        self
    }

    /// Keep the database in memory.
    pub fn in_memory(mut self) -> Self {
        self.config.database_path = None;
        self
    }

    /// Set the SQLite busy timeout.
    pub fn busy_timeout_ms(mut self, ms: u64) -> Self {
        self.config.busy_timeout_ms = ms;
        self
    }

    /// Set the number of read-only connections.
    pub fn read_connections(mut self, count: usize) -> Self {
        self.config.read_connections = count;
        self
    }

    /// Set versions per history page.
    pub fn history_page_size(mut self, size: usize) -> Self {
        self.config.history_page_size = size;
        self
    }

    /// Set the diff retry policy.
    pub fn diff(mut self, diff: DiffConfig) -> Self {
        self.config.diff = diff;
        self
    }

    /// Set the diff retry window.
    pub fn retry_timeout_ms(mut self, ms: u64) -> Self {
        self.config.diff.retry_timeout_ms = ms;
        self
    }

    /// Set element size limits.
    pub fn limits(mut self, limits: ElementLimits) -> Self {
        self.config.limits = limits;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> EngineConfig {
        self.config
    }
}
