//! Configuration loader and validator for the Notion mirror.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::model::{Backoff, JobKind, RetryPolicy};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub notion: Notion,
    #[serde(default)]
    pub sync: SyncPolicy,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub poll_interval_ms: u64,
    pub max_backoff_seconds: u64,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_seconds: u64,
}

/// Notion API settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Notion {
    pub token: String,
    pub version: String,
    /// Restrict the mirror to one database instead of every shared page.
    #[serde(default)]
    pub database_id: Option<String>,
    /// Page property that holds the free-form category tag.
    #[serde(default = "default_type_property")]
    pub type_property: String,
}

/// Retry, delay and fan-out knobs for the pipeline stages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SyncPolicy {
    pub fetch_attempts: i32,
    pub fetch_backoff_seconds: i64,
    pub check_attempts: i32,
    pub check_delay_seconds: i64,
    /// Head start given to fan-out jobs before the first completion check.
    pub check_initial_delay_seconds: i64,
    pub aggregate_attempts: i32,
    pub aggregate_delay_seconds: i64,
    pub max_depth: u32,
    pub max_fanout: usize,
    pub max_backoff_seconds: i64,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            fetch_attempts: 10,
            fetch_backoff_seconds: 2,
            check_attempts: 3,
            check_delay_seconds: 1,
            check_initial_delay_seconds: 5,
            aggregate_attempts: 3,
            aggregate_delay_seconds: 1,
            max_depth: 32,
            max_fanout: 500,
            max_backoff_seconds: 300,
        }
    }
}

impl SyncPolicy {
    /// Retry policy for a queue kind. Intents ride the fetch policy.
    pub fn retry_policy(&self, kind: JobKind) -> RetryPolicy {
        match kind {
            JobKind::CreateContent
            | JobKind::UpdateContent
            | JobKind::DeleteContent
            | JobKind::FetchBlock => RetryPolicy {
                max_attempts: self.fetch_attempts,
                backoff: Backoff::Exponential {
                    base_secs: self.fetch_backoff_seconds,
                },
            },
            JobKind::CheckCompletion => RetryPolicy {
                max_attempts: self.check_attempts,
                backoff: Backoff::Fixed {
                    secs: self.check_delay_seconds,
                },
            },
            JobKind::Aggregate => RetryPolicy {
                max_attempts: self.aggregate_attempts,
                backoff: Backoff::Fixed {
                    secs: self.aggregate_delay_seconds,
                },
            },
        }
    }
}

fn default_workers() -> usize {
    4
}

fn default_reconcile_interval() -> u64 {
    300
}

fn default_type_property() -> String {
    "Type".to_string()
}

impl App {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_seconds)
    }

    /// Data directory with a leading `~/` expanded.
    pub fn resolved_data_dir(&self) -> String {
        match self.data_dir.strip_prefix("~/") {
            Some(rest) => match std::env::var("HOME") {
                Ok(home) => format!("{}/{}", home.trim_end_matches('/'), rest),
                Err(_) => self.data_dir.clone(),
            },
            None => self.data_dir.clone(),
        }
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(self.app.resolved_data_dir())
    }

    /// `DATABASE_URL` wins; otherwise a SQLite file under the data dir.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}/mirror.db", self.app.resolved_data_dir()))
    }

    /// The pipeline policy with the app-wide backoff cap applied.
    pub fn sync_policy(&self) -> SyncPolicy {
        SyncPolicy {
            max_backoff_seconds: self.app.max_backoff_seconds as i64,
            ..self.sync.clone()
        }
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.poll_interval_ms must be > 0"));
    }
    if cfg.app.workers == 0 {
        return Err(ConfigError::Invalid("app.workers must be > 0"));
    }
    if cfg.app.reconcile_interval_seconds == 0 {
        return Err(ConfigError::Invalid(
            "app.reconcile_interval_seconds must be > 0",
        ));
    }

    if cfg.notion.token.trim().is_empty() {
        return Err(ConfigError::Invalid("notion.token must be non-empty"));
    }
    if cfg.notion.version.trim().is_empty() {
        return Err(ConfigError::Invalid("notion.version must be non-empty"));
    }
    if let Some(db) = &cfg.notion.database_id {
        if db.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "notion.database_id must be non-empty when set",
            ));
        }
    }
    if cfg.notion.type_property.trim().is_empty() {
        return Err(ConfigError::Invalid("notion.type_property must be non-empty"));
    }

    let s = &cfg.sync;
    if s.fetch_attempts < 1 || s.check_attempts < 1 || s.aggregate_attempts < 1 {
        return Err(ConfigError::Invalid("sync.*_attempts must be >= 1"));
    }
    if s.fetch_backoff_seconds < 0
        || s.check_delay_seconds < 0
        || s.check_initial_delay_seconds < 0
        || s.aggregate_delay_seconds < 0
    {
        return Err(ConfigError::Invalid("sync delays must be >= 0"));
    }
    if s.max_depth == 0 {
        return Err(ConfigError::Invalid("sync.max_depth must be > 0"));
    }
    if s.max_fanout == 0 {
        return Err(ConfigError::Invalid("sync.max_fanout must be > 0"));
    }

    Ok(())
}

/// Example configuration, also used by tests.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  poll_interval_ms: 500
  max_backoff_seconds: 300
  workers: 4
  reconcile_interval_seconds: 300

notion:
  token: "YOUR_NOTION_INTEGRATION_TOKEN"
  version: "2022-06-28"
  type_property: "Type"

sync:
  fetch_attempts: 10
  fetch_backoff_seconds: 2
  check_attempts: 3
  check_delay_seconds: 1
  check_initial_delay_seconds: 5
  max_depth: 32
  max_fanout: 500
"#
}
