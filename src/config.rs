//! Configuration loader and validator for the feed reader.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub messaging: Messaging,
    #[serde(default)]
    pub alerts: Alerts,
    pub sources: Vec<SourceConfig>,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    /// Temporary disk used while unpacking and splitting.
    pub staging_dir: String,
    /// Root of permanent storage.
    pub storage_dir: String,
    #[serde(default = "default_lock_wait")]
    pub lock_wait_seconds: u64,
    #[serde(default = "default_lock_lease")]
    pub lock_lease_seconds: u64,
}

/// Downstream messaging endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Messaging {
    pub url: String,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
}

/// Operational alert channel. An empty webhook means alerts are only logged.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Alerts {
    #[serde(default)]
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum VendorKind {
    Emis,
    Tpp,
}

impl VendorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            VendorKind::Emis => "emis",
            VendorKind::Tpp => "tpp",
        }
    }
}

/// One feed source polled on its own schedule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceConfig {
    pub id: String,
    pub vendor: VendorKind,
    /// Drop-off directory the remote listing is read from.
    pub remote_path: String,
    pub poll_interval_seconds: u64,
    pub software_content_type: String,
    pub software_version: String,
    #[serde(default)]
    pub expected_file_types: Vec<String>,
    #[serde(default)]
    pub ignored_organisations: Vec<String>,
    /// Recognised file types that are skipped at intake.
    #[serde(default)]
    pub not_needed_file_types: Vec<String>,
    #[serde(default)]
    pub retention_days: Option<u32>,
    #[serde(default = "default_bulk_min_rows")]
    pub bulk_min_rows: usize,
    /// Run errors matching one of these are suppressed for one occurrence before alerting.
    #[serde(default)]
    pub transient_error_patterns: Vec<String>,
}

fn default_lock_wait() -> u64 {
    30
}

fn default_lock_lease() -> u64 {
    6 * 60 * 60
}

fn default_timeout() -> u64 {
    30
}

fn default_bulk_min_rows() -> usize {
    1000
}

impl App {
    pub fn database_path(&self) -> PathBuf {
        Path::new(&self.data_dir).join("feed-reader.db")
    }
}

impl Config {
    /// Ensure required directories exist.
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        for dir in [&self.app.data_dir, &self.app.staging_dir, &self.app.storage_dir] {
            if !dir.trim().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }
        Ok(())
    }

    pub fn source(&self, id: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.id == id)
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
    if cfg.app.staging_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.staging_dir must be non-empty"));
    }
    if cfg.app.storage_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.storage_dir must be non-empty"));
    }
    if cfg.app.lock_lease_seconds == 0 {
        return Err(ConfigError::Invalid("app.lock_lease_seconds must be > 0"));
    }

    if cfg.messaging.url.trim().is_empty() {
        return Err(ConfigError::Invalid("messaging.url must be non-empty"));
    }
    if reqwest::Url::parse(&cfg.messaging.url).is_err() {
        return Err(ConfigError::Invalid("messaging.url must be a valid URL"));
    }

    if cfg.sources.is_empty() {
        return Err(ConfigError::Invalid("sources must contain at least one source"));
    }
    for (i, source) in cfg.sources.iter().enumerate() {
        if source.id.trim().is_empty() {
            return Err(ConfigError::Invalid("sources[].id must be non-empty"));
        }
        if cfg.sources[..i].iter().any(|s| s.id == source.id) {
            return Err(ConfigError::Invalid("sources[].id must be unique"));
        }
        if source.remote_path.trim().is_empty() {
            return Err(ConfigError::Invalid("sources[].remote_path must be non-empty"));
        }
        if source.poll_interval_seconds == 0 {
            return Err(ConfigError::Invalid("sources[].poll_interval_seconds must be > 0"));
        }
        if source.software_content_type.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "sources[].software_content_type must be non-empty",
            ));
        }
        if source
            .transient_error_patterns
            .iter()
            .any(|p| regex::Regex::new(p).is_err())
        {
            return Err(ConfigError::Invalid(
                "sources[].transient_error_patterns must be valid regexes",
            ));
        }
    }

    Ok(())
}

/// Returns a complete example configuration.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  staging_dir: "./data/staging"
  storage_dir: "./data/storage"
  lock_wait_seconds: 30
  lock_lease_seconds: 21600

messaging:
  url: "http://localhost:8080/api/PostMessageAsync"
  auth_token: "YOUR_MESSAGING_TOKEN"
  timeout_seconds: 30

alerts:
  webhook_url: ""

sources:
  - id: "EMIS001"
    vendor: emis
    remote_path: "./dropoff/emis001"
    poll_interval_seconds: 300
    software_content_type: "EMISCSV"
    software_version: "2.1"
    expected_file_types:
      - "Admin_Organisation"
      - "Admin_Patient"
      - "Agreements_SharingOrganisation"
    retention_days: 30
    bulk_min_rows: 1000
    transient_error_patterns:
      - "connection reset"

  - id: "TPP001"
    vendor: tpp
    remote_path: "./dropoff/tpp001"
    poll_interval_seconds: 600
    software_content_type: "TPPCSV"
    software_version: "1.0"
    ignored_organisations:
      - "Y01234"
    not_needed_file_types:
      - "AppointmentAttendees"
"#
}
