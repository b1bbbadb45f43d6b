//! Configuration management for tabsweep using the prefer crate.

use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Hard bounds for the concurrency setting.
pub const MIN_CONCURRENCY: usize = 1;
pub const MAX_CONCURRENCY: usize = 50;

/// Default per-tab deadline for a matching download (30 seconds).
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Longest per-tab deadline accepted (24 hours); timer wheels reject
/// anything near two years.
pub const MAX_TIMEOUT_MS: u64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse {format} config: {message}")]
    Parse {
        format: &'static str,
        message: String,
    },
    #[error("max_concurrency must be between {MIN_CONCURRENCY} and {MAX_CONCURRENCY}, got {0}")]
    ConcurrencyOutOfRange(usize),
    #[error("timeout_ms must be greater than zero")]
    ZeroTimeout,
    #[error("timeout_ms must be at most {MAX_TIMEOUT_MS}, got {0}")]
    TimeoutTooLong(u64),
    #[error("invalid {field} pattern: {source}")]
    Pattern {
        field: &'static str,
        source: regex::Error,
    },
}

/// Connection settings for the Chromium host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserSettings {
    /// Remote Chrome DevTools URL (e.g., "http://127.0.0.1:9222").
    #[serde(default = "default_remote_url")]
    pub remote_url: String,

    /// Directory the browser should save downloads into.
    /// When unset the browser's own download settings apply.
    #[serde(default)]
    pub download_dir: Option<PathBuf>,

    /// CDP request timeout in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_remote_url() -> String {
    "http://127.0.0.1:9222".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            remote_url: default_remote_url(),
            download_dir: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Configuration file structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// How many tabs may be in flight at once (1-50).
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Per-tab deadline for a matching download, in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Pause between successive tab admissions, in milliseconds.
    #[serde(default = "default_admission_delay_ms")]
    pub admission_delay_ms: u64,

    /// Maximum retries per tab.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Assign any download to the only in-flight tab when nothing else matches.
    /// Unsound above concurrency 1 on sites that strip download metadata.
    #[serde(default = "default_true")]
    pub singleton_fallback: bool,

    /// Page suffixes stripped when deriving the expected filename.
    #[serde(default = "default_page_extensions")]
    pub page_extensions: Vec<String>,

    /// Regex for direct file-download links (strongest trigger).
    #[serde(default = "default_direct_link_pattern")]
    pub direct_link_pattern: String,

    /// Regex for generic download links (weakest trigger).
    #[serde(default = "default_generic_link_pattern")]
    pub generic_link_pattern: String,

    /// Case-insensitive labels identifying a click-only download control.
    #[serde(default = "default_action_labels")]
    pub action_labels: Vec<String>,

    /// Broadcast buffer for download events.
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,

    /// Poll interval when the host has no push download events.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default)]
    pub browser: BrowserSettings,

    /// Path to the config file this was loaded from (not serialized).
    #[serde(skip)]
    pub source_path: Option<PathBuf>,
}

fn default_max_concurrency() -> usize {
    3
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_admission_delay_ms() -> u64 {
    250
}

fn default_max_retries() -> u32 {
    2
}

fn default_true() -> bool {
    true
}

fn default_page_extensions() -> Vec<String> {
    vec![".html".to_string(), ".htm".to_string()]
}

fn default_direct_link_pattern() -> String {
    r"(?i)/(?:dl|get)/[^/?#]+/[^/?#]+".to_string()
}

fn default_generic_link_pattern() -> String {
    r"(?i)/download/".to_string()
}

fn default_action_labels() -> Vec<String> {
    vec!["download".to_string()]
}

fn default_event_bus_capacity() -> usize {
    256
}

fn default_poll_interval_ms() -> u64 {
    500
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            timeout_ms: default_timeout_ms(),
            admission_delay_ms: default_admission_delay_ms(),
            max_retries: default_max_retries(),
            singleton_fallback: true,
            page_extensions: default_page_extensions(),
            direct_link_pattern: default_direct_link_pattern(),
            generic_link_pattern: default_generic_link_pattern(),
            action_labels: default_action_labels(),
            event_bus_capacity: default_event_bus_capacity(),
            poll_interval_ms: default_poll_interval_ms(),
            browser: BrowserSettings::default(),
            source_path: None,
        }
    }
}

impl Config {
    /// Load configuration using prefer crate for discovery.
    /// Falls back to defaults (plus environment overrides) when nothing is found.
    pub async fn load() -> Self {
        match prefer::load("tabsweep").await {
            Ok(pref_config) => {
                if let Some(path) = pref_config.source_path() {
                    match Self::load_from_path(path).await {
                        Ok(config) => config,
                        Err(e) => {
                            tracing::warn!("Ignoring config at {}: {}", path.display(), e);
                            Self::default_with_env()
                        }
                    }
                } else {
                    Self::default_with_env()
                }
            }
            Err(_) => Self::default_with_env(),
        }
    }

    /// Defaults with environment variable overrides applied.
    pub fn default_with_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Load configuration from a specific file path.
    /// Format is chosen by extension: TOML, YAML, otherwise JSON.
    pub async fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("json");

        let mut config: Config = match ext {
            "toml" => toml::from_str(&contents).map_err(|e| ConfigError::Parse {
                format: "TOML",
                message: e.to_string(),
            })?,
            "yaml" | "yml" => serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse {
                format: "YAML",
                message: e.to_string(),
            })?,
            _ => serde_json::from_str(&contents).map_err(|e| ConfigError::Parse {
                format: "JSON",
                message: e.to_string(),
            })?,
        };

        config.source_path = Some(path.to_path_buf());
        if let Some(ref dir) = config.browser.download_dir {
            let expanded = shellexpand::tilde(&dir.to_string_lossy()).into_owned();
            config.browser.download_dir = Some(config.resolve_path(&expanded));
        }
        Ok(config.with_env_overrides())
    }

    /// Resolve a path relative to the config file's directory.
    fn resolve_path(&self, path_str: &str) -> PathBuf {
        let path = Path::new(path_str);
        if path.is_absolute() {
            return path.to_path_buf();
        }
        self.source_path
            .as_ref()
            .and_then(|p| p.parent())
            .map(|base| base.join(path))
            .unwrap_or_else(|| path.to_path_buf())
    }

    /// Apply `TABSWEEP_*` environment variable overrides.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(url) = env_string("TABSWEEP_BROWSER_URL") {
            self.browser.remote_url = url;
        }
        if let Some(n) = env_string("TABSWEEP_MAX_CONCURRENCY").and_then(|s| s.parse().ok()) {
            self.max_concurrency = n;
        }
        if let Some(ms) = env_string("TABSWEEP_TIMEOUT_MS").and_then(|s| s.parse::<u64>().ok()) {
            if (1..=MAX_TIMEOUT_MS).contains(&ms) {
                self.timeout_ms = ms;
            } else {
                warn!(
                    "Ignoring TABSWEEP_TIMEOUT_MS={}: must be between 1 and {}",
                    ms, MAX_TIMEOUT_MS
                );
            }
        }
        self
    }

    /// Reject values the session cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&self.max_concurrency) {
            return Err(ConfigError::ConcurrencyOutOfRange(self.max_concurrency));
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        if self.timeout_ms > MAX_TIMEOUT_MS {
            return Err(ConfigError::TimeoutTooLong(self.timeout_ms));
        }
        Regex::new(&self.direct_link_pattern).map_err(|source| ConfigError::Pattern {
            field: "direct_link_pattern",
            source,
        })?;
        Regex::new(&self.generic_link_pattern).map_err(|source| ConfigError::Pattern {
            field: "generic_link_pattern",
            source,
        })?;
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn admission_delay(&self) -> Duration {
        Duration::from_millis(self.admission_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.timeout(), Duration::from_secs(30));
        assert!(config.singleton_fallback);
    }

    #[test]
    fn concurrency_bounds_are_enforced() {
        let mut config = Config::default();
        config.max_concurrency = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ConcurrencyOutOfRange(0))
        ));
        config.max_concurrency = 51;
        assert!(config.validate().is_err());
        config.max_concurrency = 50;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn timeout_bounds_are_enforced() {
        let mut config = Config::default();
        config.timeout_ms = 0;
        assert!(matches!(config.validate(), Err(ConfigError::ZeroTimeout)));
        config.timeout_ms = MAX_TIMEOUT_MS;
        assert!(config.validate().is_ok());
        config.timeout_ms = 100_000_000_000;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::TimeoutTooLong(100_000_000_000))
        ));
    }

    #[test]
    fn out_of_range_env_timeout_is_ignored() {
        std::env::set_var("TABSWEEP_TIMEOUT_MS", "100000000000");
        let config = Config::default().with_env_overrides();
        std::env::remove_var("TABSWEEP_TIMEOUT_MS");
        assert_eq!(config.timeout_ms, DEFAULT_TIMEOUT_MS);
    }

    #[test]
    fn bad_pattern_is_rejected() {
        let mut config = Config::default();
        config.generic_link_pattern = "(".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Pattern {
                field: "generic_link_pattern",
                ..
            })
        ));
    }

    #[tokio::test]
    async fn loads_toml_with_partial_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tabsweep.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "max_concurrency = 5\ntimeout_ms = 1000\n\n[browser]\ndownload_dir = \"downloads\""
        )
        .unwrap();

        let config = Config::load_from_path(&path).await.unwrap();
        assert_eq!(config.max_concurrency, 5);
        assert_eq!(config.timeout_ms, 1000);
        assert_eq!(config.admission_delay_ms, 250);
        assert_eq!(config.browser.download_dir, Some(dir.path().join("downloads")));
        assert_eq!(config.source_path.as_deref(), Some(path.as_path()));
    }

    #[tokio::test]
    async fn loads_yaml_and_json() {
        let dir = tempfile::tempdir().unwrap();

        let yaml = dir.path().join("tabsweep.yaml");
        std::fs::write(&yaml, "max_retries: 4\nsingleton_fallback: false\n").unwrap();
        let config = Config::load_from_path(&yaml).await.unwrap();
        assert_eq!(config.max_retries, 4);
        assert!(!config.singleton_fallback);

        let json = dir.path().join("tabsweep.json");
        std::fs::write(&json, r#"{"page_extensions": [".php"]}"#).unwrap();
        let config = Config::load_from_path(&json).await.unwrap();
        assert_eq!(config.page_extensions, vec![".php".to_string()]);
    }

    #[tokio::test]
    async fn parse_errors_name_the_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "max_concurrency = [").unwrap();
        let err = Config::load_from_path(&path).await.unwrap_err();
        assert!(matches!(err, ConfigError::Parse { format: "TOML", .. }));
    }
}
