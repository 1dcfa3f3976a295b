//! Configuration loading from TOML files

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use feedline_core::dedup::DEFAULT_CAPACITY;
use feedline_core::elapsed::DEFAULT_MILESTONE;
use feedline_core::notify::DEFAULT_LOG_INTERVAL;
use feedline_core::shard::{DEFAULT_SHARD_SIZE, DEFAULT_SHARD_TEMPLATE};
use feedline_core::stream::{DEFAULT_MAX_RECONNECTS, DEFAULT_READ_TIMEOUT, DEFAULT_STREAM_URL};

/// Global configuration for feedline
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub filter: FilterConfig,
    pub output: OutputConfig,
    pub dedup: DedupConfig,
    pub notify: NotifyConfig,
    pub offload: OffloadConfig,
    pub stream: StreamSettings,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct FilterConfig {
    pub follow: Vec<String>,
    pub track: Vec<String>,
    pub languages: Vec<String>,
    pub locations: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub dir: Option<PathBuf>,
    pub shard_size: u64,
    pub shard_template: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: None,
            shard_size: DEFAULT_SHARD_SIZE,
            shard_template: DEFAULT_SHARD_TEMPLATE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub capacity: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    /// Notify every N written events
    pub every: Option<u64>,
    /// Notify every N seconds
    pub seconds: Option<u64>,
    /// Log-only progress interval in seconds
    pub log_seconds: u64,
    pub milestone: u64,
    pub enabled: bool,
    #[serde(deserialize_with = "deserialize_env_var")]
    pub webhook_url: Option<String>,
    pub default_subject: Option<String>,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            every: None,
            seconds: None,
            log_seconds: DEFAULT_LOG_INTERVAL.as_secs(),
            milestone: DEFAULT_MILESTONE,
            enabled: true,
            webhook_url: None,
            default_subject: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct OffloadConfig {
    pub s3_bucket: Option<String>,
    /// Per-run key prefix; defaults to a timestamped `run_...` root
    pub s3_root: Option<String>,
    #[serde(deserialize_with = "deserialize_env_var")]
    pub endpoint: Option<String>,
    pub region: Option<String>,
    pub path_style: bool,
    /// Mounted directory used instead of S3
    pub local_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    pub url: String,
    /// Stall timeout in seconds
    pub read_timeout: u64,
    pub max_reconnects: u32,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            url: DEFAULT_STREAM_URL.to_string(),
            read_timeout: DEFAULT_READ_TIMEOUT.as_secs(),
            max_reconnects: DEFAULT_MAX_RECONNECTS,
        }
    }
}

/// Deserialize a string that may contain environment variable reference like ${VAR}
fn deserialize_env_var<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let opt: Option<String> = Option::deserialize(deserializer)?;
    Ok(opt.and_then(|s| expand_env_var(&s, |name| std::env::var(name).ok())))
}

/// Expand `${VAR}` through `lookup`; other strings pass through.
fn expand_env_var(s: &str, lookup: impl Fn(&str) -> Option<String>) -> Option<String> {
    if let Some(var_name) = s.strip_prefix("${").and_then(|s| s.strip_suffix('}')) {
        lookup(var_name)
    } else {
        Some(s.to_string())
    }
}

impl Config {
    /// Load configuration from default locations
    ///
    /// Search order:
    /// 1. ./feedline.toml (current directory)
    /// 2. ~/.config/feedline/config.toml
    ///
    /// If no config file found, returns default config.
    pub fn load() -> Result<Self> {
        let local_config = PathBuf::from("feedline.toml");
        if local_config.exists() {
            return Self::from_file(&local_config);
        }

        if let Some(config_dir) = directories::ProjectDirs::from("", "", "feedline") {
            let user_config = config_dir.config_dir().join("config.toml");
            if user_config.exists() {
                return Self::from_file(&user_config);
            }
        }

        log::debug!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Load configuration from a specific file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        log::info!("Loaded config from {}", path.display());
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert!(config.output.dir.is_none());
        assert_eq!(config.output.shard_size, 50_000);
        assert_eq!(config.dedup.capacity, 1000);
        assert!(config.notify.enabled);
        assert_eq!(config.notify.log_seconds, 3600);
        assert_eq!(config.stream.read_timeout, 90);
    }

    #[test]
    fn expand_env_var_reference() {
        let lookup = |name: &str| (name == "HOOK").then(|| "https://hooks.test/x".to_string());
        assert_eq!(
            expand_env_var("${HOOK}", lookup),
            Some("https://hooks.test/x".to_string())
        );
        assert_eq!(expand_env_var("${MISSING}", lookup), None);
        assert_eq!(expand_env_var("literal", lookup), Some("literal".to_string()));
    }

    #[test]
    fn parse_config_toml() {
        let toml = r#"
[filter]
track = ["rust", "ferris"]
languages = ["en"]

[output]
dir = "/data/feed"
shard_size = 1000

[notify]
every = 500
webhook_url = "https://hooks.test/feedline"

[offload]
s3_bucket = "archive"
path_style = true
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.filter.track, vec!["rust", "ferris"]);
        assert_eq!(config.output.dir, Some(PathBuf::from("/data/feed")));
        assert_eq!(config.output.shard_size, 1000);
        assert_eq!(config.output.shard_template, DEFAULT_SHARD_TEMPLATE);
        assert_eq!(config.notify.every, Some(500));
        assert_eq!(
            config.notify.webhook_url.as_deref(),
            Some("https://hooks.test/feedline")
        );
        assert_eq!(config.offload.s3_bucket.as_deref(), Some("archive"));
        assert!(config.offload.path_style);
    }

    #[test]
    fn from_file_reports_path() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("feedline.toml");
        std::fs::write(&path, "[output\n").unwrap();
        let err = Config::from_file(&path).unwrap_err();
        assert!(format!("{err}").contains("feedline.toml"));
    }
}
