//! # Configuration
//!
//! Loads, parses and validates the TOML configuration. Searches the standard
//! locations in priority order; when no file exists anywhere, the built-in
//! defaults apply. Cipher parameters are fixed in [`crate::crypto`] and are
//! intentionally absent here.

use crate::error::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs};

/// Top-level configuration structure.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub site: SiteSettings,

    #[serde(default)]
    pub fetch: FetchSettings,

    #[serde(default)]
    pub delivery: DeliverySettings,

    #[serde(default)]
    pub unlock: UnlockSettings,
}

/// Where local image references are resolved from.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SiteSettings {
    /// Site source root. `/images/a.png` resolves to `<source_dir>/images/a.png`.
    #[serde(default = "default_source_dir")]
    pub source_dir: PathBuf,
}

/// Remote image fetching policy.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct FetchSettings {
    /// Extra attempts after the first, on network errors and 5xx only.
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Base delay between attempts; doubles after each failure.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,

    /// Hard ceiling on the total time spent on one image, retries included.
    #[serde(default = "default_deadline_secs")]
    pub deadline_secs: u64,
}

/// How the encrypted payload reaches the reader's browser.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DeliverySettings {
    #[serde(default)]
    pub mode: DeliveryMode,

    /// URL the widget fetches in `external` mode. `{slug}` is substituted.
    #[serde(default = "default_payload_url")]
    pub payload_url: String,

    /// Site output root. In `external` mode each payload is written here at
    /// the path of its URL.
    #[serde(default = "default_public_dir")]
    pub public_dir: PathBuf,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// Base64 payload embedded in the page.
    #[default]
    Inline,
    /// Payload published as a separate JSON document.
    External,
}

impl std::fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryMode::Inline => write!(f, "inline"),
            DeliveryMode::External => write!(f, "external"),
        }
    }
}

/// Reader-facing unlock behaviour.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct UnlockSettings {
    /// How long an unlock error stays visible.
    #[serde(default = "default_error_display_secs")]
    pub error_display_secs: u64,

    /// Timeout for fetching an externally delivered payload.
    #[serde(default = "default_timeout_secs")]
    pub fetch_timeout_secs: u64,
}

impl Default for SiteSettings {
    fn default() -> Self {
        Self {
            source_dir: default_source_dir(),
        }
    }
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            retries: default_retries(),
            timeout_secs: default_timeout_secs(),
            backoff_ms: default_backoff_ms(),
            deadline_secs: default_deadline_secs(),
        }
    }
}

impl FetchSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_ms.saturating_mul(1u64 << attempt.min(16)))
    }
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            mode: DeliveryMode::default(),
            payload_url: default_payload_url(),
            public_dir: default_public_dir(),
        }
    }
}

impl Default for UnlockSettings {
    fn default() -> Self {
        Self {
            error_display_secs: default_error_display_secs(),
            fetch_timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_source_dir() -> PathBuf {
    PathBuf::from("source")
}
fn default_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_backoff_ms() -> u64 {
    250
}
fn default_deadline_secs() -> u64 {
    120
}
fn default_payload_url() -> String {
    "/api/encrypted/{slug}.json".to_string()
}
fn default_public_dir() -> PathBuf {
    PathBuf::from("public")
}
fn default_error_display_secs() -> u64 {
    5
}

/// Standard configuration file search paths, in descending priority order.
fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("sealed-post.toml")];
    if let Ok(xdg) = env::var("XDG_CONFIG_HOME") {
        paths.push(PathBuf::from(format!("{xdg}/sealed-post.toml")));
    }
    if let Ok(home) = env::var("HOME") {
        paths.push(PathBuf::from(format!("{home}/.config/sealed-post.toml")));
    }
    paths.push(PathBuf::from("/etc/sealed-post.toml"));
    paths
}

/// Loads configuration from the first config file found, or the defaults.
pub fn load_config() -> Result<Config> {
    for path in config_search_paths() {
        if path.exists() {
            return load_config_from(&path);
        }
    }

    tracing::debug!("no config file found, using defaults");
    Ok(Config::default())
}

/// Loads and validates configuration from a specific file path.
pub fn load_config_from(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()).into());
    }

    let content = fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;

    let config = parse_config(&content)?;
    tracing::debug!(path = %path.display(), "loaded config");
    Ok(config)
}

/// Parses and validates configuration text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).map_err(|e| ConfigError::Parse { source: e })?;
    validate_config(&config)?;
    Ok(config)
}

/// Validates configuration invariants after parsing.
fn validate_config(config: &Config) -> std::result::Result<(), ConfigError> {
    if config.site.source_dir.as_os_str().is_empty() {
        return Err(ConfigError::Validation {
            message: "site.source_dir must not be empty".to_string(),
        });
    }

    if config.fetch.timeout_secs == 0 {
        return Err(ConfigError::Validation {
            message: "fetch.timeout_secs must be greater than 0".to_string(),
        });
    }

    if config.fetch.deadline_secs < config.fetch.timeout_secs {
        return Err(ConfigError::Validation {
            message: format!(
                "fetch.deadline_secs ({}) must be at least fetch.timeout_secs ({})",
                config.fetch.deadline_secs, config.fetch.timeout_secs
            ),
        });
    }

    if config.fetch.retries > 10 {
        return Err(ConfigError::Validation {
            message: format!("fetch.retries must be at most 10, got {}", config.fetch.retries),
        });
    }

    if config.delivery.mode == DeliveryMode::External
        && !config.delivery.payload_url.contains("{slug}")
    {
        return Err(ConfigError::Validation {
            message: "delivery.payload_url must contain '{slug}' in external mode".to_string(),
        });
    }

    if config.delivery.mode == DeliveryMode::External {
        let sample = config.delivery.payload_url.replace("{slug}", "slug");
        if crate::encoder::served_path(&sample).is_none() {
            return Err(ConfigError::Validation {
                message: format!(
                    "delivery.payload_url '{}' does not name a file under delivery.public_dir",
                    config.delivery.payload_url
                ),
            });
        }
    }

    if config.unlock.fetch_timeout_secs == 0 {
        return Err(ConfigError::Validation {
            message: "unlock.fetch_timeout_secs must be greater than 0".to_string(),
        });
    }

    Ok(())
}

/// Writes a default configuration file at the given path.
pub fn init_config(path: &Path) -> Result<()> {
    if path.exists() {
        return Err(anyhow::anyhow!("config file already exists: {}", path.display()).into());
    }

    let toml_str = toml::to_string_pretty(&Config::default())
        .map_err(|e| anyhow::anyhow!("failed to serialize config: {e}"))?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, toml_str)?;

    Ok(())
}
