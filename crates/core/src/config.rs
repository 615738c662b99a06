//! Configuration management for chatsnap.

use crate::chat::types::Sender;
use crate::error::{Error, Result};
use crate::platform;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Display name used when the user did not pick one.
pub const DEFAULT_DISPLAY_NAME: &str = "Anonymous";

/// Display name of the automated reply sender.
pub const DEFAULT_ASSISTANT_NAME: &str = "Assistant";

/// TCP reachability probe used as the connectivity signal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProbeConfig {
    /// `host:port` to connect to.
    pub address: String,

    /// Time between probes in milliseconds.
    #[serde(default = "default_probe_interval_ms")]
    pub interval_ms: u64,

    /// Connect timeout in milliseconds.
    #[serde(default = "default_probe_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_probe_interval_ms() -> u64 {
    5_000
}

fn default_probe_timeout_ms() -> u64 {
    2_000
}

fn default_debounce_ms() -> u64 {
    250
}

fn default_assistant_name() -> String {
    DEFAULT_ASSISTANT_NAME.to_string()
}

impl ProbeConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            interval_ms: default_probe_interval_ms(),
            timeout_ms: default_probe_timeout_ms(),
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Main configuration struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Name shown next to the user's messages.
    pub display_name: String,

    /// Opaque user identity (generated on first use).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    /// Directory for the local message cache (None = platform default).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,

    /// Name of the automated reply sender.
    #[serde(default = "default_assistant_name")]
    pub assistant_name: String,

    /// Connectivity settle window in milliseconds.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Reachability probe (None = connectivity driven manually).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe: Option<ProbeConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            display_name: DEFAULT_DISPLAY_NAME.to_string(),
            user_id: None,
            data_dir: None,
            assistant_name: default_assistant_name(),
            debounce_ms: default_debounce_ms(),
            probe: None,
        }
    }
}

impl Config {
    /// Load configuration from the default config file.
    pub fn load() -> Result<Self> {
        Self::load_from(&platform::config_file_path())
    }

    /// Load configuration from a specific file, falling back to defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            let mut config: Config = serde_json::from_str(&contents)?;
            config.fix_invalid_values();
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    /// Fix any invalid or empty values with sensible defaults.
    fn fix_invalid_values(&mut self) {
        if self.display_name.trim().is_empty() {
            self.display_name = DEFAULT_DISPLAY_NAME.to_string();
        }
        if self.assistant_name.trim().is_empty() {
            self.assistant_name = default_assistant_name();
        }
        if matches!(self.user_id.as_deref(), Some(id) if id.trim().is_empty()) {
            self.user_id = None;
        }
    }

    /// Save configuration to the default config file.
    pub fn save(&mut self) -> Result<()> {
        self.save_to(&platform::config_file_path())
    }

    /// Save configuration to a specific file.
    pub fn save_to(&mut self, path: &Path) -> Result<()> {
        self.fix_invalid_values();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;

        Ok(())
    }

    /// Load configuration from environment variables, falling back to file/defaults.
    pub fn load_with_env() -> Result<Self> {
        let mut config = Self::load()?;
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(name) = std::env::var("CHATSNAP_NAME") {
            self.display_name = name;
        }

        if let Ok(dir) = std::env::var("CHATSNAP_DATA_DIR") {
            self.data_dir = Some(PathBuf::from(dir));
        }

        if let Ok(address) = std::env::var("CHATSNAP_PROBE") {
            self.probe = if address.is_empty() {
                None
            } else {
                Some(ProbeConfig::new(address))
            };
        }

        self.fix_invalid_values();
    }

    /// Directory holding the local message cache.
    pub fn cache_dir(&self) -> PathBuf {
        self.data_dir
            .as_ref()
            .map(|dir| dir.join("cache.db"))
            .unwrap_or_else(platform::cache_dir)
    }

    /// Connectivity settle window.
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// The local user's identity, generating an id on first use.
    ///
    /// Returns whether a new id was generated so the caller can persist it.
    pub fn identity(&mut self) -> (Sender, bool) {
        let generated = self.user_id.is_none();
        let id = self
            .user_id
            .get_or_insert_with(|| uuid::Uuid::new_v4().to_string())
            .clone();
        (Sender::new(id, self.display_name.clone()), generated)
    }

    /// Identity used for automated replies.
    pub fn assistant(&self) -> Sender {
        Sender::assistant(&self.assistant_name)
    }

    /// Validate values that cannot be repaired automatically.
    pub fn validate(&self) -> Result<()> {
        if let Some(probe) = &self.probe {
            if !probe.address.contains(':') {
                return Err(Error::Config(format!(
                    "probe address must be host:port, got {:?}",
                    probe.address
                )));
            }
            if probe.interval_ms == 0 {
                return Err(Error::Config("probe interval must be non-zero".to_string()));
            }
        }
        Ok(())
    }
}
