use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_presence_topic() -> String {
    "online_users".to_string()
}

fn default_open_attempts() -> u32 {
    3
}

fn default_backoff_initial_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

/// Client-side chat configuration, loadable from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Name of the shared presence topic every session announces on.
    #[serde(default = "default_presence_topic")]
    pub presence_topic: String,

    /// Attempts made when opening the presence topic before degrading.
    #[serde(default = "default_open_attempts")]
    pub open_attempts: u32,

    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            presence_topic: default_presence_topic(),
            open_attempts: default_open_attempts(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

impl ChatConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(input)?)
    }

    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}
