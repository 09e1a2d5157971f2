use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::error::{GenQueueError, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Number of conversation turns kept per user and replayed as history.
    #[serde(default = "default_conversation_window")]
    pub conversation_window: usize,

    /// Directory holding the SQLite database.  Empty means the XDG data dir.
    #[serde(default)]
    pub data_dir: String,

    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub quota: QuotaConfig,
}

// -- Remote generation API -------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// Backend to use: "stream" (SSE image frames, default) or "chat"
    /// (single JSON chat completion).
    /// Can be overridden with the `GENQUEUE_BACKEND` env var.
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Base URL of the OpenAI-compatible API.
    /// Can be overridden with the `GENQUEUE_BASE_URL` env var.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Bearer token.  Prefer the `GENQUEUE_API_KEY` env var.
    #[serde(default)]
    pub api_key: String,

    /// Can be overridden with the `GENQUEUE_MODEL` env var.
    #[serde(default = "default_model")]
    pub model: String,

    /// Whole-request timeout in seconds, stream consumption included
    /// (0 = 300s).
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

// -- Batch queue -------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Wait between two dispatches of the same batch, in milliseconds.
    #[serde(default = "default_pacing_delay_ms")]
    pub pacing_delay_ms: u64,

    /// Extracted prompts must be strictly longer than this many characters.
    #[serde(default = "default_min_prompt_chars")]
    pub min_prompt_chars: usize,
}

// -- Quota -------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct QuotaConfig {
    /// Credits charged per dispatched prompt.
    #[serde(default = "default_cost_per_generation")]
    pub cost_per_generation: i64,

    /// Credits granted to a user the first time the ledger sees them.
    #[serde(default = "default_initial_balance")]
    pub initial_balance: i64,
}

fn default_conversation_window() -> usize {
    20
}
fn default_backend() -> String {
    "stream".to_string()
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_model() -> String {
    "gpt-image-1".to_string()
}
fn default_timeout_secs() -> u64 {
    300
}
fn default_pacing_delay_ms() -> u64 {
    2000
}
fn default_min_prompt_chars() -> usize {
    20
}
fn default_cost_per_generation() -> i64 {
    1
}
fn default_initial_balance() -> i64 {
    10
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            base_url: default_base_url(),
            api_key: String::new(),
            model: default_model(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            pacing_delay_ms: default_pacing_delay_ms(),
            min_prompt_chars: default_min_prompt_chars(),
        }
    }
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            cost_per_generation: default_cost_per_generation(),
            initial_balance: default_initial_balance(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            conversation_window: default_conversation_window(),
            data_dir: String::new(),
            api: ApiConfig::default(),
            queue: QueueConfig::default(),
            quota: QuotaConfig::default(),
        }
    }
}

// -- Config impl ---------------------------------------------------------

impl Config {
    /// Load config from the given path, or the default XDG config location.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_config_path(),
        };

        let config: Config = if config_path.exists() {
            info!("loading config from {}", config_path.display());
            let contents = std::fs::read_to_string(&config_path)?;
            toml::from_str(&contents)
                .map_err(|e| GenQueueError::Config(format!("parse error: {e}")))?
        } else {
            info!("no config file found, using defaults");
            Config::default()
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.quota.cost_per_generation <= 0 {
            return Err(GenQueueError::Config(
                "quota.cost_per_generation must be positive".into(),
            ));
        }
        if self.quota.initial_balance < 0 {
            return Err(GenQueueError::Config(
                "quota.initial_balance cannot be negative".into(),
            ));
        }
        Ok(())
    }

    /// Returns the default config file path: `$XDG_CONFIG_HOME/genqueue/config.toml`
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join("genqueue")
            .join("config.toml")
    }

    /// Returns the data directory: `data_dir` if set, else `$XDG_DATA_HOME/genqueue/`
    pub fn data_dir(&self) -> PathBuf {
        if !self.data_dir.is_empty() {
            return PathBuf::from(&self.data_dir);
        }
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from(".local/share"))
            .join("genqueue")
    }

    pub fn pacing_delay(&self) -> Duration {
        Duration::from_millis(self.queue.pacing_delay_ms)
    }

    /// Generate the default config file contents.
    pub fn default_config_contents() -> &'static str {
        include_str!("../config.example.toml")
    }
}
