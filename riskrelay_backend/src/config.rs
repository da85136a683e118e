use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::retry::RetryPolicy;

pub const CONFIG_FILE_NAME: &str = "riskrelay.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    // Agent endpoints
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_primary_agent_code", alias = "agent_code")]
    pub primary_agent_code: String,
    #[serde(default = "default_risk_agent_code")]
    pub risk_agent_code: String,
    #[serde(default = "default_culture")]
    pub culture: String,

    // Credentials
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_key_file: Option<String>,

    // Network behaviour
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_stream_idle_timeout_secs")]
    pub stream_idle_timeout_secs: u64,

    // Escalation
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    #[serde(default = "default_transcript_capacity")]
    pub transcript_capacity: usize,
}

fn default_base_url() -> String {
    "https://api.serenitystar.ai/api".to_string()
}

fn default_primary_agent_code() -> String {
    "GAIAComunidad".to_string()
}

fn default_risk_agent_code() -> String {
    "EvaluadorRiesgo".to_string()
}

fn default_culture() -> String {
    "en".to_string()
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_retry_max_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    800
}

fn default_stream_idle_timeout_secs() -> u64 {
    120
}

fn default_history_window() -> usize {
    12
}

fn default_transcript_capacity() -> usize {
    100
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            primary_agent_code: default_primary_agent_code(),
            risk_agent_code: default_risk_agent_code(),
            culture: default_culture(),
            api_key: None,
            api_key_file: None,
            request_timeout_secs: default_request_timeout_secs(),
            retry_max_attempts: default_retry_max_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            stream_idle_timeout_secs: default_stream_idle_timeout_secs(),
            history_window: default_history_window(),
            transcript_capacity: default_transcript_capacity(),
        }
    }
}

impl RelayConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join(CONFIG_FILE_NAME)
    }

    /// Load `riskrelay.toml` next to the executable, then apply env overrides.
    pub fn load() -> Self {
        let path = Self::config_path();
        match Self::load_from(&path) {
            Ok(config) => config,
            Err(e) => {
                if path.exists() {
                    tracing::error!("Failed to load {:?}: {:#}", path, e);
                } else {
                    tracing::warn!("No config file found, using defaults + env vars");
                }
                Self::default().with_env_overrides()
            }
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {:?}", path))?;
        let config = toml::from_str::<RelayConfig>(&contents)
            .with_context(|| format!("Failed to parse config {:?}", path))?;
        tracing::info!("Loaded config from {:?}", path);
        Ok(config.with_env_overrides().normalized())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let toml_string = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, toml_string)
            .with_context(|| format!("Failed to write config to {:?}", path))?;
        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Defaults overlaid with environment variables only.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = env::var("RISKRELAY_BASE_URL") {
            self.base_url = url;
        }

        if let Ok(code) = env::var("RISKRELAY_AGENT_CODE") {
            self.primary_agent_code = code;
        }

        if let Ok(code) = env::var("RISKRELAY_RISK_AGENT_CODE") {
            self.risk_agent_code = code;
        }

        if let Ok(culture) = env::var("RISKRELAY_CULTURE") {
            self.culture = culture;
        }

        if let Ok(key) = env::var("RISKRELAY_API_KEY") {
            if !key.trim().is_empty() {
                self.api_key = Some(key.trim().to_string());
            }
        }

        if let Ok(path) = env::var("RISKRELAY_API_KEY_FILE") {
            if !path.trim().is_empty() {
                self.api_key_file = Some(path);
            }
        }

        if let Ok(secs) = env::var("RISKRELAY_REQUEST_TIMEOUT_SECS") {
            if let Ok(secs) = secs.parse() {
                self.request_timeout_secs = secs;
            }
        }

        if let Ok(attempts) = env::var("RISKRELAY_RETRY_MAX_ATTEMPTS") {
            if let Ok(attempts) = attempts.parse() {
                self.retry_max_attempts = attempts;
            }
        }

        if let Ok(delay) = env::var("RISKRELAY_RETRY_DELAY_MS") {
            if let Ok(delay) = delay.parse() {
                self.retry_delay_ms = delay;
            }
        }

        self.normalized()
    }

    fn normalized(mut self) -> Self {
        self.base_url = self.base_url.trim().trim_end_matches('/').to_string();
        if self.base_url.is_empty() {
            self.base_url = default_base_url();
        }
        self.retry_max_attempts = self.retry_max_attempts.max(1);
        self.history_window = self.history_window.max(1);
        self.transcript_capacity = self.transcript_capacity.max(1);
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_max_attempts,
            Duration::from_millis(self.retry_delay_ms),
        )
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_idle_timeout_secs.max(1))
    }

    /// Where a persisted API key lives: explicit setting, else the user config dir.
    pub fn api_key_path(&self) -> Option<PathBuf> {
        if let Some(path) = self.api_key_file.as_deref() {
            return Some(PathBuf::from(path));
        }
        dirs::config_dir().map(|dir| dir.join("riskrelay").join("api_key"))
    }
}
