//! API key resolution.
//!
//! Order: explicit value → persisted file → in-memory override → configured default.
//! Blank values at any level are skipped.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::RelayConfig;
use crate::error::AgentApiError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    Explicit,
    Persisted,
    Override,
    Configured,
}

#[derive(Debug, Clone, Default)]
pub struct ApiKeyResolver {
    explicit: Option<String>,
    persisted_path: Option<PathBuf>,
    override_key: Option<String>,
    configured: Option<String>,
}

impl ApiKeyResolver {
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            explicit: None,
            persisted_path: config.api_key_path(),
            override_key: None,
            configured: config.api_key.clone(),
        }
    }

    pub fn with_explicit(mut self, key: Option<String>) -> Self {
        self.explicit = key;
        self
    }

    pub fn with_persisted_path(mut self, path: Option<PathBuf>) -> Self {
        self.persisted_path = path;
        self
    }

    pub fn set_override(&mut self, key: Option<String>) {
        self.override_key = key;
    }

    pub fn resolve(&self) -> Result<String, AgentApiError> {
        self.resolve_with_source()
            .map(|(key, _)| key)
            .ok_or(AgentApiError::MissingApiKey)
    }

    pub fn resolve_with_source(&self) -> Option<(String, KeySource)> {
        if let Some(key) = non_blank(self.explicit.as_deref()) {
            return Some((key, KeySource::Explicit));
        }
        if let Some(key) = self.persisted_path.as_deref().and_then(read_persisted) {
            return Some((key, KeySource::Persisted));
        }
        if let Some(key) = non_blank(self.override_key.as_deref()) {
            return Some((key, KeySource::Override));
        }
        non_blank(self.configured.as_deref()).map(|key| (key, KeySource::Configured))
    }

    /// Store `key` in the persisted file so later runs pick it up.
    pub fn persist(&self, key: &str) -> Result<PathBuf> {
        let path = self
            .persisted_path
            .clone()
            .context("No location available for a persisted API key")?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {:?}", parent))?;
        }
        fs::write(&path, key.trim())
            .with_context(|| format!("Failed to write API key to {:?}", path))?;
        tracing::info!("Persisted API key to {:?}", path);
        Ok(path)
    }
}

fn read_persisted(path: &Path) -> Option<String> {
    match fs::read_to_string(path) {
        Ok(contents) => non_blank(Some(&contents)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            tracing::warn!("Failed to read persisted API key {:?}: {}", path, e);
            None
        }
    }
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
