//! YAML runtime configuration shared by the service and the CLI.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{FsObjectStorage, HttpLlmClient, LlmClient, OraculoApi, UnconfiguredLlm};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct OraculoConfig {
    /// Path of the `SQLite` row store.
    pub db: PathBuf,
    pub bind: SocketAddr,
    pub storage: StorageConfig,
    pub llm: LlmConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    pub root: PathBuf,
    /// Prefix of every public object URL; objects live under `<public_base_url>/procedures/`.
    pub public_base_url: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct LlmConfig {
    pub endpoint: Option<String>,
    /// Name of the environment variable holding the bearer key, never the key itself.
    pub api_key_env: Option<String>,
    pub timeout_secs: Option<u64>,
}

impl Default for OraculoConfig {
    fn default() -> Self {
        Self {
            db: PathBuf::from("./oraculo.sqlite3"),
            bind: SocketAddr::from(([127, 0, 0, 1], 4020)),
            storage: StorageConfig::default(),
            llm: LlmConfig::default(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./oraculo-files"),
            public_base_url: "http://127.0.0.1:4020/v1/files".to_string(),
        }
    }
}

impl OraculoConfig {
    /// # Errors
    /// Returns an error when the file cannot be read, parsed, or validated.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// # Errors
    /// Returns an error when the YAML is malformed or fails validation.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns [`ConfigError::Validation`] for an unusable URL or timeout.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_http_url(&self.storage.public_base_url) {
            return Err(ConfigError::Validation(format!(
                "storage.public_base_url must be an http(s) URL: {}",
                self.storage.public_base_url
            )));
        }
        if let Some(endpoint) = &self.llm.endpoint {
            if !is_http_url(endpoint) {
                return Err(ConfigError::Validation(format!(
                    "llm.endpoint must be an http(s) URL: {endpoint}"
                )));
            }
        }
        if self.llm.timeout_secs == Some(0) {
            return Err(ConfigError::Validation("llm.timeout_secs must be positive".into()));
        }
        Ok(())
    }

    /// Wire the façade with filesystem storage and the configured LLM endpoint.
    ///
    /// Without an endpoint every LLM call fails at the `invoke_llm` stage.
    ///
    /// # Errors
    /// Returns an error when `llm.api_key_env` names a variable that is not set.
    pub fn build_api(&self) -> Result<OraculoApi, ConfigError> {
        let llm: Arc<dyn LlmClient> = match &self.llm.endpoint {
            Some(endpoint) => {
                let api_key = match &self.llm.api_key_env {
                    Some(name) => Some(std::env::var(name).map_err(|_| {
                        ConfigError::Validation(format!("environment variable {name} is not set"))
                    })?),
                    None => None,
                };
                Arc::new(HttpLlmClient::new(
                    endpoint.clone(),
                    api_key,
                    self.llm.timeout_secs.map(Duration::from_secs),
                ))
            }
            None => Arc::new(UnconfiguredLlm),
        };
        let storage =
            Arc::new(FsObjectStorage::new(self.storage.root.clone(), &self.storage.public_base_url));
        Ok(OraculoApi::new(self.db.clone(), llm, storage))
    }
}

fn is_http_url(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}
