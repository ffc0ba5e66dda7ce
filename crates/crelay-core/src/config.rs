//! Configuration loading and typed config structures for the `cRelay` indexer.
//!
//! The canonical configuration lives in `crelay-config.yaml` at the project
//! root. Every field is defaulted, so an empty file (or no file at all) is a
//! valid in-memory configuration.

use std::path::Path;
use std::sync::Arc;

use crelay_db::{DocumentStore, DragonflyStore, MemoryStore, StoreError};
use crelay_types::ProtocolKinds;
use serde::Deserialize;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("failed to read config file: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Failed to parse YAML content.
    #[error("failed to parse config YAML: {source}")]
    Yaml {
        /// The underlying YAML parse error.
        source: serde_yml::Error,
    },

    /// An environment override held an unusable value.
    #[error("invalid value for {name}: {value}")]
    Env {
        /// The environment variable.
        name: &'static str,
        /// The rejected value.
        value: String,
    },
}

impl From<serde_yml::Error> for ConfigError {
    fn from(source: serde_yml::Error) -> Self {
        Self::Yaml { source }
    }
}

/// Top-level indexer configuration.
///
/// Mirrors the structure of `crelay-config.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RelayConfig {
    /// Document store selection and connection settings.
    #[serde(default)]
    pub store: StoreConfig,

    /// Reserved event kinds and key resolution policy.
    #[serde(default)]
    pub protocol: ProtocolConfig,

    /// Streaming query settings.
    #[serde(default)]
    pub query: QueryConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl RelayConfig {
    /// Load configuration from a YAML file at the given path.
    ///
    /// Environment variables override YAML values:
    /// - `DRAGONFLY_URL` overrides `store.dragonfly_url`
    /// - `CRELAY_STORE_BACKEND` overrides `store.backend`
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read,
    /// [`ConfigError::Yaml`] if the content is not valid YAML, or
    /// [`ConfigError::Env`] if an override is unusable.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse configuration from a YAML string, then apply environment
    /// overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] if the string is not valid YAML, or
    /// [`ConfigError::Env`] if an override is unusable.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let mut config = Self::parse_without_env(yaml)?;
        config.store.apply_overrides(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Parse configuration from a YAML string, ignoring the environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] if the string is not valid YAML.
    pub fn parse_without_env(yaml: &str) -> Result<Self, ConfigError> {
        // serde_yml reads an empty document as unit, not an empty mapping.
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yml::from_str(yaml)?)
    }
}

/// Which [`DocumentStore`](crelay_db::DocumentStore) implementation to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process, non-persistent store.
    #[default]
    Memory,
    /// `Dragonfly` (Redis-compatible) store.
    Dragonfly,
}

impl StoreBackend {
    /// Parse a backend name as written in YAML.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "memory" => Some(Self::Memory),
            "dragonfly" => Some(Self::Dragonfly),
            _ => None,
        }
    }
}

/// Document store settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StoreConfig {
    /// Store implementation.
    #[serde(default)]
    pub backend: StoreBackend,

    /// Dragonfly (Redis-compatible) URL.
    #[serde(default = "default_dragonfly_url")]
    pub dragonfly_url: String,

    /// Key prefix for every document and index.
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

impl StoreConfig {
    /// Override store settings from an environment lookup.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Env`] if `CRELAY_STORE_BACKEND` names an
    /// unknown backend.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("DRAGONFLY_URL") {
            self.dragonfly_url = url;
        }
        if let Some(value) = lookup("CRELAY_STORE_BACKEND") {
            self.backend = StoreBackend::parse(&value).ok_or(ConfigError::Env {
                name: "CRELAY_STORE_BACKEND",
                value,
            })?;
        }
        Ok(())
    }
}

impl StoreConfig {
    /// Open the configured store.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Config`] if the Dragonfly URL is invalid, or
    /// [`StoreError::Dragonfly`] if the connection fails.
    pub async fn open(&self) -> Result<Arc<dyn DocumentStore>, StoreError> {
        match self.backend {
            StoreBackend::Memory => {
                tracing::info!("Using in-memory document store");
                Ok(Arc::new(MemoryStore::new()))
            }
            StoreBackend::Dragonfly => Ok(Arc::new(
                DragonflyStore::connect(&self.dragonfly_url, &self.namespace).await?,
            )),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            dragonfly_url: default_dragonfly_url(),
            namespace: default_namespace(),
        }
    }
}

/// Reserved kinds and causality key resolution policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ProtocolConfig {
    /// Kinds the tracker and aggregator branch on.
    #[serde(default)]
    pub kinds: ProtocolKinds,

    /// Fall back to matching a key id's decimal suffix against the `op` tag
    /// when neither the kind nor the operation registry resolves a key.
    #[serde(default = "default_true")]
    pub suffix_fallback: bool,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            kinds: ProtocolKinds::default(),
            suffix_fallback: true,
        }
    }
}

/// Streaming query settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct QueryConfig {
    /// Capacity of the channel between a query's producer task and its
    /// consumer.
    #[serde(default = "default_query_buffer")]
    pub buffer: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            buffer: default_query_buffer(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error). `RUST_LOG` wins when set.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_dragonfly_url() -> String {
    "redis://localhost:6379".to_owned()
}

fn default_namespace() -> String {
    "crelay".to_owned()
}

const fn default_true() -> bool {
    true
}

const fn default_query_buffer() -> usize {
    16
}

fn default_log_level() -> String {
    "info".to_owned()
}
