//! Server configuration: an optional TOML file, then CLI flags, then env vars.
//!
//! ```toml
//! [server]
//! port = 8080
//! data_dir = "./quire-data"
//! rate_limit = 60
//!
//! [engine]
//! default_expiry_days = 14
//! max_commit_attempts = 8
//! ```

use std::path::{Path, PathBuf};

use quire_engine::EngineConfig;
use serde::{Deserialize, Serialize};

/// Default rate limit: 60 requests per minute per IP.
pub(crate) const DEFAULT_RATE_LIMIT: u64 = 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct ServerSection {
    pub(crate) port: u16,
    /// Root of the filesystem blob store (source and sealed documents).
    pub(crate) data_dir: PathBuf,
    /// Requests per minute per client IP.
    pub(crate) rate_limit: u64,
    /// Maximum request body size in bytes.
    pub(crate) max_body_bytes: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: 8080,
            data_dir: PathBuf::from("./quire-data"),
            rate_limit: DEFAULT_RATE_LIMIT,
            max_body_bytes: 10 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct ServerConfig {
    pub(crate) server: ServerSection,
    pub(crate) engine: EngineConfig,
    /// Never read from the file; only from `QUIRE_API_KEY`.
    #[serde(skip)]
    pub(crate) api_key: Option<String>,
}

impl ServerConfig {
    /// Parse a TOML document. Missing keys keep their defaults.
    pub(crate) fn from_toml(text: &str) -> Result<Self, String> {
        toml::from_str(text).map_err(|e| e.to_string())
    }

    pub(crate) fn load(path: &Path) -> Result<Self, String> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("error reading config '{}': {}", path.display(), e))?;
        Self::from_toml(&text).map_err(|e| format!("error parsing config '{}': {}", path.display(), e))
    }

    /// Apply `QUIRE_RATE_LIMIT` and `QUIRE_API_KEY`.
    pub(crate) fn apply_env(&mut self) {
        if let Some(limit) = std::env::var("QUIRE_RATE_LIMIT")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
        {
            self.server.rate_limit = limit;
        }
        self.api_key = std::env::var("QUIRE_API_KEY")
            .ok()
            .filter(|k| !k.is_empty());
    }

    /// Every problem with the merged configuration.
    pub(crate) fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = match self.engine.validate() {
            Ok(()) => Vec::new(),
            Err(errors) => errors,
        };
        if self.server.rate_limit == 0 {
            errors.push("server.rate_limit must be at least 1".to_string());
        }
        if self.server.max_body_bytes < 1024 {
            errors.push(format!(
                "server.max_body_bytes must be at least 1024, got {}",
                self.server.max_body_bytes
            ));
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
