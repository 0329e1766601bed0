use std::path::Path;

use serde::{Deserialize, Serialize};
use strata_crypto::{ChecksumAlgorithm, ChecksumScope};
use strata_types::RankInfo;

/// Errors loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Per-process runtime configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// This process's rank among the cooperating ranks.
    pub rank: u32,
    /// Number of cooperating ranks sharing the id space.
    pub rank_count: u32,
    /// Which layers checksum payloads.
    pub checksum_scope: ChecksumScope,
    pub checksum_algorithm: ChecksumAlgorithm,
    /// Largest marshaled payload accepted for a single request.
    pub max_payload_bytes: usize,
    /// Largest parent set a single request may carry.
    pub max_parents: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            rank: 0,
            rank_count: 1,
            checksum_scope: ChecksumScope::Transfer,
            checksum_algorithm: ChecksumAlgorithm::Crc32,
            max_payload_bytes: 16 * 1024 * 1024,
            max_parents: 64,
        }
    }
}

impl RuntimeConfig {
    /// Configuration for one rank of `rank_count`, all else default.
    pub fn for_rank(rank: u32, rank_count: u32) -> Self {
        Self {
            rank,
            rank_count,
            ..Self::default()
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Check the configuration and return the rank it describes.
    pub fn validate(&self) -> Result<RankInfo, ConfigError> {
        if self.max_parents == 0 {
            return Err(ConfigError::Invalid("max_parents must be positive".into()));
        }
        if self.max_payload_bytes == 0 {
            return Err(ConfigError::Invalid("max_payload_bytes must be positive".into()));
        }
        RankInfo::new(self.rank, self.rank_count).map_err(|e| ConfigError::Invalid(e.to_string()))
    }
}

/// Access intent a container is opened with.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OpenIntent {
    ReadOnly,
    #[default]
    ReadWrite,
}

/// Options for creating or opening a container.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerOptions {
    pub intent: OpenIntent,
    /// Make the latest version durable when the container is closed.
    pub persist_on_close: bool,
}

impl ContainerOptions {
    pub fn read_only() -> Self {
        Self {
            intent: OpenIntent::ReadOnly,
            persist_on_close: false,
        }
    }

    pub fn read_write() -> Self {
        Self::default()
    }

    pub fn persist_on_close(mut self, persist: bool) -> Self {
        self.persist_on_close = persist;
        self
    }

    pub fn writable(&self) -> bool {
        self.intent == OpenIntent::ReadWrite
    }
}
