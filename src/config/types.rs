//! Configuration types.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Default location of the password-change program.
pub const DEFAULT_PASSWD_PROGRAM: &str = "/usr/bin/passwd";

/// Locale forced on the backend so prompt matching does not depend on translations.
pub const DEFAULT_LOCALE: &str = "C";

/// Default number of bytes consumed per readiness notification.
pub const DEFAULT_READ_CHUNK: usize = 64;

/// Error type for configuration parsing.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("read_chunk must be greater than zero")]
    ZeroReadChunk,
}

/// Settings for spawning the password-change backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Path to the interactive password-change program.
    pub program: PathBuf,
    /// Extra arguments passed to the program.
    pub args: Vec<String>,
    /// Value exported as `LC_ALL` in the child environment.
    pub locale: String,
    /// Upper bound on bytes read per output event.
    pub read_chunk: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from(DEFAULT_PASSWD_PROGRAM),
            args: Vec::new(),
            locale: DEFAULT_LOCALE.to_string(),
            read_chunk: DEFAULT_READ_CHUNK,
        }
    }
}

impl BackendConfig {
    /// Create a config that runs `program` with all other settings at their defaults.
    #[must_use]
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    /// Parse a TOML fragment. Missing keys keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Parse` on malformed TOML and
    /// `ConfigError::ZeroReadChunk` if `read_chunk` is zero.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        if config.read_chunk == 0 {
            return Err(ConfigError::ZeroReadChunk);
        }
        Ok(config)
    }
}
