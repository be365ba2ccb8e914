//! Logger configuration.
//!
//! The defaults match a plain [`Logger::init`](crate::Logger::init): the
//! container is persisted when the logger is closed and each write to disk is
//! followed by an `fsync`.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ArgumentError, Result};

/// When a [`Logger`](crate::Logger) persists its container to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum FlushPolicy {
    /// Persist on [`Logger::close`](crate::Logger::close),
    /// [`Logger::flush`](crate::Logger::flush) and drop.
    #[default]
    OnClose,
    /// Persist after every mutating call.
    EveryWrite,
    /// Persist after every `writes` mutating calls.
    Batched {
        /// Number of mutating calls between flushes.
        writes: u32,
    },
}

/// Configuration for [`Logger::open`](crate::Logger::open).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    /// When to write the container file.
    pub flush_policy: FlushPolicy,
    /// Whether every flush calls `fsync` before replacing the file.
    pub sync_on_flush: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            flush_policy: FlushPolicy::OnClose,
            sync_on_flush: true,
        }
    }
}

impl LoggerConfig {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ArgumentError::InvalidConfig`] if a batched flush policy
    /// has a zero batch size.
    pub fn validate(&self) -> Result<()> {
        if let FlushPolicy::Batched { writes: 0 } = self.flush_policy {
            return Err(ArgumentError::InvalidConfig {
                reason: "batched flush policy needs at least one write per batch".to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// Parses and validates a configuration from JSON.
    ///
    /// Missing fields take their default values.
    ///
    /// # Errors
    ///
    /// Returns [`ArgumentError::InvalidConfig`] if the JSON is malformed or
    /// the result fails [`validate`](Self::validate).
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ArgumentError::InvalidConfig {
                reason: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and validates a configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`ArgumentError::InvalidConfig`] if the file cannot be read
    /// or its contents are invalid.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|e| ArgumentError::InvalidConfig {
            reason: format!("cannot read '{}': {e}", path.display()),
        })?;
        Self::from_json_str(&json)
    }

    /// Returns true if a flush is due after `writes` unflushed mutating calls.
    pub(crate) fn flush_due(&self, writes: u32) -> bool {
        match self.flush_policy {
            FlushPolicy::OnClose => false,
            FlushPolicy::EveryWrite => true,
            FlushPolicy::Batched { writes: batch } => writes >= batch,
        }
    }
}
