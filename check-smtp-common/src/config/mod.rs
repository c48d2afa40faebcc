//! Configuration types for the check-smtp probe.
//!
//! Configuration is read from a RON file. Every field has a default so an
//! empty `()` document is a valid configuration.
//!
//! ## Modules
//!
//! - [`timeouts`]: connection and per-step timeouts

pub mod timeouts;

use std::{
    io,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use timeouts::ProbeTimeouts;

/// Errors raised while loading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config from {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] ron::error::SpannedError),
}

/// The mail server a probe is pointed at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host name or address to dial. Also used as the TLS server name.
    pub host: String,

    /// Default: 25
    #[serde(default = "defaults::port")]
    pub port: u16,

    /// Mailbox on the remote server that receives the test message.
    pub test_email: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Name announced in EHLO and used as the client certificate common name.
    ///
    /// Default: `localhost`
    #[serde(default = "defaults::local_name")]
    pub local_name: String,

    /// Envelope sender used for the delivery probe.
    ///
    /// Default: `postmaster@<local_name>`
    #[serde(default)]
    pub from: Option<String>,

    #[serde(default)]
    pub timeouts: ProbeTimeouts,

    #[serde(default)]
    pub server: Option<ServerConfig>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            local_name: defaults::local_name(),
            from: None,
            timeouts: ProbeTimeouts::default(),
            server: None,
        }
    }
}

impl ProbeConfig {
    /// Parses a configuration from RON source.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] if the document is not valid RON or does
    /// not match the configuration schema.
    pub fn from_ron(source: &str) -> Result<Self, ConfigError> {
        Ok(ron::from_str(source)?)
    }

    /// Reads and parses the configuration file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        Self::from_ron(&source)
    }

    /// The envelope sender for the delivery probe.
    pub fn sender(&self) -> String {
        self.from
            .clone()
            .unwrap_or_else(|| format!("postmaster@{}", self.local_name))
    }
}

mod defaults {
    pub fn local_name() -> String {
        String::from("localhost")
    }

    pub const fn port() -> u16 {
        25
    }
}
