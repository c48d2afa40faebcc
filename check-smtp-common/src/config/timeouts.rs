//! Timeout configuration for probe sessions.
//!
//! A probe has exactly two bounds: the time allowed to establish the TCP
//! connection, and the deadline re-armed before every SMTP step.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Client-side probe timeouts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeTimeouts {
    /// Timeout for establishing the TCP connection.
    ///
    /// Default: 30 seconds
    #[serde(default = "defaults::connect_secs")]
    pub connect_secs: u64,

    /// Deadline armed on the connection before each SMTP step.
    ///
    /// Default: 30 seconds
    #[serde(default = "defaults::operation_secs")]
    pub operation_secs: u64,
}

impl ProbeTimeouts {
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }

    pub const fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_secs)
    }
}

impl Default for ProbeTimeouts {
    fn default() -> Self {
        Self {
            connect_secs: defaults::connect_secs(),
            operation_secs: defaults::operation_secs(),
        }
    }
}

mod defaults {
    pub const fn connect_secs() -> u64 {
        30
    }

    pub const fn operation_secs() -> u64 {
        30
    }
}
