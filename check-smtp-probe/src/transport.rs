use std::{io, time::Duration};

use check_smtp_common::config::ServerConfig;
use tokio::net::TcpStream;

/// The standard SMTP relay port.
pub const SMTP_PORT: u16 = 25;

/// A remote mail server under test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportServer {
    /// Host name or address to dial. Also presented as the TLS server name.
    pub server: String,
    pub port: u16,
    /// Mailbox on the server that receives the delivery probe.
    pub test_email: String,
}

impl TransportServer {
    pub fn new(server: impl Into<String>, test_email: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            port: SMTP_PORT,
            test_email: test_email.into(),
        }
    }

    #[must_use]
    pub const fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Dials the server, giving up after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns the dial error, or [`io::ErrorKind::TimedOut`] when the
    /// connection was not established in time.
    pub async fn connect(&self, timeout: Duration) -> io::Result<TcpStream> {
        tokio::time::timeout(timeout, TcpStream::connect((self.server.as_str(), self.port)))
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!(
                        "Connecting to {}:{} timed out after {timeout:?}",
                        self.server, self.port
                    ),
                )
            })?
    }
}

impl From<ServerConfig> for TransportServer {
    fn from(config: ServerConfig) -> Self {
        Self {
            server: config.host,
            port: config.port,
            test_email: config.test_email,
        }
    }
}
