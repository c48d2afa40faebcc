//! A small SMTP client for probing remote mail servers.
//!
//! The client speaks only the command subset a probe needs: the greeting,
//! EHLO/HELO, STARTTLS, MAIL FROM, RCPT TO, DATA and QUIT. Every network
//! operation is bounded by a deadline the caller re-arms between steps, and
//! STARTTLS upgrades the existing connection in place.
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use check_smtp_client::SmtpClient;
//! use tokio::{net::TcpStream, time::Instant};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let stream = TcpStream::connect("mx.example.com:25").await?;
//! let mut client = SmtpClient::new(stream, "mx.example.com");
//! client.set_deadline(Instant::now() + Duration::from_secs(30))?;
//! client.read_greeting().await?;
//! client.hello("probe.example.net").await?;
//! client.quit().await?;
//! # Ok(())
//! # }
//! ```

mod client;
mod error;
mod response;

pub use client::SmtpClient;
pub use error::{ClientError, Result};
pub use response::Response;
