//! Probe sessions against remote SMTP servers.
//!
//! A probe opens one connection and drives a short scripted conversation:
//! either a full delivery of a test message, or a spoofing check that only
//! offers an envelope from a sender the server ought to refuse. The outcome
//! is the first failing [`Step`] and its cause.

mod email;
mod error;
mod probe;
mod session;
mod step;
mod tls;
mod transport;

pub use email::{ProbeMessage, TestEmail};
pub use error::{ProbeError, ProbeResult};
pub use probe::{check_delivery, check_spoofing};
pub use session::SmtpProbeSession;
pub use step::Step;
pub use tls::{CLIENT_CERTIFICATE_VALIDITY, CertificateError, CertificateGenerator, tls_version};
pub use transport::{SMTP_PORT, TransportServer};

pub use check_smtp_client::ClientError;
