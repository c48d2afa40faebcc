//! One-shot probes that open their own session.

use check_smtp_common::config::ProbeTimeouts;

use crate::{
    email::ProbeMessage,
    error::ProbeResult,
    session::SmtpProbeSession,
    transport::TransportServer,
};

/// Connects to `server` and delivers `message` to its test mailbox.
///
/// # Errors
///
/// Returns the connection failure, or the first failing step of the
/// delivery.
pub async fn check_delivery<M>(
    server: &TransportServer,
    local_name: &str,
    timeouts: &ProbeTimeouts,
    message: &mut M,
) -> ProbeResult<()>
where
    M: ProbeMessage + ?Sized,
{
    let mut session = SmtpProbeSession::connect(
        server,
        local_name,
        timeouts.connect_timeout(),
        timeouts.operation_timeout(),
    )
    .await?;

    session.send_test_email(message).await
}

/// Connects to `server` and attempts an envelope from `from`.
///
/// `Ok` means the server accepted a sender it should have refused.
///
/// # Errors
///
/// Returns the connection failure, or the step at which the server refused.
pub async fn check_spoofing(
    server: &TransportServer,
    local_name: &str,
    timeouts: &ProbeTimeouts,
    from: &str,
) -> ProbeResult<()> {
    let mut session = SmtpProbeSession::connect(
        server,
        local_name,
        timeouts.connect_timeout(),
        timeouts.operation_timeout(),
    )
    .await?;

    session.spoofing_test(from).await
}
