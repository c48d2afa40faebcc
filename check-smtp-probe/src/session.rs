//! Probe sessions: short SMTP conversations that classify where a server
//! stops cooperating.
//!
//! A session runs a procedure as an ordered list of steps. Each step re-arms
//! the connection deadline before it runs. The first failure is recorded
//! together with the step that produced it, and every later step in the
//! procedure is skipped without touching the connection.

use std::{
    future::Future,
    sync::Arc,
    time::{Duration, SystemTime},
};

use check_smtp_client::{ClientError, SmtpClient};
use check_smtp_common::internal;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    time::Instant,
};
use tokio_rustls::rustls::ClientConfig;
use tracing::{debug, info, warn};

use crate::{
    email::ProbeMessage,
    error::{ProbeError, ProbeResult},
    step::Step,
    tls::{CLIENT_CERTIFICATE_VALIDITY, CertificateError, CertificateGenerator, tls_version},
    transport::TransportServer,
};

/// The write-once failure record shared by every step of a session.
#[derive(Debug)]
struct ExecutionState {
    operation_timeout: Duration,
    last_step: Option<Step>,
    last_error: Option<ProbeError>,
}

impl ExecutionState {
    const fn new(operation_timeout: Duration) -> Self {
        Self {
            operation_timeout,
            last_step: None,
            last_error: None,
        }
    }

    fn record(&mut self, step: Step, cause: ClientError) {
        if self.last_error.is_none() {
            debug!(%step, error = %cause, "Probe step failed");
            self.last_error = Some(ProbeError::new(step, cause));
        }
    }

    fn outcome(&self) -> ProbeResult<()> {
        self.last_error.clone().map_or(Ok(()), Err)
    }

    /// Runs `action` as `step`, unless an earlier step already failed.
    ///
    /// A deadline that cannot be armed is recorded as a [`Step::Timeout`]
    /// failure; the action still runs, but its own error is then discarded.
    async fn run_step<'c, S, F, Fut, T>(&mut self, client: &'c mut SmtpClient<S>, step: Step, action: F)
    where
        S: AsyncRead + AsyncWrite + Unpin,
        F: FnOnce(&'c mut SmtpClient<S>) -> Fut,
        Fut: Future<Output = check_smtp_client::Result<T>>,
    {
        if self.last_error.is_some() {
            internal!(level = DEBUG, %step, "Skipping step after earlier failure");
            return;
        }

        self.last_step = Some(step);
        internal!(level = DEBUG, %step, "Running step");

        if let Err(e) = client.set_deadline(Instant::now() + self.operation_timeout) {
            self.record(Step::Timeout, e);
        }

        if let Err(e) = action(client).await {
            self.record(step, e);
        }
    }
}

/// Lazily built TLS client material, reused for every STARTTLS in a session.
#[derive(Debug, Default)]
struct TlsState {
    generator: Option<CertificateGenerator>,
    config: Option<Arc<ClientConfig>>,
}

impl TlsState {
    fn client_config(&mut self, common_name: &str) -> Result<Arc<ClientConfig>, CertificateError> {
        if let Some(config) = &self.config {
            return Ok(Arc::clone(config));
        }

        let generator = self.generator.get_or_insert_with(|| {
            CertificateGenerator::new_client(SystemTime::now(), CLIENT_CERTIFICATE_VALIDITY)
        });
        let config = Arc::new(generator.client_tls_config(common_name)?);
        self.config = Some(Arc::clone(&config));

        Ok(config)
    }
}

/// Upgrades the connection when the server advertises STARTTLS.
///
/// A server without the extension is not an error; the probe carries on in
/// plaintext.
async fn negotiate_tls<S>(
    client: &mut SmtpClient<S>,
    tls: &mut TlsState,
    local_name: &str,
) -> check_smtp_client::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if client.extension("STARTTLS").is_none() {
        debug!(server = client.server_domain(), "STARTTLS not advertised");
        return Ok(());
    }

    let config = tls
        .client_config(local_name)
        .map_err(|e| ClientError::TlsError(e.to_string()))?;

    if let Err(e) = client.starttls(config).await {
        warn!(server = client.server_domain(), error = %e, "Couldn't start TLS transaction");
        return Err(e);
    }

    let version = client
        .tls_version()
        .map_or_else(|| "unknown".to_string(), tls_version);
    info!(server = client.server_domain(), tls = %version, "TLS established");

    Ok(())
}

/// Opens DATA, stamps the message headers and submits the content.
async fn submit<S, M>(
    client: &mut SmtpClient<S>,
    message: &mut M,
    local_name: &str,
) -> check_smtp_client::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    M: ProbeMessage + ?Sized,
{
    client.data().await?;
    message.prepare_headers(local_name);
    client.send_data(&message.to_string()).await?;
    Ok(())
}

/// A single connection to a server under test.
///
/// ```no_run
/// use std::time::Duration;
///
/// use check_smtp_probe::{SmtpProbeSession, TestEmail, TransportServer};
///
/// # async fn example() {
/// let server = TransportServer::new("mx.example.com", "postmaster@example.com");
/// let timeout = Duration::from_secs(30);
///
/// match SmtpProbeSession::connect(&server, "probe.example.net", timeout, timeout).await {
///     Ok(mut session) => {
///         let mut email = TestEmail::new("probe@example.net", &server.test_email);
///         if let Err(e) = session.send_test_email(&mut email).await {
///             eprintln!("{} rejected the message at {}", server.server, e.step());
///         }
///     }
///     Err(e) => eprintln!("{e}"),
/// }
/// # }
/// ```
pub struct SmtpProbeSession<'a, S = TcpStream> {
    client: SmtpClient<S>,
    server: &'a TransportServer,
    local_name: String,
    tls: TlsState,
    state: ExecutionState,
}

impl<'a> SmtpProbeSession<'a, TcpStream> {
    /// Dials `server` and reads its greeting.
    ///
    /// # Errors
    ///
    /// A failed or slow dial is reported as [`Step::Timeout`]; a greeting
    /// failure as [`Step::Connect`].
    pub async fn connect(
        server: &'a TransportServer,
        local_name: impl Into<String>,
        connect_timeout: Duration,
        operation_timeout: Duration,
    ) -> ProbeResult<Self> {
        let stream = server.connect(connect_timeout).await.map_err(|e| {
            warn!(server = %server.server, port = server.port, error = %e, "Couldn't connect");
            ProbeError::new(Step::Timeout, ClientError::Io(e))
        })?;

        Self::from_stream(stream, server, local_name, operation_timeout).await
    }
}

impl<'a, S> SmtpProbeSession<'a, S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Starts a session over an established stream by reading the greeting.
    ///
    /// # Errors
    ///
    /// Returns a [`Step::Connect`] failure if the greeting is missing, late
    /// or negative.
    pub async fn from_stream(
        stream: S,
        server: &'a TransportServer,
        local_name: impl Into<String>,
        operation_timeout: Duration,
    ) -> ProbeResult<Self> {
        let mut client = SmtpClient::new(stream, server.server.clone());

        client
            .set_deadline(Instant::now() + operation_timeout)
            .map_err(|e| ProbeError::new(Step::Connect, e))?;
        client
            .read_greeting()
            .await
            .map_err(|e| ProbeError::new(Step::Connect, e))?;

        Ok(Self {
            client,
            server,
            local_name: local_name.into(),
            tls: TlsState::default(),
            state: ExecutionState::new(operation_timeout),
        })
    }

    /// The last step attempted and the failure recorded so far, if any.
    pub const fn last_operation(&self) -> (Option<Step>, Option<&ProbeError>) {
        (self.state.last_step, self.state.last_error.as_ref())
    }

    pub const fn is_closed(&self) -> bool {
        self.client.is_closed()
    }

    /// Delivers `message` to the server's test mailbox.
    ///
    /// Runs greeting, opportunistic STARTTLS, MAIL FROM, RCPT TO, DATA and
    /// QUIT, then closes the connection whatever the outcome.
    ///
    /// # Errors
    ///
    /// Returns the first failure, tagged with the step that produced it.
    pub async fn send_test_email<M>(&mut self, message: &mut M) -> ProbeResult<()>
    where
        M: ProbeMessage + ?Sized,
    {
        let Self {
            client,
            server,
            local_name,
            tls,
            state,
        } = self;
        let local_name: &str = local_name;
        let recipient = server.test_email.as_str();

        internal!(level = INFO, server = %server.server, to = recipient, "Starting delivery probe");

        state
            .run_step(client, Step::Greet, move |c| c.hello(local_name))
            .await;
        state
            .run_step(client, Step::StartTls, move |c| negotiate_tls(c, tls, local_name))
            .await;
        state
            .run_step(client, Step::MailFrom, |c| c.mail(message.from_address()))
            .await;
        state
            .run_step(client, Step::RcptTo, move |c| c.rcpt(recipient))
            .await;
        state
            .run_step(client, Step::Data, move |c| submit(c, message, local_name))
            .await;
        state.run_step(client, Step::Quit, |c| c.quit()).await;

        if let Err(e) = client.close().await {
            debug!(error = %e, "Error closing connection");
        }

        state.outcome()
    }

    /// Checks whether the server accepts mail from a sender it should refuse.
    ///
    /// Any failure recorded earlier on this session is cleared first. Both
    /// envelope commands report as [`Step::SpfFail`]. QUIT and close are
    /// attempted afterwards on a best-effort basis.
    ///
    /// # Errors
    ///
    /// Returns the first failure, tagged with the step that produced it.
    pub async fn spoofing_test(&mut self, from: &str) -> ProbeResult<()> {
        self.state.last_error = None;

        let Self {
            client,
            server,
            local_name,
            tls,
            state,
        } = self;
        let local_name: &str = local_name;
        let recipient = server.test_email.as_str();

        internal!(level = INFO, server = %server.server, from, "Starting spoofing probe");

        state
            .run_step(client, Step::Greet, move |c| c.hello(local_name))
            .await;
        state
            .run_step(client, Step::StartTls, move |c| negotiate_tls(c, tls, local_name))
            .await;
        state
            .run_step(client, Step::SpfFail, move |c| c.mail(from))
            .await;
        state
            .run_step(client, Step::SpfFail, move |c| c.rcpt(recipient))
            .await;

        if !client.is_closed() {
            let quit = async {
                client.set_deadline(Instant::now() + state.operation_timeout)?;
                client.quit().await
            };
            if let Err(e) = quit.await {
                debug!(error = %e, "QUIT after spoofing probe failed");
            }
        }
        if let Err(e) = client.close().await {
            debug!(error = %e, "Error closing connection");
        }

        state.outcome()
    }
}
