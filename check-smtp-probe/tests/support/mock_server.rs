//! Mock SMTP server for probe scenarios
#![allow(dead_code)] // Test utility module - not all methods used in every test
//!
//! The server can:
//! - Answer each command with a configured response
//! - Advertise and perform STARTTLS with a throwaway certificate
//! - Delay the greeting or every response to exercise deadlines
//! - Record received commands, completed TLS handshakes and disconnects
//!
//! # Example
//!
//! ```rust,no_run
//! use support::mock_server::MockSmtpServer;
//!
//! # async fn example() -> std::io::Result<()> {
//! let server = MockSmtpServer::builder()
//!     .with_rcpt_to_response(550, "User unknown")
//!     .build()
//!     .await?;
//!
//! let transport = server.transport("probe@example.com");
//! # Ok(())
//! # }
//! ```

use std::{
    fmt::Write as _,
    io,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use check_smtp_probe::TransportServer;
use rcgen::CertifiedKey;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::RwLock,
    time::timeout,
};
use tokio_rustls::{
    TlsAcceptor,
    rustls::{ServerConfig, pki_types::PrivateKeyDer},
};

/// SMTP command received by the mock server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmtpCommand {
    Ehlo(String),
    Helo(String),
    /// Arguments after `MAIL`, e.g. `FROM:<a@x.com>`
    MailFrom(String),
    /// Arguments after `RCPT`, e.g. `TO:<b@y.com>`
    RcptTo(String),
    Data,
    /// Message content received after DATA, without the terminating dot
    MessageContent(String),
    Quit,
    StartTls,
    Other(String),
}

#[derive(Debug, Clone)]
pub struct SmtpResponse {
    pub code: u16,
    pub message: String,
}

impl SmtpResponse {
    fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        format!("{} {}\r\n", self.code, self.message).into_bytes()
    }
}

#[derive(Clone)]
struct MockServerConfig {
    greeting: SmtpResponse,
    /// `None` refuses EHLO so clients fall back to HELO
    capabilities: Option<Vec<String>>,
    helo_response: SmtpResponse,
    mail_from_response: SmtpResponse,
    rcpt_to_response: SmtpResponse,
    data_response: SmtpResponse,
    data_end_response: SmtpResponse,
    quit_response: SmtpResponse,
    starttls_response: Option<SmtpResponse>,
    /// Without an acceptor, the server hangs up after agreeing to STARTTLS
    tls_acceptor: Option<TlsAcceptor>,

    greeting_delay: Option<Duration>,
    response_delay: Option<Duration>,
}

impl MockServerConfig {
    fn ehlo_bytes(&self, tls_active: bool) -> Vec<u8> {
        let Some(capabilities) = &self.capabilities else {
            return SmtpResponse::new(502, "Command not recognised").to_bytes();
        };

        let advertised: Vec<&str> = std::iter::once("mock.localhost")
            .chain(capabilities.iter().map(String::as_str))
            .filter(|cap| !(tls_active && cap.eq_ignore_ascii_case("STARTTLS")))
            .collect();

        let mut response = String::new();
        for (i, cap) in advertised.iter().enumerate() {
            let separator = if i + 1 < advertised.len() { '-' } else { ' ' };
            let _ = write!(&mut response, "250{separator}{cap}\r\n");
        }
        response.into_bytes()
    }
}

impl Default for MockServerConfig {
    fn default() -> Self {
        Self {
            greeting: SmtpResponse::new(220, "Mock SMTP Server"),
            capabilities: Some(vec!["SIZE 10000".to_string()]),
            helo_response: SmtpResponse::new(250, "Hello"),
            mail_from_response: SmtpResponse::new(250, "OK"),
            rcpt_to_response: SmtpResponse::new(250, "OK"),
            data_response: SmtpResponse::new(354, "Start mail input; end with <CRLF>.<CRLF>"),
            data_end_response: SmtpResponse::new(250, "OK: Message accepted"),
            quit_response: SmtpResponse::new(221, "Bye"),
            starttls_response: None,
            tls_acceptor: None,
            greeting_delay: None,
            response_delay: None,
        }
    }
}

#[derive(Default)]
struct ServerState {
    commands: RwLock<Vec<SmtpCommand>>,
    tls_sessions: AtomicUsize,
    disconnects: AtomicUsize,
}

enum Outcome {
    Closed,
    StartTls,
}

pub struct MockSmtpServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
}

impl MockSmtpServer {
    #[must_use]
    pub fn builder() -> MockSmtpServerBuilder {
        MockSmtpServerBuilder::new()
    }

    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// A transport pointing at this server.
    #[must_use]
    pub fn transport(&self, test_email: &str) -> TransportServer {
        TransportServer::new(self.addr.ip().to_string(), test_email).with_port(self.addr.port())
    }

    pub async fn commands(&self) -> Vec<SmtpCommand> {
        self.state.commands.read().await.clone()
    }

    /// Number of completed server-side TLS handshakes
    #[must_use]
    pub fn tls_sessions(&self) -> usize {
        self.state.tls_sessions.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn disconnects(&self) -> usize {
        self.state.disconnects.load(Ordering::SeqCst)
    }

    /// Waits until `count` client connections have ended, or five seconds pass.
    pub async fn wait_for_disconnects(&self, count: usize) -> usize {
        let _ = timeout(Duration::from_secs(5), async {
            while self.disconnects() < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        self.disconnects()
    }

    async fn handle_client(stream: TcpStream, config: Arc<MockServerConfig>, state: Arc<ServerState>) {
        if let Err(e) = Self::converse(stream, &config, &state).await {
            tracing::debug!("Mock server connection error: {e}");
        }
        state.disconnects.fetch_add(1, Ordering::SeqCst);
    }

    async fn converse(stream: TcpStream, config: &MockServerConfig, state: &ServerState) -> io::Result<()> {
        if let Some(delay) = config.greeting_delay {
            tokio::time::sleep(delay).await;
        }

        let mut stream = BufReader::new(stream);
        stream.write_all(&config.greeting.to_bytes()).await?;
        stream.flush().await?;

        if let Outcome::StartTls = Self::serve(&mut stream, config, state, false).await?
            && let Some(acceptor) = &config.tls_acceptor
        {
            let tls = acceptor.accept(stream.into_inner()).await?;
            state.tls_sessions.fetch_add(1, Ordering::SeqCst);

            let mut tls = BufReader::new(tls);
            Self::serve(&mut tls, config, state, true).await?;
        }

        Ok(())
    }

    /// Answers commands until the client leaves, quits, or a TLS upgrade is due.
    async fn serve<S>(
        stream: &mut BufReader<S>,
        config: &MockServerConfig,
        state: &ServerState,
        tls_active: bool,
    ) -> io::Result<Outcome>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut line = String::new();

        loop {
            line.clear();
            if stream.read_line(&mut line).await? == 0 {
                return Ok(Outcome::Closed);
            }

            let cmd_line = line.trim();
            tracing::debug!("Mock server received: {cmd_line}");

            let (verb, args) = cmd_line.split_once(' ').unwrap_or((cmd_line, ""));
            let (response, command) = match verb.to_ascii_uppercase().as_str() {
                "EHLO" => (config.ehlo_bytes(tls_active), SmtpCommand::Ehlo(args.to_string())),
                "HELO" => (config.helo_response.to_bytes(), SmtpCommand::Helo(args.to_string())),
                "MAIL" => (
                    config.mail_from_response.to_bytes(),
                    SmtpCommand::MailFrom(args.to_string()),
                ),
                "RCPT" => (
                    config.rcpt_to_response.to_bytes(),
                    SmtpCommand::RcptTo(args.to_string()),
                ),
                "DATA" => (config.data_response.to_bytes(), SmtpCommand::Data),
                "QUIT" => (config.quit_response.to_bytes(), SmtpCommand::Quit),
                "STARTTLS" => (
                    config
                        .starttls_response
                        .as_ref()
                        .filter(|_| !tls_active)
                        .map_or_else(
                            || SmtpResponse::new(502, "Command not implemented").to_bytes(),
                            SmtpResponse::to_bytes,
                        ),
                    SmtpCommand::StartTls,
                ),
                _ => (
                    SmtpResponse::new(500, "Unknown command").to_bytes(),
                    SmtpCommand::Other(cmd_line.to_string()),
                ),
            };

            state.commands.write().await.push(command.clone());

            if let Some(delay) = config.response_delay {
                tokio::time::sleep(delay).await;
            }
            stream.write_all(&response).await?;
            stream.flush().await?;

            match command {
                SmtpCommand::Data if config.data_response.code == 354 => {
                    let content = Self::read_content(stream).await?;
                    state
                        .commands
                        .write()
                        .await
                        .push(SmtpCommand::MessageContent(content));

                    stream.write_all(&config.data_end_response.to_bytes()).await?;
                    stream.flush().await?;
                }
                SmtpCommand::Quit => {
                    // Let the client close first so its shutdown never races ours.
                    let mut rest = String::new();
                    let _ = timeout(Duration::from_secs(5), stream.read_line(&mut rest)).await;
                    return Ok(Outcome::Closed);
                }
                SmtpCommand::StartTls
                    if !tls_active
                        && config
                            .starttls_response
                            .as_ref()
                            .is_some_and(|response| response.code == 220) =>
                {
                    return Ok(Outcome::StartTls);
                }
                _ => {}
            }
        }
    }

    async fn read_content<S>(stream: &mut BufReader<S>) -> io::Result<String>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut content = String::new();
        let mut line = String::new();

        loop {
            line.clear();
            if stream.read_line(&mut line).await? == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            if line == ".\r\n" {
                return Ok(content);
            }
            content.push_str(&line);
        }
    }
}

/// Builder for configuring a `MockSmtpServer`
pub struct MockSmtpServerBuilder {
    config: MockServerConfig,
}

impl MockSmtpServerBuilder {
    fn new() -> Self {
        Self {
            config: MockServerConfig::default(),
        }
    }

    #[must_use]
    pub fn with_greeting(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.greeting = SmtpResponse::new(code, message);
        self
    }

    /// Advertise `capabilities` in the EHLO reply
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: &[&str]) -> Self {
        self.config.capabilities = Some(capabilities.iter().map(ToString::to_string).collect());
        self
    }

    /// Refuse EHLO with 502
    #[must_use]
    pub fn without_ehlo(mut self) -> Self {
        self.config.capabilities = None;
        self
    }

    #[must_use]
    pub fn with_mail_from_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.mail_from_response = SmtpResponse::new(code, message);
        self
    }

    #[must_use]
    pub fn with_rcpt_to_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.rcpt_to_response = SmtpResponse::new(code, message);
        self
    }

    #[must_use]
    pub fn with_data_end_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.data_end_response = SmtpResponse::new(code, message);
        self
    }

    /// Advertise STARTTLS and complete the handshake with a self-signed certificate
    #[must_use]
    pub fn with_starttls(mut self) -> Self {
        self.advertise_starttls();
        self.config.tls_acceptor = Some(tls_acceptor());
        self
    }

    /// Advertise STARTTLS, agree to it, then drop the connection
    #[must_use]
    pub fn with_broken_starttls(mut self) -> Self {
        self.advertise_starttls();
        self.config.tls_acceptor = None;
        self
    }

    #[must_use]
    pub const fn with_greeting_delay(mut self, delay: Duration) -> Self {
        self.config.greeting_delay = Some(delay);
        self
    }

    /// Add a delay before sending each command response
    #[must_use]
    pub const fn with_response_delay(mut self, delay: Duration) -> Self {
        self.config.response_delay = Some(delay);
        self
    }

    fn advertise_starttls(&mut self) {
        let capabilities = self.config.capabilities.get_or_insert_with(Vec::new);
        if !capabilities.iter().any(|cap| cap == "STARTTLS") {
            capabilities.push("STARTTLS".to_string());
        }
        self.config.starttls_response = Some(SmtpResponse::new(220, "Ready to start TLS"));
    }

    /// Build and start the mock SMTP server
    ///
    /// # Errors
    ///
    /// Returns an error if the server fails to bind to a port
    pub async fn build(self) -> io::Result<MockSmtpServer> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let config = Arc::new(self.config);
        let state = Arc::new(ServerState::default());

        let accept_state = Arc::clone(&state);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(MockSmtpServer::handle_client(
                    stream,
                    Arc::clone(&config),
                    Arc::clone(&accept_state),
                ));
            }
        });

        Ok(MockSmtpServer { addr, state })
    }
}

fn tls_acceptor() -> TlsAcceptor {
    let CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
            .expect("generate server certificate");
    let key = PrivateKeyDer::Pkcs8(key_pair.serialize_der().into());

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert.der().clone()], key)
        .expect("build server TLS config");

    TlsAcceptor::from(Arc::new(config))
}
