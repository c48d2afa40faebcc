//! SMTP client connection with deadline-bounded I/O and in-place STARTTLS.

use std::{future::Future, sync::Arc};

use ahash::AHashMap;
use check_smtp_common::{incoming, internal, outgoing};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    time::Instant,
};
use tokio_rustls::{
    TlsConnector,
    client::TlsStream,
    rustls::{ClientConfig, ProtocolVersion, pki_types::ServerName},
};

use crate::{
    error::{ClientError, Result},
    response::Response,
};

/// Initial size of the read buffer for SMTP responses.
const BUFFER_SIZE: usize = 8192;

/// Maximum size of the read buffer to prevent unbounded growth (1MB).
const MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// The transport under the client, before or after STARTTLS.
enum ClientConnection<S> {
    Plain(S),
    Tls(Box<TlsStream<S>>),
}

impl<S> ClientConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Self::Plain(stream) => {
                stream.write_all(data).await?;
                stream.flush().await?;
            }
            Self::Tls(stream) => {
                stream.write_all(data).await?;
                stream.flush().await?;
            }
        }
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = match self {
            Self::Plain(stream) => stream.read(buf).await?,
            Self::Tls(stream) => stream.read(buf).await?,
        };
        if n == 0 {
            return Err(ClientError::ConnectionClosed);
        }
        Ok(n)
    }

    async fn shutdown(&mut self) -> Result<()> {
        match self {
            Self::Plain(stream) => stream.shutdown().await?,
            Self::Tls(stream) => stream.shutdown().await?,
        }
        Ok(())
    }

    /// Runs the client handshake over the plain stream.
    async fn upgrade(self, config: Arc<ClientConfig>, server_name: ServerName<'static>) -> Result<Self> {
        match self {
            Self::Plain(stream) => {
                let stream = TlsConnector::from(config)
                    .connect(server_name, stream)
                    .await
                    .map_err(|e| ClientError::TlsError(e.to_string()))?;

                Ok(Self::Tls(Box::new(stream)))
            }
            Self::Tls(_) => Err(ClientError::TlsError(
                "Connection is already TLS".to_string(),
            )),
        }
    }

    fn protocol_version(&self) -> Option<ProtocolVersion> {
        match self {
            Self::Plain(_) => None,
            Self::Tls(stream) => stream.get_ref().1.protocol_version(),
        }
    }
}

/// Bounds `operation` by the armed deadline, if any.
async fn within<T>(
    deadline: Option<Instant>,
    operation: impl Future<Output = Result<T>>,
) -> Result<T> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, operation)
            .await
            .map_err(|_| ClientError::Timeout)?,
        None => operation.await,
    }
}

/// Escapes lines starting with `.` and normalises line endings to CRLF.
fn dot_stuff(content: &str) -> String {
    let mut stuffed = String::with_capacity(content.len() + 16);

    for line in content.split_inclusive('\n') {
        let text = line.strip_suffix('\n').unwrap_or(line);
        let text = text.strip_suffix('\r').unwrap_or(text);

        if text.starts_with('.') {
            stuffed.push('.');
        }
        stuffed.push_str(text);
        stuffed.push_str("\r\n");
    }

    stuffed
}

/// An SMTP client over a single connection.
///
/// Every network operation is bounded by the deadline last armed with
/// [`SmtpClient::set_deadline`]. A client starts without a deadline.
pub struct SmtpClient<S = TcpStream> {
    connection: Option<ClientConnection<S>>,
    buffer: Vec<u8>,
    buffer_pos: usize,
    server_domain: String,
    local_name: Option<String>,
    extensions: AHashMap<String, String>,
    deadline: Option<Instant>,
}

impl<S> SmtpClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wraps an established stream. Nothing is read until
    /// [`SmtpClient::read_greeting`].
    ///
    /// `server_domain` is the name presented for SNI when upgrading to TLS.
    pub fn new(stream: S, server_domain: impl Into<String>) -> Self {
        Self {
            connection: Some(ClientConnection::Plain(stream)),
            buffer: vec![0u8; BUFFER_SIZE],
            buffer_pos: 0,
            server_domain: server_domain.into(),
            local_name: None,
            extensions: AHashMap::new(),
            deadline: None,
        }
    }

    pub fn server_domain(&self) -> &str {
        &self.server_domain
    }

    /// Returns `true` once [`SmtpClient::close`] ran or the TLS upgrade lost the stream.
    pub const fn is_closed(&self) -> bool {
        self.connection.is_none()
    }

    pub fn is_tls(&self) -> bool {
        matches!(self.connection, Some(ClientConnection::Tls(_)))
    }

    /// The negotiated TLS protocol version, if the connection was upgraded.
    pub fn tls_version(&self) -> Option<ProtocolVersion> {
        self.connection
            .as_ref()
            .and_then(ClientConnection::protocol_version)
    }

    /// Arms the deadline for all subsequent network operations.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::ConnectionClosed`] if the connection is gone.
    pub fn set_deadline(&mut self, deadline: Instant) -> Result<()> {
        if self.connection.is_none() {
            return Err(ClientError::ConnectionClosed);
        }
        self.deadline = Some(deadline);
        Ok(())
    }

    /// Looks up a service extension from the last EHLO reply.
    ///
    /// Returns the extension parameters (possibly empty) when advertised.
    pub fn extension(&self, name: &str) -> Option<&str> {
        self.extensions
            .get(&name.to_ascii_uppercase())
            .map(String::as_str)
    }

    /// Reads the server greeting, which must be `220`.
    ///
    /// # Errors
    ///
    /// Returns an error if reading fails or the server is not ready.
    pub async fn read_greeting(&mut self) -> Result<Response> {
        self.read_response().await?.expect(220..=220)
    }

    /// Sends a command line without waiting for the reply.
    ///
    /// # Errors
    ///
    /// Returns an error if sending fails.
    pub async fn send_command(&mut self, command: &str) -> Result<()> {
        outgoing!("{command}");

        let data = format!("{command}\r\n");
        let deadline = self.deadline;
        let connection = self
            .connection
            .as_mut()
            .ok_or(ClientError::ConnectionClosed)?;

        within(deadline, connection.send(data.as_bytes())).await
    }

    /// Sends a command and reads its reply, whatever the status code.
    ///
    /// # Errors
    ///
    /// Returns an error if sending or reading fails.
    pub async fn command(&mut self, command: &str) -> Result<Response> {
        self.send_command(command).await?;
        self.read_response().await
    }

    /// Greets the server with EHLO, falling back to HELO when EHLO is refused.
    ///
    /// The advertised extensions are recorded; after a HELO fallback none are.
    ///
    /// # Errors
    ///
    /// Returns an error if both greetings fail.
    pub async fn hello(&mut self, local_name: &str) -> Result<Response> {
        self.local_name = Some(local_name.to_string());
        self.extensions.clear();

        let response = self.command(&format!("EHLO {local_name}")).await?;
        if response.code == 250 {
            self.extensions = response.extensions();
            return Ok(response);
        }

        internal!(level = DEBUG, code = response.code, "EHLO refused, trying HELO");
        self.command(&format!("HELO {local_name}"))
            .await?
            .expect(250..=250)
    }

    /// Issues STARTTLS and upgrades the connection in place.
    ///
    /// Any plaintext still buffered is discarded before the handshake. When a
    /// greeting was sent earlier, EHLO is repeated over the encrypted channel
    /// to refresh the extension list.
    ///
    /// # Errors
    ///
    /// Returns an error if the server name is not usable for TLS, the server
    /// refuses STARTTLS or the handshake fails. An unusable name is rejected
    /// before anything is sent. A failed handshake leaves the client closed.
    pub async fn starttls(&mut self, config: Arc<ClientConfig>) -> Result<Response> {
        let server_name = ServerName::try_from(self.server_domain.clone())
            .map_err(|e| ClientError::TlsError(format!("Invalid server name: {e}")))?;

        let response = self.command("STARTTLS").await?.expect(220..=220)?;
        let connection = self
            .connection
            .take()
            .ok_or(ClientError::ConnectionClosed)?;

        self.buffer_pos = 0;
        self.extensions.clear();
        self.connection = Some(within(self.deadline, connection.upgrade(config, server_name)).await?);

        if let Some(local_name) = self.local_name.clone() {
            self.hello(&local_name).await?;
        }

        Ok(response)
    }

    /// Sends `MAIL FROM`, expecting `250`.
    ///
    /// # Errors
    ///
    /// Returns an error if the sender is refused.
    pub async fn mail(&mut self, from: &str) -> Result<Response> {
        let command = if self.extension("8BITMIME").is_some() {
            format!("MAIL FROM:<{from}> BODY=8BITMIME")
        } else {
            format!("MAIL FROM:<{from}>")
        };
        self.command(&command).await?.expect(250..=250)
    }

    /// Sends `RCPT TO`, expecting `250` or `251`.
    ///
    /// # Errors
    ///
    /// Returns an error if the recipient is refused.
    pub async fn rcpt(&mut self, to: &str) -> Result<Response> {
        self.command(&format!("RCPT TO:<{to}>"))
            .await?
            .expect(250..=251)
    }

    /// Sends `DATA`, expecting `354`.
    ///
    /// # Errors
    ///
    /// Returns an error if the server will not accept message content.
    pub async fn data(&mut self) -> Result<Response> {
        self.command("DATA").await?.expect(354..=354)
    }

    /// Writes the message content followed by the end-of-data marker.
    ///
    /// # Errors
    ///
    /// Returns an error if sending fails or the message is refused.
    pub async fn send_data(&mut self, content: &str) -> Result<Response> {
        let mut payload = dot_stuff(content);
        payload.push_str(".\r\n");

        outgoing!(bytes = payload.len(), "message content");

        let deadline = self.deadline;
        let connection = self
            .connection
            .as_mut()
            .ok_or(ClientError::ConnectionClosed)?;
        within(deadline, connection.send(payload.as_bytes())).await?;

        self.read_response().await?.expect(250..=250)
    }

    /// Sends `QUIT`, expecting `221`, then closes the connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the exchange fails. The connection is closed
    /// only when the server acknowledged.
    pub async fn quit(&mut self) -> Result<Response> {
        let response = self.command("QUIT").await?.expect(221..=221)?;
        self.close().await?;
        Ok(response)
    }

    /// Shuts the connection down. Closing an already closed client is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the shutdown fails; the connection is dropped
    /// regardless.
    pub async fn close(&mut self) -> Result<()> {
        let Some(mut connection) = self.connection.take() else {
            return Ok(());
        };
        within(self.deadline, connection.shutdown()).await
    }

    async fn read_response(&mut self) -> Result<Response> {
        loop {
            if let Some((response, consumed)) = Response::parse(&self.buffer[..self.buffer_pos])? {
                self.buffer.copy_within(consumed..self.buffer_pos, 0);
                self.buffer_pos -= consumed;

                incoming!("{} {}", response.code, response.message());
                return Ok(response);
            }

            if self.buffer_pos >= self.buffer.len() {
                let new_size = self.buffer.len() * 2;
                if new_size > MAX_BUFFER_SIZE {
                    return Err(ClientError::ParseError(format!(
                        "Response too large (exceeds {MAX_BUFFER_SIZE} bytes)"
                    )));
                }
                self.buffer.resize(new_size, 0);
            }

            let deadline = self.deadline;
            let connection = self
                .connection
                .as_mut()
                .ok_or(ClientError::ConnectionClosed)?;
            let n = within(deadline, connection.read(&mut self.buffer[self.buffer_pos..])).await?;
            self.buffer_pos += n;
        }
    }
}
