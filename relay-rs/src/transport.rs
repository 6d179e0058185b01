//! Outbound SMTP client used to hand messages to the smart host
//!
//! [`MailTransport`] is the capability the relay pipeline depends on;
//! [`SmtpTransport`] is the tokio implementation speaking RFC 5321 with
//! optional STARTTLS (RFC 3207) and AUTH PLAIN / LOGIN (RFC 4954).
//!
//! Every line exchanged with the remote server is reported to a
//! [`ProtocolObserver`], which is how the protocol trace is produced.

use crate::error::{RelayError, Result};
use crate::message::Envelope;
use crate::trace::ProtocolObserver;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rustls::{ClientConfig, OwnedTrustAnchor, RootCertStore, ServerName};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Timeout for establishing the TCP connection
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for a single command/reply round trip
const COMMAND_TIMEOUT: Duration = Duration::from_secs(300); // 5 minutes

/// How STARTTLS is negotiated with the smart host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMode {
    /// Plain text session
    None,
    /// Upgrade when the server advertises STARTTLS
    Opportunistic,
    /// Fail unless the session can be upgraded
    Required,
}

/// Outbound SMTP capability
#[async_trait]
pub trait MailTransport: Send {
    async fn connect(
        &mut self,
        host: &str,
        port: u16,
        tls: TlsMode,
        cancel: &CancellationToken,
    ) -> Result<()>;

    async fn authenticate(
        &mut self,
        username: &str,
        password: &str,
        cancel: &CancellationToken,
    ) -> Result<()>;

    async fn send(&mut self, envelope: &Envelope, cancel: &CancellationToken) -> Result<()>;

    async fn disconnect(&mut self, cancel: &CancellationToken) -> Result<()>;
}

/// Creates one transport per relay transaction
pub trait TransportFactory: Send + Sync {
    fn create(&self, observer: Box<dyn ProtocolObserver>) -> Box<dyn MailTransport>;
}

/// A parsed (possibly multi-line) SMTP reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Reply {
    /// Text of all lines joined with spaces
    pub fn message(&self) -> String {
        self.lines.join(" ")
    }

    fn expect(self, accepted: &[u16]) -> Result<Self> {
        if accepted.contains(&self.code) {
            Ok(self)
        } else {
            Err(RelayError::Remote {
                code: self.code,
                message: self.message(),
            })
        }
    }
}

/// Parse one reply line into `(code, is_last, text)`
pub fn parse_reply_line(line: &str) -> Result<(u16, bool, String)> {
    let line = line.trim_end_matches(['\r', '\n']);
    let code = line
        .get(..3)
        .and_then(|c| c.parse::<u16>().ok())
        .filter(|c| (200..600).contains(c))
        .ok_or_else(|| RelayError::SmtpProtocol(format!("Invalid reply line: {}", line)))?;

    let (is_last, text) = match line.as_bytes().get(3) {
        None => (true, ""),
        Some(b' ') => (true, &line[4..]),
        Some(b'-') => (false, &line[4..]),
        Some(_) => {
            return Err(RelayError::SmtpProtocol(format!("Invalid reply line: {}", line)));
        }
    };

    Ok((code, is_last, text.to_string()))
}

/// Plain or TLS stream, so STARTTLS can swap the transport in place
enum SmtpStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for SmtpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            SmtpStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            SmtpStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for SmtpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            SmtpStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            SmtpStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            SmtpStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            SmtpStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            SmtpStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            SmtpStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Open connection with line-level I/O helpers
struct Connection {
    stream: BufReader<SmtpStream>,
}

impl Connection {
    async fn write_line(
        &mut self,
        line: &str,
        observer: &mut dyn ProtocolObserver,
        limit: Duration,
    ) -> Result<()> {
        observer.client_line(line.as_bytes());
        self.write_raw(format!("{}\r\n", line).as_bytes(), limit).await
    }

    async fn write_raw(&mut self, bytes: &[u8], limit: Duration) -> Result<()> {
        let write = async {
            self.stream.write_all(bytes).await?;
            self.stream.flush().await
        };
        timeout(limit, write)
            .await
            .map_err(|_| RelayError::Network("Timed out writing to server".to_string()))?
            .map_err(|e| RelayError::Network(format!("Write failed: {}", e)))
    }

    async fn read_reply(
        &mut self,
        observer: &mut dyn ProtocolObserver,
        limit: Duration,
    ) -> Result<Reply> {
        let mut code = None;
        let mut lines = Vec::new();
        let mut line = String::new();

        loop {
            line.clear();
            let n = timeout(limit, self.stream.read_line(&mut line))
                .await
                .map_err(|_| RelayError::Network("Timed out waiting for server reply".to_string()))?
                .map_err(|e| RelayError::Network(format!("Read failed: {}", e)))?;

            if n == 0 {
                return Err(RelayError::Network("Connection closed by server".to_string()));
            }

            observer.server_line(line.as_bytes());
            debug!("< {}", line.trim_end());

            let (line_code, is_last, text) = parse_reply_line(&line)?;
            if *code.get_or_insert(line_code) != line_code {
                return Err(RelayError::SmtpProtocol(format!(
                    "Inconsistent reply codes in multi-line reply: {}",
                    line.trim_end()
                )));
            }
            lines.push(text);

            if is_last {
                break;
            }
        }

        Ok(Reply {
            code: code.unwrap_or_default(),
            lines,
        })
    }
}

/// Race `fut` against `cancel`
async fn guarded<T, F>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(RelayError::Cancelled),
        result = fut => result,
    }
}

/// Dot-stuff a CRLF payload and append the terminator
///
/// Each line is reported to the observer as it would appear on the wire.
fn encode_data(data: &[u8], observer: &mut dyn ProtocolObserver) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 8);
    let body = data.strip_suffix(b"\r\n").unwrap_or(data);

    if !body.is_empty() {
        for line in body.split(|b| *b == b'\n') {
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            let start = out.len();
            if line.first() == Some(&b'.') {
                out.push(b'.');
            }
            out.extend_from_slice(line);
            observer.client_line(&out[start..]);
            out.extend_from_slice(b"\r\n");
        }
    }

    observer.client_line(b".");
    out.extend_from_slice(b".\r\n");
    out
}

/// Tokio SMTP client for one conversation with the smart host
pub struct SmtpTransport {
    observer: Box<dyn ProtocolObserver>,
    connector: TlsConnector,
    helo_name: String,
    connect_timeout: Duration,
    command_timeout: Duration,
    conn: Option<Connection>,
    capabilities: Vec<String>,
    encrypted: bool,
}

impl SmtpTransport {
    pub fn new(
        observer: Box<dyn ProtocolObserver>,
        connector: TlsConnector,
        helo_name: String,
    ) -> Self {
        Self {
            observer,
            connector,
            helo_name,
            connect_timeout: CONNECT_TIMEOUT,
            command_timeout: COMMAND_TIMEOUT,
            conn: None,
            capabilities: Vec::new(),
            encrypted: false,
        }
    }

    pub fn with_timeouts(mut self, connect: Duration, command: Duration) -> Self {
        self.connect_timeout = connect;
        self.command_timeout = command;
        self
    }

    /// Whether the EHLO reply advertised `keyword`
    pub fn supports(&self, keyword: &str) -> bool {
        self.capabilities
            .iter()
            .any(|cap| cap.split_whitespace().next() == Some(keyword))
    }

    fn auth_mechanisms(&self) -> Vec<String> {
        self.capabilities
            .iter()
            .filter_map(|cap| {
                let mut words = cap.split_whitespace();
                match words.next() {
                    Some("AUTH") => Some(words.map(str::to_string).collect::<Vec<_>>()),
                    _ => None,
                }
            })
            .flatten()
            .collect()
    }

    async fn command(&mut self, line: &str, accepted: &[u16]) -> Result<Reply> {
        let conn = self.conn.as_mut().ok_or_else(not_connected)?;
        conn.write_line(line, self.observer.as_mut(), self.command_timeout)
            .await?;
        conn.read_reply(self.observer.as_mut(), self.command_timeout)
            .await?
            .expect(accepted)
    }

    async fn greet(&mut self) -> Result<()> {
        let greeting = format!("EHLO {}", self.helo_name);
        match self.command(&greeting, &[250]).await {
            Ok(reply) => {
                self.capabilities = reply
                    .lines
                    .iter()
                    .skip(1)
                    .map(|l| l.trim().to_ascii_uppercase())
                    .collect();
                Ok(())
            }
            Err(RelayError::Remote { code, .. }) if code >= 500 => {
                debug!("EHLO refused ({}), falling back to HELO", code);
                self.capabilities.clear();
                let helo = format!("HELO {}", self.helo_name);
                self.command(&helo, &[250]).await.map(|_| ())
            }
            Err(e) => Err(e),
        }
    }

    async fn open(&mut self, host: &str, port: u16, tls: TlsMode) -> Result<()> {
        let addr = format!("{}:{}", host, port);
        self.observer.connect(&format!("smtp://{}", addr));

        let tcp = timeout(self.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| RelayError::Network(format!("Connection to {} timed out", addr)))?
            .map_err(|e| RelayError::Network(format!("Connection to {} failed: {}", addr, e)))?;

        self.conn = Some(Connection {
            stream: BufReader::new(SmtpStream::Plain(tcp)),
        });
        self.encrypted = false;

        let conn = self.conn.as_mut().ok_or_else(not_connected)?;
        conn.read_reply(self.observer.as_mut(), self.command_timeout)
            .await?
            .expect(&[220])?;

        self.greet().await?;

        if tls == TlsMode::None {
            return Ok(());
        }

        if self.supports("STARTTLS") {
            self.start_tls(host).await?;
            self.greet().await
        } else if tls == TlsMode::Required {
            Err(RelayError::Tls(format!("{} does not offer STARTTLS", addr)))
        } else {
            warn!("{} does not offer STARTTLS, continuing unencrypted", addr);
            Ok(())
        }
    }

    async fn start_tls(&mut self, host: &str) -> Result<()> {
        self.command("STARTTLS", &[220]).await?;

        let server_name = ServerName::try_from(host)
            .map_err(|e| RelayError::Tls(format!("Invalid server name '{}': {}", host, e)))?;

        let conn = self.conn.take().ok_or_else(not_connected)?;
        let tcp = match conn.stream.into_inner() {
            SmtpStream::Plain(tcp) => tcp,
            SmtpStream::Tls(_) => {
                return Err(RelayError::Tls("Session is already encrypted".to_string()));
            }
        };

        let tls_stream = timeout(self.connect_timeout, self.connector.connect(server_name, tcp))
            .await
            .map_err(|_| RelayError::Tls("TLS handshake timed out".to_string()))?
            .map_err(|e| RelayError::Tls(format!("TLS handshake failed: {}", e)))?;

        self.conn = Some(Connection {
            stream: BufReader::new(SmtpStream::Tls(Box::new(tls_stream))),
        });
        self.encrypted = true;
        // RFC 3207: capabilities must be discarded after the upgrade
        self.capabilities.clear();

        info!("STARTTLS negotiated with {}", host);
        Ok(())
    }

    async fn login(&mut self, username: &str, password: &str) -> Result<()> {
        let mechanisms = self.auth_mechanisms();
        let use_login = mechanisms.iter().any(|m| m == "LOGIN")
            && !mechanisms.iter().any(|m| m == "PLAIN");

        let result = if use_login {
            debug!("Authenticating with AUTH LOGIN");
            self.command("AUTH LOGIN", &[334]).await?;
            self.command(&BASE64.encode(username), &[334]).await?;
            self.command(&BASE64.encode(password), &[235]).await
        } else {
            debug!("Authenticating with AUTH PLAIN");
            let token = BASE64.encode(format!("\0{}\0{}", username, password));
            self.command(&format!("AUTH PLAIN {}", token), &[235]).await
        };

        result.map(|_| ()).map_err(|e| match e {
            RelayError::Remote { code, message } => {
                RelayError::Authentication(format!("{} {}", code, message))
            }
            other => other,
        })
    }

    async fn transmit(&mut self, envelope: &Envelope) -> Result<()> {
        self.command(&format!("MAIL FROM:<{}>", envelope.from), &[250])
            .await?;
        for recipient in &envelope.recipients {
            self.command(&format!("RCPT TO:<{}>", recipient), &[250, 251])
                .await?;
        }
        self.command("DATA", &[354]).await?;

        let payload = encode_data(&envelope.data, self.observer.as_mut());
        let conn = self.conn.as_mut().ok_or_else(not_connected)?;
        conn.write_raw(&payload, self.command_timeout).await?;
        conn.read_reply(self.observer.as_mut(), self.command_timeout)
            .await?
            .expect(&[250])?;

        Ok(())
    }
}

fn not_connected() -> RelayError {
    RelayError::SmtpProtocol("Not connected".to_string())
}

#[async_trait]
impl MailTransport for SmtpTransport {
    async fn connect(
        &mut self,
        host: &str,
        port: u16,
        tls: TlsMode,
        cancel: &CancellationToken,
    ) -> Result<()> {
        info!("Connecting to {}:{} (TLS mode {:?})", host, port, tls);
        guarded(cancel, self.open(host, port, tls)).await
    }

    async fn authenticate(
        &mut self,
        username: &str,
        password: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if !self.encrypted {
            warn!("Sending credentials for {} over an unencrypted session", username);
        }
        guarded(cancel, self.login(username, password)).await
    }

    async fn send(&mut self, envelope: &Envelope, cancel: &CancellationToken) -> Result<()> {
        info!(
            "Sending message from {} to {}",
            envelope.from,
            envelope.recipients.join(",")
        );
        guarded(cancel, self.transmit(envelope)).await
    }

    async fn disconnect(&mut self, cancel: &CancellationToken) -> Result<()> {
        let Some(mut conn) = self.conn.take() else {
            return Ok(());
        };
        self.capabilities.clear();
        self.encrypted = false;

        let observer = self.observer.as_mut();
        let limit = self.command_timeout;
        let quit = async {
            conn.write_line("QUIT", observer, limit).await?;
            // any reply (or none) is fine once QUIT went out
            let _ = conn.read_reply(observer, limit).await;
            if let Err(e) = conn.stream.shutdown().await {
                debug!("Shutdown after QUIT failed: {}", e);
            }
            Ok(())
        };
        guarded(cancel, quit).await
    }
}

/// Builds [`SmtpTransport`]s sharing one TLS client configuration
#[derive(Clone)]
pub struct SmtpTransportFactory {
    connector: TlsConnector,
    helo_name: String,
    connect_timeout: Duration,
    command_timeout: Duration,
}

impl SmtpTransportFactory {
    /// Factory verifying server certificates against the webpki root store
    pub fn new() -> Self {
        let mut roots = RootCertStore::empty();
        roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
            OwnedTrustAnchor::from_subject_spki_name_constraints(
                ta.subject,
                ta.spki,
                ta.name_constraints,
            )
        }));

        let config = ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(roots)
            .with_no_client_auth();

        Self::with_tls_config(Arc::new(config))
    }

    pub fn with_tls_config(config: Arc<ClientConfig>) -> Self {
        Self {
            connector: TlsConnector::from(config),
            helo_name: local_hostname(),
            connect_timeout: CONNECT_TIMEOUT,
            command_timeout: COMMAND_TIMEOUT,
        }
    }

    pub fn with_helo_name(mut self, name: impl Into<String>) -> Self {
        self.helo_name = name.into();
        self
    }

    pub fn with_timeouts(mut self, connect: Duration, command: Duration) -> Self {
        self.connect_timeout = connect;
        self.command_timeout = command;
        self
    }
}

impl Default for SmtpTransportFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportFactory for SmtpTransportFactory {
    fn create(&self, observer: Box<dyn ProtocolObserver>) -> Box<dyn MailTransport> {
        Box::new(
            SmtpTransport::new(observer, self.connector.clone(), self.helo_name.clone())
                .with_timeouts(self.connect_timeout, self.command_timeout),
        )
    }
}

pub(crate) fn local_hostname() -> String {
    let name = gethostname::gethostname().to_string_lossy().to_string();
    if name.is_empty() {
        "localhost".to_string()
    } else {
        name
    }
}
