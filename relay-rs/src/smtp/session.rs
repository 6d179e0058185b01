use crate::error::Result;
use crate::message::Envelope;
use crate::relay::RelayTransaction;
use crate::smtp::commands::SmtpCommand;
use crate::trace::ProtocolObserver;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Maximum number of recipients per message
const MAX_RECIPIENTS: usize = 100;

/// Maximum line length in SMTP protocol (RFC 5321), CRLF included
const MAX_LINE_LENGTH: usize = 1000;

/// Timeout for reading a command line
const COMMAND_TIMEOUT: Duration = Duration::from_secs(300); // 5 minutes

/// Timeout for reading DATA content
const DATA_TIMEOUT: Duration = Duration::from_secs(600); // 10 minutes

/// Default maximum message size
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 25 * 1024 * 1024;

/// Maximum number of errors before disconnecting
const MAX_ERRORS: usize = 10;

#[derive(Debug, Clone, PartialEq)]
enum SmtpState {
    Fresh,
    Greeted,
    MailFrom,
    RcptTo,
    Data,
}

/// What a bounded line read produced
enum Input {
    Line,
    TooLong,
    Closed,
    /// Session must end after sending this reply
    Abort(&'static str),
}

/// Read one line of at most `MAX_LINE_LENGTH` bytes into `buf`
///
/// An over-long line is consumed up to its newline and reported as
/// [`Input::TooLong`].
async fn read_bounded_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<Input>
where
    R: AsyncBufRead + Unpin,
{
    let limit = MAX_LINE_LENGTH as u64 + 1;

    buf.clear();
    let n = (&mut *reader).take(limit).read_until(b'\n', buf).await?;
    if n == 0 {
        return Ok(Input::Closed);
    }
    if buf.len() <= MAX_LINE_LENGTH {
        return Ok(Input::Line);
    }

    while buf.last() != Some(&b'\n') {
        buf.clear();
        if (&mut *reader).take(limit).read_until(b'\n', buf).await? == 0 {
            break;
        }
    }
    buf.clear();
    Ok(Input::TooLong)
}

/// [`read_bounded_line`] bounded by `limit` and by the session's cancellation
async fn next_input<R>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    limit: Duration,
    cancel: &CancellationToken,
) -> std::io::Result<Input>
where
    R: AsyncBufRead + Unpin,
{
    tokio::select! {
        _ = cancel.cancelled() => Ok(Input::Abort("421 4.3.2 Service shutting down\r\n")),
        read = timeout(limit, read_bounded_line(reader, buf)) => match read {
            Ok(input) => input,
            Err(_) => Ok(Input::Abort("421 4.4.2 Timeout, closing connection\r\n")),
        },
    }
}

fn strip_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Inbound SMTP session collecting messages for the relay
///
/// Speaks HELO/EHLO, MAIL, RCPT, DATA, RSET, NOOP and QUIT. Each completed
/// DATA transaction is handed to [`RelayTransaction::relay`] and the client
/// gets the relay outcome as its reply.
///
/// # Limits
/// - Command and DATA timeouts
/// - Line length and message size limits
/// - Recipient limit
/// - Error counting to drop misbehaving clients
pub struct SmtpSession {
    state: SmtpState,
    from: Option<String>,
    to: Vec<String>,
    data: Vec<u8>,
    hostname: String,
    peer: IpAddr,
    relay: Arc<RelayTransaction>,
    observer: Box<dyn ProtocolObserver>,
    cancel: CancellationToken,
    error_count: usize,
    max_message_size: usize,
}

impl SmtpSession {
    pub fn new(
        hostname: String,
        peer: IpAddr,
        relay: Arc<RelayTransaction>,
        observer: Box<dyn ProtocolObserver>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            state: SmtpState::Fresh,
            from: None,
            to: Vec::new(),
            data: Vec::new(),
            hostname,
            peer,
            relay,
            observer,
            cancel,
            error_count: 0,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    pub fn with_max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    /// Run the session until QUIT, disconnect, timeout or shutdown
    pub async fn handle<S>(mut self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.observer.connect(&format!("inbound from {}", self.peer));

        let mut stream = BufReader::new(stream);
        let greeting = format!("220 {} ESMTP smtp-relay\r\n", self.hostname);
        self.respond(&mut stream, &greeting).await?;

        let mut line = Vec::with_capacity(512);
        loop {
            if self.error_count >= MAX_ERRORS {
                warn!("Too many errors from {}, disconnecting", self.peer);
                self.respond(&mut stream, "421 4.7.0 Too many errors, closing connection\r\n")
                    .await?;
                break;
            }

            match next_input(&mut stream, &mut line, COMMAND_TIMEOUT, &self.cancel).await? {
                Input::Line => {}
                Input::TooLong => {
                    error!("Line too long from {}", self.peer);
                    self.respond(&mut stream, "500 5.5.2 Line too long\r\n").await?;
                    self.error_count += 1;
                    continue;
                }
                Input::Closed => {
                    debug!("Client {} disconnected", self.peer);
                    break;
                }
                Input::Abort(reply) => {
                    warn!("Closing session with {}: {}", self.peer, reply.trim_end());
                    self.respond(&mut stream, reply).await?;
                    break;
                }
            }

            let text = String::from_utf8_lossy(strip_line_ending(&line)).to_string();
            self.observer.client_line(text.as_bytes());
            debug!("Received: {}", text);

            let cmd = match SmtpCommand::parse(&text) {
                Ok(cmd) => cmd,
                Err(e) => {
                    debug!("Command parse error: {}", e);
                    self.respond(&mut stream, "500 5.5.2 Syntax error, command unrecognized\r\n")
                        .await?;
                    self.error_count += 1;
                    continue;
                }
            };

            let ends_transaction = matches!(cmd, SmtpCommand::Rset);
            let response = self.handle_command(cmd);
            if ends_transaction {
                self.respond_checkpoint(&mut stream, &response).await?;
            } else {
                self.respond(&mut stream, &response).await?;
            }

            if response.starts_with("221") {
                break;
            }

            if self.state == SmtpState::Data {
                match self.receive_data(&mut stream, &mut line).await? {
                    Some(reply) => self.respond_checkpoint(&mut stream, &reply).await?,
                    None => break,
                }
            }
        }

        // the peer may already be gone
        let _ = stream.shutdown().await;
        Ok(())
    }

    fn handle_command(&mut self, cmd: SmtpCommand) -> String {
        match (&self.state, cmd) {
            (SmtpState::Fresh, SmtpCommand::Helo(domain)) => {
                info!("HELO from {} ({})", domain, self.peer);
                self.state = SmtpState::Greeted;
                format!("250 {} Hello {}\r\n", self.hostname, domain)
            }
            (SmtpState::Fresh, SmtpCommand::Ehlo(domain)) => {
                info!("EHLO from {} ({})", domain, self.peer);
                self.state = SmtpState::Greeted;
                format!(
                    "250-{} Hello {}\r\n250-SIZE {}\r\n250-8BITMIME\r\n250 HELP\r\n",
                    self.hostname, domain, self.max_message_size
                )
            }
            (SmtpState::Greeted, SmtpCommand::MailFrom(from)) => {
                debug!("MAIL FROM: {}", from);
                self.from = Some(from);
                self.to.clear();
                self.data.clear();
                self.state = SmtpState::MailFrom;
                "250 2.1.0 OK\r\n".to_string()
            }
            (SmtpState::MailFrom | SmtpState::RcptTo, SmtpCommand::RcptTo(to)) => {
                if self.to.len() >= MAX_RECIPIENTS {
                    warn!("Too many recipients from {}: {}", self.peer, self.to.len());
                    return format!("452 4.5.3 Too many recipients (max {})\r\n", MAX_RECIPIENTS);
                }

                debug!("RCPT TO: {}", to);
                self.to.push(to);
                self.state = SmtpState::RcptTo;
                "250 2.1.5 OK\r\n".to_string()
            }
            (SmtpState::RcptTo, SmtpCommand::Data) => {
                self.state = SmtpState::Data;
                "354 Start mail input; end with <CRLF>.<CRLF>\r\n".to_string()
            }
            (SmtpState::Fresh, SmtpCommand::Rset) => "250 2.0.0 OK\r\n".to_string(),
            (_, SmtpCommand::Rset) => {
                self.reset();
                "250 2.0.0 OK\r\n".to_string()
            }
            (_, SmtpCommand::Noop) => "250 2.0.0 OK\r\n".to_string(),
            (_, SmtpCommand::Quit) => {
                debug!("QUIT from {}", self.peer);
                format!("221 2.0.0 {} closing connection\r\n", self.hostname)
            }
            (_, SmtpCommand::Unknown(cmd)) => {
                debug!("Unknown command: {}", cmd);
                "502 5.5.1 Command not implemented\r\n".to_string()
            }
            _ => "503 5.5.1 Bad sequence of commands\r\n".to_string(),
        }
    }

    /// Collect the DATA section and relay it
    ///
    /// Returns the reply for the transaction, or `None` when the connection
    /// ended before the terminating dot.
    async fn receive_data<S>(
        &mut self,
        stream: &mut BufReader<S>,
        line: &mut Vec<u8>,
    ) -> Result<Option<String>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut failure: Option<&'static str> = None;

        loop {
            match next_input(stream, line, DATA_TIMEOUT, &self.cancel).await? {
                Input::Line => {}
                Input::TooLong => {
                    failure.get_or_insert("500 5.5.2 Line too long\r\n");
                    continue;
                }
                Input::Closed => {
                    warn!("Connection from {} closed during DATA", self.peer);
                    self.reset();
                    return Ok(None);
                }
                Input::Abort(reply) => {
                    warn!("Aborting DATA from {}: {}", self.peer, reply.trim_end());
                    self.reset();
                    self.respond(stream, reply).await?;
                    return Ok(None);
                }
            }

            let content = strip_line_ending(&line[..]);
            self.observer.client_line(content);

            if content == b"." {
                break;
            }
            if failure.is_some() {
                continue;
            }

            // transparency: a leading dot was doubled by the client
            let content = content.strip_prefix(b".").unwrap_or(content);
            if self.data.len() + content.len() + 2 > self.max_message_size {
                warn!(
                    "Message from {} exceeds {} bytes",
                    self.peer, self.max_message_size
                );
                failure = Some("552 5.3.4 Message size exceeds fixed maximum message size\r\n");
                self.data.clear();
                continue;
            }

            self.data.extend_from_slice(content);
            self.data.extend_from_slice(b"\r\n");
        }

        if failure.is_none() {
            info!(
                "Received {} bytes from {} (MAIL FROM:<{}>, {} recipients)",
                self.data.len(),
                self.peer,
                self.from.as_deref().unwrap_or(""),
                self.to.len()
            );
        }
        let data = std::mem::take(&mut self.data);
        let rcpt_to = std::mem::take(&mut self.to);
        self.reset();

        if let Some(reply) = failure {
            self.error_count += 1;
            return Ok(Some(reply.to_string()));
        }

        self.warn_unlisted_recipients(&rcpt_to, &data);
        let result = self.relay.relay(self.peer, &data, &self.cancel).await;
        Ok(Some(format!("{}\r\n", result.reply())))
    }

    /// Delivery follows the message headers; RCPT TO is only compared
    fn warn_unlisted_recipients(&self, rcpt_to: &[String], data: &[u8]) {
        let Ok(envelope) = Envelope::from_bytes(data) else {
            return;
        };
        let unlisted = unlisted_recipients(rcpt_to, &envelope.recipients);
        if !unlisted.is_empty() {
            warn!(
                "Recipients from {} not in the message headers will not receive it: {}",
                self.peer,
                unlisted.join(", ")
            );
        }
    }

    fn reset(&mut self) {
        self.from = None;
        self.to.clear();
        self.data.clear();
        self.state = SmtpState::Greeted;
    }

    async fn respond<S>(&mut self, stream: &mut BufReader<S>, response: &str) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.observer.server_line(response.as_bytes());
        write_reply(stream, response).await
    }

    /// Reply and write the transaction's trace block before the client sees it
    async fn respond_checkpoint<S>(
        &mut self,
        stream: &mut BufReader<S>,
        response: &str,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.observer.server_line(response.as_bytes());
        self.observer.checkpoint();
        write_reply(stream, response).await
    }
}

async fn write_reply<S>(stream: &mut BufReader<S>, response: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

/// RCPT TO addresses missing from the header recipients
fn unlisted_recipients(rcpt_to: &[String], headers: &[String]) -> Vec<String> {
    rcpt_to
        .iter()
        .filter(|rcpt| !headers.iter().any(|h| h.eq_ignore_ascii_case(rcpt)))
        .cloned()
        .collect()
}
