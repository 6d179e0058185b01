//! Relay decision and delivery pipeline
//!
//! [`RelayTransaction::relay`] is called once per message accepted by the
//! listener:
//!
//! ```text
//! client ip ─▶ allow-list ─▶ reconstruct ─▶ connect ─▶ [STARTTLS] ─▶ [AUTH] ─▶ send ─▶ QUIT
//!                 │ denied        │ malformed      └─────────── failure ────────────┘
//!                 ▼               ▼                               ▼
//!              Rejected    DeliveryFailed                 DeliveryFailed
//! ```
//!
//! Every outcome is returned as a [`RelayResult`]; nothing is thrown past this
//! boundary, so the listener never handles transport errors itself.

use crate::acl::{canonical_client_address, AllowList};
use crate::config::Settings;
use crate::error::{RelayError, Result};
pub use crate::message::Envelope;
use crate::trace::{NullObserver, ProtocolObserver, TraceLog};
use crate::transport::{MailTransport, TlsMode, TransportFactory};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Allow-list verdict for a client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Denied,
}

/// Why a delivery did not happen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Malformed,
    Configuration,
    Network,
    Tls,
    Authentication,
    /// The smart host answered with this reply code
    Remote(u16),
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Delivered,
    DeliveryFailed(FailureKind),
    Rejected,
}

/// Result of one relay attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayResult {
    pub client: String,
    /// `None` when the allow-list itself could not be evaluated
    pub decision: Option<Decision>,
    pub outcome: Outcome,
    /// Human readable failure reason, empty on success
    pub reason: String,
}

impl RelayResult {
    fn delivered(client: String) -> Self {
        Self {
            client,
            decision: Some(Decision::Allowed),
            outcome: Outcome::Delivered,
            reason: String::new(),
        }
    }

    fn rejected(client: String) -> Self {
        Self {
            client,
            decision: Some(Decision::Denied),
            outcome: Outcome::Rejected,
            reason: "relay access denied".to_string(),
        }
    }

    fn failed(client: String, decision: Option<Decision>, kind: FailureKind, reason: String) -> Self {
        Self {
            client,
            decision,
            outcome: Outcome::DeliveryFailed(kind),
            reason,
        }
    }

    pub fn is_delivered(&self) -> bool {
        self.outcome == Outcome::Delivered
    }

    /// Reply the listener sends for this outcome
    pub fn reply(&self) -> SmtpReply {
        match self.outcome {
            Outcome::Delivered => SmtpReply::new(250, "2.0.0 OK: queued"),
            Outcome::Rejected => SmtpReply::new(550, "5.7.1 Relay access denied"),
            Outcome::DeliveryFailed(kind) => match kind {
                FailureKind::Malformed => SmtpReply::new(554, "5.6.0 Malformed message"),
                FailureKind::Remote(code) if code >= 500 => {
                    SmtpReply::new(554, format!("5.0.0 Rejected by smart host: {}", self.reason))
                }
                FailureKind::Configuration => {
                    SmtpReply::new(451, "4.3.5 Relay configuration error, try again later")
                }
                FailureKind::Cancelled => SmtpReply::new(451, "4.3.2 Relay shutting down"),
                FailureKind::Authentication => {
                    SmtpReply::new(451, "4.7.0 Smart host authentication failed")
                }
                FailureKind::Network | FailureKind::Tls | FailureKind::Remote(_) => {
                    SmtpReply::new(451, "4.4.1 Smart host unavailable, try again later")
                }
            },
        }
    }
}

/// Status line returned to the inbound client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpReply {
    pub code: u16,
    pub text: String,
}

impl SmtpReply {
    pub fn new(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            text: text.into(),
        }
    }
}

impl fmt::Display for SmtpReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.text)
    }
}

fn failure_kind(err: &RelayError) -> FailureKind {
    match err {
        RelayError::Malformed(_) => FailureKind::Malformed,
        RelayError::Configuration(_) | RelayError::Validation(_) | RelayError::Format(_) => {
            FailureKind::Configuration
        }
        RelayError::Tls(_) => FailureKind::Tls,
        RelayError::Authentication(_) => FailureKind::Authentication,
        RelayError::Remote { code, .. } => FailureKind::Remote(*code),
        RelayError::Cancelled => FailureKind::Cancelled,
        RelayError::Io(_) | RelayError::Network(_) | RelayError::SmtpProtocol(_) => {
            FailureKind::Network
        }
    }
}

/// Relay pipeline shared by all inbound connections
pub struct RelayTransaction {
    settings: Arc<Settings>,
    allow_list: AllowList,
    trace: Option<Arc<TraceLog>>,
    transports: Arc<dyn TransportFactory>,
}

impl RelayTransaction {
    /// `trace` is only used when `enableLogging` is set
    pub fn new(
        settings: Arc<Settings>,
        trace: Arc<TraceLog>,
        transports: Arc<dyn TransportFactory>,
    ) -> Self {
        let allow_list = settings.allow_list();
        let trace = settings.enable_logging.then_some(trace);
        Self {
            settings,
            allow_list,
            trace,
            transports,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Decide, reconstruct and deliver one message
    pub async fn relay(
        &self,
        client: IpAddr,
        raw: &[u8],
        cancel: &CancellationToken,
    ) -> RelayResult {
        let client = canonical_client_address(client);

        match self.allow_list.is_allowed(&client) {
            Ok(true) => info!("Incoming relay request from {}", client),
            Ok(false) => {
                warn!("Rejected relay request from {}", client);
                return RelayResult::rejected(client);
            }
            Err(e) => {
                error!("Allow-list check failed for {}: {}", client, e);
                return RelayResult::failed(
                    client,
                    None,
                    FailureKind::Configuration,
                    e.to_string(),
                );
            }
        }

        let envelope = match Envelope::from_bytes(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Not relaying message from {}: {}", client, e);
                return RelayResult::failed(
                    client,
                    Some(Decision::Allowed),
                    FailureKind::Malformed,
                    "malformed message".to_string(),
                );
            }
        };

        if !self.settings.smart_host_configured() {
            error!("No smart host configured, cannot relay mail from {}", client);
            return RelayResult::failed(
                client,
                Some(Decision::Allowed),
                FailureKind::Configuration,
                "no smart host configured".to_string(),
            );
        }

        // the transport owns the trace session: dropping it flushes the transcript
        let mut transport = self.transports.create(self.observer());
        let delivery = self.deliver(transport.as_mut(), &envelope, cancel).await;

        if let Err(e) = transport.disconnect(cancel).await {
            debug!("Disconnect from smart host failed: {}", e);
        }
        drop(transport);

        match delivery {
            Ok(()) => {
                info!(
                    "Relayed mail from {} ({} -> {})",
                    client,
                    envelope.from,
                    envelope.recipients.join(",")
                );
                RelayResult::delivered(client)
            }
            Err(RelayError::Cancelled) => {
                warn!("Relay for {} cancelled", client);
                RelayResult::failed(
                    client,
                    Some(Decision::Allowed),
                    FailureKind::Cancelled,
                    "cancelled".to_string(),
                )
            }
            Err(e) => {
                let class = if e.is_transient() { "transient" } else { "permanent" };
                error!("Relay for {} failed ({}): {}", client, class, e);
                RelayResult::failed(
                    client,
                    Some(Decision::Allowed),
                    failure_kind(&e),
                    e.to_string(),
                )
            }
        }
    }

    fn observer(&self) -> Box<dyn ProtocolObserver> {
        match &self.trace {
            Some(trace) => Box::new(trace.session()),
            None => Box::new(NullObserver),
        }
    }

    async fn deliver(
        &self,
        transport: &mut dyn MailTransport,
        envelope: &Envelope,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let settings = &self.settings;
        let tls = if settings.use_start_tls {
            TlsMode::Opportunistic
        } else {
            TlsMode::None
        };

        transport
            .connect(settings.smart_host.trim(), settings.smart_host_port, tls, cancel)
            .await?;

        if settings.has_credentials() {
            info!("Authenticating as {}", settings.username.trim());
            transport
                .authenticate(settings.username.trim(), &settings.password, cancel)
                .await?;
        }

        transport.send(envelope, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    const MESSAGE: &[u8] =
        b"From: app@example.com\r\nTo: ops@example.org\r\nSubject: disk\r\n\r\nalmost full\r\n";

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Connect(String, u16, TlsMode),
        Authenticate(String),
        Send(Vec<String>),
        Disconnect,
    }

    #[derive(Default)]
    struct Script {
        calls: Mutex<Vec<Call>>,
        created: Mutex<usize>,
        fail_connect: Option<fn() -> RelayError>,
        fail_auth: bool,
        hang_on_send: bool,
    }

    struct Recording {
        script: Arc<Script>,
        observer: Box<dyn ProtocolObserver>,
    }

    #[async_trait]
    impl MailTransport for Recording {
        async fn connect(
            &mut self,
            host: &str,
            port: u16,
            tls: TlsMode,
            _cancel: &CancellationToken,
        ) -> Result<()> {
            self.script
                .calls
                .lock()
                .unwrap()
                .push(Call::Connect(host.to_string(), port, tls));
            self.observer.connect(&format!("smtp://{}:{}", host, port));
            match self.script.fail_connect {
                Some(make) => Err(make()),
                None => Ok(()),
            }
        }

        async fn authenticate(
            &mut self,
            username: &str,
            _password: &str,
            _cancel: &CancellationToken,
        ) -> Result<()> {
            self.script
                .calls
                .lock()
                .unwrap()
                .push(Call::Authenticate(username.to_string()));
            if self.script.fail_auth {
                Err(RelayError::Authentication("535 bad credentials".to_string()))
            } else {
                Ok(())
            }
        }

        async fn send(&mut self, envelope: &Envelope, cancel: &CancellationToken) -> Result<()> {
            self.script
                .calls
                .lock()
                .unwrap()
                .push(Call::Send(envelope.recipients.clone()));
            if self.script.hang_on_send {
                cancel.cancelled().await;
                return Err(RelayError::Cancelled);
            }
            self.observer.client_line(b"DATA");
            self.observer.client_line(b"secret body");
            self.observer.client_line(b".");
            Ok(())
        }

        async fn disconnect(&mut self, _cancel: &CancellationToken) -> Result<()> {
            self.script.calls.lock().unwrap().push(Call::Disconnect);
            Ok(())
        }
    }

    struct RecordingFactory(Arc<Script>);

    impl TransportFactory for RecordingFactory {
        fn create(&self, observer: Box<dyn ProtocolObserver>) -> Box<dyn MailTransport> {
            *self.0.created.lock().unwrap() += 1;
            Box::new(Recording {
                script: Arc::clone(&self.0),
                observer,
            })
        }
    }

    fn settings() -> Settings {
        Settings {
            smart_host: "smtp.example.com".to_string(),
            smart_host_port: 587,
            use_start_tls: true,
            allowed_ips: vec!["10.0.0.0/8".to_string()],
            ..Settings::default()
        }
    }

    fn relay_with(settings: Settings, script: Script, dir: &TempDir) -> (RelayTransaction, Arc<Script>) {
        let script = Arc::new(script);
        let relay = RelayTransaction::new(
            Arc::new(settings),
            Arc::new(TraceLog::new(dir.path())),
            Arc::new(RecordingFactory(Arc::clone(&script))),
        );
        (relay, script)
    }

    fn calls(script: &Script) -> Vec<Call> {
        script.calls.lock().unwrap().clone()
    }

    fn ip(text: &str) -> IpAddr {
        text.parse().unwrap()
    }

    #[tokio::test]
    async fn test_allowed_client_is_delivered() {
        let dir = TempDir::new().unwrap();
        let (relay, script) = relay_with(settings(), Script::default(), &dir);

        let result = relay.relay(ip("10.1.2.3"), MESSAGE, &CancellationToken::new()).await;

        assert_eq!(result.decision, Some(Decision::Allowed));
        assert_eq!(result.outcome, Outcome::Delivered);
        assert_eq!(result.reply().code, 250);
        assert_eq!(
            calls(&script),
            vec![
                Call::Connect("smtp.example.com".to_string(), 587, TlsMode::Opportunistic),
                Call::Send(vec!["ops@example.org".to_string()]),
                Call::Disconnect,
            ]
        );
    }

    #[tokio::test]
    async fn test_denied_client_never_connects() {
        let dir = TempDir::new().unwrap();
        let (relay, script) = relay_with(settings(), Script::default(), &dir);

        let result = relay.relay(ip("192.168.1.1"), MESSAGE, &CancellationToken::new()).await;

        assert_eq!(result.decision, Some(Decision::Denied));
        assert_eq!(result.outcome, Outcome::Rejected);
        assert_eq!(result.reply(), SmtpReply::new(550, "5.7.1 Relay access denied"));
        assert!(calls(&script).is_empty());
        assert_eq!(*script.created.lock().unwrap(), 0);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_loopback_is_canonicalized() {
        let dir = TempDir::new().unwrap();
        let mut cfg = settings();
        cfg.allowed_ips = vec!["127.0.0.1".to_string()];
        let (relay, _script) = relay_with(cfg, Script::default(), &dir);

        let result = relay.relay(ip("::1"), MESSAGE, &CancellationToken::new()).await;
        assert_eq!(result.client, "127.0.0.1");
        assert!(result.is_delivered());
    }

    #[tokio::test]
    async fn test_allow_all_ips() {
        let dir = TempDir::new().unwrap();
        let mut cfg = settings();
        cfg.allow_all_ips = true;
        cfg.allowed_ips.clear();
        let (relay, _script) = relay_with(cfg, Script::default(), &dir);

        let result = relay.relay(ip("203.0.113.50"), MESSAGE, &CancellationToken::new()).await;
        assert!(result.is_delivered());
    }

    #[tokio::test]
    async fn test_broken_allow_list_fails_attempt() {
        let dir = TempDir::new().unwrap();
        let mut cfg = settings();
        cfg.allowed_ips = vec!["10.0.0.0/99".to_string()];
        let (relay, script) = relay_with(cfg, Script::default(), &dir);

        let result = relay.relay(ip("10.1.2.3"), MESSAGE, &CancellationToken::new()).await;
        assert_eq!(result.decision, None);
        assert_eq!(result.outcome, Outcome::DeliveryFailed(FailureKind::Configuration));
        assert_eq!(result.reply().code, 451);
        assert!(calls(&script).is_empty());
    }

    #[tokio::test]
    async fn test_malformed_message_is_not_sent() {
        let dir = TempDir::new().unwrap();
        let (relay, script) = relay_with(settings(), Script::default(), &dir);

        let result = relay
            .relay(ip("10.1.2.3"), b"Subject: no addresses\r\n\r\nx\r\n", &CancellationToken::new())
            .await;

        assert_eq!(result.outcome, Outcome::DeliveryFailed(FailureKind::Malformed));
        assert_eq!(result.reason, "malformed message");
        assert_eq!(result.reply().code, 554);
        assert!(calls(&script).is_empty());
    }

    #[tokio::test]
    async fn test_missing_smart_host() {
        let dir = TempDir::new().unwrap();
        let mut cfg = settings();
        cfg.smart_host = " ".to_string();
        let (relay, script) = relay_with(cfg, Script::default(), &dir);

        let result = relay.relay(ip("10.1.2.3"), MESSAGE, &CancellationToken::new()).await;
        assert_eq!(result.outcome, Outcome::DeliveryFailed(FailureKind::Configuration));
        assert!(calls(&script).is_empty());
    }

    #[tokio::test]
    async fn test_credentials_trigger_authentication() {
        let dir = TempDir::new().unwrap();
        let mut cfg = settings();
        cfg.username = "relay@example.com".to_string();
        cfg.password = "pw".to_string();
        cfg.use_start_tls = false;
        let (relay, script) = relay_with(cfg, Script::default(), &dir);

        let result = relay.relay(ip("10.1.2.3"), MESSAGE, &CancellationToken::new()).await;
        assert!(result.is_delivered());
        assert_eq!(
            calls(&script),
            vec![
                Call::Connect("smtp.example.com".to_string(), 587, TlsMode::None),
                Call::Authenticate("relay@example.com".to_string()),
                Call::Send(vec!["ops@example.org".to_string()]),
                Call::Disconnect,
            ]
        );
    }

    #[tokio::test]
    async fn test_connect_failure_still_disconnects() {
        let dir = TempDir::new().unwrap();
        let script = Script {
            fail_connect: Some(|| RelayError::Network("Connection timed out".to_string())),
            ..Script::default()
        };
        let (relay, script) = relay_with(settings(), script, &dir);

        let result = relay.relay(ip("10.1.2.3"), MESSAGE, &CancellationToken::new()).await;

        assert_eq!(result.outcome, Outcome::DeliveryFailed(FailureKind::Network));
        assert!(result.reason.contains("timed out"));
        assert_eq!(result.reply().code, 451);
        let recorded = calls(&script);
        assert!(!recorded.iter().any(|c| matches!(c, Call::Send(_))));
        assert_eq!(recorded.last(), Some(&Call::Disconnect));
    }

    #[tokio::test]
    async fn test_authentication_failure() {
        let dir = TempDir::new().unwrap();
        let mut cfg = settings();
        cfg.username = "relay".to_string();
        let script = Script {
            fail_auth: true,
            ..Script::default()
        };
        let (relay, script) = relay_with(cfg, script, &dir);

        let result = relay.relay(ip("10.1.2.3"), MESSAGE, &CancellationToken::new()).await;
        assert_eq!(result.outcome, Outcome::DeliveryFailed(FailureKind::Authentication));
        assert!(!calls(&script).iter().any(|c| matches!(c, Call::Send(_))));
    }

    #[tokio::test]
    async fn test_cancellation_during_send() {
        let dir = TempDir::new().unwrap();
        let script = Script {
            hang_on_send: true,
            ..Script::default()
        };
        let (relay, script) = relay_with(settings(), script, &dir);
        let cancel = CancellationToken::new();

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                cancel.cancel();
            })
        };

        let result = relay.relay(ip("10.1.2.3"), MESSAGE, &cancel).await;
        canceller.await.unwrap();

        assert_eq!(result.outcome, Outcome::DeliveryFailed(FailureKind::Cancelled));
        assert_eq!(result.reason, "cancelled");
        assert_eq!(calls(&script).last(), Some(&Call::Disconnect));
    }

    #[tokio::test]
    async fn test_trace_written_without_body() {
        let dir = TempDir::new().unwrap();
        let (relay, _script) = relay_with(settings(), Script::default(), &dir);

        relay.relay(ip("10.1.2.3"), MESSAGE, &CancellationToken::new()).await;

        let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().flatten().collect();
        assert_eq!(files.len(), 1);
        let content = std::fs::read_to_string(files[0].path()).unwrap();
        assert!(content.contains("CONNECT smtp://smtp.example.com:587"));
        assert!(content.contains("C: DATA\nC: <DATA END>\n"));
        assert!(!content.contains("secret body"));
        assert!(content.ends_with(&format!("{}\n", crate::trace::CONVERSATION_DELIMITER)));
    }

    #[tokio::test]
    async fn test_no_trace_when_logging_disabled() {
        let dir = TempDir::new().unwrap();
        let mut cfg = settings();
        cfg.enable_logging = false;
        let (relay, _script) = relay_with(cfg, Script::default(), &dir);

        let result = relay.relay(ip("10.1.2.3"), MESSAGE, &CancellationToken::new()).await;
        assert!(result.is_delivered());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_reply_mapping() {
        let failed = |kind| {
            RelayResult::failed("10.0.0.1".to_string(), Some(Decision::Allowed), kind, "x".to_string())
        };

        assert_eq!(failed(FailureKind::Remote(550)).reply().code, 554);
        assert_eq!(failed(FailureKind::Remote(421)).reply().code, 451);
        assert_eq!(failed(FailureKind::Tls).reply().code, 451);
        assert_eq!(failed(FailureKind::Cancelled).reply().code, 451);
        assert_eq!(
            RelayResult::delivered("10.0.0.1".to_string()).reply().to_string(),
            "250 2.0.0 OK: queued"
        );
    }
}
