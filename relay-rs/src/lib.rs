//! relay-rs: SMTP relay to a smart host
//!
//! Accepts mail from applications and devices on the local network and hands
//! it to a single upstream SMTP server (the smart host), optionally over
//! STARTTLS and with AUTH.
//!
//! # Features
//!
//! - **Allow-list**: only clients whose address matches a configured IP or
//!   CIDR range may relay
//! - **Smart host delivery**: STARTTLS (tokio-rustls) and AUTH PLAIN / LOGIN
//! - **Protocol trace**: daily `smtp-YYYYMMDD.log` files, message bodies and
//!   credentials redacted
//! - **Retention**: trace files older than `retentionDays` are swept daily
//!
//! # Example
//!
//! ```no_run
//! use relay_rs::relay::RelayTransaction;
//! use relay_rs::smtp::SmtpServer;
//! use relay_rs::trace::TraceLog;
//! use relay_rs::transport::SmtpTransportFactory;
//! use relay_rs::Settings;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = Arc::new(Settings::load("config.json")?);
//!     let trace = Arc::new(TraceLog::new("logs"));
//!     let relay = Arc::new(RelayTransaction::new(
//!         settings.clone(),
//!         trace.clone(),
//!         Arc::new(SmtpTransportFactory::new()),
//!     ));
//!
//!     let server = SmtpServer::new(settings, relay, trace);
//!     server.run(CancellationToken::new()).await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`acl`]: IP / CIDR allow-list
//! - [`config`]: Persisted settings
//! - [`relay`]: Relay decision and delivery pipeline
//! - [`smtp`]: Inbound SMTP listener
//! - [`transport`]: Outbound SMTP client
//! - [`trace`]: Redacted protocol trace files
//! - [`sweeper`]: Trace file retention

pub mod acl;
pub mod config;
pub mod error;
pub mod message;
pub mod relay;
pub mod smtp;
pub mod sweeper;
pub mod trace;
pub mod transport;

// Re-export commonly used types
pub use config::Settings;
pub use error::{RelayError, Result};
pub use relay::{RelayResult, RelayTransaction};
