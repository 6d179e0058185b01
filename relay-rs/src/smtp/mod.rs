//! Inbound SMTP listener (RFC 5321 subset)
//!
//! - [`server`]: TCP accept loop, one task per connection
//! - [`session`]: per-connection state machine handing messages to the relay
//! - [`commands`]: SMTP command parsing

pub mod commands;
pub mod server;
pub mod session;

pub use commands::SmtpCommand;
pub use server::SmtpServer;
pub use session::SmtpSession;
