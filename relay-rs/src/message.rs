//! Message reconstruction
//!
//! Turns the raw bytes received by the listener into an [`Envelope`]: the
//! sender and recipients come from the message headers, the payload is the
//! message itself with CRLF line endings and without its `Bcc:` header.

use crate::error::{RelayError, Result};
use mail_parser::{Address, MessageParser};
use std::collections::HashSet;

/// A message ready for delivery to the smart host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub from: String,
    pub recipients: Vec<String>,
    pub data: Vec<u8>,
}

impl Envelope {
    /// Reconstruct an envelope from a raw RFC 5322 message
    ///
    /// # Errors
    /// Returns [`RelayError::Malformed`] if the message cannot be parsed, has
    /// no sender or has no recipient.
    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        if raw.iter().all(|b| b.is_ascii_whitespace()) {
            return Err(RelayError::Malformed("empty message".to_string()));
        }

        let message = MessageParser::default()
            .parse(raw)
            .ok_or_else(|| RelayError::Malformed("unparsable message".to_string()))?;

        let from = addresses(message.from())
            .into_iter()
            .chain(addresses(message.sender()))
            .next()
            .ok_or_else(|| RelayError::Malformed("no sender address".to_string()))?;

        let mut seen = HashSet::new();
        let recipients: Vec<String> = addresses(message.to())
            .into_iter()
            .chain(addresses(message.cc()))
            .chain(addresses(message.bcc()))
            .filter(|addr| seen.insert(addr.to_ascii_lowercase()))
            .collect();

        if recipients.is_empty() {
            return Err(RelayError::Malformed("no recipient address".to_string()));
        }

        Ok(Self {
            from,
            recipients,
            data: prepare_payload(raw),
        })
    }
}

fn addresses(header: Option<&Address<'_>>) -> Vec<String> {
    let addrs: Vec<Option<&str>> = match header {
        Some(Address::List(list)) => list.iter().map(|a| a.address()).collect(),
        Some(Address::Group(groups)) => groups
            .iter()
            .flat_map(|g| g.addresses.iter())
            .map(|a| a.address())
            .collect(),
        None => Vec::new(),
    };

    addrs
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(str::to_string)
        .collect()
}

/// CRLF line endings, `Bcc:` header (with folded continuation lines) removed
fn prepare_payload(raw: &[u8]) -> Vec<u8> {
    let body = raw.strip_suffix(b"\n").unwrap_or(raw);

    let mut out = Vec::with_capacity(raw.len() + 64);
    let mut in_headers = true;
    let mut skipping_bcc = false;

    for line in body.split(|b| *b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);

        if in_headers {
            if line.is_empty() {
                in_headers = false;
            } else if skipping_bcc && matches!(line.first(), Some(b' ' | b'\t')) {
                continue;
            } else {
                skipping_bcc = line.len() >= 4 && line[..4].eq_ignore_ascii_case(b"bcc:");
                if skipping_bcc {
                    continue;
                }
            }
        }

        out.extend_from_slice(line);
        out.extend_from_slice(b"\r\n");
    }

    out
}
