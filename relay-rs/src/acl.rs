//! Client IP allow-list
//!
//! Decides whether a connecting client may use the relay. Entries are single
//! addresses (`192.0.2.10`, `2001:db8::1`) or CIDR blocks (`10.0.0.0/8`).
//!
//! # Example
//! ```
//! use relay_rs::acl::AllowList;
//!
//! let list = AllowList::new(false, vec!["10.0.0.0/8".to_string()]);
//! assert!(list.is_allowed("10.1.2.3").unwrap());
//! assert!(!list.is_allowed("192.168.1.1").unwrap());
//! ```

use crate::error::{RelayError, Result};
use ipnet::IpNet;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

/// Characters accepted between allow-list entries
const ENTRY_DELIMITERS: &[char] = &[',', ';', ' ', '\t', '\n', '\r'];

/// A parsed allow-list entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressRange {
    Single(IpAddr),
    Network(IpNet),
}

impl AddressRange {
    /// Parse a single address or a CIDR block
    pub fn parse(entry: &str) -> Result<Self> {
        let entry = entry.trim();
        if entry.contains('/') {
            IpNet::from_str(entry)
                .map(AddressRange::Network)
                .map_err(|e| RelayError::Configuration(format!("Invalid CIDR '{}': {}", entry, e)))
        } else {
            IpAddr::from_str(entry)
                .map(|ip| AddressRange::Single(ip.to_canonical()))
                .map_err(|e| RelayError::Configuration(format!("Invalid IP '{}': {}", entry, e)))
        }
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        let ip = ip.to_canonical();
        match self {
            AddressRange::Single(addr) => *addr == ip,
            AddressRange::Network(net) => net.contains(&ip),
        }
    }
}

/// Immutable allow-list snapshot
#[derive(Debug, Clone)]
pub struct AllowList {
    allow_all: bool,
    entries: Vec<String>,
}

impl AllowList {
    pub fn new(allow_all: bool, entries: Vec<String>) -> Self {
        Self { allow_all, entries }
    }

    pub fn allow_all(&self) -> bool {
        self.allow_all
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    /// Check whether `ip` may relay
    ///
    /// Entries are parsed on every call so that a list mutated behind our back
    /// fails loudly instead of silently allowing or denying.
    ///
    /// # Errors
    /// Returns [`RelayError::Configuration`] naming the first entry that does
    /// not parse.
    pub fn is_allowed(&self, ip: &str) -> Result<bool> {
        if self.allow_all {
            return Ok(true);
        }

        let client = match IpAddr::from_str(ip.trim()) {
            Ok(addr) => addr,
            Err(_) => return Ok(false),
        };

        for entry in &self.entries {
            if AddressRange::parse(entry)?.contains(&client) {
                return Ok(true);
            }
        }

        Ok(false)
    }
}

/// Tokenize, trim and de-duplicate allow-list input, keeping first-seen order
pub fn normalize<S: AsRef<str>>(entries: &[S]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut normalized = Vec::new();

    for raw in entries {
        for token in raw.as_ref().split(ENTRY_DELIMITERS) {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            if seen.insert(token.to_ascii_lowercase()) {
                normalized.push(token.to_string());
            }
        }
    }

    normalized
}

/// Validate a single entry, reporting it as a settings validation failure
pub fn validate_entry(entry: &str) -> Result<()> {
    AddressRange::parse(entry)
        .map(|_| ())
        .map_err(|e| RelayError::Validation(e.to_string()))
}

/// Canonical textual form of a peer address; unspecified and loopback
/// addresses collapse to `127.0.0.1`.
pub fn canonical_client_address(ip: IpAddr) -> String {
    let ip = ip.to_canonical();
    if ip.is_unspecified() || ip.is_loopback() {
        Ipv4Addr::LOCALHOST.to_string()
    } else {
        ip.to_string()
    }
}

/// Same as [`canonical_client_address`] for text; unparsable input is returned as is
pub fn normalize_client_address(ip: &str) -> String {
    match IpAddr::from_str(ip.trim()) {
        Ok(addr) => canonical_client_address(addr),
        Err(_) => ip.to_string(),
    }
}
