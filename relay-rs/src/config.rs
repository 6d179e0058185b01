//! Persisted relay settings
//!
//! Settings live in a pretty-printed JSON file shared by the relay service and
//! the `relay-config` tool. The service reads it once at startup.

use crate::acl::{self, AllowList};
use crate::error::{RelayError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

/// Longest trace retention accepted, in days
pub const MAX_RETENTION_DAYS: i64 = 36_500;

#[derive(Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub smart_host: String,
    pub smart_host_port: u16,
    pub use_start_tls: bool,
    pub username: String,
    pub password: String,
    #[serde(rename = "allowAllIPs")]
    pub allow_all_ips: bool,
    #[serde(rename = "allowedIPs")]
    pub allowed_ips: Vec<String>,
    pub enable_logging: bool,
    pub retention_days: i64,
    /// Port the inbound listener binds to
    pub listen_port: u16,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            smart_host: String::new(),
            smart_host_port: 25,
            use_start_tls: true,
            username: String::new(),
            password: String::new(),
            allow_all_ips: false,
            allowed_ips: Vec::new(),
            enable_logging: true,
            retention_days: 14,
            listen_port: 25,
        }
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("smart_host", &self.smart_host)
            .field("smart_host_port", &self.smart_host_port)
            .field("use_start_tls", &self.use_start_tls)
            .field("username", &self.username)
            .field("password", &"********")
            .field("allow_all_ips", &self.allow_all_ips)
            .field("allowed_ips", &self.allowed_ips)
            .field("enable_logging", &self.enable_logging)
            .field("retention_days", &self.retention_days)
            .field("listen_port", &self.listen_port)
            .finish()
    }
}

impl Settings {
    /// Load settings, falling back to defaults when the file does not exist
    ///
    /// # Errors
    /// - [`RelayError::Format`] if the file exists but is not a valid settings document
    /// - [`RelayError::Io`] if the file cannot be read
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!("No settings file at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| {
            RelayError::Format(format!("Failed to parse {}: {}", path.display(), e))
        })
    }

    /// Normalize, validate and atomically write the settings
    ///
    /// Nothing is written if any allow-list entry is invalid. The file is
    /// replaced through a sibling temp file and a rename, so readers see
    /// either the old or the new document.
    pub fn save<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();

        self.allowed_ips = acl::normalize(&self.allowed_ips);
        self.validate()?;

        let json = serde_json::to_string_pretty(self)
            .map_err(|e| RelayError::Format(e.to_string()))?;

        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "config.json".to_string());
        let tmp_path = path.with_file_name(format!(".{}.tmp", file_name));

        if let Err(e) = fs::write(&tmp_path, json.as_bytes()) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }
        if let Err(e) = fs::rename(&tmp_path, path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }

        debug!("Saved settings to {}", path.display());
        Ok(())
    }

    /// Check every allow-list entry and the basic numeric ranges
    pub fn validate(&self) -> Result<()> {
        for entry in &self.allowed_ips {
            acl::validate_entry(entry)?;
        }

        if self.smart_host_port == 0 {
            return Err(RelayError::Validation("smartHostPort must be 1-65535".to_string()));
        }
        if self.listen_port == 0 {
            return Err(RelayError::Validation("listenPort must be 1-65535".to_string()));
        }
        if self.retention_days > MAX_RETENTION_DAYS {
            return Err(RelayError::Validation(format!(
                "retentionDays must be at most {}",
                MAX_RETENTION_DAYS
            )));
        }

        Ok(())
    }

    /// Allow-list snapshot used by relay transactions
    pub fn allow_list(&self) -> AllowList {
        AllowList::new(self.allow_all_ips, self.allowed_ips.clone())
    }

    pub fn smart_host_configured(&self) -> bool {
        !self.smart_host.trim().is_empty()
    }

    pub fn has_credentials(&self) -> bool {
        !self.username.trim().is_empty()
    }
}
