// SPDX-License-Identifier: GPL-2.0-only
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// Name of the kernel command line parameter carrying the boot blob.
pub const CMDLINE_KEY: &str = "config";

/// Boot configuration passed to the guest on the kernel command line.
///
/// Serialized as JSON, base64-encoded and appended as `config=<blob>`.
/// `ip_addr` carries the prefix length (`10.0.0.2/30`) so the guest can
/// derive its netmask without a separate field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootConfig {
    pub app_id: String,
    pub ip_addr: String,
    pub ip_gw: String,
    pub metadata_url: String,
    pub metadata_token: String,
}

#[derive(Debug, thiserror::Error)]
pub enum BootConfigError {
    #[error("kernel command line has no config= parameter")]
    Missing,
    #[error("boot config is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("boot config is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl BootConfig {
    /// Encode as the base64 JSON blob.
    pub fn encode(&self) -> Result<String, BootConfigError> {
        let json = serde_json::to_vec(self)?;
        Ok(STANDARD.encode(json))
    }

    /// Decode a base64 JSON blob.
    pub fn decode(blob: &str) -> Result<Self, BootConfigError> {
        let json = STANDARD.decode(blob.trim())?;
        Ok(serde_json::from_slice(&json)?)
    }

    /// The `config=<blob>` kernel parameter.
    pub fn to_cmdline_param(&self) -> Result<String, BootConfigError> {
        Ok(format!("{CMDLINE_KEY}={}", self.encode()?))
    }

    /// Find and decode the `config=` parameter in a full kernel command line.
    pub fn from_cmdline(cmdline: &str) -> Result<Self, BootConfigError> {
        let prefix = format!("{CMDLINE_KEY}=");
        let blob = cmdline
            .split_ascii_whitespace()
            .find_map(|arg| arg.strip_prefix(&prefix))
            .ok_or(BootConfigError::Missing)?;
        Self::decode(blob)
    }
}
