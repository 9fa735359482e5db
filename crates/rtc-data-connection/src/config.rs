//! Connection configuration
//!
//! Every field has a serde default, so partial TOML or JSON documents
//! are merged over the defaults.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::transport::ChannelOptions;

/// Default ICE servers
pub const DEFAULT_ICE_SERVERS: &[&str] = &["stun:stun.l.google.com:19302"];

/// Top-level connection configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Ordered, guaranteed delivery on the data channel
    #[serde(default = "default_true")]
    pub reliable: bool,
    #[serde(default, alias = "peerConnection")]
    pub peer_connection: PeerConnectionConfig,
    #[serde(default)]
    pub constraints: Constraints,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            reliable: true,
            peer_connection: PeerConnectionConfig::default(),
            constraints: Constraints::default(),
        }
    }
}

/// Settings for the transport's peer connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConnectionConfig {
    #[serde(default = "default_ice_servers", alias = "iceServers")]
    pub ice_servers: Vec<IceServer>,
}

impl Default for PeerConnectionConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
        }
    }
}

/// STUN or TURN server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// Negotiation options passed to offer and answer creation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraints {
    #[serde(default, alias = "OfferToReceiveAudio")]
    pub offer_to_receive_audio: bool,
    #[serde(default, alias = "OfferToReceiveVideo")]
    pub offer_to_receive_video: bool,
    #[serde(default = "default_true", alias = "DtlsSrtpKeyAgreement")]
    pub dtls_srtp_key_agreement: bool,
}

impl Default for Constraints {
    fn default() -> Self {
        Self {
            offer_to_receive_audio: false,
            offer_to_receive_video: false,
            dtls_srtp_key_agreement: true,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_ice_servers() -> Vec<IceServer> {
    DEFAULT_ICE_SERVERS.iter().map(|s| IceServer::new(*s)).collect()
}

impl ConnectionConfig {
    /// Best-effort delivery: unordered, no retransmits
    pub fn unreliable() -> Self {
        Self {
            reliable: false,
            ..Default::default()
        }
    }

    /// Parse a TOML document, filling in defaults for missing fields
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse TOML connection config")
    }

    /// Parse a JSON document, filling in defaults for missing fields
    pub fn from_json_str(content: &str) -> Result<Self> {
        serde_json::from_str(content).context("Failed to parse JSON connection config")
    }

    /// Load config from a `.json` or `.toml` file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&content),
            _ => Self::from_toml_str(&content),
        }
    }

    /// Check the config can build a peer connection
    pub fn validate(&self) -> Result<(), String> {
        for server in &self.peer_connection.ice_servers {
            if server.urls.is_empty() {
                return Err("ICE server entry has no URLs".to_string());
            }
            if server.urls.iter().any(|u| u.trim().is_empty()) {
                return Err("ICE server URL cannot be empty".to_string());
            }
        }
        Ok(())
    }

    /// Data channel options derived from `reliable`
    pub fn channel_options(&self) -> ChannelOptions {
        if self.reliable {
            ChannelOptions {
                ordered: true,
                max_retransmits: None,
            }
        } else {
            ChannelOptions {
                ordered: false,
                max_retransmits: Some(0),
            }
        }
    }
}
