//! Configuration: a JSON document deserialized into typed structures.
//!
//! Handlers (auth, status, statistics) are referenced by name and built
//! through compile-time registries; there is no runtime code loading.
//! Reload re-reads the same document and reconstructs everything through
//! the same registries.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::buffer::DEFAULT_MAX_QUEUE_SIZE;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid configuration document: {0}")]
    Json(#[from] serde_json::Error),
    #[error("bad burst size {0:?}")]
    BadBurstSize(String),
    #[error("unknown {kind} handler {name:?}")]
    UnknownHandler { kind: &'static str, name: String },
}

/// A burst size: plain bytes, or a `"<n>k"` string.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum BurstSize {
    Bytes(u64),
    Text(String),
}

impl BurstSize {
    pub fn to_bytes(&self) -> Result<usize, ConfigError> {
        match self {
            BurstSize::Bytes(n) => Ok(*n as usize),
            BurstSize::Text(s) => {
                let (digits, mult) = match s.strip_suffix('k') {
                    Some(digits) => (digits, 1024),
                    None => (s.as_str(), 1),
                };
                if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(ConfigError::BadBurstSize(s.clone()));
                }
                digits
                    .parse::<usize>()
                    .map(|n| n * mult)
                    .map_err(|_| ConfigError::BadBurstSize(s.clone()))
            }
        }
    }
}

/// Resolves an optional burst-size setting to bytes.
pub fn convert_burst_size(size: Option<&BurstSize>) -> Result<Option<usize>, ConfigError> {
    size.map(BurstSize::to_bytes).transpose()
}

/// A named handler reference with free-form options.
#[derive(Debug, Clone, Deserialize)]
pub struct HandlerConfig {
    pub handler: String,
    #[serde(flatten)]
    pub options: HashMap<String, Value>,
}

impl HandlerConfig {
    pub fn option_str(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(Value::as_str)
    }

    pub fn option_u64(&self, key: &str) -> Option<u64> {
        self.options.get(key).and_then(Value::as_u64)
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct MountConfig {
    pub path: String,
    #[serde(default)]
    pub source_urls: Vec<String>,
    #[serde(default)]
    pub burst_size: Option<BurstSize>,
    #[serde(default)]
    pub on_demand: Option<bool>,
    #[serde(default)]
    pub keepalive: Option<u64>,
    #[serde(default)]
    pub net_resolve_all: Option<bool>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub source_user: Option<String>,
    #[serde(default)]
    pub source_password: Option<String>,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub token_timeout: Option<u64>,
    #[serde(default)]
    pub token_prefix: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub bind: Option<String>,
    #[serde(default)]
    pub burst_size: Option<BurstSize>,
    #[serde(default)]
    pub on_demand: bool,
    #[serde(default)]
    pub keepalive: Option<u64>,
    #[serde(default)]
    pub net_resolve_all: bool,
    #[serde(default)]
    pub clients_limit: Option<usize>,
    #[serde(default)]
    pub max_queue_size: Option<usize>,
    #[serde(default)]
    pub mounts: Vec<MountConfig>,
    #[serde(default)]
    pub auth: Vec<HandlerConfig>,
    #[serde(default)]
    pub status: HashMap<String, HandlerConfig>,
    #[serde(default)]
    pub statistics: Vec<HandlerConfig>,
    /// Content-Type to format overrides merged over the default mapping.
    /// Format names: `raw`, `mpegts`, `flv`, `mp3`, `adts`.
    #[serde(default)]
    pub content_types: HashMap<String, String>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn max_queue_size(&self) -> usize {
        self.max_queue_size.unwrap_or(DEFAULT_MAX_QUEUE_SIZE)
    }

    /// Effective burst size for a mount, mount setting over global.
    pub fn mount_burst_size(&self, mount: &MountConfig) -> Result<Option<usize>, ConfigError> {
        convert_burst_size(mount.burst_size.as_ref().or(self.burst_size.as_ref()))
    }

    pub fn mount_on_demand(&self, mount: &MountConfig) -> bool {
        mount.on_demand.unwrap_or(self.on_demand)
    }

    pub fn mount_keepalive(&self, mount: &MountConfig) -> Option<u64> {
        mount.keepalive.or(self.keepalive)
    }

    pub fn mount_net_resolve_all(&self, mount: &MountConfig) -> bool {
        mount.net_resolve_all.unwrap_or(self.net_resolve_all)
    }
}
