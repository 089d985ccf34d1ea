//! Stack Configuration
//!
//! A stack is described as an ordered (bottom-to-top) list of layers, each with
//! a free-form property object. Every layer turns its properties into a typed
//! config struct that rejects unknown keys, so a typo fails at setup instead of
//! silently falling back to a default.

use super::errors::StackError;

use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

fn default_queued() -> bool {
    true
}

fn default_connect_timeout() -> u64 {
    30_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LayerSpec {
    pub name: String,
    #[serde(default)]
    pub properties: serde_json::Value,
}

impl LayerSpec {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            properties: serde_json::Value::Null,
        }
    }

    pub fn with_properties(name: &str, properties: serde_json::Value) -> Self {
        Self {
            name: name.to_string(),
            properties,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StackConfig {
    /// Bottom (transport) first.
    pub layers: Vec<LayerSpec>,
    /// Give every layer its own up/down worker. Inline hand-over when false.
    #[serde(default = "default_queued")]
    pub queued: bool,
    /// Upper bound for `Channel::connect` and `Channel::disconnect`, in ms.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
}

impl StackConfig {
    pub fn new(layers: Vec<LayerSpec>) -> Self {
        Self {
            layers,
            queued: default_queued(),
            connect_timeout: default_connect_timeout(),
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    /// The standard UDP stack: discovery through `initial_hosts`, reliable
    /// multicast and unicast, stability, membership and causal ordering.
    pub fn default_udp(bind_addr: SocketAddr, initial_hosts: &[SocketAddr]) -> Self {
        let hosts: Vec<String> = initial_hosts.iter().map(|h| h.to_string()).collect();
        Self::new(vec![
            LayerSpec::with_properties(
                "UDP",
                serde_json::json!({ "bind_addr": bind_addr.to_string() }),
            ),
            LayerSpec::with_properties("PING", serde_json::json!({ "initial_hosts": hosts })),
            LayerSpec::new("NAKACK"),
            LayerSpec::new("UNICAST"),
            LayerSpec::new("STABLE"),
            LayerSpec::new("GMS"),
            LayerSpec::new("CAUSAL"),
        ])
    }

    pub fn connect_timeout(&self) -> Duration {
        millis(self.connect_timeout)
    }

    /// Layer names joined bottom-to-top, e.g. `UDP:PING:NAKACK`.
    pub fn protocol_spec(&self) -> String {
        self.layers
            .iter()
            .map(|l| l.name.as_str())
            .collect::<Vec<_>>()
            .join(":")
    }
}

/// Turns a layer's property object into its typed config. `null` means "all defaults".
pub fn parse_properties<T: DeserializeOwned>(
    layer: &str,
    properties: &serde_json::Value,
) -> Result<T, StackError> {
    let value = match properties {
        serde_json::Value::Null => serde_json::Value::Object(serde_json::Map::new()),
        other => other.clone(),
    };

    serde_json::from_value(value).map_err(|e| StackError::InvalidProperties {
        layer: layer.to_string(),
        reason: e.to_string(),
    })
}

pub fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms)
}

pub fn millis_list(ms: &[u64]) -> Vec<Duration> {
    ms.iter().copied().map(Duration::from_millis).collect()
}
