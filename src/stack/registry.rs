//! Protocol Registry
//!
//! Maps layer names (e.g. "NAKACK") to constructors, so a stack can be built
//! from a `StackConfig`. The built-in layers are registered by
//! `with_defaults`; applications may register their own on top.

use super::config::{LayerSpec, StackConfig, parse_properties};
use super::errors::StackError;
use super::protocol::Protocol;
use crate::protocols::{causal, gms, nakack, ping, stable, unicast};
use crate::scheduler::TimeScheduler;
use crate::transport::udp;

use dashmap::DashMap;
use std::sync::Arc;

/// Builds a layer from its property object, using the stack's shared scheduler.
pub type ProtocolFactory = Arc<
    dyn Fn(&serde_json::Value, &Arc<TimeScheduler>) -> Result<Arc<dyn Protocol>, StackError>
        + Send
        + Sync,
>;

pub struct ProtocolRegistry {
    factories: DashMap<String, ProtocolFactory>,
}

impl ProtocolRegistry {
    /// Creates an empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Creates a registry with every built-in layer.
    pub fn with_defaults() -> Arc<Self> {
        let registry = Self::default();

        registry.register(udp::NAME, |props, _| {
            let config = parse_properties(udp::NAME, props)?;
            Ok(udp::UdpTransport::new(config) as Arc<dyn Protocol>)
        });
        registry.register(ping::NAME, |props, _| {
            let config = parse_properties(ping::NAME, props)?;
            Ok(ping::Ping::new(config) as Arc<dyn Protocol>)
        });
        registry.register(nakack::NAME, |props, scheduler| {
            let config = parse_properties(nakack::NAME, props)?;
            Ok(nakack::NakAck::new(config, scheduler.clone()) as Arc<dyn Protocol>)
        });
        registry.register(unicast::NAME, |props, scheduler| {
            let config = parse_properties(unicast::NAME, props)?;
            Ok(unicast::Unicast::new(config, scheduler.clone()) as Arc<dyn Protocol>)
        });
        registry.register(stable::NAME, |props, scheduler| {
            let config = parse_properties(stable::NAME, props)?;
            Ok(stable::Stable::new(config, scheduler.clone()) as Arc<dyn Protocol>)
        });
        registry.register(gms::NAME, |props, _| {
            let config = parse_properties(gms::NAME, props)?;
            Ok(gms::Gms::new(config) as Arc<dyn Protocol>)
        });
        registry.register(causal::NAME, |props, _| {
            let config = parse_properties(causal::NAME, props)?;
            Ok(causal::Causal::new(config) as Arc<dyn Protocol>)
        });

        Arc::new(registry)
    }

    /// Registers (or replaces) the constructor for `name`.
    pub fn register<F>(&self, name: &str, factory: F)
    where
        F: Fn(&serde_json::Value, &Arc<TimeScheduler>) -> Result<Arc<dyn Protocol>, StackError>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(name.to_string(), Arc::new(factory));
        tracing::debug!("Registered protocol: {}", name);
    }

    /// Instantiates one layer.
    pub fn create(
        &self,
        spec: &LayerSpec,
        scheduler: &Arc<TimeScheduler>,
    ) -> Result<Arc<dyn Protocol>, StackError> {
        let factory = self
            .factories
            .get(&spec.name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StackError::UnknownProtocol(spec.name.clone()))?;

        factory(&spec.properties, scheduler)
    }

    /// Instantiates every layer of `config`, bottom first.
    pub fn create_all(
        &self,
        config: &StackConfig,
        scheduler: &Arc<TimeScheduler>,
    ) -> Result<Vec<Arc<dyn Protocol>>, StackError> {
        config
            .layers
            .iter()
            .map(|spec| self.create(spec, scheduler))
            .collect()
    }

    pub fn list_protocols(&self) -> Vec<String> {
        self.factories
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn has_protocol(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn protocol_count(&self) -> usize {
        self.factories.len()
    }
}

impl Default for ProtocolRegistry {
    fn default() -> Self {
        Self {
            factories: DashMap::new(),
        }
    }
}
