//! Targets configuration snapshot.
//!
//! A [`TargetsConfig`] is one complete, immutable view of every cell tenant
//! (broker/channel) and its targets (triggers). The control plane produces a
//! fresh snapshot whenever anything changes; the data plane only ever reads
//! whole snapshots through a [`TargetsCache`].
//!
//! ## Wire format
//!
//! The machine form is protobuf (hand-derived `prost` messages). Maps are
//! `BTreeMap`s so that equal snapshots always encode to identical bytes,
//! which makes byte equality a reliable "did anything change" signal. The
//! text form is pretty-printed JSON, meant for debugging and diffs.

mod cache;
mod keys;
pub mod volume;

use std::collections::BTreeMap;

use cloudevents::Event;
use prost::Message;
use serde::{Deserialize, Serialize};

pub use cache::TargetsCache;
pub use keys::{CellTenantKey, TargetKey};

use crate::event::filter;

/// Errors produced while decoding snapshots or parsing keys.
#[derive(Debug, thiserror::Error)]
pub enum TargetsError {
    #[error("Failed to decode targets snapshot: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("Failed to parse targets text: {0}")]
    Text(#[from] serde_json::Error),

    #[error("Invalid key {key:?}: {reason}")]
    InvalidKey { key: String, reason: &'static str },

    #[error("Failed to read snapshot file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Provisioning state shared by tenants, targets and queues.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration, Serialize,
    Deserialize,
)]
#[repr(i32)]
pub enum State {
    Unknown = 0,
    Ready = 1,
    Provisioning = 2,
    Failed = 3,
}

/// Kind of cell tenant. `Broker` is the default and keeps the short
/// `<ns>/<name>` persistence form.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration, Serialize,
    Deserialize,
)]
#[repr(i32)]
pub enum CellTenantType {
    Unknown = 0,
    Broker = 1,
    Channel = 2,
    Source = 3,
}

impl CellTenantType {
    /// Lowercase name used in persistence keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            CellTenantType::Unknown => "unknown",
            CellTenantType::Broker => "broker",
            CellTenantType::Channel => "channel",
            CellTenantType::Source => "source",
        }
    }

    /// Parse a persistence-key type segment.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "unknown" => Some(CellTenantType::Unknown),
            "broker" => Some(CellTenantType::Broker),
            "channel" => Some(CellTenantType::Channel),
            "source" => Some(CellTenantType::Source),
            _ => None,
        }
    }
}

/// One durable topic/subscription pair in the queue service.
#[derive(Clone, PartialEq, Message, Serialize, Deserialize)]
#[serde(default)]
pub struct Queue {
    #[prost(string, tag = "1")]
    pub topic: String,
    #[prost(string, tag = "2")]
    pub subscription: String,
    #[prost(enumeration = "State", tag = "3")]
    pub state: i32,
}

impl Queue {
    pub fn new(topic: impl Into<String>, subscription: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            subscription: subscription.into(),
            state: State::Ready as i32,
        }
    }

    /// Whether a consumer can be attached to this queue.
    pub fn is_consumable(&self) -> bool {
        !self.topic.is_empty() && !self.subscription.is_empty()
    }
}

/// A subscriber (trigger) under a cell tenant.
#[derive(Clone, PartialEq, Message, Serialize, Deserialize)]
#[serde(default)]
pub struct Target {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(string, tag = "3")]
    pub namespace: String,
    #[prost(enumeration = "CellTenantType", tag = "4")]
    pub cell_tenant_type: i32,
    #[prost(string, tag = "5")]
    pub cell_tenant_name: String,
    #[prost(btree_map = "string, string", tag = "6")]
    pub filter_attributes: BTreeMap<String, String>,
    #[prost(message, optional, tag = "7")]
    pub retry_queue: Option<Queue>,
    #[prost(string, tag = "8")]
    pub address: String,
    #[prost(enumeration = "State", tag = "9")]
    pub state: i32,
}

impl Target {
    /// Key of the tenant owning this target.
    pub fn cell_tenant_key(&self) -> CellTenantKey {
        CellTenantKey::new(
            self.cell_tenant_type(),
            &self.namespace,
            &self.cell_tenant_name,
        )
    }

    pub fn key(&self) -> TargetKey {
        self.cell_tenant_key().target_key(&self.name)
    }

    /// Whether the event satisfies this target's attribute filter.
    pub fn matches(&self, event: &Event) -> bool {
        filter::matches(&self.filter_attributes, event)
    }
}

/// A logical broker/channel instance.
#[derive(Clone, PartialEq, Message, Serialize, Deserialize)]
#[serde(default)]
pub struct CellTenant {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(enumeration = "CellTenantType", tag = "2")]
    pub tenant_type: i32,
    #[prost(string, tag = "3")]
    pub namespace: String,
    #[prost(string, tag = "4")]
    pub name: String,
    #[prost(string, tag = "5")]
    pub address: String,
    #[prost(message, optional, tag = "6")]
    pub decouple_queue: Option<Queue>,
    #[prost(btree_map = "string, message", tag = "7")]
    pub targets: BTreeMap<String, Target>,
    #[prost(enumeration = "State", tag = "8")]
    pub state: i32,
}

impl CellTenant {
    pub fn key(&self) -> CellTenantKey {
        CellTenantKey::new(self.tenant_type(), &self.namespace, &self.name)
    }

    /// Decouple queue, if it is configured with a topic.
    pub fn usable_decouple_queue(&self) -> Option<&Queue> {
        self.decouple_queue.as_ref().filter(|q| !q.topic.is_empty())
    }

    pub fn target(&self, name: &str) -> Option<&Target> {
        self.targets.get(name)
    }

    /// Add a target, stamping the owner's identity onto it.
    pub fn with_target(mut self, mut target: Target) -> Self {
        target.namespace = self.namespace.clone();
        target.cell_tenant_type = self.tenant_type;
        target.cell_tenant_name = self.name.clone();
        self.targets.insert(target.name.clone(), target);
        self
    }
}

/// The full snapshot: tenant persistence key to tenant.
#[derive(Clone, PartialEq, Message, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetsConfig {
    #[prost(btree_map = "string, message", tag = "1")]
    pub cell_tenants: BTreeMap<String, CellTenant>,
}

impl TargetsConfig {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TargetsError> {
        Ok(Self::decode(bytes)?)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    pub fn from_text(text: &str) -> Result<Self, TargetsError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Human-readable form for logs and diffs.
    pub fn to_text(&self) -> Result<String, TargetsError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Insert a tenant under its persistence key.
    pub fn with_tenant(mut self, tenant: CellTenant) -> Self {
        self.cell_tenants
            .insert(tenant.key().persistence_string(), tenant);
        self
    }

    pub fn tenants(&self) -> impl Iterator<Item = &CellTenant> {
        self.cell_tenants.values()
    }

    pub fn targets(&self) -> impl Iterator<Item = &Target> {
        self.cell_tenants.values().flat_map(|t| t.targets.values())
    }

    pub fn tenant(&self, key: &CellTenantKey) -> Option<&CellTenant> {
        self.cell_tenants.get(&key.persistence_string())
    }

    pub fn target(&self, key: &TargetKey) -> Option<&Target> {
        self.tenant(key.cell_tenant())
            .and_then(|tenant| tenant.target(key.name()))
    }

    pub fn is_empty(&self) -> bool {
        self.cell_tenants.is_empty()
    }
}
