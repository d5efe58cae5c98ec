//! Cellbroker - multi-tenant CloudEvents broker data plane
//!
//! Accepts events for many independent brokers ("cell tenants"), decouples
//! producers from consumers through per-tenant queues, fans events out to
//! subscribed targets over HTTP and hands failed deliveries to per-target
//! retry queues. Which tenants and targets exist comes from a snapshot the
//! control plane pushes into memory.

pub mod config;
pub mod event;
pub mod handler;
pub mod ingress;
pub mod pool;
pub mod processors;
pub mod queue;
pub mod targets;
pub mod utils;

#[cfg(test)]
mod test_utils;
