//! Process bootstrap and retry helpers shared by the binary and the pools.

pub mod bootstrap;
pub mod retry;
