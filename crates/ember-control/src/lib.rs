//! Fleet provisioning and task orchestration engine for game servers.

pub mod cluster;
pub mod config;
pub mod config_doc;
pub mod error;
pub mod executor;
pub mod fleet;
pub mod heartbeat;
pub mod http;
pub mod installer;
pub mod lifecycle;
pub mod metrics;
pub mod notifier;
pub mod ports;
pub mod progress;
pub mod retry;
pub mod shell;
pub mod store;
pub mod tasks;

#[cfg(test)]
mod testing;
