#![forbid(unsafe_code)]

//! Conscience daemon runtime: service registry, persistence, RPC server.

pub mod config_manager;
pub mod event_system;
pub mod metrics;
pub mod persistence;
pub mod prometheus_exporter;
pub mod registry;
pub mod server;

pub use config_manager::{ConfigManager, ConfigResponse, DynamicConfig, VersionSummary};
pub use event_system::{Event, EventSystem};
pub use metrics::MetricsCollector;
pub use registry::{Registration, Registry, ServiceView};
pub use server::{build_state, serve, DaemonState};
