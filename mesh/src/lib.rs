//! Edge Activation and Rate-Limited Transfer Batching
//!
//! This crate provides the pieces behind cross-instance edge transports:
//! - A central coordinator deciding which edge links are safe to activate
//! - An event-queue service driving the coordinator and delivering updates
//! - Per-edge, per-direction transfer batching behind trailing-edge rate limiters
//! - The instance-side worker bridging the simulation, the coordinator and peers

pub mod batcher;
pub mod config;
pub mod console;
pub mod coordinator;
pub mod error;
pub mod protocol;
pub mod rate_limiter;
pub mod registry;
pub mod service;
pub mod transport;
pub mod types;
pub mod worker;

#[cfg(test)]
mod tests;

// Re-export commonly used types
pub use batcher::{PendingTransferBuffer, TransferBatcher, TransferDirection, TransferSink};
pub use config::{
    ClusterTopology, ConfigField, ConfigFieldChange, CoordinatorConfig, EdgeTransportConfig,
    InternalConfig,
};
pub use console::{ConsoleCommand, SimulationConsole};
pub use coordinator::{ActiveEdgesUpdate, DispatchReport, EdgeCoordinator, Reconciliation};
pub use error::{EdgeError, EdgeResult};
pub use protocol::{BeltTransfer, EdgeMessage, SimulationEvent};
pub use rate_limiter::{LimiterState, RateLimiter};
pub use registry::{EdgeRegistry, RegistryDiff};
pub use service::{CoordinatorEvent, CoordinatorHandle, CoordinatorService, CoordinatorSnapshot};
pub use transport::{ChannelTransport, ConnectionEvent, Endpoint, Envelope, MessageTransport};
pub use types::{
    Edge, EdgeConfig, EdgeId, EdgeKey, HostId, InstanceId, InstanceRecord, InstanceStatus, Offset,
};
pub use worker::EdgeWorker;
