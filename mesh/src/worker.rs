//! Instance-side edge transport worker
//!
//! Owns the instance's edge registry and bridges three parties: the
//! simulation (through its console and IPC events), the coordinator, and the
//! workers of paired instances.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Weak,
};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{
    batcher::TransferSink,
    config::{validate_rate, ConfigFieldChange, EdgeTransportConfig, InternalConfig},
    console::{ConsoleCommand, SimulationConsole},
    error::{EdgeError, EdgeResult},
    protocol::{
        AfterInternalUpdate, BeltTransfer, EdgeLinkUpdate, EdgeMessage, EdgeTransfer,
        EnsureEdgesDeactivated, SimulationEvent,
    },
    registry::{EdgeRegistry, EdgeSinks, RegistryDiff, TransferRates},
    transport::{ConnectionEvent, Endpoint, MessageTransport},
    types::{EdgeConfig, EdgeId, InstanceId, InstanceStatus},
};

struct WorkerShared {
    instance_id: InstanceId,
    config: RwLock<EdgeTransportConfig>,
    registry: EdgeRegistry,
    transport: Arc<dyn MessageTransport>,
    console: Arc<dyn SimulationConsole>,
    status: RwLock<InstanceStatus>,
    controller_connected: AtomicBool,
}

impl WorkerShared {
    fn rates(&self) -> TransferRates {
        let config = self.config.read();
        TransferRates {
            message_rate: config.transfer_message_rate,
            command_rate: config.transfer_command_rate,
        }
    }

    fn unknown_edge(&self, kind: &'static str, edge_id: EdgeId) {
        metrics::counter!("edge_transports_protocol_violations_total", "kind" => kind)
            .increment(1);
        warn!(
            instance_id = %self.instance_id,
            edge_id,
            "Got {} for unknown edge, dropping",
            kind
        );
    }
}

/// Sends flushed simulation output to the paired instance.
struct OutboundSink {
    worker: Weak<WorkerShared>,
    edge_id: EdgeId,
}

#[async_trait]
impl TransferSink for OutboundSink {
    async fn deliver(&self, belt_transfers: Vec<BeltTransfer>) -> EdgeResult<()> {
        let worker = self.worker.upgrade().ok_or(EdgeError::Cancelled)?;
        // Resolve at send time; the edge may have been retargeted since it was queued.
        let entry = worker.registry.get(self.edge_id).ok_or(EdgeError::UnknownEdge {
            instance_id: worker.instance_id,
            edge_id: self.edge_id,
        })?;
        let config = entry.config();
        worker
            .transport
            .send(
                Endpoint::Instance(config.target_instance),
                EdgeMessage::EdgeTransfer(EdgeTransfer {
                    edge_id: config.target_edge,
                    belt_transfers,
                }),
            )
            .await
    }
}

/// Pushes received transfers into the local simulation.
struct CommandSink {
    console: Arc<dyn SimulationConsole>,
    edge_id: EdgeId,
}

#[async_trait]
impl TransferSink for CommandSink {
    async fn deliver(&self, belt_transfers: Vec<BeltTransfer>) -> EdgeResult<()> {
        self.console
            .execute(ConsoleCommand::Transfer {
                edge_id: self.edge_id,
                belt_transfers,
            })
            .await
    }
}

/// Edge transport plugin state for one instance.
#[derive(Clone)]
pub struct EdgeWorker {
    shared: Arc<WorkerShared>,
}

impl std::fmt::Debug for EdgeWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EdgeWorker")
            .field("instance_id", &self.shared.instance_id)
            .field("status", &*self.shared.status.read())
            .field("edges", &self.shared.registry.ids())
            .finish()
    }
}

impl EdgeWorker {
    /// Create the worker and register the configured edges. Nothing is sent
    /// until [`EdgeWorker::start`].
    pub fn new(
        instance_id: InstanceId,
        config: EdgeTransportConfig,
        transport: Arc<dyn MessageTransport>,
        console: Arc<dyn SimulationConsole>,
    ) -> EdgeResult<Self> {
        config.validate()?;
        let worker = Self {
            shared: Arc::new(WorkerShared {
                instance_id,
                config: RwLock::new(config),
                registry: EdgeRegistry::new(),
                transport,
                console,
                status: RwLock::new(InstanceStatus::Stopped),
                controller_connected: AtomicBool::new(false),
            }),
        };
        let edges = worker.shared.config.read().internal.edges.clone();
        worker.rebuild_registry(&edges)?;
        Ok(worker)
    }

    pub fn instance_id(&self) -> InstanceId {
        self.shared.instance_id
    }

    pub fn config(&self) -> EdgeTransportConfig {
        self.shared.config.read().clone()
    }

    pub fn registry(&self) -> &EdgeRegistry {
        &self.shared.registry
    }

    pub fn status(&self) -> InstanceStatus {
        *self.shared.status.read()
    }

    pub fn set_status(&self, status: InstanceStatus) {
        *self.shared.status.write() = status;
    }

    pub fn is_controller_connected(&self) -> bool {
        self.shared.controller_connected.load(Ordering::Acquire)
    }

    fn rebuild_registry(&self, edges: &[EdgeConfig]) -> EdgeResult<RegistryDiff> {
        let rates = self.shared.rates();
        let weak = Arc::downgrade(&self.shared);
        let console = self.shared.console.clone();
        self.shared.registry.rebuild(edges, rates, |edge_id| EdgeSinks {
            outbound: Arc::new(OutboundSink {
                worker: weak.clone(),
                edge_id,
            }),
            inbound: Arc::new(CommandSink {
                console: console.clone(),
                edge_id,
            }),
        })
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Force the simulation to take the current edge config and cadence.
    pub async fn start(&self) -> EdgeResult<()> {
        info!(instance_id = %self.shared.instance_id, "Starting edge transports");
        let internal = self.shared.config.read().internal.clone();
        self.update_internal(internal, None).await?;
        let ticks = self.shared.config.read().ticks_per_edge;
        self.update_ticks_per_edge(ticks).await
    }

    /// Apply a new `internal` config.
    ///
    /// With `prev` of `None` the edge list is always pushed to the simulation.
    pub async fn update_internal(
        &self,
        internal: InternalConfig,
        prev: Option<&InternalConfig>,
    ) -> EdgeResult<()> {
        let diff = self.rebuild_registry(&internal.edges)?;
        if !diff.is_empty() {
            debug!(
                instance_id = %self.shared.instance_id,
                added = ?diff.added,
                removed = ?diff.removed,
                retargeted = ?diff.retargeted,
                "Edge registry rebuilt"
            );
        }

        let changed = prev.map_or(true, |prev| prev.edges != internal.edges);
        self.shared.config.write().internal = internal.clone();
        if !changed {
            return Ok(());
        }

        self.shared
            .console
            .execute(ConsoleCommand::SetEdges(internal.edges))
            .await?;

        if self.status().is_running() && self.is_controller_connected() {
            self.shared
                .transport
                .send(
                    Endpoint::Controller,
                    EdgeMessage::AfterInternalUpdate(AfterInternalUpdate {
                        instance_id: self.shared.instance_id,
                    }),
                )
                .await?;
        }
        Ok(())
    }

    async fn update_ticks_per_edge(&self, ticks: u32) -> EdgeResult<()> {
        self.shared
            .console
            .execute(ConsoleCommand::SetTicksPerEdge(ticks))
            .await
    }

    /// Ask the coordinator to confirm nothing is active, then shut every
    /// edge down locally.
    pub async fn stop(&self) -> EdgeResult<()> {
        info!(instance_id = %self.shared.instance_id, "Stopping edge transports");
        self.shared
            .transport
            .send(
                Endpoint::Controller,
                EdgeMessage::EnsureEdgesDeactivated(EnsureEdgesDeactivated {
                    instance_id: self.shared.instance_id,
                }),
            )
            .await?;
        self.shared.registry.deactivate_all();
        self.shared
            .console
            .execute(ConsoleCommand::SetActiveEdges(Vec::new()))
            .await?;
        self.shared.registry.cancel_all();
        Ok(())
    }

    pub fn exit(&self) {
        self.shared.registry.cancel_all();
    }

    // ------------------------------------------------------------------
    // Controller side
    // ------------------------------------------------------------------

    pub async fn controller_connection_event(&self, event: ConnectionEvent) {
        self.shared
            .controller_connected
            .store(event.is_up(), Ordering::Release);
        if event.is_up() {
            return;
        }

        info!(
            instance_id = %self.shared.instance_id,
            ?event,
            "Controller connection lost, deactivating edges"
        );
        self.shared.registry.deactivate_all();
        if let Err(e) = self
            .shared
            .console
            .execute(ConsoleCommand::SetActiveEdges(Vec::new()))
            .await
        {
            warn!(
                instance_id = %self.shared.instance_id,
                "Error deactivating edges: {}",
                e
            );
        }
    }

    /// Handle a protocol message addressed to this instance.
    pub async fn handle_message(&self, message: EdgeMessage) -> EdgeResult<()> {
        match message {
            EdgeMessage::SetActiveEdges(set) => self.set_active_edges(set.active_edges).await,
            EdgeMessage::EdgeLinkUpdate(update) => self.handle_edge_link_update(update).await,
            EdgeMessage::EdgeTransfer(transfer) => {
                self.handle_edge_transfer(transfer);
                Ok(())
            }
            other => {
                warn!(
                    instance_id = %self.shared.instance_id,
                    message = other.name(),
                    "Instance does not handle this message, dropping"
                );
                Err(EdgeError::UnexpectedReply(format!(
                    "{} is not handled by instances",
                    other.name()
                )))
            }
        }
    }

    /// Enable exactly `active_edges` and tell the simulation.
    pub async fn set_active_edges(&self, active_edges: Vec<EdgeId>) -> EdgeResult<()> {
        info!(
            instance_id = %self.shared.instance_id,
            ?active_edges,
            "Setting active edges"
        );
        for edge_id in self.shared.registry.set_active(&active_edges) {
            self.shared.unknown_edge("set_active_edges", edge_id);
        }
        self.shared
            .console
            .execute(ConsoleCommand::SetActiveEdges(active_edges))
            .await
    }

    pub async fn handle_edge_link_update(&self, update: EdgeLinkUpdate) -> EdgeResult<()> {
        if self.shared.registry.get(update.edge_id).is_none() {
            self.shared.unknown_edge("edge_link_update", update.edge_id);
            return Ok(());
        }
        self.shared
            .console
            .execute(ConsoleCommand::EdgeLinkUpdate {
                edge_id: update.edge_id,
                kind: update.kind,
                data: update.data,
            })
            .await
    }

    /// Merge received belt data into the edge's inbound buffer.
    pub fn handle_edge_transfer(&self, transfer: EdgeTransfer) {
        let Some(entry) = self.shared.registry.get(transfer.edge_id) else {
            self.shared.unknown_edge("edge_transfer", transfer.edge_id);
            return;
        };
        entry.inbound().accumulate(transfer.belt_transfers);
    }

    // ------------------------------------------------------------------
    // Simulation side
    // ------------------------------------------------------------------

    pub async fn handle_simulation_event(&self, event: SimulationEvent) -> EdgeResult<()> {
        match event {
            SimulationEvent::EdgeLinkUpdate {
                edge_id,
                kind,
                data,
            } => self.link_update_from_simulation(edge_id, kind, data).await,
            SimulationEvent::Transfer {
                edge_id,
                belt_transfers,
            } => {
                self.transfer_from_simulation(edge_id, belt_transfers);
                Ok(())
            }
        }
    }

    /// Forward a simulation link update to the paired edge.
    pub async fn link_update_from_simulation(
        &self,
        edge_id: EdgeId,
        kind: String,
        data: Value,
    ) -> EdgeResult<()> {
        let Some(entry) = self.shared.registry.get(edge_id) else {
            self.shared.unknown_edge("edge_link_update", edge_id);
            return Ok(());
        };
        let config = entry.config();
        self.shared
            .transport
            .send(
                Endpoint::Instance(config.target_instance),
                EdgeMessage::EdgeLinkUpdate(EdgeLinkUpdate {
                    edge_id: config.target_edge,
                    kind,
                    data,
                }),
            )
            .await
    }

    pub fn transfer_from_simulation(&self, edge_id: EdgeId, belt_transfers: Vec<BeltTransfer>) {
        let Some(entry) = self.shared.registry.get(edge_id) else {
            self.shared.unknown_edge("transfer", edge_id);
            return;
        };
        entry.outbound().accumulate(belt_transfers);
    }

    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------

    pub async fn config_field_changed(&self, change: ConfigFieldChange) -> EdgeResult<()> {
        debug!(
            instance_id = %self.shared.instance_id,
            field = change.field().as_str(),
            "Config field changed"
        );
        match change {
            ConfigFieldChange::Internal(internal) => {
                internal.validate()?;
                let prev = self.shared.config.read().internal.clone();
                self.update_internal(internal, Some(&prev)).await
            }
            ConfigFieldChange::TicksPerEdge(ticks) => {
                self.shared.config.write().ticks_per_edge = ticks;
                self.update_ticks_per_edge(ticks).await
            }
            ConfigFieldChange::TransferMessageRate(rate) => {
                validate_rate("transfer_message_rate", rate)?;
                self.shared.registry.set_message_rate(rate)?;
                self.shared.config.write().transfer_message_rate = rate;
                Ok(())
            }
            ConfigFieldChange::TransferCommandRate(rate) => {
                validate_rate("transfer_command_rate", rate)?;
                self.shared.registry.set_command_rate(rate)?;
                self.shared.config.write().transfer_command_rate = rate;
                Ok(())
            }
        }
    }
}
