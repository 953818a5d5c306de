//! Coordinator event loop
//!
//! Serializes every coordinator mutation through one mpsc queue. Handlers run
//! to completion synchronously; the resulting sends are spawned so the loop
//! keeps consuming events while a slow host is being reached.

use std::{collections::BTreeSet, sync::Arc};

use futures::{
    future::{join_all, BoxFuture, Shared},
    FutureExt,
};
use tokio::sync::{mpsc, oneshot, watch};
use tracing as log;
use tracing::instrument;

use crate::{
    config::CoordinatorConfig,
    coordinator::{DispatchReport, EdgeCoordinator, Reconciliation},
    error::{EdgeError, EdgeResult},
    protocol::EdgeMessage,
    transport::{ConnectionEvent, Endpoint, MessageTransport},
    types::{EdgeConfig, EdgeKey, HostId, InstanceId, InstanceRecord, InstanceStatus},
};

type InFlightDispatch = Shared<BoxFuture<'static, DispatchReport>>;

/// Everything the coordinator reacts to.
#[derive(Debug)]
pub enum CoordinatorEvent {
    InstanceCreated(InstanceRecord),
    InstanceStatusChanged {
        instance_id: InstanceId,
        status: InstanceStatus,
    },
    InstanceEdgesChanged {
        instance_id: InstanceId,
        edges: Vec<EdgeConfig>,
    },
    InstanceHostChanged {
        instance_id: InstanceId,
        host_id: Option<HostId>,
    },
    InstanceDeleted(InstanceId),
    HostConnected(HostId),
    HostDisconnected(HostId),
    HostPrepareDisconnect {
        host_id: HostId,
        done: Option<oneshot::Sender<()>>,
    },
    /// Protocol message addressed to the controller.
    Message {
        from: Endpoint,
        message: EdgeMessage,
        reply: Option<oneshot::Sender<EdgeResult<()>>>,
    },
    Snapshot(oneshot::Sender<CoordinatorSnapshot>),
}

impl CoordinatorEvent {
    pub fn host_connection(host_id: HostId, event: ConnectionEvent) -> Self {
        if event.is_up() {
            CoordinatorEvent::HostConnected(host_id)
        } else {
            CoordinatorEvent::HostDisconnected(host_id)
        }
    }
}

/// Point-in-time view of coordinator state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoordinatorSnapshot {
    pub active_edges: BTreeSet<EdgeKey>,
    pub internal_updated: BTreeSet<InstanceId>,
    pub in_flight_dispatches: usize,
}

/// Cloneable sender side of the coordinator queue.
#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::Sender<CoordinatorEvent>,
}

impl CoordinatorHandle {
    pub async fn send(&self, event: CoordinatorEvent) -> EdgeResult<()> {
        self.tx.send(event).await.map_err(|_| EdgeError::ChannelClosed)
    }

    /// Hand a controller-bound message to the coordinator and wait until it
    /// has been handled.
    pub async fn deliver(&self, from: Endpoint, message: EdgeMessage) -> EdgeResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(CoordinatorEvent::Message {
            from,
            message,
            reply: Some(reply_tx),
        })
        .await?;
        reply_rx.await.map_err(|_| EdgeError::ChannelClosed)?
    }

    /// Deactivate the host's links and wait until the updates went out.
    pub async fn prepare_disconnect(&self, host_id: HostId) -> EdgeResult<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.send(CoordinatorEvent::HostPrepareDisconnect {
            host_id,
            done: Some(done_tx),
        })
        .await?;
        done_rx.await.map_err(|_| EdgeError::ChannelClosed)
    }

    pub async fn snapshot(&self) -> EdgeResult<CoordinatorSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.send(CoordinatorEvent::Snapshot(tx)).await?;
        rx.await.map_err(|_| EdgeError::ChannelClosed)
    }
}

pub struct CoordinatorService {
    coordinator: EdgeCoordinator,
    transport: Arc<dyn MessageTransport>,
    config: CoordinatorConfig,
    in_flight: Vec<InFlightDispatch>,
}

impl CoordinatorService {
    /// Build the service and the queue feeding it.
    pub fn new(
        coordinator: EdgeCoordinator,
        transport: Arc<dyn MessageTransport>,
        config: CoordinatorConfig,
    ) -> EdgeResult<(Self, CoordinatorHandle, mpsc::Receiver<CoordinatorEvent>)> {
        config.validate()?;
        let (tx, rx) = mpsc::channel(config.event_queue_capacity);
        let service = Self {
            coordinator,
            transport,
            config,
            in_flight: Vec::new(),
        };
        Ok((service, CoordinatorHandle { tx }, rx))
    }

    /// Consume events until the queue closes or shutdown is signalled, then
    /// wait for outstanding sends.
    #[instrument(skip_all)]
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<CoordinatorEvent>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> EdgeCoordinator {
        log::info!("Edge coordinator service started");

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => {
                        log::info!("Coordinator event queue closed");
                        break;
                    }
                },
                _ = shutdown_rx.changed() => {
                    log::info!("Edge coordinator service received shutdown signal");
                    break;
                }
            }
        }

        let pending = std::mem::take(&mut self.in_flight);
        if !pending.is_empty() {
            log::info!("Waiting for {} in-flight dispatches", pending.len());
            join_all(pending).await;
        }
        log::info!("Edge coordinator service stopped");
        self.coordinator
    }

    fn handle_event(&mut self, event: CoordinatorEvent) {
        self.in_flight.retain(|dispatch| dispatch.peek().is_none());

        match event {
            CoordinatorEvent::InstanceCreated(record) => {
                let reconciliation = self.coordinator.instance_created(record);
                self.dispatch(reconciliation);
            }
            CoordinatorEvent::InstanceStatusChanged {
                instance_id,
                status,
            } => {
                let reconciliation = self
                    .coordinator
                    .instance_status_changed(instance_id, status);
                self.dispatch(reconciliation);
            }
            CoordinatorEvent::InstanceEdgesChanged { instance_id, edges } => {
                let reconciliation = self.coordinator.instance_edges_changed(instance_id, &edges);
                self.dispatch(reconciliation);
            }
            CoordinatorEvent::InstanceHostChanged {
                instance_id,
                host_id,
            } => {
                let reconciliation = self.coordinator.instance_host_changed(instance_id, host_id);
                self.dispatch(reconciliation);
            }
            CoordinatorEvent::InstanceDeleted(instance_id) => {
                let reconciliation = self.coordinator.instance_deleted(instance_id);
                self.dispatch(reconciliation);
            }
            CoordinatorEvent::HostConnected(host_id) => {
                let reconciliation = self.coordinator.host_connected(host_id);
                self.dispatch(reconciliation);
            }
            CoordinatorEvent::HostDisconnected(host_id) => {
                let reconciliation = self.coordinator.host_disconnected(host_id);
                self.dispatch(reconciliation);
            }
            CoordinatorEvent::HostPrepareDisconnect { host_id, done } => {
                let reconciliation = self.coordinator.host_prepare_disconnect(host_id);
                let dispatch = self.dispatch(reconciliation);
                if let Some(done) = done {
                    tokio::spawn(async move {
                        if let Some(dispatch) = dispatch {
                            dispatch.await;
                        }
                        let _ = done.send(());
                    });
                }
            }
            CoordinatorEvent::Message {
                from,
                message,
                reply,
            } => self.handle_message(from, message, reply),
            CoordinatorEvent::Snapshot(tx) => {
                let snapshot = CoordinatorSnapshot {
                    active_edges: self.coordinator.active_edges().clone(),
                    internal_updated: self.coordinator.internal_updated().collect(),
                    in_flight_dispatches: self.in_flight.len(),
                };
                let _ = tx.send(snapshot);
            }
        }
    }

    fn handle_message(
        &mut self,
        from: Endpoint,
        message: EdgeMessage,
        reply: Option<oneshot::Sender<EdgeResult<()>>>,
    ) {
        log::debug!(%from, message = message.name(), "Controller received message");
        match message {
            EdgeMessage::AfterInternalUpdate(update) => {
                let reconciliation = self.coordinator.after_internal_update(update.instance_id);
                self.dispatch(reconciliation);
                respond(reply, Ok(()));
            }
            EdgeMessage::EnsureEdgesDeactivated(request) => {
                let still_active = self
                    .coordinator
                    .ensure_edges_deactivated(request.instance_id);
                if !still_active.is_empty() {
                    log::warn!(
                        instance_id = %request.instance_id,
                        "{} edges still active while instance is stopping",
                        still_active.len()
                    );
                }
                // Answer only once updates issued before this request settled.
                let pending = self.in_flight.clone();
                tokio::spawn(async move {
                    join_all(pending).await;
                    respond(reply, Ok(()));
                });
            }
            other => {
                metrics::counter!(
                    "edge_transports_protocol_violations_total",
                    "kind" => "misrouted_message"
                )
                .increment(1);
                log::warn!(
                    %from,
                    message = other.name(),
                    "Controller does not handle this message, dropping"
                );
                respond(
                    reply,
                    Err(EdgeError::UnexpectedReply(format!(
                        "{} is not handled by the controller",
                        other.name()
                    ))),
                );
            }
        }
    }

    fn dispatch(&mut self, reconciliation: Reconciliation) -> Option<InFlightDispatch> {
        if reconciliation.is_empty() {
            return None;
        }
        let dispatch = reconciliation
            .dispatch(self.transport.clone(), self.config.send_timeout())
            .boxed()
            .shared();
        tokio::spawn(dispatch.clone());
        self.in_flight.push(dispatch.clone());
        Some(dispatch)
    }
}

fn respond(reply: Option<oneshot::Sender<EdgeResult<()>>>, result: EdgeResult<()>) {
    if let Some(reply) = reply {
        let _ = reply.send(result);
    }
}
