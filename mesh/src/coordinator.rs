//! Edge activation coordinator
//!
//! Holds the configured edges of every known instance and decides which edge
//! links are safe to activate. Event handlers mutate the active set and return
//! a [`Reconciliation`]: the per-instance `SetActiveEdges` updates that bring
//! each owner in line with the new state. Only instances whose active-edge
//! membership changed since the previous reconciliation receive an update.
//!
//! Invariants, checked by [`EdgeCoordinator::is_symmetric`]:
//! - an edge is active only together with its link partner
//! - no edge of an instance awaiting its after-update handshake is activated
//!
//! Edges are tracked by `(instance, edge id)` key. Rebuilding an instance's
//! edge map purges every active link owned by that instance first, so a key
//! never outlives the edge it was activated for.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use futures::future::join_all;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    error::{EdgeError, EdgeResult},
    protocol::{EdgeMessage, SetActiveEdges},
    transport::{Endpoint, MessageTransport},
    types::{Edge, EdgeConfig, EdgeId, EdgeKey, HostId, InstanceId, InstanceRecord, InstanceStatus},
};

#[derive(Debug, Clone, PartialEq, Eq)]
struct InstanceState {
    status: InstanceStatus,
    assigned_host: Option<HostId>,
}

/// One `SetActiveEdges` message to deliver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveEdgesUpdate {
    pub host_id: HostId,
    pub instance_id: InstanceId,
    pub active_edges: Vec<EdgeId>,
}

impl ActiveEdgesUpdate {
    pub fn to_message(&self) -> EdgeMessage {
        EdgeMessage::SetActiveEdges(SetActiveEdges {
            instance_id: self.instance_id,
            active_edges: self.active_edges.clone(),
        })
    }

    /// Send this update to the owning host, giving up after `timeout`.
    pub async fn send(
        &self,
        transport: &dyn MessageTransport,
        timeout: Duration,
    ) -> EdgeResult<()> {
        let endpoint = Endpoint::Host(self.host_id);
        match tokio::time::timeout(timeout, transport.send(endpoint, self.to_message())).await {
            Ok(result) => result,
            Err(_) => Err(EdgeError::SendTimeout {
                endpoint: endpoint.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }
}

/// Outcome of delivering a [`Reconciliation`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Updates computed by one reconciliation pass, ready to be sent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[must_use = "a reconciliation does nothing until dispatched"]
pub struct Reconciliation {
    pub updates: Vec<ActiveEdgesUpdate>,
}

impl Reconciliation {
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    /// Send every update concurrently, each bounded by `timeout`.
    ///
    /// Completes once all sends have settled. Failures are logged and counted;
    /// they are not retried.
    pub async fn dispatch(
        self,
        transport: Arc<dyn MessageTransport>,
        timeout: Duration,
    ) -> DispatchReport {
        let sends = self.updates.into_iter().map(|update| {
            let transport = transport.clone();
            async move {
                match update.send(transport.as_ref(), timeout).await {
                    Ok(()) => {
                        metrics::counter!("edge_transports_set_active_edges_sent_total")
                            .increment(1);
                        true
                    }
                    Err(e) => {
                        metrics::counter!("edge_transports_set_active_edges_failed_total")
                            .increment(1);
                        error!(
                            instance_id = %update.instance_id,
                            host_id = %update.host_id,
                            "Failed to send active edges: {}",
                            e
                        );
                        false
                    }
                }
            }
        });

        let mut report = DispatchReport::default();
        for delivered in join_all(sends).await {
            if delivered {
                report.delivered += 1;
            } else {
                report.failed += 1;
            }
        }
        report
    }
}

/// Central authority over edge activation.
#[derive(Debug, Default)]
pub struct EdgeCoordinator {
    instances: HashMap<InstanceId, InstanceState>,
    connected_hosts: HashSet<HostId>,
    instance_edge_map: HashMap<InstanceId, BTreeMap<EdgeId, Edge>>,
    active_edges: BTreeSet<EdgeKey>,
    previous_active_edges: BTreeSet<EdgeKey>,
    internal_updated: HashSet<InstanceId>,
}

impl EdgeCoordinator {
    /// Open a coordinator over the instances known at startup.
    ///
    /// No edge is activated until hosts report their connections.
    pub fn open<I>(instances: I) -> Self
    where
        I: IntoIterator<Item = InstanceRecord>,
    {
        let mut coordinator = Self::default();
        for record in instances {
            coordinator.instances.insert(
                record.id,
                InstanceState {
                    status: record.status,
                    assigned_host: record.assigned_host,
                },
            );
            coordinator.create_instance_edges(record.id, &record.edges);
        }
        info!(
            instances = coordinator.instances.len(),
            "Opened edge coordinator"
        );
        coordinator
    }

    /// Drop all state. Nothing is persisted.
    pub fn close(&mut self) {
        info!(
            active_edges = self.active_edges.len(),
            "Closing edge coordinator"
        );
        *self = Self::default();
        metrics::gauge!("edge_transports_active_edges").set(0.0);
    }

    // ------------------------------------------------------------------
    // Edge map
    // ------------------------------------------------------------------

    /// Replace the instance's edge map from its edge configuration.
    pub fn create_instance_edges(&mut self, instance_id: InstanceId, edges: &[EdgeConfig]) {
        // Keys owned by this instance are about to point at new edges.
        self.remove_links_where(|edge| edge.instance_id == instance_id);

        let host_id = self
            .instances
            .get(&instance_id)
            .and_then(|state| state.assigned_host);
        let instance_edges: BTreeMap<EdgeId, Edge> = edges
            .iter()
            .map(|config| (config.id, Edge::from_config(instance_id, host_id, config)))
            .collect();
        debug!(
            %instance_id,
            edges = instance_edges.len(),
            "Rebuilt instance edge map"
        );
        self.instance_edge_map.insert(instance_id, instance_edges);
    }

    pub fn get_edge(&self, key: EdgeKey) -> Option<&Edge> {
        self.instance_edge_map
            .get(&key.instance_id)
            .and_then(|edges| edges.get(&key.edge_id))
    }

    /// Resolve the edge `edge` points at, if its target is currently known.
    pub fn get_target_edge(&self, edge: &Edge) -> Option<&Edge> {
        self.get_edge(edge.target_key())
    }

    // ------------------------------------------------------------------
    // Activation
    // ------------------------------------------------------------------

    fn instance_running(&self, instance_id: InstanceId) -> bool {
        self.instances
            .get(&instance_id)
            .is_some_and(|state| state.status.is_running())
    }

    fn edge_is_reachable(&self, edge: &Edge) -> bool {
        self.instance_running(edge.instance_id)
            && edge
                .host_id
                .is_some_and(|host| self.connected_hosts.contains(&host))
    }

    /// Activate every link of `instance_id` that is currently safe.
    ///
    /// A link qualifies when both halves resolve to each other, both owners
    /// are running on connected hosts, and neither owner is awaiting its
    /// after-update handshake.
    pub fn activate_edges(&mut self, instance_id: InstanceId) {
        if self.internal_updated.contains(&instance_id) {
            debug!(%instance_id, "Activation held until internal update is acknowledged");
            return;
        }
        let Some(edges) = self.instance_edge_map.get(&instance_id) else {
            return;
        };

        let mut links = Vec::new();
        for edge in edges.values() {
            let Some(target) = self.get_target_edge(edge) else {
                continue;
            };
            if target.target_key() != edge.key() {
                debug!(
                    edge = %edge.key(),
                    target = %target.key(),
                    "Target edge points elsewhere, not activating"
                );
                continue;
            }
            if self.internal_updated.contains(&target.instance_id) {
                continue;
            }
            if !self.edge_is_reachable(edge) || !self.edge_is_reachable(target) {
                continue;
            }
            links.push((edge.key(), target.key()));
        }

        for (edge, target) in links {
            self.active_edges.insert(edge);
            self.active_edges.insert(target);
        }
    }

    /// Remove every active link with a half matching `predicate`, both halves
    /// together. Returns the removed keys.
    fn remove_links_where<F>(&mut self, predicate: F) -> Vec<EdgeKey>
    where
        F: Fn(&Edge) -> bool,
    {
        let mut removed = BTreeSet::new();
        for key in &self.active_edges {
            let Some(edge) = self.get_edge(*key) else {
                // Unresolvable keys cannot be part of a live link.
                removed.insert(*key);
                continue;
            };
            if predicate(edge) {
                removed.insert(*key);
                removed.insert(edge.target_key());
            }
        }
        for key in &removed {
            self.active_edges.remove(key);
        }
        removed.into_iter().collect()
    }

    fn remove_link(&mut self, key: EdgeKey) {
        if let Some(target) = self.get_edge(key).map(|edge| edge.target_key()) {
            self.active_edges.remove(&target);
        }
        self.active_edges.remove(&key);
    }

    // ------------------------------------------------------------------
    // Reconciliation
    // ------------------------------------------------------------------

    /// Diff the active set against the previous snapshot and build the
    /// per-instance updates. The snapshot advances before anything is sent.
    #[instrument(skip(self), fields(active = self.active_edges.len()))]
    pub fn apply_active_edges(&mut self) -> Reconciliation {
        debug_assert!(self.is_symmetric(), "active edge set lost symmetry");

        let changed_instances: BTreeSet<InstanceId> = self
            .active_edges
            .symmetric_difference(&self.previous_active_edges)
            .map(|key| key.instance_id)
            .collect();

        let mut updates = Vec::new();
        for instance_id in changed_instances {
            let Some(state) = self.instances.get(&instance_id) else {
                continue;
            };
            if !state.status.is_running() {
                continue;
            }
            let Some(host_id) = state.assigned_host else {
                debug!(%instance_id, "No assigned host, skipping active edges update");
                continue;
            };
            if !self.connected_hosts.contains(&host_id) {
                debug!(%instance_id, %host_id, "Host not connected, dropping active edges update");
                continue;
            }

            let active_edges: Vec<EdgeId> = self
                .instance_edge_map
                .get(&instance_id)
                .map(|edges| {
                    edges
                        .keys()
                        .copied()
                        .filter(|edge_id| {
                            self.active_edges
                                .contains(&EdgeKey::new(instance_id, *edge_id))
                        })
                        .collect()
                })
                .unwrap_or_default();

            debug!(%instance_id, %host_id, ?active_edges, "Queueing active edges update");
            updates.push(ActiveEdgesUpdate {
                host_id,
                instance_id,
                active_edges,
            });
        }

        self.previous_active_edges = self.active_edges.clone();
        metrics::gauge!("edge_transports_active_edges").set(self.active_edges.len() as f64);

        Reconciliation { updates }
    }

    // ------------------------------------------------------------------
    // Host connection events
    // ------------------------------------------------------------------

    pub fn host_connected(&mut self, host_id: HostId) -> Reconciliation {
        info!(%host_id, "Host connected");
        self.connected_hosts.insert(host_id);

        let instances: Vec<InstanceId> = self
            .instances
            .iter()
            .filter(|(_, state)| state.assigned_host == Some(host_id))
            .map(|(id, _)| *id)
            .collect();
        for instance_id in instances {
            self.internal_updated.remove(&instance_id);
            self.activate_edges(instance_id);
        }
        self.apply_active_edges()
    }

    pub fn host_disconnected(&mut self, host_id: HostId) -> Reconciliation {
        info!(%host_id, "Host disconnected");
        self.connected_hosts.remove(&host_id);

        let removed = self.remove_links_where(|edge| edge.host_id == Some(host_id));
        // The reconnecting host needs a full re-send; the far side keeps its
        // snapshot so it is told about the deactivation.
        for key in removed {
            if self.get_edge(key).map_or(true, |edge| edge.host_id == Some(host_id)) {
                self.previous_active_edges.remove(&key);
            }
        }
        self.apply_active_edges()
    }

    /// Deactivate every link touching `host_id` ahead of a planned disconnect.
    pub fn host_prepare_disconnect(&mut self, host_id: HostId) -> Reconciliation {
        info!(%host_id, "Host preparing to disconnect");
        self.remove_links_where(|edge| edge.host_id == Some(host_id));
        self.apply_active_edges()
    }

    // ------------------------------------------------------------------
    // Instance lifecycle events
    // ------------------------------------------------------------------

    pub fn instance_created(&mut self, record: InstanceRecord) -> Reconciliation {
        info!(instance_id = %record.id, status = %record.status, "Instance created");
        let instance_id = record.id;
        self.instances.insert(
            instance_id,
            InstanceState {
                status: record.status,
                assigned_host: record.assigned_host,
            },
        );
        self.create_instance_edges(instance_id, &record.edges);
        if record.status.is_running() {
            self.internal_updated.remove(&instance_id);
            self.activate_edges(instance_id);
        }
        self.apply_active_edges()
    }

    pub fn instance_status_changed(
        &mut self,
        instance_id: InstanceId,
        status: InstanceStatus,
    ) -> Reconciliation {
        let Some(state) = self.instances.get_mut(&instance_id) else {
            warn!(%instance_id, %status, "Status change for unknown instance");
            return self.apply_active_edges();
        };
        debug!(%instance_id, from = %state.status, to = %status, "Instance status changed");
        state.status = status;

        if status.is_running() {
            self.internal_updated.remove(&instance_id);
            self.activate_edges(instance_id);
        } else {
            self.remove_links_where(|edge| edge.touches(instance_id));
            if status == InstanceStatus::Deleted {
                self.instance_edge_map.remove(&instance_id);
                self.instances.remove(&instance_id);
                self.internal_updated.remove(&instance_id);
            }
        }
        self.apply_active_edges()
    }

    pub fn instance_deleted(&mut self, instance_id: InstanceId) -> Reconciliation {
        self.instance_status_changed(instance_id, InstanceStatus::Deleted)
    }

    /// The instance's edge configuration changed. Its links go down and stay
    /// down until the instance acknowledges the new configuration.
    pub fn instance_edges_changed(
        &mut self,
        instance_id: InstanceId,
        edges: &[EdgeConfig],
    ) -> Reconciliation {
        info!(%instance_id, edges = edges.len(), "Instance edge configuration changed");
        self.internal_updated.insert(instance_id);
        self.remove_links_where(|edge| edge.touches(instance_id));
        self.create_instance_edges(instance_id, edges);
        self.apply_active_edges()
    }

    pub fn instance_host_changed(
        &mut self,
        instance_id: InstanceId,
        host_id: Option<HostId>,
    ) -> Reconciliation {
        info!(%instance_id, host_id = ?host_id, "Instance assigned host changed");
        if let Some(state) = self.instances.get_mut(&instance_id) {
            state.assigned_host = host_id;
        }

        let keys: Vec<EdgeKey> = match self.instance_edge_map.get_mut(&instance_id) {
            Some(edges) => edges
                .values_mut()
                .map(|edge| {
                    edge.host_id = host_id;
                    edge.key()
                })
                .collect(),
            None => Vec::new(),
        };
        for key in keys {
            self.remove_link(key);
        }
        self.apply_active_edges()
    }

    // ------------------------------------------------------------------
    // Worker requests
    // ------------------------------------------------------------------

    /// Handshake releasing the activation barrier after a config change.
    pub fn after_internal_update(&mut self, instance_id: InstanceId) -> Reconciliation {
        if !self.instance_running(instance_id) {
            let status = self
                .instances
                .get(&instance_id)
                .map(|state| state.status)
                .unwrap_or_default();
            warn!(
                %instance_id,
                %status,
                "Ignoring activate edges request from instance that is not running"
            );
            return Reconciliation::default();
        }

        debug!(%instance_id, "Internal update acknowledged");
        self.internal_updated.remove(&instance_id);
        self.activate_edges(instance_id);
        self.apply_active_edges()
    }

    /// Report active edges still touching a stopping instance. Logged, never
    /// corrected.
    pub fn ensure_edges_deactivated(&self, instance_id: InstanceId) -> Vec<EdgeKey> {
        let mut still_active = Vec::new();
        for key in &self.active_edges {
            let touches = match self.get_edge(*key) {
                Some(edge) => edge.touches(instance_id),
                None => key.instance_id == instance_id,
            };
            if touches {
                warn!(
                    "Instance {} wants edges deactivated but {} is active",
                    instance_id, key
                );
                still_active.push(*key);
            }
        }
        still_active
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    pub fn active_edges(&self) -> &BTreeSet<EdgeKey> {
        &self.active_edges
    }

    pub fn is_active(&self, key: EdgeKey) -> bool {
        self.active_edges.contains(&key)
    }

    pub fn is_internal_updated(&self, instance_id: InstanceId) -> bool {
        self.internal_updated.contains(&instance_id)
    }

    pub fn internal_updated(&self) -> impl Iterator<Item = InstanceId> + '_ {
        self.internal_updated.iter().copied()
    }

    pub fn is_host_connected(&self, host_id: HostId) -> bool {
        self.connected_hosts.contains(&host_id)
    }

    pub fn instance_edges(&self, instance_id: InstanceId) -> Option<&BTreeMap<EdgeId, Edge>> {
        self.instance_edge_map.get(&instance_id)
    }

    pub fn instance_status(&self, instance_id: InstanceId) -> Option<InstanceStatus> {
        self.instances.get(&instance_id).map(|state| state.status)
    }

    /// Every active edge resolves and its link partner is active too.
    pub fn is_symmetric(&self) -> bool {
        self.active_edges.iter().all(|key| {
            self.get_edge(*key).is_some_and(|edge| {
                self.active_edges.contains(&edge.target_key())
                    && self
                        .get_target_edge(edge)
                        .is_some_and(|target| target.target_key() == *key)
            })
        })
    }
}
