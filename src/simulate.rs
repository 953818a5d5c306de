//! Offline evaluation of a cluster topology file.

use std::{collections::BTreeMap, path::Path};

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::mesh::{ActiveEdgesUpdate, ClusterTopology, EdgeCoordinator, EdgeKey, InstanceId};

/// Read and validate a topology file.
pub fn load_topology(path: &Path) -> Result<ClusterTopology> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read topology file {}", path.display()))?;
    let topology = ClusterTopology::from_yaml_str(&contents)
        .with_context(|| format!("failed to parse topology file {}", path.display()))?;
    topology
        .validate()
        .with_context(|| format!("invalid topology in {}", path.display()))?;
    Ok(topology)
}

#[derive(Debug, Clone, Default)]
pub struct SimulationReport {
    /// Last update each instance received, keyed by instance.
    pub updates: BTreeMap<InstanceId, ActiveEdgesUpdate>,
    pub active_edges: Vec<EdgeKey>,
}

/// Open a coordinator over the topology and connect every host in order.
pub fn simulate(topology: &ClusterTopology) -> SimulationReport {
    let mut coordinator = EdgeCoordinator::open(topology.instance_records());
    let mut report = SimulationReport::default();

    let mut hosts = topology.hosts.clone();
    hosts.sort();
    hosts.dedup();
    for host_id in hosts {
        let reconciliation = coordinator.host_connected(host_id);
        debug!(%host_id, updates = reconciliation.updates.len(), "Host connected");
        for update in reconciliation.updates {
            report.updates.insert(update.instance_id, update);
        }
    }

    report.active_edges = coordinator.active_edges().iter().copied().collect();
    info!(
        instances = topology.instances.len(),
        active_edges = report.active_edges.len(),
        "Simulation finished"
    );
    coordinator.close();
    report
}
