//! Worker-local edge registry.
//!
//! Maps each local edge id to its configuration and its two transfer
//! batchers. Rebuilt from the full edge list on every configuration change;
//! edges whose id survives a rebuild keep their batchers and pending data.

use std::{collections::BTreeMap, sync::Arc};

use parking_lot::RwLock;
use tracing::debug;

use crate::{
    batcher::{TransferBatcher, TransferDirection, TransferSink},
    config::validate_rate,
    error::EdgeResult,
    types::{EdgeConfig, EdgeId},
};

/// Both sinks for a newly registered edge.
pub struct EdgeSinks {
    pub outbound: Arc<dyn TransferSink>,
    pub inbound: Arc<dyn TransferSink>,
}

/// Rates used when creating batchers for new edges.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferRates {
    pub message_rate: f64,
    pub command_rate: f64,
}

#[derive(Debug)]
pub struct EdgeEntry {
    config: RwLock<EdgeConfig>,
    outbound: TransferBatcher,
    inbound: TransferBatcher,
}

impl EdgeEntry {
    fn new(config: EdgeConfig, rates: TransferRates, sinks: EdgeSinks) -> EdgeResult<Self> {
        let outbound = TransferBatcher::new(
            config.id,
            TransferDirection::Outbound,
            rates.message_rate,
            sinks.outbound,
        )?;
        let inbound = TransferBatcher::new(
            config.id,
            TransferDirection::Inbound,
            rates.command_rate,
            sinks.inbound,
        )?;
        Ok(Self {
            config: RwLock::new(config),
            outbound,
            inbound,
        })
    }

    pub fn config(&self) -> EdgeConfig {
        self.config.read().clone()
    }

    pub fn outbound(&self) -> &TransferBatcher {
        &self.outbound
    }

    pub fn inbound(&self) -> &TransferBatcher {
        &self.inbound
    }

    pub fn is_active(&self) -> bool {
        self.outbound.is_enabled()
    }

    fn set_active(&self, active: bool) {
        self.outbound.set_enabled(active);
        self.inbound.set_enabled(active);
    }

    fn cancel(&self) {
        self.outbound.cancel();
        self.inbound.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.outbound.is_cancelled() || self.inbound.is_cancelled()
    }
}

/// Outcome of a registry rebuild.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryDiff {
    pub added: Vec<EdgeId>,
    pub removed: Vec<EdgeId>,
    pub retargeted: Vec<EdgeId>,
}

impl RegistryDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.retargeted.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct EdgeRegistry {
    edges: RwLock<BTreeMap<EdgeId, Arc<EdgeEntry>>>,
}

impl EdgeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the registered edge set with `configs`.
    ///
    /// `make_sinks` is only called for ids that are not registered yet, or
    /// whose entry was cancelled by a previous stop. Removed edges have both
    /// limiters cancelled.
    pub fn rebuild<F>(
        &self,
        configs: &[EdgeConfig],
        rates: TransferRates,
        mut make_sinks: F,
    ) -> EdgeResult<RegistryDiff>
    where
        F: FnMut(EdgeId) -> EdgeSinks,
    {
        validate_rate("transfer_message_rate", rates.message_rate)?;
        validate_rate("transfer_command_rate", rates.command_rate)?;

        let mut diff = RegistryDiff::default();
        let mut edges = self.edges.write();
        let mut next = BTreeMap::new();

        for config in configs {
            let existing = edges
                .remove(&config.id)
                .filter(|entry| !entry.is_cancelled());
            match existing {
                Some(entry) => {
                    let mut current = entry.config.write();
                    if *current != *config {
                        diff.retargeted.push(config.id);
                        *current = config.clone();
                    }
                    drop(current);
                    next.insert(config.id, entry);
                }
                None => {
                    let entry = EdgeEntry::new(config.clone(), rates, make_sinks(config.id))?;
                    diff.added.push(config.id);
                    next.insert(config.id, Arc::new(entry));
                }
            }
        }

        for (id, entry) in std::mem::replace(&mut *edges, next) {
            debug!(
                edge_id = id,
                pending_outbound = entry.outbound.pending_len(),
                pending_inbound = entry.inbound.pending_len(),
                "Removing edge"
            );
            entry.cancel();
            diff.removed.push(id);
        }

        Ok(diff)
    }

    pub fn get(&self, edge_id: EdgeId) -> Option<Arc<EdgeEntry>> {
        self.edges.read().get(&edge_id).cloned()
    }

    pub fn ids(&self) -> Vec<EdgeId> {
        self.edges.read().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.edges.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.read().is_empty()
    }

    /// Enable exactly the edges in `active`, disabling all others.
    ///
    /// Returns the ids in `active` that are not registered.
    pub fn set_active(&self, active: &[EdgeId]) -> Vec<EdgeId> {
        let edges = self.edges.read();
        for (id, entry) in edges.iter() {
            entry.set_active(active.contains(id));
        }
        active
            .iter()
            .copied()
            .filter(|id| !edges.contains_key(id))
            .collect()
    }

    pub fn active_ids(&self) -> Vec<EdgeId> {
        self.edges
            .read()
            .iter()
            .filter(|(_, entry)| entry.is_active())
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn deactivate_all(&self) {
        for entry in self.edges.read().values() {
            entry.set_active(false);
        }
    }

    pub fn set_message_rate(&self, rate: f64) -> EdgeResult<()> {
        validate_rate("transfer_message_rate", rate)?;
        for entry in self.edges.read().values() {
            entry.outbound.set_max_rate(rate)?;
        }
        Ok(())
    }

    pub fn set_command_rate(&self, rate: f64) -> EdgeResult<()> {
        validate_rate("transfer_command_rate", rate)?;
        for entry in self.edges.read().values() {
            entry.inbound.set_max_rate(rate)?;
        }
        Ok(())
    }

    pub fn cancel_all(&self) {
        for entry in self.edges.read().values() {
            entry.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::{protocol::BeltTransfer, types::InstanceId};

    struct NullSink;

    #[async_trait]
    impl TransferSink for NullSink {
        async fn deliver(&self, _transfers: Vec<BeltTransfer>) -> EdgeResult<()> {
            Ok(())
        }
    }

    fn sinks(_id: EdgeId) -> EdgeSinks {
        EdgeSinks {
            outbound: Arc::new(NullSink),
            inbound: Arc::new(NullSink),
        }
    }

    fn edge(id: EdgeId, target_instance: u64, target_edge: EdgeId) -> EdgeConfig {
        EdgeConfig {
            id,
            target_instance: InstanceId(target_instance),
            target_edge,
        }
    }

    const RATES: TransferRates = TransferRates {
        message_rate: 50.0,
        command_rate: 25.0,
    };

    #[tokio::test]
    async fn test_rebuild_reports_diff() {
        let registry = EdgeRegistry::new();
        let diff = registry
            .rebuild(&[edge(1, 2, 1), edge(2, 3, 1)], RATES, sinks)
            .unwrap();
        assert_eq!(diff.added, vec![1, 2]);
        assert!(diff.removed.is_empty());

        let diff = registry
            .rebuild(&[edge(2, 3, 5), edge(4, 2, 2)], RATES, sinks)
            .unwrap();
        assert_eq!(diff.added, vec![4]);
        assert_eq!(diff.removed, vec![1]);
        assert_eq!(diff.retargeted, vec![2]);
        assert_eq!(registry.ids(), vec![2, 4]);
        assert_eq!(registry.get(2).unwrap().config().target_edge, 5);

        let diff = registry
            .rebuild(&[edge(2, 3, 5), edge(4, 2, 2)], RATES, sinks)
            .unwrap();
        assert!(diff.is_empty());
    }

    #[tokio::test]
    async fn test_kept_edge_keeps_pending_data() {
        let registry = EdgeRegistry::new();
        registry.rebuild(&[edge(1, 2, 1)], RATES, sinks).unwrap();
        let entry = registry.get(1).unwrap();
        entry.outbound().accumulate(vec![BeltTransfer::flow(3, true)]);

        registry.rebuild(&[edge(1, 2, 7)], RATES, sinks).unwrap();
        assert!(Arc::ptr_eq(&entry, &registry.get(1).unwrap()));
        assert_eq!(entry.outbound().pending_len(), 1);
    }

    #[tokio::test]
    async fn test_removed_edge_is_cancelled() {
        let registry = EdgeRegistry::new();
        registry.rebuild(&[edge(1, 2, 1)], RATES, sinks).unwrap();
        let entry = registry.get(1).unwrap();

        registry.rebuild(&[], RATES, sinks).unwrap();
        assert!(registry.is_empty());
        assert!(entry.outbound().is_cancelled());
        assert!(entry.inbound().is_cancelled());
    }

    #[tokio::test]
    async fn test_rebuild_replaces_cancelled_edges() {
        let registry = EdgeRegistry::new();
        registry.rebuild(&[edge(1, 2, 1)], RATES, sinks).unwrap();
        let stopped = registry.get(1).unwrap();
        registry.cancel_all();

        let diff = registry.rebuild(&[edge(1, 2, 1)], RATES, sinks).unwrap();
        assert_eq!(diff.added, vec![1]);
        let fresh = registry.get(1).unwrap();
        assert!(!Arc::ptr_eq(&stopped, &fresh));
        assert!(!fresh.is_cancelled());
    }

    #[tokio::test]
    async fn test_set_active_reconciles_exactly() {
        let registry = EdgeRegistry::new();
        registry
            .rebuild(&[edge(1, 2, 1), edge(2, 2, 2), edge(3, 2, 3)], RATES, sinks)
            .unwrap();

        let unknown = registry.set_active(&[1, 3, 9]);
        assert_eq!(unknown, vec![9]);
        assert_eq!(registry.active_ids(), vec![1, 3]);

        registry.set_active(&[2]);
        assert_eq!(registry.active_ids(), vec![2]);

        registry.deactivate_all();
        assert!(registry.active_ids().is_empty());
    }

    #[tokio::test]
    async fn test_rate_updates_apply_per_direction() {
        let registry = EdgeRegistry::new();
        registry.rebuild(&[edge(1, 2, 1)], RATES, sinks).unwrap();
        registry.set_message_rate(5.0).unwrap();
        registry.set_command_rate(7.0).unwrap();

        let entry = registry.get(1).unwrap();
        assert_eq!(entry.outbound().max_rate(), 5.0);
        assert_eq!(entry.inbound().max_rate(), 7.0);
        assert!(registry.set_message_rate(0.0).is_err());
    }

    #[test]
    fn test_empty_registry_still_rejects_bad_rates() {
        let registry = EdgeRegistry::new();
        assert!(registry.set_message_rate(0.0).is_err());
        assert!(registry.set_command_rate(f64::NAN).is_err());
        assert!(registry.set_message_rate(1e-300).is_err());
    }
}
