//! Core identifiers and records shared by the coordinator and the workers.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Identifier of a simulation instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub u64);

impl Display for InstanceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for InstanceId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Identifier of a host (worker process) that runs instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostId(pub u64);

impl Display for HostId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for HostId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Local edge id, unique only within the owning instance.
pub type EdgeId = u32;

/// Position along an edge that a belt transfer fragment refers to.
pub type Offset = i64;

/// Stable composite key of an edge half: `(owner instance, local edge id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EdgeKey {
    pub instance_id: InstanceId,
    pub edge_id: EdgeId,
}

impl EdgeKey {
    pub fn new(instance_id: InstanceId, edge_id: EdgeId) -> Self {
        Self {
            instance_id,
            edge_id,
        }
    }
}

impl Display for EdgeKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.instance_id, self.edge_id)
    }
}

/// One configured edge of an instance, as stored in its configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeConfig {
    pub id: EdgeId,
    pub target_instance: InstanceId,
    pub target_edge: EdgeId,
}

/// Coordinator view of one edge half.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    /// Host currently responsible for the owning instance.
    pub host_id: Option<HostId>,
    pub instance_id: InstanceId,
    pub edge_id: EdgeId,
    pub target_instance_id: InstanceId,
    pub target_edge_id: EdgeId,
}

impl Edge {
    pub fn from_config(
        instance_id: InstanceId,
        host_id: Option<HostId>,
        config: &EdgeConfig,
    ) -> Self {
        Self {
            host_id,
            instance_id,
            edge_id: config.id,
            target_instance_id: config.target_instance,
            target_edge_id: config.target_edge,
        }
    }

    pub fn key(&self) -> EdgeKey {
        EdgeKey::new(self.instance_id, self.edge_id)
    }

    /// Key of the edge half this edge points at.
    pub fn target_key(&self) -> EdgeKey {
        EdgeKey::new(self.target_instance_id, self.target_edge_id)
    }

    /// True when this edge is owned by or points at `instance_id`.
    pub fn touches(&self, instance_id: InstanceId) -> bool {
        self.instance_id == instance_id || self.target_instance_id == instance_id
    }
}

/// Lifecycle status of an instance as reported by the orchestration layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    #[default]
    Unknown,
    Unassigned,
    Stopped,
    Starting,
    Running,
    Stopping,
    Creating,
    Exporting,
    Deleted,
}

impl InstanceStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, InstanceStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Unknown => "unknown",
            InstanceStatus::Unassigned => "unassigned",
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Starting => "starting",
            InstanceStatus::Running => "running",
            InstanceStatus::Stopping => "stopping",
            InstanceStatus::Creating => "creating",
            InstanceStatus::Exporting => "exporting",
            InstanceStatus::Deleted => "deleted",
        }
    }
}

impl Display for InstanceStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only snapshot of an instance handed to the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceRecord {
    pub id: InstanceId,
    pub status: InstanceStatus,
    pub assigned_host: Option<HostId>,
    pub edges: Vec<EdgeConfig>,
}

impl InstanceRecord {
    pub fn new(id: impl Into<InstanceId>, status: InstanceStatus) -> Self {
        Self {
            id: id.into(),
            status,
            assigned_host: None,
            edges: Vec::new(),
        }
    }

    pub fn with_host(mut self, host: impl Into<HostId>) -> Self {
        self.assigned_host = Some(host.into());
        self
    }

    pub fn with_edges(mut self, edges: Vec<EdgeConfig>) -> Self {
        self.edges = edges;
        self
    }
}
