//! Configuration types for edge transports.
//!
//! - `EdgeTransportConfig`: the per-instance `edge_transports` field group
//! - `CoordinatorConfig`: tuning for the central coordinator service
//! - `ClusterTopology`: a static description of hosts and instances, used to
//!   seed a coordinator from a file

use std::{collections::HashSet, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    error::{EdgeError, EdgeResult},
    types::{EdgeConfig, HostId, InstanceId, InstanceRecord, InstanceStatus},
};

/// The `internal` field: edges as placed by the map tooling.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct InternalConfig {
    #[serde(default)]
    pub edges: Vec<EdgeConfig>,
}

/// Per-instance `edge_transports` configuration group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EdgeTransportConfig {
    #[serde(default)]
    pub internal: InternalConfig,
    /// Number of simulation ticks to spend processing each edge.
    #[serde(default = "default_ticks_per_edge")]
    pub ticks_per_edge: u32,
    /// Messages per second for transfers sent to other instances.
    #[serde(default = "default_transfer_message_rate")]
    pub transfer_message_rate: f64,
    /// Commands per second for transfer data pushed into this instance.
    #[serde(default = "default_transfer_command_rate")]
    pub transfer_command_rate: f64,
}

fn default_ticks_per_edge() -> u32 {
    15
}

fn default_transfer_message_rate() -> f64 {
    50.0
}

// Simulation protocol update rate
fn default_transfer_command_rate() -> f64 {
    1000.0 / 34.0
}

impl Default for EdgeTransportConfig {
    fn default() -> Self {
        Self {
            internal: InternalConfig::default(),
            ticks_per_edge: default_ticks_per_edge(),
            transfer_message_rate: default_transfer_message_rate(),
            transfer_command_rate: default_transfer_command_rate(),
        }
    }
}

impl EdgeTransportConfig {
    pub fn with_edges(edges: Vec<EdgeConfig>) -> Self {
        Self {
            internal: InternalConfig { edges },
            ..Default::default()
        }
    }

    pub fn validate(&self) -> EdgeResult<()> {
        validate_rate("transfer_message_rate", self.transfer_message_rate)?;
        validate_rate("transfer_command_rate", self.transfer_command_rate)?;
        if self.ticks_per_edge == 0 {
            return Err(EdgeError::InvalidConfig(
                "ticks_per_edge must be greater than 0".to_string(),
            ));
        }
        self.internal.validate()
    }
}

impl InternalConfig {
    /// Reject duplicate local edge ids.
    pub fn validate(&self) -> EdgeResult<()> {
        let mut seen = HashSet::new();
        for edge in &self.edges {
            if !seen.insert(edge.id) {
                return Err(EdgeError::InvalidConfig(format!(
                    "duplicate edge id {}",
                    edge.id
                )));
            }
        }
        Ok(())
    }
}

/// Validate a rate in events per second.
///
/// The interval `1 / rate` must also fit in a `Duration`.
pub fn validate_rate(name: &str, rate: f64) -> EdgeResult<()> {
    if !rate.is_finite() || rate <= 0.0 {
        return Err(EdgeError::InvalidConfig(format!(
            "{name} must be a positive number, got {rate}"
        )));
    }
    if Duration::try_from_secs_f64(1.0 / rate).is_err() {
        return Err(EdgeError::InvalidConfig(format!(
            "{name} of {rate} is too small to schedule"
        )));
    }
    Ok(())
}

/// Names of the fields in the `edge_transports` group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigField {
    Internal,
    TicksPerEdge,
    TransferMessageRate,
    TransferCommandRate,
}

impl ConfigField {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigField::Internal => "internal",
            ConfigField::TicksPerEdge => "ticks_per_edge",
            ConfigField::TransferMessageRate => "transfer_message_rate",
            ConfigField::TransferCommandRate => "transfer_command_rate",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "internal" => Some(ConfigField::Internal),
            "ticks_per_edge" => Some(ConfigField::TicksPerEdge),
            "transfer_message_rate" => Some(ConfigField::TransferMessageRate),
            "transfer_command_rate" => Some(ConfigField::TransferCommandRate),
            _ => None,
        }
    }
}

/// A changed field together with its new value.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigFieldChange {
    Internal(InternalConfig),
    TicksPerEdge(u32),
    TransferMessageRate(f64),
    TransferCommandRate(f64),
}

impl ConfigFieldChange {
    /// Decode a named-field change as delivered by the configuration layer.
    ///
    /// Returns `Ok(None)` for fields outside the `edge_transports` group.
    pub fn from_json(field: &str, value: serde_json::Value) -> EdgeResult<Option<Self>> {
        let Some(field) = ConfigField::from_name(field) else {
            return Ok(None);
        };
        let change = match field {
            ConfigField::Internal => ConfigFieldChange::Internal(serde_json::from_value(value)?),
            ConfigField::TicksPerEdge => {
                ConfigFieldChange::TicksPerEdge(serde_json::from_value(value)?)
            }
            ConfigField::TransferMessageRate => {
                ConfigFieldChange::TransferMessageRate(serde_json::from_value(value)?)
            }
            ConfigField::TransferCommandRate => {
                ConfigFieldChange::TransferCommandRate(serde_json::from_value(value)?)
            }
        };
        Ok(Some(change))
    }

    pub fn field(&self) -> ConfigField {
        match self {
            ConfigFieldChange::Internal(_) => ConfigField::Internal,
            ConfigFieldChange::TicksPerEdge(_) => ConfigField::TicksPerEdge,
            ConfigFieldChange::TransferMessageRate(_) => ConfigField::TransferMessageRate,
            ConfigFieldChange::TransferCommandRate(_) => ConfigField::TransferCommandRate,
        }
    }
}

/// Coordinator service configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CoordinatorConfig {
    /// Upper bound on a single `SetActiveEdges` send
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,
}

fn default_send_timeout_ms() -> u64 {
    10_000
}

fn default_event_queue_capacity() -> usize {
    1024
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            send_timeout_ms: default_send_timeout_ms(),
            event_queue_capacity: default_event_queue_capacity(),
        }
    }
}

impl CoordinatorConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn validate(&self) -> EdgeResult<()> {
        if self.send_timeout_ms == 0 {
            return Err(EdgeError::InvalidConfig(
                "send_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.event_queue_capacity == 0 {
            return Err(EdgeError::InvalidConfig(
                "event_queue_capacity must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// One instance entry of a topology file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceTopology {
    pub id: InstanceId,
    #[serde(default)]
    pub status: InstanceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<HostId>,
    #[serde(default)]
    pub edge_transports: EdgeTransportConfig,
}

/// Static cluster description.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ClusterTopology {
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub hosts: Vec<HostId>,
    #[serde(default)]
    pub instances: Vec<InstanceTopology>,
}

impl ClusterTopology {
    pub fn from_yaml_str(s: &str) -> EdgeResult<Self> {
        Ok(serde_yaml::from_str(s)?)
    }

    pub fn validate(&self) -> EdgeResult<()> {
        self.coordinator.validate()?;

        let hosts: HashSet<HostId> = self.hosts.iter().copied().collect();
        let mut ids = HashSet::new();
        for instance in &self.instances {
            if !ids.insert(instance.id) {
                return Err(EdgeError::InvalidConfig(format!(
                    "duplicate instance id {}",
                    instance.id
                )));
            }
            if let Some(host) = instance.host {
                if !hosts.contains(&host) {
                    return Err(EdgeError::InvalidConfig(format!(
                        "instance {} is assigned to unknown host {}",
                        instance.id, host
                    )));
                }
            }
            instance.edge_transports.validate().map_err(|e| {
                EdgeError::InvalidConfig(format!("instance {}: {}", instance.id, e))
            })?;
        }
        Ok(())
    }

    pub fn instance_records(&self) -> Vec<InstanceRecord> {
        self.instances
            .iter()
            .map(|instance| InstanceRecord {
                id: instance.id,
                status: instance.status,
                assigned_host: instance.host,
                edges: instance.edge_transports.internal.edges.clone(),
            })
            .collect()
    }
}
