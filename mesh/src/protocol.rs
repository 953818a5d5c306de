//! Message vocabulary exchanged between the coordinator and instance workers.
//!
//! Each message declares which role sends it and which role receives it, and
//! whether it is a fire-and-forget event or a request that is answered once
//! the receiver has finished handling it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{EdgeId, InstanceId, Offset};

/// Roles taking part in the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Controller,
    Instance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Event,
    Request,
}

/// One fragment of belt data at a given offset along an edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BeltTransfer {
    pub offset: Offset,
    #[serde(default, alias = "item_stacks", skip_serializing_if = "Option::is_none")]
    pub item_stacks: Option<Vec<Value>>,
    #[serde(default, alias = "set_flow", skip_serializing_if = "Option::is_none")]
    pub set_flow: Option<bool>,
}

impl BeltTransfer {
    pub fn items(offset: Offset, item_stacks: Vec<Value>) -> Self {
        Self {
            offset,
            item_stacks: Some(item_stacks),
            set_flow: None,
        }
    }

    pub fn flow(offset: Offset, set_flow: bool) -> Self {
        Self {
            offset,
            item_stacks: None,
            set_flow: Some(set_flow),
        }
    }
}

/// Releases the activation barrier for an instance after it applied new edges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AfterInternalUpdate {
    pub instance_id: InstanceId,
}

/// Sent by a stopping instance; answered once the coordinator checked its state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnsureEdgesDeactivated {
    pub instance_id: InstanceId,
}

/// Full replacement list of the edges an instance should have live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetActiveEdges {
    pub instance_id: InstanceId,
    pub active_edges: Vec<EdgeId>,
}

/// Opaque control signal between the simulation logic on both ends of an edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeLinkUpdate {
    pub edge_id: EdgeId,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

/// One flush of an outbound transfer batcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeTransfer {
    pub edge_id: EdgeId,
    pub belt_transfers: Vec<BeltTransfer>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EdgeMessage {
    AfterInternalUpdate(AfterInternalUpdate),
    EnsureEdgesDeactivated(EnsureEdgesDeactivated),
    SetActiveEdges(SetActiveEdges),
    EdgeLinkUpdate(EdgeLinkUpdate),
    EdgeTransfer(EdgeTransfer),
}

impl EdgeMessage {
    pub fn name(&self) -> &'static str {
        match self {
            EdgeMessage::AfterInternalUpdate(_) => "after_internal_update",
            EdgeMessage::EnsureEdgesDeactivated(_) => "ensure_edges_deactivated",
            EdgeMessage::SetActiveEdges(_) => "set_active_edges",
            EdgeMessage::EdgeLinkUpdate(_) => "edge_link_update",
            EdgeMessage::EdgeTransfer(_) => "edge_transfer",
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            EdgeMessage::AfterInternalUpdate(_) | EdgeMessage::EdgeLinkUpdate(_) => {
                MessageKind::Event
            }
            EdgeMessage::EnsureEdgesDeactivated(_)
            | EdgeMessage::SetActiveEdges(_)
            | EdgeMessage::EdgeTransfer(_) => MessageKind::Request,
        }
    }

    pub fn src(&self) -> Role {
        match self {
            EdgeMessage::SetActiveEdges(_) => Role::Controller,
            _ => Role::Instance,
        }
    }

    pub fn dst(&self) -> Role {
        match self {
            EdgeMessage::AfterInternalUpdate(_) | EdgeMessage::EnsureEdgesDeactivated(_) => {
                Role::Controller
            }
            _ => Role::Instance,
        }
    }
}

/// Events raised by the simulation over its IPC channel.
#[derive(Debug, Clone, PartialEq)]
pub enum SimulationEvent {
    EdgeLinkUpdate {
        edge_id: EdgeId,
        kind: String,
        data: Value,
    },
    Transfer {
        edge_id: EdgeId,
        belt_transfers: Vec<BeltTransfer>,
    },
}

#[derive(Debug, Deserialize)]
struct IpcEdgeLinkUpdate {
    edge_id: EdgeId,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
struct IpcTransfer {
    edge_id: EdgeId,
    #[serde(default)]
    belt_transfers: Vec<BeltTransfer>,
}

pub const IPC_EDGE_LINK_UPDATE: &str = "edge_transports:edge_link_update";
pub const IPC_TRANSFER: &str = "edge_transports:transfer";

impl SimulationEvent {
    /// Decode a payload received on one of the simulation IPC channels.
    ///
    /// Returns `Ok(None)` for channels this plugin does not listen on.
    pub fn from_ipc(channel: &str, payload: Value) -> Result<Option<Self>, serde_json::Error> {
        match channel {
            IPC_EDGE_LINK_UPDATE => {
                let update: IpcEdgeLinkUpdate = serde_json::from_value(payload)?;
                Ok(Some(SimulationEvent::EdgeLinkUpdate {
                    edge_id: update.edge_id,
                    kind: update.kind,
                    data: update.data,
                }))
            }
            IPC_TRANSFER => {
                let transfer: IpcTransfer = serde_json::from_value(payload)?;
                Ok(Some(SimulationEvent::Transfer {
                    edge_id: transfer.edge_id,
                    belt_transfers: transfer.belt_transfers,
                }))
            }
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_edge_transfer_wire_format() {
        let message = EdgeMessage::EdgeTransfer(EdgeTransfer {
            edge_id: 4,
            belt_transfers: vec![
                BeltTransfer::items(1, vec![json!({"name": "iron-plate", "count": 4})]),
                BeltTransfer::flow(2, false),
            ],
        });
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "edge_transfer",
                "data": {
                    "edgeId": 4,
                    "beltTransfers": [
                        {"offset": 1, "itemStacks": [{"name": "iron-plate", "count": 4}]},
                        {"offset": 2, "setFlow": false},
                    ],
                },
            })
        );
        let decoded: EdgeMessage = serde_json::from_value(value).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_message_roles() {
        let set = EdgeMessage::SetActiveEdges(SetActiveEdges {
            instance_id: InstanceId(1),
            active_edges: vec![1, 2],
        });
        assert_eq!(set.kind(), MessageKind::Request);
        assert_eq!(set.src(), Role::Controller);
        assert_eq!(set.dst(), Role::Instance);

        let after = EdgeMessage::AfterInternalUpdate(AfterInternalUpdate {
            instance_id: InstanceId(1),
        });
        assert_eq!(after.kind(), MessageKind::Event);
        assert_eq!(after.dst(), Role::Controller);
        assert_eq!(after.name(), "after_internal_update");
    }

    #[test]
    fn test_simulation_event_from_ipc() {
        let event = SimulationEvent::from_ipc(
            IPC_TRANSFER,
            json!({
                "edge_id": 3,
                "belt_transfers": [{"offset": 7, "item_stacks": [{"name": "coal"}], "set_flow": true}],
            }),
        )
        .unwrap()
        .unwrap();
        assert_eq!(
            event,
            SimulationEvent::Transfer {
                edge_id: 3,
                belt_transfers: vec![BeltTransfer {
                    offset: 7,
                    item_stacks: Some(vec![json!({"name": "coal"})]),
                    set_flow: Some(true),
                }],
            }
        );

        let event = SimulationEvent::from_ipc(
            IPC_EDGE_LINK_UPDATE,
            json!({"edge_id": 1, "type": "belt_check", "data": {"ok": true}}),
        )
        .unwrap()
        .unwrap();
        assert!(matches!(event, SimulationEvent::EdgeLinkUpdate { edge_id: 1, .. }));

        assert!(SimulationEvent::from_ipc("other", json!({})).unwrap().is_none());
        assert!(SimulationEvent::from_ipc(IPC_TRANSFER, json!({"belt_transfers": []})).is_err());
    }
}
