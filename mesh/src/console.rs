//! Commands pushed into the running simulation through its text console.

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::{
    error::EdgeResult,
    protocol::BeltTransfer,
    types::{EdgeConfig, EdgeId},
};

#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    SetActiveEdges(Vec<EdgeId>),
    SetEdges(Vec<EdgeConfig>),
    EdgeLinkUpdate {
        edge_id: EdgeId,
        kind: String,
        data: Value,
    },
    Transfer {
        edge_id: EdgeId,
        belt_transfers: Vec<BeltTransfer>,
    },
    SetTicksPerEdge(u32),
}

impl ConsoleCommand {
    pub fn name(&self) -> &'static str {
        match self {
            ConsoleCommand::SetActiveEdges(_) => "set_active_edges",
            ConsoleCommand::SetEdges(_) => "set_edges",
            ConsoleCommand::EdgeLinkUpdate { .. } => "edge_link_update",
            ConsoleCommand::Transfer { .. } => "transfer",
            ConsoleCommand::SetTicksPerEdge(_) => "ticks_per_edge",
        }
    }

    /// Whether the simulation is expected to print nothing back.
    pub fn expects_empty_reply(&self) -> bool {
        !matches!(self, ConsoleCommand::SetTicksPerEdge(_))
    }

    /// Render the command as console text.
    pub fn render(&self) -> EdgeResult<String> {
        let payload = match self {
            ConsoleCommand::SetTicksPerEdge(ticks) => {
                return Ok(format!(
                    "/sc global.edge_transports.ticks_per_edge = {}",
                    ticks
                ));
            }
            ConsoleCommand::SetActiveEdges(ids) => serde_json::to_string(ids)?,
            ConsoleCommand::SetEdges(edges) => serde_json::to_string(edges)?,
            ConsoleCommand::EdgeLinkUpdate {
                edge_id,
                kind,
                data,
            } => serde_json::to_string(&json!({
                "type": kind,
                "edge_id": edge_id,
                "data": data,
            }))?,
            ConsoleCommand::Transfer {
                edge_id,
                belt_transfers,
            } => {
                let transfers: Vec<Value> = belt_transfers.iter().map(ipc_transfer).collect();
                serde_json::to_string(&json!({
                    "edge_id": edge_id,
                    "belt_transfers": transfers,
                }))?
            }
        };
        Ok(format!(
            "/sc edge_transports.{}(\"{}\")",
            self.name(),
            escape_string(&payload)
        ))
    }
}

// The simulation side reads snake_case keys.
fn ipc_transfer(transfer: &BeltTransfer) -> Value {
    let mut map = Map::new();
    map.insert("offset".to_string(), json!(transfer.offset));
    if let Some(item_stacks) = &transfer.item_stacks {
        map.insert("item_stacks".to_string(), Value::Array(item_stacks.clone()));
    }
    if let Some(set_flow) = transfer.set_flow {
        map.insert("set_flow".to_string(), Value::Bool(set_flow));
    }
    Value::Object(map)
}

/// Escape a string for embedding inside a double-quoted console literal.
pub fn escape_string(s: &str) -> String {
    let mut escaped = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\0' => escaped.push_str("\\0"),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            c => escaped.push(c),
        }
    }
    escaped
}

/// Best-effort command channel into the simulation process.
#[async_trait]
pub trait SimulationConsole: Send + Sync {
    async fn execute(&self, command: ConsoleCommand) -> EdgeResult<()>;
}
