//! Edge transport error types.

use thiserror::Error;

use crate::types::{EdgeId, InstanceId};

pub type EdgeResult<T> = Result<T, EdgeError>;

#[derive(Debug, Error)]
pub enum EdgeError {
    #[error("Unknown edge {edge_id} on instance {instance_id}")]
    UnknownEdge {
        instance_id: InstanceId,
        edge_id: EdgeId,
    },

    #[error("Unknown instance: {0}")]
    UnknownInstance(InstanceId),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Send to {endpoint} timed out after {timeout_ms}ms")]
    SendTimeout { endpoint: String, timeout_ms: u64 },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Channel closed")]
    ChannelClosed,

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}
