//! Test doubles shared across the crate's tests.

use std::{collections::HashSet, time::Duration};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{
    console::{ConsoleCommand, SimulationConsole},
    error::{EdgeError, EdgeResult},
    protocol::EdgeMessage,
    transport::{Endpoint, MessageTransport},
    types::{EdgeConfig, EdgeId, InstanceId},
};

pub fn edge(id: EdgeId, target_instance: u64, target_edge: EdgeId) -> EdgeConfig {
    EdgeConfig {
        id,
        target_instance: InstanceId(target_instance),
        target_edge,
    }
}

/// Transport that records every send and optionally stalls or fails.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<(Endpoint, EdgeMessage)>>,
    delay: Option<Duration>,
    failing: Mutex<HashSet<Endpoint>>,
}

impl RecordingTransport {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn fail_endpoint(&self, endpoint: Endpoint) {
        self.failing.lock().insert(endpoint);
    }

    pub fn sent(&self) -> Vec<(Endpoint, EdgeMessage)> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl MessageTransport for RecordingTransport {
    async fn send(&self, to: Endpoint, message: EdgeMessage) -> EdgeResult<()> {
        self.sent.lock().push((to, message));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.lock().contains(&to) {
            return Err(EdgeError::Transport(format!("{} unreachable", to)));
        }
        Ok(())
    }
}

/// Console that renders and records every command.
#[derive(Default)]
pub struct RecordingConsole {
    commands: Mutex<Vec<ConsoleCommand>>,
    rendered: Mutex<Vec<String>>,
}

impl RecordingConsole {
    pub fn commands(&self) -> Vec<ConsoleCommand> {
        self.commands.lock().clone()
    }

    pub fn rendered(&self) -> Vec<String> {
        self.rendered.lock().clone()
    }
}

#[async_trait]
impl SimulationConsole for RecordingConsole {
    async fn execute(&self, command: ConsoleCommand) -> EdgeResult<()> {
        self.rendered.lock().push(command.render()?);
        self.commands.lock().push(command);
        Ok(())
    }
}
