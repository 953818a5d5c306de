//! Messaging transport abstraction.
//!
//! The transport delivers a message to a named endpoint. A send resolves once
//! the message reached the endpoint (events) or once the endpoint finished
//! handling it (requests); failures surface as rejected sends. No ordering is
//! assumed across distinct messages.

use std::fmt::{Display, Formatter};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::{
    error::{EdgeError, EdgeResult},
    protocol::{EdgeMessage, MessageKind},
    types::{HostId, InstanceId},
};

/// Named destination of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Controller,
    Host(HostId),
    Instance(InstanceId),
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Controller => f.write_str("controller"),
            Endpoint::Host(id) => write!(f, "host:{}", id),
            Endpoint::Instance(id) => write!(f, "instance:{}", id),
        }
    }
}

/// Connection state changes reported for a link between two processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionEvent {
    Connect,
    Resume,
    Drop,
    Close,
}

impl ConnectionEvent {
    pub fn is_up(&self) -> bool {
        matches!(self, ConnectionEvent::Connect | ConnectionEvent::Resume)
    }
}

#[async_trait]
pub trait MessageTransport: Send + Sync {
    async fn send(&self, to: Endpoint, message: EdgeMessage) -> EdgeResult<()>;
}

/// A message in flight through a [`ChannelTransport`].
#[derive(Debug)]
pub struct Envelope {
    pub to: Endpoint,
    pub message: EdgeMessage,
    reply: Option<oneshot::Sender<EdgeResult<()>>>,
}

impl Envelope {
    /// Complete the send. Events have no reply channel and ignore the result.
    pub fn respond(self, result: EdgeResult<()>) {
        if let Some(reply) = self.reply {
            let _ = reply.send(result);
        }
    }

    pub fn into_parts(self) -> (Endpoint, EdgeMessage, Responder) {
        (
            self.to,
            self.message,
            Responder {
                reply: self.reply,
            },
        )
    }
}

/// Reply half of an [`Envelope`] once its message has been taken out.
#[derive(Debug)]
pub struct Responder {
    reply: Option<oneshot::Sender<EdgeResult<()>>>,
}

impl Responder {
    pub fn respond(self, result: EdgeResult<()>) {
        if let Some(reply) = self.reply {
            let _ = reply.send(result);
        }
    }
}

/// In-process transport that hands every message to a router task.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl ChannelTransport {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl MessageTransport for ChannelTransport {
    async fn send(&self, to: Endpoint, message: EdgeMessage) -> EdgeResult<()> {
        debug!(%to, message = message.name(), "Routing message");
        match message.kind() {
            MessageKind::Event => {
                self.tx
                    .send(Envelope {
                        to,
                        message,
                        reply: None,
                    })
                    .map_err(|_| EdgeError::ChannelClosed)?;
                Ok(())
            }
            MessageKind::Request => {
                let (reply_tx, reply_rx) = oneshot::channel();
                self.tx
                    .send(Envelope {
                        to,
                        message,
                        reply: Some(reply_tx),
                    })
                    .map_err(|_| EdgeError::ChannelClosed)?;
                reply_rx.await.map_err(|_| EdgeError::ChannelClosed)?
            }
        }
    }
}
