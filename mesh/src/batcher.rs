//! Rate-limited transfer batching for one direction of one edge.
//!
//! Fragments arriving faster than they can be forwarded are merged per offset
//! into a pending buffer. The batcher's rate limiter drains the buffer in a
//! single swap and hands the ordered batch to a [`TransferSink`].
//!
//! ```text
//! accumulate() ──► PendingTransferBuffer ──► RateLimiter ──► flush ──► TransferSink
//!                   offset → merged fragment                (swap)
//! ```
//!
//! A batch whose delivery fails is dropped, not re-queued.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    error::EdgeResult,
    protocol::BeltTransfer,
    rate_limiter::RateLimiter,
    types::{EdgeId, Offset},
};

/// Which way a batcher moves data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferDirection {
    /// Simulation output sent to the paired instance over the network.
    Outbound,
    /// Data received from the paired instance, pushed into the local simulation.
    Inbound,
}

impl TransferDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferDirection::Outbound => "outbound",
            TransferDirection::Inbound => "inbound",
        }
    }
}

/// Merged content of every fragment seen at one offset since the last flush.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PendingTransfer {
    pub item_stacks: Option<Vec<Value>>,
    pub set_flow: Option<bool>,
}

impl PendingTransfer {
    /// Item stacks append in arrival order; the flow flag is last-write-wins.
    fn merge(&mut self, fragment: BeltTransfer) {
        if let Some(item_stacks) = fragment.item_stacks {
            self.item_stacks
                .get_or_insert_with(Vec::new)
                .extend(item_stacks);
        }
        if let Some(set_flow) = fragment.set_flow {
            self.set_flow = Some(set_flow);
        }
    }
}

#[derive(Debug, Default)]
pub struct PendingTransferBuffer {
    entries: BTreeMap<Offset, PendingTransfer>,
}

impl PendingTransferBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn merge<I>(&mut self, fragments: I) -> usize
    where
        I: IntoIterator<Item = BeltTransfer>,
    {
        let mut merged = 0;
        for fragment in fragments {
            self.entries
                .entry(fragment.offset)
                .or_default()
                .merge(fragment);
            merged += 1;
        }
        merged
    }

    /// Drain the buffer into wire order (ascending offset).
    pub fn take(&mut self) -> Vec<BeltTransfer> {
        std::mem::take(&mut self.entries)
            .into_iter()
            .map(|(offset, pending)| BeltTransfer {
                offset,
                item_stacks: pending.item_stacks,
                set_flow: pending.set_flow,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Destination of a flushed batch.
#[async_trait]
pub trait TransferSink: Send + Sync {
    async fn deliver(&self, transfers: Vec<BeltTransfer>) -> EdgeResult<()>;
}

struct BatcherShared {
    edge_id: EdgeId,
    direction: TransferDirection,
    pending: Mutex<PendingTransferBuffer>,
    enabled: AtomicBool,
    sink: Arc<dyn TransferSink>,
}

impl BatcherShared {
    fn take(&self) -> Vec<BeltTransfer> {
        self.pending.lock().take()
    }

    // Limiter action. A disabled batcher keeps its data until re-enabled.
    fn flush_to_sink(&self) {
        if !self.enabled.load(Ordering::Acquire) {
            debug!(
                edge_id = self.edge_id,
                direction = self.direction.as_str(),
                "Edge inactive, holding pending transfers"
            );
            return;
        }

        let batch = self.take();
        if batch.is_empty() {
            return;
        }

        metrics::counter!(
            "edge_transports_transfer_flushes_total",
            "direction" => self.direction.as_str()
        )
        .increment(1);

        let sink = self.sink.clone();
        let edge_id = self.edge_id;
        let direction = self.direction;
        tokio::spawn(async move {
            let count = batch.len();
            if let Err(e) = sink.deliver(batch).await {
                warn!(
                    edge_id,
                    direction = direction.as_str(),
                    "Dropping {} pending transfers after failed delivery: {}",
                    count,
                    e
                );
            }
        });
    }
}

/// Pending buffer plus rate limiter for one direction of one edge.
pub struct TransferBatcher {
    shared: Arc<BatcherShared>,
    limiter: RateLimiter,
}

impl std::fmt::Debug for TransferBatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferBatcher")
            .field("edge_id", &self.shared.edge_id)
            .field("direction", &self.shared.direction)
            .field("enabled", &self.is_enabled())
            .field("limiter", &self.limiter)
            .finish()
    }
}

impl TransferBatcher {
    /// New batchers start disabled.
    pub fn new(
        edge_id: EdgeId,
        direction: TransferDirection,
        max_rate: f64,
        sink: Arc<dyn TransferSink>,
    ) -> EdgeResult<Self> {
        let shared = Arc::new(BatcherShared {
            edge_id,
            direction,
            pending: Mutex::new(PendingTransferBuffer::new()),
            enabled: AtomicBool::new(false),
            sink,
        });
        let weak: Weak<BatcherShared> = Arc::downgrade(&shared);
        let limiter = RateLimiter::new(max_rate, move || {
            if let Some(shared) = weak.upgrade() {
                shared.flush_to_sink();
            }
        })?;
        Ok(Self { shared, limiter })
    }

    /// Merge fragments into the pending buffer and request a flush.
    pub fn accumulate<I>(&self, fragments: I)
    where
        I: IntoIterator<Item = BeltTransfer>,
    {
        let merged = self.shared.pending.lock().merge(fragments);
        if merged == 0 {
            return;
        }
        metrics::counter!(
            "edge_transports_transfer_fragments_total",
            "direction" => self.shared.direction.as_str()
        )
        .increment(merged as u64);
        self.limiter.activate();
    }

    /// Drain the pending buffer without sending it.
    pub fn take_pending(&self) -> Vec<BeltTransfer> {
        self.shared.take()
    }

    pub fn set_enabled(&self, enabled: bool) {
        let was_enabled = self.shared.enabled.swap(enabled, Ordering::AcqRel);
        if enabled && !was_enabled && !self.shared.pending.lock().is_empty() {
            self.limiter.activate();
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::Acquire)
    }

    pub fn set_max_rate(&self, max_rate: f64) -> EdgeResult<()> {
        self.limiter.set_max_rate(max_rate)
    }

    pub fn max_rate(&self) -> f64 {
        self.limiter.max_rate()
    }

    pub fn cancel(&self) {
        self.shared.enabled.store(false, Ordering::Release);
        self.limiter.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.limiter.is_cancelled()
    }

    pub fn pending_len(&self) -> usize {
        self.shared.pending.lock().len()
    }

    pub fn edge_id(&self) -> EdgeId {
        self.shared.edge_id
    }

    pub fn direction(&self) -> TransferDirection {
        self.shared.direction
    }
}
