//! In-process message source for tests and local runs

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{Acknowledger, Delivery, MessageSource};
use crate::error::{Error, Result};

/// How a delivery was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    Ack,
    Requeue,
    Reject,
}

/// One settlement, in order of occurrence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckRecord {
    pub tag: u64,
    pub kind: AckKind,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone)]
struct Message {
    body: Vec<u8>,
    delivery_count: u32,
}

struct Shared {
    sender: mpsc::UnboundedSender<Message>,
    log: Mutex<Vec<AckRecord>>,
    next_tag: AtomicU64,
}

/// Unbounded FIFO with broker-like requeue semantics
///
/// Requeued messages go to the back of the queue with their delivery count
/// incremented.
pub struct MemoryQueue {
    shared: Arc<Shared>,
    receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>,
    closed: CancellationToken,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryQueue {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                sender,
                log: Mutex::new(Vec::new()),
                next_tag: AtomicU64::new(1),
            }),
            receiver: tokio::sync::Mutex::new(receiver),
            closed: CancellationToken::new(),
        }
    }

    /// Enqueue a message
    pub fn publish(&self, body: impl Into<Vec<u8>>) {
        // The receiver lives as long as self, so sending cannot fail
        let _ = self.shared.sender.send(Message {
            body: body.into(),
            delivery_count: 0,
        });
    }

    /// Stop handing out messages once the queue is empty
    pub fn close_when_drained(&self) {
        self.closed.cancel();
    }

    /// Settlements so far
    pub fn acks(&self) -> Vec<AckRecord> {
        self.shared.log.lock().clone()
    }

    pub fn count(&self, kind: AckKind) -> usize {
        self.shared
            .log
            .lock()
            .iter()
            .filter(|r| r.kind == kind)
            .count()
    }
}

struct MemoryAcker {
    shared: Arc<Shared>,
    tag: u64,
    message: Message,
}

impl MemoryAcker {
    fn record(&self, kind: AckKind) {
        self.shared.log.lock().push(AckRecord {
            tag: self.tag,
            kind,
            body: self.message.body.clone(),
        });
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.record(AckKind::Ack);
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        if !requeue {
            self.record(AckKind::Reject);
            return Ok(());
        }
        self.record(AckKind::Requeue);
        self.shared
            .sender
            .send(Message {
                body: self.message.body.clone(),
                delivery_count: self.message.delivery_count + 1,
            })
            .map_err(|_| Error::queue("memory queue receiver dropped"))
    }
}

#[async_trait]
impl MessageSource for MemoryQueue {
    async fn recv(&self) -> Option<Result<Delivery>> {
        let mut receiver = self.receiver.lock().await;
        let message = tokio::select! {
            biased;
            message = receiver.recv() => message?,
            _ = self.closed.cancelled() => return None,
        };

        let tag = self.shared.next_tag.fetch_add(1, Ordering::Relaxed);
        let delivery = Delivery::new(
            tag,
            message.body.clone(),
            message.delivery_count > 0,
            Some(message.delivery_count),
            Box::new(MemoryAcker {
                shared: self.shared.clone(),
                tag,
                message,
            }),
        );
        Some(Ok(delivery))
    }

    async fn close(&self) -> Result<()> {
        self.closed.cancel();
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}
