//! Message sources and per-delivery acknowledgement
//!
//! A [`MessageSource`] hands out [`Delivery`] values one at a time. Every
//! delivery must be settled exactly once with [`Delivery::ack`],
//! [`Delivery::requeue`] or [`Delivery::reject`]; settling consumes it.

pub mod amqp;
pub mod memory;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::Result;

pub use amqp::AmqpConsumer;
pub use memory::{AckKind, AckRecord, MemoryQueue};

/// Settles one delivery with the broker
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Positive acknowledgement, removes the message
    async fn ack(&self) -> Result<()>;

    /// Negative acknowledgement; `requeue = false` dead-letters or drops it
    async fn nack(&self, requeue: bool) -> Result<()>;
}

/// One message instance handed to a worker
pub struct Delivery {
    /// Broker-assigned delivery tag
    pub tag: u64,
    /// Raw payload
    pub body: Vec<u8>,
    /// Whether the broker has delivered this message before
    pub redelivered: bool,
    /// Previous deliveries of the same message, when the broker reports it
    pub delivery_count: Option<u32>,
    acker: Box<dyn Acknowledger>,
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("tag", &self.tag)
            .field("len", &self.body.len())
            .field("redelivered", &self.redelivered)
            .field("delivery_count", &self.delivery_count)
            .finish()
    }
}

impl Delivery {
    pub fn new(
        tag: u64,
        body: Vec<u8>,
        redelivered: bool,
        delivery_count: Option<u32>,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            tag,
            body,
            redelivered,
            delivery_count,
            acker,
        }
    }

    /// Stable identity of the payload across redeliveries
    pub fn retry_key(&self) -> String {
        hex::encode(Sha256::digest(&self.body))
    }

    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }

    /// Return the message to the queue for another attempt
    pub async fn requeue(self) -> Result<()> {
        self.acker.nack(true).await
    }

    /// Drop the message (to the dead-letter exchange when one is configured)
    pub async fn reject(self) -> Result<()> {
        self.acker.nack(false).await
    }
}

/// A stream of deliveries shared by all workers of a consumption loop
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Wait for the next delivery
    ///
    /// `None` means the source is closed and will not produce more messages.
    async fn recv(&self) -> Option<Result<Delivery>>;

    /// Release the broker connection
    async fn close(&self) -> Result<()> {
        Ok(())
    }

    /// Whether the underlying connection is usable
    fn is_healthy(&self) -> bool {
        true
    }

    /// Get source name for logging
    fn name(&self) -> &str;
}
