//! Queue abstraction for stage-to-stage work messages.
//!
//! Any durable at-least-once transport satisfies this trait: a broker, a
//! log-structured stream, or the bundled directory queue. Payloads are
//! UTF-8 JSON maps; decoding happens in the coordinator so the transport
//! stays oblivious to packet schemas.

mod dir;

pub use dir::DirQueue;

use async_trait::async_trait;

use crate::types::WorkPacket;

/// One received message, held un-acknowledged until the consumer decides
/// its fate. Dropping a delivery without ack leaves it eligible for
/// redelivery (at-least-once).
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Queue the message was taken from.
    pub queue: String,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
    /// Transport-specific receipt token.
    pub token: String,
}

/// Transport errors. Registry and packet errors have their own taxonomy;
/// these cover only the queue medium itself.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Durable at-least-once message transport.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Publish a packet to the named queue.
    async fn publish(&self, queue: &str, packet: &WorkPacket) -> Result<(), QueueError>;

    /// Take the next pending message, if any, marking it in-flight.
    async fn try_receive(&self, queue: &str) -> Result<Option<Delivery>, QueueError>;

    /// Remove a delivered message permanently.
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Return a delivered message to the pending pool for redelivery.
    async fn requeue(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Return messages left in-flight by a crashed consumer to the pending
    /// pool. Called once at consumer startup; transports without the
    /// concept return zero.
    async fn recover(&self, _queue: &str) -> Result<usize, QueueError> {
        Ok(0)
    }
}
