//! Message queue contract for task and continuation messages.
//!
//! Delivery is fire-and-forget and at-least-once. Every message carries an
//! idempotency key so queues that deduplicate can drop exact resubmissions;
//! consumers must still tolerate duplicates.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

/// A message to enqueue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    /// Deduplication key.
    pub idempotency_key: String,
    /// Serialized payload (JSON).
    pub body: Bytes,
}

impl QueueMessage {
    /// Creates a message.
    #[must_use]
    pub fn new(idempotency_key: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            idempotency_key: idempotency_key.into(),
            body: body.into(),
        }
    }
}

/// Result of enqueuing a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueResult {
    /// Message was enqueued.
    Enqueued {
        /// Queue-specific message ID.
        message_id: String,
    },
    /// An identical message was already enqueued.
    Deduplicated {
        /// The existing message ID.
        existing_message_id: String,
    },
}

impl EnqueueResult {
    /// Returns the message ID, whether new or existing.
    #[must_use]
    pub fn message_id(&self) -> &str {
        match self {
            Self::Enqueued { message_id }
            | Self::Deduplicated {
                existing_message_id: message_id,
            } => message_id,
        }
    }
}

/// Options for enqueueing.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Delay before the message becomes visible.
    pub delay: Option<Duration>,
}

impl EnqueueOptions {
    /// Sets the visibility delay.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// Message queue contract.
#[async_trait]
pub trait MessageQueue: Send + Sync + 'static {
    /// Enqueues one message.
    async fn enqueue(&self, message: QueueMessage, options: EnqueueOptions)
    -> Result<EnqueueResult>;

    /// Returns the queue's name.
    fn queue_name(&self) -> &str;
}
