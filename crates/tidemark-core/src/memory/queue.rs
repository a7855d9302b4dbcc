//! In-memory message queue.
//!
//! Delay options are recorded but not honored. Deduplication is queue-scoped:
//! an idempotency key is released once its message is taken. A bounded queue
//! rejects new messages once `capacity` are pending.

use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

use async_trait::async_trait;
use ulid::Ulid;

use super::poison_err;
use crate::error::{Error, Result};
use crate::queue::{EnqueueOptions, EnqueueResult, MessageQueue, QueueMessage};

/// Entry in the in-memory queue.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    /// Message ID.
    pub message_id: String,
    /// The enqueued message.
    pub message: QueueMessage,
    /// Options used when enqueuing.
    pub options: EnqueueOptions,
}

#[derive(Debug, Default)]
struct QueueState {
    queue: VecDeque<QueueEntry>,
    seen_keys: HashMap<String, String>,
}

/// In-memory message queue for tests.
#[derive(Debug)]
pub struct InMemoryQueue {
    name: String,
    capacity: Option<usize>,
    state: RwLock<QueueState>,
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new("default")
    }
}

impl InMemoryQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capacity: None,
            state: RwLock::new(QueueState::default()),
        }
    }

    /// Creates an empty queue that holds at most `capacity` pending messages.
    #[must_use]
    pub fn with_capacity(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::new(name)
        }
    }

    /// Takes the next message, or `None` if the queue is empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn take(&self) -> Result<Option<QueueEntry>> {
        let mut state = self.state.write().map_err(poison_err)?;
        let entry = state.queue.pop_front();
        if let Some(ref entry) = entry {
            state.seen_keys.remove(&entry.message.idempotency_key);
        }
        drop(state);
        Ok(entry)
    }

    /// Removes and returns every queued message.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn drain(&self) -> Result<Vec<QueueEntry>> {
        let mut state = self.state.write().map_err(poison_err)?;
        let drained: Vec<_> = state.queue.drain(..).collect();
        state.seen_keys.clear();
        drop(state);
        Ok(drained)
    }

    /// Returns the number of queued messages.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn len(&self) -> Result<usize> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.queue.len())
    }

    /// Returns true if nothing is queued.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

#[async_trait]
impl MessageQueue for InMemoryQueue {
    async fn enqueue(
        &self,
        message: QueueMessage,
        options: EnqueueOptions,
    ) -> Result<EnqueueResult> {
        let mut state = self.state.write().map_err(poison_err)?;

        if let Some(existing) = state.seen_keys.get(&message.idempotency_key) {
            return Ok(EnqueueResult::Deduplicated {
                existing_message_id: existing.clone(),
            });
        }

        if self.capacity.is_some_and(|max| state.queue.len() >= max) {
            return Err(Error::queue(format!("queue '{}' is full", self.name)));
        }

        let message_id = Ulid::new().to_string();
        state
            .seen_keys
            .insert(message.idempotency_key.clone(), message_id.clone());
        state.queue.push_back(QueueEntry {
            message_id: message_id.clone(),
            message,
            options,
        });
        drop(state);

        Ok(EnqueueResult::Enqueued { message_id })
    }

    fn queue_name(&self) -> &str {
        &self.name
    }
}
