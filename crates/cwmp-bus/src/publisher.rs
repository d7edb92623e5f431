//! # Message Publisher
//!
//! Defines the publishing side of the bus.

use crate::events::{BusMessage, EventFilter};
use crate::subscriber::{EventStream, Subscription};
use crate::DEFAULT_CHANNEL_CAPACITY;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Errors from publish operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// The bus was closed (shutdown or broker connection lost).
    #[error("bus closed")]
    Closed,

    /// The transport refused the message.
    #[error("publish rejected: {0}")]
    Rejected(String),
}

/// Trait for publishing messages to the bus.
///
/// Implemented by the in-memory bus here and by broker-backed transports
/// elsewhere.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a message to the bus.
    ///
    /// # Returns
    ///
    /// The number of active subscribers that received the message. Zero
    /// subscribers is not an error: on a real broker nobody may be listening
    /// on this instance.
    ///
    /// # Errors
    ///
    /// [`PublishError`] if the bus cannot accept the message at all.
    async fn publish(&self, message: BusMessage) -> Result<usize, PublishError>;

    /// Get the total number of messages published.
    fn messages_published(&self) -> u64;
}

/// In-memory implementation of the bus.
///
/// Uses `tokio::sync::broadcast` for multi-producer, multi-consumer semantics.
pub struct InMemoryEventBus {
    /// Broadcast sender; `None` once the bus is closed.
    sender: RwLock<Option<broadcast::Sender<BusMessage>>>,

    /// Active subscription count by topic key.
    subscriptions: Arc<RwLock<HashMap<String, usize>>>,

    /// Total messages published.
    messages_published: AtomicU64,

    /// Channel capacity.
    capacity: usize,
}

impl InMemoryEventBus {
    /// Create a new in-memory bus with default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a new in-memory bus with specified capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: RwLock::new(Some(sender)),
            subscriptions: Arc::new(RwLock::new(HashMap::new())),
            messages_published: AtomicU64::new(0),
            capacity,
        }
    }

    /// Subscribe to messages matching a filter.
    ///
    /// Subscribing to a closed bus yields a subscription that is already
    /// exhausted.
    #[must_use]
    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        let receiver = match self.sender.read().ok().and_then(|s| s.clone()) {
            Some(sender) => sender.subscribe(),
            None => broadcast::channel(1).1,
        };
        let topic_key = format!("{:?}", filter.topics);

        if let Ok(mut subs) = self.subscriptions.write() {
            *subs.entry(topic_key.clone()).or_insert(0) += 1;
        }

        debug!(topics = ?filter.topics, devices = ?filter.devices, "New subscription created");

        Subscription::new(receiver, filter, self.subscriptions.clone(), topic_key)
    }

    /// Get a stream of messages matching a filter.
    #[must_use]
    pub fn event_stream(&self, filter: EventFilter) -> EventStream {
        EventStream::new(self.subscribe(filter))
    }

    /// Get the number of active subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender
            .read()
            .ok()
            .and_then(|s| s.as_ref().map(broadcast::Sender::receiver_count))
            .unwrap_or(0)
    }

    /// Get the channel capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Close the bus. Pending subscribers drain and then end; later
    /// publishes fail with [`PublishError::Closed`].
    pub fn close(&self) {
        if let Ok(mut sender) = self.sender.write() {
            if sender.take().is_some() {
                info!("In-memory bus closed");
            }
        }
    }

    /// Whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.read().map(|s| s.is_none()).unwrap_or(true)
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventBus {
    async fn publish(&self, message: BusMessage) -> Result<usize, PublishError> {
        let topic = message.topic();
        let subject = message.subject();

        let sender = self
            .sender
            .read()
            .ok()
            .and_then(|s| s.clone())
            .ok_or(PublishError::Closed)?;

        self.messages_published.fetch_add(1, Ordering::Relaxed);

        match sender.send(message) {
            Ok(receiver_count) => {
                debug!(
                    topic = ?topic,
                    subject = %subject,
                    receivers = receiver_count,
                    "Message published"
                );
                Ok(receiver_count)
            }
            Err(_) => {
                warn!(topic = ?topic, subject = %subject, "Message dropped (no receivers)");
                Ok(0)
            }
        }
    }

    fn messages_published(&self) -> u64 {
        self.messages_published.load(Ordering::Relaxed)
    }
}
