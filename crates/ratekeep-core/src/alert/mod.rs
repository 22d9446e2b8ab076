//! Retry-exhausted alerting.
//!
//! The retry policy hands a [`FailureEvent`] to a [`Publisher`]. The default
//! [`ChannelPublisher`] enqueues it onto an [`AlertChannel`] from a spawned
//! task, so the resolution that failed never waits on delivery. An
//! [`AlertConsumer`] reads the channel independently and acknowledges each
//! message it processes.

pub mod consumer;
pub mod memory;
pub mod outbox;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bulkhead::Bulkhead;
use crate::error::AlertError;
use crate::BoxFuture;

pub use consumer::{AlertConsumer, AlertHandler, ConsumerConfig, ConsumerStats, LogAlertHandler};
pub use memory::MemoryAlertChannel;
pub use outbox::OutboxAlertChannel;

/// Topic carrying retry-exhausted alerts.
pub const DEFAULT_TOPIC: &str = "retry-exhausted";

/// Raised once per exhausted retry sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureEvent {
    pub error_message: String,
    pub source_identifier: String,
    pub attempts: u32,
    pub timestamp: OffsetDateTime,
}

/// Wire form of an alert on the channel.
///
/// `attempts` is a string on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertMessage {
    pub error: String,
    pub source: String,
    pub attempts: String,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub timestamp: Option<OffsetDateTime>,
}

impl From<&FailureEvent> for AlertMessage {
    fn from(event: &FailureEvent) -> Self {
        Self {
            error: event.error_message.clone(),
            source: event.source_identifier.clone(),
            attempts: event.attempts.to_string(),
            timestamp: Some(event.timestamp),
        }
    }
}

impl AlertMessage {
    pub fn to_json(&self) -> Result<String, AlertError> {
        serde_json::to_string(self).map_err(|error| AlertError::Codec(error.to_string()))
    }

    pub fn from_json(payload: &str) -> Result<Self, AlertError> {
        serde_json::from_str(payload).map_err(|error| AlertError::Codec(error.to_string()))
    }
}

/// One handed-out copy of a message. The same `sequence` may be delivered
/// more than once until it is acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_id: Uuid,
    pub sequence: u64,
    pub topic: String,
    pub message: AlertMessage,
    /// 1 on first delivery.
    pub delivery_count: u32,
}

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Processed,
    DeadLettered,
}

/// Ordered at-least-once message channel.
pub trait AlertChannel: Send + Sync {
    /// Append a message; returns its sequence number.
    fn enqueue<'a>(&'a self, topic: &'a str, message: AlertMessage) -> BoxFuture<'a, Result<u64, AlertError>>;

    /// Hand out up to `max` unacknowledged messages of `topic`, oldest first.
    fn poll<'a>(&'a self, topic: &'a str, max: usize) -> BoxFuture<'a, Result<Vec<Delivery>, AlertError>>;

    fn ack<'a>(&'a self, delivery: &'a Delivery, outcome: AckOutcome) -> BoxFuture<'a, Result<(), AlertError>>;
}

/// Capability used by the retry policy to raise an alert.
///
/// Must not block: implementations hand the work off and return.
pub trait Publisher: Send + Sync {
    fn publish(&self, event: FailureEvent) -> Result<(), AlertError>;
}

/// Publishes onto an [`AlertChannel`] from spawned tasks.
///
/// Dropping the publisher detaches enqueues still in flight; they run to
/// completion on the runtime. Call [`ChannelPublisher::flush`] to wait for them.
pub struct ChannelPublisher {
    channel: Arc<dyn AlertChannel>,
    topic: String,
    bulkhead: Option<Bulkhead>,
    in_flight: Mutex<JoinSet<()>>,
}

impl ChannelPublisher {
    pub fn new(channel: Arc<dyn AlertChannel>, topic: impl Into<String>) -> Self {
        Self {
            channel,
            topic: topic.into(),
            bulkhead: None,
            in_flight: Mutex::new(JoinSet::new()),
        }
    }

    pub fn with_bulkhead(mut self, bulkhead: Bulkhead) -> Self {
        self.bulkhead = Some(bulkhead);
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Wait for every enqueue spawned so far to finish.
    pub async fn flush(&self) {
        let mut pending = std::mem::take(&mut *self.lock_in_flight());
        while let Some(joined) = pending.join_next().await {
            if let Err(error) = joined {
                warn!(%error, "alert enqueue task did not complete");
            }
        }
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.in_flight.lock().unwrap_or_else(|poisoned| {
            warn!("alert publisher task set mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

impl Drop for ChannelPublisher {
    fn drop(&mut self) {
        self.in_flight
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .detach_all();
    }
}

impl Publisher for ChannelPublisher {
    fn publish(&self, event: FailureEvent) -> Result<(), AlertError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|error| AlertError::ChannelUnavailable(error.to_string()))?;

        let message = AlertMessage::from(&event);
        let channel = Arc::clone(&self.channel);
        let topic = self.topic.clone();
        let bulkhead = self.bulkhead.clone();

        let mut in_flight = self.lock_in_flight();
        while in_flight.try_join_next().is_some() {}

        in_flight.spawn_on(
            async move {
                let _permit = match &bulkhead {
                    Some(bulkhead) => match bulkhead.acquire().await {
                        Ok(permit) => Some(permit),
                        Err(error) => {
                            warn!(%error, "alert dropped, bulkhead closed");
                            return;
                        }
                    },
                    None => None,
                };

                match channel.enqueue(&topic, message).await {
                    Ok(sequence) => info!(topic = %topic, sequence, "retry-exhausted alert published"),
                    Err(error) => warn!(topic = %topic, %error, "failed to enqueue retry-exhausted alert"),
                }
            },
            &runtime,
        );
        debug!(topic = %self.topic, source = %event.source_identifier, "alert handed to publisher task");
        Ok(())
    }
}
