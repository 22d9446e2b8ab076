use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use tracing::warn;
use uuid::Uuid;

use super::{AckOutcome, AlertChannel, AlertMessage, Delivery};
use crate::error::AlertError;
use crate::BoxFuture;

/// Dead letters kept for inspection; the oldest is dropped beyond this.
pub const DEAD_LETTER_CAPACITY: usize = 1024;

#[derive(Debug)]
struct Pending {
    sequence: u64,
    message: AlertMessage,
    delivery_count: u32,
}

#[derive(Debug, Default)]
struct ChannelInner {
    next_sequence: u64,
    topics: BTreeMap<String, VecDeque<Pending>>,
    acknowledged: u64,
    dead_letters: VecDeque<AlertMessage>,
}

/// In-process alert channel. Messages stay queued until acknowledged.
#[derive(Debug, Default)]
pub struct MemoryAlertChannel {
    inner: Mutex<ChannelInner>,
}

impl MemoryAlertChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_len(&self, topic: &str) -> usize {
        self.lock().topics.get(topic).map_or(0, VecDeque::len)
    }

    /// Messages acknowledged as processed or dead-lettered.
    pub fn acknowledged(&self) -> u64 {
        self.lock().acknowledged
    }

    pub fn dead_letters(&self) -> Vec<AlertMessage> {
        self.lock().dead_letters.iter().cloned().collect()
    }

    /// Remove and return every retained dead letter.
    pub fn drain_dead_letters(&self) -> Vec<AlertMessage> {
        self.lock().dead_letters.drain(..).collect()
    }

    fn lock(&self) -> MutexGuard<'_, ChannelInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            warn!("memory alert channel mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

impl AlertChannel for MemoryAlertChannel {
    fn enqueue<'a>(&'a self, topic: &'a str, message: AlertMessage) -> BoxFuture<'a, Result<u64, AlertError>> {
        Box::pin(async move {
            let mut inner = self.lock();
            inner.next_sequence += 1;
            let sequence = inner.next_sequence;
            inner
                .topics
                .entry(topic.to_string())
                .or_default()
                .push_back(Pending {
                    sequence,
                    message,
                    delivery_count: 0,
                });
            Ok(sequence)
        })
    }

    fn poll<'a>(&'a self, topic: &'a str, max: usize) -> BoxFuture<'a, Result<Vec<Delivery>, AlertError>> {
        Box::pin(async move {
            let mut inner = self.lock();
            let Some(queue) = inner.topics.get_mut(topic) else {
                return Ok(Vec::new());
            };

            Ok(queue
                .iter_mut()
                .take(max)
                .map(|pending| {
                    pending.delivery_count = pending.delivery_count.saturating_add(1);
                    Delivery {
                        delivery_id: Uuid::new_v4(),
                        sequence: pending.sequence,
                        topic: topic.to_string(),
                        message: pending.message.clone(),
                        delivery_count: pending.delivery_count,
                    }
                })
                .collect())
        })
    }

    fn ack<'a>(&'a self, delivery: &'a Delivery, outcome: AckOutcome) -> BoxFuture<'a, Result<(), AlertError>> {
        Box::pin(async move {
            let mut inner = self.lock();
            let removed = inner.topics.get_mut(&delivery.topic).and_then(|queue| {
                let index = queue
                    .iter()
                    .position(|pending| pending.sequence == delivery.sequence)?;
                queue.remove(index)
            });

            if let Some(pending) = removed {
                inner.acknowledged += 1;
                if outcome == AckOutcome::DeadLettered {
                    if inner.dead_letters.len() == DEAD_LETTER_CAPACITY {
                        inner.dead_letters.pop_front();
                        warn!(topic = %delivery.topic, "dead letter buffer full, dropping the oldest");
                    }
                    inner.dead_letters.push_back(pending.message);
                }
            }
            Ok(())
        })
    }
}
