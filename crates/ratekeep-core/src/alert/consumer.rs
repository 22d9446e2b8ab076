use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{AckOutcome, AlertChannel, Delivery, DEFAULT_TOPIC};
use crate::error::AlertError;
use crate::BoxFuture;

/// Processes one alert delivery. Must be idempotent: a message can arrive
/// more than once.
pub trait AlertHandler: Send + Sync {
    fn handle<'a>(&'a self, delivery: &'a Delivery) -> BoxFuture<'a, Result<(), AlertError>>;
}

/// Default handler: one structured error log per alert.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlertHandler;

impl AlertHandler for LogAlertHandler {
    fn handle<'a>(&'a self, delivery: &'a Delivery) -> BoxFuture<'a, Result<(), AlertError>> {
        Box::pin(async move {
            error!(
                topic = %delivery.topic,
                sequence = delivery.sequence,
                delivery_id = %delivery.delivery_id,
                delivery_count = delivery.delivery_count,
                source = %delivery.message.source,
                attempts = %delivery.message.attempts,
                "retry-exhausted alert: {}",
                delivery.message.error
            );
            Ok(())
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    pub topic: String,
    pub poll_interval: Duration,
    pub batch_size: usize,
    /// Handler attempts per delivery before it is dead-lettered.
    pub handler_attempts: u32,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            topic: DEFAULT_TOPIC.to_string(),
            poll_interval: Duration::from_millis(500),
            batch_size: 32,
            handler_attempts: 3,
        }
    }
}

/// Totals reported when a consumer stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerStats {
    pub processed: u64,
    pub dead_lettered: u64,
    pub poll_errors: u64,
}

/// Long-lived reader of the alert topic.
pub struct AlertConsumer {
    channel: Arc<dyn AlertChannel>,
    handler: Arc<dyn AlertHandler>,
    config: ConsumerConfig,
    stats: ConsumerStats,
}

impl AlertConsumer {
    pub fn new(channel: Arc<dyn AlertChannel>, handler: Arc<dyn AlertHandler>, config: ConsumerConfig) -> Self {
        Self {
            channel,
            handler,
            config,
            stats: ConsumerStats::default(),
        }
    }

    pub const fn stats(&self) -> ConsumerStats {
        self.stats
    }

    /// Run on its own task until `shutdown` flips to `true` or its sender drops.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<ConsumerStats> {
        tokio::spawn(self.run(shutdown))
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> ConsumerStats {
        info!(topic = %self.config.topic, "starting alert consumer");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let handled = match self.poll_once().await {
                Ok(handled) => handled,
                Err(error) => {
                    self.stats.poll_errors += 1;
                    warn!(topic = %self.config.topic, %error, "alert poll failed");
                    0
                }
            };

            if handled > 0 {
                continue;
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                () = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        info!(
            topic = %self.config.topic,
            processed = self.stats.processed,
            dead_lettered = self.stats.dead_lettered,
            "alert consumer stopped"
        );
        self.stats
    }

    /// Poll one batch and settle every delivery in it. Returns the number of
    /// deliveries handled.
    pub async fn poll_once(&mut self) -> Result<usize, AlertError> {
        let deliveries = self
            .channel
            .poll(&self.config.topic, self.config.batch_size.max(1))
            .await?;

        for delivery in &deliveries {
            let outcome = self.dispatch(delivery).await;
            self.channel.ack(delivery, outcome).await?;
            match outcome {
                AckOutcome::Processed => self.stats.processed += 1,
                AckOutcome::DeadLettered => self.stats.dead_lettered += 1,
            }
        }
        Ok(deliveries.len())
    }

    async fn dispatch(&self, delivery: &Delivery) -> AckOutcome {
        let attempts = self.config.handler_attempts.max(1);
        for attempt in 1..=attempts {
            match self.handler.handle(delivery).await {
                Ok(()) => {
                    debug!(sequence = delivery.sequence, attempt, "alert handled");
                    return AckOutcome::Processed;
                }
                Err(error) => {
                    warn!(sequence = delivery.sequence, attempt, attempts, %error, "alert handler failed");
                }
            }
        }

        error!(
            sequence = delivery.sequence,
            source = %delivery.message.source,
            "alert dead-lettered after {attempts} handler attempts"
        );
        AckOutcome::DeadLettered
    }
}
