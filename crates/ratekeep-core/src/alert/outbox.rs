use ratekeep_warehouse::{OutboxRecord, Warehouse, WarehouseError};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{AckOutcome, AlertChannel, AlertMessage, Delivery};
use crate::error::AlertError;
use crate::{now_unix_ms, BoxFuture};

/// Durable alert channel backed by the warehouse `alert_outbox` table.
///
/// Messages survive restarts and are redelivered until acknowledged.
/// Payloads that no longer decode are dead-lettered at poll time.
#[derive(Clone)]
pub struct OutboxAlertChannel {
    warehouse: Warehouse,
}

impl OutboxAlertChannel {
    pub fn new(warehouse: Warehouse) -> Self {
        Self { warehouse }
    }

    pub fn warehouse(&self) -> &Warehouse {
        &self.warehouse
    }

    async fn blocking<T, F>(&self, operation: F) -> Result<T, AlertError>
    where
        T: Send + 'static,
        F: FnOnce(&Warehouse) -> Result<T, WarehouseError> + Send + 'static,
    {
        let warehouse = self.warehouse.clone();
        tokio::task::spawn_blocking(move || operation(&warehouse))
            .await
            .map_err(|error| AlertError::ChannelUnavailable(format!("outbox task failed: {error}")))?
            .map_err(|error| AlertError::ChannelUnavailable(error.to_string()))
    }
}

impl AlertChannel for OutboxAlertChannel {
    fn enqueue<'a>(&'a self, topic: &'a str, message: AlertMessage) -> BoxFuture<'a, Result<u64, AlertError>> {
        Box::pin(async move {
            let payload = message.to_json()?;
            let topic = topic.to_string();
            let seq = self
                .blocking(move |warehouse| warehouse.enqueue_alert(&topic, &payload, now_unix_ms()))
                .await?;
            sequence_of(seq)
        })
    }

    fn poll<'a>(&'a self, topic: &'a str, max: usize) -> BoxFuture<'a, Result<Vec<Delivery>, AlertError>> {
        Box::pin(async move {
            let owned_topic = topic.to_string();
            let records = self
                .blocking(move |warehouse| warehouse.lease_pending_alerts(&owned_topic, max))
                .await?;

            let mut deliveries = Vec::with_capacity(records.len());
            for record in records {
                match decode(&record) {
                    Ok(delivery) => deliveries.push(delivery),
                    Err(error) => {
                        warn!(topic, seq = record.seq, %error, "undecodable outbox payload, dead-lettering");
                        let seq = record.seq;
                        self.blocking(move |warehouse| warehouse.ack_alert(seq, now_unix_ms(), true))
                            .await?;
                    }
                }
            }
            Ok(deliveries)
        })
    }

    fn ack<'a>(&'a self, delivery: &'a Delivery, outcome: AckOutcome) -> BoxFuture<'a, Result<(), AlertError>> {
        Box::pin(async move {
            let seq = i64::try_from(delivery.sequence)
                .map_err(|_| AlertError::ChannelUnavailable(format!("sequence {} out of range", delivery.sequence)))?;
            let dead_lettered = outcome == AckOutcome::DeadLettered;
            let updated = self
                .blocking(move |warehouse| warehouse.ack_alert(seq, now_unix_ms(), dead_lettered))
                .await?;
            if !updated {
                debug!(seq, "outbox message was already acknowledged");
            }
            Ok(())
        })
    }
}

fn decode(record: &OutboxRecord) -> Result<Delivery, AlertError> {
    Ok(Delivery {
        delivery_id: Uuid::new_v4(),
        sequence: sequence_of(record.seq)?,
        topic: record.topic.clone(),
        message: AlertMessage::from_json(&record.payload)?,
        delivery_count: u32::try_from(record.delivery_count).unwrap_or(0),
    })
}

fn sequence_of(seq: i64) -> Result<u64, AlertError> {
    u64::try_from(seq).map_err(|_| AlertError::Codec(format!("negative outbox sequence {seq}")))
}
