use ratekeep_core::{AlertChannelKind, AlertMessage, RateKeepConfig};
use ratekeep_warehouse::{OutboxRecord, Warehouse};
use serde::Serialize;

use crate::cli::AlertsArgs;
use crate::error::CliError;

use super::CommandResult;

#[derive(Debug, Serialize)]
struct AlertsResponseData {
    topic: String,
    pending: u64,
    alerts: Vec<AlertRow>,
}

#[derive(Debug, Serialize)]
struct AlertRow {
    #[serde(flatten)]
    record: OutboxRecord,
    /// Decoded payload, absent when the stored body is not a valid alert message.
    message: Option<AlertMessage>,
}

pub async fn run(args: &AlertsArgs, config: &RateKeepConfig) -> Result<CommandResult, CliError> {
    if config.alert.channel != AlertChannelKind::Outbox {
        return Err(CliError::Command(String::from(
            "listing alerts requires RATEKEEP_ALERT_CHANNEL=outbox",
        )));
    }

    let warehouse_config = config.warehouse_config();
    let topic = config.alert.topic.clone();
    let include_acked = args.all;
    let limit = args.limit;

    let (pending, records) = tokio::task::spawn_blocking(move || {
        let warehouse = Warehouse::open(warehouse_config)?;
        let pending = warehouse.pending_alert_count(&topic)?;
        let records = warehouse.list_alerts(&topic, include_acked, limit)?;
        Ok::<_, CliError>((pending, records))
    })
    .await
    .map_err(|error| CliError::Command(format!("warehouse task failed: {error}")))??;

    let mut undecodable = 0_usize;
    let alerts = records
        .into_iter()
        .map(|record| {
            let message = AlertMessage::from_json(&record.payload).ok();
            if message.is_none() {
                undecodable += 1;
            }
            AlertRow { record, message }
        })
        .collect::<Vec<_>>();

    let data = serde_json::to_value(AlertsResponseData {
        topic: config.alert.topic.clone(),
        pending,
        alerts,
    })?;

    let mut result = CommandResult::ok(data);
    if undecodable > 0 {
        result = result.with_warning(format!("{undecodable} alert payload(s) could not be decoded"));
    }
    Ok(result)
}
