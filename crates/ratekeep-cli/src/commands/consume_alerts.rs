use std::sync::Arc;

use ratekeep_core::{AlertConsumer, LogAlertHandler, RateKeepConfig, RateService};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::cli::ConsumeArgs;
use crate::error::CliError;

use super::CommandResult;

pub async fn run(args: &ConsumeArgs, config: RateKeepConfig) -> Result<CommandResult, CliError> {
    let service = RateService::from_config(config)?;
    let topic = service.config().alert.topic.clone();
    let mut consumer = service.consumer(Arc::new(LogAlertHandler));

    let stats = if args.once {
        drain(&mut consumer).await?;
        consumer.stats()
    } else {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = consumer.spawn(shutdown_rx);
        info!(topic = %topic, "alert consumer running, press Ctrl-C to stop");

        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!(error = %error, "failed to listen for Ctrl-C, stopping consumer");
        }
        let _ = shutdown_tx.send(true);
        task.await.map_err(|error| CliError::Command(format!("alert consumer task failed: {error}")))?
    };

    let data = serde_json::json!({
        "topic": topic,
        "stats": stats,
    });
    Ok(CommandResult::ok(data))
}

async fn drain(consumer: &mut AlertConsumer) -> Result<(), CliError> {
    while consumer.poll_once().await? > 0 {}
    Ok(())
}
