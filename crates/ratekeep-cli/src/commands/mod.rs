mod alerts;
mod calculate;
mod config;
mod consume_alerts;
mod resolve;

use std::time::Instant;

use ratekeep_core::RateKeepConfig;
use serde_json::Value;

use crate::cli::{Cli, Command};
use crate::error::CliError;
use crate::metadata::{Envelope, Metadata, RequestId};

pub struct CommandResult {
    pub data: Value,
    pub warnings: Vec<String>,
}

impl CommandResult {
    pub fn ok(data: Value) -> Self {
        Self {
            data,
            warnings: Vec::new(),
        }
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }
}

pub async fn run(cli: &Cli, config: RateKeepConfig) -> Result<Envelope, CliError> {
    let started = Instant::now();

    let (command, result) = match &cli.command {
        Command::Resolve(args) => ("resolve", resolve::run(args, config).await?),
        Command::Calculate(args) => ("calculate", calculate::run(args, config).await?),
        Command::ConsumeAlerts(args) => ("consume-alerts", consume_alerts::run(args, config).await?),
        Command::Alerts(args) => ("alerts", alerts::run(args, &config).await?),
        Command::Config => ("config", config::run(&config)?),
    };

    let CommandResult { data, warnings } = result;
    Ok(Envelope {
        meta: Metadata {
            request_id: RequestId::new_v4(),
            command,
            latency_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            warnings,
        },
        data,
    })
}
