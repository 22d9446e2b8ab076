use ratekeep_core::{RateKeepConfig, RateService};

use crate::cli::CalculateArgs;
use crate::error::CliError;

use super::CommandResult;

pub async fn run(args: &CalculateArgs, config: RateKeepConfig) -> Result<CommandResult, CliError> {
    let service = RateService::from_config(config)?;

    let outcome = service.calculator.calculate(args.number1, args.number2).await;
    service.publisher.flush().await;

    let data = serde_json::to_value(outcome?)?;
    Ok(CommandResult::ok(data))
}
