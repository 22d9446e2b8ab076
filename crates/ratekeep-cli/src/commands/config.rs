use ratekeep_core::RateKeepConfig;

use crate::error::CliError;

use super::CommandResult;

pub fn run(config: &RateKeepConfig) -> Result<CommandResult, CliError> {
    config.validate()?;

    let mut result = CommandResult::ok(serde_json::to_value(config)?);
    if config.remote.bearer_token.is_some() {
        result = result.with_warning("remote bearer token is set and omitted from output");
    }
    Ok(result)
}
