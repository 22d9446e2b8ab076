use ratekeep_core::{CacheMode, CircuitSnapshot, RateKeepConfig, RateService, RateValue};
use serde::Serialize;

use crate::cli::ResolveArgs;
use crate::error::CliError;

use super::CommandResult;

#[derive(Debug, Serialize)]
struct ResolveResponseData<'a> {
    source_id: &'a str,
    cache_key: &'a str,
    mode: &'static str,
    rate: RateValue,
    circuit: CircuitSnapshot,
}

pub async fn run(args: &ResolveArgs, config: RateKeepConfig) -> Result<CommandResult, CliError> {
    let service = RateService::from_config(config)?;
    let mode = CacheMode::from(args.mode);

    let outcome = service.resolver.resolve_with(mode).await;
    // Let a retry-exhausted alert reach its channel before the process exits.
    service.publisher.flush().await;
    let rate = outcome?;

    let data = serde_json::to_value(ResolveResponseData {
        source_id: service.resolver.source_id(),
        cache_key: service.resolver.cache_key(),
        mode: mode_name(mode),
        rate,
        circuit: service.resolver.breaker_snapshot(),
    })?;
    Ok(CommandResult::ok(data))
}

fn mode_name(mode: CacheMode) -> &'static str {
    match mode {
        CacheMode::Use => "use",
        CacheMode::Refresh => "refresh",
        CacheMode::Bypass => "bypass",
    }
}
