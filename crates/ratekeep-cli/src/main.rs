mod cli;
mod commands;
mod error;
mod metadata;

use std::io::Write;
use std::process::ExitCode;

use clap::Parser;
use ratekeep_core::{AlertChannelKind, CacheBackendKind, LogFormat, RateKeepConfig};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, LogFormatArg};
use crate::error::CliError;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(error) => {
            eprintln!("error: {error}");
            ExitCode::from(error.exit_code())
        }
    }
}

async fn run() -> Result<ExitCode, CliError> {
    let cli = Cli::parse();

    let mut config = RateKeepConfig::from_env()?;
    apply_overrides(&cli, &mut config);
    init_tracing(&config);

    let envelope = commands::run(&cli, config).await?;
    write_output(&mut std::io::stdout().lock(), &envelope.render(cli.pretty)?)?;

    Ok(ExitCode::SUCCESS)
}

fn write_output(out: &mut impl Write, rendered: &str) -> Result<(), CliError> {
    writeln!(out, "{rendered}")?;
    out.flush()?;
    Ok(())
}

fn apply_overrides(cli: &Cli, config: &mut RateKeepConfig) {
    if let Some(path) = &cli.db_path {
        config.db_path = Some(path.clone());
    }
    if let Some(url) = &cli.remote_url {
        config.remote.url.clone_from(url);
    }
    if cli.in_memory {
        config.cache.backend = CacheBackendKind::Memory;
        config.alert.channel = AlertChannelKind::Memory;
    }
    if cli.no_stale_fallback {
        config.cache.stale_fallback = false;
    }
    if let Some(format) = cli.log_format {
        config.log.format = match format {
            LogFormatArg::Pretty => LogFormat::Pretty,
            LogFormatArg::Json => LogFormat::Json,
        };
    }
}

/// Logs go to stderr so stdout stays a single JSON document.
fn init_tracing(config: &RateKeepConfig) {
    let filter = EnvFilter::try_new(&config.log.filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    match config.log.format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
    }
}
