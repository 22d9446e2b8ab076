//! CLI argument definitions for ratekeep.
//!
//! # Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `resolve` | Resolve the current rate |
//! | `calculate` | Apply the rate to the sum of two numbers |
//! | `consume-alerts` | Run the retry-exhausted alert consumer |
//! | `alerts` | List messages in the alert outbox |
//! | `config` | Print the effective configuration |
//!
//! Flags override the matching `RATEKEEP_*` environment variables.
//!
//! # Examples
//!
//! ```bash
//! ratekeep resolve --pretty
//! ratekeep calculate 5 5
//! RATEKEEP_LOG=debug ratekeep resolve --mode refresh
//! ratekeep consume-alerts --once
//! ```

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use ratekeep_core::CacheMode;
use rust_decimal::Decimal;

/// Resilient rate resolution with caching, retries and failure alerts.
#[derive(Debug, Parser)]
#[command(name = "ratekeep", author, version, about)]
pub struct Cli {
    /// Pretty-print JSON output with indentation.
    #[arg(long, global = true, default_value_t = false)]
    pub pretty: bool,

    /// Log output format; overrides RATEKEEP_LOG_FORMAT.
    #[arg(long, global = true, value_enum)]
    pub log_format: Option<LogFormatArg>,

    /// DuckDB file for the cache and alert outbox; overrides RATEKEEP_DB_PATH.
    #[arg(long, global = true)]
    pub db_path: Option<PathBuf>,

    /// Remote rate endpoint; overrides RATEKEEP_REMOTE_URL.
    #[arg(long, global = true)]
    pub remote_url: Option<String>,

    /// Keep the cache and alert channel in memory instead of DuckDB.
    #[arg(long, global = true, default_value_t = false)]
    pub in_memory: bool,

    /// Fail instead of serving an expired cached rate.
    #[arg(long, global = true, default_value_t = false)]
    pub no_stale_fallback: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormatArg {
    Pretty,
    Json,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Resolve the current rate.
    Resolve(ResolveArgs),
    /// Compute (a + b) * (1 + rate), rounded to two decimals.
    Calculate(CalculateArgs),
    /// Consume retry-exhausted alerts until interrupted.
    ConsumeAlerts(ConsumeArgs),
    /// List messages in the alert outbox.
    Alerts(AlertsArgs),
    /// Print the effective configuration.
    Config,
}

#[derive(Debug, Args)]
pub struct ResolveArgs {
    /// How to use the cache.
    #[arg(long, value_enum, default_value_t = ModeArg::Use)]
    pub mode: ModeArg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ModeArg {
    /// Serve a live cached rate when present.
    Use,
    /// Always fetch and overwrite the cache.
    Refresh,
    /// Always fetch and leave the cache untouched.
    Bypass,
}

impl From<ModeArg> for CacheMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Use => Self::Use,
            ModeArg::Refresh => Self::Refresh,
            ModeArg::Bypass => Self::Bypass,
        }
    }
}

#[derive(Debug, Args)]
pub struct CalculateArgs {
    pub number1: Decimal,
    pub number2: Decimal,
}

#[derive(Debug, Args)]
pub struct ConsumeArgs {
    /// Drain pending alerts and exit instead of running until Ctrl-C.
    #[arg(long, default_value_t = false)]
    pub once: bool,
}

#[derive(Debug, Args)]
pub struct AlertsArgs {
    /// Include acknowledged and dead-lettered messages.
    #[arg(long, default_value_t = false)]
    pub all: bool,

    #[arg(long, default_value_t = 50)]
    pub limit: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_calculate_operands_as_decimals() {
        let cli = Cli::try_parse_from(["ratekeep", "calculate", "5.5", "4.5"]).expect("parse");
        match cli.command {
            Command::Calculate(args) => {
                assert_eq!(args.number1.to_string(), "5.5");
                assert_eq!(args.number2.to_string(), "4.5");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn global_flags_follow_subcommands() {
        let cli = Cli::try_parse_from(["ratekeep", "resolve", "--mode", "refresh", "--in-memory"]).expect("parse");
        assert!(cli.in_memory);
        assert!(matches!(cli.command, Command::Resolve(ResolveArgs { mode: ModeArg::Refresh })));
    }
}
