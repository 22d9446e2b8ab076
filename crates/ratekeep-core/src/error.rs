//! Error types and retry classification.
//!
//! [`RateError`] is the single taxonomy threaded through the resolution
//! pipeline. Components inspect it with [`RateError::retry_class`] rather than
//! by matching on message text.

use thiserror::Error;

/// How the retry loop must react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// Transient failure: spend another attempt after backoff.
    Retry,
    /// Terminal failure: stop immediately, remaining attempts are not consumed.
    Never,
    /// The breaker rejected the call: fail fast without consuming attempts.
    CircuitOpen,
}

/// Errors produced while resolving a rate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RateError {
    /// Network failure, timeout, or a retryable upstream status.
    #[error("transient remote error: {message}")]
    TransientRemote { message: String },

    /// Malformed payload or a non-retryable upstream status.
    #[error("terminal remote error: {message}")]
    TerminalRemote { message: String },

    /// The cache backend failed or timed out. Always recovered locally.
    #[error("cache unavailable: {message}")]
    CacheUnavailable { message: String },

    /// The circuit breaker rejected the call without touching the network.
    #[error("circuit open for source '{source_id}'")]
    CircuitOpen { source_id: String },

    /// The remote source could not supply a value and no fallback applied.
    #[error("remote source '{source_id}' unavailable after {attempts} attempt(s): {message}")]
    RemoteUnavailable {
        source_id: String,
        attempts: u32,
        message: String,
    },

    /// Caller input that cannot be processed with the resolved rate.
    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

impl RateError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::TransientRemote {
            message: message.into(),
        }
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        Self::TerminalRemote {
            message: message.into(),
        }
    }

    pub fn cache_unavailable(message: impl Into<String>) -> Self {
        Self::CacheUnavailable {
            message: message.into(),
        }
    }

    pub fn circuit_open(source_id: impl Into<String>) -> Self {
        Self::CircuitOpen {
            source_id: source_id.into(),
        }
    }

    pub fn retry_class(&self) -> RetryClass {
        match self {
            Self::TransientRemote { .. } => RetryClass::Retry,
            Self::CircuitOpen { .. } => RetryClass::CircuitOpen,
            Self::TerminalRemote { .. }
            | Self::CacheUnavailable { .. }
            | Self::RemoteUnavailable { .. }
            | Self::Invalid(_) => RetryClass::Never,
        }
    }

    pub const fn code(&self) -> &'static str {
        match self {
            Self::TransientRemote { .. } => "remote.transient",
            Self::TerminalRemote { .. } => "remote.terminal",
            Self::CacheUnavailable { .. } => "cache.unavailable",
            Self::CircuitOpen { .. } => "circuit.open",
            Self::RemoteUnavailable { .. } => "remote.unavailable",
            Self::Invalid(_) => "input.invalid",
        }
    }
}

/// Rejected rate values.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("rate must be non-negative: '{value}'")]
    NegativeRate { value: String },

    #[error("rate is not a valid decimal: '{value}'")]
    InvalidDecimal { value: String },

    #[error("float rate must be finite")]
    NonFiniteRate,

    #[error("{operation} overflows the decimal range")]
    Overflow { operation: &'static str },
}

/// Failures on the alert channel.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AlertError {
    #[error("alert channel unavailable: {0}")]
    ChannelUnavailable(String),

    #[error("alert payload could not be encoded or decoded: {0}")]
    Codec(String),

    #[error("alert handler failed: {0}")]
    Handler(String),
}

/// Invalid configuration values.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid {key}: '{value}' ({reason})")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    pub fn invalid(key: &str, value: &str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}
