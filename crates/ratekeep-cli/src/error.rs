use thiserror::Error;

/// CLI-level error categories mapped to exit codes.
#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Config(#[from] ratekeep_core::ConfigError),

    #[error(transparent)]
    Service(#[from] ratekeep_core::ServiceError),

    #[error(transparent)]
    Rate(#[from] ratekeep_core::RateError),

    #[error(transparent)]
    Alert(#[from] ratekeep_core::AlertError),

    #[error(transparent)]
    Warehouse(#[from] ratekeep_warehouse::WarehouseError),

    #[error("command error: {0}")]
    Command(String),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CliError {
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) | Self::Command(_) | Self::Rate(ratekeep_core::RateError::Invalid(_)) => 2,
            Self::Rate(_) => 3,
            Self::Serialization(_) => 4,
            Self::Service(_) | Self::Warehouse(_) => 6,
            Self::Alert(_) => 7,
            Self::Io(_) => 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ratekeep_core::RateError;

    #[test]
    fn unavailability_has_its_own_exit_code() {
        let error = CliError::from(RateError::RemoteUnavailable {
            source_id: String::from("rate-api"),
            attempts: 3,
            message: String::from("timeout"),
        });
        assert_eq!(error.exit_code(), 3);
        assert_eq!(CliError::Command(String::from("x")).exit_code(), 2);
    }

    #[test]
    fn overflowing_input_is_a_usage_error() {
        let error = CliError::from(RateError::from(ratekeep_core::ValidationError::Overflow {
            operation: "number1 + number2",
        }));
        assert_eq!(error.exit_code(), 2);
    }
}
