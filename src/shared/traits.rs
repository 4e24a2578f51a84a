//! Shared traits for consistent error construction across plugin kinds.

use crate::error::{Error, ErrorKind};

/// Builds errors tagged with the plugin kind they came from.
pub(crate) trait ServiceError {
    /// Get the service name for error context
    fn service_name() -> &'static str;

    fn error(kind: ErrorKind) -> Error {
        match Self::service_name() {
            "driver" => Error::DriverError(kind),
            "datarelay" => Error::DataRelayError(kind),
            _ => Error::DefaultError(kind),
        }
    }

    /// Input handed to the SDK was rejected
    fn validation_error(message: impl Into<String>) -> Error {
        Self::error(ErrorKind::ValidationError(message.into()))
    }

    fn config_error(message: impl Into<String>) -> Error {
        Self::error(ErrorKind::ConfigError(message.into()))
    }

    /// The platform rejected or garbled a request
    fn protocol_error(message: impl Into<String>) -> Error {
        Self::error(ErrorKind::ProtocolError(message.into()))
    }
}
