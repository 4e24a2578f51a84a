use thiserror::Error;
use tonic::Status;

/// The main Result type used throughout the SDK
pub type Result<T> = std::result::Result<T, Error>;

/// Error type user callbacks return. Whatever they return is rendered into the
/// failure response of the request being handled.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug, Clone)]
pub enum ErrorKind {
    /// User-defined callback errors
    #[error("User Defined error: {0}")]
    UserDefinedError(String),

    /// Internal SDK errors
    #[error("Internal error: {0}")]
    InternalError(String),

    /// Invalid or missing configuration
    #[error("Config error: {0}")]
    ConfigError(String),

    /// Dialing or transport failures towards the platform
    #[error("Network error: {0}")]
    NetworkError(String),

    /// The platform answered with something we could not make sense of
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Input handed to the SDK was rejected
    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Timeout error: {0}")]
    TimeoutError(String),
}

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Driver - {0}")]
    DriverError(ErrorKind),

    #[error("DataRelay - {0}")]
    DataRelayError(ErrorKind),

    #[error("Connection - {0}")]
    ConnectionError(ErrorKind),

    #[error("Health - {0}")]
    HealthError(ErrorKind),

    #[error("Publish - {0}")]
    PublishError(ErrorKind),

    #[error("SDK - {0}")]
    DefaultError(ErrorKind),

    #[error("gRPC Status - {0}")]
    GrpcStatus(Status),
}

impl Error {
    /// Extract the gRPC Status if this error is a GrpcStatus variant,
    /// otherwise create a Status::internal with the error message
    pub fn into_status(self) -> Status {
        match self {
            Error::GrpcStatus(status) => status,
            other => Status::internal(other.to_string()),
        }
    }

    /// The [`ErrorKind`] carried by this error, if any.
    pub fn kind(&self) -> Option<&ErrorKind> {
        match self {
            Error::DriverError(kind)
            | Error::DataRelayError(kind)
            | Error::ConnectionError(kind)
            | Error::HealthError(kind)
            | Error::PublishError(kind)
            | Error::DefaultError(kind) => Some(kind),
            Error::GrpcStatus(_) => None,
        }
    }
}

impl From<Status> for Error {
    fn from(status: Status) -> Self {
        Error::GrpcStatus(status)
    }
}
