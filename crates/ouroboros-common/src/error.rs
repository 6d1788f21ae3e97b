//! Error types for ouroboros

use thiserror::Error;

/// Result type alias for ouroboros operations
pub type Result<T> = std::result::Result<T, DriverError>;

/// Unified error type for the ouroboros MongoDB client layer
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DriverError {
    /// The connection string could not be parsed
    #[error("Connection string error: {0}")]
    ConnString(String),

    /// A client option rejected its input
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Topology construction or lifecycle misuse
    #[error("Topology error: {0}")]
    Topology(String),

    #[error("Connection error: {0}")]
    Connection(String),

    /// No suitable server became available in time
    #[error("Server selection error: {0}")]
    ServerSelection(String),

    /// The server answered a command with `ok: 0`
    #[error("Command failed ({code}): {message}")]
    Command { code: i32, message: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// The operation context was cancelled
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// The operation context deadline expired
    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Connection pool closed")]
    PoolClosed,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DriverError {
    /// Returns true if the error came from the transport or the pool
    pub fn is_network_error(&self) -> bool {
        matches!(self, DriverError::Connection(_) | DriverError::PoolClosed)
    }

    /// Returns true if the error was caused by the operation context ending
    pub fn is_cancellation(&self) -> bool {
        matches!(self, DriverError::Cancelled(_) | DriverError::Timeout(_))
    }

    /// Server error code for command failures
    pub fn code(&self) -> Option<i32> {
        match self {
            DriverError::Command { code, .. } => Some(*code),
            _ => None,
        }
    }
}

#[cfg(feature = "bson-errors")]
impl From<bson::ser::Error> for DriverError {
    fn from(err: bson::ser::Error) -> Self {
        DriverError::Serialization(format!("BSON serialization error: {}", err))
    }
}

#[cfg(feature = "bson-errors")]
impl From<bson::de::Error> for DriverError {
    fn from(err: bson::de::Error) -> Self {
        DriverError::Deserialization(format!("BSON deserialization error: {}", err))
    }
}
