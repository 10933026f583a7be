//! Error types for event-redis.

use thiserror::Error;

/// event-redis error type.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Malformed endpoint or bridge configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Transient link failure (refused, dropped, timed out)
    #[error("Connection error: {0}")]
    Connection(String),

    /// Input that parsed as JSON but is not an event record
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    /// Event could not be serialized to JSON
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The store rejected a push
    #[error("Acknowledgement error: {0}")]
    Acknowledgement(String),

    /// Redis connection or command error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// The connection manager has been closed
    #[error("Connection manager is closed")]
    Closed,
}

impl BridgeError {
    /// Whether this error means the link itself is gone, as opposed to the
    /// store refusing one command on a healthy link.
    pub fn is_link_failure(&self) -> bool {
        match self {
            BridgeError::Connection(_) | BridgeError::Closed => true,
            BridgeError::Redis(e) => {
                e.is_io_error()
                    || e.is_connection_dropped()
                    || e.is_connection_refusal()
                    || e.is_timeout()
            }
            _ => false,
        }
    }
}

/// Result type for event-redis operations.
pub type BridgeResult<T> = Result<T, BridgeError>;
