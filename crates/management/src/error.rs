//! Error types for management operations.

use qdmetrics_amqp::AmqpError;
use thiserror::Error;

/// Schema lookup failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    /// No schema has been fetched on the current connection.
    #[error("schema not loaded")]
    NotLoaded,

    /// The entity is absent from the schema, or was deprecated.
    #[error("unknown entity type: {entity}")]
    UnknownEntity {
        /// Short entity name that was requested.
        entity: String,
    },

    /// The entity has no such attribute, or it was deprecated.
    #[error("unknown attribute {attribute} of entity type {entity}")]
    UnknownAttribute {
        /// Short entity name that was requested.
        entity: String,
        /// Attribute that is not in the schema.
        attribute: String,
    },

    /// The GET-SCHEMA reply did not have the expected shape.
    #[error("malformed schema: {message}")]
    Malformed {
        /// What is wrong.
        message: String,
    },
}

/// Errors that can occur while talking to a management node.
#[derive(Error, Debug)]
pub enum ManagementError {
    /// The transport or link setup failed.
    #[error("Connection failed: {message}")]
    Connection {
        /// Error message.
        message: String,
    },

    /// An operation did not complete in time.
    #[error("Timeout: {operation} after {after_ms}ms")]
    Timeout {
        /// Operation that timed out.
        operation: String,
        /// Elapsed limit.
        after_ms: u64,
    },

    /// A request was issued while the session is not connected.
    #[error("not connected")]
    NotConnected,

    /// The connection dropped while a request was pending.
    #[error("Disconnected: {reason}")]
    Disconnected {
        /// Why the connection was lost.
        reason: String,
    },

    /// The reply did not have the expected shape.
    #[error("Protocol error: {message}")]
    Protocol {
        /// Error message.
        message: String,
    },

    /// Entity type resolution failed.
    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    /// The management node answered with a non-success status.
    #[error("Remote error {status_code}: {description}")]
    Remote {
        /// Management status code.
        status_code: u16,
        /// Status description sent by the node.
        description: String,
    },

    /// AMQP transport error.
    #[error("AMQP error: {0}")]
    Amqp(#[from] AmqpError),
}

impl ManagementError {
    /// Create a connection error.
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a protocol error.
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a disconnected error.
    pub fn disconnected<S: Into<String>>(reason: S) -> Self {
        Self::Disconnected {
            reason: reason.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout<S: Into<String>>(operation: S, after: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after_ms: after.as_millis() as u64,
        }
    }

    /// True for errors caused by the connection rather than the request.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::NotConnected | Self::Disconnected { .. } | Self::Amqp(_)
        )
    }
}

/// Result type for management operations.
pub type ManagementResult<T> = std::result::Result<T, ManagementError>;
