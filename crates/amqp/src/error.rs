//! Error types for AMQP operations.

use thiserror::Error;

/// Errors that can occur on the AMQP transport.
#[derive(Error, Debug)]
pub enum AmqpError {
    /// Malformed or truncated encoded data.
    #[error("Decode error: {message}")]
    Decode {
        /// What could not be decoded.
        message: String,
    },

    /// The peer violated the protocol.
    #[error("Protocol error: {message}")]
    Protocol {
        /// Error message.
        message: String,
    },

    /// Transport or handshake could not be established.
    #[error("Connection failed: {message}")]
    ConnectionFailed {
        /// Error message.
        message: String,
    },

    /// SASL negotiation failed.
    #[error("Authentication failed: {message}")]
    Sasl {
        /// Error message.
        message: String,
    },

    /// TLS configuration or handshake failed.
    #[error("TLS error: {message}")]
    Tls {
        /// Error message.
        message: String,
    },

    /// The connection was closed, locally or by the peer.
    #[error("Connection closed: {reason}")]
    Closed {
        /// Close reason.
        reason: String,
    },

    /// Frame exceeds the negotiated maximum size.
    #[error("Frame too large: {size} > {max}")]
    FrameTooLarge {
        /// Announced frame size.
        size: usize,
        /// Largest accepted size.
        max: usize,
    },

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(#[from] qdmetrics_config::ConfigError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AmqpError {
    /// Create a decode error.
    pub fn decode<S: Into<String>>(message: S) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// Create a protocol error.
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a connection failed error.
    pub fn connection_failed<S: Into<String>>(message: S) -> Self {
        Self::ConnectionFailed {
            message: message.into(),
        }
    }

    /// Create a SASL error.
    pub fn sasl<S: Into<String>>(message: S) -> Self {
        Self::Sasl {
            message: message.into(),
        }
    }

    /// Create a TLS error.
    pub fn tls<S: Into<String>>(message: S) -> Self {
        Self::Tls {
            message: message.into(),
        }
    }

    /// Create a closed error.
    pub fn closed<S: Into<String>>(reason: S) -> Self {
        Self::Closed {
            reason: reason.into(),
        }
    }
}

/// Result type for AMQP operations.
pub type AmqpResult<T> = std::result::Result<T, AmqpError>;
