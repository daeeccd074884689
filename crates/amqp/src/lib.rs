//! # qdmetrics AMQP
//!
//! The subset of AMQP 1.0 a management client needs: the type system, frame
//! and performative codecs, message sections, SASL, TLS and a connection
//! driver owning one session with a receiver and a sender link.

pub mod codec;
pub mod connection;
pub mod error;
pub mod frame;
pub mod message;
pub mod performative;
pub mod sasl;
pub mod tls;
pub mod types;

pub use connection::{
    establish, BoxedTransport, CommandSender, ConnectionCommand, ConnectionEvent,
    ConnectionHandle, Connector, PeerEnd, RemoteOpen, TcpConnector, Transport,
};
pub use error::{AmqpError, AmqpResult};
pub use frame::{Frame, FrameCodec, FrameType, ProtocolId, Wire};
pub use message::{Message, Properties};
pub use types::Value;

/// Frame size limit used until the peer's open frame is seen.
pub const DEFAULT_MAX_FRAME_SIZE: u32 = qdmetrics_config::DEFAULT_MAX_FRAME_SIZE;
