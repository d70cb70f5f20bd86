//! AMQP transport: connection lifecycle, claims-based-security
//! authentication, and the session/link multiplexer, all driven by an
//! engine abstraction that keeps the protocol stack behind a seam.

pub mod cbs;
pub mod connection;
pub mod engine;
pub mod multiplexer;

pub use connection::AmqpConnection;
pub use engine::{AmqpEngine, EngineEvent, EngineHandle, EngineMessage, LinkDescriptor};
pub use multiplexer::{ChannelCategory, Multiplexer};
