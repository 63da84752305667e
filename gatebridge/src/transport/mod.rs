//! Transport layer abstraction for the gateway connection.
//!
//! Defines the [`Transport`] trait the gateway client drives. Concrete
//! implementations:
//! - [`ws::WsTransport`]: WebSocket connection to the agent gateway
//! - [`loopback::LoopbackTransport`]: in-process channel pair for testing

pub mod loopback;
pub mod ws;

use std::future::Future;

/// Errors that can occur during transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The connection has been closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// The operation timed out before completing.
    #[error("transport operation timed out")]
    Timeout,

    /// The gateway address refused or could not be reached.
    #[error("gateway {0} is unreachable")]
    Unreachable(String),

    /// The WebSocket layer reported an error.
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// An underlying I/O error occurred.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A message-framed duplex connection carrying JSON text.
///
/// The gateway client issues `recv` from exactly one task (its read loop)
/// and may call `send` from many tasks at once; implementations serialize
/// concurrent writes so frames never interleave.
pub trait Transport: Send + Sync + 'static {
    /// Send one text message.
    ///
    /// Returns `Ok(())` once the message is handed to the underlying
    /// channel. This does not imply the peer processed it.
    fn send(&self, text: String) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Receive the next text message.
    ///
    /// Returns `Ok(None)` on orderly end of stream.
    fn recv(&self) -> impl Future<Output = Result<Option<String>, TransportError>> + Send;

    /// Close the connection. Calling this more than once is harmless.
    fn close(&self) -> impl Future<Output = ()> + Send;
}
