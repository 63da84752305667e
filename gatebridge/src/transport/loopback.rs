//! Loopback transport for testing.
//!
//! Uses in-process [`tokio::sync::mpsc`] channels to stand in for a gateway
//! socket. Created via [`LoopbackTransport::create_pair`], which returns two
//! connected endpoints: text sent on one is received by the other. Tests
//! hand one end to the gateway client and script the gateway on the other.

use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use super::{Transport, TransportError};

/// In-process transport backed by `tokio::sync::mpsc` channels.
pub struct LoopbackTransport {
    /// Outgoing messages (delivers to the peer's receiver). Taken on close so
    /// the peer observes end of stream.
    tx: parking_lot::Mutex<Option<mpsc::Sender<String>>>,
    /// Incoming messages fed by the peer.
    rx: Mutex<mpsc::Receiver<String>>,
    /// Fires when this end is closed, unblocking a pending `recv`.
    closed: CancellationToken,
}

impl LoopbackTransport {
    /// Create a pair of connected loopback transports.
    ///
    /// The `buffer` parameter controls the channel capacity for each direction.
    #[must_use]
    pub fn create_pair(buffer: usize) -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::channel(buffer);
        let (tx_b, rx_b) = mpsc::channel(buffer);

        let a = Self {
            tx: parking_lot::Mutex::new(Some(tx_b)),
            rx: Mutex::new(rx_a),
            closed: CancellationToken::new(),
        };
        let b = Self {
            tx: parking_lot::Mutex::new(Some(tx_a)),
            rx: Mutex::new(rx_b),
            closed: CancellationToken::new(),
        };
        (a, b)
    }

    /// Whether [`Transport::close`] has been called on this end.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl Transport for LoopbackTransport {
    async fn send(&self, text: String) -> Result<(), TransportError> {
        let tx = self
            .tx
            .lock()
            .clone()
            .ok_or(TransportError::ConnectionClosed)?;
        tx.send(text)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn recv(&self) -> Result<Option<String>, TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::ConnectionClosed);
        }
        let mut rx = self.rx.lock().await;
        tokio::select! {
            () = self.closed.cancelled() => Err(TransportError::ConnectionClosed),
            msg = rx.recv() => Ok(msg),
        }
    }

    async fn close(&self) {
        self.tx.lock().take();
        self.closed.cancel();
    }
}
