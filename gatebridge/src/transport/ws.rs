//! WebSocket transport to the agent gateway.
//!
//! The socket is split once at connect time: the write half sits behind an
//! async mutex so concurrent requests are written one frame at a time, and
//! the read half is consumed only by the gateway client's read loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use super::{Transport, TransportError};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Type alias for the write half of a WebSocket connection.
type WsSender = SplitSink<WsStream, Message>;

/// Type alias for the read half of a WebSocket connection.
type WsReader = SplitStream<WsStream>;

/// WebSocket connection implementing [`Transport`].
pub struct WsTransport {
    url: String,
    sender: Mutex<WsSender>,
    reader: Mutex<WsReader>,
    closed: AtomicBool,
}

impl WsTransport {
    /// Dial `url` and wait at most `timeout` for the WebSocket upgrade.
    ///
    /// # Errors
    ///
    /// - [`TransportError::Timeout`] if the upgrade does not finish in time.
    /// - [`TransportError::Unreachable`] if the address refuses the connection.
    /// - [`TransportError::WebSocket`] / [`TransportError::Io`] otherwise.
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self, TransportError> {
        let (stream, _response) = tokio::time::timeout(timeout, connect_async(url))
            .await
            .map_err(|_| {
                tracing::warn!(url, "gateway WebSocket connect timed out");
                TransportError::Timeout
            })?
            .map_err(|e| {
                tracing::warn!(url, err = %e, "gateway WebSocket connect failed");
                map_ws_connect_error(url, e)
            })?;

        tracing::debug!(url, "gateway WebSocket established");
        let (sender, reader) = stream.split();
        Ok(Self {
            url: url.to_string(),
            sender: Mutex::new(sender),
            reader: Mutex::new(reader),
            closed: AtomicBool::new(false),
        })
    }

    /// Return the gateway URL this transport is connected to.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Transport for WsTransport {
    async fn send(&self, text: String) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::ConnectionClosed);
        }
        let mut sender = self.sender.lock().await;
        sender.send(Message::Text(text.into())).await.map_err(|e| {
            tracing::warn!(err = %e, "gateway send failed");
            TransportError::WebSocket(e.to_string())
        })
    }

    async fn recv(&self) -> Result<Option<String>, TransportError> {
        let mut reader = self.reader.lock().await;
        loop {
            let Some(msg) = reader.next().await else {
                return Ok(None);
            };
            match msg {
                Ok(Message::Text(text)) => return Ok(Some(text.as_str().to_owned())),
                Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                    Ok(text) => return Ok(Some(text)),
                    Err(_) => tracing::debug!("dropping non UTF-8 binary frame"),
                },
                Ok(Message::Close(_)) => {
                    tracing::info!(url = %self.url, "gateway closed the WebSocket");
                    return Ok(None);
                }
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
                Err(e) => return Err(TransportError::WebSocket(e.to_string())),
            }
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut sender = self.sender.lock().await;
        if let Err(e) = sender.close().await {
            tracing::debug!(err = %e, "error while closing gateway WebSocket");
        }
    }
}

/// Map a `tokio_tungstenite` connection error to a [`TransportError`].
fn map_ws_connect_error(url: &str, err: tokio_tungstenite::tungstenite::Error) -> TransportError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Io(io_err) => {
            if io_err.kind() == std::io::ErrorKind::ConnectionRefused
                || io_err.kind() == std::io::ErrorKind::AddrNotAvailable
            {
                TransportError::Unreachable(url.to_string())
            } else {
                TransportError::Io(io_err)
            }
        }
        WsError::Http(response) => {
            TransportError::WebSocket(format!("gateway HTTP error: status {}", response.status()))
        }
        other => TransportError::WebSocket(other.to_string()),
    }
}
