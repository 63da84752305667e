//! Agent gateway protocol client.
//!
//! Turns one shared duplex connection into independent request/response
//! exchanges (correlated by request id), a named-event subscription table,
//! and per-run streams of assistant text.
//!
//! # Submodules
//!
//! - [`client`]: connection lifecycle, handshake, correlation, dispatch
//! - [`run`]: the per-run fragment stream and error slot

pub mod client;
pub mod run;

use std::time::Duration;

use gatebridge_proto::codec::CodecError;

use crate::transport::TransportError;

pub use client::GatewayClient;
pub use run::{AgentRun, RunFeed, RunStream};

/// Errors surfaced by the gateway client.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Connecting, sending or receiving on the socket failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The gateway did not send `connect.challenge` in time.
    #[error("timed out waiting for gateway handshake")]
    HandshakeTimeout,

    /// The gateway refused the `connect` request.
    #[error("authentication rejected: {message}")]
    AuthRejected {
        /// Reason given by the gateway.
        message: String,
    },

    /// No correlated response arrived within the request timeout.
    #[error("request `{method}` timed out")]
    RequestTimeout {
        /// Method of the request that timed out.
        method: String,
    },

    /// The gateway refused to start an agent turn.
    #[error("agent request failed: {message}")]
    InvokeFailed {
        /// Reason given by the gateway.
        message: String,
    },

    /// A payload could not be encoded or parsed.
    #[error("malformed gateway payload: {0}")]
    Decode(#[from] CodecError),

    /// The backend reported that the run failed part way through.
    #[error("agent run failed: {message}")]
    RunFailed {
        /// Reason given by the backend.
        message: String,
    },

    /// A request with the same id is still waiting for its response.
    #[error("request id `{0}` is already in flight")]
    DuplicateRequest(String),

    /// The client is closed or its read loop has stopped.
    #[error("not connected to gateway")]
    NotConnected,

    /// The connection dropped while the operation was waiting.
    #[error("gateway connection lost")]
    ConnectionLost,

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,
}

/// How the client identifies itself during `connect`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    /// Client identifier.
    pub id: String,
    /// Client version.
    pub version: String,
    /// Host platform.
    pub platform: String,
    /// Client mode.
    pub mode: String,
}

impl Default for ClientIdentity {
    fn default() -> Self {
        Self {
            id: "gateway-client".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            platform: std::env::consts::OS.to_string(),
            mode: "backend".to_string(),
        }
    }
}

/// Gateway connection settings.
#[derive(Clone)]
pub struct GatewayConfig {
    /// WebSocket URL of the gateway.
    pub url: String,
    /// Bearer token sent in `connect`.
    pub token: String,
    /// Agent every turn is addressed to.
    pub agent_id: String,
    /// Identity reported in `connect`.
    pub client: ClientIdentity,
    /// Requested role.
    pub role: String,
    /// Requested scopes.
    pub scopes: Vec<String>,
    /// Locale reported in `connect`.
    pub locale: String,
    /// User agent reported in `connect`.
    pub user_agent: String,
    /// Bound on the WebSocket dial.
    pub connect_timeout: Duration,
    /// Bound on waiting for `connect.challenge`.
    pub handshake_timeout: Duration,
    /// Bound on waiting for any correlated response.
    pub request_timeout: Duration,
    /// Capacity of each run's fragment queue.
    pub fragment_capacity: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:18789".to_string(),
            token: String::new(),
            agent_id: "main".to_string(),
            client: ClientIdentity::default(),
            role: "operator".to_string(),
            scopes: vec!["operator.read".to_string(), "operator.write".to_string()],
            locale: "en-US".to_string(),
            user_agent: concat!("gatebridge/", env!("CARGO_PKG_VERSION")).to_string(),
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            fragment_capacity: 100,
        }
    }
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("url", &self.url)
            .field("token", &mask_secret(&self.token))
            .field("agent_id", &self.agent_id)
            .field("client", &self.client)
            .field("role", &self.role)
            .field("scopes", &self.scopes)
            .field("locale", &self.locale)
            .field("user_agent", &self.user_agent)
            .field("connect_timeout", &self.connect_timeout)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("request_timeout", &self.request_timeout)
            .field("fragment_capacity", &self.fragment_capacity)
            .finish()
    }
}

/// Keep the first four characters of a secret for log correlation.
#[must_use]
pub fn mask_secret(secret: &str) -> String {
    if secret.chars().count() <= 4 {
        return "****".to_string();
    }
    let head: String = secret.chars().take(4).collect();
    format!("{head}****")
}
