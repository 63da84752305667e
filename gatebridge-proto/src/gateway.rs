//! Method parameters and event payloads of the agent gateway protocol.
//!
//! Field names follow the gateway's camelCase JSON.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The single protocol version this client speaks.
pub const PROTOCOL_VERSION: u32 = 3;

/// Event the gateway emits once a socket is ready for the `connect` request.
pub const CHALLENGE_EVENT: &str = "connect.challenge";

/// Event name carrying streamed agent output for every run.
pub const AGENT_EVENT: &str = "agent";

/// Authentication method.
pub const METHOD_CONNECT: &str = "connect";

/// Agent invocation method.
pub const METHOD_AGENT: &str = "agent";

// ---------------------------------------------------------------------------
// connect
// ---------------------------------------------------------------------------

/// Parameters of the `connect` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    /// Lowest protocol version accepted.
    pub min_protocol: u32,
    /// Highest protocol version accepted.
    pub max_protocol: u32,
    /// Who is connecting.
    pub client: ClientInfo,
    /// Requested role (e.g. `operator`).
    pub role: String,
    /// Requested capability scopes.
    pub scopes: Vec<String>,
    /// Credentials.
    pub auth: AuthInfo,
    /// Preferred locale, e.g. `en-US`.
    pub locale: String,
    /// Free-form user agent string.
    pub user_agent: String,
}

/// Client identity sent during `connect`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    /// Client identifier.
    pub id: String,
    /// Client version.
    pub version: String,
    /// Host operating system.
    pub platform: String,
    /// Client mode (e.g. `backend`).
    pub mode: String,
}

/// Bearer token credentials.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthInfo {
    /// Gateway token.
    pub token: String,
}

impl std::fmt::Debug for AuthInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthInfo").field("token", &"****").finish()
    }
}

// ---------------------------------------------------------------------------
// agent
// ---------------------------------------------------------------------------

/// Parameters of the `agent` request that starts one turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentParams {
    /// User text for this turn.
    pub message: String,
    /// Target agent.
    pub agent_id: String,
    /// Conversation the turn belongs to.
    pub session_key: String,
    /// When true the gateway would deliver replies itself; the bridge always
    /// sends `false` and delivers on its own.
    pub deliver: bool,
    /// Unique per call so the gateway can drop replays.
    pub idempotency_key: String,
}

/// Payload of a successful `agent` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentAccepted {
    /// Backend-assigned run identifier.
    pub run_id: String,
}

/// Payload of an `agent` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentEvent {
    /// Run the event belongs to.
    pub run_id: String,
    /// Which sub-stream of the run produced it.
    pub stream: StreamKind,
    /// Stream-specific body.
    #[serde(default)]
    pub data: Value,
}

/// Sub-stream tag of an [`AgentEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    /// Incremental assistant text.
    Assistant,
    /// Run lifecycle transitions.
    Lifecycle,
    /// Any stream this client does not consume (tool calls, etc.).
    #[serde(other)]
    Other,
}

/// `data` of an assistant event.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AssistantDelta {
    /// Newly generated text.
    #[serde(default)]
    pub delta: String,
}

/// `data` of a lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleData {
    /// Transition reached by the run.
    pub phase: LifecyclePhase,
    /// Failure description for [`LifecyclePhase::Error`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Lifecycle transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecyclePhase {
    /// The run started.
    Start,
    /// The run finished; no further assistant text follows.
    End,
    /// The run failed.
    Error,
    /// Unrecognised phase.
    #[serde(other)]
    Other,
}
