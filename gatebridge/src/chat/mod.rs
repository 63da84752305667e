//! Chat platform collaborator.
//!
//! The bridge talks to a chat surface only through [`ChatChannel`]:
//! deliver a message, and where the platform allows it, edit or retract a
//! message previously delivered. Inbound messages arrive as
//! [`InboundMessage`] values on a channel owned by the platform adapter.

pub mod console;

use std::fmt;
use std::future::Future;

/// Errors returned by a chat platform adapter.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    /// The platform has no such operation.
    #[error("chat operation not supported: {0}")]
    Unsupported(&'static str),

    /// The referenced message no longer exists.
    #[error("message {0} not found")]
    NotFound(String),

    /// The platform rejected the request.
    #[error("chat platform error: {0}")]
    Platform(String),

    /// Writing to the chat surface failed.
    #[error("chat I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Identifier of one conversation on the chat platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChatId(String);

impl ChatId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reference to a delivered message, used to edit or retract it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHandle {
    pub chat_id: ChatId,
    pub message_id: String,
}

/// A user message received from the chat platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub chat_id: ChatId,
    pub text: String,
}

impl InboundMessage {
    pub fn new(chat_id: ChatId, text: impl Into<String>) -> Self {
        Self {
            chat_id,
            text: text.into(),
        }
    }
}

/// Outbound side of a chat platform.
pub trait ChatChannel: Send + Sync + 'static {
    /// Post `text` as a new message in `chat_id`.
    fn deliver(
        &self,
        chat_id: &ChatId,
        text: &str,
    ) -> impl Future<Output = Result<MessageHandle, ChatError>> + Send;

    /// Replace the text of a delivered message.
    fn update(
        &self,
        handle: &MessageHandle,
        text: &str,
    ) -> impl Future<Output = Result<(), ChatError>> + Send {
        let _ = (handle, text);
        async { Err(ChatError::Unsupported("update")) }
    }

    /// Remove a delivered message.
    fn retract(&self, handle: &MessageHandle) -> impl Future<Output = Result<(), ChatError>> + Send {
        let _ = handle;
        async { Err(ChatError::Unsupported("retract")) }
    }
}
