//! Bridge orchestrator.
//!
//! Each inbound chat message becomes one agent turn: the message is sent to
//! the gateway, the run's stream is aggregated, and every reply the
//! aggregator emits is delivered to the chat. Failures end with a single
//! error notice in the chat, except cancellation, which ends silently.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::aggregator::{AggregateError, AggregateSummary, Aggregator, AggregatorConfig, ReplySink};
use crate::chat::{ChatChannel, ChatId, InboundMessage, MessageHandle};
use crate::gateway::{GatewayClient, GatewayError};
use crate::transport::Transport;

/// Prefix of the reply sent when a turn fails.
pub const ERROR_NOTICE_PREFIX: &str = "Error while processing message: ";

/// Agent answer meaning "nothing to say"; never shown to the user.
pub const NO_REPLY: &str = "NO_REPLY";

/// Log preview length for inbound text.
const PREVIEW_CHARS: usize = 50;

/// Errors that end one turn.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Aggregate(#[from] AggregateError),
}

impl BridgeError {
    /// Whether the turn ended because its caller cancelled it.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(
            self,
            Self::Gateway(GatewayError::Cancelled)
                | Self::Aggregate(AggregateError::Cancelled { .. })
        )
    }
}

/// Bridge settings.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Session keys are `{session_prefix}:{chat_id}`.
    pub session_prefix: String,
    /// Text of the provisional message in collapsed mode.
    pub placeholder_text: String,
    pub aggregator: AggregatorConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            session_prefix: "chat".to_string(),
            placeholder_text: "Thinking...".to_string(),
            aggregator: AggregatorConfig::default(),
        }
    }
}

/// Connects one chat channel to one gateway connection.
pub struct Bridge<T: Transport, C: ChatChannel> {
    gateway: Arc<GatewayClient<T>>,
    chat: Arc<C>,
    aggregator: Aggregator,
    config: BridgeConfig,
}

impl<T: Transport, C: ChatChannel> Bridge<T, C> {
    pub fn new(gateway: Arc<GatewayClient<T>>, chat: Arc<C>, config: BridgeConfig) -> Self {
        Self {
            gateway,
            chat,
            aggregator: Aggregator::new(config.aggregator),
            config,
        }
    }

    /// Conversation key the gateway uses to keep per-chat history.
    #[must_use]
    pub fn session_key(&self, chat_id: &ChatId) -> String {
        format!("{}:{chat_id}", self.config.session_prefix)
    }

    /// Handle inbound messages until the channel closes or `cancel` fires.
    ///
    /// Every message runs on its own task with a child token of `cancel`, so
    /// turns of different chats proceed independently. Returns after all
    /// started turns have finished.
    pub async fn run(
        self: Arc<Self>,
        mut inbound: mpsc::Receiver<InboundMessage>,
        cancel: CancellationToken,
    ) {
        let mut turns = JoinSet::new();
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                Some(joined) = turns.join_next(), if !turns.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(err = %e, "turn task panicked");
                    }
                }
                msg = inbound.recv() => {
                    let Some(msg) = msg else { break };
                    if msg.text.trim().is_empty() {
                        tracing::debug!(chat_id = %msg.chat_id, "ignoring blank message");
                        continue;
                    }
                    let bridge = Arc::clone(&self);
                    let token = cancel.child_token();
                    turns.spawn(async move {
                        // Outcome is already reported to the chat and the log.
                        let _ = bridge.handle_message(msg, &token).await;
                    });
                }
            }
        }

        tracing::info!(in_flight = turns.len(), "bridge stopping");
        while let Some(joined) = turns.join_next().await {
            if let Err(e) = joined {
                tracing::error!(err = %e, "turn task panicked");
            }
        }
    }

    /// Run one turn for `msg` and deliver its replies.
    ///
    /// # Errors
    ///
    /// Returns the error that ended the turn, after the user has been told
    /// about it (or, for cancellation, after cleaning up silently).
    pub async fn handle_message(
        &self,
        msg: InboundMessage,
        cancel: &CancellationToken,
    ) -> Result<AggregateSummary, BridgeError> {
        let session_key = self.session_key(&msg.chat_id);
        tracing::info!(
            chat_id = %msg.chat_id,
            text = %preview(&msg.text, PREVIEW_CHARS),
            "received message"
        );

        let mut sink = ChatReplySink::new(
            self.chat.as_ref(),
            &msg.chat_id,
            &self.config.placeholder_text,
        );
        let outcome = self.turn(&session_key, &msg.text, &mut sink, cancel).await;

        match &outcome {
            Ok(summary) => {
                sink.finish().await;
                tracing::info!(chat_id = %msg.chat_id, flushes = summary.flushes, "turn complete");
            }
            Err(e) if e.is_cancelled() => {
                sink.finish().await;
                tracing::debug!(chat_id = %msg.chat_id, "turn cancelled");
            }
            Err(e) => {
                tracing::warn!(chat_id = %msg.chat_id, err = %e, "turn failed");
                sink.notify_error(&format!("{ERROR_NOTICE_PREFIX}{e}")).await;
            }
        }
        outcome
    }

    async fn turn(
        &self,
        session_key: &str,
        text: &str,
        sink: &mut ChatReplySink<'_, C>,
        cancel: &CancellationToken,
    ) -> Result<AggregateSummary, BridgeError> {
        let mut run = self.gateway.invoke_agent(session_key, text, cancel).await?;
        tracing::info!(run_id = %run.run_id(), session_key, "agent processing");
        Ok(self.aggregator.run(&mut run, sink, cancel).await?)
    }
}

/// Delivers aggregated replies for one chat, managing the placeholder.
struct ChatReplySink<'a, C> {
    chat: &'a C,
    chat_id: &'a ChatId,
    placeholder_text: &'a str,
    placeholder: Option<MessageHandle>,
}

impl<'a, C: ChatChannel> ChatReplySink<'a, C> {
    const fn new(chat: &'a C, chat_id: &'a ChatId, placeholder_text: &'a str) -> Self {
        Self {
            chat,
            chat_id,
            placeholder_text,
            placeholder: None,
        }
    }

    /// Post `text`, reusing the placeholder when there is one.
    async fn post(&mut self, text: &str) {
        if let Some(handle) = self.placeholder.take() {
            match self.chat.update(&handle, text).await {
                Ok(()) => return,
                Err(e) => {
                    tracing::warn!(chat_id = %self.chat_id, err = %e, "placeholder update failed, sending new message");
                }
            }
        }
        if let Err(e) = self.chat.deliver(self.chat_id, text).await {
            tracing::error!(chat_id = %self.chat_id, err = %e, "failed to send reply");
        }
    }

    /// Retract a placeholder that never received an answer.
    async fn finish(&mut self) {
        if let Some(handle) = self.placeholder.take() {
            if let Err(e) = self.chat.retract(&handle).await {
                tracing::warn!(chat_id = %self.chat_id, err = %e, "failed to retract placeholder");
            }
        }
    }

    async fn notify_error(&mut self, notice: &str) {
        self.post(notice).await;
    }
}

impl<C: ChatChannel> ReplySink for ChatReplySink<'_, C> {
    async fn flush(&mut self, text: String) {
        if text == NO_REPLY {
            tracing::debug!(chat_id = %self.chat_id, "agent chose not to reply");
            return;
        }
        self.post(&text).await;
    }

    async fn thinking(&mut self) {
        match self.chat.deliver(self.chat_id, self.placeholder_text).await {
            Ok(handle) => self.placeholder = Some(handle),
            Err(e) => {
                tracing::warn!(chat_id = %self.chat_id, err = %e, "failed to send placeholder");
            }
        }
    }
}

fn preview(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
