//! Terminal chat surface.
//!
//! Lines typed on stdin become messages of a single conversation; replies
//! are printed, and edits or retractions are printed as follow-up lines
//! referencing the original message number.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use super::{ChatChannel, ChatError, ChatId, InboundMessage, MessageHandle};

/// Chat id used for the terminal conversation.
pub const CONSOLE_CHAT_ID: &str = "console";

/// [`ChatChannel`] that writes replies to a terminal-like sink.
pub struct ConsoleChannel<W> {
    out: Mutex<W>,
    next_id: AtomicU64,
    live: parking_lot::Mutex<HashSet<String>>,
}

impl ConsoleChannel<tokio::io::Stdout> {
    #[must_use]
    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }
}

impl<W: AsyncWrite + Unpin + Send + 'static> ConsoleChannel<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
            next_id: AtomicU64::new(1),
            live: parking_lot::Mutex::new(HashSet::new()),
        }
    }

    async fn write_line(&self, line: String) -> Result<(), ChatError> {
        let mut out = self.out.lock().await;
        out.write_all(line.as_bytes()).await?;
        out.write_all(b"\n").await?;
        out.flush().await?;
        Ok(())
    }

    fn check_live(&self, handle: &MessageHandle) -> Result<(), ChatError> {
        if self.live.lock().contains(&handle.message_id) {
            Ok(())
        } else {
            Err(ChatError::NotFound(handle.message_id.clone()))
        }
    }
}

impl<W: AsyncWrite + Unpin + Send + 'static> ChatChannel for ConsoleChannel<W> {
    async fn deliver(&self, chat_id: &ChatId, text: &str) -> Result<MessageHandle, ChatError> {
        let message_id = self.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        self.write_line(format!("[agent #{message_id}] {text}")).await?;
        self.live.lock().insert(message_id.clone());
        Ok(MessageHandle {
            chat_id: chat_id.clone(),
            message_id,
        })
    }

    async fn update(&self, handle: &MessageHandle, text: &str) -> Result<(), ChatError> {
        self.check_live(handle)?;
        self.write_line(format!("[agent #{} edited] {text}", handle.message_id))
            .await
    }

    async fn retract(&self, handle: &MessageHandle) -> Result<(), ChatError> {
        self.check_live(handle)?;
        self.live.lock().remove(&handle.message_id);
        self.write_line(format!("[agent #{} retracted]", handle.message_id))
            .await
    }
}

/// Forward each line of `reader` as an inbound message for `chat_id`.
///
/// Stops at end of input, when `cancel` fires, or when the receiving side
/// is dropped.
///
/// # Errors
///
/// Returns [`ChatError::Io`] if reading fails.
pub async fn read_lines<R>(
    reader: R,
    chat_id: ChatId,
    inbound: mpsc::Sender<InboundMessage>,
    cancel: CancellationToken,
) -> Result<(), ChatError>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    loop {
        let line = tokio::select! {
            () = cancel.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            tracing::debug!("console input closed");
            break;
        };
        if inbound
            .send(InboundMessage::new(chat_id.clone(), line))
            .await
            .is_err()
        {
            break;
        }
    }
    Ok(())
}

/// Spawn a task reading stdin into a channel of inbound messages.
pub fn spawn_stdin_reader(
    capacity: usize,
    cancel: CancellationToken,
) -> mpsc::Receiver<InboundMessage> {
    let (tx, rx) = mpsc::channel(capacity);
    tokio::spawn(async move {
        let stdin = tokio::io::BufReader::new(tokio::io::stdin());
        if let Err(e) = read_lines(stdin, ChatId::new(CONSOLE_CHAT_ID), tx, cancel).await {
            tracing::warn!(err = %e, "console input failed");
        }
    });
    rx
}
