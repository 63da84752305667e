//! Streaming reply aggregation.
//!
//! Turns the irregular fragment stream of one agent run into a small number
//! of chat replies. In [`ReplyMode::Streaming`] the buffer is flushed after
//! an idle window with no new fragments; in [`ReplyMode::Collapsed`] the
//! whole run becomes one reply, optionally preceded by a thinking
//! placeholder. Either way a flush never contains text that arrived before
//! text of an earlier flush.

use std::future::Future;
use std::time::Duration;

use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;

use crate::gateway::{AgentRun, GatewayError};

/// How replies for one run are emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplyMode {
    /// Flush whenever the stream goes quiet for the idle window.
    #[default]
    Streaming,
    /// Emit one reply when the run completes.
    Collapsed {
        /// Show a placeholder if nothing was emitted by then.
        placeholder_after: Option<Duration>,
    },
}

/// Timing parameters of the aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregatorConfig {
    /// Quiet period after the last fragment before a partial flush.
    pub idle_window: Duration,
    /// Hard ceiling on one run, measured from its start.
    pub global_timeout: Duration,
    pub mode: ReplyMode,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            idle_window: Duration::from_secs(2),
            global_timeout: Duration::from_secs(300),
            mode: ReplyMode::Streaming,
        }
    }
}

/// Receives the replies the aggregator decides to emit.
pub trait ReplySink: Send {
    /// Emit one finalized, trimmed, non-empty reply.
    fn flush(&mut self, text: String) -> impl Future<Output = ()> + Send;

    /// The run is slow; show a provisional notice.
    fn thinking(&mut self) -> impl Future<Output = ()> + Send {
        async {}
    }
}

/// Outcome of a run that completed normally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregateSummary {
    /// Number of replies passed to [`ReplySink::flush`].
    pub flushes: usize,
    /// Whether [`ReplySink::thinking`] was called.
    pub placeholder_sent: bool,
}

/// Ways an aggregation run can fail.
#[derive(Debug, thiserror::Error)]
pub enum AggregateError {
    /// The run exceeded the global timeout. Buffered text was flushed first.
    #[error("timed out waiting for agent response")]
    Timeout {
        /// Summary up to the timeout.
        summary: AggregateSummary,
    },

    /// The caller cancelled the turn.
    #[error("operation cancelled")]
    Cancelled {
        /// Summary up to the cancellation.
        summary: AggregateSummary,
    },

    /// The run's error slot fired. Buffered text was discarded.
    #[error("{source}")]
    Run {
        #[source]
        source: GatewayError,
        /// Summary up to the failure.
        summary: AggregateSummary,
    },
}

impl AggregateError {
    /// Progress made before the failure.
    #[must_use]
    pub const fn summary(&self) -> AggregateSummary {
        match self {
            Self::Timeout { summary } | Self::Cancelled { summary } | Self::Run { summary, .. } => {
                *summary
            }
        }
    }
}

/// Drives one run's fragment stream into a [`ReplySink`].
#[derive(Debug, Clone, Default)]
pub struct Aggregator {
    config: AggregatorConfig,
}

impl Aggregator {
    #[must_use]
    pub const fn new(config: AggregatorConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub const fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    /// Consume `run` until its stream closes, fails, times out or `cancel`
    /// fires.
    ///
    /// Triggers are checked in a fixed priority: cancellation, the run's
    /// error slot, the global deadline, then fragments and timers.
    ///
    /// # Errors
    ///
    /// See [`AggregateError`].
    pub async fn run<S: ReplySink>(
        &self,
        run: &mut AgentRun,
        sink: &mut S,
        cancel: &CancellationToken,
    ) -> Result<AggregateSummary, AggregateError> {
        let run_id = run.run_id().to_owned();
        let stream = run.stream_mut();

        let streaming = matches!(self.config.mode, ReplyMode::Streaming);
        let placeholder_after = match self.config.mode {
            ReplyMode::Collapsed { placeholder_after } => placeholder_after,
            ReplyMode::Streaming => None,
        };

        let global = sleep(self.config.global_timeout);
        let idle = sleep(self.config.idle_window);
        let thinking = sleep(placeholder_after.unwrap_or_default());
        tokio::pin!(global, idle, thinking);

        let mut idle_armed = false;
        let mut thinking_armed = placeholder_after.is_some();
        let mut errors_open = true;
        let mut buffer = String::new();
        let mut summary = AggregateSummary::default();

        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => {
                    tracing::debug!(run_id = %run_id, "aggregation cancelled");
                    return Err(AggregateError::Cancelled { summary });
                }

                err = stream.errors.recv(), if errors_open => {
                    match err {
                        Some(source) => {
                            tracing::debug!(
                                run_id = %run_id,
                                discarded = buffer.len(),
                                err = %source,
                                "run failed, discarding buffer"
                            );
                            return Err(AggregateError::Run { source, summary });
                        }
                        None => errors_open = false,
                    }
                }

                () = &mut global => {
                    tracing::warn!(run_id = %run_id, "agent response timed out");
                    flush(&mut buffer, sink, &mut summary).await;
                    return Err(AggregateError::Timeout { summary });
                }

                fragment = stream.fragments.recv() => {
                    match fragment {
                        Some(text) => {
                            buffer.push_str(&text);
                            if streaming {
                                idle.as_mut().reset(Instant::now() + self.config.idle_window);
                                idle_armed = true;
                            }
                        }
                        None => {
                            flush(&mut buffer, sink, &mut summary).await;
                            tracing::debug!(run_id = %run_id, flushes = summary.flushes, "agent reply complete");
                            return Ok(summary);
                        }
                    }
                }

                () = &mut idle, if idle_armed => {
                    idle_armed = false;
                    flush(&mut buffer, sink, &mut summary).await;
                }

                () = &mut thinking, if thinking_armed => {
                    thinking_armed = false;
                    if summary.flushes == 0 {
                        tracing::debug!(run_id = %run_id, "sending thinking placeholder");
                        sink.thinking().await;
                        summary.placeholder_sent = true;
                    }
                }
            }
        }
    }
}

async fn flush<S: ReplySink>(buffer: &mut String, sink: &mut S, summary: &mut AggregateSummary) {
    let text = buffer.trim().to_string();
    buffer.clear();
    if text.is_empty() {
        return;
    }
    summary.flushes += 1;
    sink.flush(text).await;
}
