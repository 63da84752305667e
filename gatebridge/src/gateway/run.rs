//! Per-run stream handles.
//!
//! A run's output travels over two channels: a bounded queue of assistant
//! text fragments that closes when the turn completes, and a single-slot
//! error channel. The gateway read loop holds the sending half
//! ([`RunFeed`]); the consumer holds the receiving half ([`RunStream`]).

use std::sync::Weak;

use tokio::sync::mpsc;

use super::GatewayError;
use super::client::Shared;

/// Sending half of a run, held by the gateway's run route table.
#[derive(Debug)]
pub struct RunFeed {
    /// Fragment queue. Dropping it closes the stream.
    pub fragments: mpsc::Sender<String>,
    /// Error slot (capacity one).
    pub errors: mpsc::Sender<GatewayError>,
}

/// Receiving half of a run.
#[derive(Debug)]
pub struct RunStream {
    /// Assistant text in arrival order; `None` once the turn is complete.
    pub fragments: mpsc::Receiver<String>,
    /// Terminal failure reported for the run, if any.
    pub errors: mpsc::Receiver<GatewayError>,
}

impl RunStream {
    /// Create a connected feed/stream pair whose fragment queue holds at most
    /// `capacity` undelivered fragments.
    #[must_use]
    pub fn channel(capacity: usize) -> (RunFeed, Self) {
        let (fragment_tx, fragment_rx) = mpsc::channel(capacity.max(1));
        let (error_tx, error_rx) = mpsc::channel(1);
        (
            RunFeed {
                fragments: fragment_tx,
                errors: error_tx,
            },
            Self {
                fragments: fragment_rx,
                errors: error_rx,
            },
        )
    }
}

/// Removes a run's route from the gateway when the run handle is dropped.
pub(crate) struct RouteGuard {
    pub(crate) shared: Weak<Shared>,
    pub(crate) run_id: String,
}

impl Drop for RouteGuard {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.release_run(&self.run_id);
        }
    }
}

/// One agent turn accepted by the gateway.
///
/// Holds the run's [`RunStream`]. While the handle lives, events for
/// [`run_id`](Self::run_id) are routed into it; dropping the handle
/// unregisters the route.
pub struct AgentRun {
    run_id: String,
    stream: RunStream,
    _route: Option<RouteGuard>,
}

impl AgentRun {
    pub(crate) fn routed(run_id: String, stream: RunStream, route: RouteGuard) -> Self {
        Self {
            run_id,
            stream,
            _route: Some(route),
        }
    }

    /// Wrap a stream that is not attached to any gateway connection.
    #[must_use]
    pub fn detached(run_id: String, stream: RunStream) -> Self {
        Self {
            run_id,
            stream,
            _route: None,
        }
    }

    /// Backend-assigned run identifier.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Mutable access to the run's fragment stream and error slot.
    pub fn stream_mut(&mut self) -> &mut RunStream {
        &mut self.stream
    }
}

impl std::fmt::Debug for AgentRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRun")
            .field("run_id", &self.run_id)
            .field("routed", &self._route.is_some())
            .finish_non_exhaustive()
    }
}
