//! Gateway connection: handshake, request correlation and event dispatch.
//!
//! A single background task (the read loop) owns every `recv` on the
//! transport. Each inbound frame is either a response, handed to the caller
//! waiting on that request id, or an event, handed to the handler
//! registered for its name on a separate task. `agent` events are also
//! routed inline to the run they belong to, so fragments of one run keep
//! the order in which the read loop observed them.
//!
//! Shared tables live behind `parking_lot` locks that are only held for
//! the map operation itself and never across an `.await`.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use gatebridge_proto::codec::{self, CodecError};
use gatebridge_proto::frame::{EventFrame, Frame, RequestFrame, ResponseFrame};
use gatebridge_proto::gateway::{
    AGENT_EVENT, AgentAccepted, AgentEvent, AgentParams, AssistantDelta, AuthInfo,
    CHALLENGE_EVENT, ClientInfo, ConnectParams, LifecycleData, LifecyclePhase, METHOD_AGENT,
    METHOD_CONNECT, PROTOCOL_VERSION, StreamKind,
};

use super::run::{AgentRun, RouteGuard, RunFeed, RunStream};
use super::{GatewayConfig, GatewayError};
use crate::transport::Transport;
use crate::transport::ws::WsTransport;

/// Callback invoked with the payload of every event of one name.
pub type EventHandler = Arc<dyn Fn(Option<Value>) + Send + Sync>;

/// A request waiting for its correlated response.
struct PendingRequest {
    /// Distinguishes successive requests that reuse one id.
    seq: u64,
    method: String,
    created_at: Instant,
    tx: oneshot::Sender<ResponseFrame>,
    /// For `agent` requests: routed under the accepted `runId` before the
    /// response is handed over, so no event of the run can precede its route.
    run_feed: Option<RunFeed>,
}

/// State shared between the client handle and its read loop.
pub(crate) struct Shared {
    pending: Mutex<HashMap<String, PendingRequest>>,
    handlers: RwLock<HashMap<String, EventHandler>>,
    runs: Mutex<HashMap<String, RunFeed>>,
    connected: AtomicBool,
    /// Fires once the connection is gone.
    lost: CancellationToken,
    next_seq: AtomicU64,
}

impl Shared {
    fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            runs: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(true),
            lost: CancellationToken::new(),
            next_seq: AtomicU64::new(0),
        }
    }

    fn register_pending(
        &self,
        id: &str,
        method: &str,
        tx: oneshot::Sender<ResponseFrame>,
        run_feed: Option<RunFeed>,
    ) -> Result<u64, GatewayError> {
        let mut pending = self.pending.lock();
        if !self.connected.load(Ordering::SeqCst) {
            return Err(GatewayError::NotConnected);
        }
        if pending.contains_key(id) {
            return Err(GatewayError::DuplicateRequest(id.to_string()));
        }
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        pending.insert(
            id.to_string(),
            PendingRequest {
                seq,
                method: method.to_string(),
                created_at: Instant::now(),
                tx,
                run_feed,
            },
        );
        Ok(seq)
    }

    fn remove_pending(&self, id: &str, seq: u64) {
        let mut pending = self.pending.lock();
        if pending.get(id).is_some_and(|p| p.seq == seq) {
            pending.remove(id);
        }
    }

    pub(crate) fn release_run(&self, run_id: &str) {
        self.runs.lock().remove(run_id);
    }

    /// Drop the route of an `agent` response whose caller stopped waiting.
    ///
    /// Closing the slot first means the read loop either already handed the
    /// response over (seen here) or fails to and unroutes the run itself.
    fn release_abandoned_run(&self, rx: &mut oneshot::Receiver<ResponseFrame>) {
        rx.close();
        let Ok(res) = rx.try_recv() else {
            return;
        };
        if !res.ok {
            return;
        }
        if let Ok(accepted) = codec::decode_payload::<AgentAccepted>(res.payload.as_ref()) {
            tracing::debug!(run_id = %accepted.run_id, "releasing run of abandoned agent request");
            self.release_run(&accepted.run_id);
        }
    }

    fn handle_inbound(&self, text: &str) {
        match codec::decode(text) {
            Ok(Frame::Res(res)) => self.deliver_response(res),
            Ok(Frame::Event(evt)) => self.dispatch_event(evt),
            Ok(Frame::Req(req)) => {
                tracing::debug!(method = %req.method, "ignoring request frame from gateway");
            }
            Err(e) => {
                tracing::debug!(err = %e, "discarding unrecognised gateway message");
            }
        }
    }

    fn deliver_response(&self, res: ResponseFrame) {
        let Some(pending) = self.pending.lock().remove(&res.id) else {
            tracing::debug!(request_id = %res.id, "response for unknown or abandoned request");
            return;
        };
        tracing::debug!(
            request_id = %res.id,
            method = %pending.method,
            ok = res.ok,
            elapsed_ms = u64::try_from(pending.created_at.elapsed().as_millis()).unwrap_or(u64::MAX),
            "gateway response"
        );
        let routed = pending
            .run_feed
            .and_then(|feed| self.open_route(&res, feed));
        if pending.tx.send(res).is_err() {
            // The caller gave up; nobody will consume the run.
            if let Some(run_id) = routed {
                self.runs.lock().remove(&run_id);
            }
        }
    }

    fn open_route(&self, res: &ResponseFrame, feed: RunFeed) -> Option<String> {
        if !res.ok {
            return None;
        }
        match codec::decode_payload::<AgentAccepted>(res.payload.as_ref()) {
            Ok(accepted) => {
                self.runs.lock().insert(accepted.run_id.clone(), feed);
                Some(accepted.run_id)
            }
            Err(e) => {
                tracing::debug!(request_id = %res.id, err = %e, "agent response without run id");
                None
            }
        }
    }

    fn dispatch_event(&self, frame: EventFrame) {
        if frame.event == AGENT_EVENT {
            self.route_agent_event(frame.payload.as_ref());
        }

        let handler = self.handlers.read().get(&frame.event).cloned();
        if let Some(handler) = handler {
            let payload = frame.payload;
            tokio::spawn(async move { handler(payload) });
        } else if frame.event != AGENT_EVENT {
            tracing::trace!(event = %frame.event, "no handler for gateway event");
        }
    }

    fn route_agent_event(&self, payload: Option<&Value>) {
        let event: AgentEvent = match codec::decode_payload(payload) {
            Ok(event) => event,
            Err(e) => {
                tracing::debug!(err = %e, "dropping malformed agent event");
                return;
            }
        };

        match event.stream {
            StreamKind::Assistant => {
                let delta = match AssistantDelta::deserialize(&event.data) {
                    Ok(d) if !d.delta.is_empty() => d.delta,
                    Ok(_) => return,
                    Err(e) => {
                        tracing::debug!(run_id = %event.run_id, err = %e, "dropping malformed assistant delta");
                        return;
                    }
                };
                let mut runs = self.runs.lock();
                let Some(feed) = runs.get(&event.run_id) else {
                    tracing::trace!(run_id = %event.run_id, "assistant delta for unrouted run");
                    return;
                };
                match feed.fragments.try_send(delta) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::warn!(run_id = %event.run_id, "fragment queue full, dropping fragment");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        runs.remove(&event.run_id);
                    }
                }
            }
            StreamKind::Lifecycle => {
                let data = match LifecycleData::deserialize(&event.data) {
                    Ok(data) => data,
                    Err(e) => {
                        tracing::debug!(run_id = %event.run_id, err = %e, "dropping malformed lifecycle event");
                        return;
                    }
                };
                match data.phase {
                    LifecyclePhase::End => {
                        if self.runs.lock().remove(&event.run_id).is_some() {
                            tracing::debug!(run_id = %event.run_id, "agent run ended");
                        }
                    }
                    LifecyclePhase::Error => {
                        let removed = self.runs.lock().remove(&event.run_id);
                        if let Some(feed) = removed {
                            let message = data
                                .error
                                .unwrap_or_else(|| "agent run failed".to_string());
                            tracing::warn!(run_id = %event.run_id, error = %message, "agent run failed");
                            let _ = feed.errors.try_send(GatewayError::RunFailed { message });
                        }
                    }
                    LifecyclePhase::Start | LifecyclePhase::Other => {
                        tracing::trace!(run_id = %event.run_id, phase = ?data.phase, "lifecycle event");
                    }
                }
            }
            StreamKind::Other => {
                tracing::trace!(run_id = %event.run_id, "ignoring agent sub-stream");
            }
        }
    }

    /// Mark the connection dead and fail everything still waiting on it.
    ///
    /// Pending callers see [`GatewayError::ConnectionLost`] as soon as their
    /// response slot is dropped; open runs get it in their error slot.
    fn disconnect(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        let pending: Vec<PendingRequest> = self.pending.lock().drain().map(|(_, p)| p).collect();
        let runs: Vec<(String, RunFeed)> = self.runs.lock().drain().collect();
        let handlers = std::mem::take(&mut *self.handlers.write());

        if !pending.is_empty() || !runs.is_empty() {
            tracing::warn!(
                pending = pending.len(),
                runs = runs.len(),
                "gateway connection lost with work in flight"
            );
        }
        for (run_id, feed) in runs {
            if feed.errors.try_send(GatewayError::ConnectionLost).is_err() {
                tracing::debug!(run_id = %run_id, "run error slot already filled");
            }
        }
        drop(pending);
        drop(handlers);
        self.lost.cancel();
    }
}

/// Removes a pending request when its caller stops waiting.
struct PendingGuard<'a> {
    shared: &'a Shared,
    id: &'a str,
    seq: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.shared.remove_pending(self.id, self.seq);
    }
}

/// Background task draining the transport until it fails or ends.
async fn read_loop<T: Transport>(transport: Arc<T>, shared: Arc<Shared>) {
    loop {
        match transport.recv().await {
            Ok(Some(text)) => shared.handle_inbound(&text),
            Ok(None) => {
                tracing::info!("gateway closed the connection");
                break;
            }
            Err(e) => {
                tracing::warn!(err = %e, "gateway read failed");
                break;
            }
        }
    }
    shared.disconnect();
    tracing::info!("gateway read loop exiting");
}

/// Fresh identifier for a request or idempotency key.
#[must_use]
pub fn new_request_id() -> String {
    Uuid::now_v7().to_string()
}

/// Client for the agent gateway over one [`Transport`].
///
/// Created by [`GatewayClient::connect`] (WebSocket) or
/// [`GatewayClient::handshake`] (any transport). Both return only after the
/// `connect.challenge` / `connect` handshake succeeded.
pub struct GatewayClient<T: Transport> {
    transport: Arc<T>,
    shared: Arc<Shared>,
    config: GatewayConfig,
    reader: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl GatewayClient<WsTransport> {
    /// Dial the gateway at `config.url` and authenticate.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::Transport`] if the WebSocket cannot be opened.
    /// - Any error of [`GatewayClient::handshake`].
    pub async fn connect(
        config: GatewayConfig,
        cancel: &CancellationToken,
    ) -> Result<Self, GatewayError> {
        tracing::info!(url = %config.url, "connecting to agent gateway");
        let transport = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(GatewayError::Cancelled),
            result = WsTransport::connect(&config.url, config.connect_timeout) => result?,
        };
        Self::handshake(transport, config, cancel).await
    }
}

impl<T: Transport> GatewayClient<T> {
    fn new(transport: T, config: GatewayConfig) -> Self {
        Self {
            transport: Arc::new(transport),
            shared: Arc::new(Shared::new()),
            config,
            reader: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    fn spawn_reader(&self) {
        let handle = tokio::spawn(read_loop(
            Arc::clone(&self.transport),
            Arc::clone(&self.shared),
        ));
        *self.reader.lock() = Some(handle);
    }

    /// Start the read loop on an open transport and authenticate.
    ///
    /// Waits up to `handshake_timeout` for `connect.challenge`, then sends
    /// the `connect` request and waits for its response. On any failure the
    /// transport is closed before returning.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::HandshakeTimeout`] if no challenge arrives in time.
    /// - [`GatewayError::AuthRejected`] if the gateway refuses the token.
    /// - [`GatewayError::RequestTimeout`] if `connect` is never answered.
    /// - [`GatewayError::Transport`] if the request cannot be written.
    /// - [`GatewayError::Cancelled`] if `cancel` fires first.
    pub async fn handshake(
        transport: T,
        config: GatewayConfig,
        cancel: &CancellationToken,
    ) -> Result<Self, GatewayError> {
        let client = Self::new(transport, config);

        let (challenge_tx, challenge_rx) = oneshot::channel();
        let slot = Mutex::new(Some(challenge_tx));
        client.on_event(CHALLENGE_EVENT, move |_payload| {
            if let Some(tx) = slot.lock().take() {
                let _ = tx.send(());
            }
        });
        client.spawn_reader();

        tracing::debug!("waiting for gateway challenge");
        let challenged = client.await_challenge(challenge_rx, cancel).await;
        client.off_event(CHALLENGE_EVENT);

        let outcome = match challenged {
            Ok(()) => client.authenticate(cancel).await,
            Err(e) => Err(e),
        };
        if let Err(e) = outcome {
            tracing::warn!(err = %e, "gateway handshake failed");
            client.close().await;
            return Err(e);
        }

        tracing::info!(agent_id = %client.config.agent_id, "gateway connection ready");
        Ok(client)
    }

    async fn await_challenge(
        &self,
        challenge: oneshot::Receiver<()>,
        cancel: &CancellationToken,
    ) -> Result<(), GatewayError> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(GatewayError::Cancelled),
            waited = tokio::time::timeout(self.config.handshake_timeout, challenge) => match waited {
                Ok(Ok(())) => Ok(()),
                Ok(Err(_)) => Err(GatewayError::ConnectionLost),
                Err(_) => Err(GatewayError::HandshakeTimeout),
            },
        }
    }

    async fn authenticate(&self, cancel: &CancellationToken) -> Result<(), GatewayError> {
        let params = ConnectParams {
            min_protocol: PROTOCOL_VERSION,
            max_protocol: PROTOCOL_VERSION,
            client: ClientInfo {
                id: self.config.client.id.clone(),
                version: self.config.client.version.clone(),
                platform: self.config.client.platform.clone(),
                mode: self.config.client.mode.clone(),
            },
            role: self.config.role.clone(),
            scopes: self.config.scopes.clone(),
            auth: AuthInfo {
                token: self.config.token.clone(),
            },
            locale: self.config.locale.clone(),
            user_agent: self.config.user_agent.clone(),
        };
        tracing::debug!(protocol = PROTOCOL_VERSION, role = %params.role, "sending connect request");

        let res = self
            .request(&new_request_id(), METHOD_CONNECT, to_params(&params)?, cancel)
            .await?;
        if !res.ok {
            return Err(GatewayError::AuthRejected {
                message: res.error_message("unknown error"),
            });
        }
        Ok(())
    }

    /// Send one request and wait for the response carrying the same `id`.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::NotConnected`] if the connection is already gone.
    /// - [`GatewayError::DuplicateRequest`] if `id` is already in flight.
    /// - [`GatewayError::Transport`] if the frame cannot be written.
    /// - [`GatewayError::RequestTimeout`] after `request_timeout`.
    /// - [`GatewayError::ConnectionLost`] if the read loop stops first.
    /// - [`GatewayError::Cancelled`] if `cancel` fires first.
    pub async fn request(
        &self,
        id: &str,
        method: &str,
        params: Value,
        cancel: &CancellationToken,
    ) -> Result<ResponseFrame, GatewayError> {
        self.send_request(id, method, params, None, cancel).await
    }

    async fn send_request(
        &self,
        id: &str,
        method: &str,
        params: Value,
        run_feed: Option<RunFeed>,
        cancel: &CancellationToken,
    ) -> Result<ResponseFrame, GatewayError> {
        let (tx, mut rx) = oneshot::channel();
        let opens_run = run_feed.is_some();
        let seq = self.shared.register_pending(id, method, tx, run_feed)?;
        let _guard = PendingGuard {
            shared: &self.shared,
            id,
            seq,
        };

        let text = codec::encode(&Frame::Req(RequestFrame {
            id: id.to_string(),
            method: method.to_string(),
            params: Some(params),
        }))?;
        tracing::debug!(request_id = id, method, "sending gateway request");

        // A stalled write is bounded by the same deadline and cancellation.
        let response = &mut rx;
        let exchange = async move {
            if let Err(e) = self.transport.send(text).await {
                return Err(GatewayError::from(e));
            }
            response.await.map_err(|_| GatewayError::ConnectionLost)
        };
        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(GatewayError::Cancelled),
            waited = tokio::time::timeout(self.config.request_timeout, exchange) => {
                waited.unwrap_or_else(|_| {
                    tracing::warn!(request_id = id, method, "gateway request timed out");
                    Err(GatewayError::RequestTimeout {
                        method: method.to_string(),
                    })
                })
            }
        };
        if outcome.is_err() && opens_run {
            self.shared.release_abandoned_run(&mut rx);
        }
        outcome
    }

    /// Start one agent turn and return its live stream.
    ///
    /// The returned [`AgentRun`] receives every non-empty assistant delta of
    /// the run in arrival order. Its fragment queue is bounded by
    /// `fragment_capacity`; when full, the newest fragment is dropped rather
    /// than stalling the read loop. The queue closes on lifecycle `end`; a
    /// lifecycle `error` fills the error slot with
    /// [`GatewayError::RunFailed`].
    ///
    /// # Errors
    ///
    /// - [`GatewayError::InvokeFailed`] if the gateway rejects the turn.
    /// - [`GatewayError::Decode`] if the response carries no usable `runId`.
    /// - Any error of [`request`](Self::request).
    pub async fn invoke_agent(
        &self,
        session_key: &str,
        message: &str,
        cancel: &CancellationToken,
    ) -> Result<AgentRun, GatewayError> {
        let params = AgentParams {
            message: message.to_string(),
            agent_id: self.config.agent_id.clone(),
            session_key: session_key.to_string(),
            deliver: false,
            idempotency_key: new_request_id(),
        };

        let (feed, stream) = RunStream::channel(self.config.fragment_capacity);
        let res = self
            .send_request(
                &new_request_id(),
                METHOD_AGENT,
                to_params(&params)?,
                Some(feed),
                cancel,
            )
            .await?;
        if !res.ok {
            return Err(GatewayError::InvokeFailed {
                message: res.error_message("request failed"),
            });
        }
        let accepted: AgentAccepted = codec::decode_payload(res.payload.as_ref())?;
        tracing::info!(run_id = %accepted.run_id, session_key, "agent run accepted");

        let route = RouteGuard {
            shared: Arc::downgrade(&self.shared),
            run_id: accepted.run_id.clone(),
        };
        Ok(AgentRun::routed(accepted.run_id, stream, route))
    }

    /// Register `handler` for events named `event`, replacing any previous one.
    pub fn on_event<F>(&self, event: &str, handler: F)
    where
        F: Fn(Option<Value>) + Send + Sync + 'static,
    {
        self.shared
            .handlers
            .write()
            .insert(event.to_string(), Arc::new(handler));
    }

    /// Remove the handler for `event`, if any.
    pub fn off_event(&self, event: &str) {
        self.shared.handlers.write().remove(event);
    }

    /// Whether the read loop is still running.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Resolves once the connection is gone, whether closed locally or lost.
    pub async fn disconnected(&self) {
        self.shared.lost.cancelled().await;
    }

    /// Settings this client was created with.
    #[must_use]
    pub const fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Close the connection. Calling this more than once is harmless.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.disconnect();
        self.transport.close().await;
        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
        tracing::info!("gateway connection closed");
    }
}

impl<T: Transport> Drop for GatewayClient<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.reader.get_mut().take() {
            handle.abort();
        }
    }
}

fn to_params<P: serde::Serialize>(params: &P) -> Result<Value, GatewayError> {
    serde_json::to_value(params)
        .map_err(|e| GatewayError::Decode(CodecError::Serialization(e.to_string())))
}
