// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::doc_markdown,
    clippy::future_not_send,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc
)]

//! End-to-end bridge turns over a loopback gateway.
//!
//! The gateway side is scripted on the far end of a `LoopbackTransport`
//! pair; the chat side is a recording `ChatChannel`. Timing-sensitive
//! tests run on paused tokio time so idle windows and placeholder delays
//! elapse instantly.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use gatebridge::aggregator::{AggregatorConfig, ReplyMode};
use gatebridge::bridge::{Bridge, BridgeConfig};
use gatebridge::chat::{ChatChannel, ChatError, ChatId, InboundMessage, MessageHandle};
use gatebridge::gateway::{GatewayClient, GatewayConfig};
use gatebridge::transport::Transport;
use gatebridge::transport::loopback::LoopbackTransport;
use gatebridge_proto::codec;
use gatebridge_proto::frame::{ErrorShape, EventFrame, Frame, RequestFrame, ResponseFrame};

// =============================================================================
// Recording chat
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum ChatOp {
    Deliver { chat: String, text: String },
    Update { message_id: String, text: String },
    Retract { message_id: String },
}

#[derive(Default)]
struct RecordingChat {
    ops: Mutex<Vec<ChatOp>>,
    next_id: Mutex<u32>,
}

impl RecordingChat {
    fn ops(&self) -> Vec<ChatOp> {
        self.ops.lock().clone()
    }

    fn delivered_to(&self, chat: &str) -> Vec<String> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                ChatOp::Deliver { chat: c, text } if c == chat => Some(text),
                _ => None,
            })
            .collect()
    }
}

impl ChatChannel for RecordingChat {
    async fn deliver(&self, chat_id: &ChatId, text: &str) -> Result<MessageHandle, ChatError> {
        let message_id = {
            let mut next = self.next_id.lock();
            *next += 1;
            format!("msg-{}", *next)
        };
        self.ops.lock().push(ChatOp::Deliver {
            chat: chat_id.to_string(),
            text: text.to_string(),
        });
        Ok(MessageHandle {
            chat_id: chat_id.clone(),
            message_id,
        })
    }

    async fn update(&self, handle: &MessageHandle, text: &str) -> Result<(), ChatError> {
        self.ops.lock().push(ChatOp::Update {
            message_id: handle.message_id.clone(),
            text: text.to_string(),
        });
        Ok(())
    }

    async fn retract(&self, handle: &MessageHandle) -> Result<(), ChatError> {
        self.ops.lock().push(ChatOp::Retract {
            message_id: handle.message_id.clone(),
        });
        Ok(())
    }
}

// =============================================================================
// Scripted loopback gateway
// =============================================================================

struct ScriptedGateway {
    end: LoopbackTransport,
}

impl ScriptedGateway {
    async fn send_frame(&self, frame: Frame) {
        self.end.send(codec::encode(&frame).unwrap()).await.unwrap();
    }

    async fn event(&self, name: &str, payload: Value) {
        self.send_frame(Frame::Event(EventFrame {
            event: name.to_string(),
            payload: Some(payload),
        }))
        .await;
    }

    async fn next_request(&self) -> Option<RequestFrame> {
        loop {
            let text = self.end.recv().await.ok()??;
            if let Ok(Frame::Req(req)) = codec::decode(&text) {
                return Some(req);
            }
        }
    }

    async fn respond(&self, id: &str, ok: bool, payload: Value, error: Option<&str>) {
        self.send_frame(Frame::Res(ResponseFrame {
            id: id.to_string(),
            ok,
            error: error.map(|message| ErrorShape {
                code: "AGENT_ERROR".to_string(),
                message: message.to_string(),
            }),
            payload: Some(payload),
        }))
        .await;
    }

    /// Accept the next agent request as `run_id`; returns its params.
    async fn accept_run(&self, run_id: &str) -> Value {
        let req = self.next_request().await.expect("agent request");
        assert_eq!(req.method, "agent");
        self.respond(&req.id, true, json!({"runId": run_id}), None)
            .await;
        req.params.unwrap()
    }

    async fn delta(&self, run_id: &str, text: &str) {
        self.event(
            "agent",
            json!({"runId": run_id, "stream": "assistant", "data": {"delta": text}}),
        )
        .await;
    }

    async fn lifecycle(&self, run_id: &str, data: Value) {
        self.event(
            "agent",
            json!({"runId": run_id, "stream": "lifecycle", "data": data}),
        )
        .await;
    }

    async fn end(&self, run_id: &str) {
        self.lifecycle(run_id, json!({"phase": "end"})).await;
    }
}

async fn connect_loopback() -> (Arc<GatewayClient<LoopbackTransport>>, ScriptedGateway) {
    let (client_end, gateway_end) = LoopbackTransport::create_pair(256);
    let gateway = ScriptedGateway { end: gateway_end };
    let connecting = tokio::spawn(async move {
        let config = GatewayConfig {
            token: "tok".to_string(),
            ..Default::default()
        };
        GatewayClient::handshake(client_end, config, &CancellationToken::new()).await
    });
    gateway.event("connect.challenge", json!({})).await;
    let req = gateway.next_request().await.unwrap();
    assert_eq!(req.method, "connect");
    gateway.respond(&req.id, true, json!({}), None).await;
    (Arc::new(connecting.await.unwrap().unwrap()), gateway)
}

fn collapsed_config(placeholder_after: Duration) -> BridgeConfig {
    BridgeConfig {
        aggregator: AggregatorConfig {
            mode: ReplyMode::Collapsed {
                placeholder_after: Some(placeholder_after),
            },
            ..Default::default()
        },
        ..Default::default()
    }
}

fn message(chat: &str, text: &str) -> InboundMessage {
    InboundMessage::new(ChatId::new(chat), text)
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test(start_paused = true)]
async fn message_becomes_streamed_replies() {
    let (client, gateway) = connect_loopback().await;
    let chat = Arc::new(RecordingChat::default());
    let bridge = Arc::new(Bridge::new(
        Arc::clone(&client),
        Arc::clone(&chat),
        BridgeConfig::default(),
    ));

    let (tx, rx) = mpsc::channel(8);
    let running = tokio::spawn(Arc::clone(&bridge).run(rx, CancellationToken::new()));
    tx.send(message("oc_1", "hello agent")).await.unwrap();

    let params = gateway.accept_run("run-1").await;
    assert_eq!(params["sessionKey"], "chat:oc_1");
    assert_eq!(params["message"], "hello agent");
    assert_eq!(params["deliver"], false);

    gateway.delta("run-1", "First thought.").await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    gateway.delta("run-1", " Second ").await;
    gateway.delta("run-1", "thought.").await;
    gateway.end("run-1").await;

    drop(tx);
    running.await.unwrap();
    assert_eq!(
        chat.delivered_to("oc_1"),
        vec!["First thought.", "Second thought."]
    );
}

#[tokio::test(start_paused = true)]
async fn rejected_turn_sends_error_notice() {
    let (client, gateway) = connect_loopback().await;
    let chat = Arc::new(RecordingChat::default());
    let bridge = Bridge::new(client, Arc::clone(&chat), BridgeConfig::default());

    let script = tokio::spawn(async move {
        let req = gateway.next_request().await.unwrap();
        gateway
            .respond(&req.id, false, json!({}), Some("agent busy"))
            .await;
        gateway
    });

    let result = bridge
        .handle_message(message("oc_1", "hi"), &CancellationToken::new())
        .await;
    assert!(result.is_err());
    let _gateway = script.await.unwrap();
    assert_eq!(
        chat.delivered_to("oc_1"),
        vec!["Error while processing message: agent request failed: agent busy"]
    );
}

#[tokio::test(start_paused = true)]
async fn failed_run_discards_partial_text_and_reports() {
    let (client, gateway) = connect_loopback().await;
    let chat = Arc::new(RecordingChat::default());
    let bridge = Bridge::new(client, Arc::clone(&chat), BridgeConfig::default());

    let script = tokio::spawn(async move {
        gateway.accept_run("run-x").await;
        gateway.delta("run-x", "half an ans").await;
        gateway
            .lifecycle(
                "run-x",
                json!({"phase": "error", "error": "model overloaded"}),
            )
            .await;
        gateway
    });

    let result = bridge
        .handle_message(message("oc_9", "question"), &CancellationToken::new())
        .await;
    assert!(result.is_err());
    let _gateway = script.await.unwrap();
    assert_eq!(
        chat.delivered_to("oc_9"),
        vec!["Error while processing message: agent run failed: model overloaded"]
    );
}

#[tokio::test(start_paused = true)]
async fn cancelled_turn_is_silent() {
    let (client, gateway) = connect_loopback().await;
    let chat = Arc::new(RecordingChat::default());
    let bridge = Bridge::new(client, Arc::clone(&chat), BridgeConfig::default());
    let cancel = CancellationToken::new();

    let (streaming_tx, streaming_rx) = oneshot::channel();
    let script = tokio::spawn(async move {
        gateway.accept_run("run-c").await;
        gateway.delta("run-c", "never delivered").await;
        let _ = streaming_tx.send(());
        gateway
    });

    let trigger = cancel.clone();
    tokio::spawn(async move {
        let _ = streaming_rx.await;
        trigger.cancel();
    });

    let result = bridge.handle_message(message("oc_1", "hi"), &cancel).await;
    assert!(result.unwrap_err().is_cancelled());
    let _gateway = script.await.unwrap();
    assert!(chat.ops().is_empty(), "unexpected chat ops: {:?}", chat.ops());
}

#[tokio::test(start_paused = true)]
async fn slow_answer_updates_placeholder() {
    let (client, gateway) = connect_loopback().await;
    let chat = Arc::new(RecordingChat::default());
    let bridge = Bridge::new(
        client,
        Arc::clone(&chat),
        collapsed_config(Duration::from_millis(2500)),
    );

    let script = tokio::spawn(async move {
        gateway.accept_run("run-slow").await;
        tokio::time::sleep(Duration::from_secs(4)).await;
        gateway.delta("run-slow", "Here is ").await;
        gateway.delta("run-slow", "the answer.").await;
        gateway.end("run-slow").await;
        gateway
    });

    let summary = bridge
        .handle_message(message("oc_1", "hard question"), &CancellationToken::new())
        .await
        .unwrap();
    let _gateway = script.await.unwrap();

    assert!(summary.placeholder_sent);
    assert_eq!(
        chat.ops(),
        vec![
            ChatOp::Deliver {
                chat: "oc_1".to_string(),
                text: "Thinking...".to_string()
            },
            ChatOp::Update {
                message_id: "msg-1".to_string(),
                text: "Here is the answer.".to_string()
            },
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn no_reply_retracts_placeholder() {
    let (client, gateway) = connect_loopback().await;
    let chat = Arc::new(RecordingChat::default());
    let bridge = Bridge::new(
        client,
        Arc::clone(&chat),
        collapsed_config(Duration::from_secs(1)),
    );

    let script = tokio::spawn(async move {
        gateway.accept_run("run-quiet").await;
        tokio::time::sleep(Duration::from_secs(3)).await;
        gateway.delta("run-quiet", "NO_REPLY").await;
        gateway.end("run-quiet").await;
        gateway
    });

    bridge
        .handle_message(message("oc_1", "ok thanks"), &CancellationToken::new())
        .await
        .unwrap();
    let _gateway = script.await.unwrap();

    assert_eq!(
        chat.ops(),
        vec![
            ChatOp::Deliver {
                chat: "oc_1".to_string(),
                text: "Thinking...".to_string()
            },
            ChatOp::Retract {
                message_id: "msg-1".to_string()
            },
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn empty_answer_retracts_placeholder() {
    let (client, gateway) = connect_loopback().await;
    let chat = Arc::new(RecordingChat::default());
    let bridge = Bridge::new(
        client,
        Arc::clone(&chat),
        collapsed_config(Duration::from_secs(1)),
    );

    let script = tokio::spawn(async move {
        gateway.accept_run("run-empty").await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        gateway.delta("run-empty", "   ").await;
        gateway.end("run-empty").await;
        gateway
    });

    let summary = bridge
        .handle_message(message("oc_1", "hm"), &CancellationToken::new())
        .await
        .unwrap();
    let _gateway = script.await.unwrap();

    assert_eq!(summary.flushes, 0);
    assert!(matches!(chat.ops().last(), Some(ChatOp::Retract { .. })));
}

#[tokio::test(start_paused = true)]
async fn blank_messages_are_ignored() {
    let (client, gateway) = connect_loopback().await;
    let chat = Arc::new(RecordingChat::default());
    let bridge = Arc::new(Bridge::new(
        Arc::clone(&client),
        Arc::clone(&chat),
        BridgeConfig::default(),
    ));

    let (tx, rx) = mpsc::channel(8);
    let running = tokio::spawn(Arc::clone(&bridge).run(rx, CancellationToken::new()));
    tx.send(message("oc_1", "   ")).await.unwrap();
    tx.send(message("oc_1", "real question")).await.unwrap();
    drop(tx);

    let params = gateway.accept_run("only").await;
    assert_eq!(params["message"], "real question");
    gateway.delta("only", "answer").await;
    gateway.end("only").await;
    running.await.unwrap();

    client.close().await;
    assert!(gateway.next_request().await.is_none());
    assert_eq!(chat.delivered_to("oc_1"), vec!["answer"]);
}

#[tokio::test(start_paused = true)]
async fn concurrent_chats_get_their_own_answers() {
    let (client, gateway) = connect_loopback().await;
    let chat = Arc::new(RecordingChat::default());
    let bridge = Arc::new(Bridge::new(
        Arc::clone(&client),
        Arc::clone(&chat),
        BridgeConfig::default(),
    ));

    let (tx, rx) = mpsc::channel(8);
    let running = tokio::spawn(Arc::clone(&bridge).run(rx, CancellationToken::new()));
    tx.send(message("alice", "question from alice"))
        .await
        .unwrap();
    tx.send(message("bob", "question from bob")).await.unwrap();

    let mut runs = Vec::new();
    for _ in 0..2 {
        let req = gateway.next_request().await.unwrap();
        let session = req.params.as_ref().unwrap()["sessionKey"]
            .as_str()
            .unwrap()
            .to_string();
        let run_id = format!("run-{session}");
        gateway
            .respond(&req.id, true, json!({"runId": run_id}), None)
            .await;
        runs.push((session, run_id));
    }
    for (session, run_id) in &runs {
        gateway.delta(run_id, &format!("answer for {session}")).await;
    }
    for (_, run_id) in &runs {
        gateway.end(run_id).await;
    }

    drop(tx);
    running.await.unwrap();
    assert_eq!(chat.delivered_to("alice"), vec!["answer for chat:alice"]);
    assert_eq!(chat.delivered_to("bob"), vec!["answer for chat:bob"]);
}

#[tokio::test(start_paused = true)]
async fn cancelling_bridge_stops_in_flight_turns() {
    let (client, gateway) = connect_loopback().await;
    let chat = Arc::new(RecordingChat::default());
    let bridge = Arc::new(Bridge::new(
        Arc::clone(&client),
        Arc::clone(&chat),
        BridgeConfig::default(),
    ));
    let cancel = CancellationToken::new();

    let (_tx, rx) = {
        let (tx, rx) = mpsc::channel(8);
        tx.send(message("oc_1", "long task")).await.unwrap();
        (tx, rx)
    };
    let running = tokio::spawn(Arc::clone(&bridge).run(rx, cancel.clone()));

    gateway.accept_run("run-long").await;
    gateway.delta("run-long", "working").await;
    cancel.cancel();

    tokio::time::timeout(Duration::from_secs(1), running)
        .await
        .expect("bridge did not stop")
        .unwrap();
    assert!(chat.ops().is_empty());
}
