// Test-specific lint overrides: property tests use unwrap/expect freely.
#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Property tests for the gateway wire codec.
//!
//! Uses proptest to verify:
//! 1. Arbitrary text never causes a panic in `decode`.
//! 2. Any response frame built from arbitrary ids and messages is decoded
//!    back to the same id, flag and error message.
//! 3. Agent events with unknown stream kinds still parse.

use proptest::prelude::*;
use serde_json::json;

use gatebridge_proto::codec;
use gatebridge_proto::frame::{ErrorShape, Frame, ResponseFrame};
use gatebridge_proto::gateway::{AgentEvent, StreamKind};

proptest! {
    #[test]
    fn decode_never_panics(text in any::<String>()) {
        let _ = codec::decode(&text);
    }

    #[test]
    fn decode_never_panics_on_json_like_input(
        kind in prop::sample::select(vec!["req", "res", "event", "other", ""]),
        body in "[ -~]{0,64}",
    ) {
        let text = format!(r#"{{"type":"{kind}",{body}}}"#);
        let _ = codec::decode(&text);
    }

    #[test]
    fn response_fields_survive_the_wire(
        id in "[A-Za-z0-9-]{1,40}",
        ok in any::<bool>(),
        message in any::<String>(),
    ) {
        let frame = Frame::Res(ResponseFrame {
            id: id.clone(),
            ok,
            error: (!ok).then(|| ErrorShape { code: "E".to_string(), message: message.clone() }),
            payload: None,
        });
        let decoded = codec::decode(&codec::encode(&frame).unwrap()).unwrap();
        let Frame::Res(res) = decoded else {
            return Err(TestCaseError::fail("decoded into a different frame kind"));
        };
        prop_assert_eq!(res.id, id);
        prop_assert_eq!(res.ok, ok);
        if !ok {
            prop_assert_eq!(res.error.unwrap().message, message);
        }
    }

    #[test]
    fn unknown_stream_kinds_are_tolerated(stream in "[a-z_]{1,12}") {
        let payload = json!({"runId": "r", "stream": stream, "data": {"x": 1}});
        let event: AgentEvent = codec::decode_payload(Some(&payload)).unwrap();
        let expected = match stream.as_str() {
            "assistant" => StreamKind::Assistant,
            "lifecycle" => StreamKind::Lifecycle,
            _ => StreamKind::Other,
        };
        prop_assert_eq!(event.stream, expected);
    }
}
