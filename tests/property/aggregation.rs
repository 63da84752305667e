// Test-specific lint overrides: property tests use unwrap/expect freely.
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::future_not_send)]

//! Property tests for streaming aggregation.
//!
//! Verifies, for arbitrary fragment sequences and arrival gaps:
//! 1. Flushes in emission order concatenate to the fragments in arrival
//!    order (nothing lost, duplicated or reordered).
//! 2. A flush happens only after a quiet gap of at least the idle window,
//!    or at stream end.
//! 3. Collapsed mode emits exactly one reply for non-blank output.

use std::time::Duration;

use proptest::prelude::*;
use tokio_util::sync::CancellationToken;

use gatebridge::aggregator::{Aggregator, AggregatorConfig, ReplyMode, ReplySink};
use gatebridge::gateway::{AgentRun, RunStream};

const IDLE_MS: u64 = 2000;

#[derive(Default)]
struct CollectingSink {
    replies: Vec<String>,
}

impl ReplySink for CollectingSink {
    async fn flush(&mut self, text: String) {
        self.replies.push(text);
    }
}

/// Feed `fragments` with `gaps_ms[i]` of silence before fragment `i`, then
/// close the stream. Runs on a paused clock.
fn aggregate(fragments: &[String], gaps_ms: &[u64], mode: ReplyMode) -> Vec<String> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
        .unwrap();

    runtime.block_on(async {
        let (feed, stream) = RunStream::channel(fragments.len().max(1));
        let mut run = AgentRun::detached("prop".to_string(), stream);

        let scripted: Vec<(u64, String)> = gaps_ms
            .iter()
            .copied()
            .zip(fragments.iter().cloned())
            .collect();
        tokio::spawn(async move {
            for (gap, fragment) in scripted {
                tokio::time::sleep(Duration::from_millis(gap)).await;
                feed.fragments.send(fragment).await.unwrap();
            }
        });

        let aggregator = Aggregator::new(AggregatorConfig {
            idle_window: Duration::from_millis(IDLE_MS),
            global_timeout: Duration::from_secs(24 * 3600),
            mode,
        });
        let mut sink = CollectingSink::default();
        aggregator
            .run(&mut run, &mut sink, &CancellationToken::new())
            .await
            .unwrap();
        sink.replies
    })
}

fn fragments_and_gaps() -> impl Strategy<Value = (Vec<String>, Vec<u64>)> {
    prop::collection::vec(("[a-z]{1,8}", 0u64..5000), 0..24)
        .prop_map(|pairs| pairs.into_iter().unzip())
}

proptest! {
    #[test]
    fn flushes_concatenate_to_fragments((fragments, gaps) in fragments_and_gaps()) {
        let replies = aggregate(&fragments, &gaps, ReplyMode::Streaming);
        prop_assert_eq!(replies.concat(), fragments.concat());
        prop_assert!(replies.iter().all(|r| !r.is_empty()));
    }

    #[test]
    fn flush_count_bounded_by_quiet_gaps((fragments, gaps) in fragments_and_gaps()) {
        let replies = aggregate(&fragments, &gaps, ReplyMode::Streaming);
        // Gaps before fragments other than the first can each end one reply,
        // and stream end can end one more.
        let quiet_gaps = gaps.iter().skip(1).filter(|&&g| g >= IDLE_MS).count();
        prop_assert!(replies.len() <= quiet_gaps + 1);
        if !fragments.is_empty() {
            prop_assert!(!replies.is_empty());
        }
    }

    #[test]
    fn collapsed_mode_emits_one_reply((fragments, gaps) in fragments_and_gaps()) {
        let replies = aggregate(&fragments, &gaps, ReplyMode::Collapsed { placeholder_after: None });
        if fragments.is_empty() {
            prop_assert!(replies.is_empty());
        } else {
            prop_assert_eq!(replies, vec![fragments.concat()]);
        }
    }

    #[test]
    fn whitespace_never_changes_visible_text(
        fragments in prop::collection::vec("[a-z \\n]{0,6}", 0..16),
    ) {
        let gaps = vec![0; fragments.len()];
        let replies = aggregate(&fragments, &gaps, ReplyMode::Streaming);
        let visible = |s: &str| s.chars().filter(|c| !c.is_whitespace()).collect::<String>();
        prop_assert_eq!(visible(&replies.concat()), visible(&fragments.concat()));
        prop_assert!(replies.iter().all(|r| r.trim() == r && !r.is_empty()));
    }
}
