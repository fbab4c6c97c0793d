//! End-to-end pipeline behavior over the in-memory broker with a scripted runtime.

mod common;

use common::{inbound, test_config, Events, FlakySink, Harness, RecordingSink, ScriptedRuntime};
use courier::runtime::RuntimeError;
use courier::transport::{MemoryBroker, OutboundSink};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn reply_ids(h: &Harness) -> Vec<String> {
    h.replies()
        .into_iter()
        .map(|r| r.response_to_message_id)
        .collect()
}

#[tokio::test(start_paused = true)]
async fn same_key_messages_share_one_session_and_run_in_order() {
    let mut config = test_config();
    config.limits.max_concurrent = 4;
    let h = Harness::new(&config, ScriptedRuntime::new(Duration::from_millis(20)));
    for i in 1..=5 {
        h.push(inbound(&format!("m{}", i), "u1", &format!("hello {}", i)));
    }
    h.run_to_end().await;

    assert_eq!(h.runtime.creates("u1"), 1);
    assert_eq!(h.runtime.overlaps(), 0);
    assert_eq!(reply_ids(&h), vec!["m1", "m2", "m3", "m4", "m5"]);

    let turns = h.runtime.turns();
    assert_eq!(turns.len(), 5);
    for (i, turn) in turns.iter().enumerate() {
        assert_eq!(turn.handle, "courier:u1");
        assert!(turn
            .prompt
            .contains(&format!("Message {} in this conversation.", i + 1)));
        assert!(turn
            .prompt
            .ends_with(&format!("Current Message from Ana: hello {}", i + 1)));
    }
    let session = h.consumer.store().get("u1").await.unwrap();
    assert_eq!(session.message_count, 5);
}

#[tokio::test(start_paused = true)]
async fn global_cap_is_never_exceeded() {
    let mut config = test_config();
    config.limits.max_concurrent = 3;
    let h = Harness::new(&config, ScriptedRuntime::new(Duration::from_millis(50)));
    for i in 0..12 {
        h.push(inbound(&format!("m{}", i), &format!("u{}", i), "hi"));
    }
    h.run_to_end().await;

    assert_eq!(h.runtime.peak(), 3);
    assert_eq!(h.replies().len(), 12);
    assert_eq!(h.consumer.limiter().in_flight(), 0);
    assert_eq!(h.consumer.store().len().await, 12);
}

#[tokio::test(start_paused = true)]
async fn malformed_envelopes_are_dropped_without_invoking() {
    let h = Harness::new(&test_config(), ScriptedRuntime::new(Duration::ZERO));
    h.push("not json at all");
    h.push(r#"{"messageId":"m1","text":"no key"}"#);
    h.push(inbound("m2", "u1", "fine"));
    h.run_to_end().await;

    let stats = h.consumer.stats().snapshot();
    assert_eq!(stats.dropped, 2);
    assert_eq!(stats.retried, 0);
    assert_eq!(stats.acked, 1);
    assert_eq!(h.runtime.turns().len(), 1);
    assert_eq!(reply_ids(&h), vec!["m2"]);
    assert!(h.dead_letters().is_empty());
    assert_eq!(h.broker.unacked(common::INBOUND), 0);
}

#[tokio::test(start_paused = true)]
async fn transient_failures_up_to_ceiling_then_success() {
    let mut config = test_config();
    config.retry.ceiling = 3;
    let runtime = ScriptedRuntime::new(Duration::from_millis(5));
    runtime.fail(
        "hi",
        [
            RuntimeError::Unavailable("connection refused".into()),
            RuntimeError::Timeout("slow".into()),
            RuntimeError::Unavailable("connection refused".into()),
        ],
    );
    let h = Harness::new(&config, runtime);
    h.push(inbound("m1", "u1", "hi"));
    h.run_to_end().await;

    assert_eq!(h.runtime.turns().len(), 4);
    let replies = h.replies();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].text, "echo hi");
    assert!(h.dead_letters().is_empty());
    let stats = h.consumer.stats().snapshot();
    assert_eq!(stats.retried, 3);
    assert_eq!(stats.acked, 1);
    assert_eq!(h.consumer.store().get("u1").await.unwrap().message_count, 1);
}

#[tokio::test(start_paused = true)]
async fn exceeding_the_ceiling_dead_letters_and_acks() {
    let mut config = test_config();
    config.retry.ceiling = 2;
    let runtime = ScriptedRuntime::new(Duration::ZERO);
    runtime.fail(
        "hi",
        (0..10).map(|_| RuntimeError::Unavailable("down".into())),
    );
    let h = Harness::new(&config, runtime);
    h.push(inbound("m1", "u1", "hi"));
    h.run_to_end().await;

    assert_eq!(h.runtime.turns().len(), 3);
    assert!(h.replies().is_empty());
    let dead = h.dead_letters();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].original_message_id.as_deref(), Some("m1"));
    assert_eq!(dead[0].attempt_count, 3);
    assert!(dead[0].last_error.contains("down"));
    assert_eq!(h.broker.depth(common::INBOUND), 0);
    assert_eq!(h.broker.unacked(common::INBOUND), 0);
}

// Wall clock: the age bound is measured in epoch millis.
#[tokio::test]
async fn age_bound_applies_to_envelopes_without_timestamp() {
    let mut config = test_config();
    config.retry.ceiling = 50;
    config.retry.max_elapsed_ms = Some(300);
    let runtime = ScriptedRuntime::new(Duration::ZERO);
    runtime.fail(
        "hi",
        (0..50).map(|_| RuntimeError::Unavailable("down".into())),
    );
    let h = Harness::new(&config, runtime);
    h.push(inbound("m1", "u1", "hi"));
    h.run_to_end().await;

    let turns = h.runtime.turns().len();
    assert!((2..=5).contains(&turns), "turns = {}", turns);
    let dead = h.dead_letters();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].attempt_count as usize, turns);
    assert!(h.replies().is_empty());
}

#[tokio::test(start_paused = true)]
async fn rejected_requests_are_not_retried() {
    let runtime = ScriptedRuntime::new(Duration::ZERO);
    runtime.fail("hi", [RuntimeError::Rejected("quota".into())]);
    let h = Harness::new(&test_config(), runtime);
    h.push(inbound("m1", "u1", "hi"));
    h.run_to_end().await;

    assert_eq!(h.runtime.turns().len(), 1);
    let dead = h.dead_letters();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].attempt_count, 1);
    assert_eq!(h.consumer.stats().snapshot().retried, 0);
}

#[tokio::test(start_paused = true)]
async fn publish_failure_retries_without_reinvoking() {
    let mut config = test_config();
    config.publish.attempts = 2;
    let broker = MemoryBroker::new();
    let flaky = Arc::new(FlakySink::new(Arc::new(broker.sink(common::OUTBOUND)), 2));
    let outbound: Arc<dyn OutboundSink> = flaky.clone();
    let h = Harness::with_outbound(
        &config,
        ScriptedRuntime::new(Duration::from_millis(5)),
        broker,
        outbound,
    );
    h.push(inbound("m1", "u1", "hi"));
    h.run_to_end().await;

    assert_eq!(h.runtime.turns().len(), 1);
    assert_eq!(flaky.attempts(), 3);
    assert_eq!(reply_ids(&h), vec!["m1"]);
    let stats = h.consumer.stats().snapshot();
    assert_eq!(stats.retried, 1);
    assert_eq!(stats.acked, 1);
    assert_eq!(h.consumer.store().get("u1").await.unwrap().message_count, 1);
}

#[tokio::test(start_paused = true)]
async fn redelivered_message_is_answered_once() {
    let h = Harness::new(&test_config(), ScriptedRuntime::new(Duration::from_millis(5)));
    h.push(inbound("m1", "u1", "hi"));
    h.push(inbound("m1", "u1", "hi"));
    h.run_to_end().await;

    assert_eq!(h.runtime.turns().len(), 1);
    assert_eq!(reply_ids(&h), vec!["m1"]);
    let stats = h.consumer.stats().snapshot();
    assert_eq!(stats.acked, 1);
    assert_eq!(stats.duplicates, 1);
    assert_eq!(h.consumer.store().get("u1").await.unwrap().message_count, 1);
}

#[tokio::test(start_paused = true)]
async fn without_idempotency_redelivery_is_answered_again() {
    let mut config = test_config();
    config.sessions.idempotency = false;
    let h = Harness::new(&config, ScriptedRuntime::new(Duration::from_millis(5)));
    h.push(inbound("m1", "u1", "hi"));
    h.push(inbound("m1", "u1", "hi"));
    h.run_to_end().await;

    assert_eq!(h.runtime.turns().len(), 2);
    assert_eq!(reply_ids(&h), vec!["m1", "m1"]);
    assert_eq!(h.consumer.store().get("u1").await.unwrap().message_count, 2);
}

#[tokio::test(start_paused = true)]
async fn second_message_waits_for_first_reply_to_be_published() {
    let events = Events::default();
    let broker = MemoryBroker::new();
    let outbound: Arc<dyn OutboundSink> = Arc::new(RecordingSink::new(
        broker.sink(common::OUTBOUND),
        events.clone(),
    ));
    let h = Harness::with_outbound(
        &test_config(),
        ScriptedRuntime::with_events(Duration::from_millis(100), events.clone()),
        broker,
        outbound,
    );
    h.push(inbound("m1", "u1", "hi"));
    h.push(inbound("m2", "u1", "bye"));
    h.run_to_end().await;

    assert_eq!(
        *events.lock().unwrap(),
        vec!["start hi", "end hi", "published m1", "start bye", "end bye", "published m2"]
    );
    assert_eq!(h.runtime.creates("u1"), 1);
    let session = h.consumer.store().get("u1").await.unwrap();
    assert_eq!(session.message_count, 2);
    let replies = h.replies();
    assert_eq!(replies[0].response_to_message_id, "m1");
    assert_eq!(replies[0].message_id, "resp-m1");
    assert_eq!(replies[0].session_id.as_deref(), Some("courier:u1"));
}

#[tokio::test(start_paused = true)]
async fn overloaded_messages_are_handed_back_and_processed_later() {
    let mut config = test_config();
    config.limits.max_concurrent = 1;
    config.limits.max_queued = 1;
    config.broker.prefetch_buffer = 4;
    let h = Harness::new(&config, ScriptedRuntime::new(Duration::from_secs(1)));
    h.push(inbound("m1", "a", "one"));
    h.push(inbound("m2", "b", "two"));
    h.push(inbound("m3", "c", "three"));
    h.run_to_end().await;

    let stats = h.consumer.stats().snapshot();
    assert!(stats.overloaded >= 1);
    assert_eq!(stats.acked, 3);
    let mut ids = reply_ids(&h);
    ids.sort();
    assert_eq!(ids, vec!["m1", "m2", "m3"]);
    assert_eq!(h.runtime.peak(), 1);
}

#[tokio::test(start_paused = true)]
async fn shutdown_releases_unfinished_messages() {
    let mut config = test_config();
    config.limits.max_concurrent = 1;
    config.shutdown.grace_secs = 1;
    let h = Harness::new(&config, ScriptedRuntime::new(Duration::from_secs(60)));
    h.push(inbound("m1", "u1", "one"));
    h.push(inbound("m2", "u2", "two"));

    let shutdown = CancellationToken::new();
    let source = h.broker.source(common::INBOUND);
    let run = h.consumer.run(source, shutdown.clone());
    let stop = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.cancel();
    };
    let (result, ()) = tokio::join!(run, stop);
    result.unwrap();

    assert!(h.replies().is_empty());
    assert_eq!(h.consumer.stats().snapshot().released, 2);
    assert_eq!(h.consumer.limiter().in_flight(), 0);
    assert_eq!(h.broker.unacked(common::INBOUND), 0);
    assert_eq!(h.broker.depth(common::INBOUND), 2);
}

#[tokio::test(start_paused = true)]
async fn shutdown_lets_inflight_turn_finish_within_grace() {
    let mut config = test_config();
    config.shutdown.grace_secs = 10;
    let h = Harness::new(&config, ScriptedRuntime::new(Duration::from_secs(2)));
    h.push(inbound("m1", "u1", "one"));

    let shutdown = CancellationToken::new();
    let source = h.broker.source(common::INBOUND);
    let run = h.consumer.run(source, shutdown.clone());
    let stop = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.cancel();
    };
    let (result, ()) = tokio::join!(run, stop);
    result.unwrap();

    assert_eq!(reply_ids(&h), vec!["m1"]);
    let stats = h.consumer.stats().snapshot();
    assert_eq!(stats.acked, 1);
    assert_eq!(stats.released, 0);
    assert_eq!(h.broker.unacked(common::INBOUND), 0);
    assert_eq!(h.broker.depth(common::INBOUND), 0);
}
