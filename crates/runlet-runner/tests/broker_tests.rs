//! Fan-out semantics of the output broker.

use pretty_assertions::assert_eq;
use runlet_runner::{
    replay_subscription, LineKind, OutputBroker, SubscribeMode, TerminalStatus, CLOSE_LINE,
    SLOW_CONSUMER_LINE,
};

async fn broker_in(dir: &tempfile::TempDir) -> OutputBroker {
    OutputBroker::create(dir.path().join("output_1.txt"))
        .await
        .expect("create broker")
}

#[tokio::test]
async fn file_records_stdout_verbatim_and_stderr_prefixed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let broker = broker_in(&dir).await;

    broker.publish(LineKind::Stdout, "hello").await.expect("publish");
    broker.publish(LineKind::Stderr, "boom").await.expect("publish");
    broker.finish(TerminalStatus::Success).await.expect("finish");

    assert_eq!(
        broker.contents().await.expect("contents"),
        "hello\nERROR: boom\n"
    );
}

#[tokio::test]
async fn output_file_exists_before_any_line() {
    let dir = tempfile::tempdir().expect("tempdir");
    let broker = broker_in(&dir).await;
    // Pollers check for existence before the child starts producing.
    assert!(broker.path().exists());
    assert_eq!(broker.contents().await.expect("contents"), "");
}

#[tokio::test]
async fn from_start_subscriber_sees_prefix_then_live_tail() {
    let dir = tempfile::tempdir().expect("tempdir");
    let broker = broker_in(&dir).await;

    broker.publish(LineKind::Stdout, "a").await.expect("publish");
    broker.publish(LineKind::Stdout, "b").await.expect("publish");

    let subscription = broker
        .subscribe(SubscribeMode::FromStart)
        .await
        .expect("subscribe");

    broker.publish(LineKind::Stdout, "c").await.expect("publish");
    broker.finish(TerminalStatus::Success).await.expect("finish");

    assert_eq!(
        subscription.collect().await,
        vec!["a\n", "b\n", "c\n", "STATUS: SUCCESS", CLOSE_LINE]
    );
}

#[tokio::test]
async fn live_subscriber_sees_only_the_suffix() {
    let dir = tempfile::tempdir().expect("tempdir");
    let broker = broker_in(&dir).await;

    broker.publish(LineKind::Stdout, "early").await.expect("publish");
    let subscription = broker
        .subscribe(SubscribeMode::Live)
        .await
        .expect("subscribe");
    broker.publish(LineKind::Stdout, "late").await.expect("publish");
    broker.finish(TerminalStatus::Failure).await.expect("finish");

    assert_eq!(
        subscription.collect().await,
        vec!["late\n", "STATUS: FAILURE", CLOSE_LINE]
    );
}

#[tokio::test]
async fn observed_bytes_are_a_prefix_of_the_final_record() {
    let dir = tempfile::tempdir().expect("tempdir");
    let broker = broker_in(&dir).await;

    for i in 0..20 {
        broker
            .publish(LineKind::Stdout, &format!("line {i}"))
            .await
            .expect("publish");
    }
    let subscription = broker
        .subscribe(SubscribeMode::FromStart)
        .await
        .expect("subscribe");
    for i in 20..40 {
        broker
            .publish(LineKind::Stdout, &format!("line {i}"))
            .await
            .expect("publish");
    }
    broker.finish(TerminalStatus::Success).await.expect("finish");

    let lines = subscription.collect().await;
    let observed: String = lines[..lines.len() - 2].concat();
    let final_record = broker.contents().await.expect("contents");
    assert_eq!(observed, final_record);
    assert_eq!(lines[lines.len() - 2], "STATUS: SUCCESS");
    assert_eq!(lines[lines.len() - 1], CLOSE_LINE);
}

#[tokio::test]
async fn subscriber_after_finish_gets_full_replay() {
    let dir = tempfile::tempdir().expect("tempdir");
    let broker = broker_in(&dir).await;

    broker.publish(LineKind::Stdout, "only").await.expect("publish");
    broker.finish(TerminalStatus::Success).await.expect("finish");

    let subscription = broker
        .subscribe(SubscribeMode::FromStart)
        .await
        .expect("subscribe");
    assert_eq!(
        subscription.collect().await,
        vec!["only\n", "STATUS: SUCCESS", CLOSE_LINE]
    );
}

#[tokio::test]
async fn slow_subscriber_is_cut_off_without_affecting_the_record() {
    let dir = tempfile::tempdir().expect("tempdir");
    let broker = broker_in(&dir).await;

    let mut subscription = broker
        .subscribe(SubscribeMode::Live)
        .await
        .expect("subscribe");
    // Overflow the bounded per-subscriber queue without consuming.
    for i in 0..600 {
        broker
            .publish(LineKind::Stdout, &format!("flood {i}"))
            .await
            .expect("publish");
    }

    let mut saw_cutoff = false;
    while let Some(line) = subscription.next().await {
        if line == SLOW_CONSUMER_LINE {
            saw_cutoff = true;
            // The cut-off line terminates the sequence.
            assert_eq!(subscription.next().await, None);
            break;
        }
    }
    assert!(saw_cutoff, "expected the slow-consumer cutoff line");

    // The durable record is unaffected.
    let contents = broker.contents().await.expect("contents");
    assert_eq!(contents.lines().count(), 600);
    assert!(contents.ends_with("flood 599\n"));
}

#[tokio::test]
async fn lines_after_finish_are_dropped() {
    let dir = tempfile::tempdir().expect("tempdir");
    let broker = broker_in(&dir).await;

    broker.publish(LineKind::Stdout, "kept").await.expect("publish");
    broker.finish(TerminalStatus::Success).await.expect("finish");
    broker.publish(LineKind::Stdout, "late").await.expect("publish");

    assert_eq!(broker.contents().await.expect("contents"), "kept\n");
}

#[tokio::test]
async fn replay_covers_executions_without_a_live_broker() {
    let subscription = replay_subscription("a\nERROR: b\n", TerminalStatus::Failure);
    assert_eq!(
        subscription.collect().await,
        vec!["a\n", "ERROR: b\n", "STATUS: FAILURE", CLOSE_LINE]
    );
}
