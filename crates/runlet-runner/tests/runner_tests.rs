//! Child lifecycle tests driven through `/bin/sh` scripts.

#![cfg(unix)]

use std::path::PathBuf;
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use runlet_runner::{run, OutputBroker, RunSpec, RunnerError, SubscribeMode, TerminalStatus};
use tokio_util::sync::CancellationToken;

struct Harness {
    _dir: tempfile::TempDir,
    spec: RunSpec,
    broker: OutputBroker,
}

async fn harness(script: &str) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let script_path = dir.path().join("script.sh");
    std::fs::write(&script_path, script).expect("write script");
    let broker = OutputBroker::create(dir.path().join("output_1.txt"))
        .await
        .expect("broker");
    let spec = RunSpec {
        interpreter: PathBuf::from("/bin/sh"),
        interpreter_args: Vec::new(),
        script: script_path,
        workdir: dir.path().to_path_buf(),
        timeout: Duration::from_secs(30),
        idle_timeout: Duration::from_secs(1),
    };
    Harness {
        _dir: dir,
        spec,
        broker,
    }
}

#[tokio::test]
async fn clean_exit_captures_stdout() {
    let h = harness("echo hello\n").await;
    let outcome = run(&h.spec, &h.broker, &CancellationToken::new())
        .await
        .expect("run");

    assert!(outcome.success());
    assert_eq!(outcome.exit_code, 0);
    assert!(!outcome.timed_out);
    assert_eq!(h.broker.contents().await.expect("contents"), "hello\n");
}

#[tokio::test]
async fn stderr_lines_are_classified() {
    let h = harness("echo out\necho err 1>&2\n").await;
    run(&h.spec, &h.broker, &CancellationToken::new())
        .await
        .expect("run");

    let contents = h.broker.contents().await.expect("contents");
    assert!(contents.contains("out\n"));
    assert!(contents.contains("ERROR: err\n"));
}

#[tokio::test]
async fn nonzero_exit_appends_footer_after_drain() {
    let h = harness("echo last words\nexit 2\n").await;
    let outcome = run(&h.spec, &h.broker, &CancellationToken::new())
        .await
        .expect("run");

    assert!(!outcome.success());
    assert_eq!(outcome.exit_code, 2);
    assert_eq!(
        h.broker.contents().await.expect("contents"),
        "last words\nError: Script exited with return code 2\n"
    );
}

#[tokio::test]
async fn stdout_order_is_preserved() {
    let h = harness("printf 'a\\n'\nsleep 0.05\nprintf 'b\\n'\nsleep 0.05\nprintf 'c\\n'\n").await;
    let subscription = h
        .broker
        .subscribe(SubscribeMode::FromStart)
        .await
        .expect("subscribe");
    let outcome = run(&h.spec, &h.broker, &CancellationToken::new())
        .await
        .expect("run");
    assert!(outcome.success());
    h.broker
        .finish(TerminalStatus::Success)
        .await
        .expect("finish");

    assert_eq!(
        subscription.collect().await,
        vec!["a\n", "b\n", "c\n", "STATUS: SUCCESS", "Execution finished."]
    );
}

#[tokio::test]
async fn wall_clock_timeout_kills_the_child() {
    let mut h = harness("exec sleep 600\n").await;
    h.spec.timeout = Duration::from_secs(1);

    let started = Instant::now();
    let outcome = run(&h.spec, &h.broker, &CancellationToken::new())
        .await
        .expect("run");
    let elapsed = started.elapsed();

    assert!(outcome.timed_out);
    assert!(!outcome.cancelled);
    assert_eq!(outcome.exit_code, -1);
    // Timeout plus the stop-signal grace, with margin: the child must be
    // gone well within five seconds of the deadline.
    assert!(elapsed < Duration::from_secs(6), "took {elapsed:?}");
    // No footer for a timed-out run; the error lands on the execution row.
    assert_eq!(h.broker.contents().await.expect("contents"), "");
}

#[tokio::test]
async fn cancellation_stops_the_child() {
    let h = harness("exec sleep 600\n").await;
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let outcome = run(&h.spec, &h.broker, &cancel).await.expect("run");

    assert!(outcome.cancelled);
    assert!(!outcome.timed_out);
    assert_eq!(outcome.exit_code, -1);
    assert!(started.elapsed() < Duration::from_secs(6));
}

#[tokio::test]
async fn missing_interpreter_is_a_start_error() {
    let mut h = harness("echo unreachable\n").await;
    h.spec.interpreter = PathBuf::from("/nonexistent/interpreter");

    let err = run(&h.spec, &h.broker, &CancellationToken::new())
        .await
        .expect_err("spawn must fail");
    assert!(matches!(err, RunnerError::Spawn(_)));
}

#[tokio::test]
async fn output_flushed_before_child_exits_is_observable() {
    let h = harness("printf 'partial output\\n'\nsleep 0.2\n").await;
    let cancel_token = CancellationToken::new();
    let done = run(&h.spec, &h.broker, &cancel_token);
    let contents = async {
        // Poll the durable record while the child is still sleeping.
        for _ in 0..40 {
            let contents = h.broker.contents().await.expect("contents");
            if !contents.is_empty() {
                return contents;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        String::new()
    };
    let (outcome, early_contents) = tokio::join!(done, contents);
    assert!(outcome.expect("run").success());
    assert_eq!(early_contents, "partial output\n");
}
