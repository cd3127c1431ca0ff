//! Ledger behavior tests against an in-memory database.

use pretty_assertions::assert_eq;
use runlet_store::{ExecutionStatus, Store, INTERRUPTED_BY_NEW_REQUEST};

async fn store_with_script(active: bool) -> (Store, i64) {
    let store = Store::connect_in_memory().await.expect("connect");
    let script = store
        .insert_script("demo", None, "print('hi')\n", active)
        .await
        .expect("insert script");
    (store, script.id)
}

#[tokio::test]
async fn begin_execution_creates_pending_row() {
    let (store, script_id) = store_with_script(true).await;

    let execution = store.begin_execution(script_id, None).await.expect("begin");
    assert_eq!(execution.script_id, script_id);
    assert_eq!(execution.status, ExecutionStatus::Pending);
    assert_eq!(execution.schedule_id, None);
    assert!(execution.completed_at.is_none());
    assert!(execution.log_output.is_none());
}

#[tokio::test]
async fn begin_execution_displaces_live_execution() {
    let (store, script_id) = store_with_script(true).await;

    let first = store.begin_execution(script_id, None).await.expect("first");
    assert!(store.mark_running(first.id).await.expect("running"));

    let second = store
        .begin_execution(script_id, None)
        .await
        .expect("second");
    assert_ne!(first.id, second.id);

    let first = store
        .get_execution(first.id)
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(first.status, ExecutionStatus::Failure);
    assert_eq!(
        first.error_message.as_deref(),
        Some(INTERRUPTED_BY_NEW_REQUEST)
    );
    assert!(first.completed_at.is_some());

    // Only the new execution is live.
    let running = store.get_running_for(script_id).await.expect("running");
    assert_eq!(running.map(|e| e.id), Some(second.id));
}

#[tokio::test]
async fn terminal_transitions_are_guarded() {
    let (store, script_id) = store_with_script(true).await;

    let execution = store.begin_execution(script_id, None).await.expect("begin");
    assert!(store.mark_running(execution.id).await.expect("run"));
    assert!(store
        .mark_success(execution.id, "hello\n")
        .await
        .expect("success"));

    // A late failure report loses the race and is a no-op.
    assert!(!store
        .mark_failure(execution.id, None, "late")
        .await
        .expect("late failure"));
    let row = store
        .get_execution(execution.id)
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(row.status, ExecutionStatus::Success);
    assert_eq!(row.log_output.as_deref(), Some("hello\n"));
    assert_eq!(row.error_message, None);

    // mark_running only applies to PENDING rows.
    assert!(!store.mark_running(execution.id).await.expect("rerun"));
}

#[tokio::test]
async fn completed_at_set_iff_terminal() {
    let (store, script_id) = store_with_script(true).await;

    let execution = store.begin_execution(script_id, None).await.expect("begin");
    let pending = store
        .get_execution(execution.id)
        .await
        .expect("get")
        .expect("row");
    assert!(pending.completed_at.is_none());

    store.mark_running(execution.id).await.expect("run");
    let running = store
        .get_execution(execution.id)
        .await
        .expect("get")
        .expect("row");
    assert!(running.completed_at.is_none());

    store
        .mark_failure(execution.id, Some("boom\n"), "Script exited with return code 2")
        .await
        .expect("fail");
    let failed = store
        .get_execution(execution.id)
        .await
        .expect("get")
        .expect("row");
    assert!(failed.completed_at.is_some());
    assert!(failed.completed_at.unwrap() >= failed.started_at);
}

#[tokio::test]
async fn recovery_sweep_closes_every_live_execution() {
    let store = Store::connect_in_memory().await.expect("connect");
    let mut ids = Vec::new();
    for name in ["a", "b", "c"] {
        let script = store
            .insert_script(name, None, "pass\n", true)
            .await
            .expect("script");
        let execution = store
            .begin_execution(script.id, None)
            .await
            .expect("begin");
        ids.push(execution.id);
    }
    store.mark_running(ids[1]).await.expect("run");

    let swept = store
        .fail_all_unterminated("Execution interrupted by server restart")
        .await
        .expect("sweep");
    assert_eq!(swept, 3);
    assert!(store
        .scan_unterminated()
        .await
        .expect("scan")
        .is_empty());

    for id in ids {
        let row = store.get_execution(id).await.expect("get").expect("row");
        assert_eq!(row.status, ExecutionStatus::Failure);
        assert_eq!(
            row.error_message.as_deref(),
            Some("Execution interrupted by server restart")
        );
    }
}

#[tokio::test]
async fn list_executions_pages_newest_first() {
    let (store, script_id) = store_with_script(true).await;

    let mut ids = Vec::new();
    for i in 0..5 {
        let execution = store.begin_execution(script_id, None).await.expect("begin");
        store
            .mark_success(execution.id, &format!("run {i}\n"))
            .await
            .expect("success");
        ids.push(execution.id);
    }

    let page = store
        .list_executions(script_id, 2, 0)
        .await
        .expect("page 0");
    assert_eq!(
        page.iter().map(|e| e.id).collect::<Vec<_>>(),
        vec![ids[4], ids[3]]
    );
    let page = store
        .list_executions(script_id, 2, 2)
        .await
        .expect("page 1");
    assert_eq!(
        page.iter().map(|e| e.id).collect::<Vec<_>>(),
        vec![ids[2], ids[1]]
    );
}

#[tokio::test]
async fn deleting_script_cascades() {
    let (store, script_id) = store_with_script(true).await;
    store
        .insert_dependency(script_id, "requests", ">=2.0")
        .await
        .expect("dep");
    let schedule = store
        .insert_schedule(script_id, "*/5 * * * *", None)
        .await
        .expect("schedule");
    let execution = store
        .begin_execution(script_id, Some(schedule.id))
        .await
        .expect("begin");

    assert!(store.delete_script(script_id).await.expect("delete"));
    assert!(store
        .get_execution(execution.id)
        .await
        .expect("get")
        .is_none());
    assert!(store
        .list_dependencies(script_id)
        .await
        .expect("deps")
        .is_empty());
    assert!(store
        .get_schedule(schedule.id)
        .await
        .expect("schedule")
        .is_none());
}

#[tokio::test]
async fn deleting_schedule_nulls_execution_reference() {
    let (store, script_id) = store_with_script(true).await;
    let schedule = store
        .insert_schedule(script_id, "0 0 * * *", Some("nightly"))
        .await
        .expect("schedule");
    let execution = store
        .begin_execution(script_id, Some(schedule.id))
        .await
        .expect("begin");
    store
        .mark_success(execution.id, "done\n")
        .await
        .expect("success");

    assert!(store.delete_schedule(schedule.id).await.expect("delete"));
    let row = store
        .get_execution(execution.id)
        .await
        .expect("get")
        .expect("row");
    assert_eq!(row.schedule_id, None);
}

#[tokio::test]
async fn active_schedule_listing_skips_inactive_scripts() {
    let store = Store::connect_in_memory().await.expect("connect");
    let active = store
        .insert_script("on", None, "pass\n", true)
        .await
        .expect("active");
    let inactive = store
        .insert_script("off", None, "pass\n", false)
        .await
        .expect("inactive");
    store
        .insert_schedule(active.id, "* * * * *", None)
        .await
        .expect("schedule a");
    store
        .insert_schedule(inactive.id, "* * * * *", None)
        .await
        .expect("schedule b");

    let schedules = store.list_active_schedules().await.expect("list");
    assert_eq!(schedules.len(), 1);
    assert_eq!(schedules[0].script_id, active.id);
}

#[tokio::test]
async fn installed_version_roundtrip() {
    let (store, script_id) = store_with_script(true).await;
    let dependency = store
        .insert_dependency(script_id, "Requests", "==2.31.0")
        .await
        .expect("dep");
    assert_eq!(dependency.installed_version, None);

    store
        .set_installed_version(dependency.id, Some("2.31.0"))
        .await
        .expect("set");
    let deps = store.list_dependencies(script_id).await.expect("list");
    assert_eq!(deps[0].installed_version.as_deref(), Some("2.31.0"));
}

#[tokio::test]
async fn concurrent_run_requests_serialize_to_one_live_execution() {
    let (store, script_id) = store_with_script(true).await;

    let (a, b) = tokio::join!(
        store.begin_execution(script_id, None),
        store.begin_execution(script_id, None),
    );
    let a = a.expect("first begin");
    let b = b.expect("second begin");
    assert_ne!(a.id, b.id);

    // Whichever committed last owns the script; the other was displaced.
    let survivor = a.id.max(b.id);
    let displaced = a.id.min(b.id);
    let live = store
        .get_running_for(script_id)
        .await
        .expect("running")
        .expect("one live");
    assert_eq!(live.id, survivor);

    let displaced = store
        .get_execution(displaced)
        .await
        .expect("get")
        .expect("row");
    assert_eq!(displaced.status, ExecutionStatus::Failure);
    assert_eq!(
        displaced.error_message.as_deref(),
        Some(INTERRUPTED_BY_NEW_REQUEST)
    );
}

#[tokio::test]
async fn tags_attach_detach_and_cascade() {
    let (store, script_id) = store_with_script(true).await;
    let tag = store.upsert_tag("etl").await.expect("tag");
    // Upsert by name is stable.
    let again = store.upsert_tag("etl").await.expect("tag again");
    assert_eq!(tag.id, again.id);

    store.tag_script(script_id, tag.id).await.expect("attach");
    store.tag_script(script_id, tag.id).await.expect("re-attach");
    let tags = store.list_tags(script_id).await.expect("list");
    assert_eq!(tags.len(), 1);
    assert_eq!(tags[0].name, "etl");

    assert!(store.untag_script(script_id, tag.id).await.expect("detach"));
    assert!(store.list_tags(script_id).await.expect("list").is_empty());

    // Deleting a script clears its tag links but not the tag itself.
    store.tag_script(script_id, tag.id).await.expect("attach");
    store.delete_script(script_id).await.expect("delete");
    assert!(store.list_tags(script_id).await.expect("list").is_empty());
    assert_eq!(store.upsert_tag("etl").await.expect("tag").id, tag.id);
}

#[tokio::test]
async fn file_backed_database_persists_across_connections() {
    let dir = tempfile::tempdir().expect("tempdir");
    let url = format!("sqlite://{}", dir.path().join("ledger.db").display());

    let execution_id = {
        let store = Store::connect(&url).await.expect("connect");
        let script = store
            .insert_script("persisted", None, "pass\n", true)
            .await
            .expect("script");
        store
            .begin_execution(script.id, None)
            .await
            .expect("begin")
            .id
    };

    // A fresh connection sees the prior process's unterminated execution.
    let store = Store::connect(&url).await.expect("reconnect");
    let unterminated = store.scan_unterminated().await.expect("scan");
    assert_eq!(unterminated.len(), 1);
    assert_eq!(unterminated[0].id, execution_id);
}

#[tokio::test]
async fn refused_execution_is_terminal_on_insert() {
    let (store, script_id) = store_with_script(true).await;
    let schedule = store
        .insert_schedule(script_id, "* * * * *", None)
        .await
        .expect("schedule");

    let refused = store
        .record_refused_execution(
            script_id,
            Some(schedule.id),
            "Cannot execute script with uninstalled dependencies",
        )
        .await
        .expect("refused");
    assert_eq!(refused.status, ExecutionStatus::Failure);
    assert!(refused.completed_at.is_some());

    // Terminal on insert, so a live execution can still start afterwards.
    let execution = store.begin_execution(script_id, None).await.expect("begin");
    assert_eq!(execution.status, ExecutionStatus::Pending);
}
