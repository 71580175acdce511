//! Stories about operators inspecting and retrying tasks

use kaas_common::model::{TaskKind, TaskPayload, TaskStatus, WorkspaceStatus};
use kaas_common::Error;
use kaas_store::TaskFilter;
use kaas_tasks::Disposition;

use super::harness::{immediate_retries, Harness};

fn submit_event(h: &Harness, event_id: &str) -> String {
    h.control_plane()
        .submit_task(TaskPayload::ExternalWebhookApply {
            source: "billing".to_string(),
            event_id: event_id.to_string(),
            body: serde_json::json!({ "invoice": event_id }),
        })
        .expect("submit event")
}

/// Story: the billing sink is down long enough for an event to exhaust its
/// attempts. An operator finds it among the failed tasks, waits for the sink
/// to recover and retries it; the event is applied exactly once.
#[tokio::test]
async fn story_failed_event_is_found_and_retried() {
    let h = Harness::with_engine(Vec::new(), immediate_retries());
    h.applier.set_unavailable(true);
    let failed_id = submit_event(&h, "inv-1");

    let reports = h.drain().await;
    let max = TaskKind::ExternalWebhookApply.default_max_retries() as usize;
    assert_eq!(reports.len(), max);
    assert_eq!(reports[max - 1].disposition, Disposition::Failed);

    let failed = h
        .control_plane()
        .list_tasks(TaskFilter {
            kind: Some(TaskKind::ExternalWebhookApply),
            status: Some(TaskStatus::CompletedFailure),
            ..Default::default()
        })
        .expect("list");
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, failed_id);

    let early = h
        .control_plane()
        .retry_task(&submit_event(&h, "inv-2"))
        .expect_err("pending tasks are not retried");
    assert!(matches!(early, Error::Validation { .. }));

    h.applier.set_unavailable(false);
    let retried = h.control_plane().retry_task(&failed_id).expect("retry");
    assert_eq!(retried.status, TaskStatus::Pending);
    assert_eq!(retried.retry_count, 0);

    let reports = h.drain().await;
    assert!(reports
        .iter()
        .all(|r| r.disposition == Disposition::Completed));
    let status = h
        .control_plane()
        .get_task_status(&failed_id)
        .expect("status");
    assert_eq!(status.task.status, TaskStatus::CompletedSuccess);
    assert_eq!(
        h.applier
            .events()
            .iter()
            .filter(|(_, id)| id == "inv-1")
            .count(),
        1
    );
    assert!(h
        .control_plane()
        .list_tasks(TaskFilter {
            status: Some(TaskStatus::CompletedFailure),
            ..Default::default()
        })
        .expect("list")
        .is_empty());
}

/// Story: a create that failed for good left its workspace in ERROR. The
/// create cannot be retried into a broken workspace; the listing still shows
/// it next to the workspace's other tasks.
#[tokio::test]
async fn story_failed_create_is_not_retried_into_an_error_workspace() {
    let h = Harness::with_engine(Vec::new(), immediate_retries());
    h.host.fail_quota(u32::MAX);
    let create_id = h.submit_create("acme", "standard", None).expect("submit");
    h.drain().await;
    assert_eq!(h.workspace("acme").status, WorkspaceStatus::Error);

    let refused = h
        .control_plane()
        .retry_task(&create_id)
        .expect_err("workspace is in ERROR");
    assert!(matches!(refused, Error::Validation { .. }));
    let missing = h
        .control_plane()
        .retry_task("no-such-task")
        .expect_err("unknown task");
    assert!(matches!(missing, Error::NotFound { .. }));

    let listed = h
        .control_plane()
        .list_tasks(TaskFilter {
            workspace_id: Some("acme".to_string()),
            ..Default::default()
        })
        .expect("list");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, create_id);
    assert_eq!(listed[0].status, TaskStatus::CompletedFailure);
}
