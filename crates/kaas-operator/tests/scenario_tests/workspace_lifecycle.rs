//! Stories about a workspace's virtual cluster from creation to teardown

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use k8s_openapi::api::core::v1::Node;
use tokio_util::sync::CancellationToken;

use kaas_common::model::{DedicatedNodeConfig, TaskKind, TaskPayload, TaskStatus, WorkspaceStatus};
use kaas_common::naming::{DEDICATED_POOL_LABEL, DEDICATED_TAINT_KEY};
use kaas_common::{Error, ErrorCategory};
use kaas_tasks::{Disposition, EngineConfig};

use super::fakes::node;
use super::harness::{immediate_retries, Harness};

const ZONE_LABEL: &str = "topology.kubernetes.io/zone";

fn zone_a_nodes(count: u32) -> DedicatedNodeConfig {
    DedicatedNodeConfig {
        count,
        instance_class: "m5.xlarge".to_string(),
        node_selector: BTreeMap::from([(ZONE_LABEL.to_string(), "a".to_string())]),
        taints: Vec::new(),
    }
}

fn host_nodes() -> Vec<Node> {
    vec![
        node("n1", "m5.xlarge", &[(ZONE_LABEL, "a")]),
        node("n2", "m5.xlarge", &[(ZONE_LABEL, "a")]),
        node("n3", "m5.xlarge", &[(ZONE_LABEL, "b")]),
    ]
}

fn scheduling_selector(h: &Harness, workspace_id: &str) -> serde_json::Value {
    let ns = format!("vc-{workspace_id}");
    let vc = h.host.virtual_cluster(&ns, &ns).expect("virtual cluster applied");
    let values: serde_json::Value =
        serde_yaml::from_str(&vc.spec.helm_release.values).expect("values parse");
    values["controlPlane"]["statefulSet"]["scheduling"]["nodeSelector"].clone()
}

// =============================================================================
// Creation
// =============================================================================

/// Story: a new workspace is provisioned, gets its hierarchy controller, and
/// only reports an instance name once it is actually serving.
#[tokio::test]
async fn story_instance_name_appears_exactly_when_running() {
    let h = Harness::new(Vec::new());
    let task_id = h.submit_create("acme", "standard", None).expect("submit");

    let pending = h.workspace("acme");
    assert_eq!(pending.status, WorkspaceStatus::PendingCreation);
    assert_eq!(pending.instance_name, None);

    let first = h.step().await.expect("create task");
    assert_eq!(first.task_id, task_id);
    assert_eq!(first.disposition, Disposition::Completed);
    let configuring = h.workspace("acme");
    assert_eq!(
        configuring.status,
        WorkspaceStatus::ConfiguringHierarchyController
    );
    assert_eq!(configuring.instance_name, None);
    assert!(h.host.has_namespace("vc-acme"));
    assert!(h.host.quota("vc-acme").is_some());
    assert!(h.host.virtual_cluster("vc-acme", "vc-acme").is_some());

    let second = h.step().await.expect("setup task");
    assert_eq!(second.kind, TaskKind::SetupHierarchyController);
    assert_eq!(second.disposition, Disposition::Completed);
    let running = h.workspace("acme");
    assert_eq!(running.status, WorkspaceStatus::Running);
    assert_eq!(running.instance_name.as_deref(), Some("vc-acme"));
    assert!(h.connector.cluster("acme").controller_image().is_some());

    assert!(h.step().await.is_none());
    let status = h
        .control_plane()
        .get_task_status(&task_id)
        .expect("task status");
    assert_eq!(status.task.status, TaskStatus::CompletedSuccess);
    let result = status.task.result.expect("create result");
    assert_eq!(result["status"], "CONFIGURING_HIERARCHY_CONTROLLER");
}

/// Story: requests that can never succeed are refused up front and leave no
/// task behind.
#[tokio::test]
async fn story_invalid_creations_never_reach_the_queue() {
    let h = Harness::new(host_nodes());
    h.submit_create("acme", "standard", None).expect("first create");

    let duplicate = h
        .submit_create("acme", "standard", None)
        .expect_err("duplicate id");
    assert_eq!(duplicate.category(), ErrorCategory::Permanent);

    let shared_plan = h
        .submit_create("globex", "starter", Some(zone_a_nodes(1)))
        .expect_err("dedicated nodes on a shared plan");
    assert!(matches!(shared_plan, Error::Validation { .. }));
    assert!(h.store.get_workspace("globex").expect("read").is_none());

    let bad_id = h
        .submit_create("Not_A_Label", "standard", None)
        .expect_err("invalid id");
    assert!(matches!(bad_id, Error::Validation { .. }));

    let unknown_plan = h
        .submit_create("initech", "platinum", None)
        .expect_err("unknown plan");
    assert!(!unknown_plan.is_retryable());

    assert_eq!(
        h.store
            .count_active_tasks("acme", TaskKind::CreateWorkspace)
            .expect("count"),
        1
    );
    assert_eq!(
        h.store
            .count_active_tasks("globex", TaskKind::CreateWorkspace)
            .expect("count"),
        0
    );
}

/// Story: the first provisioning attempt reserves nodes and then trips on a
/// flaky quota webhook. The retry and a later redelivery of the finished
/// create converge on the same host state: one virtual cluster, each node
/// patched once.
#[tokio::test]
async fn story_repeated_provisioning_leaves_the_host_unchanged() {
    let h = Harness::with_engine(host_nodes(), immediate_retries());
    h.host.fail_quota(1);
    let task_id = h
        .submit_create("acme", "professional", Some(zone_a_nodes(2)))
        .expect("submit");

    let reports = h.drain().await;
    assert_eq!(reports[0].disposition, Disposition::Retrying);
    assert_eq!(h.workspace("acme").status, WorkspaceStatus::Running);
    assert_eq!(h.host.virtual_cluster_count(), 1);
    assert_eq!(h.host.write_counts(), (1, 2));
    let labels_before: Vec<_> = ["n1", "n2", "n3"]
        .iter()
        .map(|n| h.host.node_labels(n))
        .collect();

    let original = h.store.get_task(&task_id).expect("read").expect("task");
    h.control_plane()
        .queue()
        .enqueue(original.payload)
        .expect("redeliver");
    let reports = h.drain().await;
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].disposition, Disposition::Completed);

    assert_eq!(h.workspace("acme").status, WorkspaceStatus::Running);
    assert_eq!(h.host.virtual_cluster_count(), 1);
    assert_eq!(h.host.write_counts(), (1, 2));
    let labels_after: Vec<_> = ["n1", "n2", "n3"]
        .iter()
        .map(|n| h.host.node_labels(n))
        .collect();
    assert_eq!(labels_before, labels_after);
}

// =============================================================================
// Resizing
// =============================================================================

/// Story: a running workspace asks for two dedicated nodes. It passes through
/// UPDATING_NODES while the virtual cluster is re-applied and comes back to
/// RUNNING pinned to the reserved nodes.
#[tokio::test]
async fn story_adding_dedicated_nodes_passes_through_updating_nodes() {
    let h = Harness::new(host_nodes());
    h.running_workspace("acme", "professional").await;
    h.host.watch_status(h.store.clone(), "acme");

    h.control_plane()
        .submit_task(TaskPayload::UpdateDedicatedNodes {
            workspace_id: "acme".to_string(),
            dedicated_nodes: Some(zone_a_nodes(2)),
        })
        .expect("submit update");
    let reports = h.drain().await;
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].disposition, Disposition::Completed);

    assert_eq!(h.host.statuses_at_apply(), vec![WorkspaceStatus::UpdatingNodes]);
    let ws = h.workspace("acme");
    assert_eq!(ws.status, WorkspaceStatus::Running);
    assert_eq!(ws.dedicated_nodes, Some(zone_a_nodes(2)));
    let selector = ws.node_selector();
    assert_eq!(selector.get(DEDICATED_POOL_LABEL).map(String::as_str), Some("acme"));
    assert_eq!(selector.get(ZONE_LABEL).map(String::as_str), Some("a"));

    let rendered = scheduling_selector(&h, "acme");
    assert_eq!(rendered[DEDICATED_POOL_LABEL], "acme");
    assert_eq!(rendered[ZONE_LABEL], "a");

    for name in ["n1", "n2"] {
        assert_eq!(
            h.host.node_labels(name).get(DEDICATED_POOL_LABEL).map(String::as_str),
            Some("acme")
        );
        assert!(h
            .host
            .node_taint_keys(name)
            .contains(&DEDICATED_TAINT_KEY.to_string()));
    }
    assert!(!h.host.node_labels("n3").contains_key(DEDICATED_POOL_LABEL));
}

/// Story: moving to a plan without dedicated nodes gives the reserved nodes
/// back to the shared pool.
#[tokio::test]
async fn story_downgrade_to_shared_plan_releases_nodes() {
    let h = Harness::new(host_nodes());
    h.running_workspace("acme", "professional").await;
    h.control_plane()
        .submit_task(TaskPayload::UpdateDedicatedNodes {
            workspace_id: "acme".to_string(),
            dedicated_nodes: Some(zone_a_nodes(1)),
        })
        .expect("reserve");
    h.drain().await;
    assert!(h.host.node_labels("n1").contains_key(DEDICATED_POOL_LABEL));

    h.host.watch_status(h.store.clone(), "acme");
    h.control_plane()
        .submit_task(TaskPayload::UpdatePlan {
            workspace_id: "acme".to_string(),
            plan: "standard".to_string(),
            dedicated_nodes: Some(zone_a_nodes(1)),
        })
        .expect("downgrade");
    h.drain().await;

    assert_eq!(h.host.statuses_at_apply(), vec![WorkspaceStatus::UpdatingPlan]);
    let ws = h.workspace("acme");
    assert_eq!(ws.status, WorkspaceStatus::Running);
    assert_eq!(ws.plan, "standard");
    assert_eq!(ws.dedicated_nodes, None);
    assert!(!h.host.node_labels("n1").contains_key(DEDICATED_POOL_LABEL));
    assert!(!h
        .host
        .node_taint_keys("n1")
        .contains(&DEDICATED_TAINT_KEY.to_string()));
    assert_eq!(scheduling_selector(&h, "acme"), serde_json::Value::Null);
}

// =============================================================================
// Failure and teardown
// =============================================================================

/// Story: the host keeps rejecting the plan quota. The create task burns
/// through its attempts, the workspace lands in ERROR with the last error, an
/// alert is raised, and only deletion is still accepted.
#[tokio::test]
async fn story_exhausted_create_marks_workspace_error() {
    let h = Harness::with_engine(Vec::new(), immediate_retries());
    h.host.fail_quota(u32::MAX);
    let task_id = h.submit_create("acme", "standard", None).expect("submit");

    let reports = h.drain().await;
    let max = TaskKind::CreateWorkspace.default_max_retries() as usize;
    assert_eq!(reports.len(), max);
    assert!(reports[..max - 1]
        .iter()
        .all(|r| r.disposition == Disposition::Retrying));
    assert_eq!(reports[max - 1].disposition, Disposition::Failed);

    let ws = h.workspace("acme");
    assert_eq!(ws.status, WorkspaceStatus::Error);
    assert!(ws.last_error.as_deref().unwrap_or_default().contains("quota"));
    assert_eq!(ws.instance_name, None);

    let status = h
        .control_plane()
        .get_task_status(&task_id)
        .expect("task status");
    assert_eq!(status.task.status, TaskStatus::CompletedFailure);
    assert_eq!(
        status
            .attempts
            .iter()
            .filter(|a| a.outcome == "failure")
            .count(),
        max
    );

    let alerts = h.store.list_alerts().expect("alerts");
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].owner_id, "acme");
    assert_eq!(alerts[0].task_id.as_deref(), Some(task_id.as_str()));

    let update = h.control_plane().submit_task(TaskPayload::UpdatePlan {
        workspace_id: "acme".to_string(),
        plan: "professional".to_string(),
        dedicated_nodes: None,
    });
    assert!(matches!(update, Err(Error::Validation { .. })));

    h.control_plane()
        .submit_task(TaskPayload::DeleteWorkspace {
            workspace_id: "acme".to_string(),
        })
        .expect("deletion is still accepted");
    h.drain().await;
    assert!(h.store.get_workspace("acme").expect("read").is_none());
}

/// Story: a transient quota failure is retried and the workspace still comes
/// up.
#[tokio::test]
async fn story_transient_failure_is_retried_to_success() {
    let h = Harness::with_engine(Vec::new(), immediate_retries());
    h.host.fail_quota(2);
    h.submit_create("acme", "standard", None).expect("submit");

    let reports = h.drain().await;
    let retries = reports
        .iter()
        .filter(|r| r.disposition == Disposition::Retrying)
        .count();
    assert_eq!(retries, 2);
    assert_eq!(h.workspace("acme").status, WorkspaceStatus::Running);
}

/// Story: deleting a running workspace removes the virtual cluster, its host
/// namespace and finally the workspace row.
#[tokio::test]
async fn story_deleted_workspace_leaves_nothing_behind() {
    let h = Harness::new(Vec::new());
    h.running_workspace("acme", "standard").await;

    h.control_plane()
        .submit_task(TaskPayload::DeleteWorkspace {
            workspace_id: "acme".to_string(),
        })
        .expect("submit delete");
    let reports = h.drain().await;
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].disposition, Disposition::Completed);

    assert!(h.host.virtual_cluster("vc-acme", "vc-acme").is_none());
    assert!(!h.host.has_namespace("vc-acme"));
    let gone = h.control_plane().get_workspace("acme").expect_err("removed");
    assert!(matches!(gone, Error::NotFound { .. }));
}

/// Story: a tenant asks for a bigger plan and deletes the workspace a moment
/// later. Several workers race both tasks; once the workspace is DELETING it
/// never comes back, and it ends up gone with nothing left on the host.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn story_racing_update_and_delete_only_move_forward() {
    let h = Harness::with_engine(
        host_nodes(),
        EngineConfig {
            workers: 2,
            poll_interval: Duration::from_millis(5),
            lock_retry_delay: Duration::from_millis(5),
            ..immediate_retries()
        },
    );
    h.running_workspace("acme", "standard").await;

    h.control_plane()
        .submit_task(TaskPayload::UpdatePlan {
            workspace_id: "acme".to_string(),
            plan: "professional".to_string(),
            dedicated_nodes: None,
        })
        .expect("submit update");
    let delete_id = h
        .control_plane()
        .submit_task(TaskPayload::DeleteWorkspace {
            workspace_id: "acme".to_string(),
        })
        .expect("submit delete");

    let cancel = CancellationToken::new();
    let engine = tokio::spawn(Arc::clone(&h.components.engine).run(cancel.clone()));

    let deadline = Instant::now() + Duration::from_secs(10);
    let mut seen: Vec<Option<WorkspaceStatus>> = Vec::new();
    loop {
        let status = h.store.get_workspace("acme").expect("read").map(|ws| ws.status);
        if seen.last() != Some(&status) {
            seen.push(status);
        }
        if status.is_none() {
            break;
        }
        assert!(Instant::now() < deadline, "workspace never went away: {seen:?}");
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    cancel.cancel();
    engine.await.expect("engine task").expect("engine");

    if let Some(at) = seen
        .iter()
        .position(|s| *s == Some(WorkspaceStatus::Deleting))
    {
        assert!(
            seen[at..]
                .iter()
                .all(|s| matches!(s, Some(WorkspaceStatus::Deleting) | None)),
            "workspace left DELETING: {seen:?}"
        );
    }
    let delete = h.store.get_task(&delete_id).expect("read").expect("task");
    assert_eq!(delete.status, TaskStatus::CompletedSuccess);
    assert_eq!(h.host.virtual_cluster_count(), 0);
    assert!(!h.host.has_namespace("vc-acme"));
}
