//! Stories about projects inside a running workspace

use kaas_common::model::{ProjectStatus, TaskKind, TaskPayload};
use kaas_common::Error;
use kaas_tasks::Disposition;

use super::harness::Harness;

fn create_root(h: &Harness, project_id: &str, name: &str) {
    h.control_plane()
        .submit_task(TaskPayload::CreateRootProject {
            workspace_id: "acme".to_string(),
            project_id: project_id.to_string(),
            name: name.to_string(),
        })
        .expect("submit root project");
}

fn create_child(h: &Harness, project_id: &str, parent_id: &str, name: &str) {
    h.control_plane()
        .submit_task(TaskPayload::CreateProjectAnchor {
            workspace_id: "acme".to_string(),
            project_id: project_id.to_string(),
            parent_project_id: parent_id.to_string(),
            name: name.to_string(),
        })
        .expect("submit child project");
}

fn delete(h: &Harness, project_id: &str, name: &str) -> kaas_common::Result<String> {
    h.control_plane().submit_task(TaskPayload::DeleteProjectAnchor {
        workspace_id: "acme".to_string(),
        project_id: project_id.to_string(),
        name: name.to_string(),
    })
}

/// Story: a team builds a two-level hierarchy, then tries to delete the
/// parent first. The request is refused without touching the queue; deleting
/// bottom-up works.
#[tokio::test]
async fn story_parent_with_children_cannot_be_deleted() {
    let h = Harness::new(Vec::new());
    h.running_workspace("acme", "standard").await;

    create_root(&h, "p-root", "team-a");
    h.drain().await;
    create_child(&h, "p-dev", "p-root", "team-a-dev");
    let reports = h.drain().await;
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].disposition, Disposition::Completed);

    let vc = h.connector.cluster("acme");
    assert!(vc.has_namespace("team-a"));
    assert!(vc.has_anchor("team-a", "team-a-dev"));
    let child = h.control_plane().get_project("p-dev").expect("child");
    assert_eq!(child.parent_id.as_deref(), Some("p-root"));
    assert_eq!(child.anchor_name.as_deref(), Some("team-a-dev"));
    assert_eq!(child.status, ProjectStatus::Active);

    let refused = delete(&h, "p-root", "team-a").expect_err("parent has a child");
    assert!(matches!(refused, Error::Validation { .. }));
    assert_eq!(
        h.store
            .count_active_tasks("acme", TaskKind::DeleteProjectAnchor)
            .expect("count"),
        0
    );
    assert_eq!(
        h.control_plane().get_project("p-root").expect("root").status,
        ProjectStatus::Active
    );

    delete(&h, "p-dev", "team-a-dev").expect("delete child");
    h.drain().await;
    assert!(!vc.has_anchor("team-a", "team-a-dev"));
    assert!(!vc.has_namespace("team-a-dev"));

    delete(&h, "p-root", "team-a").expect("delete root");
    h.drain().await;
    assert!(!vc.has_namespace("team-a"));
    let gone = h.control_plane().get_project("p-root").expect_err("deleted");
    assert!(matches!(gone, Error::NotFound { .. }));
}

/// Story: namespace names are unique within a workspace, and children can
/// only hang off projects that exist.
#[tokio::test]
async fn story_project_creation_is_validated_up_front() {
    let h = Harness::new(Vec::new());
    h.running_workspace("acme", "standard").await;
    create_root(&h, "p-root", "team-a");
    h.drain().await;

    let taken = h.control_plane().submit_task(TaskPayload::CreateRootProject {
        workspace_id: "acme".to_string(),
        project_id: "p-other".to_string(),
        name: "team-a".to_string(),
    });
    assert!(matches!(taken, Err(Error::Validation { .. })));

    let reserved = h.control_plane().submit_task(TaskPayload::CreateRootProject {
        workspace_id: "acme".to_string(),
        project_id: "p-sys".to_string(),
        name: "kube-system".to_string(),
    });
    assert!(matches!(reserved, Err(Error::Validation { .. })));

    let orphan = h.control_plane().submit_task(TaskPayload::CreateProjectAnchor {
        workspace_id: "acme".to_string(),
        project_id: "p-orphan".to_string(),
        parent_project_id: "p-missing".to_string(),
        name: "orphan".to_string(),
    });
    assert!(matches!(orphan, Err(Error::NotFound { .. })));
}

/// Story: root namespaces can be nested after the fact, but never into a
/// cycle, and anchored children keep their parent.
#[tokio::test]
async fn story_root_projects_can_be_reparented_without_cycles() {
    let h = Harness::new(Vec::new());
    h.running_workspace("acme", "standard").await;
    create_root(&h, "p-a", "team-a");
    create_root(&h, "p-b", "team-b");
    h.drain().await;

    h.control_plane()
        .submit_task(TaskPayload::SetProjectParent {
            workspace_id: "acme".to_string(),
            project_id: "p-b".to_string(),
            name: "team-b".to_string(),
            new_parent_id: Some("p-a".to_string()),
        })
        .expect("nest team-b under team-a");
    h.drain().await;
    assert_eq!(
        h.control_plane().get_project("p-b").expect("p-b").parent_id.as_deref(),
        Some("p-a")
    );
    assert_eq!(
        h.connector.cluster("acme").parent_of("team-b").as_deref(),
        Some("team-a")
    );

    let cycle = h.control_plane().submit_task(TaskPayload::SetProjectParent {
        workspace_id: "acme".to_string(),
        project_id: "p-a".to_string(),
        name: "team-a".to_string(),
        new_parent_id: Some("p-b".to_string()),
    });
    assert!(matches!(cycle, Err(Error::Validation { .. })));

    create_child(&h, "p-dev", "p-a", "team-a-dev");
    h.drain().await;
    let anchored = h.control_plane().submit_task(TaskPayload::SetProjectParent {
        workspace_id: "acme".to_string(),
        project_id: "p-dev".to_string(),
        name: "team-a-dev".to_string(),
        new_parent_id: None,
    });
    assert!(matches!(anchored, Err(Error::Validation { .. })));
}
