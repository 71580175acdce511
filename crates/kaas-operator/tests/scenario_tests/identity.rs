//! Stories about tenant identity: tokens, kubeconfigs and group trees

use kaas_common::model::{Group, TaskPayload, User};
use kaas_common::{Error, ErrorCategory};
use kaas_identity::kubeconfig::Kubeconfig;

use super::fakes::FAKE_CA_DATA;
use super::harness::{Harness, ENDPOINT_DOMAIN, ISSUER_BASE};

fn group(id: &str, workspace_id: &str, parent: Option<&str>) -> Group {
    Group {
        id: id.to_string(),
        workspace_id: workspace_id.to_string(),
        name: id.to_uppercase(),
        parent_id: parent.map(String::from),
    }
}

/// `g1 <- g2 <- g3 <- g4` in `acme`, with `alice` a direct member of `g4`
fn seed_group_chain(h: &Harness) {
    h.store
        .upsert_user(&User {
            id: "alice".to_string(),
            email: "alice@example.com".to_string(),
        })
        .expect("user");
    h.store.insert_group(&group("g1", "acme", None)).expect("g1");
    h.store.insert_group(&group("g2", "acme", Some("g1"))).expect("g2");
    h.store.insert_group(&group("g3", "acme", Some("g2"))).expect("g3");
    h.store.insert_group(&group("g4", "acme", Some("g3"))).expect("g4");
    h.store.add_group_member("g4", "alice").expect("membership");
}

/// Story: a member of a deeply nested group downloads a kubeconfig. It
/// points at the workspace's public endpoint, trusts the virtual cluster's
/// CA, and carries a token whose groups claim covers every ancestor.
#[tokio::test]
async fn story_tenant_kubeconfig_carries_flattened_groups() {
    let h = Harness::new(Vec::new());
    h.running_workspace("acme", "standard").await;
    seed_group_chain(&h);

    let yaml = h
        .control_plane()
        .generate_kubeconfig("acme", "alice")
        .await
        .expect("kubeconfig");
    let kubeconfig: Kubeconfig = serde_yaml::from_str(&yaml).expect("kubeconfig parses");

    let cluster = &kubeconfig.clusters[0].cluster;
    assert_eq!(cluster.server, format!("https://vc-acme.{ENDPOINT_DOMAIN}"));
    assert_eq!(cluster.certificate_authority_data.as_deref(), Some(FAKE_CA_DATA));

    let provider = &kubeconfig.users[0].user.auth_provider;
    assert_eq!(provider.name, "oidc");
    assert_eq!(provider.config["client-id"], "kaas-acme");
    assert_eq!(
        provider.config["idp-issuer-url"],
        format!("{ISSUER_BASE}/workspaces/acme")
    );
    assert!(!provider.config["id-token"].is_empty());

    let issued = h
        .components
        .identity
        .issue_token("alice", "acme")
        .expect("token");
    assert_eq!(issued.claims.groups, vec!["G1", "G2", "G3", "G4"]);
    assert_eq!(issued.claims.aud, "kaas-acme");
    let jwks = h.components.identity.jwks("acme").expect("jwks");
    assert!(jwks.find(&issued.kid).is_some());
}

/// Story: kubeconfigs are only handed out for serving workspaces, and never
/// to users without membership.
#[tokio::test]
async fn story_kubeconfig_requires_serving_workspace_and_membership() {
    let h = Harness::new(Vec::new());
    h.submit_create("acme", "standard", None).expect("submit");
    seed_group_chain(&h);

    let pending = h
        .control_plane()
        .generate_kubeconfig("acme", "alice")
        .await
        .expect_err("workspace not serving yet");
    assert!(matches!(pending, Error::Validation { .. }));

    h.drain().await;
    h.store
        .upsert_user(&User {
            id: "mallory".to_string(),
            email: "mallory@example.com".to_string(),
        })
        .expect("user");
    let outsider = h
        .control_plane()
        .generate_kubeconfig("acme", "mallory")
        .await
        .expect_err("no membership");
    assert_eq!(outsider.category(), ErrorCategory::Identity);
    assert!(!outsider.is_retryable());
}

/// Story: once a workspace is torn down its issuer stops answering and no
/// further tokens are minted.
#[tokio::test]
async fn story_deleted_workspace_stops_issuing() {
    let h = Harness::new(Vec::new());
    h.running_workspace("acme", "standard").await;
    seed_group_chain(&h);
    assert!(h.components.identity.discovery("acme").is_ok());

    h.control_plane()
        .submit_task(TaskPayload::DeleteWorkspace {
            workspace_id: "acme".to_string(),
        })
        .expect("submit delete");
    h.drain().await;

    let refused = h
        .components
        .identity
        .issue_token("alice", "acme")
        .expect_err("workspace gone");
    assert_eq!(refused.category(), ErrorCategory::Identity);
    assert!(matches!(
        h.components.identity.discovery("acme"),
        Err(Error::NotFound { .. })
    ));
}

/// Story: an administrator reorganises the group tree. Moves that would
/// loop or cross workspaces are refused; a valid move immediately changes
/// the groups claim.
#[tokio::test]
async fn story_group_reparenting_rejects_cycles() {
    let h = Harness::new(Vec::new());
    h.running_workspace("acme", "standard").await;
    h.running_workspace("globex", "standard").await;
    seed_group_chain(&h);
    h.store
        .insert_group(&group("other", "globex", None))
        .expect("foreign group");

    let cycle = h
        .control_plane()
        .reparent_group("g1", Some("g4"))
        .expect_err("g4 descends from g1");
    assert!(matches!(cycle, Error::Validation { .. }));
    let onto_itself = h
        .control_plane()
        .reparent_group("g2", Some("g2"))
        .expect_err("self parent");
    assert!(matches!(onto_itself, Error::Validation { .. }));
    let foreign = h
        .control_plane()
        .reparent_group("g2", Some("other"))
        .expect_err("other workspace");
    assert!(matches!(foreign, Error::Validation { .. }));

    let moved = h
        .control_plane()
        .reparent_group("g3", None)
        .expect("detach g3");
    assert_eq!(moved.parent_id, None);
    let groups = h
        .components
        .identity
        .flattened_groups("alice", "acme")
        .expect("groups");
    assert_eq!(
        groups.into_iter().collect::<Vec<_>>(),
        vec!["G3".to_string(), "G4".to_string()]
    );
}
