mod helpers;

use serde_json::json;

use glrecon::branches::check_branch_protections;
use glrecon::error::ErrorKind;
use glrecon::hierarchy::{AccessLevel, Hierarchy, NodeId, NodeStatus, OrgNode, Tier};
use glrecon::runners::{RunnerStatus, TagKind, analyze_workflow_tags, map_runners};
use glrecon::transport::Method;

use helpers::MockTransport;

const CI_PATH: &str = "/projects/10/repository/files/.gitlab-ci.yml/raw";

fn node(id: NodeId, path: &str, parent: Option<NodeId>) -> OrgNode {
    OrgNode {
        id,
        full_path: path.into(),
        parent,
        archived: false,
        access: AccessLevel::Developer,
        status: match id {
            NodeId::Group(_) => NodeStatus::Expanded,
            NodeId::Project(_) => NodeStatus::Leaf,
        },
        default_branch: Some("main".into()),
    }
}

fn tree() -> Hierarchy {
    Hierarchy::from_nodes([
        node(NodeId::Group(1), "acme", None),
        node(NodeId::Project(10), "acme/web", Some(NodeId::Group(1))),
    ])
}

fn runner(id: u64, status: &str) -> serde_json::Value {
    json!({ "id": id, "description": format!("runner-{id}"), "status": status, "paused": false })
}

fn script_runners(mock: &MockTransport) {
    mock.get("/runners/all", json!([runner(1, "online")]));
    mock.get("/groups/1/runners", json!([runner(2, "online"), runner(1, "online")]));
    mock.get("/projects/10/runners", json!([runner(3, "offline")]));
    mock.get("/runners/1", json!({ "id": 1, "tag_list": ["shared"] }));
    mock.get("/runners/2", json!({ "id": 2, "tag_list": ["docker", "linux"] }));
    mock.get("/runners/3", json!({ "id": 3, "tag_list": ["gpu"] }));
}

// ---------------------------------------------------------------------------
// Runner topology
// ---------------------------------------------------------------------------

#[tokio::test]
async fn admin_maps_every_tier_once_per_runner() {
    let mock = MockTransport::new();
    script_runners(&mock);
    let ctx = helpers::admin_context(&mock).await;

    let topology = map_runners(&ctx, &tree()).await;

    let seen: Vec<(u64, Tier)> = topology.runners.iter().map(|r| (r.id, r.tier)).collect();
    assert_eq!(
        seen,
        vec![(1, Tier::Instance), (2, Tier::Group), (3, Tier::Project)]
    );
    assert!(topology.skipped.is_empty());

    let group_runner = &topology.runners[1];
    assert_eq!(group_runner.owner, Some(NodeId::Group(1)));
    assert!(group_runner.tags.contains("docker"));
    assert_eq!(topology.runners[2].status, RunnerStatus::Offline);
    assert_eq!(topology.online().count(), 2);

    let calls = mock.calls();
    let instance = calls.iter().find(|r| r.path == "/runners/all").unwrap();
    assert_eq!(instance.query_value("type"), Some("instance_type"));
}

#[tokio::test]
async fn non_admin_skips_instance_tier_without_a_call() {
    let mock = MockTransport::new();
    script_runners(&mock);
    let ctx = helpers::api_context(&mock).await;

    let topology = map_runners(&ctx, &tree()).await;

    assert!(!mock.called(Method::Get, "/runners/all"));
    assert_eq!(topology.skipped.len(), 1);
    assert_eq!(topology.skipped[0].tier, Tier::Instance);
    assert_eq!(topology.skipped[0].error.kind(), ErrorKind::AccessDenied);
    // Runner 1 is still reported, now through its group.
    assert_eq!(topology.by_tier(Tier::Group).count(), 2);
}

#[tokio::test]
async fn unreadable_runner_details_leave_tags_empty() {
    let mock = MockTransport::new();
    mock.get("/groups/1/runners", json!([runner(2, "online")]));
    mock.get("/projects/10/runners", json!([]));
    mock.status(Method::Get, "/runners/2", 403);
    let ctx = helpers::api_context(&mock).await;

    let topology = map_runners(&ctx, &tree()).await;
    assert_eq!(topology.runners.len(), 1);
    assert!(topology.runners[0].tags.is_empty());
}

#[tokio::test]
async fn denied_project_listing_is_a_skip() {
    let mock = MockTransport::new();
    mock.get("/groups/1/runners", json!([runner(2, "online")]));
    mock.status(Method::Get, "/projects/10/runners", 403);
    let ctx = helpers::api_context(&mock).await;

    let topology = map_runners(&ctx, &tree()).await;
    let skipped: Vec<(Tier, Option<NodeId>)> =
        topology.skipped.iter().map(|s| (s.tier, s.node)).collect();
    assert!(skipped.contains(&(Tier::Project, Some(NodeId::Project(10)))));
    assert_eq!(topology.runners.len(), 1);
}

// ---------------------------------------------------------------------------
// Workflow tags
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unserved_tags_are_reported() {
    let mock = MockTransport::new();
    script_runners(&mock);
    mock.text(
        Method::Get,
        CI_PATH,
        200,
        "build:\n  tags: [docker, gpu, \"$DYNAMIC\"]\n  script: [make]\n",
    );
    let ctx = helpers::admin_context(&mock).await;
    let index = tree();
    let topology = map_runners(&ctx, &index).await;
    let project = index.get(NodeId::Project(10)).unwrap();

    let analysis = analyze_workflow_tags(&ctx, project, &topology).await.unwrap();

    assert!(analysis.has_ci_file);
    assert_eq!(analysis.git_ref.as_deref(), Some("main"));
    assert_eq!(analysis.tags.len(), 3);
    assert_eq!(analysis.tags[2].kind, TagKind::VariableTag);
    // gpu belongs to an offline runner; variable tags are never judged.
    assert_eq!(analysis.unserved, vec!["gpu".to_owned()]);

    let read = mock
        .calls()
        .into_iter()
        .find(|r| r.path == CI_PATH)
        .unwrap();
    assert_eq!(read.query_value("ref"), Some("main"));
}

#[tokio::test]
async fn project_without_ci_file_has_empty_analysis() {
    let mock = MockTransport::new();
    let ctx = helpers::api_context(&mock).await;
    let index = tree();
    let project = index.get(NodeId::Project(10)).unwrap();

    let analysis = analyze_workflow_tags(&ctx, project, &Default::default())
        .await
        .unwrap();
    assert!(!analysis.has_ci_file);
    assert!(analysis.tags.is_empty());
}

#[tokio::test]
async fn unparsable_ci_file_is_reported_not_fatal() {
    let mock = MockTransport::new();
    mock.text(Method::Get, CI_PATH, 200, "build: [unclosed");
    let ctx = helpers::api_context(&mock).await;
    let index = tree();
    let project = index.get(NodeId::Project(10)).unwrap();

    let analysis = analyze_workflow_tags(&ctx, project, &Default::default())
        .await
        .unwrap();
    assert!(analysis.has_ci_file);
    assert!(analysis.parse_error.is_some());
}

#[tokio::test]
async fn groups_are_not_analyzable() {
    let mock = MockTransport::new();
    let ctx = helpers::api_context(&mock).await;
    let index = tree();
    let group = index.get(NodeId::Group(1)).unwrap();

    let err = analyze_workflow_tags(&ctx, group, &Default::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MissingParameter);
    assert!(mock.work_calls().is_empty());
}

// ---------------------------------------------------------------------------
// Branch protections
// ---------------------------------------------------------------------------

#[tokio::test]
async fn protections_summarise_push_rules() {
    let mock = MockTransport::new();
    mock.get(
        "/projects/10/protected_branches",
        json!([
            {
                "name": "main",
                "push_access_levels": [{ "access_level": 40 }],
                "merge_access_levels": [{ "access_level": 30 }, { "access_level": 40 }],
                "allow_force_push": false,
            },
            {
                "name": "release-*",
                "push_access_levels": [{ "access_level": 0 }],
                "merge_access_levels": [{ "access_level": 40 }],
                "code_owner_approval_required": true,
            },
        ]),
    );
    let ctx = helpers::api_context(&mock).await;
    let index = tree();
    let project = index.get(NodeId::Project(10)).unwrap();

    let protections = check_branch_protections(&ctx, project).await.unwrap();

    assert!(protections.default_branch_protected());
    assert_eq!(protections.rules[0].push_access, Some(AccessLevel::Maintainer));
    assert_eq!(protections.rules[0].merge_access, Some(AccessLevel::Developer));
    assert_eq!(protections.rules[1].push_access, None);
    assert!(protections.rules[1].code_owner_approval_required);

    assert!(!protections.can_push("main", AccessLevel::Developer));
    assert!(protections.can_push("main", AccessLevel::Maintainer));
    assert!(!protections.can_push("release-1.2", AccessLevel::Owner));
    assert!(protections.can_push("glrecon-1a2b3c4d", AccessLevel::Developer));
}

#[tokio::test]
async fn protections_denied_is_access_denied() {
    let mock = MockTransport::new();
    mock.status(Method::Get, "/projects/10/protected_branches", 403);
    let ctx = helpers::api_context(&mock).await;
    let index = tree();
    let project = index.get(NodeId::Project(10)).unwrap();

    let err = check_branch_protections(&ctx, project).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AccessDenied);
}
