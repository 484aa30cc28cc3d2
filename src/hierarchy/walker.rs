//! Breadth-first enumeration of groups, subgroups and projects.
//!
//! A single driver task owns the worklist and is the only writer to the
//! output channel. Group expansions run on a bounded `JoinSet`; a group is
//! reported when its own expansion completes and its subgroups are queued
//! only afterwards, which gives parent-before-child order without any
//! global sort.

use std::collections::{HashMap, HashSet, VecDeque};
use std::pin::Pin;
use std::task::{Context, Poll};

use dashmap::DashSet;
use futures_util::Stream;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::{AccessLevel, ArchiveFilter, Hierarchy, NodeId, NodeStatus, OrgNode, WalkOptions};
use crate::classify::Refusal;
use crate::context::ReconContext;
use crate::error::{ErrorKind, ReconError};
use crate::identity::PlatformMode;
use crate::transport::{ApiRequest, encode_path};

const CHANNEL_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Upstream records
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct GroupRecord {
    id: u64,
    full_path: String,
    #[serde(default)]
    parent_id: Option<u64>,
    #[serde(default)]
    archived: bool,
}

#[derive(Debug, Deserialize)]
struct ProjectRecord {
    id: u64,
    path_with_namespace: String,
    #[serde(default)]
    archived: bool,
    #[serde(default)]
    default_branch: Option<String>,
    #[serde(default)]
    namespace: Option<NamespaceRecord>,
    #[serde(default)]
    permissions: Option<Permissions>,
}

#[derive(Debug, Deserialize)]
struct NamespaceRecord {
    id: u64,
    #[serde(default)]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct Permissions {
    #[serde(default)]
    project_access: Option<AccessRecord>,
    #[serde(default)]
    group_access: Option<AccessRecord>,
}

#[derive(Debug, Deserialize)]
struct AccessRecord {
    access_level: u64,
}

impl ProjectRecord {
    fn access(&self) -> Option<AccessLevel> {
        let perms = self.permissions.as_ref()?;
        [perms.project_access.as_ref(), perms.group_access.as_ref()]
            .into_iter()
            .flatten()
            .map(|a| a.access_level)
            .max()
            .map(AccessLevel::from_gitlab)
    }

    fn into_node(self, parent: Option<NodeId>, inherited: AccessLevel) -> OrgNode {
        let access = self.access().unwrap_or(inherited);
        OrgNode {
            id: NodeId::Project(self.id),
            full_path: self.path_with_namespace,
            parent,
            archived: self.archived,
            access,
            status: NodeStatus::Leaf,
            default_branch: self.default_branch,
        }
    }
}

fn decode<T: DeserializeOwned>(items: Vec<Value>, source: &str) -> Vec<T> {
    items
        .into_iter()
        .filter_map(|item| match serde_json::from_value(item) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(%source, error = %e, "skipping malformed record");
                None
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Public surface
// ---------------------------------------------------------------------------

/// Logged-but-nonfatal oddity seen during a walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Anomaly {
    pub node: NodeId,
    pub detail: String,
}

/// Everything about a walk that is not a node.
#[derive(Debug, Clone, Default)]
pub struct WalkReport {
    pub emitted: usize,
    /// Ids seen more than once.
    pub anomalies: Vec<Anomaly>,
    /// Subtrees or listings that could not be fetched, with the failure kind.
    pub incomplete: Vec<(String, ErrorKind)>,
    /// Groups queued or in flight when the walk was cancelled.
    pub unchecked: Vec<NodeId>,
    /// The starting point itself could not be listed.
    pub root_error: Option<ReconError>,
    pub cancelled: bool,
    pub rate_limit_hits: u64,
}

impl WalkReport {
    pub fn is_complete(&self) -> bool {
        !self.cancelled
            && self.root_error.is_none()
            && self.incomplete.is_empty()
            && self.unchecked.is_empty()
    }
}

/// A running enumeration. Yields nodes as a [`Stream`]; the report becomes
/// available once the stream is exhausted.
pub struct Walk {
    nodes: ReceiverStream<OrgNode>,
    driver: JoinHandle<WalkReport>,
}

impl Walk {
    pub async fn next_node(&mut self) -> Option<OrgNode> {
        self.nodes.next().await
    }

    /// Consume every remaining node, then wait for the report.
    pub async fn drain(mut self) -> (Vec<OrgNode>, WalkReport) {
        let mut out = Vec::new();
        while let Some(node) = self.nodes.next().await {
            out.push(node);
        }
        (out, self.finish().await)
    }

    /// Stop reading and wait for the report. Nodes not yet read are
    /// discarded and the driver winds down as if cancelled.
    pub async fn finish(self) -> WalkReport {
        drop(self.nodes);
        match self.driver.await {
            Ok(report) => report,
            Err(e) => {
                tracing::error!(error = %e, "walk driver failed");
                WalkReport {
                    cancelled: true,
                    ..WalkReport::default()
                }
            }
        }
    }
}

impl Stream for Walk {
    type Item = OrgNode;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<OrgNode>> {
        Pin::new(&mut self.nodes).poll_next(cx)
    }
}

/// Start enumerating everything visible to the context's token, or the
/// subtree under `options.root`.
///
/// Conflicting options fail here, before any request is issued. Each call
/// starts an independent walk, so a walk can be restarted by calling again.
pub fn enumerate(
    ctx: &ReconContext,
    options: WalkOptions,
    cancel: &CancellationToken,
) -> Result<Walk, ReconError> {
    options.validate()?;

    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let span = tracing::info_span!(
        "walk",
        mode = %ctx.mode,
        root = options.root.as_deref().unwrap_or("*"),
    );
    let walker = Walker {
        ctx: ctx.clone(),
        filter: options.archive_filter(),
        visited: DashSet::new(),
        reported: HashSet::new(),
        cancel: cancel.child_token(),
        tx,
        report: WalkReport::default(),
    };
    let driver = tokio::spawn(walker.run(options.root).instrument(span));

    Ok(Walk {
        nodes: ReceiverStream::new(rx),
        driver,
    })
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct GroupSeed {
    id: u64,
    full_path: String,
    parent: Option<NodeId>,
    archived: bool,
}

struct Children {
    access: AccessLevel,
    subgroups: Vec<GroupRecord>,
    projects: Vec<ProjectRecord>,
}

struct Expansion {
    seed: GroupSeed,
    outcome: Result<Children, (AccessLevel, Refusal)>,
}

struct Walker {
    ctx: ReconContext,
    filter: ArchiveFilter,
    visited: DashSet<NodeId>,
    reported: HashSet<NodeId>,
    cancel: CancellationToken,
    tx: mpsc::Sender<OrgNode>,
    report: WalkReport,
}

impl Walker {
    async fn run(mut self, root: Option<String>) -> WalkReport {
        let seeds = match root.as_deref() {
            Some(root) => self.root_seed(root).await,
            None => self.top_level_seeds().await,
        };

        let mut queue = VecDeque::new();
        for seed in seeds {
            self.enqueue(&mut queue, seed);
        }
        self.expand_all(queue).await;

        if root.is_none() && !self.stopped() {
            self.non_member_projects().await;
        }

        self.report.cancelled |= self.cancel.is_cancelled();
        self.report.rate_limit_hits = self.ctx.client.rate_limit_hits();
        tracing::info!(
            emitted = self.report.emitted,
            anomalies = self.report.anomalies.len(),
            incomplete = self.report.incomplete.len(),
            unchecked = self.report.unchecked.len(),
            cancelled = self.report.cancelled,
            "walk finished"
        );
        self.report
    }

    fn stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    async fn root_seed(&mut self, root: &str) -> Vec<GroupSeed> {
        let path = format!("/groups/{}", encode_path(root));
        let record = match self.ctx.client.send_with_retry(ApiRequest::get(path)).await {
            Ok(granted) => granted.json::<GroupRecord>(),
            Err(refusal) => Err(refusal),
        };

        match record {
            Ok(group) => vec![GroupSeed {
                id: group.id,
                full_path: group.full_path,
                parent: None,
                archived: group.archived,
            }],
            Err(refusal) => {
                tracing::warn!(%root, error = %refusal, "root group unavailable");
                self.report.root_error = Some(ReconError::from_refusal(
                    &format!("group {root}"),
                    refusal,
                ));
                Vec::new()
            }
        }
    }

    /// Self-hosted: every visible top-level group. SaaS: instance-wide
    /// listing is pointless, so start from the member groups whose parent is
    /// not itself a member group.
    async fn top_level_seeds(&mut self) -> Vec<GroupSeed> {
        let req = match self.ctx.mode {
            PlatformMode::SelfHosted => ApiRequest::get("/groups")
                .param("top_level_only", true)
                .param("all_available", true),
            PlatformMode::Saas => ApiRequest::get("/groups").param("min_access_level", 10),
        };

        let groups: Vec<GroupRecord> = match self.ctx.client.get_all_with_retry(req).await {
            Ok(items) => decode(items, "/groups"),
            Err(refusal) => {
                tracing::warn!(error = %refusal, "group listing failed");
                self.report.root_error = Some(ReconError::from_refusal("/groups", refusal));
                return Vec::new();
            }
        };

        let listed: HashSet<u64> = groups.iter().map(|g| g.id).collect();
        groups
            .into_iter()
            .filter(|g| g.parent_id.is_none_or(|p| !listed.contains(&p)))
            .map(|g| GroupSeed {
                id: g.id,
                full_path: g.full_path,
                parent: None,
                archived: g.archived,
            })
            .collect()
    }

    fn enqueue(&mut self, queue: &mut VecDeque<GroupSeed>, seed: GroupSeed) {
        let id = NodeId::Group(seed.id);
        if !self.filter.admits_group(seed.archived) {
            tracing::debug!(node = %id, path = %seed.full_path, "archived group skipped");
            return;
        }
        if self.visited.insert(id) {
            queue.push_back(seed);
        } else {
            self.anomaly(id, format!("{} reached again; skipped", seed.full_path));
        }
    }

    fn anomaly(&mut self, node: NodeId, detail: String) {
        tracing::warn!(%node, %detail, "walk anomaly");
        self.report.anomalies.push(Anomaly { node, detail });
    }

    async fn expand_all(&mut self, mut queue: VecDeque<GroupSeed>) {
        let limit = self.ctx.config.concurrency.max(1);
        let mut in_flight: JoinSet<Expansion> = JoinSet::new();
        let mut pending: HashMap<tokio::task::Id, NodeId> = HashMap::new();

        loop {
            while in_flight.len() < limit && !self.stopped() {
                let Some(seed) = queue.pop_front() else { break };
                let id = NodeId::Group(seed.id);
                let handle = in_flight.spawn(expand_group(self.ctx.clone(), self.filter, seed));
                pending.insert(handle.id(), id);
            }
            if in_flight.is_empty() {
                break;
            }

            let joined = if self.stopped() {
                in_flight.join_next_with_id().await
            } else {
                tokio::select! {
                    biased;
                    () = self.cancel.cancelled() => {
                        tracing::info!(in_flight = in_flight.len(), "walk cancelled; draining");
                        continue;
                    }
                    joined = in_flight.join_next_with_id() => joined,
                }
            };
            let Some(joined) = joined else { break };

            match joined {
                Ok((task, expansion)) => {
                    pending.remove(&task);
                    if self.stopped() {
                        self.report.unchecked.push(NodeId::Group(expansion.seed.id));
                        continue;
                    }
                    self.absorb(expansion, &mut queue).await;
                }
                Err(err) => {
                    tracing::error!(error = %err, "expansion task failed");
                    if let Some(id) = pending.remove(&err.id()) {
                        self.report
                            .incomplete
                            .push((id.to_string(), ErrorKind::Unreachable));
                    }
                }
            }
        }

        if self.stopped() {
            self.report
                .unchecked
                .extend(queue.into_iter().map(|s| NodeId::Group(s.id)));
        }
    }

    /// Report a finished expansion: the group, then its direct projects,
    /// then queue its subgroups.
    async fn absorb(&mut self, expansion: Expansion, queue: &mut VecDeque<GroupSeed>) {
        let Expansion { seed, outcome } = expansion;
        let id = NodeId::Group(seed.id);

        let (access, status, children) = match outcome {
            Ok(children) => (children.access, NodeStatus::Expanded, Some(children)),
            Err((access, refusal)) => {
                let status = status_for(&refusal);
                tracing::debug!(node = %id, status = status.label(), error = %refusal, "group not expanded");
                match &status {
                    NodeStatus::Incomplete(kind) => {
                        self.report.incomplete.push((id.to_string(), *kind));
                    }
                    NodeStatus::Denied(_) => {
                        self.finish_group(seed, AccessLevel::None, status).await;
                        return;
                    }
                    _ => {}
                }
                (access, status, None)
            }
        };

        let full_path = seed.full_path.clone();
        if !self.finish_group(seed, access, status).await {
            return;
        }
        let Some(children) = children else { return };

        for project in children.projects {
            if !self.filter.admits(project.archived) {
                continue;
            }
            let pid = NodeId::Project(project.id);
            if !self.visited.insert(pid) {
                self.anomaly(pid, format!("listed again under {full_path}"));
                continue;
            }
            if !self.emit(project.into_node(Some(id), access)).await {
                return;
            }
        }

        for sub in children.subgroups {
            self.enqueue(
                queue,
                GroupSeed {
                    id: sub.id,
                    full_path: sub.full_path,
                    parent: Some(id),
                    archived: sub.archived,
                },
            );
        }
    }

    async fn finish_group(
        &mut self,
        seed: GroupSeed,
        access: AccessLevel,
        status: NodeStatus,
    ) -> bool {
        let node = OrgNode {
            id: NodeId::Group(seed.id),
            full_path: seed.full_path,
            parent: seed.parent,
            archived: seed.archived,
            access,
            status,
            default_branch: None,
        };
        self.emit(node).await
    }

    /// Projects not reachable through the group walk: personal projects,
    /// projects shared in, and (self-hosted) public/internal projects the
    /// token is not a member of.
    async fn non_member_projects(&mut self) {
        let mut req = ApiRequest::get("/projects");
        if self.ctx.mode == PlatformMode::Saas {
            req = req.param("membership", true);
        }
        if let Some(archived) = self.filter.query_value() {
            req = req.param("archived", archived);
        }

        let items = match self.ctx.client.get_all_with_retry(req).await {
            Ok(items) => items,
            Err(refusal) => {
                tracing::warn!(error = %refusal, "project listing failed");
                self.report
                    .incomplete
                    .push(("/projects".into(), refusal.kind()));
                return;
            }
        };

        for project in decode::<ProjectRecord>(items, "/projects") {
            if self.stopped() {
                return;
            }
            if !self.filter.admits(project.archived) {
                continue;
            }
            if !self.visited.insert(NodeId::Project(project.id)) {
                continue;
            }
            let parent = project
                .namespace
                .as_ref()
                .filter(|ns| ns.kind == "group")
                .map(|ns| NodeId::Group(ns.id))
                .filter(|g| self.reported.contains(g));
            if !self.emit(project.into_node(parent, AccessLevel::None)).await {
                return;
            }
        }
    }

    async fn emit(&mut self, node: OrgNode) -> bool {
        let id = node.id;
        let sent = tokio::select! {
            sent = self.tx.send(node) => sent.is_ok(),
            () = self.cancel.cancelled() => false,
        };
        if !sent {
            if !self.cancel.is_cancelled() {
                tracing::debug!("walk consumer went away");
                self.cancel.cancel();
            }
            return false;
        }
        self.reported.insert(id);
        self.report.emitted += 1;
        true
    }
}

fn status_for(refusal: &Refusal) -> NodeStatus {
    match refusal {
        Refusal::Denied(cause) => NodeStatus::Denied(cause.clone()),
        Refusal::NotFound => NodeStatus::Missing,
        other => NodeStatus::Incomplete(other.kind()),
    }
}

// ---------------------------------------------------------------------------
// Single-project lookups
// ---------------------------------------------------------------------------

/// Fetch one project by numeric id or full path. Its parent is the owning
/// group when the namespace is a group.
pub async fn fetch_project(ctx: &ReconContext, id_or_path: &str) -> Result<OrgNode, ReconError> {
    let target = format!("project {id_or_path}");
    let record: ProjectRecord = ctx
        .client
        .send_with_retry(ApiRequest::get(format!("/projects/{}", encode_path(id_or_path))))
        .await
        .and_then(|granted| granted.json())
        .map_err(|r| ReconError::from_refusal(&target, r))?;

    let parent = record
        .namespace
        .as_ref()
        .filter(|ns| ns.kind == "group")
        .map(|ns| NodeId::Group(ns.id));
    Ok(record.into_node(parent, AccessLevel::None))
}

/// Maximum group nesting GitLab allows is 20.
const MAX_DEPTH: usize = 20;

/// Best-effort index of a project and the groups above it. The chain stops
/// at the first group that cannot be read.
pub async fn lineage(ctx: &ReconContext, project: &OrgNode) -> Hierarchy {
    let mut chain: Vec<OrgNode> = Vec::new();
    let mut seen = HashSet::new();
    let mut cursor = project.parent;

    while let Some(NodeId::Group(id)) = cursor {
        if chain.len() >= MAX_DEPTH || !seen.insert(id) {
            break;
        }
        let record = match ctx.client.get(format!("/groups/{id}")).await {
            Ok(granted) => granted.json::<GroupRecord>(),
            Err(refusal) => Err(refusal),
        };
        let Ok(group) = record else {
            tracing::debug!(group_id = id, "ancestor group unreadable; chain truncated");
            break;
        };
        let parent = group.parent_id.map(NodeId::Group);
        chain.push(OrgNode {
            id: NodeId::Group(group.id),
            full_path: group.full_path,
            parent,
            archived: group.archived,
            access: AccessLevel::None,
            status: NodeStatus::Expanded,
            default_branch: None,
        });
        cursor = parent;
    }

    chain.reverse();
    let mut index = Hierarchy::from_nodes(chain);
    index.insert(project.clone());
    index
}

// ---------------------------------------------------------------------------
// Expansion (runs on the pool)
// ---------------------------------------------------------------------------

async fn expand_group(ctx: ReconContext, filter: ArchiveFilter, seed: GroupSeed) -> Expansion {
    let outcome = list_children(&ctx, filter, seed.id).await;
    Expansion { seed, outcome }
}

async fn list_children(
    ctx: &ReconContext,
    filter: ArchiveFilter,
    group_id: u64,
) -> Result<Children, (AccessLevel, Refusal)> {
    let access = membership(ctx, group_id)
        .await
        .map_err(|r| (AccessLevel::None, r))?;

    let subgroups = ctx
        .client
        .get_all_with_retry(ApiRequest::get(format!("/groups/{group_id}/subgroups")))
        .await
        .map_err(|r| (access, r))?;

    let mut req = ApiRequest::get(format!("/groups/{group_id}/projects")).param("with_shared", false);
    if let Some(archived) = filter.query_value() {
        req = req.param("archived", archived);
    }
    let projects = ctx
        .client
        .get_all_with_retry(req)
        .await
        .map_err(|r| (access, r))?;

    Ok(Children {
        access,
        subgroups: decode(subgroups, "subgroups"),
        projects: decode(projects, "group projects"),
    })
}

/// Effective membership level on a group, inherited memberships included.
/// Not being a member is not a failure; anything else that prevents the
/// check is, so "not a member" never stands in for "not checked".
async fn membership(ctx: &ReconContext, group_id: u64) -> Result<AccessLevel, Refusal> {
    #[derive(Deserialize)]
    struct Member {
        access_level: u64,
    }

    let path = format!("/groups/{group_id}/members/all/{}", ctx.token.user_id());
    match ctx.client.send_with_retry(ApiRequest::get(path)).await {
        Ok(granted) => Ok(granted
            .json::<Member>()
            .map_or(AccessLevel::None, |m| AccessLevel::from_gitlab(m.access_level))),
        Err(Refusal::NotFound) => Ok(AccessLevel::None),
        Err(refusal) => {
            tracing::warn!(group_id, error = %refusal, "membership lookup failed");
            Err(refusal)
        }
    }
}
