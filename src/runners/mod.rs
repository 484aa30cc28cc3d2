//! Runner topology across the instance, group and project tiers.

pub mod workflow;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

use futures_util::StreamExt;
use futures_util::stream;
use serde::{Deserialize, Serialize};

use crate::classify::DenyCause;
use crate::context::ReconContext;
use crate::error::ReconError;
use crate::hierarchy::{Hierarchy, NodeId, Tier, TierSkip};
use crate::transport::ApiRequest;

pub use workflow::{TagAnalysis, TagKind, WorkflowTag, analyze_workflow_tags, extract_tags};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Upstream status, taken verbatim. Nothing is recomputed locally.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerStatus {
    Online,
    Offline,
    Stale,
    NeverContacted,
    Other(String),
}

impl RunnerStatus {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "online" => Self::Online,
            "offline" => Self::Offline,
            "stale" => Self::Stale,
            "never_contacted" => Self::NeverContacted,
            other => Self::Other(other.to_owned()),
        }
    }
}

impl fmt::Display for RunnerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Online => f.write_str("online"),
            Self::Offline => f.write_str("offline"),
            Self::Stale => f.write_str("stale"),
            Self::NeverContacted => f.write_str("never_contacted"),
            Self::Other(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunnerDescriptor {
    pub id: u64,
    pub description: String,
    pub tags: BTreeSet<String>,
    /// From the listing call that produced the runner.
    pub tier: Tier,
    pub status: RunnerStatus,
    /// `None` for instance runners.
    pub owner: Option<NodeId>,
    pub paused: bool,
    pub ip_address: Option<String>,
}

impl RunnerDescriptor {
    pub fn is_online(&self) -> bool {
        self.status == RunnerStatus::Online
    }
}

#[derive(Debug, Deserialize)]
struct RunnerRecord {
    id: u64,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    paused: Option<bool>,
    #[serde(default)]
    active: Option<bool>,
    #[serde(default)]
    ip_address: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RunnerDetail {
    #[serde(default)]
    tag_list: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RunnerTopology {
    /// De-duplicated by id; the outermost tier that reported a runner owns it.
    pub runners: Vec<RunnerDescriptor>,
    pub skipped: Vec<TierSkip>,
}

impl RunnerTopology {
    pub fn by_tier(&self, tier: Tier) -> impl Iterator<Item = &RunnerDescriptor> {
        self.runners.iter().filter(move |r| r.tier == tier)
    }

    pub fn online(&self) -> impl Iterator<Item = &RunnerDescriptor> {
        self.runners.iter().filter(|r| r.is_online())
    }

    /// Whether any online runner carries `tag`.
    pub fn serves_tag(&self, tag: &str) -> bool {
        self.online().any(|r| r.tags.contains(tag))
    }
}

// ---------------------------------------------------------------------------
// Mapping
// ---------------------------------------------------------------------------

fn listing(tier: Tier, node: Option<NodeId>) -> Option<ApiRequest> {
    let req = match (tier, node) {
        (Tier::Instance, None) => ApiRequest::get("/runners/all").param("type", "instance_type"),
        (Tier::Group, Some(NodeId::Group(id))) => {
            ApiRequest::get(format!("/groups/{id}/runners")).param("type", "group_type")
        }
        (Tier::Project, Some(NodeId::Project(id))) => {
            ApiRequest::get(format!("/projects/{id}/runners")).param("type", "project_type")
        }
        _ => return None,
    };
    Some(req)
}

async fn list_tier(
    ctx: &ReconContext,
    tier: Tier,
    node: Option<NodeId>,
) -> Result<Vec<RunnerRecord>, ReconError> {
    let target = node.map_or_else(|| "instance runners".to_owned(), |n| n.to_string());
    let Some(req) = listing(tier, node) else {
        return Err(ReconError::Configuration(format!(
            "no {tier}-level runners for {target}"
        )));
    };
    let items = ctx
        .client
        .get_all(req)
        .await
        .map_err(|r| ReconError::from_refusal(&target, r))?;

    Ok(items
        .into_iter()
        .filter_map(|item| match serde_json::from_value(item) {
            Ok(r) => Some(r),
            Err(e) => {
                tracing::warn!(%target, error = %e, "skipping malformed runner");
                None
            }
        })
        .collect())
}

/// Best effort: a runner whose details cannot be read just has no tags.
async fn runner_tags(ctx: &ReconContext, id: u64) -> BTreeSet<String> {
    match ctx.client.get(format!("/runners/{id}")).await {
        Ok(granted) => granted
            .json::<RunnerDetail>()
            .map(|d| d.tag_list.into_iter().collect())
            .unwrap_or_default(),
        Err(refusal) => {
            tracing::debug!(runner = id, error = %refusal, "runner details unavailable");
            BTreeSet::new()
        }
    }
}

/// Map every runner visible through the instance (admin only), the groups
/// and the projects of a walk.
#[tracing::instrument(skip(ctx, hierarchy), fields(nodes = hierarchy.len()))]
pub async fn map_runners(ctx: &ReconContext, hierarchy: &Hierarchy) -> RunnerTopology {
    let mut topology = RunnerTopology::default();
    let mut sources: Vec<(Tier, Option<NodeId>)> = Vec::new();

    if ctx.token.scope_class().is_admin() {
        sources.push((Tier::Instance, None));
    } else {
        tracing::warn!("instance runners need an administrator token; tier skipped");
        topology.skipped.push(TierSkip {
            tier: Tier::Instance,
            node: None,
            error: ReconError::AccessDenied {
                target: "instance runners".into(),
                cause: DenyCause::InsufficientRole,
            },
        });
    }
    sources.extend(
        hierarchy
            .groups()
            .filter(|g| g.is_readable())
            .map(|g| (Tier::Group, Some(g.id))),
    );
    sources.extend(
        hierarchy
            .projects()
            .filter(|p| p.is_readable())
            .map(|p| (Tier::Project, Some(p.id))),
    );

    let concurrency = ctx.config.concurrency.max(1);
    let listings: Vec<_> = stream::iter(sources)
        .map(|(tier, node)| async move { (tier, node, list_tier(ctx, tier, node).await) })
        .buffered(concurrency)
        .collect()
        .await;

    let mut seen = HashSet::new();
    for (tier, node, result) in listings {
        let records = match result {
            Ok(records) => records,
            Err(error) => {
                tracing::debug!(%tier, ?node, %error, "runner tier skipped");
                topology.skipped.push(TierSkip { tier, node, error });
                continue;
            }
        };
        for record in records {
            if !seen.insert(record.id) {
                continue;
            }
            topology.runners.push(RunnerDescriptor {
                id: record.id,
                description: record.description.unwrap_or_default(),
                tags: BTreeSet::new(),
                tier,
                status: RunnerStatus::parse(record.status.as_deref().unwrap_or("unknown")),
                owner: node,
                paused: record.paused.unwrap_or_else(|| !record.active.unwrap_or(true)),
                ip_address: record.ip_address,
            });
        }
    }

    let tags: HashMap<u64, BTreeSet<String>> = stream::iter(topology.runners.iter().map(|r| r.id))
        .map(|id| async move { (id, runner_tags(ctx, id).await) })
        .buffer_unordered(concurrency)
        .collect()
        .await;
    for runner in &mut topology.runners {
        if let Some(t) = tags.get(&runner.id) {
            runner.tags.clone_from(t);
        }
    }

    tracing::info!(
        runners = topology.runners.len(),
        online = topology.online().count(),
        skipped = topology.skipped.len(),
        "runner topology mapped"
    );
    topology
}
