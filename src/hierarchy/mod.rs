//! Organisation hierarchy: node model, walk options and the walker itself.

pub mod walker;

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::Serialize;

use crate::classify::DenyCause;
use crate::error::{ErrorKind, ReconError};

pub use walker::{Anomaly, Walk, WalkReport, enumerate, fetch_project, lineage};

// ---------------------------------------------------------------------------
// Node model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum NodeId {
    Group(u64),
    Project(u64),
}

impl NodeId {
    pub fn kind(self) -> NodeKind {
        match self {
            Self::Group(_) => NodeKind::Group,
            Self::Project(_) => NodeKind::Project,
        }
    }

    pub fn raw(self) -> u64 {
        match self {
            Self::Group(id) | Self::Project(id) => id,
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Group(id) => write!(f, "group {id}"),
            Self::Project(id) => write!(f, "project {id}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Group,
    Project,
}

/// Effective access of the current token on one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    None,
    Guest,
    Reporter,
    Developer,
    Maintainer,
    Owner,
}

impl AccessLevel {
    /// Map GitLab's numeric levels (10/20/30/40/50). Minimal access (5)
    /// grants nothing readable and counts as `None`.
    pub fn from_gitlab(level: u64) -> Self {
        match level {
            0..=9 => Self::None,
            10..=19 => Self::Guest,
            20..=29 => Self::Reporter,
            30..=39 => Self::Developer,
            40..=49 => Self::Maintainer,
            _ => Self::Owner,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Guest => "guest",
            Self::Reporter => "reporter",
            Self::Developer => "developer",
            Self::Maintainer => "maintainer",
            Self::Owner => "owner",
        }
    }
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the walker learned about a node: distinguishes "access denied" from
/// "not present" from "could not be checked".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeStatus {
    /// Group whose children were fully listed.
    Expanded,
    /// Project; nothing below it to expand.
    Leaf,
    /// Listing children was refused; the subtree was not explored.
    Denied(DenyCause),
    /// The upstream reported the node as absent.
    Missing,
    /// Children could not be listed even after retries.
    Incomplete(ErrorKind),
}

impl NodeStatus {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Expanded => "expanded",
            Self::Leaf => "leaf",
            Self::Denied(_) => "denied",
            Self::Missing => "missing",
            Self::Incomplete(_) => "incomplete",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrgNode {
    pub id: NodeId,
    pub full_path: String,
    /// Always a node reported earlier in the same walk, or `None` for roots.
    pub parent: Option<NodeId>,
    pub archived: bool,
    pub access: AccessLevel,
    pub status: NodeStatus,
    pub default_branch: Option<String>,
}

impl OrgNode {
    pub fn kind(&self) -> NodeKind {
        self.id.kind()
    }

    pub fn is_group(&self) -> bool {
        self.kind() == NodeKind::Group
    }

    pub fn is_project(&self) -> bool {
        self.kind() == NodeKind::Project
    }

    /// The token could list below it (groups) or saw it listed (projects).
    pub fn is_readable(&self) -> bool {
        matches!(self.status, NodeStatus::Expanded | NodeStatus::Leaf)
    }
}

// ---------------------------------------------------------------------------
// Tier
// ---------------------------------------------------------------------------

/// Hierarchy level a variable or runner is defined at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Instance,
    Group,
    Project,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Instance => "instance",
            Self::Group => "group",
            Self::Project => "project",
        })
    }
}

/// A tier (or one node within it) that was not collected, and why.
#[derive(Debug, Clone)]
pub struct TierSkip {
    pub tier: Tier,
    pub node: Option<NodeId>,
    pub error: ReconError,
}

// ---------------------------------------------------------------------------
// Walk options
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    pub include_archived: bool,
    pub archived_only: bool,
    /// Full path or numeric id of a single group to start from.
    pub root: Option<String>,
}

impl WalkOptions {
    pub fn validate(&self) -> Result<(), ReconError> {
        if self.include_archived && self.archived_only {
            return Err(ReconError::Configuration(
                "include-archived and archived-only are mutually exclusive".into(),
            ));
        }
        if self.root.as_deref().is_some_and(|r| r.trim().is_empty()) {
            return Err(ReconError::Configuration("root group is empty".into()));
        }
        Ok(())
    }

    pub fn archive_filter(&self) -> ArchiveFilter {
        if self.archived_only {
            ArchiveFilter::OnlyArchived
        } else if self.include_archived {
            ArchiveFilter::Any
        } else {
            ArchiveFilter::ExcludeArchived
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFilter {
    ExcludeArchived,
    Any,
    OnlyArchived,
}

impl ArchiveFilter {
    pub fn admits(self, archived: bool) -> bool {
        match self {
            Self::ExcludeArchived => !archived,
            Self::Any => true,
            Self::OnlyArchived => archived,
        }
    }

    /// Groups are structure: only the default filter drops archived ones.
    /// Under `OnlyArchived` every group is kept so archived projects in live
    /// groups still have a reported parent.
    pub fn admits_group(self, archived: bool) -> bool {
        !(self == Self::ExcludeArchived && archived)
    }

    /// Server-side hint for project listings. The result is still filtered
    /// locally since older instances ignore the parameter.
    pub fn query_value(self) -> Option<&'static str> {
        match self {
            Self::ExcludeArchived => Some("false"),
            Self::Any => None,
            Self::OnlyArchived => Some("true"),
        }
    }
}

// ---------------------------------------------------------------------------
// Hierarchy index
// ---------------------------------------------------------------------------

/// Lookup structure over a finished walk, in report order.
#[derive(Debug, Clone, Default)]
pub struct Hierarchy {
    nodes: HashMap<NodeId, OrgNode>,
    order: Vec<NodeId>,
}

impl Hierarchy {
    pub fn from_nodes(nodes: impl IntoIterator<Item = OrgNode>) -> Self {
        let mut index = Self::default();
        for node in nodes {
            index.insert(node);
        }
        index
    }

    /// First report of an id wins.
    pub fn insert(&mut self, node: OrgNode) {
        if self.nodes.contains_key(&node.id) {
            return;
        }
        self.order.push(node.id);
        self.nodes.insert(node.id, node);
    }

    pub fn get(&self, id: NodeId) -> Option<&OrgNode> {
        self.nodes.get(&id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &OrgNode> {
        self.order.iter().filter_map(|id| self.nodes.get(id))
    }

    pub fn groups(&self) -> impl Iterator<Item = &OrgNode> {
        self.iter().filter(|n| n.is_group())
    }

    pub fn projects(&self) -> impl Iterator<Item = &OrgNode> {
        self.iter().filter(|n| n.is_project())
    }

    pub fn find_by_path(&self, full_path: &str) -> Option<&OrgNode> {
        self.iter().find(|n| n.full_path == full_path)
    }

    /// Ancestors of `id`, nearest first. Stops at an unknown parent or a
    /// revisited id.
    pub fn ancestors(&self, id: NodeId) -> Vec<&OrgNode> {
        let mut chain = Vec::new();
        let mut seen = HashSet::from([id]);
        let mut cursor = self.nodes.get(&id).and_then(|n| n.parent);

        while let Some(parent_id) = cursor {
            if !seen.insert(parent_id) {
                tracing::warn!(node = %id, at = %parent_id, "cycle in ancestor chain");
                break;
            }
            let Some(parent) = self.nodes.get(&parent_id) else {
                break;
            };
            chain.push(parent);
            cursor = parent.parent;
        }
        chain
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    fn node(id: NodeId, parent: Option<NodeId>) -> OrgNode {
        OrgNode {
            id,
            full_path: id.to_string(),
            parent,
            archived: false,
            access: AccessLevel::Developer,
            status: NodeStatus::Expanded,
            default_branch: None,
        }
    }

    #[test]
    fn conflicting_archive_flags_rejected() {
        let opts = WalkOptions {
            include_archived: true,
            archived_only: true,
            root: None,
        };
        let err = opts.validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigurationError);
    }

    #[rstest]
    #[case(false, false, false, true)]
    #[case(false, false, true, false)]
    #[case(true, false, true, true)]
    #[case(true, false, false, true)]
    #[case(false, true, true, true)]
    #[case(false, true, false, false)]
    fn archive_filter_admits(
        #[case] include: bool,
        #[case] only: bool,
        #[case] archived: bool,
        #[case] admitted: bool,
    ) {
        let opts = WalkOptions {
            include_archived: include,
            archived_only: only,
            root: None,
        };
        assert_eq!(opts.archive_filter().admits(archived), admitted);
    }

    #[rstest]
    #[case(ArchiveFilter::ExcludeArchived, true, false)]
    #[case(ArchiveFilter::ExcludeArchived, false, true)]
    #[case(ArchiveFilter::Any, true, true)]
    #[case(ArchiveFilter::OnlyArchived, false, true)]
    #[case(ArchiveFilter::OnlyArchived, true, true)]
    fn archived_groups_dropped_only_by_default(
        #[case] filter: ArchiveFilter,
        #[case] archived: bool,
        #[case] admitted: bool,
    ) {
        assert_eq!(filter.admits_group(archived), admitted);
    }

    proptest! {
        #[test]
        fn default_filter_never_admits_archived(flags in proptest::collection::vec(any::<bool>(), 0..64)) {
            let filter = WalkOptions::default().archive_filter();
            let admitted: Vec<bool> = flags.into_iter().filter(|a| filter.admits(*a)).collect();
            prop_assert!(admitted.iter().all(|archived| !archived));
        }
    }

    #[rstest]
    #[case(0, AccessLevel::None)]
    #[case(5, AccessLevel::None)]
    #[case(10, AccessLevel::Guest)]
    #[case(20, AccessLevel::Reporter)]
    #[case(30, AccessLevel::Developer)]
    #[case(40, AccessLevel::Maintainer)]
    #[case(50, AccessLevel::Owner)]
    #[case(60, AccessLevel::Owner)]
    fn access_levels(#[case] raw: u64, #[case] want: AccessLevel) {
        assert_eq!(AccessLevel::from_gitlab(raw), want);
    }

    #[test]
    fn ancestors_nearest_first() {
        let h = Hierarchy::from_nodes([
            node(NodeId::Group(1), None),
            node(NodeId::Group(2), Some(NodeId::Group(1))),
            node(NodeId::Group(3), Some(NodeId::Group(2))),
            node(NodeId::Project(9), Some(NodeId::Group(3))),
        ]);
        let chain: Vec<NodeId> = h.ancestors(NodeId::Project(9)).iter().map(|n| n.id).collect();
        assert_eq!(
            chain,
            vec![NodeId::Group(3), NodeId::Group(2), NodeId::Group(1)]
        );
    }

    #[test]
    fn ancestors_break_cycles() {
        let h = Hierarchy::from_nodes([
            node(NodeId::Group(1), Some(NodeId::Group(2))),
            node(NodeId::Group(2), Some(NodeId::Group(1))),
        ]);
        let chain = h.ancestors(NodeId::Group(1));
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].id, NodeId::Group(2));
    }

    #[test]
    fn first_insert_wins() {
        let mut h = Hierarchy::default();
        h.insert(node(NodeId::Group(1), None));
        let mut dup = node(NodeId::Group(1), None);
        dup.full_path = "other".into();
        h.insert(dup);
        assert_eq!(h.len(), 1);
        assert_eq!(h.get(NodeId::Group(1)).unwrap().full_path, "group 1");
    }

    #[test]
    fn readable_depends_on_status() {
        let mut n = node(NodeId::Project(4), None);
        n.status = NodeStatus::Leaf;
        n.access = AccessLevel::None;
        assert!(n.is_readable());
        n.status = NodeStatus::Missing;
        assert!(!n.is_readable());
        n.status = NodeStatus::Denied(DenyCause::InsufficientRole);
        assert!(!n.is_readable());
    }
}
