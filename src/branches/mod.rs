//! Protected-branch inspection. Tells whether a pipeline can be injected on
//! the default branch or only on a fresh one.

use serde::{Deserialize, Serialize};

use crate::context::ReconContext;
use crate::error::ReconError;
use crate::hierarchy::{AccessLevel, NodeId, OrgNode};
use crate::transport::ApiRequest;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BranchRule {
    pub name: String,
    /// Lowest level allowed to push; `None` when nobody may push.
    pub push_access: Option<AccessLevel>,
    pub merge_access: Option<AccessLevel>,
    pub allow_force_push: bool,
    pub code_owner_approval_required: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BranchProtections {
    pub project: NodeId,
    pub default_branch: Option<String>,
    pub rules: Vec<BranchRule>,
}

impl BranchProtections {
    pub fn default_branch_protected(&self) -> bool {
        self.default_branch
            .as_deref()
            .is_some_and(|b| self.rules.iter().any(|r| rule_matches(&r.name, b)))
    }

    /// Whether `access` may push directly to `branch`.
    pub fn can_push(&self, branch: &str, access: AccessLevel) -> bool {
        let matching: Vec<&BranchRule> = self
            .rules
            .iter()
            .filter(|r| rule_matches(&r.name, branch))
            .collect();
        if matching.is_empty() {
            return access >= AccessLevel::Developer;
        }
        matching
            .iter()
            .any(|r| r.push_access.is_some_and(|min| access >= min))
    }
}

/// Protected branch names may contain `*` wildcards.
fn rule_matches(pattern: &str, branch: &str) -> bool {
    let mut pieces = pattern.split('*');
    let head = pieces.next().unwrap_or_default();
    let Some(mut rest) = branch.strip_prefix(head) else {
        return false;
    };
    let pieces: Vec<&str> = pieces.collect();
    let Some((last, middle)) = pieces.split_last() else {
        return rest.is_empty();
    };
    for piece in middle {
        match rest.find(piece) {
            Some(at) => rest = &rest[at + piece.len()..],
            None => return false,
        }
    }
    rest.ends_with(last)
}

#[derive(Debug, Deserialize)]
struct ProtectedBranchRecord {
    name: String,
    #[serde(default)]
    push_access_levels: Vec<AccessGrant>,
    #[serde(default)]
    merge_access_levels: Vec<AccessGrant>,
    #[serde(default)]
    allow_force_push: bool,
    #[serde(default)]
    code_owner_approval_required: bool,
}

#[derive(Debug, Deserialize)]
struct AccessGrant {
    access_level: u64,
}

/// Lowest granted level; level 0 ("no one") grants nothing.
fn lowest(grants: &[AccessGrant]) -> Option<AccessLevel> {
    grants
        .iter()
        .filter(|g| g.access_level > 0)
        .map(|g| AccessLevel::from_gitlab(g.access_level))
        .min()
}

#[tracing::instrument(skip(ctx, project), fields(project = %project.full_path), err)]
pub async fn check_branch_protections(
    ctx: &ReconContext,
    project: &OrgNode,
) -> Result<BranchProtections, ReconError> {
    let NodeId::Project(id) = project.id else {
        return Err(ReconError::MissingParameter(format!(
            "{} is a group, not a project",
            project.full_path
        )));
    };

    let items = ctx
        .client
        .get_all(ApiRequest::get(format!("/projects/{id}/protected_branches")))
        .await
        .map_err(|r| ReconError::from_refusal(&project.full_path, r))?;

    let rules = items
        .into_iter()
        .filter_map(|item| serde_json::from_value::<ProtectedBranchRecord>(item).ok())
        .map(|r| BranchRule {
            push_access: lowest(&r.push_access_levels),
            merge_access: lowest(&r.merge_access_levels),
            name: r.name,
            allow_force_push: r.allow_force_push,
            code_owner_approval_required: r.code_owner_approval_required,
        })
        .collect();

    Ok(BranchProtections {
        project: project.id,
        default_branch: project.default_branch.clone(),
        rules,
    })
}
