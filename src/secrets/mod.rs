//! CI/CD variable collection and shadow-aware resolution.

use std::collections::BTreeMap;
use std::fmt;

use futures_util::StreamExt;
use futures_util::stream;
use serde::{Deserialize, Serialize};

use crate::classify::DenyCause;
use crate::context::ReconContext;
use crate::error::ReconError;
use crate::hierarchy::{Hierarchy, NodeId, OrgNode, Tier, TierSkip};
use crate::transport::ApiRequest;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RevealPolicy {
    /// Protected and masked values become placeholders.
    #[default]
    Redact,
    /// Return values as the upstream served them. Only reachable with an
    /// `api` or admin token, which every collection already requires.
    Raw,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "value", rename_all = "snake_case")]
pub enum SecretValue {
    Plain(String),
    Redacted,
}

impl SecretValue {
    pub fn as_plain(&self) -> Option<&str> {
        match self {
            Self::Plain(v) => Some(v),
            Self::Redacted => None,
        }
    }
}

impl fmt::Display for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plain(v) => f.write_str(v),
            Self::Redacted => f.write_str("[redacted]"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecretVariable {
    pub key: String,
    pub value: SecretValue,
    /// `None` for instance-level variables.
    pub owner: Option<NodeId>,
    pub tier: Tier,
    pub protected: bool,
    pub masked: bool,
    pub environment_scope: String,
    pub variable_type: String,
}

#[derive(Debug, Deserialize)]
struct VariableRecord {
    key: String,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    protected: bool,
    #[serde(default)]
    masked: bool,
    #[serde(default)]
    environment_scope: Option<String>,
    #[serde(default)]
    variable_type: Option<String>,
}

impl VariableRecord {
    fn into_variable(
        self,
        tier: Tier,
        owner: Option<NodeId>,
        reveal: RevealPolicy,
    ) -> SecretVariable {
        let hidden = self.protected || self.masked;
        let value = match (self.value, reveal) {
            (Some(v), RevealPolicy::Raw) => SecretValue::Plain(v),
            (Some(v), RevealPolicy::Redact) if !hidden => SecretValue::Plain(v),
            _ => SecretValue::Redacted,
        };
        SecretVariable {
            key: self.key,
            value,
            owner,
            tier,
            protected: self.protected,
            masked: self.masked,
            environment_scope: self.environment_scope.unwrap_or_else(|| "*".into()),
            variable_type: self.variable_type.unwrap_or_else(|| "env_var".into()),
        }
    }
}

/// One key after shadowing: the winner plus every value it hides.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedVariable {
    pub key: String,
    pub effective: SecretVariable,
    /// Losing definitions, nearest first.
    pub shadowed: Vec<SecretVariable>,
}

impl ResolvedVariable {
    /// Every definition of the key, effective first.
    pub fn all(&self) -> impl Iterator<Item = &SecretVariable> {
        std::iter::once(&self.effective).chain(self.shadowed.iter())
    }

    pub fn is_shadowing(&self) -> bool {
        !self.shadowed.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct EffectiveVariables {
    pub project: NodeId,
    /// Ordered by key.
    pub variables: Vec<ResolvedVariable>,
    /// Tiers or ancestors that could not be read.
    pub skipped: Vec<TierSkip>,
}

impl EffectiveVariables {
    pub fn get(&self, key: &str) -> Option<&ResolvedVariable> {
        self.variables.iter().find(|v| v.key == key)
    }

    /// Tier the effective value of `key` came from.
    pub fn source_tier(&self, key: &str) -> Option<Tier> {
        self.get(key).map(|v| v.effective.tier)
    }
}

// ---------------------------------------------------------------------------
// Collection
// ---------------------------------------------------------------------------

fn require_write_scope(ctx: &ReconContext, target: &str) -> Result<(), ReconError> {
    if ctx.token.scope_class().can_write_api() {
        Ok(())
    } else {
        Err(ReconError::InsufficientScope {
            target: target.to_owned(),
            reason: "api scope required".into(),
        })
    }
}

fn variables_path(tier: Tier, node: Option<NodeId>) -> Result<String, ReconError> {
    match (tier, node) {
        (Tier::Instance, None) => Ok("/admin/ci/variables".into()),
        (Tier::Group, Some(NodeId::Group(id))) => Ok(format!("/groups/{id}/variables")),
        (Tier::Project, Some(NodeId::Project(id))) => Ok(format!("/projects/{id}/variables")),
        (tier, node) => Err(ReconError::Configuration(format!(
            "no {tier}-level variables for {}",
            node.map_or_else(|| "the instance".to_owned(), |n| n.to_string())
        ))),
    }
}

/// Fetch the variables defined at exactly one tier of one node.
///
/// Instance variables need an administrator; other tokens get an
/// `AccessDenied` without a request being made.
#[tracing::instrument(skip(ctx), fields(%tier, node = ?node), err)]
pub async fn collect_variables(
    ctx: &ReconContext,
    tier: Tier,
    node: Option<NodeId>,
    reveal: RevealPolicy,
) -> Result<Vec<SecretVariable>, ReconError> {
    let path = variables_path(tier, node)?;
    let target = node.map_or_else(|| "instance".to_owned(), |n| n.to_string());
    require_write_scope(ctx, &target)?;

    if tier == Tier::Instance && !ctx.token.scope_class().is_admin() {
        return Err(ReconError::AccessDenied {
            target,
            cause: DenyCause::InsufficientRole,
        });
    }

    let items = ctx
        .client
        .get_all(ApiRequest::get(path))
        .await
        .map_err(|r| ReconError::from_refusal(&target, r))?;

    let mut out = Vec::with_capacity(items.len());
    for item in items {
        match serde_json::from_value::<VariableRecord>(item) {
            Ok(record) => out.push(record.into_variable(tier, node, reveal)),
            Err(e) => tracing::warn!(%target, error = %e, "skipping malformed variable"),
        }
    }
    tracing::debug!(count = out.len(), "variables collected");
    Ok(out)
}

/// Compose project, ancestor-group and instance variables for one project.
///
/// The nearest tier wins; within a tier the first listed definition wins.
/// Tiers that cannot be read are recorded in `skipped` and do not fail the
/// call. Only a missing `api` scope does.
#[tracing::instrument(skip(ctx, project, hierarchy), fields(project = %project.full_path), err)]
pub async fn resolve_effective(
    ctx: &ReconContext,
    project: &OrgNode,
    hierarchy: &Hierarchy,
    reveal: RevealPolicy,
) -> Result<EffectiveVariables, ReconError> {
    require_write_scope(ctx, &project.id.to_string())?;

    let mut skipped = Vec::new();
    let mut layers: Vec<Vec<SecretVariable>> = Vec::new();

    let mut sources = vec![(Tier::Project, Some(project.id))];
    sources.extend(
        hierarchy
            .ancestors(project.id)
            .into_iter()
            .map(|g| (Tier::Group, Some(g.id))),
    );
    sources.push((Tier::Instance, None));

    for (tier, node) in sources {
        match collect_variables(ctx, tier, node, reveal).await {
            Ok(vars) => layers.push(vars),
            Err(error) => {
                tracing::warn!(%tier, ?node, %error, "variable tier skipped");
                skipped.push(TierSkip { tier, node, error });
            }
        }
    }

    Ok(EffectiveVariables {
        project: project.id,
        variables: shadow(layers),
        skipped,
    })
}

/// Every variable readable from the instance, groups and projects of a walk.
#[derive(Debug, Clone, Default)]
pub struct SecretInventory {
    pub variables: Vec<SecretVariable>,
    pub skipped: Vec<TierSkip>,
}

/// Collect variables for every readable node of a walk on the bounded pool.
/// Results keep walk order; unreadable tiers land in `skipped`.
#[tracing::instrument(skip(ctx, hierarchy), fields(nodes = hierarchy.len()), err)]
pub async fn collect_hierarchy(
    ctx: &ReconContext,
    hierarchy: &Hierarchy,
    reveal: RevealPolicy,
) -> Result<SecretInventory, ReconError> {
    require_write_scope(ctx, "hierarchy")?;

    let mut sources = Vec::new();
    if ctx.token.scope_class().is_admin() {
        sources.push((Tier::Instance, None));
    }
    sources.extend(hierarchy.iter().filter(|n| n.is_readable()).map(|n| {
        let tier = if n.is_group() { Tier::Group } else { Tier::Project };
        (tier, Some(n.id))
    }));

    let results: Vec<_> = stream::iter(sources)
        .map(|(tier, node)| async move {
            (tier, node, collect_variables(ctx, tier, node, reveal).await)
        })
        .buffered(ctx.config.concurrency.max(1))
        .collect()
        .await;

    let mut inventory = SecretInventory::default();
    for (tier, node, result) in results {
        match result {
            Ok(vars) => inventory.variables.extend(vars),
            Err(error) => inventory.skipped.push(TierSkip { tier, node, error }),
        }
    }
    Ok(inventory)
}

/// Merge layers given nearest first.
pub fn shadow(layers: Vec<Vec<SecretVariable>>) -> Vec<ResolvedVariable> {
    let mut by_key: BTreeMap<String, ResolvedVariable> = BTreeMap::new();
    for var in layers.into_iter().flatten() {
        match by_key.get_mut(&var.key) {
            Some(resolved) => resolved.shadowed.push(var),
            None => {
                by_key.insert(
                    var.key.clone(),
                    ResolvedVariable {
                        key: var.key.clone(),
                        effective: var,
                        shadowed: Vec::new(),
                    },
                );
            }
        }
    }
    by_key.into_values().collect()
}
