//! Plain-text rendering of findings. Everything here writes to the given
//! sink; the binary passes stdout so logs on stderr never interleave.

use std::io::{self, Write};

use crate::branches::BranchProtections;
use crate::hierarchy::{Hierarchy, OrgNode, TierSkip, WalkReport};
use crate::identity::{PlatformMode, TokenContext};
use crate::ppe::AttackReport;
use crate::runners::{RunnerTopology, TagAnalysis, TagKind};
use crate::secrets::SecretInventory;

fn yes_no(b: bool) -> &'static str {
    if b { "yes" } else { "no" }
}

fn render_skips(out: &mut impl Write, skipped: &[TierSkip]) -> io::Result<()> {
    for skip in skipped {
        let node = skip
            .node
            .map_or_else(|| "instance".to_owned(), |n| n.to_string());
        writeln!(
            out,
            "  skipped {} tier ({node}): [{}] {}",
            skip.tier,
            skip.error.kind(),
            skip.error
        )?;
    }
    Ok(())
}

pub fn render_token(
    out: &mut impl Write,
    token: &TokenContext,
    mode: PlatformMode,
) -> io::Result<()> {
    let who = token.identity();
    writeln!(out, "== Token ==")?;
    writeln!(out, "  user:        {} (id {})", who.username, who.user_id)?;
    if let Some(name) = &who.name {
        writeln!(out, "  name:        {name}")?;
    }
    if let Some(email) = &who.email {
        writeln!(out, "  email:       {email}")?;
    }
    writeln!(out, "  admin:       {}", yes_no(who.is_admin))?;
    writeln!(out, "  bot:         {}", yes_no(who.bot))?;
    writeln!(out, "  token name:  {}", token.token_name().unwrap_or("-"))?;
    let scopes: Vec<&str> = token.scopes().collect();
    writeln!(
        out,
        "  scopes:      {}",
        if scopes.is_empty() { "-".to_owned() } else { scopes.join(", ") }
    )?;
    match token.expires_at() {
        Some(date) => writeln!(out, "  expires:     {date}")?,
        None => writeln!(out, "  expires:     never / unknown")?,
    }
    writeln!(out, "  scope class: {}", token.scope_class())?;
    writeln!(out, "  platform:    {mode}")
}

/// One line per node, indented by depth within the walk.
pub fn render_nodes(
    out: &mut impl Write,
    hierarchy: &Hierarchy,
    groups: bool,
    projects: bool,
) -> io::Result<()> {
    writeln!(out, "== Hierarchy ==")?;
    for node in hierarchy.iter() {
        if (node.is_group() && !groups) || (node.is_project() && !projects) {
            continue;
        }
        let depth = hierarchy.ancestors(node.id).len();
        render_node(out, node, depth)?;
    }
    Ok(())
}

fn render_node(out: &mut impl Write, node: &OrgNode, depth: usize) -> io::Result<()> {
    let kind = if node.is_group() { "G" } else { "P" };
    write!(
        out,
        "{:indent$}[{kind}] {} ({}) access={} status={}",
        "",
        node.full_path,
        node.id.raw(),
        node.access,
        node.status.label(),
        indent = 2 + depth * 2
    )?;
    if node.archived {
        write!(out, " archived")?;
    }
    writeln!(out)
}

pub fn render_walk_report(out: &mut impl Write, report: &WalkReport) -> io::Result<()> {
    writeln!(
        out,
        "  {} nodes, {} rate-limited responses{}",
        report.emitted,
        report.rate_limit_hits,
        if report.cancelled { ", cancelled" } else { "" }
    )?;
    if let Some(error) = &report.root_error {
        writeln!(out, "  start point failed: [{}] {error}", error.kind())?;
    }
    for (target, kind) in &report.incomplete {
        writeln!(out, "  incomplete: {target} [{kind}]")?;
    }
    for anomaly in &report.anomalies {
        writeln!(out, "  anomaly: {}: {}", anomaly.node, anomaly.detail)?;
    }
    if !report.unchecked.is_empty() {
        writeln!(out, "  {} groups left unchecked", report.unchecked.len())?;
    }
    Ok(())
}

pub fn render_secrets(
    out: &mut impl Write,
    inventory: &SecretInventory,
    hierarchy: &Hierarchy,
) -> io::Result<()> {
    writeln!(out, "== CI/CD variables ==")?;
    for var in &inventory.variables {
        let owner = var.owner.map_or_else(
            || "instance".to_owned(),
            |id| hierarchy.get(id).map_or_else(|| id.to_string(), |n| n.full_path.clone()),
        );
        let mut flags = Vec::new();
        if var.protected {
            flags.push("protected");
        }
        if var.masked {
            flags.push("masked");
        }
        if var.variable_type == "file" {
            flags.push("file");
        }
        writeln!(
            out,
            "  {owner} [{}] {}={} env={}{}",
            var.tier,
            var.key,
            var.value,
            var.environment_scope,
            if flags.is_empty() { String::new() } else { format!(" ({})", flags.join(", ")) }
        )?;
    }
    render_skips(out, &inventory.skipped)
}

pub fn render_runners(out: &mut impl Write, topology: &RunnerTopology) -> io::Result<()> {
    writeln!(out, "== Runners ==")?;
    for runner in &topology.runners {
        let tags: Vec<&str> = runner.tags.iter().map(String::as_str).collect();
        writeln!(
            out,
            "  #{} [{}] {} status={}{} tags=[{}]{}",
            runner.id,
            runner.tier,
            if runner.description.is_empty() { "-" } else { &runner.description },
            runner.status,
            if runner.paused { " paused" } else { "" },
            tags.join(", "),
            runner
                .owner
                .map(|o| format!(" owner={o}"))
                .unwrap_or_default()
        )?;
    }
    render_skips(out, &topology.skipped)
}

pub fn render_tag_analysis(
    out: &mut impl Write,
    path: &str,
    analysis: &TagAnalysis,
) -> io::Result<()> {
    writeln!(
        out,
        "== Workflow tags: {path} @ {} ==",
        analysis.git_ref.as_deref().unwrap_or("HEAD")
    )?;
    if !analysis.has_ci_file {
        return writeln!(out, "  no CI definition");
    }
    if let Some(error) = &analysis.parse_error {
        writeln!(out, "  CI definition does not parse: {error}")?;
    }
    for tag in &analysis.tags {
        let kind = match tag.kind {
            TagKind::JobTag => "",
            TagKind::VariableTag => " (variable)",
        };
        writeln!(out, "  {}: {}{kind}", tag.job, tag.tag)?;
    }
    for tag in &analysis.unserved {
        writeln!(out, "  no online runner carries '{tag}'")?;
    }
    Ok(())
}

pub fn render_protections(
    out: &mut impl Write,
    path: &str,
    protections: &BranchProtections,
) -> io::Result<()> {
    writeln!(out, "== Protected branches: {path} ==")?;
    writeln!(
        out,
        "  default branch {} protected: {}",
        protections.default_branch.as_deref().unwrap_or("-"),
        yes_no(protections.default_branch_protected())
    )?;
    for rule in &protections.rules {
        let level = |l: Option<crate::hierarchy::AccessLevel>| {
            l.map_or_else(|| "no one".to_owned(), |l| l.to_string())
        };
        writeln!(
            out,
            "  {} push={} merge={} force_push={} code_owners={}",
            rule.name,
            level(rule.push_access),
            level(rule.merge_access),
            yes_no(rule.allow_force_push),
            yes_no(rule.code_owner_approval_required)
        )?;
    }
    Ok(())
}

pub fn render_attack(out: &mut impl Write, report: &AttackReport) -> io::Result<()> {
    writeln!(out, "== Poisoned pipeline execution ==")?;
    writeln!(out, "  session:  {}", report.session)?;
    writeln!(
        out,
        "  project:  {}",
        report.project_path.as_deref().unwrap_or("-")
    )?;
    if let Some(branch) = &report.branch {
        writeln!(
            out,
            "  branch:   {branch}{}",
            if report.branch_created { " (created)" } else { " (reused)" }
        )?;
    }
    if let Some(id) = report.pipeline_id {
        writeln!(out, "  pipeline: {id}")?;
    }
    let trace: Vec<String> = report.trace.iter().map(ToString::to_string).collect();
    writeln!(out, "  states:   {}", trace.join(" -> "))?;

    match &report.outcome {
        Ok(()) if report.records.is_empty() => {
            writeln!(out, "  no variables beyond runner built-ins")?;
        }
        Ok(()) => {
            for record in &report.records {
                let tier = record
                    .source_tier
                    .map_or_else(|| "?".to_owned(), |t| t.to_string());
                writeln!(out, "  [{tier}] {}={}", record.key, record.value)?;
            }
        }
        Err(error) => writeln!(out, "  failed: [{}] {error}", error.kind())?,
    }
    for warning in &report.cleanup_warnings {
        writeln!(out, "  warning: {warning}")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hierarchy::{AccessLevel, NodeId, NodeStatus};

    fn node(id: NodeId, path: &str, parent: Option<NodeId>) -> OrgNode {
        OrgNode {
            id,
            full_path: path.into(),
            parent,
            archived: false,
            access: AccessLevel::Developer,
            status: if id.kind() == crate::hierarchy::NodeKind::Group {
                NodeStatus::Expanded
            } else {
                NodeStatus::Leaf
            },
            default_branch: None,
        }
    }

    #[test]
    fn nodes_are_indented_by_depth() {
        let g = NodeId::Group(1);
        let sub = NodeId::Group(2);
        let index = Hierarchy::from_nodes([
            node(g, "acme", None),
            node(sub, "acme/infra", Some(g)),
            node(NodeId::Project(9), "acme/infra/deploy", Some(sub)),
        ]);
        let mut buf = Vec::new();
        render_nodes(&mut buf, &index, true, true).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("\n  [G] acme (1)"));
        assert!(text.contains("\n    [G] acme/infra (2)"));
        assert!(text.contains("\n      [P] acme/infra/deploy (9)"));
    }

    #[test]
    fn project_filter_hides_groups() {
        let index = Hierarchy::from_nodes([
            node(NodeId::Group(1), "acme", None),
            node(NodeId::Project(9), "acme/app", Some(NodeId::Group(1))),
        ]);
        let mut buf = Vec::new();
        render_nodes(&mut buf, &index, false, true).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(!text.contains("[G]"));
        assert!(text.contains("[P] acme/app"));
    }
}
