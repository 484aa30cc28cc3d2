use std::io::{self, Write};
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use glrecon::branches::check_branch_protections;
use glrecon::config::Config;
use glrecon::context::ReconContext;
use glrecon::error::ReconError;
use glrecon::hierarchy::{Hierarchy, OrgNode, WalkOptions, enumerate, fetch_project, lineage};
use glrecon::identity::Credential;
use glrecon::ppe::{AttackRequest, run_attack};
use glrecon::report;
use glrecon::runners::{RunnerTopology, analyze_workflow_tags, map_runners};
use glrecon::secrets::{RevealPolicy, collect_hierarchy};

/// Credential-scoped GitLab reconnaissance.
#[derive(Debug, Parser)]
#[command(name = "glrecon", version, about, long_about = None)]
struct Cli {
    /// GitLab base URL (overrides GLRECON_URL)
    #[arg(short = 'u', long)]
    url: Option<String>,

    /// Access token
    #[arg(long, env = "GL_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Token, group, project and secret enumeration in one pass
    #[arg(long)]
    self_enumeration: bool,

    /// Show who the token belongs to and what it may do
    #[arg(long)]
    enumerate_token: bool,

    /// List reachable groups
    #[arg(long)]
    enumerate_groups: bool,

    /// List reachable projects
    #[arg(long)]
    enumerate_projects: bool,

    /// Collect CI/CD variables across the walk (needs an api-scoped token)
    #[arg(long)]
    enumerate_secrets: bool,

    /// Map instance, group and project runners
    #[arg(long)]
    enumerate_runners: bool,

    /// Compare CI job tags against online runners
    #[arg(long)]
    analyze_workflow_tags: bool,

    /// Summarise protected branches
    #[arg(long)]
    check_branch_protections: bool,

    /// Walk archived projects as well
    #[arg(long, conflicts_with = "archived_only")]
    include_archived: bool,

    /// Walk archived projects only
    #[arg(long)]
    archived_only: bool,

    /// Start the walk at this group (path or id)
    #[arg(long)]
    root_group: Option<String>,

    /// Harvest secrets by running an injected pipeline in --project-path
    #[arg(long)]
    exfil_secrets_via_ppe: bool,

    /// Target project (path or id)
    #[arg(long)]
    project_path: Option<String>,

    /// Branch to inject on; a fresh one is created when omitted
    #[arg(long)]
    branch: Option<String>,

    /// Polling ceiling for the injected pipeline, in seconds
    #[arg(long, value_name = "SECS")]
    ppe_timeout: Option<u64>,

    /// Print protected and masked values instead of placeholders
    #[arg(long)]
    raw_secrets: bool,

    /// Concurrent requests during enumeration
    #[arg(long)]
    concurrency: Option<usize>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

impl Cli {
    /// Fold `--self-enumeration` into the switches it stands for. Archive
    /// and root options keep applying to the walk.
    fn expand_self_enumeration(&mut self) {
        if self.self_enumeration {
            self.enumerate_token = true;
            self.enumerate_groups = true;
            self.enumerate_projects = true;
            self.enumerate_secrets = true;
        }
    }

    fn apply(&self, config: &mut Config) {
        if let Some(url) = &self.url {
            config.gitlab_url.clone_from(url);
        }
        if let Some(secs) = self.ppe_timeout {
            config.ppe_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = self.concurrency {
            config.concurrency = n;
        }
    }

    fn per_project(&self) -> bool {
        self.analyze_workflow_tags || self.check_branch_protections
    }

    fn needs_walk(&self) -> bool {
        self.enumerate_groups
            || self.enumerate_projects
            || self.enumerate_secrets
            || self.enumerate_runners
            || (self.per_project() && self.project_path.is_none())
    }

    fn nothing_selected(&self) -> bool {
        !self.enumerate_token && !self.needs_walk() && !self.per_project() && !self.exfil_secrets_via_ppe
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_env("GLRECON_LOG").unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json().with_writer(io::stderr)).init();
    } else {
        registry.with(fmt::layer().with_writer(io::stderr)).init();
    }
}

async fn cancel_on_interrupt(cancel: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::warn!("interrupt received, winding down");
        cancel.cancel();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let mut cli = Cli::parse();
    cli.expand_self_enumeration();
    init_tracing(cli.log_json);

    let mut config = Config::load();
    cli.apply(&mut config);

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_interrupt(cancel.clone()));

    match run(&cli, config, &cancel).await {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(err) => {
            match err.downcast_ref::<ReconError>() {
                Some(recon) => eprintln!("glrecon: [{}] {recon}", recon.kind()),
                None => eprintln!("glrecon: {err:#}"),
            }
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn run(cli: &Cli, config: Config, cancel: &CancellationToken) -> anyhow::Result<()> {
    let credential = Credential::new(cli.token.clone().unwrap_or_default());
    let ctx = ReconContext::establish(config, credential).await?;
    let mut out = io::stdout().lock();

    if cli.enumerate_token || cli.nothing_selected() {
        report::render_token(&mut out, &ctx.token, ctx.mode)?;
    }

    let mut hierarchy = Hierarchy::default();
    if cli.needs_walk() {
        let options = WalkOptions {
            include_archived: cli.include_archived,
            archived_only: cli.archived_only,
            root: cli.root_group.clone(),
        };
        let (nodes, walk) = enumerate(&ctx, options, cancel)?.drain().await;
        hierarchy = Hierarchy::from_nodes(nodes);

        if cli.enumerate_groups || cli.enumerate_projects {
            report::render_nodes(&mut out, &hierarchy, cli.enumerate_groups, cli.enumerate_projects)?;
            report::render_walk_report(&mut out, &walk)?;
        }
        if let Some(error) = walk.root_error {
            return Err(error.into());
        }
        if walk.cancelled {
            return Err(ReconError::Cancelled.into());
        }
    }

    if cli.enumerate_secrets {
        let reveal = if cli.raw_secrets {
            RevealPolicy::Raw
        } else {
            RevealPolicy::Redact
        };
        let inventory = collect_hierarchy(&ctx, &hierarchy, reveal).await?;
        report::render_secrets(&mut out, &inventory, &hierarchy)?;
    }

    let mut topology: Option<RunnerTopology> = None;
    if cli.enumerate_runners {
        let mapped = map_runners(&ctx, &hierarchy).await;
        report::render_runners(&mut out, &mapped)?;
        topology = Some(mapped);
    }

    if cli.per_project() {
        let targets: Vec<OrgNode> = match &cli.project_path {
            Some(path) => vec![fetch_project(&ctx, path).await?],
            None => hierarchy
                .projects()
                .filter(|p| p.is_readable())
                .cloned()
                .collect(),
        };

        if cli.analyze_workflow_tags && topology.is_none() {
            let scope = match targets.as_slice() {
                [single] if cli.project_path.is_some() => lineage(&ctx, single).await,
                _ => hierarchy.clone(),
            };
            topology = Some(map_runners(&ctx, &scope).await);
        }

        for project in &targets {
            if cancel.is_cancelled() {
                return Err(ReconError::Cancelled.into());
            }
            if let Some(topology) = &topology {
                match analyze_workflow_tags(&ctx, project, topology).await {
                    Ok(analysis) => {
                        report::render_tag_analysis(&mut out, &project.full_path, &analysis)?;
                    }
                    Err(error) if cli.project_path.is_none() => {
                        tracing::warn!(project = %project.full_path, %error, "workflow tags skipped");
                    }
                    Err(error) => return Err(error.into()),
                }
            }
            if cli.check_branch_protections {
                match check_branch_protections(&ctx, project).await {
                    Ok(protections) => {
                        report::render_protections(&mut out, &project.full_path, &protections)?;
                    }
                    Err(error) if cli.project_path.is_none() => {
                        tracing::warn!(project = %project.full_path, %error, "branch protections skipped");
                    }
                    Err(error) => return Err(error.into()),
                }
            }
        }
    }

    if cli.exfil_secrets_via_ppe {
        let request = AttackRequest {
            project: cli.project_path.clone(),
            branch: cli.branch.clone(),
        };
        let attack = run_attack(&ctx, request, cancel).await;
        report::render_attack(&mut out, &attack)?;
        out.flush()?;
        if let Err(error) = attack.outcome {
            return Err(error.into());
        }
    }

    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn archived_flags_conflict() {
        let parsed = Cli::try_parse_from(["glrecon", "--include-archived", "--archived-only"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn bare_invocation_shows_token() {
        let cli = Cli::try_parse_from(["glrecon"]).unwrap();
        assert!(cli.nothing_selected());
        assert!(!cli.needs_walk());
    }

    #[test]
    fn per_project_checks_walk_without_target() {
        let cli = Cli::try_parse_from(["glrecon", "--check-branch-protections"]).unwrap();
        assert!(cli.needs_walk());
        let cli = Cli::try_parse_from([
            "glrecon",
            "--check-branch-protections",
            "--project-path",
            "acme/app",
        ])
        .unwrap();
        assert!(!cli.needs_walk());
    }

    #[test]
    fn self_enumeration_implies_the_enumerations() {
        let mut cli = Cli::try_parse_from(["glrecon", "--self-enumeration"]).unwrap();
        cli.expand_self_enumeration();
        assert!(cli.enumerate_token);
        assert!(cli.enumerate_groups);
        assert!(cli.enumerate_projects);
        assert!(cli.enumerate_secrets);
        assert!(!cli.enumerate_runners);
        assert!(!cli.exfil_secrets_via_ppe);
        assert!(cli.needs_walk());
        assert!(!cli.nothing_selected());
    }

    #[test]
    fn self_enumeration_keeps_archive_flags() {
        let mut cli =
            Cli::try_parse_from(["glrecon", "--self-enumeration", "--include-archived"]).unwrap();
        cli.expand_self_enumeration();
        assert!(cli.include_archived);
        assert!(!cli.archived_only);

        let parsed = Cli::try_parse_from([
            "glrecon",
            "--self-enumeration",
            "--include-archived",
            "--archived-only",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn overrides_apply_to_config() {
        let cli = Cli::try_parse_from([
            "glrecon",
            "-u",
            "https://gitlab.example.com",
            "--ppe-timeout",
            "90",
            "--concurrency",
            "8",
        ])
        .unwrap();
        let mut config = Config::default();
        cli.apply(&mut config);
        assert_eq!(config.gitlab_url, "https://gitlab.example.com");
        assert_eq!(config.ppe_timeout, Duration::from_secs(90));
        assert_eq!(config.concurrency, 8);
    }
}
