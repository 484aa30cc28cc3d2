//! Runner tags requested by a project's CI definition, and whether any
//! online runner can pick them up.

use serde::Serialize;
use serde_yaml::Value;

use super::RunnerTopology;
use crate::classify::Refusal;
use crate::context::ReconContext;
use crate::error::ReconError;
use crate::hierarchy::{NodeId, OrgNode};
use crate::transport::{ApiRequest, encode_path};

pub const CI_FILE: &str = ".gitlab-ci.yml";

/// Top-level keys that configure the pipeline rather than define a job.
const RESERVED_KEYS: &[&str] = &[
    "default",
    "include",
    "stages",
    "variables",
    "workflow",
    "image",
    "services",
    "cache",
    "before_script",
    "after_script",
    "types",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TagKind {
    /// A literal tag.
    JobTag,
    /// Expanded from a CI variable at runtime; cannot be matched statically.
    VariableTag,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkflowTag {
    pub job: String,
    pub tag: String,
    pub kind: TagKind,
}

#[derive(Debug, Clone, Serialize)]
pub struct TagAnalysis {
    pub project: NodeId,
    pub git_ref: Option<String>,
    pub has_ci_file: bool,
    /// Set when the CI file exists but is not valid YAML.
    pub parse_error: Option<String>,
    pub tags: Vec<WorkflowTag>,
    /// Static tags no online runner carries.
    pub unserved: Vec<String>,
}

fn string_list(v: Option<&Value>) -> Option<Vec<String>> {
    let seq = v?.as_sequence()?;
    Some(
        seq.iter()
            .filter_map(|t| match t {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect(),
    )
}

/// Pull per-job runner tags out of a CI definition, in document order.
/// Jobs without their own `tags` inherit `default: tags`.
pub fn extract_tags(yaml: &str) -> Result<Vec<WorkflowTag>, serde_yaml::Error> {
    if yaml.trim().is_empty() {
        return Ok(Vec::new());
    }
    let doc: Value = serde_yaml::from_str(yaml)?;
    let Some(map) = doc.as_mapping() else {
        return Ok(Vec::new());
    };

    let default_tags = string_list(
        map.get("default")
            .and_then(Value::as_mapping)
            .and_then(|d| d.get("tags")),
    );

    let mut out = Vec::new();
    for (key, body) in map {
        let Some(job) = key.as_str() else { continue };
        if job.starts_with('.') || RESERVED_KEYS.contains(&job) {
            continue;
        }
        let Some(body) = body.as_mapping() else { continue };

        let tags = string_list(body.get("tags")).or_else(|| default_tags.clone());
        for tag in tags.unwrap_or_default() {
            let kind = if tag.contains('$') {
                TagKind::VariableTag
            } else {
                TagKind::JobTag
            };
            out.push(WorkflowTag {
                job: job.to_owned(),
                tag,
                kind,
            });
        }
    }
    Ok(out)
}

/// Read the project's CI file at its default branch and cross-check the
/// requested tags against the mapped runners. A project without a CI file
/// yields an empty analysis.
#[tracing::instrument(skip(ctx, project, topology), fields(project = %project.full_path), err)]
pub async fn analyze_workflow_tags(
    ctx: &ReconContext,
    project: &OrgNode,
    topology: &RunnerTopology,
) -> Result<TagAnalysis, ReconError> {
    let NodeId::Project(id) = project.id else {
        return Err(ReconError::MissingParameter(format!(
            "{} is a group, not a project",
            project.full_path
        )));
    };
    let git_ref = project.default_branch.clone();

    let mut req = ApiRequest::get(format!(
        "/projects/{id}/repository/files/{}/raw",
        encode_path(CI_FILE)
    ));
    if let Some(r) = &git_ref {
        req = req.param("ref", r);
    }

    let yaml = match ctx.client.send(req).await {
        Ok(granted) => granted.body,
        Err(Refusal::NotFound) => {
            return Ok(TagAnalysis {
                project: project.id,
                git_ref,
                has_ci_file: false,
                parse_error: None,
                tags: Vec::new(),
                unserved: Vec::new(),
            });
        }
        Err(refusal) => return Err(ReconError::from_refusal(&project.full_path, refusal)),
    };

    let (tags, parse_error) = match extract_tags(&yaml) {
        Ok(tags) => (tags, None),
        Err(e) => {
            tracing::warn!(error = %e, "unparsable {CI_FILE}");
            (Vec::new(), Some(e.to_string()))
        }
    };

    let mut unserved: Vec<String> = tags
        .iter()
        .filter(|t| t.kind == TagKind::JobTag && !topology.serves_tag(&t.tag))
        .map(|t| t.tag.clone())
        .collect();
    unserved.sort();
    unserved.dedup();

    if !unserved.is_empty() {
        tracing::warn!(?unserved, "jobs request tags no online runner carries");
    }

    Ok(TagAnalysis {
        project: project.id,
        git_ref,
        has_ci_file: true,
        parse_error,
        tags,
        unserved,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const PIPELINE: &str = r#"
stages: [build, test]
variables:
  RUNNER: gpu
default:
  tags: [shared-docker]
.template:
  tags: [hidden]
build:
  stage: build
  tags: [linux, "$RUNNER_TAG"]
  script: [make]
test:
  stage: test
  script: [make test]
deploy:
  tags:
    - prod-deployer
  script: [./deploy.sh]
"#;

    #[test]
    fn extracts_job_and_variable_tags_in_order() {
        let tags = extract_tags(PIPELINE).unwrap();
        let flat: Vec<(&str, &str, TagKind)> = tags
            .iter()
            .map(|t| (t.job.as_str(), t.tag.as_str(), t.kind))
            .collect();
        assert_eq!(
            flat,
            vec![
                ("build", "linux", TagKind::JobTag),
                ("build", "$RUNNER_TAG", TagKind::VariableTag),
                ("test", "shared-docker", TagKind::JobTag),
                ("deploy", "prod-deployer", TagKind::JobTag),
            ]
        );
    }

    #[test]
    fn hidden_jobs_and_reserved_keys_skipped() {
        let tags = extract_tags(PIPELINE).unwrap();
        assert!(tags.iter().all(|t| t.tag != "hidden"));
        assert!(tags.iter().all(|t| t.job != "variables" && t.job != "default"));
    }

    #[test]
    fn empty_document_has_no_tags() {
        assert!(extract_tags("").unwrap().is_empty());
    }

    #[test]
    fn malformed_yaml_is_an_error() {
        assert!(extract_tags("build: [unclosed").is_err());
    }
}
