use std::fmt;

use serde::Serialize;

use crate::classify::{DenyCause, Refusal};

/// Failure taxonomy surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidCredential,
    InsufficientScope,
    AccessDenied,
    NotFound,
    RateLimited,
    Unreachable,
    ConfigurationError,
    MissingParameter,
    Timeout,
    PipelineFailed,
    HarvestFailed,
    Cancelled,
    CleanupWarning,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidCredential => "InvalidCredential",
            Self::InsufficientScope => "InsufficientScope",
            Self::AccessDenied => "AccessDenied",
            Self::NotFound => "NotFound",
            Self::RateLimited => "RateLimited",
            Self::Unreachable => "Unreachable",
            Self::ConfigurationError => "ConfigurationError",
            Self::MissingParameter => "MissingParameter",
            Self::Timeout => "Timeout",
            Self::PipelineFailed => "PipelineFailed",
            Self::HarvestFailed => "HarvestFailed",
            Self::Cancelled => "Cancelled",
            Self::CleanupWarning => "CleanupWarning",
        }
    }

    /// Kinds that mean no meaningful work could start.
    pub fn is_fatal_at_start(self) -> bool {
        matches!(self, Self::InvalidCredential | Self::ConfigurationError)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ReconError {
    #[error("invalid credential: {0}")]
    InvalidCredential(String),

    #[error("insufficient scope on {target}: {reason}")]
    InsufficientScope { target: String, reason: String },

    #[error("access denied on {target}: {cause}")]
    AccessDenied { target: String, cause: DenyCause },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("rate limited on {0}; retries exhausted")]
    RateLimited(String),

    #[error("unreachable: {target}: {reason}")]
    Unreachable { target: String, reason: String },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("missing parameter: {0}")]
    MissingParameter(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("pipeline {pipeline_id} finished with status {status}")]
    PipelineFailed { pipeline_id: u64, status: String },

    #[error("harvest failed: {0}")]
    HarvestFailed(String),

    #[error("cancelled")]
    Cancelled,
}

impl ReconError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidCredential(_) => ErrorKind::InvalidCredential,
            Self::InsufficientScope { .. } => ErrorKind::InsufficientScope,
            Self::AccessDenied { .. } => ErrorKind::AccessDenied,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::RateLimited(_) => ErrorKind::RateLimited,
            Self::Unreachable { .. } => ErrorKind::Unreachable,
            Self::Configuration(_) => ErrorKind::ConfigurationError,
            Self::MissingParameter(_) => ErrorKind::MissingParameter,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::PipelineFailed { .. } => ErrorKind::PipelineFailed,
            Self::HarvestFailed(_) => ErrorKind::HarvestFailed,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Attach the node/session a refusal happened on.
    pub fn from_refusal(target: &str, refusal: Refusal) -> Self {
        match refusal {
            Refusal::Denied(DenyCause::Unauthenticated) => {
                Self::InvalidCredential(format!("{target}: token rejected"))
            }
            Refusal::Denied(DenyCause::InsufficientScope) => Self::InsufficientScope {
                target: target.to_owned(),
                reason: "token scope does not allow this call".into(),
            },
            Refusal::Denied(cause) => Self::AccessDenied {
                target: target.to_owned(),
                cause,
            },
            Refusal::NotFound => Self::NotFound(target.to_owned()),
            Refusal::RateLimited(_) => Self::RateLimited(target.to_owned()),
            Refusal::TransportFailure(reason) => Self::Unreachable {
                target: target.to_owned(),
                reason,
            },
        }
    }
}

/// Non-fatal: a cleanup step that did not complete. Never changes the
/// outcome it is attached to; surfaced so orphaned artifacts can be removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupWarning {
    pub step: String,
    pub artifact: String,
    pub reason: String,
}

impl CleanupWarning {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::CleanupWarning
    }
}

impl fmt::Display for CleanupWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cleanup step '{}' left {} behind: {}",
            self.step, self.artifact, self.reason
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refusal_conversion_keeps_target() {
        let err = ReconError::from_refusal("group 12", Refusal::NotFound);
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.to_string().contains("group 12"));
    }

    #[test]
    fn unauthenticated_becomes_invalid_credential() {
        let err = ReconError::from_refusal("/user", Refusal::Denied(DenyCause::Unauthenticated));
        assert_eq!(err.kind(), ErrorKind::InvalidCredential);
    }

    #[test]
    fn role_denial_is_access_denied() {
        let err = ReconError::from_refusal(
            "project 3",
            Refusal::Denied(DenyCause::InsufficientRole),
        );
        assert_eq!(err.kind(), ErrorKind::AccessDenied);
    }

    #[test]
    fn transport_failure_is_unreachable() {
        let err = ReconError::from_refusal("/user", Refusal::TransportFailure("refused".into()));
        assert_eq!(err.kind(), ErrorKind::Unreachable);
        assert!(err.to_string().contains("refused"));
    }

    #[test]
    fn only_credential_and_config_are_fatal_at_start() {
        assert!(ErrorKind::InvalidCredential.is_fatal_at_start());
        assert!(ErrorKind::ConfigurationError.is_fatal_at_start());
        assert!(!ErrorKind::Timeout.is_fatal_at_start());
        assert!(!ErrorKind::AccessDenied.is_fatal_at_start());
    }

    #[test]
    fn kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::MissingParameter).unwrap();
        assert_eq!(json, r#""missing_parameter""#);
    }

    #[test]
    fn cleanup_warning_display() {
        let w = CleanupWarning {
            step: "delete_branch".into(),
            artifact: "branch glrecon-1234abcd".into(),
            reason: "denied".into(),
        };
        assert_eq!(w.kind(), ErrorKind::CleanupWarning);
        assert!(w.to_string().contains("glrecon-1234abcd"));
    }
}
