//! Permission classification.
//!
//! Every upstream outcome passes through [`classify`] exactly once. Callers
//! work with the resulting [`Verdict`] and never inspect raw status codes.

use std::fmt;
use std::time::Duration;

use serde::de::DeserializeOwned;

use crate::error::ErrorKind;
use crate::transport::{ApiResponse, TransportError};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A successful answer. The body stays raw until a caller asks for a shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Granted {
    pub status: u16,
    pub body: String,
    pub next_page: Option<u32>,
}

impl Granted {
    /// Decode the body as JSON. A malformed body is reported as a transport
    /// failure: the upstream answered, but not with something usable.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, Refusal> {
        serde_json::from_str(&self.body)
            .map_err(|e| Refusal::TransportFailure(format!("malformed response body: {e}")))
    }
}

/// Why a request was refused.
///
/// `InsufficientScope` vs `InsufficientRole` is inferred from the error text
/// of a 403 and is advisory only: the upstream does not promise a stable
/// message, so a scope problem may be reported as a role problem and vice versa.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyCause {
    /// 401: the credential itself was not accepted.
    Unauthenticated,
    /// 403 whose message points at the token's scopes.
    InsufficientScope,
    /// 403 without a scope hint; usually the member role is too low.
    InsufficientRole,
    /// Any other 4xx the upstream used to refuse the request.
    Rejected { status: u16, message: String },
}

impl fmt::Display for DenyCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unauthenticated => f.write_str("unauthenticated"),
            Self::InsufficientScope => f.write_str("insufficient scope (advisory)"),
            Self::InsufficientRole => f.write_str("insufficient role (advisory)"),
            Self::Rejected { status, message } => write!(f, "rejected ({status}): {message}"),
        }
    }
}

/// The non-granted outcomes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Refusal {
    #[error("denied: {0}")]
    Denied(DenyCause),

    #[error("not found")]
    NotFound,

    #[error("rate limited")]
    RateLimited(Option<Duration>),

    #[error("transport failure: {0}")]
    TransportFailure(String),
}

impl Refusal {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Denied(DenyCause::Unauthenticated) => ErrorKind::InvalidCredential,
            Self::Denied(DenyCause::InsufficientScope) => ErrorKind::InsufficientScope,
            Self::Denied(_) => ErrorKind::AccessDenied,
            Self::NotFound => ErrorKind::NotFound,
            Self::RateLimited(_) => ErrorKind::RateLimited,
            Self::TransportFailure(_) => ErrorKind::Unreachable,
        }
    }

    pub fn is_denied(&self) -> bool {
        matches!(self, Self::Denied(_))
    }
}

/// Semantic outcome of one request: `Ok` is Granted, `Err` one of the refusals.
pub type Verdict = Result<Granted, Refusal>;

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Turn a raw gateway outcome into a [`Verdict`].
pub fn classify(outcome: Result<ApiResponse, TransportError>) -> Verdict {
    let resp = match outcome {
        Ok(resp) => resp,
        Err(err) => return Err(Refusal::TransportFailure(err.to_string())),
    };

    match resp.status {
        200..=299 => Ok(Granted {
            status: resp.status,
            body: resp.body,
            next_page: resp.next_page,
        }),
        401 => Err(Refusal::Denied(DenyCause::Unauthenticated)),
        403 => {
            let cause = if mentions_scope(&resp.body) {
                DenyCause::InsufficientScope
            } else {
                DenyCause::InsufficientRole
            };
            Err(Refusal::Denied(cause))
        }
        404 => Err(Refusal::NotFound),
        429 => Err(Refusal::RateLimited(resp.retry_after)),
        400..=499 => Err(Refusal::Denied(DenyCause::Rejected {
            status: resp.status,
            message: error_message(&resp.body),
        })),
        status => Err(Refusal::TransportFailure(format!(
            "upstream returned status {status}"
        ))),
    }
}

/// Phrases GitLab uses when the token's scopes, not the member role, are
/// the problem.
const SCOPE_HINTS: &[&str] = &["insufficient_scope", "token scope", "scopes"];

/// Best-effort scope hint. GitLab answers scope problems with
/// `{"error":"insufficient_scope", ...}` or a message naming the token scope.
fn mentions_scope(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    SCOPE_HINTS.iter().any(|hint| lower.contains(hint))
}

/// Pull a human-readable message out of an error body.
fn error_message(body: &str) -> String {
    let parsed: Option<serde_json::Value> = serde_json::from_str(body).ok();
    let from_json = parsed.as_ref().and_then(|v| {
        let field = v.get("message").or_else(|| v.get("error"))?;
        Some(match field {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    });

    from_json.unwrap_or_else(|| body.chars().take(200).collect())
}
