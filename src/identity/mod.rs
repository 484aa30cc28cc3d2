//! Identity resolution: who the token belongs to and how much it may do.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::classify::Refusal;
use crate::client::ApiClient;
use crate::error::ReconError;

// ---------------------------------------------------------------------------
// Credential
// ---------------------------------------------------------------------------

/// The raw access token. `Debug` and `Display` only ever show a short prefix.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// The full secret, for the transport only.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }

    fn redacted(&self) -> String {
        let prefix: String = self.0.chars().take(4).collect();
        format!("{prefix}****")
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credential({})", self.redacted())
    }
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

// ---------------------------------------------------------------------------
// Scope class
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeClass {
    /// `api`: full read/write API access.
    FullApi,
    /// `read_api` only.
    ReadOnly,
    /// `read_api` + `write_repository`: can push code (and therefore run
    /// pipelines) but cannot call write endpoints.
    Executive,
    /// Administrator account or a `sudo`/`admin_mode` scope.
    Admin,
    Unknown,
}

impl ScopeClass {
    /// May call write endpoints (variables, branches, pipelines).
    pub fn can_write_api(self) -> bool {
        matches!(self, Self::FullApi | Self::Admin)
    }

    pub fn is_admin(self) -> bool {
        self == Self::Admin
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::FullApi => "full-api",
            Self::ReadOnly => "read-only",
            Self::Executive => "executive",
            Self::Admin => "admin",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ScopeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse classification of a token's declared scopes. First match wins.
pub fn derive_scope_class<S: AsRef<str>>(scopes: &[S], is_admin: bool) -> ScopeClass {
    let has = |name: &str| scopes.iter().any(|s| s.as_ref() == name);

    if is_admin || has("sudo") || has("admin_mode") {
        ScopeClass::Admin
    } else if has("api") {
        ScopeClass::FullApi
    } else if has("read_api") && has("write_repository") {
        ScopeClass::Executive
    } else if has("read_api") {
        ScopeClass::ReadOnly
    } else {
        ScopeClass::Unknown
    }
}

// ---------------------------------------------------------------------------
// Platform mode
// ---------------------------------------------------------------------------

/// Multi-tenant SaaS vs. a dedicated self-hosted instance. Decides which
/// listing calls are worth making.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlatformMode {
    Saas,
    SelfHosted,
}

impl PlatformMode {
    pub fn detect(base_url: &url::Url) -> Self {
        match base_url.host_str() {
            Some(host) if host == "gitlab.com" || host.ends_with(".gitlab.com") => Self::Saas,
            _ => Self::SelfHosted,
        }
    }
}

impl fmt::Display for PlatformMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Saas => "saas",
            Self::SelfHosted => "self-hosted",
        })
    }
}

// ---------------------------------------------------------------------------
// Token context
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    #[serde(rename = "id")]
    pub user_id: u64,
    pub username: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default)]
    pub bot: bool,
}

#[derive(Debug, Deserialize)]
struct TokenSelf {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    scopes: Vec<String>,
    #[serde(default)]
    expires_at: Option<chrono::NaiveDate>,
}

/// Resolved credential. Only [`resolve_identity`] creates one, and nothing
/// mutates it afterwards.
#[derive(Debug, Clone)]
pub struct TokenContext {
    credential: Credential,
    identity: Identity,
    token_name: Option<String>,
    scopes: BTreeSet<String>,
    expires_at: Option<chrono::NaiveDate>,
    scope_class: ScopeClass,
}

impl TokenContext {
    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn user_id(&self) -> u64 {
        self.identity.user_id
    }

    pub fn token_name(&self) -> Option<&str> {
        self.token_name.as_deref()
    }

    pub fn scopes(&self) -> impl Iterator<Item = &str> {
        self.scopes.iter().map(String::as_str)
    }

    pub fn expires_at(&self) -> Option<chrono::NaiveDate> {
        self.expires_at
    }

    pub fn scope_class(&self) -> ScopeClass {
        self.scope_class
    }
}

/// Resolve a credential to its owner and scope class.
///
/// `GET /user` is the gate: any denial there means the token is unusable.
/// Token metadata is best effort; without it the scope class is `Unknown`
/// unless the account itself is an administrator.
#[tracing::instrument(skip(client, credential), fields(token = %credential), err)]
pub async fn resolve_identity(
    client: &ApiClient,
    credential: Credential,
) -> Result<TokenContext, ReconError> {
    if credential.is_empty() {
        return Err(ReconError::MissingParameter("token".into()));
    }

    let identity: Identity = match client.get("/user").await {
        Ok(granted) => granted
            .json()
            .map_err(|r| ReconError::from_refusal("/user", r))?,
        Err(Refusal::Denied(cause)) => {
            return Err(ReconError::InvalidCredential(format!(
                "token rejected by /user: {cause}"
            )));
        }
        Err(Refusal::NotFound) => {
            return Err(ReconError::Unreachable {
                target: "/user".into(),
                reason: "no GitLab API at this address".into(),
            });
        }
        Err(other) => return Err(ReconError::from_refusal("/user", other)),
    };

    let token_self = match client.get("/personal_access_tokens/self").await {
        Ok(granted) => match granted.json::<TokenSelf>() {
            Ok(t) => Some(t),
            Err(e) => {
                tracing::warn!(error = %e, "token metadata unreadable");
                None
            }
        },
        Err(refusal) => {
            tracing::warn!(error = %refusal, "token metadata unavailable; scopes unknown");
            None
        }
    };

    let (token_name, scopes, expires_at) = match token_self {
        Some(t) => (t.name, t.scopes, t.expires_at),
        None => (None, Vec::new(), None),
    };
    let scope_class = derive_scope_class(&scopes, identity.is_admin);

    tracing::info!(
        username = %identity.username,
        user_id = identity.user_id,
        %scope_class,
        "identity resolved"
    );

    Ok(TokenContext {
        credential,
        identity,
        token_name,
        scopes: scopes.into_iter().collect(),
        expires_at,
        scope_class,
    })
}
