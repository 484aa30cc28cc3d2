#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use glrecon::config::Config;
use glrecon::context::ReconContext;
use glrecon::identity::{Credential, PlatformMode};
use glrecon::transport::{ApiRequest, ApiResponse, Method, Transport, TransportError};

pub const USER_ID: u64 = 7;

#[derive(Debug, Clone)]
pub enum Reply {
    Answer(ApiResponse),
    Fail(TransportError),
    /// Answers after the given delay.
    Delayed(Duration, ApiResponse),
    /// Never answers; for cancellation tests.
    Hang,
}

/// Computes a reply from every request seen so far, the current one last.
pub type Responder = Arc<dyn Fn(&[ApiRequest]) -> ApiResponse + Send + Sync>;

/// Scripted in-memory gateway keyed by method and path.
///
/// Each route holds a queue of replies; the last one repeats once the queue
/// is down to it. Unknown routes answer 404. Every request is recorded.
#[derive(Default)]
pub struct MockTransport {
    routes: Mutex<HashMap<(Method, String), VecDeque<Reply>>>,
    responders: Mutex<HashMap<(Method, String), Responder>>,
    calls: Mutex<Vec<ApiRequest>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reply(&self, method: Method, path: &str, reply: Reply) -> &Self {
        self.routes
            .lock()
            .unwrap()
            .entry((method, path.to_owned()))
            .or_default()
            .push_back(reply);
        self
    }

    pub fn json(&self, method: Method, path: &str, status: u16, body: Value) -> &Self {
        self.reply(method, path, Reply::Answer(ApiResponse::json(status, &body)))
    }

    pub fn get(&self, path: &str, body: Value) -> &Self {
        self.json(Method::Get, path, 200, body)
    }

    pub fn text(&self, method: Method, path: &str, status: u16, body: &str) -> &Self {
        self.reply(method, path, Reply::Answer(ApiResponse::new(status, body)))
    }

    pub fn status(&self, method: Method, path: &str, status: u16) -> &Self {
        self.text(method, path, status, "{}")
    }

    pub fn fail(&self, method: Method, path: &str) -> &Self {
        self.reply(
            method,
            path,
            Reply::Fail(TransportError::Connect("connection reset".into())),
        )
    }

    pub fn delayed(&self, path: &str, delay: Duration, body: Value) -> &Self {
        self.reply(
            Method::Get,
            path,
            Reply::Delayed(delay, ApiResponse::json(200, &body)),
        )
    }

    pub fn hang(&self, method: Method, path: &str) -> &Self {
        self.reply(method, path, Reply::Hang)
    }

    /// Route answered by `f`; takes precedence over queued replies.
    pub fn respond_with(
        &self,
        method: Method,
        path: &str,
        f: impl Fn(&[ApiRequest]) -> ApiResponse + Send + Sync + 'static,
    ) -> &Self {
        self.responders
            .lock()
            .unwrap()
            .insert((method, path.to_owned()), Arc::new(f));
        self
    }

    pub fn calls(&self) -> Vec<ApiRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, method: Method, path: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.method == method && r.path == path)
            .count()
    }

    pub fn called(&self, method: Method, path: &str) -> bool {
        self.count(method, path) > 0
    }

    /// Calls made after identity resolution.
    pub fn work_calls(&self) -> Vec<ApiRequest> {
        self.calls()
            .into_iter()
            .filter(|r| r.path != "/user" && r.path != "/personal_access_tokens/self")
            .collect()
    }

    fn next_reply(&self, method: Method, path: &str) -> Option<Reply> {
        let mut routes = self.routes.lock().unwrap();
        let queue = routes.get_mut(&(method, path.to_owned()))?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn request(&self, req: ApiRequest) -> Result<ApiResponse, TransportError> {
        let (method, path) = (req.method, req.path.clone());
        self.calls.lock().unwrap().push(req);
        let responder = self
            .responders
            .lock()
            .unwrap()
            .get(&(method, path.clone()))
            .cloned();
        if let Some(f) = responder {
            return Ok(f(&self.calls()));
        }
        match self.next_reply(method, &path) {
            Some(Reply::Answer(resp)) => Ok(resp),
            Some(Reply::Fail(err)) => Err(err),
            Some(Reply::Delayed(delay, resp)) => {
                tokio::time::sleep(delay).await;
                Ok(resp)
            }
            Some(Reply::Hang) => std::future::pending::<Result<ApiResponse, TransportError>>().await,
            None => Ok(ApiResponse::new(404, r#"{"message":"404 Not Found"}"#)),
        }
    }
}

// ---------------------------------------------------------------------------
// Context builders
// ---------------------------------------------------------------------------

pub fn test_config() -> Config {
    Config {
        gitlab_url: "https://gitlab.example.com".into(),
        concurrency: 2,
        initial_backoff: Duration::from_millis(10),
        ppe_timeout: Duration::from_secs(30),
        poll_interval: Duration::from_secs(2),
        ..Config::default()
    }
}

/// Script `/user` and the token self-lookup.
pub fn identity(mock: &MockTransport, scopes: &[&str], is_admin: bool) {
    mock.get(
        "/user",
        serde_json::json!({
            "id": USER_ID,
            "username": "alice",
            "name": "Alice",
            "is_admin": is_admin,
        }),
    );
    mock.get(
        "/personal_access_tokens/self",
        serde_json::json!({ "name": "recon", "scopes": scopes }),
    );
}

pub async fn connect(mock: &Arc<MockTransport>, config: Config) -> ReconContext {
    ReconContext::connect(mock.clone(), config, Credential::new("glpat-test-token"))
        .await
        .expect("context")
}

/// Self-hosted context with an `api` token.
pub async fn api_context(mock: &Arc<MockTransport>) -> ReconContext {
    identity(mock, &["api"], false);
    connect(mock, test_config()).await
}

pub async fn admin_context(mock: &Arc<MockTransport>) -> ReconContext {
    identity(mock, &["api"], true);
    connect(mock, test_config()).await
}

pub async fn read_only_context(mock: &Arc<MockTransport>) -> ReconContext {
    identity(mock, &["read_api"], false);
    connect(mock, test_config()).await
}

pub async fn saas_context(mock: &Arc<MockTransport>) -> ReconContext {
    identity(mock, &["api"], false);
    let config = Config {
        platform_mode: Some(PlatformMode::Saas),
        ..test_config()
    };
    connect(mock, config).await
}

// ---------------------------------------------------------------------------
// Upstream records
// ---------------------------------------------------------------------------

pub fn group(id: u64, full_path: &str, parent: Option<u64>) -> Value {
    serde_json::json!({
        "id": id,
        "full_path": full_path,
        "parent_id": parent,
        "archived": false,
    })
}

pub fn project(id: u64, path: &str, namespace: Option<u64>, archived: bool) -> Value {
    let namespace = match namespace {
        Some(ns) => serde_json::json!({ "id": ns, "kind": "group" }),
        None => serde_json::json!({ "id": 999, "kind": "user" }),
    };
    serde_json::json!({
        "id": id,
        "path_with_namespace": path,
        "archived": archived,
        "default_branch": "main",
        "namespace": namespace,
    })
}

/// Script a group with its direct subgroups and projects.
pub fn group_children(mock: &MockTransport, id: u64, subgroups: Value, projects: Value) {
    mock.get(&format!("/groups/{id}/subgroups"), subgroups);
    mock.get(&format!("/groups/{id}/projects"), projects);
}
