mod helpers;

use glrecon::context::ReconContext;
use glrecon::error::ErrorKind;
use glrecon::identity::{Credential, PlatformMode, ScopeClass};
use glrecon::transport::Method;

use helpers::MockTransport;

// ---------------------------------------------------------------------------
// Identity resolution
// ---------------------------------------------------------------------------

#[tokio::test]
async fn api_token_resolves_full_api() {
    let mock = MockTransport::new();
    let ctx = helpers::api_context(&mock).await;

    assert_eq!(ctx.token.user_id(), helpers::USER_ID);
    assert_eq!(ctx.token.identity().username, "alice");
    assert_eq!(ctx.token.scope_class(), ScopeClass::FullApi);
    assert_eq!(ctx.token.token_name(), Some("recon"));
    assert_eq!(ctx.mode, PlatformMode::SelfHosted);
}

#[tokio::test]
async fn admin_account_is_admin_regardless_of_scopes() {
    let mock = MockTransport::new();
    helpers::identity(&mock, &["read_api"], true);
    let ctx = helpers::connect(&mock, helpers::test_config()).await;
    assert_eq!(ctx.token.scope_class(), ScopeClass::Admin);
}

#[tokio::test]
async fn rejected_token_is_invalid_credential() {
    let mock = MockTransport::new();
    mock.status(Method::Get, "/user", 401);

    let err = ReconContext::connect(mock.clone(), helpers::test_config(), Credential::new("bad"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidCredential);
    assert!(err.kind().is_fatal_at_start());
    assert!(!mock.called(Method::Get, "/personal_access_tokens/self"));
}

#[tokio::test]
async fn forbidden_user_lookup_is_invalid_credential() {
    let mock = MockTransport::new();
    mock.text(Method::Get, "/user", 403, r#"{"error":"insufficient_scope"}"#);

    let err = ReconContext::connect(mock.clone(), helpers::test_config(), Credential::new("x"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidCredential);
}

#[tokio::test]
async fn empty_token_makes_no_request() {
    let mock = MockTransport::new();
    let err = ReconContext::connect(mock.clone(), helpers::test_config(), Credential::new(""))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MissingParameter);
    assert!(mock.calls().is_empty());
}

#[tokio::test]
async fn token_metadata_failure_is_not_fatal() {
    let mock = MockTransport::new();
    mock.get(
        "/user",
        serde_json::json!({ "id": 3, "username": "bob", "is_admin": false }),
    );
    mock.status(Method::Get, "/personal_access_tokens/self", 403);

    let ctx = helpers::connect(&mock, helpers::test_config()).await;
    assert_eq!(ctx.token.scope_class(), ScopeClass::Unknown);
    assert_eq!(ctx.token.scopes().count(), 0);
}

#[tokio::test]
async fn invalid_config_fails_before_any_request() {
    let mock = MockTransport::new();
    helpers::identity(&mock, &["api"], false);
    let config = glrecon::config::Config {
        concurrency: 0,
        ..helpers::test_config()
    };

    let err = ReconContext::connect(mock.clone(), config, Credential::new("glpat-x"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConfigurationError);
    assert!(mock.calls().is_empty());
}

#[tokio::test]
async fn saas_detected_from_url() {
    let mock = MockTransport::new();
    helpers::identity(&mock, &["api"], false);
    let config = glrecon::config::Config {
        gitlab_url: "https://gitlab.com".into(),
        ..helpers::test_config()
    };
    let ctx = helpers::connect(&mock, config).await;
    assert_eq!(ctx.mode, PlatformMode::Saas);
}

#[tokio::test]
async fn context_debug_never_shows_token() {
    let mock = MockTransport::new();
    let ctx = helpers::api_context(&mock).await;
    let printed = format!("{ctx:?}");
    assert!(!printed.contains("glpat-test-token"));
}
