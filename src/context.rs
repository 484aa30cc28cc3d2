use std::sync::Arc;

use crate::client::ApiClient;
use crate::config::Config;
use crate::error::ReconError;
use crate::identity::{Credential, PlatformMode, TokenContext, resolve_identity};
use crate::transport::{HttpTransport, Transport};

/// Per-invocation state shared by every component: one token, one target.
///
/// Platform mode is computed once here and never re-detected. Two contexts
/// never share mutable state, so several tokens can be worked concurrently.
#[derive(Debug, Clone)]
pub struct ReconContext {
    pub client: ApiClient,
    pub token: TokenContext,
    pub mode: PlatformMode,
    pub config: Arc<Config>,
}

impl ReconContext {
    /// Build an HTTP-backed context and resolve the token.
    pub async fn establish(config: Config, credential: Credential) -> Result<Self, ReconError> {
        config.validate()?;
        let base_url = config.base_url()?;
        let transport = HttpTransport::new(&base_url, credential.expose(), config.request_timeout)
            .map_err(|e| ReconError::Configuration(format!("http client: {e}")))?;
        Self::connect(Arc::new(transport), config, credential).await
    }

    /// Resolve the token over an arbitrary transport.
    pub async fn connect(
        transport: Arc<dyn Transport>,
        config: Config,
        credential: Credential,
    ) -> Result<Self, ReconError> {
        config.validate()?;
        let mode = match config.platform_mode {
            Some(mode) => mode,
            None => PlatformMode::detect(&config.base_url()?),
        };

        let client = ApiClient::new(transport, config.retry_policy());
        let token = resolve_identity(&client, credential).await?;
        tracing::debug!(%mode, "platform mode fixed for this session");

        Ok(Self {
            client,
            token,
            mode,
            config: Arc::new(config),
        })
    }
}
