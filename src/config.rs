use std::env;
use std::time::Duration;

use crate::error::ReconError;
use crate::identity::PlatformMode;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone)]
pub struct Config {
    pub gitlab_url: String,
    /// Worker pool size for walker expansions and secret/runner fetches.
    pub concurrency: usize,
    pub request_timeout: Duration,
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    /// Hard ceiling for PPE pipeline polling. Always finite.
    pub ppe_timeout: Duration,
    pub poll_interval: Duration,
    /// Forces SaaS/self-hosted behaviour instead of detecting it from the URL.
    pub platform_mode: Option<PlatformMode>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gitlab_url: "https://gitlab.com".into(),
            concurrency: 4,
            request_timeout: Duration::from_secs(30),
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            ppe_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(2000),
            platform_mode: None,
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

fn parse_platform_mode(s: &str) -> Option<PlatformMode> {
    match s.trim().to_ascii_lowercase().as_str() {
        "saas" => Some(PlatformMode::Saas),
        "self-hosted" | "selfhosted" | "self_hosted" => Some(PlatformMode::SelfHosted),
        _ => None,
    }
}

impl Config {
    pub fn load() -> Self {
        let defaults = Self::default();
        Self {
            gitlab_url: env::var("GLRECON_URL").unwrap_or(defaults.gitlab_url),
            concurrency: parse_env("GLRECON_CONCURRENCY").unwrap_or(defaults.concurrency),
            request_timeout: parse_env("GLRECON_REQUEST_TIMEOUT_SECS")
                .map_or(defaults.request_timeout, Duration::from_secs),
            max_attempts: parse_env("GLRECON_MAX_ATTEMPTS").unwrap_or(defaults.max_attempts),
            initial_backoff: parse_env("GLRECON_BACKOFF_MS")
                .map_or(defaults.initial_backoff, Duration::from_millis),
            ppe_timeout: parse_env("GLRECON_PPE_TIMEOUT_SECS")
                .map_or(defaults.ppe_timeout, Duration::from_secs),
            poll_interval: parse_env("GLRECON_POLL_INTERVAL_MS")
                .map_or(defaults.poll_interval, Duration::from_millis),
            platform_mode: env::var("GLRECON_PLATFORM")
                .ok()
                .and_then(|v| parse_platform_mode(&v)),
        }
    }

    /// Reject values that would make the engine unbounded or inert.
    pub fn validate(&self) -> Result<(), ReconError> {
        if self.concurrency == 0 {
            return Err(ReconError::Configuration(
                "concurrency must be at least 1".into(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(ReconError::Configuration(
                "max attempts must be at least 1".into(),
            ));
        }
        if self.ppe_timeout.is_zero() {
            return Err(ReconError::Configuration(
                "ppe timeout must be greater than zero".into(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(ReconError::Configuration(
                "poll interval must be greater than zero".into(),
            ));
        }
        self.base_url()?;
        Ok(())
    }

    pub fn base_url(&self) -> Result<url::Url, ReconError> {
        let url = url::Url::parse(&self.gitlab_url)
            .map_err(|e| ReconError::Configuration(format!("invalid gitlab url: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ReconError::Configuration(
                "gitlab url must use http or https".into(),
            ));
        }
        Ok(url)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_attempts(self.max_attempts)
            .with_initial_backoff(self.initial_backoff)
    }
}
