use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;

use crate::classify::{Granted, Refusal, Verdict, classify};
use crate::retry::RetryPolicy;
use crate::transport::{ApiRequest, Transport};

const PER_PAGE: u32 = 100;

/// Guard against an upstream that keeps advertising a next page.
const MAX_PAGES: u32 = 1000;

/// Routes every request through the classifier and applies the rate-limit
/// retry policy. Cheap to clone; clones share the backoff counter.
#[derive(Clone)]
pub struct ApiClient {
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
    rate_limit_hits: Arc<AtomicU64>,
}

impl fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiClient")
            .field("retry", &self.retry)
            .field("rate_limit_hits", &self.rate_limit_hits())
            .finish_non_exhaustive()
    }
}

impl ApiClient {
    pub fn new(transport: Arc<dyn Transport>, retry: RetryPolicy) -> Self {
        Self {
            transport,
            retry,
            rate_limit_hits: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Number of rate-limited answers seen by this invocation so far.
    pub fn rate_limit_hits(&self) -> u64 {
        self.rate_limit_hits.load(Ordering::Relaxed)
    }

    /// Issue one request. `RateLimited` is retried with backoff up to the
    /// policy's cap and then surfaced; every other verdict is final.
    ///
    /// The wait only suspends this call, so concurrent work in other
    /// subtrees keeps going.
    pub async fn send(&self, req: ApiRequest) -> Verdict {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let hint = match classify(self.transport.request(req.clone()).await) {
                Err(Refusal::RateLimited(hint)) => hint,
                other => return other,
            };

            self.rate_limit_hits.fetch_add(1, Ordering::Relaxed);
            if !self.retry.allows_another(attempt) {
                tracing::warn!(
                    method = %req.method,
                    path = %req.path,
                    attempts = attempt,
                    "rate limit retries exhausted"
                );
                return Err(Refusal::RateLimited(hint));
            }

            let delay = self.retry.backoff(attempt, hint);
            tracing::debug!(
                method = %req.method,
                path = %req.path,
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "rate limited, backing off"
            );
            tokio::time::sleep(delay).await;
        }
    }

    pub async fn get(&self, path: impl Into<String>) -> Verdict {
        self.send(ApiRequest::get(path)).await
    }

    /// Fetch every page of a listing and merge the items in upstream order.
    pub async fn get_all(&self, req: ApiRequest) -> Result<Vec<Value>, Refusal> {
        let mut items = Vec::new();
        let mut page = 1;

        loop {
            let paged = req
                .clone()
                .param("per_page", PER_PAGE)
                .param("page", page);
            let granted: Granted = self.send(paged).await?;

            match granted.json::<Value>()? {
                Value::Array(batch) => items.extend(batch),
                other => {
                    return Err(Refusal::TransportFailure(format!(
                        "expected a list from {}, got {}",
                        req.path,
                        json_type(&other)
                    )));
                }
            }

            match granted.next_page {
                Some(next) if next > page && next <= MAX_PAGES => page = next,
                _ => break,
            }
        }

        Ok(items)
    }

    /// Like [`get_all`](Self::get_all), but a transport failure is retried
    /// under the same policy before it is reported.
    pub async fn get_all_with_retry(&self, req: ApiRequest) -> Result<Vec<Value>, Refusal> {
        self.retry_transport(&req.path, || self.get_all(req.clone())).await
    }

    /// Like [`send`](Self::send), retrying transport failures.
    pub async fn send_with_retry(&self, req: ApiRequest) -> Verdict {
        self.retry_transport(&req.path, || self.send(req.clone())).await
    }

    async fn retry_transport<T, F, Fut>(&self, path: &str, mut op: F) -> Result<T, Refusal>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Refusal>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Err(Refusal::TransportFailure(reason)) if self.retry.allows_another(attempt) => {
                    let delay = self.retry.backoff(attempt, None);
                    tracing::debug!(%path, attempt, %reason, "transport failure, retrying");
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }
}

fn json_type(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
