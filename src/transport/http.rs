use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::HeaderMap;

use super::{ApiRequest, ApiResponse, Method, Transport, TransportError};

/// reqwest-backed gateway. Owns the credential and injects it on every call.
pub struct HttpTransport {
    client: reqwest::Client,
    api_base: String,
    token: String,
}

impl fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransport")
            .field("api_base", &self.api_base)
            .finish_non_exhaustive()
    }
}

impl HttpTransport {
    pub fn new(base_url: &url::Url, token: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("glrecon/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let api_base = format!("{}/api/v4", base_url.as_str().trim_end_matches('/'));
        Ok(Self {
            client,
            api_base,
            token: token.to_owned(),
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request(&self, req: ApiRequest) -> Result<ApiResponse, TransportError> {
        let url = format!("{}{}", self.api_base, req.path);
        let mut builder = match req.method {
            Method::Get => self.client.get(&url),
            Method::Post => self.client.post(&url),
            Method::Put => self.client.put(&url),
            Method::Delete => self.client.delete(&url),
        };

        builder = builder.header("PRIVATE-TOKEN", &self.token);
        if !req.query.is_empty() {
            builder = builder.query(&req.query);
        }
        if let Some(body) = &req.body {
            builder = builder.json(body);
        }

        let resp = builder.send().await.map_err(map_reqwest_error)?;
        let status = resp.status().as_u16();
        let next_page = parse_next_page(resp.headers());
        let retry_after = parse_retry_after(resp.headers());
        let body = resp.text().await.map_err(map_reqwest_error)?;

        tracing::trace!(method = %req.method, path = %req.path, status, "api call");
        Ok(ApiResponse {
            status,
            body,
            next_page,
            retry_after,
        })
    }
}

fn map_reqwest_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else {
        TransportError::Other(err.to_string())
    }
}

fn parse_next_page(headers: &HeaderMap) -> Option<u32> {
    headers
        .get("x-next-page")?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get("retry-after")?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(*k, HeaderValue::from_static(v));
        }
        map
    }

    #[test]
    fn next_page_present() {
        assert_eq!(parse_next_page(&headers(&[("x-next-page", "3")])), Some(3));
    }

    #[test]
    fn next_page_empty_on_last_page() {
        assert_eq!(parse_next_page(&headers(&[("x-next-page", "")])), None);
        assert_eq!(parse_next_page(&HeaderMap::new()), None);
    }

    #[test]
    fn retry_after_seconds() {
        assert_eq!(
            parse_retry_after(&headers(&[("retry-after", "7")])),
            Some(Duration::from_secs(7))
        );
    }

    #[test]
    fn retry_after_http_date_ignored() {
        assert_eq!(
            parse_retry_after(&headers(&[("retry-after", "Wed, 21 Oct 2015 07:28:00 GMT")])),
            None
        );
    }

    #[test]
    fn debug_hides_token() {
        let base = url::Url::parse("https://gitlab.example.com/").unwrap();
        let transport = HttpTransport::new(&base, "glpat-secret", Duration::from_secs(5)).unwrap();
        let rendered = format!("{transport:?}");
        assert!(!rendered.contains("glpat-secret"));
        assert!(rendered.contains("https://gitlab.example.com/api/v4"));
    }
}
