//! Client for the parent module proxy.

use crate::error::{ResolveError, ResolveResult};
use modproxy_core::Info;
use modproxy_core::escape::escaped_url_path;
use reqwest::StatusCode;
use std::time::Duration;
use tracing::debug;

/// Talks to the upstream proxy for public modules.
#[derive(Clone, Debug)]
pub struct UpstreamClient {
    http: reqwest::Client,
    base_url: String,
}

impl UpstreamClient {
    pub fn new(base_url: &str, timeout: Duration) -> ResolveResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ResolveError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self::with_client(base_url, http))
    }

    pub fn with_client(base_url: &str, http: reqwest::Client) -> Self {
        Self {
            http,
            base_url: format!("{}/", base_url.trim_end_matches('/')),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str, suffix: &str) -> ResolveResult<String> {
        let escaped = escaped_url_path(path)
            .map_err(|e| ResolveError::not_found(format!("invalid module path: {e}")))?;
        Ok(format!("{}{escaped}{suffix}", self.base_url))
    }

    async fn get(&self, url: &str) -> ResolveResult<bytes::Bytes> {
        debug!(url, "upstream request");
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| ResolveError::Upstream(format!("GET {url}: {e}")))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| ResolveError::Upstream(format!("error reading body of GET {url}: {e}")))?;
        match status {
            StatusCode::OK => Ok(body),
            StatusCode::NOT_FOUND | StatusCode::GONE => {
                Err(ResolveError::not_found(format!("GET {url}: {status}")))
            }
            _ => Err(ResolveError::Upstream(format!(
                "unexpected {status} response to GET {url}: {}",
                String::from_utf8_lossy(&body)
            ))),
        }
    }

    /// `GET <base>/<path>/@latest`.
    pub async fn latest(&self, path: &str) -> ResolveResult<Info> {
        let url = self.url(path, "/@latest")?;
        let body = self.get(&url).await?;
        serde_json::from_slice(&body)
            .map_err(|e| ResolveError::Upstream(format!("invalid JSON from GET {url}: {e}")))
    }

    /// `GET <base>/<path>/@v/list`. Every line must end with a line feed and
    /// none may be empty.
    pub async fn list(&self, path: &str) -> ResolveResult<Vec<String>> {
        let url = self.url(path, "/@v/list")?;
        let body = self.get(&url).await?;
        parse_version_list(&body).map_err(|reason| {
            ResolveError::Upstream(format!("body of response to GET {url} {reason}"))
        })
    }
}

fn parse_version_list(body: &[u8]) -> Result<Vec<String>, &'static str> {
    let mut versions = Vec::new();
    let mut rest = body;
    while !rest.is_empty() {
        let Some(i) = rest.iter().position(|&b| b == b'\n') else {
            return Err("does not end with a line feed");
        };
        if i == 0 {
            return Err("contains an empty line");
        }
        versions.push(String::from_utf8_lossy(&rest[..i]).into_owned());
        rest = &rest[i + 1..];
    }
    Ok(versions)
}
