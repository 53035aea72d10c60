//! HTTP transport for the tunnel status endpoint

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use tracing::debug;

use super::{ApiError, DrainLease, TunnelResponse, TunnelStatusApi};

/// Control-plane API root
pub const DEFAULT_API_BASE: &str = "https://api.cloudflare.com/client/v4";

/// Per-request deadline; the drain loop retries on expiry
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Polls `GET {base}/accounts/{account}/cfd_tunnel/{tunnel}` with a bearer token
#[derive(Clone, Debug)]
pub struct CloudflareTunnelApi {
    client: reqwest::Client,
    base_url: String,
}

impl CloudflareTunnelApi {
    /// Client against the public API
    pub fn new() -> Result<Self, ApiError> {
        Self::with_base_url(DEFAULT_API_BASE)
    }

    /// Client against another API root (tests, proxies)
    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ApiError::Transport(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self::with_client(client, base_url))
    }

    /// Use a preconfigured HTTP client
    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Status URL for one tunnel
    pub fn tunnel_url(&self, account_id: &str, tunnel_id: &str) -> String {
        format!(
            "{}/accounts/{}/cfd_tunnel/{}",
            self.base_url, account_id, tunnel_id
        )
    }
}

#[async_trait]
impl TunnelStatusApi for CloudflareTunnelApi {
    async fn fetch(&self, lease: &DrainLease) -> Result<TunnelResponse, ApiError> {
        let url = self.tunnel_url(lease.account_id(), lease.tunnel_id());
        debug!(url = %url, "Fetching tunnel status");

        let response = self
            .client
            .get(&url)
            .bearer_auth(lease.api_token())
            .header(CONTENT_TYPE, "application/json")
            .send()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(TunnelResponse::NotFound);
        }
        if !status.is_success() {
            return Err(ApiError::Status {
                status: status.as_u16(),
                reason: status.canonical_reason().unwrap_or("unknown").to_string(),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        let json = serde_json::from_slice(&body).map_err(|e| ApiError::Malformed(e.to_string()))?;
        Ok(TunnelResponse::Found(json))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tunnel_url_joins_cleanly() {
        let api = CloudflareTunnelApi::with_base_url("http://127.0.0.1:8080/client/v4/").unwrap();
        assert_eq!(
            api.tunnel_url("acct", "tun-1"),
            "http://127.0.0.1:8080/client/v4/accounts/acct/cfd_tunnel/tun-1"
        );
    }

    #[test]
    fn default_base_is_public_api() {
        let api = CloudflareTunnelApi::new().unwrap();
        assert_eq!(
            api.tunnel_url("a", "t"),
            "https://api.cloudflare.com/client/v4/accounts/a/cfd_tunnel/t"
        );
    }
}
