//! Control server client

use crate::config::{AgentConfig, AgentIdentity};
use async_trait::async_trait;
use bytes::Bytes;
use meshagent_common::{Error, Host, Result};
use reqwest::header::{CONTENT_TYPE, ETAG, IF_NONE_MATCH};
use reqwest::StatusCode;
use std::time::Duration;
use tracing::{debug, info};

/// Header carrying the API key
pub const API_KEY_HEADER: &str = "X-API-KEY";

/// Result of one conditional poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// 304: the cached ETag is still current
    NotModified,
    /// 200 with the full desired state
    Updated { body: Bytes, etag: Option<String> },
    /// 401: the API key was rejected
    Unauthorized,
    /// Any other status
    Unexpected(u16),
}

/// Transport to the control server
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Conditional GET of the desired state for this host group
    async fn fetch_state(&self, identity: &AgentIdentity, etag: Option<&str>) -> Result<FetchOutcome>;

    /// Report a host record back, authenticated with the host's own API key
    async fn update_host(&self, identity: &AgentIdentity, host: &Host) -> Result<()>;
}

/// reqwest based control plane
#[derive(Debug, Clone)]
pub struct HttpControlPlane {
    client: reqwest::Client,
}

fn http_error(e: reqwest::Error) -> Error {
    Error::ControlPlane(e.to_string())
}

impl HttpControlPlane {
    /// Build a client tuned for the configured server.
    ///
    /// Plain http gets a short overall timeout; https gets connect timeout,
    /// keepalive, proxies from the environment and the source address.
    pub fn new(config: &AgentConfig) -> Result<Self> {
        let user_agent = format!("meshagent/{}", meshagent_common::VERSION);
        let builder = reqwest::Client::builder().user_agent(user_agent);

        let builder = if config.server_url.starts_with("https:") {
            let source = config.source_ip()?;
            let builder = builder
                .connect_timeout(Duration::from_secs(5))
                .tcp_keepalive(Duration::from_secs(60));
            if source.is_unspecified() {
                builder
            } else {
                builder.local_address(source)
            }
        } else {
            builder.timeout(Duration::from_secs(10))
        };

        Ok(Self {
            client: builder.build().map_err(http_error)?,
        })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn fetch_state(&self, identity: &AgentIdentity, etag: Option<&str>) -> Result<FetchOutcome> {
        let url = format!(
            "{}/api/v1.0/host/{}/status",
            identity.server_url, identity.host_id
        );

        let mut request = self
            .client
            .get(&url)
            .header(API_KEY_HEADER, &identity.api_key)
            .header(CONTENT_TYPE, "application/json");
        if let Some(etag) = etag {
            request = request.header(IF_NONE_MATCH, etag);
        }

        let resp = request.send().await.map_err(http_error)?;
        let status = resp.status();
        debug!("GET {} -> {}", url, status);

        match status {
            StatusCode::OK => {
                let etag = resp
                    .headers()
                    .get(ETAG)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                let body = resp.bytes().await.map_err(http_error)?;
                Ok(FetchOutcome::Updated { body, etag })
            }
            StatusCode::NOT_MODIFIED => Ok(FetchOutcome::NotModified),
            StatusCode::UNAUTHORIZED => Ok(FetchOutcome::Unauthorized),
            other => Ok(FetchOutcome::Unexpected(other.as_u16())),
        }
    }

    async fn update_host(&self, identity: &AgentIdentity, host: &Host) -> Result<()> {
        let url = format!("{}/api/v1.0/host/{}", identity.server_url, host.id);

        let resp = self
            .client
            .patch(&url)
            .header(API_KEY_HEADER, &host.api_key)
            .json(host)
            .send()
            .await
            .map_err(http_error)?;

        let status = resp.status();
        if !status.is_success() {
            return Err(Error::ControlPlane(format!(
                "PATCH host {} returned {}",
                host.id, status
            )));
        }

        info!("Updated host {} on {}", host.name, identity.server_url);
        Ok(())
    }
}
