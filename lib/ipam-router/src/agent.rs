//! Remote procedure boundary to the virtual router process

use crate::{Result, RouterError};
use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::{body::Bytes, header, Method, Request, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::tokio::TokioExecutor;
use ipam_api::{ConfigBatch, LinkState, RedundancyState, RouterId};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

/// Control plane of a virtual router
///
/// Callers bound every call with a [`crate::RouterCallPolicy`]; implementations
/// do not need their own deadline.
#[async_trait]
pub trait RouterAgent: Send + Sync {
    /// Apply a batch of configuration commands, all or nothing
    async fn apply(&self, batch: &ConfigBatch) -> Result<()>;

    /// Redundancy role as reported by the router's health check
    async fn redundancy_state(&self, router: RouterId) -> Result<RedundancyState>;

    /// Administrative state of every device, keyed by device name
    async fn link_states(&self, router: RouterId) -> Result<BTreeMap<String, LinkState>>;
}

/// Agent speaking JSON over HTTP to a control endpoint on each router
///
/// Endpoints used, relative to the router's base URL:
/// - `POST /v1/config` with a [`ConfigBatch`] body
/// - `GET /v1/redundancy`, plain text health-check output ("Status: MASTER")
/// - `GET /v1/links`, JSON object of device name to `UP`/`DOWN`
pub struct HttpRouterAgent {
    client: Client<HttpConnector, Full<Bytes>>,
    endpoints: RwLock<HashMap<RouterId, String>>,
}

impl HttpRouterAgent {
    pub fn new(connect_timeout: Duration) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(connect_timeout));
        connector.set_keepalive(Some(Duration::from_secs(30)));

        let client = Client::builder(TokioExecutor::new()).build::<_, Full<Bytes>>(connector);

        Self {
            client,
            endpoints: RwLock::new(HashMap::new()),
        }
    }

    /// Register (or replace) the base URL of a router, e.g. "http://169.254.3.10:8888"
    pub async fn register(&self, router: RouterId, base_url: impl Into<String>) {
        let base_url = base_url.into();
        debug!("Router {} control endpoint: {}", router, base_url);
        self.endpoints.write().await.insert(router, base_url);
    }

    async fn url(&self, router: RouterId, path: &str) -> Result<String> {
        let endpoints = self.endpoints.read().await;
        let base = endpoints
            .get(&router)
            .ok_or(RouterError::UnknownRouter(router))?;
        Ok(format!("{}{}", base.trim_end_matches('/'), path))
    }

    async fn send(
        &self,
        router: RouterId,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<Bytes> {
        let url = self.url(router, path).await?;
        let rejected = |reason: String| RouterError::RouterRejected { router, reason };

        let mut builder = Request::builder().method(method).uri(&url);
        if body.is_some() {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
        }
        let request = builder
            .body(Full::new(Bytes::from(body.unwrap_or_default())))
            .map_err(|e| rejected(format!("invalid request to {}: {}", url, e)))?;

        debug!("Router {} request: {}", router, url);
        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| rejected(format!("transport error: {}", e)))?;

        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|e| rejected(format!("reading response: {}", e)))?
            .to_bytes();

        if status != StatusCode::OK && status != StatusCode::NO_CONTENT {
            return Err(rejected(format!(
                "{}: {}",
                status,
                String::from_utf8_lossy(&bytes).trim()
            )));
        }
        Ok(bytes)
    }
}

#[async_trait]
impl RouterAgent for HttpRouterAgent {
    async fn apply(&self, batch: &ConfigBatch) -> Result<()> {
        let body = serde_json::to_vec(batch).map_err(ipam_core::CoreError::from)?;
        self.send(batch.router, Method::POST, "/v1/config", Some(body))
            .await?;
        Ok(())
    }

    async fn redundancy_state(&self, router: RouterId) -> Result<RedundancyState> {
        let bytes = self.send(router, Method::GET, "/v1/redundancy", None).await?;
        String::from_utf8_lossy(&bytes)
            .parse()
            .map_err(|e: ipam_api::ParseRedundancyStateError| RouterError::RouterRejected {
                router,
                reason: e.to_string(),
            })
    }

    async fn link_states(&self, router: RouterId) -> Result<BTreeMap<String, LinkState>> {
        let bytes = self.send(router, Method::GET, "/v1/links", None).await?;
        let links = serde_json::from_slice(&bytes).map_err(ipam_core::CoreError::from)?;
        Ok(links)
    }
}
