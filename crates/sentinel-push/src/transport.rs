use async_trait::async_trait;
use sentinel_core::types::PushEnvironment;
use std::time::Duration;
use tracing::debug;

use crate::error::PushError;
use crate::payload::{ApnsRequest, ApnsResponse};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Opens one HTTP/2 session per APNs environment.
#[async_trait]
pub trait ApnsTransport: Send + Sync {
    async fn open(&self, environment: PushEnvironment) -> Result<Box<dyn ApnsSession>, PushError>;
}

#[async_trait]
pub trait ApnsSession: Send {
    async fn send(&mut self, request: &ApnsRequest) -> Result<ApnsResponse, PushError>;

    async fn close(self: Box<Self>);
}

#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    timeout: Duration,
    base_url: Option<String>,
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new(DEFAULT_REQUEST_TIMEOUT)
    }
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            base_url: None,
        }
    }

    /// Sends every environment to `base_url` instead of Apple's hosts.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn base_url_for(&self, environment: PushEnvironment) -> String {
        match &self.base_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("https://{}", environment.host()),
        }
    }
}

#[async_trait]
impl ApnsTransport for ReqwestTransport {
    async fn open(&self, environment: PushEnvironment) -> Result<Box<dyn ApnsSession>, PushError> {
        let client = reqwest::Client::builder()
            .http2_prior_knowledge()
            .timeout(self.timeout)
            .build()
            .map_err(|err| PushError::Transport {
                message: format!("failed to build http/2 client: {err}"),
            })?;
        let base_url = self.base_url_for(environment);
        debug!(environment = %environment, base_url = %base_url, "opened apns session");
        Ok(Box::new(ReqwestSession {
            client,
            base_url,
            environment,
        }))
    }
}

struct ReqwestSession {
    client: reqwest::Client,
    base_url: String,
    environment: PushEnvironment,
}

impl ReqwestSession {
    fn build_request(&self, request: &ApnsRequest) -> Result<reqwest::Request, PushError> {
        let url = format!("{}{}", self.base_url, request.path());
        let mut builder = self.client.post(url);
        for (name, value) in request.headers() {
            builder = builder.header(name, value);
        }
        builder
            .body(request.body.clone())
            .build()
            .map_err(|err| PushError::Transport {
                message: format!("invalid apns request: {err}"),
            })
    }
}

fn apns_id(headers: &reqwest::header::HeaderMap) -> Option<String> {
    headers
        .get("apns-id")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

#[async_trait]
impl ApnsSession for ReqwestSession {
    async fn send(&mut self, request: &ApnsRequest) -> Result<ApnsResponse, PushError> {
        let http_request = self.build_request(request)?;
        let response = self
            .client
            .execute(http_request)
            .await
            .map_err(|err| PushError::Transport {
                message: err.to_string(),
            })?;

        let status = response.status().as_u16();
        let apns_id = apns_id(response.headers());
        let body = response.bytes().await.map_err(|err| PushError::Transport {
            message: format!("failed to read response body: {err}"),
        })?;
        Ok(ApnsResponse::from_parts(status, apns_id, &body))
    }

    async fn close(self: Box<Self>) {
        debug!(environment = %self.environment, "closed apns session");
    }
}
