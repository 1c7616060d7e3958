//! Transports that expose the runner to callers.
//!
//! [`LocalGateway`] calls the runner in-process. [`RemoteGateway`] talks to a
//! `qa-runner serve` instance over HTTP. Both return the same
//! [`ExecutionResult`], so a front end can switch between them freely.

use crate::error::GatewayError;
use crate::execution::{ExecutionRequest, ExecutionResult};
use crate::runner::Runner;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Extra time a remote client waits beyond the execution timeout.
pub const REMOTE_GRACE: Duration = Duration::from_secs(10);

#[async_trait]
pub trait ExecutionGateway: Send + Sync {
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult, GatewayError>;
}

/// In-process gateway.
#[derive(Debug, Clone)]
pub struct LocalGateway {
    runner: Arc<Runner>,
}

impl LocalGateway {
    pub fn new(runner: Arc<Runner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl ExecutionGateway for LocalGateway {
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult, GatewayError> {
        Ok(self.runner.run(&request.code).await)
    }
}

/// Client for the `POST /execute` endpoint.
#[derive(Debug, Clone)]
pub struct RemoteGateway {
    client: reqwest::Client,
    endpoint: String,
}

impl RemoteGateway {
    /// `base_url` is the server root, e.g. `http://127.0.0.1:8000`.
    /// `execution_timeout` should match the server's; the HTTP timeout adds
    /// [`REMOTE_GRACE`] on top of it.
    pub fn new(base_url: &str, execution_timeout: Duration) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(execution_timeout + REMOTE_GRACE)
            .build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/execute", base_url.trim_end_matches('/')),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl ExecutionGateway for RemoteGateway {
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult, GatewayError> {
        info!(endpoint = %self.endpoint, code_len = request.code.len(), "Submitting script");
        let response = self.client.post(&self.endpoint).json(&request).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body = response.bytes().await?;
        serde_json::from_slice(&body).map_err(|e| GatewayError::Decode(e.to_string()))
    }
}
