//! Internal endpoints every replica exposes to the rotation engine.
use log::{debug, info};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub const PREPARE_ROTATION_PATH: &str = "/api/internal/prepare-rotation";
pub const SECURITY_METRICS_PATH: &str = "/api/internal/security-metrics";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReplicaError {
    #[error("replica answered with status {code}")]
    Status { code: u16 },
    #[error("replica did not answer in time")]
    Timeout,
    #[error("replica transport error: {0}")]
    Transport(String),
    #[error("could not decode replica response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for ReplicaError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() {
            ReplicaError::Timeout
        } else if value.is_decode() {
            ReplicaError::Decode(value.to_string())
        } else {
            ReplicaError::Transport(value.to_string())
        }
    }
}

/// Result of flushing a replica's ephemeral state to durable storage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreparationReport {
    pub overall_success: bool,
    #[serde(default)]
    pub validated: u64,
    #[serde(default)]
    pub rejected: u64,
    #[serde(default)]
    pub promoted: u64,
    #[serde(default)]
    pub failed: u64,
    #[serde(default)]
    pub message: Option<String>,
}

impl PreparationReport {
    pub fn succeeded() -> Self {
        Self {
            overall_success: true,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Low,
    Medium,
    High,
    Critical,
    /// Any level this build does not know about. Never counts as high.
    #[serde(other)]
    Unknown,
}

impl Severity {
    pub fn is_high(&self) -> bool {
        matches!(self, Severity::High | Severity::Critical)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Anomaly {
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub severity: Severity,
}

/// Raw counters reported by a replica's security-metrics endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SecurityCounters {
    pub suspicious_requests: u64,
    pub auth_failures: u64,
    pub anomalies: Vec<Anomaly>,
    pub app_errors: u64,
    pub memory_percent: f64,
}

pub trait ReplicaApi: Send + Sync + 'static {
    fn prepare_rotation(
        &self,
        container: &str,
    ) -> impl Future<Output = Result<PreparationReport, ReplicaError>> + Send;

    fn security_metrics(
        &self,
        container: &str,
    ) -> impl Future<Output = Result<SecurityCounters, ReplicaError>> + Send;
}

pub struct ReplicaClient {
    client: Client,
    url_template: String,
    token: Option<String>,
    prepare_timeout: Duration,
    metrics_timeout: Duration,
}

impl ReplicaClient {
    /// `url_template` is the replica base URL with a `{container}` placeholder,
    /// e.g. `http://{container}:8080`.
    pub fn new(
        url_template: impl Into<String>,
        token: Option<String>,
        prepare_timeout: Duration,
        metrics_timeout: Duration,
    ) -> Result<Self, ReplicaError> {
        let client = Client::builder().build()?;
        Ok(Self {
            client,
            url_template: url_template.into(),
            token,
            prepare_timeout,
            metrics_timeout,
        })
    }

    fn url(&self, container: &str, path: &str) -> String {
        let base = self.url_template.replace("{container}", container);
        format!("{}{path}", base.trim_end_matches('/'))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

impl ReplicaApi for ReplicaClient {
    async fn prepare_rotation(&self, container: &str) -> Result<PreparationReport, ReplicaError> {
        info!("Preparing {container} for rotation");
        let response = self
            .authorize(self.client.post(self.url(container, PREPARE_ROTATION_PATH)))
            .timeout(self.prepare_timeout)
            .send()
            .await?;
        if response.status() != StatusCode::OK {
            return Err(ReplicaError::Status {
                code: response.status().as_u16(),
            });
        }
        let report: PreparationReport = response.json().await?;
        debug!("prepare-rotation report from {container}: {report:?}");
        Ok(report)
    }

    async fn security_metrics(&self, container: &str) -> Result<SecurityCounters, ReplicaError> {
        let response = self
            .authorize(self.client.get(self.url(container, SECURITY_METRICS_PATH)))
            .timeout(self.metrics_timeout)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ReplicaError::Status {
                code: response.status().as_u16(),
            });
        }
        Ok(response.json().await?)
    }
}
