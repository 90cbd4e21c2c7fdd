//! Restricted client for the container runtime proxy.
//!
//! Only five verbs exist: inspect, start, stop, wait and unpause. Anything that
//! would create containers, pull images or exec into a replica is not
//! reachable through this module.
use bollard::models::ContainerInspectResponse;
use log::{debug, trace};
use reqwest::{Client, StatusCode};
use std::time::Duration;
use thiserror::Error;

pub type ContainerName = String;

/// Tag for pattern matching on a [`ProxyError`] without caring about the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotAllowed,
    NotFound,
    Unauthorized,
    Transport,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProxyError {
    #[error("container {0} is not on the allow-list")]
    NotAllowed(ContainerName),
    #[error("container {0} not found")]
    NotFound(ContainerName),
    #[error("proxy rejected the credentials")]
    Unauthorized,
    #[error("proxy transport error: {0}")]
    Transport(String),
}

impl ProxyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProxyError::NotAllowed(_) => ErrorKind::NotAllowed,
            ProxyError::NotFound(_) => ErrorKind::NotFound,
            ProxyError::Unauthorized => ErrorKind::Unauthorized,
            ProxyError::Transport(_) => ErrorKind::Transport,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transport
    }
}

impl From<reqwest::Error> for ProxyError {
    fn from(value: reqwest::Error) -> Self {
        ProxyError::Transport(value.to_string())
    }
}

/// Lifecycle verbs the rotation engine may use against a managed container.
pub trait ContainerApi: Send + Sync + 'static {
    fn inspect(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<ContainerInspectResponse, ProxyError>> + Send;

    fn start(&self, name: &str) -> impl Future<Output = Result<(), ProxyError>> + Send;

    /// Stop with a grace period; a zero timeout kills immediately.
    fn stop(
        &self,
        name: &str,
        timeout: Duration,
    ) -> impl Future<Output = Result<(), ProxyError>> + Send;

    /// Block until the container is no longer running.
    fn wait(&self, name: &str) -> impl Future<Output = Result<(), ProxyError>> + Send;

    fn unpause(&self, name: &str) -> impl Future<Output = Result<(), ProxyError>> + Send;
}

pub struct DockerProxy {
    client: Client,
    base_url: String,
    token: Option<String>,
    allowed: Vec<ContainerName>,
    wait_timeout: Duration,
}

impl DockerProxy {
    pub fn new(
        base_url: impl Into<String>,
        token: Option<String>,
        allowed: Vec<ContainerName>,
        timeout: Duration,
    ) -> Result<Self, ProxyError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            allowed,
            // a graceful stop may take up to its own timeout before wait returns
            wait_timeout: timeout * 2,
        })
    }

    fn check_allowed(&self, name: &str) -> Result<(), ProxyError> {
        if self.allowed.iter().any(|allowed| allowed == name) {
            Ok(())
        } else {
            Err(ProxyError::NotAllowed(name.to_string()))
        }
    }

    fn url(&self, name: &str, verb: &str) -> String {
        format!("{}/containers/{name}/{verb}", self.base_url)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn post(
        &self,
        name: &str,
        verb: &str,
        query: &[(&str, String)],
        timeout: Option<Duration>,
    ) -> Result<(), ProxyError> {
        self.check_allowed(name)?;
        let mut request = self.authorize(self.client.post(self.url(name, verb)).query(query));
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        let response = request.send().await?;
        debug!("POST {verb} {name}: {}", response.status());
        check_status(name, response.status())
    }
}

fn check_status(name: &str, status: StatusCode) -> Result<(), ProxyError> {
    match status {
        // 304: already started / already stopped
        s if s.is_success() || s == StatusCode::NOT_MODIFIED => Ok(()),
        StatusCode::NOT_FOUND => Err(ProxyError::NotFound(name.to_string())),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ProxyError::Unauthorized),
        s => Err(ProxyError::Transport(format!("unexpected status {s} for {name}"))),
    }
}

impl ContainerApi for DockerProxy {
    async fn inspect(&self, name: &str) -> Result<ContainerInspectResponse, ProxyError> {
        self.check_allowed(name)?;
        let response = self
            .authorize(self.client.get(self.url(name, "json")))
            .send()
            .await?;
        check_status(name, response.status())?;
        let details: ContainerInspectResponse = response
            .json()
            .await
            .map_err(|e| ProxyError::Transport(format!("malformed inspect body for {name}: {e}")))?;
        trace!("inspect {name}: {details:?}");
        Ok(details)
    }

    async fn start(&self, name: &str) -> Result<(), ProxyError> {
        self.post(name, "start", &[], None).await
    }

    async fn stop(&self, name: &str, timeout: Duration) -> Result<(), ProxyError> {
        let query = [("t", timeout.as_secs().to_string())];
        // the proxy call itself must outlive the grace period
        let request_timeout = timeout + self.wait_timeout;
        self.post(name, "stop", &query, Some(request_timeout)).await
    }

    async fn wait(&self, name: &str) -> Result<(), ProxyError> {
        let query = [("condition", "not-running".to_string())];
        self.post(name, "wait", &query, Some(self.wait_timeout)).await
    }

    async fn unpause(&self, name: &str) -> Result<(), ProxyError> {
        self.post(name, "unpause", &[], None).await
    }
}
