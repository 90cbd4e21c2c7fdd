use crate::docker::{ContainerApi, ContainerName, ProxyError};
use bollard::models::{ContainerInspectResponse, ContainerStateStatusEnum, HealthStatusEnum};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Running,
    Created,
    #[default]
    Exited,
    Dead,
    Paused,
    Restarting,
    #[serde(rename = "not-found")]
    NotFound,
}

impl ContainerStatus {
    /// Statuses a stop request has to act on.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            ContainerStatus::Running | ContainerStatus::Restarting | ContainerStatus::Paused
        )
    }
}

impl From<&ContainerStateStatusEnum> for ContainerStatus {
    fn from(value: &ContainerStateStatusEnum) -> Self {
        match value {
            ContainerStateStatusEnum::RUNNING => ContainerStatus::Running,
            ContainerStateStatusEnum::CREATED => ContainerStatus::Created,
            ContainerStateStatusEnum::PAUSED => ContainerStatus::Paused,
            ContainerStateStatusEnum::RESTARTING => ContainerStatus::Restarting,
            ContainerStateStatusEnum::REMOVING | ContainerStateStatusEnum::DEAD => {
                ContainerStatus::Dead
            }
            _ => ContainerStatus::Exited,
        }
    }
}

impl Display for ContainerStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ContainerStatus::Running => "running",
            ContainerStatus::Created => "created",
            ContainerStatus::Exited => "exited",
            ContainerStatus::Dead => "dead",
            ContainerStatus::Paused => "paused",
            ContainerStatus::Restarting => "restarting",
            ContainerStatus::NotFound => "not-found",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Starting,
    /// No healthcheck configured for the image.
    #[default]
    None,
}

impl From<&HealthStatusEnum> for HealthStatus {
    fn from(value: &HealthStatusEnum) -> Self {
        match value {
            HealthStatusEnum::HEALTHY => HealthStatus::Healthy,
            HealthStatusEnum::UNHEALTHY => HealthStatus::Unhealthy,
            HealthStatusEnum::STARTING => HealthStatus::Starting,
            _ => HealthStatus::None,
        }
    }
}

impl Display for HealthStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Starting => "starting",
            HealthStatus::None => "none",
        };
        write!(f, "{s}")
    }
}

/// Cached view of one container. Never refreshes itself on read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerState {
    pub status: ContainerStatus,
    pub health: HealthStatus,
    pub refreshed_at: Instant,
}

impl ContainerState {
    pub fn from_inspect(details: &ContainerInspectResponse, now: Instant) -> Self {
        let state = details.state.as_ref();
        let status = state
            .and_then(|s| s.status.as_ref())
            .map(ContainerStatus::from)
            .unwrap_or_default();
        let health = state
            .and_then(|s| s.health.as_ref())
            .and_then(|h| h.status.as_ref())
            .map(HealthStatus::from)
            .unwrap_or_default();
        Self {
            status,
            health,
            refreshed_at: now,
        }
    }

    pub fn not_found(now: Instant) -> Self {
        Self {
            status: ContainerStatus::NotFound,
            health: HealthStatus::None,
            refreshed_at: now,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == ContainerStatus::Running
    }

    /// Running and either healthy or without a healthcheck.
    pub fn is_ready(&self) -> bool {
        self.is_running() && matches!(self.health, HealthStatus::Healthy | HealthStatus::None)
    }

    /// The container will not become healthy without another start.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            ContainerStatus::Exited | ContainerStatus::Dead | ContainerStatus::NotFound
        )
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.refreshed_at)
    }
}

/// A container name paired with the last inspect result. Handles are
/// replaced on refresh, never mutated.
#[derive(Debug, Clone)]
pub struct ContainerHandle {
    pub name: ContainerName,
    pub state: ContainerState,
    pub attributes: ContainerInspectResponse,
}

impl ContainerHandle {
    pub fn new(name: impl Into<ContainerName>, attributes: ContainerInspectResponse) -> Self {
        let state = ContainerState::from_inspect(&attributes, Instant::now());
        Self {
            name: name.into(),
            state,
            attributes,
        }
    }

    pub async fn fetch<C: ContainerApi>(api: &C, name: &str) -> Result<Self, ProxyError> {
        let attributes = api.inspect(name).await?;
        Ok(Self::new(name, attributes))
    }

    pub fn is_stale(&self, ttl: Duration) -> bool {
        self.state.age(Instant::now()) >= ttl
    }

    /// `State.StartedAt` as reported by the runtime.
    pub fn started_at(&self) -> Option<&str> {
        self.attributes
            .state
            .as_ref()
            .and_then(|s| s.started_at.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::inspect_response;

    #[test]
    fn running_without_healthcheck_is_ready() {
        let details = inspect_response(ContainerStatus::Running, HealthStatus::None);
        let state = ContainerState::from_inspect(&details, Instant::now());
        assert!(state.is_ready());
        assert!(!state.is_terminal());
    }

    #[test]
    fn starting_health_is_not_ready() {
        let details = inspect_response(ContainerStatus::Running, HealthStatus::Starting);
        let state = ContainerState::from_inspect(&details, Instant::now());
        assert!(state.is_running());
        assert!(!state.is_ready());
    }

    #[test]
    fn missing_state_defaults_to_exited() {
        let state = ContainerState::from_inspect(&ContainerInspectResponse::default(), Instant::now());
        assert_eq!(state.status, ContainerStatus::Exited);
        assert!(state.is_terminal());
    }

    #[test]
    fn status_serializes_like_the_runtime() {
        assert_eq!(
            serde_json::to_string(&ContainerStatus::NotFound).unwrap(),
            "\"not-found\""
        );
        assert_eq!(
            serde_json::to_string(&ContainerStatus::Running).unwrap(),
            "\"running\""
        );
    }

    #[tokio::test(start_paused = true)]
    async fn handles_go_stale_after_ttl() {
        let api = crate::test_support::FakeContainers::healthy(&["web-1"]);
        let handle = ContainerHandle::fetch(&api, "web-1").await.unwrap();
        assert_eq!(api.inspect_count("web-1"), 1);
        assert!(!handle.is_stale(Duration::from_secs(5)));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(handle.is_stale(Duration::from_secs(5)));
        assert!(handle.is_stale(Duration::ZERO));
    }
}
