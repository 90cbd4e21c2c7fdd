//! The allow-listed set of replicas and the composite lifecycle operations the
//! rotation engine builds on.
use crate::container::{ContainerHandle, ContainerState, ContainerStatus};
use crate::docker::{ContainerApi, ContainerName, ErrorKind, ProxyError};
use crate::retry::{RetryPolicy, retry};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::Instant;

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("container {0} is not managed by this fleet")]
    NotManaged(ContainerName),
    #[error("failed to {action} {name}: {source}")]
    Proxy {
        name: ContainerName,
        action: &'static str,
        #[source]
        source: ProxyError,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct HealthWait {
    pub check_interval: Duration,
    pub log_interval: Duration,
    /// Upper bound for a candidate stuck in `starting`.
    pub timeout: Duration,
}

pub struct Fleet<C: ContainerApi> {
    api: Arc<C>,
    managed: Vec<ContainerName>,
    handles: RwLock<HashMap<ContainerName, ContainerHandle>>,
    retry_policy: RetryPolicy,
}

impl<C: ContainerApi> Fleet<C> {
    pub fn new(api: Arc<C>, managed: Vec<ContainerName>, retry_policy: RetryPolicy) -> Self {
        Self {
            api,
            managed,
            handles: RwLock::new(HashMap::new()),
            retry_policy,
        }
    }

    pub fn managed_names(&self) -> &[ContainerName] {
        &self.managed
    }

    pub fn is_managed(&self, name: &str) -> bool {
        self.managed.iter().any(|managed| managed == name)
    }

    /// Inspect, replacing the cached handle. A vanished container is dropped
    /// from the cache.
    async fn inspect_fresh(&self, name: &str) -> Result<ContainerHandle, ProxyError> {
        let api = &self.api;
        let label = format!("inspect {name}");
        let result = retry(&self.retry_policy, &label, ProxyError::is_transient, move || {
            ContainerHandle::fetch(api.as_ref(), name)
        })
        .await;
        let mut handles = self.handles.write().await;
        match &result {
            Ok(handle) => {
                handles.insert(name.to_string(), handle.clone());
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                handles.remove(name);
            }
            Err(_) => {}
        }
        result
    }

    /// Cached handle when younger than `ttl`, otherwise a fresh inspect.
    pub async fn handle(&self, name: &str, ttl: Duration) -> Result<ContainerHandle, ProxyError> {
        if !self.is_managed(name) {
            return Err(ProxyError::NotAllowed(name.to_string()));
        }
        let cached = self.handles.read().await.get(name).cloned();
        match cached {
            Some(handle) if !handle.is_stale(ttl) => Ok(handle),
            _ => self.inspect_fresh(name).await,
        }
    }

    /// Like [`Fleet::handle`], but a missing container is a state, not an error.
    pub async fn state_of(&self, name: &str, ttl: Duration) -> Result<ContainerState, ProxyError> {
        match self.handle(name, ttl).await {
            Ok(handle) => Ok(handle.state),
            Err(ProxyError::NotFound(_)) => Ok(ContainerState::not_found(Instant::now())),
            Err(e) => Err(e),
        }
    }

    /// Last known state without touching the runtime. Telemetry only.
    pub async fn cached_state(&self, name: &str) -> Option<ContainerState> {
        self.handles.read().await.get(name).map(|handle| handle.state)
    }

    pub async fn cached_handle(&self, name: &str) -> Option<ContainerHandle> {
        self.handles.read().await.get(name).cloned()
    }

    /// `None` means "unavailable right now": not managed, gone, or unreachable.
    pub async fn get_container_safe(&self, name: &str) -> Option<ContainerHandle> {
        if !self.is_managed(name) {
            warn!("Refusing access to unmanaged container {name}");
            return None;
        }
        match self.inspect_fresh(name).await {
            Ok(handle) => Some(handle),
            Err(ProxyError::NotFound(_)) => {
                debug!("container {name} not found");
                None
            }
            Err(e) => {
                warn!("container {name} unavailable: {e}");
                None
            }
        }
    }

    /// Returns `Ok(true)` when a stop was issued, `Ok(false)` when the container
    /// was not running to begin with.
    pub async fn stop_container(
        &self,
        name: &str,
        reason: &str,
        timeout: Duration,
    ) -> Result<bool, FleetError> {
        if !self.is_managed(name) {
            return Err(FleetError::NotManaged(name.to_string()));
        }
        let handle = match self.inspect_fresh(name).await {
            Ok(handle) => handle,
            Err(ProxyError::NotFound(_)) => return Ok(false),
            Err(source) => {
                return Err(FleetError::Proxy {
                    name: name.to_string(),
                    action: "inspect",
                    source,
                });
            }
        };

        if handle.state.status == ContainerStatus::Paused {
            debug!("unpausing {name} before stopping it");
            if let Err(e) = self.api.unpause(name).await {
                warn!("failed to unpause {name} before stop: {e}");
            }
        } else if !handle.state.status.is_live() {
            debug!("{name} already stopped ({})", handle.state.status);
            return Ok(false);
        }

        info!("Stopping container {name} ({reason})...");
        match self.api.stop(name, timeout).await {
            Ok(()) => {}
            Err(ProxyError::NotFound(_)) => {
                self.handles.write().await.remove(name);
                return Ok(false);
            }
            Err(source) => {
                error!("Failed to stop {name} ({reason}): {source}");
                return Err(FleetError::Proxy {
                    name: name.to_string(),
                    action: "stop",
                    source,
                });
            }
        }
        // the stop already happened, a failed wait changes nothing
        if let Err(e) = self.api.wait(name).await {
            debug!("wait for {name} after stop failed: {e}");
        }
        let _ = self.inspect_fresh(name).await;
        Ok(true)
    }

    /// Stop without a grace period.
    pub async fn force_stop(&self, name: &str, reason: &str) -> Result<bool, FleetError> {
        self.stop_container(name, reason, Duration::ZERO).await
    }

    pub async fn start_container(&self, name: &str, reason: &str) -> Option<ContainerHandle> {
        let handle = self.get_container_safe(name).await?;
        match handle.state.status {
            ContainerStatus::Running => {
                debug!("{name} already running");
                return Some(handle);
            }
            ContainerStatus::Paused => {
                info!("Unpausing container {name} ({reason})");
                if let Err(e) = self.api.unpause(name).await {
                    error!("Failed to unpause {name}: {e}");
                    return None;
                }
            }
            _ => {
                info!("Starting container {name} ({reason})");
                if let Err(e) = self.api.start(name).await {
                    error!("Failed to start {name}: {e}");
                    return None;
                }
            }
        }
        self.get_container_safe(name).await
    }

    /// Poll until the container is running and healthy (or has no healthcheck).
    /// Exiting, dying, disappearing or exceeding the timeout is a failure.
    pub async fn wait_until_healthy(&self, handle: &ContainerHandle, wait: HealthWait) -> bool {
        let name = handle.name.as_str();
        let started = Instant::now();
        let mut last_log = started;
        let mut state = handle.state;
        loop {
            if state.is_ready() {
                info!("{name} is healthy after {:?}", started.elapsed());
                return true;
            }
            if state.is_terminal() {
                warn!("{name} stopped while waiting for health ({})", state.status);
                return false;
            }
            if started.elapsed() >= wait.timeout {
                warn!(
                    "{name} not healthy after {:?} ({} / {})",
                    wait.timeout, state.status, state.health
                );
                return false;
            }
            if last_log.elapsed() >= wait.log_interval {
                info!(
                    "Waiting for {name} to become healthy ({} / {})",
                    state.status, state.health
                );
                last_log = Instant::now();
            }
            tokio::time::sleep(wait.check_interval).await;
            match self.inspect_fresh(name).await {
                Ok(fresh) => state = fresh.state,
                Err(ProxyError::NotFound(_)) => {
                    warn!("{name} disappeared while waiting for health");
                    return false;
                }
                Err(e) => debug!("health poll for {name} failed: {e}"),
            }
        }
    }

    /// Stop every managed container other than `active` that is still live.
    /// Returns the names that were stopped.
    pub async fn ensure_single_active(
        &self,
        active: &str,
        managed: &[ContainerName],
        timeout: Duration,
    ) -> Vec<ContainerName> {
        let mut stopped = Vec::new();
        for name in managed.iter().filter(|name| name.as_str() != active) {
            let state = match self.inspect_fresh(name).await {
                Ok(handle) => handle.state,
                Err(ProxyError::NotFound(_)) => continue,
                Err(e) => {
                    warn!("cannot verify {name} is stopped: {e}");
                    continue;
                }
            };
            if !state.status.is_live() {
                continue;
            }
            match self
                .stop_container(name, "enforcing single active", timeout)
                .await
            {
                Ok(true) => stopped.push(name.clone()),
                Ok(false) => {}
                Err(e) => error!("could not enforce single active on {name}: {e}"),
            }
        }
        if !stopped.is_empty() {
            warn!("Stopped extra running containers besides {active}: {stopped:?}");
        }
        stopped
    }
}
