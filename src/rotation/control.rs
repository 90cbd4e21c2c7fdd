use super::{RotationEngine, RotationError, RotationTrigger, shuffled};
use crate::docker::{ContainerApi, ContainerName};
use crate::replica::ReplicaApi;
use crate::telemetry::FleetSnapshot;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlOutcome {
    pub success: bool,
    pub message: String,
}

impl ControlOutcome {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForceRotateOutcome {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<FleetSnapshot>,
}

impl ForceRotateOutcome {
    fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            snapshot: None,
        }
    }
}

/// Operator controls exposed over the HTTP API.
pub trait ControlService: Send + Sync + 'static {
    fn pause(&self) -> impl Future<Output = ControlOutcome> + Send;
    fn resume(&self) -> impl Future<Output = ControlOutcome> + Send;
    fn force_rotate(&self) -> impl Future<Output = ForceRotateOutcome> + Send;
    fn schedule_rotation(&self, after: Duration) -> impl Future<Output = ControlOutcome> + Send;
    fn kill_all_containers(&self) -> impl Future<Output = Vec<ContainerName>> + Send;
    fn snapshot(&self) -> impl Future<Output = FleetSnapshot> + Send;
}

impl<C: ContainerApi, R: ReplicaApi> RotationEngine<C, R> {
    /// Stop scheduling rotations. Containers are left as they are.
    pub async fn pause_rotation(&self) -> ControlOutcome {
        let mut state = self.state.lock().await;
        if state.resuming {
            state.resuming = false;
            state.rotation_active = false;
            info!("Rotation paused, pending resume cancelled");
            return ControlOutcome::ok("rotation paused, pending resume cancelled");
        }
        if !state.rotation_active {
            return ControlOutcome::ok("rotation already paused");
        }
        state.rotation_active = false;
        info!("Rotation paused");
        ControlOutcome::ok("rotation paused")
    }

    /// Restart the remembered active replica (or a healthy sibling), stop
    /// every other replica and re-arm the timer.
    pub async fn resume_rotation(&self) -> ControlOutcome {
        {
            let mut state = self.state.lock().await;
            if state.rotation_active && !state.resuming {
                return ControlOutcome::ok("rotation already active");
            }
            state.resuming = true;
        }
        let _guard = self.rotation_lock.lock().await;
        let state = self.rotation_state().await;

        let restored = match state.active_container.as_deref() {
            Some(active) => match self.fleet.start_container(active, "resume").await {
                Some(handle)
                    if self
                        .fleet
                        .wait_until_healthy(&handle, self.settings.health)
                        .await =>
                {
                    self.open_uptime(active, Instant::now()).await;
                    Some(active.to_string())
                }
                _ => {
                    warn!("{active} did not come back on resume");
                    self.recover_active(active, &state.managed).await
                }
            },
            None => {
                let candidates = shuffled(&state.managed);
                let next = self.activate_first_healthy(&candidates, "resume").await;
                if let Some(next) = &next {
                    self.adopt_active(next, Instant::now()).await;
                }
                next
            }
        };

        if let Some(active) = &restored {
            self.fleet
                .ensure_single_active(active, &state.managed, self.settings.stop_timeout)
                .await;
        }

        let mut current = self.state.lock().await;
        let cancelled = !current.resuming;
        current.resuming = false;
        current.rotation_active = restored.is_some() && !cancelled;
        current.arm(Instant::now(), self.settings.interval);
        match restored {
            Some(active) if cancelled => {
                info!("Resume finished with {active} running, rotation stays paused");
                ControlOutcome::failed(format!(
                    "paused while resuming, {active} is running but rotation stays paused"
                ))
            }
            Some(active) => {
                info!("Rotation resumed with {active} active");
                ControlOutcome::ok(format!("rotation resumed, {active} is active"))
            }
            None => {
                error!("Rotation could not be resumed: no healthy container");
                ControlOutcome::failed("no container became healthy, rotation stays paused")
            }
        }
    }

    /// Rotate right now. On success the next automatic rotation is pushed a
    /// full interval out.
    pub async fn force_rotation(&self) -> ForceRotateOutcome {
        let (managed_count, active) = {
            let state = self.state.lock().await;
            (state.managed.len(), state.active_container.clone())
        };
        if managed_count < 2 {
            return ForceRotateOutcome::failed(RotationError::NotEnoughContainers.to_string());
        }
        let Some(active) = active else {
            return ForceRotateOutcome::failed(RotationError::NoActiveContainer.to_string());
        };

        info!("Manual rotation requested");
        let result = {
            let _guard = self.rotation_lock.lock().await;
            let result = self.rotate_locked(RotationTrigger::Manual).await;
            if result.is_ok() {
                self.state.lock().await.pending_override =
                    Some(Instant::now() + self.settings.interval);
            }
            result
        };
        match result {
            Ok(outcome) => {
                let snapshot = self.refresh_snapshot().await;
                ForceRotateOutcome {
                    success: true,
                    message: format!("rotated from {} to {}", outcome.from, outcome.to),
                    snapshot,
                }
            }
            Err(RotationError::NoHealthyCandidate { .. }) => ForceRotateOutcome::failed(format!(
                "no healthy candidate available, {active} remains active"
            )),
            Err(e) => ForceRotateOutcome::failed(e.to_string()),
        }
    }

    pub async fn schedule_rotation_in(&self, after: Duration) -> ControlOutcome {
        self.state.lock().await.pending_override = Some(Instant::now() + after);
        info!("Next rotation scheduled in {after:?}");
        ControlOutcome::ok(format!("rotation scheduled in {}s", after.as_secs()))
    }

    /// Stop every managed replica and pause rotation so nothing is brought
    /// back up behind the operator's back.
    pub async fn kill_all(&self) -> Vec<ContainerName> {
        let _guard = self.rotation_lock.lock().await;
        let managed = {
            let mut state = self.state.lock().await;
            state.rotation_active = false;
            state.managed.clone()
        };
        warn!("Killing all managed containers");
        let mut stopped = Vec::new();
        for name in &managed {
            match self
                .fleet
                .stop_container(name, "kill all", self.settings.stop_timeout)
                .await
            {
                Ok(true) => stopped.push(name.clone()),
                Ok(false) => {}
                Err(e) => error!("Failed to kill {name}: {e}"),
            }
            self.close_uptime(name, Instant::now()).await;
        }
        warn!("Stopped {stopped:?}, rotation paused");
        stopped
    }
}

impl<C: ContainerApi, R: ReplicaApi> ControlService for RotationEngine<C, R> {
    async fn pause(&self) -> ControlOutcome {
        self.pause_rotation().await
    }

    async fn resume(&self) -> ControlOutcome {
        self.resume_rotation().await
    }

    async fn force_rotate(&self) -> ForceRotateOutcome {
        self.force_rotation().await
    }

    async fn schedule_rotation(&self, after: Duration) -> ControlOutcome {
        self.schedule_rotation_in(after).await
    }

    async fn kill_all_containers(&self) -> Vec<ContainerName> {
        self.kill_all().await
    }

    async fn snapshot(&self) -> FleetSnapshot {
        self.latest_snapshot().await
    }
}
