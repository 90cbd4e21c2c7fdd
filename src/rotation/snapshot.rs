use super::RotationEngine;
use super::state::RotationState;
use crate::container::ContainerState;
use crate::docker::{ContainerApi, ProxyError};
use crate::replica::ReplicaApi;
use crate::telemetry::{ContainerSnapshot, FleetSnapshot};
use chrono::{TimeDelta, Utc};
use log::warn;
use tokio::time::Instant;

impl<C: ContainerApi, R: ReplicaApi> RotationEngine<C, R> {
    /// Assemble a snapshot from container states no older than the refresh
    /// interval. Fails when the runtime cannot be reached.
    pub async fn build_snapshot(&self) -> Result<FleetSnapshot, ProxyError> {
        let state = self.rotation_state().await;
        let ttl = self.telemetry.settings().snapshot_interval;
        let mut containers = Vec::with_capacity(state.managed.len());
        for name in &state.managed {
            let current = self.fleet.state_of(name, ttl).await?;
            containers.push(self.container_snapshot(name, current, &state).await);
        }
        Ok(self.compose(state, containers).await)
    }

    /// Snapshot from whatever the fleet cache holds. Never calls the runtime.
    async fn cached_snapshot(&self) -> FleetSnapshot {
        let state = self.rotation_state().await;
        let mut containers = Vec::with_capacity(state.managed.len());
        for name in &state.managed {
            let current = self
                .fleet
                .cached_state(name)
                .await
                .unwrap_or_else(|| ContainerState::not_found(Instant::now()));
            containers.push(self.container_snapshot(name, current, &state).await);
        }
        self.compose(state, containers).await
    }

    async fn container_snapshot(
        &self,
        name: &str,
        current: ContainerState,
        state: &RotationState,
    ) -> ContainerSnapshot {
        let now = Instant::now();
        let ledger = self.uptime_of(name).await;
        let active = state.active_container.as_deref() == Some(name);
        let active_since = ledger.active_since.and_then(|since| {
            TimeDelta::from_std(now.saturating_duration_since(since))
                .ok()
                .map(|elapsed| Utc::now() - elapsed)
        });
        let started_at = self
            .fleet
            .cached_handle(name)
            .await
            .and_then(|handle| handle.started_at().map(str::to_string));
        let risk_score = if active {
            self.security
                .last_assessment(name)
                .await
                .map(|assessment| assessment.score)
        } else {
            None
        };
        ContainerSnapshot {
            name: name.to_string(),
            status: current.status,
            health: current.health,
            active,
            uptime_seconds: ledger.total(now).as_secs(),
            active_since,
            started_at,
            risk_score,
        }
    }

    async fn compose(
        &self,
        state: RotationState,
        containers: Vec<ContainerSnapshot>,
    ) -> FleetSnapshot {
        FleetSnapshot {
            generated_at: Utc::now(),
            active_container: state.active_container,
            rotation_active: state.rotation_active,
            resuming: state.resuming,
            rotation_count: state.rotation_count,
            last_rotation_time: state.last_rotation_time,
            next_rotation_eta: state.next_rotation_eta,
            containers,
            latest_metrics: self.telemetry.latest_metrics().await,
            metrics_history: self.telemetry.metrics_history().await,
            container_history: self.telemetry.container_history().await,
            recent_rotations: self.telemetry.rotation_history().await,
        }
    }

    /// Rebuild and cache the snapshot. `None` when the runtime is unreachable.
    pub async fn refresh_snapshot(&self) -> Option<FleetSnapshot> {
        match self.build_snapshot().await {
            Ok(snapshot) => {
                self.telemetry.store_snapshot(snapshot.clone()).await;
                Some(snapshot)
            }
            Err(e) => {
                warn!("snapshot refresh failed: {e}");
                None
            }
        }
    }

    /// Fresh cached snapshot if there is one, otherwise a rebuild. When the
    /// rebuild fails the last snapshot is served even if stale.
    pub async fn latest_snapshot(&self) -> FleetSnapshot {
        if let Some(snapshot) = self.telemetry.fresh_snapshot().await {
            return snapshot;
        }
        if let Some(snapshot) = self.refresh_snapshot().await {
            return snapshot;
        }
        match self.telemetry.last_snapshot().await {
            Some(snapshot) => snapshot,
            None => self.cached_snapshot().await,
        }
    }
}
