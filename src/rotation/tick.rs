use super::RotationEngine;
use super::RotationError;
use super::RotationTrigger;
use super::schedule::{Plan, ScheduleInput, plan};
use crate::docker::ContainerApi;
use crate::replica::ReplicaApi;
use crate::security::RiskAssessment;
use crate::telemetry::{ContainerHistorySample, ContainerSample, MetricsSample};
use chrono::Utc;
use log::{debug, error, warn};
use std::time::Duration;
use tokio::time::Instant;

impl<C: ContainerApi, R: ReplicaApi> RotationEngine<C, R> {
    /// One iteration of the rotation loop. `tick` counts from 1.
    pub async fn tick(&self, tick: u64) {
        if self.state.lock().await.reconcile_active_index() {
            debug!("active index realigned");
        }
        if self.settings.sweep_every_ticks > 0 && tick % self.settings.sweep_every_ticks == 0 {
            self.sweep().await;
        }

        let now = Instant::now();
        let state = self.rotation_state().await;
        let Some(active) = state.active_container.as_deref() else {
            return;
        };
        let interval = self.settings.interval;
        let paused = state.is_paused();
        let risk = if paused || state.pending_override.is_some() || state.managed.len() < 2 {
            RiskAssessment::default()
        } else {
            self.security.assess(active).await
        };
        let input = ScheduleInput {
            now,
            interval,
            armed_at: state.armed_at.unwrap_or(now),
            next_switch_at: state.next_switch_at.unwrap_or(now + interval),
            pending_override: state.pending_override,
            retry_not_before: state.retry_not_before,
            paused,
            risk,
            managed_count: state.managed.len(),
        };

        match plan(&input) {
            Plan::Rearm => self.state.lock().await.arm(now, interval),
            Plan::Wait { deadline } => self.state.lock().await.set_eta(deadline, now),
            Plan::Rotate { trigger } => {
                if trigger == RotationTrigger::SecurityImmediate {
                    warn!("Risk score {} on {active}, rotating immediately", risk.score);
                }
                match self.rotate_planned(&state, trigger).await {
                    Some(Ok(_)) => {}
                    Some(Err(e)) => self.rotation_failed(&e).await,
                    None => debug!("{trigger} rotation superseded while waiting for the lock"),
                }
            }
        }
    }

    /// Re-arm after a failed or skipped rotation and hold off security
    /// retries until the retry delay has passed.
    async fn rotation_failed(&self, error: &RotationError) {
        let now = Instant::now();
        let retry = self
            .settings
            .failed_rotation_retry
            .min(self.settings.interval);
        match error {
            RotationError::Preparation { .. } | RotationError::InvariantViolation { .. } => {
                error!("Rotation failed: {error}. Retrying in {retry:?}")
            }
            _ => warn!("Rotation skipped: {error}. Retrying in {retry:?}"),
        }
        let mut state = self.state.lock().await;
        state.armed_at = Some(now);
        state.next_switch_at = Some(now + retry);
        state.retry_not_before = Some(now + retry);
        state.set_eta(now + retry, now);
    }

    /// Heal a dead active replica and stop anything else that runs.
    async fn sweep(&self) {
        let state = self.rotation_state().await;
        let Some(active) = state.active_container.clone() else {
            return;
        };
        if state.is_paused() {
            return;
        }
        let Ok(_guard) = self.rotation_lock.try_lock() else {
            debug!("sweep skipped, handoff in progress");
            return;
        };

        match self.fleet.state_of(&active, Duration::ZERO).await {
            Ok(current) if current.is_running() => {}
            Ok(current) => {
                warn!("Active container {active} is {}, recovering", current.status);
                self.recover_active(&active, &state.managed).await;
            }
            Err(e) => {
                warn!("cannot check active container {active}: {e}");
                return;
            }
        }

        if let Some(active) = self.active_container().await {
            self.fleet
                .ensure_single_active(&active, &state.managed, self.settings.stop_timeout)
                .await;
        }
    }

    /// Keep the uptime ledger of the active replica open while it is ready and
    /// closed otherwise. Skipped while a handoff owns the fleet.
    pub async fn track_uptime(&self) {
        let Ok(_guard) = self.rotation_lock.try_lock() else {
            return;
        };
        let state = self.rotation_state().await;
        for name in &state.managed {
            let ready = match self.fleet.state_of(name, self.settings.state_ttl).await {
                Ok(current) => current.is_ready(),
                Err(e) => {
                    debug!("uptime check of {name} failed: {e}");
                    continue;
                }
            };
            let is_active = state.active_container.as_deref() == Some(name.as_str());
            let now = Instant::now();
            if ready && is_active {
                self.open_uptime(name, now).await;
            } else {
                self.close_uptime(name, now).await;
            }
        }
    }

    pub async fn sample_metrics(&self) {
        let state = self.rotation_state().await;
        let risk = match &state.active_container {
            Some(active) => self.security.assess(active).await,
            None => RiskAssessment::default(),
        };
        let mut running = 0;
        let mut healthy = 0;
        for name in &state.managed {
            if let Some(current) = self.fleet.cached_state(name).await {
                if current.is_running() {
                    running += 1;
                }
                if current.is_ready() {
                    healthy += 1;
                }
            }
        }
        self.telemetry
            .record_metrics(MetricsSample {
                timestamp: Utc::now(),
                active_container: state.active_container,
                risk_score: risk.score,
                rotate_immediately: risk.rotate_immediately,
                rotate_soon: risk.rotate_soon,
                running_containers: running,
                healthy_containers: healthy,
                rotation_count: state.rotation_count,
            })
            .await;
    }

    pub async fn sample_containers(&self) {
        let state = self.rotation_state().await;
        let mut containers = Vec::with_capacity(state.managed.len());
        for name in &state.managed {
            if let Some(current) = self.fleet.cached_state(name).await {
                containers.push(ContainerSample {
                    name: name.clone(),
                    status: current.status,
                    health: current.health,
                });
            }
        }
        self.telemetry
            .record_containers(ContainerHistorySample {
                timestamp: Utc::now(),
                active_container: state.active_container,
                containers,
            })
            .await;
    }
}
