use super::state::RotationState;
use super::{RotationEngine, RotationError, RotationOutcome, RotationTrigger, shuffled};
use crate::docker::{ContainerApi, ContainerName};
use crate::replica::ReplicaApi;
use crate::telemetry::RotationEvent;
use chrono::Utc;
use log::{debug, error, info, warn};
use std::time::Duration;
use tokio::time::Instant;

/// How the stop of the outgoing replica ended.
enum Retirement {
    Completed,
    /// The candidate died while the outgoing replica could not be stopped.
    CandidateLost,
    /// Both replicas would stay up; the handoff must be undone.
    Aborted,
}

impl<C: ContainerApi, R: ReplicaApi> RotationEngine<C, R> {
    /// Validate the managed set, stop everything and bring up one random
    /// healthy replica. Fails when no replica becomes healthy.
    pub async fn bootstrap(&self) -> Result<ContainerName, RotationError> {
        info!(
            "Bootstrapping rotation over {:?}",
            self.fleet.managed_names()
        );
        let mut managed = Vec::new();
        for name in self.fleet.managed_names() {
            if self.fleet.get_container_safe(name).await.is_some() {
                managed.push(name.clone());
            } else {
                warn!("Dropping unreachable container {name} from rotation");
            }
        }
        if managed.is_empty() {
            return Err(RotationError::Bootstrap(
                "none of the configured containers is reachable".to_string(),
            ));
        }

        let _guard = self.rotation_lock.lock().await;
        self.state.lock().await.managed = managed.clone();
        for name in &managed {
            if let Err(e) = self
                .fleet
                .stop_container(name, "bootstrap cleanup", self.settings.stop_timeout)
                .await
            {
                warn!("bootstrap could not stop {name}: {e}");
            }
        }

        let candidates = shuffled(&managed);
        let Some(active) = self.activate_first_healthy(&candidates, "bootstrap").await else {
            error!("No container became healthy during bootstrap");
            return Err(RotationError::NoHealthyCandidate {
                tried: candidates.len(),
            });
        };

        {
            let mut state = self.state.lock().await;
            state.rotation_active = true;
            state.resuming = false;
            state.rotation_count = 0;
            state.pending_override = None;
        }
        self.adopt_active(&active, Instant::now()).await;
        self.fleet
            .ensure_single_active(&active, &managed, self.settings.stop_timeout)
            .await;
        info!(
            "Bootstrap complete, {active} is active. Next rotation in {:?}",
            self.settings.interval
        );
        Ok(active)
    }

    /// One make-before-break handoff away from the active replica.
    pub async fn rotate(
        &self,
        trigger: RotationTrigger,
    ) -> Result<RotationOutcome, RotationError> {
        let _guard = self.rotation_lock.lock().await;
        self.rotate_locked(trigger).await
    }

    /// Rotation decided by the loop from `planned`. Returns `None` when an
    /// operator or another handoff changed the state while this one waited
    /// for the lock.
    pub(super) async fn rotate_planned(
        &self,
        planned: &RotationState,
        trigger: RotationTrigger,
    ) -> Option<Result<RotationOutcome, RotationError>> {
        let _guard = self.rotation_lock.lock().await;
        {
            let mut state = self.state.lock().await;
            if !state.still_due(planned) {
                return None;
            }
            if trigger == RotationTrigger::Override {
                state.pending_override = None;
            }
        }
        Some(self.rotate_locked(trigger).await)
    }

    pub(super) async fn rotate_locked(
        &self,
        trigger: RotationTrigger,
    ) -> Result<RotationOutcome, RotationError> {
        let started = Instant::now();
        let (outgoing, managed) = {
            let state = self.state.lock().await;
            (state.active_container.clone(), state.managed.clone())
        };
        if managed.len() < 2 {
            return Err(RotationError::NotEnoughContainers);
        }
        let Some(outgoing) = outgoing else {
            return Err(RotationError::NoActiveContainer);
        };

        let candidates = shuffled(managed.iter().filter(|name| **name != outgoing));
        info!("Rotating away from {outgoing} ({trigger}), candidates {candidates:?}");

        for candidate in &candidates {
            self.prepare(&outgoing).await?;

            let Some(handle) = self
                .fleet
                .start_container(candidate, "rotation candidate")
                .await
            else {
                warn!("Candidate {candidate} failed to start");
                self.discard_candidate(candidate).await;
                continue;
            };
            if !self
                .fleet
                .wait_until_healthy(&handle, self.settings.health)
                .await
            {
                warn!("Candidate {candidate} failed its health check");
                self.discard_candidate(candidate).await;
                continue;
            }

            self.close_uptime(&outgoing, Instant::now()).await;
            match self.retire(&outgoing, candidate).await {
                Retirement::Completed => {}
                Retirement::CandidateLost => {
                    self.open_uptime(&outgoing, Instant::now()).await;
                    self.discard_candidate(candidate).await;
                    continue;
                }
                Retirement::Aborted => {
                    error!(
                        "Aborting rotation: both {outgoing} and {candidate} are running, stopping {candidate}"
                    );
                    if let Err(e) = self
                        .fleet
                        .force_stop(candidate, "aborted rotation")
                        .await
                    {
                        error!("Could not stop candidate {candidate} after abort: {e}");
                    }
                    self.open_uptime(&outgoing, Instant::now()).await;
                    return Err(RotationError::InvariantViolation {
                        outgoing,
                        candidate: candidate.clone(),
                    });
                }
            }

            self.promote(candidate, &outgoing, &managed, trigger, started)
                .await;
            return Ok(RotationOutcome {
                from: outgoing,
                to: candidate.clone(),
            });
        }

        warn!("Rotation skipped: no healthy candidate, {outgoing} stays active");
        Err(RotationError::NoHealthyCandidate {
            tried: candidates.len(),
        })
    }

    async fn prepare(&self, outgoing: &str) -> Result<(), RotationError> {
        match self.replicas.prepare_rotation(outgoing).await {
            Ok(report) if report.overall_success => {
                info!(
                    "{outgoing} prepared for rotation: validated {}, rejected {}, promoted {}, failed {}",
                    report.validated, report.rejected, report.promoted, report.failed
                );
                Ok(())
            }
            Ok(report) => {
                let reason = report
                    .message
                    .unwrap_or_else(|| "replica reported overall_success=false".to_string());
                error!("Preparation failure on {outgoing}: {reason}. Rotation aborted");
                Err(RotationError::Preparation {
                    container: outgoing.to_string(),
                    reason,
                })
            }
            Err(e) => {
                error!("Preparation failure on {outgoing}: {e}. Rotation aborted");
                Err(RotationError::Preparation {
                    container: outgoing.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Stop the outgoing replica and verify it is really down.
    async fn retire(&self, outgoing: &str, candidate: &str) -> Retirement {
        if let Err(e) = self
            .fleet
            .stop_container(outgoing, "rotated out", self.settings.stop_timeout)
            .await
        {
            warn!("Stopping {outgoing} failed ({e}), checking actual state");
            if self.observed_live(outgoing).await {
                if !self.observed_live(candidate).await {
                    warn!("Candidate {candidate} went down while {outgoing} is still running");
                    return Retirement::CandidateLost;
                }
                if !self.force_retire(outgoing).await {
                    return Retirement::Aborted;
                }
            } else {
                debug!("{outgoing} stopped despite the error");
            }
        }

        if self.observed_live(outgoing).await {
            warn!("{outgoing} still running after handoff, forcing stop");
            if !self.force_retire(outgoing).await {
                return Retirement::Aborted;
            }
        }
        Retirement::Completed
    }

    /// Unknown state counts as live.
    async fn observed_live(&self, name: &str) -> bool {
        match self.fleet.state_of(name, Duration::ZERO).await {
            Ok(state) => state.status.is_live(),
            Err(e) => {
                warn!("cannot observe {name}: {e}");
                true
            }
        }
    }

    async fn force_retire(&self, name: &str) -> bool {
        if let Err(e) = self.fleet.force_stop(name, "forced handoff stop").await {
            error!("Force stop of {name} failed: {e}");
        }
        !self.observed_live(name).await
    }

    async fn promote(
        &self,
        candidate: &str,
        outgoing: &str,
        managed: &[ContainerName],
        trigger: RotationTrigger,
        started: Instant,
    ) {
        let now = Instant::now();
        self.adopt_active(candidate, now).await;
        self.fleet
            .ensure_single_active(candidate, managed, self.settings.stop_timeout)
            .await;
        let count = {
            let mut state = self.state.lock().await;
            state.rotation_count += 1;
            state.last_rotation_time = Some(Utc::now());
            state.rotation_count
        };
        self.security.forget(outgoing).await;
        let duration = started.elapsed();
        self.telemetry
            .record_rotation(RotationEvent {
                from: Some(outgoing.to_string()),
                to: candidate.to_string(),
                trigger,
                at: Utc::now(),
                duration_ms: duration.as_millis() as u64,
            })
            .await;
        info!("Rotation #{count} complete: {outgoing} -> {candidate} ({trigger}) in {duration:?}");
    }

    /// First candidate that starts and turns healthy. Failed candidates are
    /// stopped again.
    pub(super) async fn activate_first_healthy(
        &self,
        candidates: &[ContainerName],
        reason: &str,
    ) -> Option<ContainerName> {
        for name in candidates {
            let Some(handle) = self.fleet.start_container(name, reason).await else {
                warn!("{name} failed to start ({reason})");
                self.discard_candidate(name).await;
                continue;
            };
            if self
                .fleet
                .wait_until_healthy(&handle, self.settings.health)
                .await
            {
                return Some(name.clone());
            }
            warn!("{name} failed its health check ({reason})");
            self.discard_candidate(name).await;
        }
        None
    }

    async fn discard_candidate(&self, name: &str) {
        if let Err(e) = self
            .fleet
            .stop_container(name, "failed candidate", self.settings.stop_timeout)
            .await
        {
            error!("Could not stop failed candidate {name}: {e}");
        }
    }

    /// Bring the active replica back, or hand the role to the first healthy
    /// sibling. Caller holds the rotation lock.
    pub(super) async fn recover_active(
        &self,
        active: &str,
        managed: &[ContainerName],
    ) -> Option<ContainerName> {
        self.close_uptime(active, Instant::now()).await;
        if let Some(handle) = self.fleet.start_container(active, "recovering active").await
            && self
                .fleet
                .wait_until_healthy(&handle, self.settings.health)
                .await
        {
            info!("Recovered active container {active}");
            self.open_uptime(active, Instant::now()).await;
            return Some(active.to_string());
        }

        warn!("Active container {active} cannot be recovered, promoting a sibling");
        self.discard_candidate(active).await;
        let candidates = shuffled(managed.iter().filter(|name| name.as_str() != active));
        match self
            .activate_first_healthy(&candidates, "replacing failed active")
            .await
        {
            Some(next) => {
                self.adopt_active(&next, Instant::now()).await;
                warn!("{next} replaced failed active container {active}");
                Some(next)
            }
            None => {
                error!("No healthy container available, the fleet is down");
                None
            }
        }
    }
}
