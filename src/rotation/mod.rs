//! The rotation engine: exactly one healthy replica serves at a time and the
//! role moves to a fresh replica on a timer, on demand, or under security
//! pressure.
//!
//! A handoff is make-before-break. The candidate is started and must report
//! healthy before the outgoing replica is stopped, and the outgoing replica is
//! never stopped when its preparation hook failed.
mod control;
mod handoff;
pub(crate) mod schedule;
mod snapshot;
pub mod state;
mod tick;


use crate::docker::{ContainerApi, ContainerName};
use crate::fleet::{Fleet, HealthWait};
use crate::replica::ReplicaApi;
use crate::security::SecurityMonitor;
use crate::telemetry::Telemetry;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use state::{RotationState, UptimeLedger};
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

pub use control::{ControlOutcome, ControlService, ForceRotateOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationTrigger {
    Timer,
    Override,
    SecurityImmediate,
    SecuritySoon,
    Manual,
}

impl Display for RotationTrigger {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            RotationTrigger::Timer => write!(f, "timer"),
            RotationTrigger::Override => write!(f, "override"),
            RotationTrigger::SecurityImmediate => write!(f, "security (immediate)"),
            RotationTrigger::SecuritySoon => write!(f, "security (soon)"),
            RotationTrigger::Manual => write!(f, "manual"),
        }
    }
}

#[derive(Debug, Error)]
pub enum RotationError {
    #[error("at least two managed containers are required to rotate")]
    NotEnoughContainers,
    #[error("no active container is tracked")]
    NoActiveContainer,
    #[error("preparation failed on {container}: {reason}")]
    Preparation {
        container: ContainerName,
        reason: String,
    },
    #[error("no healthy candidate among {tried} containers")]
    NoHealthyCandidate { tried: usize },
    #[error("{outgoing} is still running after handing over to {candidate}")]
    InvariantViolation {
        outgoing: ContainerName,
        candidate: ContainerName,
    },
    #[error("bootstrap failed: {0}")]
    Bootstrap(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationOutcome {
    pub from: ContainerName,
    pub to: ContainerName,
}

#[derive(Debug, Clone, Copy)]
pub struct RotationSettings {
    pub interval: Duration,
    pub tick_interval: Duration,
    /// Run the single-active sweep every N ticks. 0 disables it.
    pub sweep_every_ticks: u64,
    pub health: HealthWait,
    pub stop_timeout: Duration,
    /// How old a cached container state may be for uptime tracking.
    pub state_ttl: Duration,
    pub failed_rotation_retry: Duration,
}

pub struct RotationEngine<C: ContainerApi, R: ReplicaApi> {
    fleet: Arc<Fleet<C>>,
    replicas: Arc<R>,
    security: SecurityMonitor<R>,
    telemetry: Telemetry,
    settings: RotationSettings,
    state: Mutex<RotationState>,
    /// Serializes handoffs, resume and kill-all.
    rotation_lock: Mutex<()>,
    uptime: Mutex<HashMap<ContainerName, UptimeLedger>>,
}

impl<C: ContainerApi, R: ReplicaApi> RotationEngine<C, R> {
    pub fn new(
        fleet: Arc<Fleet<C>>,
        replicas: Arc<R>,
        security: SecurityMonitor<R>,
        telemetry: Telemetry,
        settings: RotationSettings,
    ) -> Self {
        let managed = fleet.managed_names().to_vec();
        Self {
            fleet,
            replicas,
            security,
            telemetry,
            settings,
            state: Mutex::new(RotationState {
                managed,
                ..Default::default()
            }),
            rotation_lock: Mutex::new(()),
            uptime: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &RotationSettings {
        &self.settings
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    pub fn fleet(&self) -> &Fleet<C> {
        &self.fleet
    }

    pub async fn rotation_state(&self) -> RotationState {
        self.state.lock().await.clone()
    }

    pub async fn active_container(&self) -> Option<ContainerName> {
        self.state.lock().await.active_container.clone()
    }

    async fn open_uptime(&self, name: &str, now: Instant) {
        self.uptime
            .lock()
            .await
            .entry(name.to_string())
            .or_default()
            .open(now);
    }

    async fn close_uptime(&self, name: &str, now: Instant) {
        if let Some(ledger) = self.uptime.lock().await.get_mut(name) {
            ledger.close(now);
        }
    }

    pub async fn uptime_of(&self, name: &str) -> UptimeLedger {
        self.uptime
            .lock()
            .await
            .get(name)
            .copied()
            .unwrap_or_default()
    }

    /// Make `name` the active replica and start a fresh interval.
    async fn adopt_active(&self, name: &str, now: Instant) {
        {
            let mut state = self.state.lock().await;
            state.set_active(name);
            state.arm(now, self.settings.interval);
            state.retry_not_before = None;
        }
        self.open_uptime(name, now).await;
    }
}

fn shuffled<'a>(names: impl IntoIterator<Item = &'a ContainerName>) -> Vec<ContainerName> {
    let mut names: Vec<ContainerName> = names.into_iter().cloned().collect();
    names.shuffle(&mut rand::rng());
    names
}
