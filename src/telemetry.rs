//! Rolling histories and the published fleet snapshot.
//!
//! Each store has its own lock so dashboard reads never wait on the rotation
//! critical path.
use crate::container::{ContainerStatus, HealthStatus};
use crate::docker::ContainerName;
use crate::rotation::RotationTrigger;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

pub const ROTATION_HISTORY_LEN: usize = 20;

/// Fixed-capacity ring buffer; the oldest entry is dropped on overflow.
#[derive(Debug, Clone)]
pub struct History<T> {
    capacity: usize,
    entries: VecDeque<T>,
}

impl<T: Clone> History<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    /// Sized so that `capacity * interval` covers `retention`.
    pub fn for_window(retention: Duration, interval: Duration) -> Self {
        let interval_ms = interval.as_millis().max(1);
        let capacity = retention.as_millis().div_ceil(interval_ms) as usize;
        Self::with_capacity(capacity)
    }

    pub fn push(&mut self, entry: T) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn latest(&self) -> Option<&T> {
        self.entries.back()
    }

    pub fn to_vec(&self) -> Vec<T> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MetricsSample {
    pub timestamp: DateTime<Utc>,
    pub active_container: Option<ContainerName>,
    pub risk_score: u8,
    pub rotate_immediately: bool,
    pub rotate_soon: bool,
    pub running_containers: usize,
    pub healthy_containers: usize,
    pub rotation_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSample {
    pub name: ContainerName,
    pub status: ContainerStatus,
    pub health: HealthStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ContainerHistorySample {
    pub timestamp: DateTime<Utc>,
    pub active_container: Option<ContainerName>,
    pub containers: Vec<ContainerSample>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationEvent {
    pub from: Option<ContainerName>,
    pub to: ContainerName,
    pub trigger: RotationTrigger,
    pub at: DateTime<Utc>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSnapshot {
    pub name: ContainerName,
    pub status: ContainerStatus,
    pub health: HealthStatus,
    pub active: bool,
    pub uptime_seconds: u64,
    pub active_since: Option<DateTime<Utc>>,
    pub started_at: Option<String>,
    pub risk_score: Option<u8>,
}

/// The read model published to observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct FleetSnapshot {
    pub generated_at: DateTime<Utc>,
    pub active_container: Option<ContainerName>,
    pub rotation_active: bool,
    pub resuming: bool,
    pub rotation_count: u64,
    pub last_rotation_time: Option<DateTime<Utc>>,
    pub next_rotation_eta: Option<u64>,
    pub containers: Vec<ContainerSnapshot>,
    pub latest_metrics: Option<MetricsSample>,
    pub metrics_history: Vec<MetricsSample>,
    pub container_history: Vec<ContainerHistorySample>,
    pub recent_rotations: Vec<RotationEvent>,
}

#[derive(Debug, Clone, Copy)]
pub struct TelemetrySettings {
    pub metrics_interval: Duration,
    pub metrics_retention: Duration,
    pub container_interval: Duration,
    pub container_retention: Duration,
    pub snapshot_interval: Duration,
}

pub struct Telemetry {
    settings: TelemetrySettings,
    metrics: RwLock<History<MetricsSample>>,
    containers: RwLock<History<ContainerHistorySample>>,
    rotations: RwLock<History<RotationEvent>>,
    snapshot: RwLock<Option<(Instant, FleetSnapshot)>>,
}

impl Telemetry {
    pub fn new(settings: TelemetrySettings) -> Self {
        Self {
            settings,
            metrics: RwLock::new(History::for_window(
                settings.metrics_retention,
                settings.metrics_interval,
            )),
            containers: RwLock::new(History::for_window(
                settings.container_retention,
                settings.container_interval,
            )),
            rotations: RwLock::new(History::with_capacity(ROTATION_HISTORY_LEN)),
            snapshot: RwLock::new(None),
        }
    }

    pub fn settings(&self) -> &TelemetrySettings {
        &self.settings
    }

    /// A cached snapshot older than this is considered stale.
    pub fn max_snapshot_age(&self) -> Duration {
        self.settings.snapshot_interval * 2
    }

    pub async fn record_metrics(&self, sample: MetricsSample) {
        self.metrics.write().await.push(sample);
    }

    pub async fn record_containers(&self, sample: ContainerHistorySample) {
        self.containers.write().await.push(sample);
    }

    pub async fn record_rotation(&self, event: RotationEvent) {
        self.rotations.write().await.push(event);
    }

    pub async fn latest_metrics(&self) -> Option<MetricsSample> {
        self.metrics.read().await.latest().cloned()
    }

    pub async fn metrics_history(&self) -> Vec<MetricsSample> {
        self.metrics.read().await.to_vec()
    }

    pub async fn container_history(&self) -> Vec<ContainerHistorySample> {
        self.containers.read().await.to_vec()
    }

    pub async fn rotation_history(&self) -> Vec<RotationEvent> {
        self.rotations.read().await.to_vec()
    }

    pub async fn store_snapshot(&self, snapshot: FleetSnapshot) {
        *self.snapshot.write().await = Some((Instant::now(), snapshot));
    }

    /// The cached snapshot if it is younger than [`Telemetry::max_snapshot_age`].
    pub async fn fresh_snapshot(&self) -> Option<FleetSnapshot> {
        let max_age = self.max_snapshot_age();
        self.snapshot
            .read()
            .await
            .as_ref()
            .filter(|(stored_at, _)| stored_at.elapsed() <= max_age)
            .map(|(_, snapshot)| snapshot.clone())
    }

    /// The cached snapshot regardless of age.
    pub async fn last_snapshot(&self) -> Option<FleetSnapshot> {
        self.snapshot
            .read()
            .await
            .as_ref()
            .map(|(_, snapshot)| snapshot.clone())
    }
}
