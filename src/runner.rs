//! Background loops around a [`RotationEngine`]: rotation, uptime tracking,
//! metrics sampling and snapshot refresh. They share nothing but the engine
//! and stop together on shutdown.
use crate::docker::ContainerApi;
use crate::replica::ReplicaApi;
use crate::rotation::RotationEngine;
use log::{error, info};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};

const SLEEP_CHUNK: Duration = Duration::from_millis(500);
const UPTIME_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone, Default)]
pub struct Shutdown {
    flag: Arc<AtomicBool>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Sleep in small chunks. Returns false if shutdown was requested.
    pub async fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        while !self.is_triggered() {
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            sleep(SLEEP_CHUNK.min(deadline - now)).await;
        }
        false
    }

    pub async fn wait(&self) {
        while !self.is_triggered() {
            sleep(SLEEP_CHUNK).await;
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LoopIntervals {
    pub metrics: Duration,
    pub container_history: Duration,
    pub snapshot: Duration,
}

pub fn spawn_loops<C: ContainerApi, R: ReplicaApi>(
    engine: Arc<RotationEngine<C, R>>,
    intervals: LoopIntervals,
    shutdown: Shutdown,
) -> Vec<JoinHandle<()>> {
    vec![
        tokio::spawn(rotation_loop(engine.clone(), shutdown.clone())),
        tokio::spawn(uptime_loop(engine.clone(), shutdown.clone())),
        tokio::spawn(metrics_loop(engine.clone(), intervals, shutdown.clone())),
        tokio::spawn(snapshot_loop(engine, intervals.snapshot, shutdown)),
    ]
}

async fn rotation_loop<C: ContainerApi, R: ReplicaApi>(
    engine: Arc<RotationEngine<C, R>>,
    shutdown: Shutdown,
) {
    if shutdown.is_triggered() {
        return;
    }
    if let Err(e) = engine.bootstrap().await {
        error!("Rotation loop stopped, bootstrap failed: {e}");
        return;
    }
    let tick_interval = engine.settings().tick_interval;
    let mut tick: u64 = 0;
    while !shutdown.is_triggered() {
        tick += 1;
        engine.tick(tick).await;
        if !shutdown.sleep(tick_interval).await {
            break;
        }
    }
    info!("Rotation loop stopped");
}

async fn uptime_loop<C: ContainerApi, R: ReplicaApi>(
    engine: Arc<RotationEngine<C, R>>,
    shutdown: Shutdown,
) {
    while !shutdown.is_triggered() {
        engine.track_uptime().await;
        if !shutdown.sleep(UPTIME_INTERVAL).await {
            break;
        }
    }
}

async fn metrics_loop<C: ContainerApi, R: ReplicaApi>(
    engine: Arc<RotationEngine<C, R>>,
    intervals: LoopIntervals,
    shutdown: Shutdown,
) {
    let mut last_history: Option<Instant> = None;
    while !shutdown.is_triggered() {
        engine.sample_metrics().await;
        if last_history.is_none_or(|at| at.elapsed() >= intervals.container_history) {
            engine.sample_containers().await;
            last_history = Some(Instant::now());
        }
        if !shutdown.sleep(intervals.metrics).await {
            break;
        }
    }
}

async fn snapshot_loop<C: ContainerApi, R: ReplicaApi>(
    engine: Arc<RotationEngine<C, R>>,
    interval: Duration,
    shutdown: Shutdown,
) {
    while !shutdown.is_triggered() {
        engine.refresh_snapshot().await;
        if !shutdown.sleep(interval).await {
            break;
        }
    }
}
