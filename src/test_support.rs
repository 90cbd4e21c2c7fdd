use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bollard::models::{
    ContainerInspectResponse, ContainerState as RuntimeState, ContainerStateStatusEnum, Health,
    HealthStatusEnum,
};

use crate::container::{ContainerStatus, HealthStatus};
use crate::docker::{ContainerApi, ProxyError};
use crate::replica::{PreparationReport, ReplicaApi, ReplicaError, SecurityCounters};

pub(crate) fn inspect_response(
    status: ContainerStatus,
    health: HealthStatus,
) -> ContainerInspectResponse {
    let status = match status {
        ContainerStatus::Running => ContainerStateStatusEnum::RUNNING,
        ContainerStatus::Created => ContainerStateStatusEnum::CREATED,
        ContainerStatus::Paused => ContainerStateStatusEnum::PAUSED,
        ContainerStatus::Restarting => ContainerStateStatusEnum::RESTARTING,
        ContainerStatus::Dead => ContainerStateStatusEnum::DEAD,
        ContainerStatus::Exited | ContainerStatus::NotFound => ContainerStateStatusEnum::EXITED,
    };
    let health = match health {
        HealthStatus::None => None,
        HealthStatus::Healthy => Some(HealthStatusEnum::HEALTHY),
        HealthStatus::Unhealthy => Some(HealthStatusEnum::UNHEALTHY),
        HealthStatus::Starting => Some(HealthStatusEnum::STARTING),
    };
    ContainerInspectResponse {
        state: Some(RuntimeState {
            running: Some(status == ContainerStateStatusEnum::RUNNING),
            status: Some(status),
            health: health.map(|status| Health {
                status: Some(status),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Inspect(String),
    Start(String),
    Stop(String),
    Wait(String),
    Unpause(String),
}

/// What happens to the next container that gets started.
#[derive(Debug, Clone, Copy)]
pub(crate) enum StartOutcome {
    Healthy,
    Exits,
    StaysStarting,
    Fails,
}

/// Scripted failure for stop requests against one container.
#[derive(Debug, Clone, Copy)]
pub(crate) enum StopFailure {
    /// The request errors and the container keeps running.
    KeepsRunning { times: usize },
    /// The request errors although the container did stop.
    StopsAnyway { times: usize },
}

#[derive(Default)]
struct FakeState {
    containers: HashMap<String, (ContainerStatus, HealthStatus)>,
    calls: Vec<Call>,
    start_outcomes: VecDeque<StartOutcome>,
    stop_failures: HashMap<String, StopFailure>,
    inspect_down: bool,
}

/// In-memory container runtime recording every call in order.
#[derive(Clone, Default)]
pub(crate) struct FakeContainers {
    inner: Arc<StdMutex<FakeState>>,
}

impl FakeContainers {
    /// All containers exist and are stopped; starting one makes it healthy.
    pub(crate) fn healthy(names: &[&str]) -> Self {
        let fake = Self::default();
        {
            let mut state = fake.inner.lock().expect("lock fake");
            for name in names {
                state.containers.insert(
                    name.to_string(),
                    (ContainerStatus::Exited, HealthStatus::None),
                );
            }
        }
        fake
    }

    pub(crate) fn set_status(&self, name: &str, status: ContainerStatus, health: HealthStatus) {
        let mut state = self.inner.lock().expect("lock fake");
        state.containers.insert(name.to_string(), (status, health));
    }

    pub(crate) fn remove(&self, name: &str) {
        self.inner.lock().expect("lock fake").containers.remove(name);
    }

    pub(crate) fn push_start_outcome(&self, outcome: StartOutcome) {
        self.inner
            .lock()
            .expect("lock fake")
            .start_outcomes
            .push_back(outcome);
    }

    pub(crate) fn fail_stop(&self, name: &str, failure: StopFailure) {
        self.inner
            .lock()
            .expect("lock fake")
            .stop_failures
            .insert(name.to_string(), failure);
    }

    pub(crate) fn set_inspect_down(&self, down: bool) {
        self.inner.lock().expect("lock fake").inspect_down = down;
    }

    pub(crate) fn status(&self, name: &str) -> ContainerStatus {
        self.inner
            .lock()
            .expect("lock fake")
            .containers
            .get(name)
            .map(|(status, _)| *status)
            .unwrap_or(ContainerStatus::NotFound)
    }

    pub(crate) fn running(&self) -> Vec<String> {
        let state = self.inner.lock().expect("lock fake");
        let mut names: Vec<String> = state
            .containers
            .iter()
            .filter(|(_, (status, _))| *status == ContainerStatus::Running)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.inner.lock().expect("lock fake").calls.clone()
    }

    /// Lifecycle calls only, inspects filtered out.
    pub(crate) fn actions(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|call| !matches!(call, Call::Inspect(_)))
            .collect()
    }

    pub(crate) fn clear_calls(&self) {
        self.inner.lock().expect("lock fake").calls.clear();
    }

    pub(crate) fn inspect_count(&self, name: &str) -> usize {
        self.count(|call| *call == Call::Inspect(name.to_string()))
    }

    pub(crate) fn stop_count(&self, name: &str) -> usize {
        self.count(|call| *call == Call::Stop(name.to_string()))
    }

    pub(crate) fn start_count(&self, name: &str) -> usize {
        self.count(|call| *call == Call::Start(name.to_string()))
    }

    pub(crate) fn started(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Start(name) => Some(name),
                _ => None,
            })
            .collect()
    }

    fn count(&self, predicate: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|call| predicate(call)).count()
    }
}

impl ContainerApi for FakeContainers {
    async fn inspect(&self, name: &str) -> Result<ContainerInspectResponse, ProxyError> {
        let mut state = self.inner.lock().expect("lock fake");
        state.calls.push(Call::Inspect(name.to_string()));
        if state.inspect_down {
            return Err(ProxyError::Transport("connection refused".to_string()));
        }
        match state.containers.get(name) {
            Some((status, health)) => Ok(inspect_response(*status, *health)),
            None => Err(ProxyError::NotFound(name.to_string())),
        }
    }

    async fn start(&self, name: &str) -> Result<(), ProxyError> {
        let mut state = self.inner.lock().expect("lock fake");
        state.calls.push(Call::Start(name.to_string()));
        let Some((status, _)) = state.containers.get(name).copied() else {
            return Err(ProxyError::NotFound(name.to_string()));
        };
        if status == ContainerStatus::Running {
            return Ok(());
        }
        let outcome = state
            .start_outcomes
            .pop_front()
            .unwrap_or(StartOutcome::Healthy);
        let next = match outcome {
            StartOutcome::Healthy => (ContainerStatus::Running, HealthStatus::Healthy),
            StartOutcome::Exits => (ContainerStatus::Exited, HealthStatus::None),
            StartOutcome::StaysStarting => (ContainerStatus::Running, HealthStatus::Starting),
            StartOutcome::Fails => {
                return Err(ProxyError::Transport("start failed".to_string()));
            }
        };
        state.containers.insert(name.to_string(), next);
        Ok(())
    }

    async fn stop(&self, name: &str, _timeout: Duration) -> Result<(), ProxyError> {
        let mut state = self.inner.lock().expect("lock fake");
        state.calls.push(Call::Stop(name.to_string()));
        if !state.containers.contains_key(name) {
            return Err(ProxyError::NotFound(name.to_string()));
        }
        if let Some(failure) = state.stop_failures.get(name).copied() {
            let (remaining, stops) = match failure {
                StopFailure::KeepsRunning { times } => (times, false),
                StopFailure::StopsAnyway { times } => (times, true),
            };
            if remaining > 0 {
                let next = match failure {
                    StopFailure::KeepsRunning { .. } => StopFailure::KeepsRunning {
                        times: remaining - 1,
                    },
                    StopFailure::StopsAnyway { .. } => StopFailure::StopsAnyway {
                        times: remaining - 1,
                    },
                };
                state.stop_failures.insert(name.to_string(), next);
                if stops {
                    state.containers.insert(
                        name.to_string(),
                        (ContainerStatus::Exited, HealthStatus::None),
                    );
                }
                return Err(ProxyError::Transport("stop timed out".to_string()));
            }
        }
        state.containers.insert(
            name.to_string(),
            (ContainerStatus::Exited, HealthStatus::None),
        );
        Ok(())
    }

    async fn wait(&self, name: &str) -> Result<(), ProxyError> {
        let mut state = self.inner.lock().expect("lock fake");
        state.calls.push(Call::Wait(name.to_string()));
        Ok(())
    }

    async fn unpause(&self, name: &str) -> Result<(), ProxyError> {
        let mut state = self.inner.lock().expect("lock fake");
        state.calls.push(Call::Unpause(name.to_string()));
        match state.containers.get_mut(name) {
            Some(entry) if entry.0 == ContainerStatus::Paused => {
                entry.0 = ContainerStatus::Running;
                Ok(())
            }
            Some(_) => Ok(()),
            None => Err(ProxyError::NotFound(name.to_string())),
        }
    }
}

#[derive(Default)]
struct FakeReplicaState {
    prepare: HashMap<String, Result<PreparationReport, ReplicaError>>,
    metrics: HashMap<String, SecurityCounters>,
    metrics_down: bool,
    prepare_calls: Vec<String>,
    metrics_calls: Vec<String>,
}

/// Replica hooks that succeed unless told otherwise.
#[derive(Clone, Default)]
pub(crate) struct FakeReplicas {
    inner: Arc<StdMutex<FakeReplicaState>>,
}

impl FakeReplicas {
    pub(crate) fn set_prepare(&self, name: &str, result: Result<PreparationReport, ReplicaError>) {
        self.inner
            .lock()
            .expect("lock replicas")
            .prepare
            .insert(name.to_string(), result);
    }

    pub(crate) fn set_metrics(&self, name: &str, counters: SecurityCounters) {
        self.inner
            .lock()
            .expect("lock replicas")
            .metrics
            .insert(name.to_string(), counters);
    }

    pub(crate) fn set_metrics_down(&self, down: bool) {
        self.inner.lock().expect("lock replicas").metrics_down = down;
    }

    pub(crate) fn prepare_calls(&self) -> Vec<String> {
        self.inner.lock().expect("lock replicas").prepare_calls.clone()
    }

    pub(crate) fn metrics_calls(&self) -> Vec<String> {
        self.inner.lock().expect("lock replicas").metrics_calls.clone()
    }
}

impl ReplicaApi for FakeReplicas {
    async fn prepare_rotation(&self, container: &str) -> Result<PreparationReport, ReplicaError> {
        let mut state = self.inner.lock().expect("lock replicas");
        state.prepare_calls.push(container.to_string());
        state
            .prepare
            .get(container)
            .cloned()
            .unwrap_or_else(|| Ok(PreparationReport::succeeded()))
    }

    async fn security_metrics(&self, container: &str) -> Result<SecurityCounters, ReplicaError> {
        let mut state = self.inner.lock().expect("lock replicas");
        state.metrics_calls.push(container.to_string());
        if state.metrics_down {
            return Err(ReplicaError::Transport("connection refused".to_string()));
        }
        Ok(state.metrics.get(container).cloned().unwrap_or_default())
    }
}

/// Counters scoring 30 + 30 + 25 = 85.
pub(crate) fn high_risk_counters() -> SecurityCounters {
    SecurityCounters {
        suspicious_requests: 150,
        auth_failures: 25,
        anomalies: vec![crate::replica::Anomaly {
            kind: "path_traversal".to_string(),
            severity: crate::replica::Severity::High,
        }],
        ..Default::default()
    }
}
