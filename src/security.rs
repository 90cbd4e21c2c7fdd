//! Risk scoring for the active replica.
//!
//! The thresholds are constants on purpose: an operator must not be able to
//! switch off security-triggered rotation through configuration.
use crate::replica::{ReplicaApi, SecurityCounters};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

pub const ROTATE_IMMEDIATELY_THRESHOLD: u8 = 70;
pub const ROTATE_SOON_THRESHOLD: u8 = 50;
pub const MAX_RISK_SCORE: u8 = 100;

/// (lower bound exclusive, bonus), checked from the highest tier down.
const SUSPICIOUS_REQUEST_TIERS: [(u64, u32); 3] = [(100, 30), (50, 20), (10, 10)];
const AUTH_FAILURE_TIERS: [(u64, u32); 3] = [(20, 25), (10, 15), (5, 5)];
const ANOMALY_COUNT_TIERS: [(u64, u32); 2] = [(5, 20), (0, 10)];
const APP_ERROR_TIERS: [(u64, u32); 3] = [(100, 15), (50, 10), (10, 5)];
const HIGH_SEVERITY_ANOMALY_BONUS: u32 = 30;
const MEMORY_TIERS: [(f64, u32); 3] = [(90.0, 15), (80.0, 10), (70.0, 5)];

fn tier_bonus(value: u64, tiers: &[(u64, u32)]) -> u32 {
    tiers
        .iter()
        .find(|(bound, _)| value > *bound)
        .map(|(_, bonus)| *bonus)
        .unwrap_or(0)
}

/// Weighted additive score in `0..=100`.
pub fn risk_score(counters: &SecurityCounters) -> u8 {
    let mut score = tier_bonus(counters.suspicious_requests, &SUSPICIOUS_REQUEST_TIERS);
    score += tier_bonus(counters.auth_failures, &AUTH_FAILURE_TIERS);
    score += if counters.anomalies.iter().any(|a| a.severity.is_high()) {
        HIGH_SEVERITY_ANOMALY_BONUS
    } else {
        tier_bonus(counters.anomalies.len() as u64, &ANOMALY_COUNT_TIERS)
    };
    score += tier_bonus(counters.app_errors, &APP_ERROR_TIERS);
    score += MEMORY_TIERS
        .iter()
        .find(|(bound, _)| counters.memory_percent >= *bound)
        .map(|(_, bonus)| *bonus)
        .unwrap_or(0);
    score.min(MAX_RISK_SCORE as u32) as u8
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub score: u8,
    pub rotate_immediately: bool,
    pub rotate_soon: bool,
}

impl RiskAssessment {
    pub fn from_score(score: u8) -> Self {
        Self {
            score,
            rotate_immediately: score >= ROTATE_IMMEDIATELY_THRESHOLD,
            rotate_soon: score >= ROTATE_SOON_THRESHOLD,
        }
    }
}

/// Pulls counters from replicas and caches the resulting assessment per
/// container, so a busy dashboard does not hammer the replica.
pub struct SecurityMonitor<R: ReplicaApi> {
    replicas: Arc<R>,
    cache_ttl: Duration,
    cache: Mutex<HashMap<String, (Instant, RiskAssessment)>>,
}

impl<R: ReplicaApi> SecurityMonitor<R> {
    pub fn new(replicas: Arc<R>, cache_ttl: Duration) -> Self {
        Self {
            replicas,
            cache_ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Fails open: an unreachable metrics endpoint scores 0.
    pub async fn assess(&self, container: &str) -> RiskAssessment {
        if let Some((fetched_at, assessment)) = self.cache.lock().await.get(container).copied()
            && fetched_at.elapsed() < self.cache_ttl
        {
            return assessment;
        }

        let assessment = match self.replicas.security_metrics(container).await {
            Ok(counters) => {
                let assessment = RiskAssessment::from_score(risk_score(&counters));
                if assessment.rotate_soon {
                    info!("Risk score of {container} is {}", assessment.score);
                } else {
                    debug!("risk score of {container} is {}", assessment.score);
                }
                assessment
            }
            Err(e) => {
                warn!("security metrics for {container} unavailable, assuming no risk: {e}");
                RiskAssessment::default()
            }
        };
        self.cache
            .lock()
            .await
            .insert(container.to_string(), (Instant::now(), assessment));
        assessment
    }

    pub async fn risk_score(&self, container: &str) -> u8 {
        self.assess(container).await.score
    }

    pub async fn should_rotate_immediately(&self, container: &str) -> bool {
        self.assess(container).await.rotate_immediately
    }

    pub async fn should_rotate_soon(&self, container: &str) -> bool {
        self.assess(container).await.rotate_soon
    }

    /// Cached assessment, if any, regardless of age. Never calls the replica.
    pub async fn last_assessment(&self, container: &str) -> Option<RiskAssessment> {
        self.cache
            .lock()
            .await
            .get(container)
            .map(|(_, assessment)| *assessment)
    }

    pub async fn forget(&self, container: &str) {
        self.cache.lock().await.remove(container);
    }
}
