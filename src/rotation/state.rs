use crate::docker::ContainerName;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::time::Instant;

/// Everything the rotation loop decides on. Owned by the engine, handed out
/// as copies.
#[derive(Debug, Clone, Default)]
pub struct RotationState {
    /// Containers that passed bootstrap validation.
    pub managed: Vec<ContainerName>,
    pub active_container: Option<ContainerName>,
    pub active_index: Option<usize>,
    pub rotation_active: bool,
    pub resuming: bool,
    pub rotation_count: u64,
    pub last_rotation_time: Option<DateTime<Utc>>,
    pub next_rotation_eta: Option<u64>,
    pub pending_override: Option<Instant>,
    pub armed_at: Option<Instant>,
    pub next_switch_at: Option<Instant>,
    pub retry_not_before: Option<Instant>,
}

impl RotationState {
    pub fn set_active(&mut self, name: &str) {
        self.active_container = Some(name.to_string());
        self.active_index = self.managed.iter().position(|managed| managed == name);
    }

    /// Start a fresh interval counting from `now`.
    pub fn arm(&mut self, now: Instant, interval: Duration) {
        self.armed_at = Some(now);
        self.next_switch_at = Some(now + interval);
        self.next_rotation_eta = Some(interval.as_secs());
    }

    pub fn set_eta(&mut self, deadline: Instant, now: Instant) {
        self.next_rotation_eta = Some(deadline.saturating_duration_since(now).as_secs());
    }

    /// Realign `active_index` with `active_container` after a concurrent
    /// change. Returns whether anything had to be fixed.
    pub fn reconcile_active_index(&mut self) -> bool {
        let expected = self
            .active_container
            .as_ref()
            .and_then(|name| self.managed.iter().position(|managed| managed == name));
        if expected == self.active_index {
            return false;
        }
        self.active_index = expected;
        true
    }

    pub fn is_paused(&self) -> bool {
        !self.rotation_active || self.resuming
    }

    /// Whether a rotation planned from `planned` still applies: not paused
    /// since, no rotation in between, deadlines untouched.
    pub fn still_due(&self, planned: &RotationState) -> bool {
        !self.is_paused()
            && self.rotation_count == planned.rotation_count
            && self.active_container == planned.active_container
            && self.pending_override == planned.pending_override
            && self.armed_at == planned.armed_at
            && self.next_switch_at == planned.next_switch_at
    }
}

/// Accumulated time a container spent as the healthy active replica.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UptimeLedger {
    pub total_active: Duration,
    pub active_since: Option<Instant>,
}

impl UptimeLedger {
    pub fn open(&mut self, now: Instant) {
        if self.active_since.is_none() {
            self.active_since = Some(now);
        }
    }

    pub fn close(&mut self, now: Instant) {
        if let Some(since) = self.active_since.take() {
            self.total_active += now.saturating_duration_since(since);
        }
    }

    pub fn total(&self, now: Instant) -> Duration {
        let open = self
            .active_since
            .map(|since| now.saturating_duration_since(since))
            .unwrap_or_default();
        self.total_active + open
    }

    pub fn is_open(&self) -> bool {
        self.active_since.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn managed() -> Vec<ContainerName> {
        vec!["web-1".into(), "web-2".into(), "web-3".into()]
    }

    #[test]
    fn set_active_tracks_index() {
        let mut state = RotationState {
            managed: managed(),
            ..Default::default()
        };
        state.set_active("web-3");
        assert_eq!(state.active_index, Some(2));
    }

    #[test]
    fn reconcile_fixes_a_diverged_index() {
        let mut state = RotationState {
            managed: managed(),
            ..Default::default()
        };
        state.set_active("web-2");
        assert!(!state.reconcile_active_index());
        state.active_container = Some("web-1".into());
        assert!(state.reconcile_active_index());
        assert_eq!(state.active_index, Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn plan_goes_stale_on_pause_rotation_or_new_deadline() {
        let now = Instant::now();
        let mut planned = RotationState {
            managed: managed(),
            rotation_active: true,
            ..Default::default()
        };
        planned.set_active("web-1");
        planned.arm(now, Duration::from_secs(300));
        assert!(planned.clone().still_due(&planned));

        let mut paused = planned.clone();
        paused.rotation_active = false;
        assert!(!paused.still_due(&planned));

        let mut rotated = planned.clone();
        rotated.set_active("web-2");
        rotated.rotation_count += 1;
        assert!(!rotated.still_due(&planned));

        let mut overridden = planned.clone();
        overridden.pending_override = Some(now + Duration::from_secs(300));
        assert!(!overridden.still_due(&planned));

        let mut eta_only = planned.clone();
        eta_only.set_eta(now + Duration::from_secs(300), now + Duration::from_secs(10));
        assert!(eta_only.still_due(&planned));
    }

    #[tokio::test(start_paused = true)]
    async fn ledger_folds_closed_intervals() {
        let mut ledger = UptimeLedger::default();
        let start = Instant::now();
        ledger.open(start);
        ledger.open(start + Duration::from_secs(5));
        assert_eq!(ledger.total(start + Duration::from_secs(10)), Duration::from_secs(10));
        ledger.close(start + Duration::from_secs(10));
        assert!(!ledger.is_open());
        ledger.close(start + Duration::from_secs(20));
        assert_eq!(ledger.total(start + Duration::from_secs(30)), Duration::from_secs(10));
        ledger.open(start + Duration::from_secs(40));
        assert_eq!(ledger.total(start + Duration::from_secs(45)), Duration::from_secs(15));
    }
}
