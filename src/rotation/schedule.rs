//! When to rotate: timer, pending override, or security pressure.
use super::RotationTrigger;
use crate::security::RiskAssessment;
use std::time::Duration;
use tokio::time::Instant;

/// `rotate soon` never shortens the interval below this.
pub const SOON_FLOOR: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy)]
pub(crate) struct ScheduleInput {
    pub now: Instant,
    pub interval: Duration,
    pub armed_at: Instant,
    pub next_switch_at: Instant,
    pub pending_override: Option<Instant>,
    pub retry_not_before: Option<Instant>,
    pub paused: bool,
    pub risk: RiskAssessment,
    pub managed_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Plan {
    /// Push the deadline a full interval out without rotating.
    Rearm,
    Wait { deadline: Instant },
    Rotate { trigger: RotationTrigger },
}

pub(crate) fn shortened_interval(interval: Duration) -> Duration {
    (interval / 2).max(SOON_FLOOR).min(interval)
}

pub(crate) fn plan(input: &ScheduleInput) -> Plan {
    if input.paused || input.managed_count < 2 {
        return Plan::Rearm;
    }

    let (deadline, trigger) = if let Some(at) = input.pending_override {
        (at, RotationTrigger::Override)
    } else if input.risk.rotate_immediately {
        (input.now, RotationTrigger::SecurityImmediate)
    } else if input.risk.rotate_soon
        && input.armed_at + shortened_interval(input.interval) < input.next_switch_at
    {
        (
            input.armed_at + shortened_interval(input.interval),
            RotationTrigger::SecuritySoon,
        )
    } else {
        (input.next_switch_at, RotationTrigger::Timer)
    };

    if input.now < deadline {
        return Plan::Wait { deadline };
    }
    if trigger != RotationTrigger::Override
        && let Some(not_before) = input.retry_not_before
        && input.now < not_before
    {
        return Plan::Wait {
            deadline: not_before,
        };
    }
    Plan::Rotate { trigger }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(now: Instant) -> ScheduleInput {
        ScheduleInput {
            now,
            interval: Duration::from_secs(300),
            armed_at: now,
            next_switch_at: now + Duration::from_secs(300),
            pending_override: None,
            retry_not_before: None,
            paused: false,
            risk: RiskAssessment::default(),
            managed_count: 3,
        }
    }

    #[test]
    fn waits_for_the_timer() {
        let now = Instant::now();
        let input = input(now);
        assert_eq!(
            plan(&input),
            Plan::Wait {
                deadline: now + Duration::from_secs(300)
            }
        );
    }

    #[test]
    fn rotates_when_the_timer_expires() {
        let now = Instant::now();
        let mut input = input(now);
        input.now = now + Duration::from_secs(300);
        assert_eq!(
            plan(&input),
            Plan::Rotate {
                trigger: RotationTrigger::Timer
            }
        );
    }

    #[test]
    fn paused_engine_rearms() {
        let now = Instant::now();
        let mut input = input(now);
        input.paused = true;
        input.risk = RiskAssessment::from_score(100);
        assert_eq!(plan(&input), Plan::Rearm);
    }

    #[test]
    fn high_risk_collapses_the_deadline() {
        let now = Instant::now();
        let mut input = input(now);
        input.risk = RiskAssessment::from_score(85);
        assert_eq!(
            plan(&input),
            Plan::Rotate {
                trigger: RotationTrigger::SecurityImmediate
            }
        );
    }

    #[test]
    fn medium_risk_halves_the_interval() {
        let now = Instant::now();
        let mut input = input(now);
        input.risk = RiskAssessment::from_score(55);
        assert_eq!(
            plan(&input),
            Plan::Wait {
                deadline: now + Duration::from_secs(150)
            }
        );
        input.now = now + Duration::from_secs(150);
        assert_eq!(
            plan(&input),
            Plan::Rotate {
                trigger: RotationTrigger::SecuritySoon
            }
        );
    }

    #[test]
    fn shortened_interval_respects_floor_and_interval() {
        assert_eq!(shortened_interval(Duration::from_secs(300)), Duration::from_secs(150));
        assert_eq!(shortened_interval(Duration::from_secs(40)), Duration::from_secs(30));
        assert_eq!(shortened_interval(Duration::from_secs(20)), Duration::from_secs(20));
    }

    #[test]
    fn pending_override_replaces_the_timer() {
        let now = Instant::now();
        let mut input = input(now);
        input.pending_override = Some(now + Duration::from_secs(10));
        input.risk = RiskAssessment::from_score(90);
        assert_eq!(
            plan(&input),
            Plan::Wait {
                deadline: now + Duration::from_secs(10)
            }
        );
        input.now = now + Duration::from_secs(10);
        assert_eq!(
            plan(&input),
            Plan::Rotate {
                trigger: RotationTrigger::Override
            }
        );
    }

    #[test]
    fn single_container_never_rotates() {
        let now = Instant::now();
        let mut input = input(now);
        input.managed_count = 1;
        assert_eq!(plan(&input), Plan::Rearm);
        input.now = now + Duration::from_secs(301);
        assert_eq!(plan(&input), Plan::Rearm);
    }

    #[test]
    fn failed_rotation_blocks_security_retries() {
        let now = Instant::now();
        let mut input = input(now);
        input.risk = RiskAssessment::from_score(85);
        input.retry_not_before = Some(now + Duration::from_secs(30));
        assert_eq!(
            plan(&input),
            Plan::Wait {
                deadline: now + Duration::from_secs(30)
            }
        );
    }
}
