use std::time::{Duration, SystemTime};

/// What one loop iteration should do.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AlertDecision {
    pub alert: bool,
    pub snapshot: bool,
}

/// Two independent cooldowns, owned by a single camera session.
///
/// Both checks in one `evaluate` call use the same `now`. A timestamp only
/// advances when its effect fires. A clock that moved backwards counts as
/// the cooldown having elapsed.
#[derive(Clone, Debug)]
pub struct AlertPolicy {
    alert_cooldown: Duration,
    snapshot_cooldown: Duration,
    last_alert: Option<SystemTime>,
    last_snapshot: Option<SystemTime>,
}

impl AlertPolicy {
    pub fn new(alert_cooldown: Duration, snapshot_cooldown: Duration) -> Self {
        Self {
            alert_cooldown,
            snapshot_cooldown,
            last_alert: None,
            last_snapshot: None,
        }
    }

    pub fn evaluate(&mut self, person_present: bool, now: SystemTime) -> AlertDecision {
        if !person_present {
            return AlertDecision::default();
        }
        let alert = due(self.last_alert, self.alert_cooldown, now);
        if alert {
            self.last_alert = Some(now);
        }
        let snapshot = due(self.last_snapshot, self.snapshot_cooldown, now);
        if snapshot {
            self.last_snapshot = Some(now);
        }
        AlertDecision { alert, snapshot }
    }

    pub fn last_alert(&self) -> Option<SystemTime> {
        self.last_alert
    }

    pub fn last_snapshot(&self) -> Option<SystemTime> {
        self.last_snapshot
    }
}

impl Default for AlertPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(3), Duration::from_secs(5))
    }
}

fn due(last: Option<SystemTime>, cooldown: Duration, now: SystemTime) -> bool {
    match last {
        None => true,
        Some(last) => match now.duration_since(last) {
            Ok(elapsed) => elapsed > cooldown,
            Err(_) => true,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at_ms(ms: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000) + Duration::from_millis(ms)
    }

    #[test]
    fn thirty_fps_for_ten_seconds() {
        let mut policy = AlertPolicy::default();
        let (mut alerts, mut snapshots) = (0, 0);
        for i in 0..300u64 {
            let decision = policy.evaluate(true, at_ms(i * 1000 / 30));
            alerts += decision.alert as usize;
            snapshots += decision.snapshot as usize;
        }
        assert!(alerts <= 4, "alerts = {}", alerts);
        assert!(snapshots <= 2, "snapshots = {}", snapshots);
        assert_eq!((alerts, snapshots), (4, 2));
    }

    #[test]
    fn no_person_never_fires_and_keeps_state() {
        let mut policy = AlertPolicy::default();
        assert_eq!(policy.evaluate(false, at_ms(0)), AlertDecision::default());
        assert!(policy.last_alert().is_none());
        let first = policy.evaluate(true, at_ms(10));
        assert!(first.alert && first.snapshot);
    }

    #[test]
    fn cooldowns_are_independent() {
        let mut policy = AlertPolicy::default();
        policy.evaluate(true, at_ms(0));
        let d = policy.evaluate(true, at_ms(3_100));
        assert_eq!(d, AlertDecision { alert: true, snapshot: false });
        let d = policy.evaluate(true, at_ms(5_100));
        assert_eq!(d, AlertDecision { alert: false, snapshot: true });
    }

    #[test]
    fn exactly_at_cooldown_does_not_fire() {
        let mut policy = AlertPolicy::default();
        policy.evaluate(true, at_ms(0));
        assert!(!policy.evaluate(true, at_ms(3_000)).alert);
        assert!(policy.evaluate(true, at_ms(3_001)).alert);
    }

    #[test]
    fn backwards_clock_counts_as_elapsed() {
        let mut policy = AlertPolicy::default();
        policy.evaluate(true, at_ms(10_000));
        let d = policy.evaluate(true, at_ms(1_000));
        assert!(d.alert && d.snapshot);
    }
}
