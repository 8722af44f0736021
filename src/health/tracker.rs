//! # Health Tracker
//!
//! Per-subsystem health state machine:
//!
//! ```text
//! Healthy --bad--> Degraded --N bad in a row / T without good--> Unhealthy
//!    ^                |                                             |
//!    +------good------+---------------------good--------------------+
//! ```
//!
//! All methods take the current time explicitly so transitions can be
//! tested without a clock.

use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use tracing::{info, warn};

use super::{HealthLevel, HealthSnapshot, Observation, Subsystem, SubsystemStatus};
use crate::config::HealthConfig;

#[derive(Debug, Clone)]
struct SubsystemState {
    level: HealthLevel,
    since: DateTime<Utc>,
    last_good: Option<DateTime<Utc>>,
    last_observation: Option<DateTime<Utc>>,
    /// First bad observation since the last good one
    bad_since: Option<DateTime<Utc>>,
    consecutive_failures: u32,
    detail: String,
}

impl SubsystemState {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            level: HealthLevel::Healthy,
            since: now,
            last_good: None,
            last_observation: None,
            bad_since: None,
            consecutive_failures: 0,
            detail: String::new(),
        }
    }
}

/// A level change produced by the tracker
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub subsystem: Subsystem,
    pub from: HealthLevel,
    pub to: HealthLevel,
}

/// Health state of every subsystem
#[derive(Debug)]
pub struct HealthTracker {
    failure_threshold: u32,
    unhealthy_after: Duration,
    states: BTreeMap<Subsystem, SubsystemState>,
}

impl HealthTracker {
    pub fn new(failure_threshold: u32, unhealthy_after: Duration, now: DateTime<Utc>) -> Self {
        let states = Subsystem::ALL
            .iter()
            .map(|s| (*s, SubsystemState::new(now)))
            .collect();
        Self {
            failure_threshold: failure_threshold.max(1),
            unhealthy_after,
            states,
        }
    }

    pub fn from_config(config: &HealthConfig, now: DateTime<Utc>) -> Self {
        Self::new(
            config.failure_threshold,
            Duration::seconds(config.unhealthy_after_s as i64),
            now,
        )
    }

    /// Apply one observation
    pub fn observe(&mut self, observation: &Observation) -> Option<Transition> {
        let threshold = self.failure_threshold;
        let unhealthy_after = self.unhealthy_after;
        let at = observation.at;
        let state = self
            .states
            .entry(observation.subsystem)
            .or_insert_with(|| SubsystemState::new(at));

        state.last_observation = Some(at);
        state.detail = observation.detail.clone();

        let from = state.level;
        let to = if observation.ok {
            state.last_good = Some(at);
            state.bad_since = None;
            state.consecutive_failures = 0;
            HealthLevel::Healthy
        } else {
            state.consecutive_failures = state.consecutive_failures.saturating_add(1);
            let bad_since = *state.bad_since.get_or_insert(at);
            if state.consecutive_failures >= threshold || at - bad_since >= unhealthy_after {
                HealthLevel::Unhealthy
            } else {
                HealthLevel::Degraded.max(from)
            }
        };

        transition(observation.subsystem, state, to, at)
    }

    /// Apply time-based escalation with no new observation
    pub fn evaluate(&mut self, now: DateTime<Utc>) -> Vec<Transition> {
        let unhealthy_after = self.unhealthy_after;
        let mut transitions = Vec::new();

        for (subsystem, state) in self.states.iter_mut() {
            if state.level != HealthLevel::Degraded {
                continue;
            }
            if let Some(bad_since) = state.bad_since {
                if now - bad_since >= unhealthy_after {
                    if let Some(t) = transition(*subsystem, state, HealthLevel::Unhealthy, now) {
                        transitions.push(t);
                    }
                }
            }
        }

        transitions
    }

    pub fn level(&self, subsystem: Subsystem) -> HealthLevel {
        self.states
            .get(&subsystem)
            .map_or(HealthLevel::Healthy, |s| s.level)
    }

    /// Worst level across all subsystems
    pub fn composite(&self) -> HealthLevel {
        self.states
            .values()
            .map(|s| s.level)
            .max()
            .unwrap_or(HealthLevel::Healthy)
    }

    pub fn snapshot(
        &self,
        now: DateTime<Utc>,
        spool_fill_ratio: f64,
        spool_pending_entries: u64,
    ) -> HealthSnapshot {
        let subsystems = self
            .states
            .iter()
            .map(|(subsystem, state)| {
                (
                    *subsystem,
                    SubsystemStatus {
                        level: state.level,
                        since: state.since,
                        last_good: state.last_good,
                        last_observation: state.last_observation,
                        consecutive_failures: state.consecutive_failures,
                        detail: state.detail.clone(),
                    },
                )
            })
            .collect();

        HealthSnapshot {
            composite: self.composite(),
            subsystems,
            spool_fill_ratio,
            spool_pending_entries,
            generated_at: now,
        }
    }
}

fn transition(
    subsystem: Subsystem,
    state: &mut SubsystemState,
    to: HealthLevel,
    at: DateTime<Utc>,
) -> Option<Transition> {
    let from = state.level;
    if from == to {
        return None;
    }

    state.level = to;
    state.since = at;

    match to {
        HealthLevel::Healthy => info!("{} recovered: {}", subsystem, state.detail),
        HealthLevel::Degraded => warn!(
            "{} degraded: {} (failures: {})",
            subsystem, state.detail, state.consecutive_failures
        ),
        HealthLevel::Unhealthy => warn!(
            "{} unhealthy: {} (failures: {}, last good: {:?})",
            subsystem, state.detail, state.consecutive_failures, state.last_good
        ),
    }

    Some(Transition { subsystem, from, to })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap()
    }

    fn secs(s: i64) -> DateTime<Utc> {
        t0() + Duration::seconds(s)
    }

    fn tracker() -> HealthTracker {
        HealthTracker::new(3, Duration::seconds(300), t0())
    }

    fn bad(s: i64) -> Observation {
        Observation::bad(Subsystem::Sink, "connection refused").at(secs(s))
    }

    fn good(s: i64) -> Observation {
        Observation::good(Subsystem::Sink, "delivered").at(secs(s))
    }

    #[test]
    fn test_starts_healthy() {
        let t = tracker();
        assert_eq!(t.composite(), HealthLevel::Healthy);
        for s in Subsystem::ALL {
            assert_eq!(t.level(s), HealthLevel::Healthy);
        }
    }

    #[test]
    fn test_first_bad_degrades() {
        let mut t = tracker();
        let transition = t.observe(&bad(1)).unwrap();
        assert_eq!(transition.from, HealthLevel::Healthy);
        assert_eq!(transition.to, HealthLevel::Degraded);
        assert_eq!(t.composite(), HealthLevel::Degraded);
    }

    #[test]
    fn test_consecutive_failures_make_unhealthy() {
        let mut t = tracker();
        t.observe(&bad(1));
        assert!(t.observe(&bad(2)).is_none());
        let transition = t.observe(&bad(3)).unwrap();
        assert_eq!(transition.to, HealthLevel::Unhealthy);

        // Stays unhealthy on further failures
        assert!(t.observe(&bad(4)).is_none());
        assert_eq!(t.level(Subsystem::Sink), HealthLevel::Unhealthy);
    }

    #[test]
    fn test_good_recovers_immediately() {
        let mut t = tracker();
        for s in 1..=5 {
            t.observe(&bad(s));
        }
        let transition = t.observe(&good(6)).unwrap();
        assert_eq!(transition.from, HealthLevel::Unhealthy);
        assert_eq!(transition.to, HealthLevel::Healthy);

        // The failure count restarts
        t.observe(&bad(7));
        assert_eq!(t.level(Subsystem::Sink), HealthLevel::Degraded);
    }

    #[test]
    fn test_time_without_good_makes_unhealthy() {
        let mut t = HealthTracker::new(100, Duration::seconds(300), t0());
        t.observe(&bad(0));
        assert!(t.evaluate(secs(299)).is_empty());

        let transitions = t.evaluate(secs(300));
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].to, HealthLevel::Unhealthy);
        assert!(t.evaluate(secs(400)).is_empty());
    }

    #[test]
    fn test_slow_failures_escalate_on_observation() {
        let mut t = HealthTracker::new(100, Duration::seconds(300), t0());
        t.observe(&bad(0));
        let transition = t.observe(&bad(301)).unwrap();
        assert_eq!(transition.to, HealthLevel::Unhealthy);
    }

    #[test]
    fn test_composite_is_worst() {
        let mut t = tracker();
        t.observe(&Observation::bad(Subsystem::Gnss, "no fix").at(secs(1)));
        for s in 1..=3 {
            t.observe(&bad(s));
        }
        assert_eq!(t.level(Subsystem::Gnss), HealthLevel::Degraded);
        assert_eq!(t.composite(), HealthLevel::Unhealthy);

        let snapshot = t.snapshot(secs(4), 0.25, 12);
        assert_eq!(snapshot.composite, HealthLevel::Unhealthy);
        assert_eq!(snapshot.subsystems[&Subsystem::Sink].consecutive_failures, 3);
        assert_eq!(snapshot.subsystems[&Subsystem::Gnss].detail, "no fix");
        assert_eq!(snapshot.spool_pending_entries, 12);
    }
}
