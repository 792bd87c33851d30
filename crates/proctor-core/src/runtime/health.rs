//! Dependency health probing with hysteresis.
//!
//! Each tick probes the agent's dependencies and aggregates the worst
//! status. A single bad probe does not flip the agent: `failure_threshold`
//! consecutive bad probes move it to the worst observed status, and
//! `recovery_threshold` consecutive healthy probes restore it.

use serde::{Deserialize, Serialize};

/// Health of one dependency probe, worst first when aggregating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Offline,
}

impl HealthStatus {
    /// The worse of two statuses.
    pub fn worst(self, other: Self) -> Self {
        self.max(other)
    }

    /// Aggregate a set of probe results; an empty set is healthy.
    pub fn aggregate(probes: impl IntoIterator<Item = Self>) -> Self {
        probes
            .into_iter()
            .fold(Self::Healthy, Self::worst)
    }
}

/// Hysteresis state for one agent's health tick.
#[derive(Debug, Default)]
pub struct HealthTracker {
    consecutive_bad: u32,
    consecutive_healthy: u32,
    last_bad: Option<HealthStatus>,
}

/// What the tracker decided after observing one probe round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthVerdict {
    /// Not enough evidence to change anything.
    Hold,
    /// Enough consecutive bad probes: move to this status.
    Demote(HealthStatus),
    /// Enough consecutive healthy probes: restore to healthy.
    Recover,
}

impl HealthTracker {
    /// Feed one aggregated probe result through the hysteresis counters.
    pub fn observe(
        &mut self,
        probe: HealthStatus,
        failure_threshold: u32,
        recovery_threshold: u32,
    ) -> HealthVerdict {
        if probe == HealthStatus::Healthy {
            self.consecutive_bad = 0;
            self.last_bad = None;
            self.consecutive_healthy += 1;
            if self.consecutive_healthy >= recovery_threshold {
                self.consecutive_healthy = 0;
                return HealthVerdict::Recover;
            }
            return HealthVerdict::Hold;
        }

        self.consecutive_healthy = 0;
        // Track the worst status seen within the current bad streak.
        self.last_bad = Some(match self.last_bad {
            Some(prev) => prev.worst(probe),
            None => probe,
        });
        self.consecutive_bad += 1;
        if self.consecutive_bad >= failure_threshold {
            self.consecutive_bad = 0;
            if let Some(worst) = self.last_bad.take() {
                return HealthVerdict::Demote(worst);
            }
        }
        HealthVerdict::Hold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worst_orders_statuses() {
        assert_eq!(
            HealthStatus::Healthy.worst(HealthStatus::Degraded),
            HealthStatus::Degraded
        );
        assert_eq!(
            HealthStatus::Unhealthy.worst(HealthStatus::Degraded),
            HealthStatus::Unhealthy
        );
        assert_eq!(
            HealthStatus::Offline.worst(HealthStatus::Healthy),
            HealthStatus::Offline
        );
    }

    #[test]
    fn aggregate_picks_the_worst_probe() {
        let agg = HealthStatus::aggregate([
            HealthStatus::Healthy,
            HealthStatus::Unhealthy,
            HealthStatus::Degraded,
        ]);
        assert_eq!(agg, HealthStatus::Unhealthy);
        assert_eq!(HealthStatus::aggregate([]), HealthStatus::Healthy);
    }

    #[test]
    fn demotes_only_after_consecutive_failures() {
        let mut tracker = HealthTracker::default();
        assert_eq!(
            tracker.observe(HealthStatus::Degraded, 3, 2),
            HealthVerdict::Hold
        );
        assert_eq!(
            tracker.observe(HealthStatus::Degraded, 3, 2),
            HealthVerdict::Hold
        );
        assert_eq!(
            tracker.observe(HealthStatus::Degraded, 3, 2),
            HealthVerdict::Demote(HealthStatus::Degraded)
        );
    }

    #[test]
    fn a_healthy_probe_resets_the_bad_streak() {
        let mut tracker = HealthTracker::default();
        tracker.observe(HealthStatus::Degraded, 3, 2);
        tracker.observe(HealthStatus::Degraded, 3, 2);
        tracker.observe(HealthStatus::Healthy, 3, 2);
        assert_eq!(
            tracker.observe(HealthStatus::Degraded, 3, 2),
            HealthVerdict::Hold,
            "streak restarted after the healthy probe"
        );
    }

    #[test]
    fn demotion_uses_the_worst_status_in_the_streak() {
        let mut tracker = HealthTracker::default();
        tracker.observe(HealthStatus::Degraded, 3, 2);
        tracker.observe(HealthStatus::Unhealthy, 3, 2);
        assert_eq!(
            tracker.observe(HealthStatus::Degraded, 3, 2),
            HealthVerdict::Demote(HealthStatus::Unhealthy)
        );
    }

    #[test]
    fn recovers_after_consecutive_healthy_probes() {
        let mut tracker = HealthTracker::default();
        for _ in 0..3 {
            tracker.observe(HealthStatus::Unhealthy, 3, 2);
        }
        assert_eq!(
            tracker.observe(HealthStatus::Healthy, 3, 2),
            HealthVerdict::Hold
        );
        assert_eq!(
            tracker.observe(HealthStatus::Healthy, 3, 2),
            HealthVerdict::Recover
        );
    }
}
