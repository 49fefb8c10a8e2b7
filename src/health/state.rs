//! Check bookkeeping for one backend
//!
//! A backend turns unhealthy after `failure_threshold` consecutive failed
//! checks and healthy again on the first successful one.

use std::time::Instant;

/// Health status as decided by checks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

#[derive(Debug)]
pub struct CheckState {
    status: HealthStatus,
    consecutive_failures: u32,
    failure_threshold: u32,
    pub last_check: Option<Instant>,
    pub last_success: Option<Instant>,
}

impl CheckState {
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            status: HealthStatus::Healthy,
            consecutive_failures: 0,
            failure_threshold: failure_threshold.max(1),
            last_check: None,
            last_success: None,
        }
    }

    pub fn status(&self) -> HealthStatus {
        self.status
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Returns true if status changed
    pub fn record_success(&mut self) -> bool {
        let now = Instant::now();
        self.last_check = Some(now);
        self.last_success = Some(now);
        self.consecutive_failures = 0;
        self.set_status(HealthStatus::Healthy)
    }

    /// Returns true if status changed
    pub fn record_failure(&mut self) -> bool {
        self.last_check = Some(Instant::now());
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.consecutive_failures >= self.failure_threshold {
            self.set_status(HealthStatus::Unhealthy)
        } else {
            false
        }
    }

    fn set_status(&mut self, status: HealthStatus) -> bool {
        let changed = self.status != status;
        self.status = status;
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_healthy() {
        let state = CheckState::new(3);
        assert_eq!(state.status(), HealthStatus::Healthy);
        assert!(state.last_check.is_none());
    }

    #[test]
    fn test_unhealthy_after_threshold() {
        let mut state = CheckState::new(3);
        assert!(!state.record_failure());
        assert!(!state.record_failure());
        assert!(state.record_failure());
        assert_eq!(state.status(), HealthStatus::Unhealthy);
        assert!(!state.record_failure());
        assert_eq!(state.consecutive_failures(), 4);
    }

    #[test]
    fn test_success_resets_failures() {
        let mut state = CheckState::new(2);
        state.record_failure();
        state.record_success();
        assert!(!state.record_failure());
        assert_eq!(state.status(), HealthStatus::Healthy);
    }

    #[test]
    fn test_recovers_on_first_success() {
        let mut state = CheckState::new(1);
        assert!(state.record_failure());
        assert!(state.record_success());
        assert_eq!(state.status(), HealthStatus::Healthy);
        assert!(state.last_success.is_some());
    }

    #[test]
    fn test_zero_threshold_behaves_as_one() {
        let mut state = CheckState::new(0);
        assert!(state.record_failure());
    }
}
