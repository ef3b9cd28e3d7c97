//! The NOC circuit breaker.
//!
//! A single consecutive-failure counter shared by the heartbeat NOC calls and
//! the alert NOC calls. Tripping the breaker suppresses the file heartbeat so
//! the external monitor notices.

use std::sync::atomic::{AtomicU32, Ordering};

use tracing::{info, warn};

#[derive(Debug)]
pub struct NocHealth {
    consecutive_failures: AtomicU32,
    failure_threshold: u32,
}

// === impl NocHealth ===

impl NocHealth {
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            consecutive_failures: AtomicU32::new(0),
            failure_threshold: failure_threshold.max(1),
        }
    }

    pub fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures == self.failure_threshold {
            warn!(
                consecutive_failures = failures,
                threshold = self.failure_threshold,
                "NOC circuit breaker tripped"
            );
        }
    }

    pub fn record_success(&self) {
        let previous = self.consecutive_failures.swap(0, Ordering::SeqCst);
        if previous >= self.failure_threshold {
            info!(
                threshold = self.failure_threshold,
                "NOC circuit breaker recovered"
            );
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.consecutive_failures.load(Ordering::SeqCst) < self.failure_threshold
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trips_at_the_threshold() {
        let health = NocHealth::new(3);
        assert!(health.is_healthy());

        health.record_failure();
        health.record_failure();
        assert!(health.is_healthy());

        health.record_failure();
        assert!(!health.is_healthy());
        assert_eq!(health.consecutive_failures(), 3);
    }

    #[test]
    fn a_single_success_resets() {
        let health = NocHealth::new(3);
        for _ in 0..10 {
            health.record_failure();
        }
        assert!(!health.is_healthy());

        health.record_success();
        assert!(health.is_healthy());
        assert_eq!(health.consecutive_failures(), 0);
    }

    #[test]
    fn threshold_is_floored_at_one() {
        let health = NocHealth::new(0);
        assert!(health.is_healthy());
        health.record_failure();
        assert!(!health.is_healthy());
    }
}
