//! Expiration tracking for the Prometheus "Watchdog" heartbeat.
//!
//! The watchdog is two-tiered: HTTP ingress records heartbeat ticks (tier 1)
//! and the timer callback derives the status and writes the vector (tier 2).
//! Tier 2 is the sole writer of the watchdog fingerprint, so concurrent
//! ingress never races the state machine, at the cost of a one-tick
//! reaction delay.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::alert::{Alert, AlertStatus};
use crate::config::WatchdogConfig;
use crate::timer::{TickClock, TICK_INTERVAL_SECONDS};
use crate::vector::AlertsVector;

/// Fingerprint of the watchdog alert in the vector.
pub const WATCHDOG_FINGERPRINT: &str = "watchdog";

/// Fixed priority of the watchdog alert.
pub const WATCHDOG_PRIORITY: i32 = -7;

/// Derived watchdog status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WatchdogStatus {
    /// The startup grace period has not elapsed yet.
    Initializing,
    /// A heartbeat arrived within the timeout.
    Healthy,
    /// No heartbeat within the timeout (or ever).
    Missing,
}

#[derive(Debug, Default)]
struct State {
    last_heartbeat_tick: Option<u64>,
    was_expired: bool,
}

pub struct Watchdog {
    clock: Arc<TickClock>,
    vector: Arc<AlertsVector>,
    config: WatchdogConfig,
    timeout_ticks: u64,
    state: Mutex<State>,
}

// === impl Watchdog ===

impl Watchdog {
    pub fn new(clock: Arc<TickClock>, vector: Arc<AlertsVector>, config: WatchdogConfig) -> Self {
        let timeout_ticks = (config.timeout_seconds / TICK_INTERVAL_SECONDS).max(1);
        Self {
            clock,
            vector,
            config,
            timeout_ticks,
            state: Mutex::new(State::default()),
        }
    }

    /// Interval at which the tier-2 callback runs.
    pub fn timeout_ticks(&self) -> u64 {
        self.timeout_ticks
    }

    /// Tier 1: records a heartbeat at the current tick.
    ///
    /// Deliberately does not touch the alerts vector; only the tick callback
    /// does that.
    pub fn record_heartbeat(&self) {
        let tick = self.clock.tick();
        self.state.lock().last_heartbeat_tick = Some(tick);
        debug!(tick, "Watchdog heartbeat recorded");
    }

    pub fn last_heartbeat_tick(&self) -> Option<u64> {
        self.state.lock().last_heartbeat_tick
    }

    /// The derived status for the current tick.
    pub fn status(&self, grace_active: bool) -> WatchdogStatus {
        if grace_active {
            return WatchdogStatus::Initializing;
        }
        match self.state.lock().last_heartbeat_tick {
            None => WatchdogStatus::Missing,
            Some(last) if self.clock.tick().saturating_sub(last) < self.timeout_ticks => {
                WatchdogStatus::Healthy
            }
            Some(_) => WatchdogStatus::Missing,
        }
    }

    /// Tier 2: derives the status and upserts the watchdog alert.
    ///
    /// `Missing` maps to CREATE; `Healthy` and `Initializing` map to CANCEL.
    pub fn evaluate(&self, grace_active: bool) {
        let status = self.status(grace_active);
        let expired = status == WatchdogStatus::Missing;

        {
            let mut state = self.state.lock();
            if expired && !state.was_expired {
                warn!(
                    timeout_ticks = self.timeout_ticks,
                    last_heartbeat_tick = ?state.last_heartbeat_tick,
                    "Watchdog heartbeat missing"
                );
            } else if !expired && state.was_expired {
                info!("Watchdog heartbeat restored");
            }
            state.was_expired = expired;
        }

        let (alert_status, behavior) = if expired {
            (AlertStatus::Create, &self.config.create_noc_behavior)
        } else {
            (AlertStatus::Cancel, &self.config.cancel_noc_behavior)
        };

        let alert = Alert::new(
            WATCHDOG_FINGERPRINT,
            &self.config.alert_name,
            "watchdog",
            alert_status,
            WATCHDOG_PRIORITY,
        )
        .with_behavior(behavior)
        .with_summary(match status {
            WatchdogStatus::Missing => "Prometheus watchdog heartbeat is missing",
            _ => "Prometheus watchdog heartbeat is healthy",
        });
        self.vector.update_alert(alert);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DefaultNocConfig;
    use crate::suppression::SuppressionCache;

    fn watchdog() -> (Arc<TickClock>, Arc<AlertsVector>, Watchdog) {
        let clock = Arc::new(TickClock::new());
        let suppression = Arc::new(SuppressionCache::new(
            clock.clone(),
            &DefaultNocConfig::default(),
        ));
        let vector = Arc::new(AlertsVector::new(clock.clone(), suppression, 86400));
        let config = WatchdogConfig {
            timeout_seconds: 10,
            ..WatchdogConfig::default()
        };
        let watchdog = Watchdog::new(clock.clone(), vector.clone(), config);
        (clock, vector, watchdog)
    }

    fn advance(clock: &Arc<TickClock>, ticks: u64) {
        for _ in 0..ticks {
            clock.advance();
        }
    }

    #[test]
    fn missing_without_any_heartbeat() {
        let (_clock, vector, watchdog) = watchdog();
        watchdog.evaluate(false);

        let alert = vector.get(WATCHDOG_FINGERPRINT).expect("watchdog alert");
        assert_eq!(alert.status, AlertStatus::Create);
        assert_eq!(alert.priority, WATCHDOG_PRIORITY);
    }

    #[test]
    fn heartbeat_is_not_reflected_until_the_next_evaluation() {
        let (_clock, vector, watchdog) = watchdog();
        watchdog.evaluate(false);
        assert_eq!(
            vector.get(WATCHDOG_FINGERPRINT).unwrap().status,
            AlertStatus::Create
        );

        // Tier 1 only records state; the vector is untouched.
        watchdog.record_heartbeat();
        assert_eq!(
            vector.get(WATCHDOG_FINGERPRINT).unwrap().status,
            AlertStatus::Create
        );

        watchdog.evaluate(false);
        assert_eq!(
            vector.get(WATCHDOG_FINGERPRINT).unwrap().status,
            AlertStatus::Cancel
        );
    }

    #[test]
    fn heartbeat_expires_after_the_timeout() {
        let (clock, _vector, watchdog) = watchdog();
        watchdog.record_heartbeat();
        assert_eq!(watchdog.status(false), WatchdogStatus::Healthy);

        advance(&clock, 9);
        assert_eq!(watchdog.status(false), WatchdogStatus::Healthy);

        advance(&clock, 1);
        assert_eq!(watchdog.status(false), WatchdogStatus::Missing);
    }

    #[test]
    fn grace_period_reports_initializing_and_cancels() {
        let (_clock, vector, watchdog) = watchdog();
        assert_eq!(watchdog.status(true), WatchdogStatus::Initializing);

        watchdog.evaluate(true);
        assert_eq!(
            vector.get(WATCHDOG_FINGERPRINT).map(|a| a.status),
            // a CANCEL with no prior entry never inserts
            None
        );
    }

    #[test]
    fn expiry_transitions_both_ways() {
        let (clock, vector, watchdog) = watchdog();
        watchdog.record_heartbeat();
        watchdog.evaluate(false);
        assert_eq!(
            vector.get(WATCHDOG_FINGERPRINT).map(|a| a.status),
            None, // healthy CANCEL with no prior entry
        );

        advance(&clock, 10);
        watchdog.evaluate(false);
        assert_eq!(
            vector.get(WATCHDOG_FINGERPRINT).unwrap().status,
            AlertStatus::Create
        );

        watchdog.record_heartbeat();
        watchdog.evaluate(false);
        assert_eq!(
            vector.get(WATCHDOG_FINGERPRINT).unwrap().status,
            AlertStatus::Cancel
        );
    }
}
