//! The per-(fingerprint, status) "recently processed" window.
//!
//! Entries are written when a decision is enqueued for the NOC and removed on
//! dispatch failure (to allow the next snapshot to retry) or on vector
//! removal. There is no TTL sweeper; stale entries are simply overwritten.

use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::Mutex;
use tracing::trace;

use crate::alert::{Alert, AlertStatus};
use crate::config::{parse_duration_secs, DefaultNocConfig};
use crate::timer::{TickClock, TICK_INTERVAL_SECONDS};

#[derive(Clone, Copy, Debug)]
struct SuppressionEntry {
    processed_at_tick: u64,
    window_ticks: u64,
}

pub struct SuppressionCache {
    entries: Mutex<AHashMap<String, SuppressionEntry>>,
    clock: Arc<TickClock>,
    default_create_secs: u64,
    default_cancel_secs: u64,
}

// === impl SuppressionCache ===

impl SuppressionCache {
    pub fn new(clock: Arc<TickClock>, defaults: &DefaultNocConfig) -> Self {
        let window = |raw: Option<&str>| {
            raw.and_then(parse_duration_secs).unwrap_or(0)
        };
        Self {
            entries: Mutex::new(AHashMap::new()),
            clock,
            default_create_secs: window(defaults.create_noc_behavior.suppress_window.as_deref()),
            default_cancel_secs: window(defaults.cancel_noc_behavior.suppress_window.as_deref()),
        }
    }

    /// Whether the alert's (fingerprint, status) pair was processed within its
    /// effective suppression window. A window of zero never suppresses.
    pub fn was_recently_processed(&self, alert: &Alert) -> bool {
        if self.effective_window_secs(alert) == 0 {
            return false;
        }
        let entries = self.entries.lock();
        match entries.get(&Self::key(alert)) {
            Some(entry) => {
                self.clock.tick().saturating_sub(entry.processed_at_tick) < entry.window_ticks
            }
            None => false,
        }
    }

    /// Records the alert as processed at the current tick. A zero effective
    /// window records nothing.
    pub fn mark_as_processed(&self, alert: &Alert) {
        let window_secs = self.effective_window_secs(alert);
        if window_secs == 0 {
            return;
        }
        let entry = SuppressionEntry {
            processed_at_tick: self.clock.tick(),
            window_ticks: (window_secs / TICK_INTERVAL_SECONDS).max(1),
        };
        trace!(
            fingerprint = %alert.fingerprint,
            status = %alert.status,
            window_ticks = entry.window_ticks,
            "Marked as processed"
        );
        self.entries.lock().insert(Self::key(alert), entry);
    }

    /// Removes the single (fingerprint, status) entry, re-arming the next
    /// snapshot.
    pub fn unmark_as_processed(&self, alert: &Alert) {
        self.entries.lock().remove(&Self::key(alert));
    }

    /// Removes both the CREATE and CANCEL entries for a fingerprint.
    pub fn clear_fingerprint(&self, fingerprint: &str) {
        let mut entries = self.entries.lock();
        entries.remove(&format!("{fingerprint}:{}", AlertStatus::Create));
        entries.remove(&format!("{fingerprint}:{}", AlertStatus::Cancel));
    }

    /// Resolves the effective window in seconds: the alert's explicit window,
    /// else a parseable `suppress_window` annotation, else the per-status
    /// default.
    fn effective_window_secs(&self, alert: &Alert) -> u64 {
        if let Some(window) = alert.suppress_window {
            return window.as_secs();
        }
        if let Some(raw) = alert.suppress_window_annotation() {
            if let Some(secs) = parse_duration_secs(raw) {
                return secs;
            }
        }
        match alert.status {
            AlertStatus::Create => self.default_create_secs,
            AlertStatus::Cancel => self.default_cancel_secs,
        }
    }

    fn key(alert: &Alert) -> String {
        format!("{}:{}", alert.fingerprint, alert.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn cache_at(clock: &Arc<TickClock>, tick: u64) {
        while clock.tick() < tick {
            clock.advance();
        }
    }

    fn cache() -> (Arc<TickClock>, SuppressionCache) {
        let clock = Arc::new(TickClock::new());
        let cache = SuppressionCache::new(clock.clone(), &DefaultNocConfig::default());
        (clock, cache)
    }

    fn alert_with_window(secs: u64) -> Alert {
        let mut alert = Alert::new("x", "n", "s", AlertStatus::Create, 0);
        alert.suppress_window = Some(Duration::from_secs(secs));
        alert
    }

    #[test]
    fn marked_alerts_suppress_until_the_window_elapses() {
        let (clock, cache) = cache();
        let alert = alert_with_window(120);

        cache.mark_as_processed(&alert);
        assert!(cache.was_recently_processed(&alert));

        cache_at(&clock, 60);
        assert!(cache.was_recently_processed(&alert));

        cache_at(&clock, 130);
        assert!(!cache.was_recently_processed(&alert));
    }

    #[test]
    fn zero_window_never_suppresses() {
        let (_clock, cache) = cache();
        let alert = alert_with_window(0);

        cache.mark_as_processed(&alert);
        assert!(!cache.was_recently_processed(&alert));
    }

    #[test]
    fn statuses_are_independent() {
        let (_clock, cache) = cache();
        let create = alert_with_window(300);
        let mut cancel = create.clone();
        cancel.status = AlertStatus::Cancel;

        cache.mark_as_processed(&create);
        assert!(cache.was_recently_processed(&create));
        assert!(!cache.was_recently_processed(&cancel));
    }

    #[test]
    fn unmark_rearms_immediately() {
        let (_clock, cache) = cache();
        let alert = alert_with_window(300);

        cache.mark_as_processed(&alert);
        assert!(cache.was_recently_processed(&alert));
        cache.unmark_as_processed(&alert);
        assert!(!cache.was_recently_processed(&alert));
    }

    #[test]
    fn clear_fingerprint_drops_both_statuses() {
        let (_clock, cache) = cache();
        let create = alert_with_window(300);
        let mut cancel = create.clone();
        cancel.status = AlertStatus::Cancel;

        cache.mark_as_processed(&create);
        cache.mark_as_processed(&cancel);
        cache.clear_fingerprint("x");
        assert!(!cache.was_recently_processed(&create));
        assert!(!cache.was_recently_processed(&cancel));
    }

    #[test]
    fn annotation_window_applies_when_no_explicit_window() {
        let (_clock, cache) = cache();
        let mut alert = Alert::new("x", "n", "s", AlertStatus::Create, 0);
        alert
            .annotations
            .insert(crate::alert::SUPPRESS_WINDOW_ANNOTATION.to_string(), "1m".to_string());

        cache.mark_as_processed(&alert);
        assert!(cache.was_recently_processed(&alert));
    }

    #[test]
    fn empty_annotation_disables_suppression() {
        let (_clock, cache) = cache();
        let mut alert = Alert::new("x", "n", "s", AlertStatus::Create, 0);
        alert
            .annotations
            .insert(crate::alert::SUPPRESS_WINDOW_ANNOTATION.to_string(), String::new());

        cache.mark_as_processed(&alert);
        assert!(!cache.was_recently_processed(&alert));
    }

    #[test]
    fn unparseable_annotation_falls_back_to_defaults() {
        let (_clock, cache) = cache();
        let mut alert = Alert::new("x", "n", "s", AlertStatus::Create, 0);
        alert
            .annotations
            .insert(crate::alert::SUPPRESS_WINDOW_ANNOTATION.to_string(), "shrug".to_string());

        // DefaultNoc ships a 5m create window.
        cache.mark_as_processed(&alert);
        assert!(cache.was_recently_processed(&alert));
    }
}
