//! The priority-ordered vector of currently-active alerts.
//!
//! This is the serialization point for alert state: every mutation takes one
//! lock and stamps the entry from the central timer's clock. Entries leave
//! the vector either through a successful NOC CANCEL round-trip or through
//! TTL cleanup.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::alert::{Alert, AlertStatus};
use crate::suppression::SuppressionCache;
use crate::timer::TickClock;

/// Classification of an `update_alert` call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The alert was malformed (empty fingerprint).
    Rejected,
    /// A CANCEL arrived for an unknown fingerprint; CANCELs never insert.
    Ignored,
    /// A CANCEL refreshed an already-cancelled entry.
    Refreshed,
    /// A new CREATE entered the vector.
    Created,
    /// A CREATE re-fired over a cancelled entry.
    Refired,
    /// A CANCEL resolved an active entry.
    Resolved,
    /// Any other upsert (notably CREATE over CREATE).
    Updated,
}

/// Counters published on the health surface.
#[derive(Debug, Default)]
pub struct VectorMetrics {
    created: AtomicU64,
    resolved: AtomicU64,
    expired: AtomicU64,
}

pub struct AlertsVector {
    alerts: Mutex<AHashMap<String, Alert>>,
    clock: Arc<TickClock>,
    suppression: Arc<SuppressionCache>,
    ttl_ticks: u64,
    metrics: VectorMetrics,
}

// === impl VectorMetrics ===

impl VectorMetrics {
    pub fn created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    pub fn resolved(&self) -> u64 {
        self.resolved.load(Ordering::Relaxed)
    }

    pub fn expired(&self) -> u64 {
        self.expired.load(Ordering::Relaxed)
    }
}

// === impl AlertsVector ===

impl AlertsVector {
    pub fn new(clock: Arc<TickClock>, suppression: Arc<SuppressionCache>, ttl_ticks: u64) -> Self {
        Self {
            alerts: Mutex::new(AHashMap::new()),
            clock,
            suppression,
            ttl_ticks: ttl_ticks.max(1),
            metrics: VectorMetrics::default(),
        }
    }

    /// Upserts an alert, stamping `last_seen` from the clock.
    ///
    /// A CANCEL can never introduce an entry, and a CANCEL over an existing
    /// CANCEL only refreshes the `last_seen` stamps.
    pub fn update_alert(&self, mut alert: Alert) -> UpdateOutcome {
        if alert.fingerprint.is_empty() {
            warn!(name = %alert.name, source = %alert.source, "Rejected alert without fingerprint");
            return UpdateOutcome::Rejected;
        }

        let tick = self.clock.tick();
        let timestamp = self.clock.timestamp();
        let mut alerts = self.alerts.lock();

        let previous = alerts.get(&alert.fingerprint).map(|a| a.status);
        match (previous, alert.status) {
            (None, AlertStatus::Cancel) => {
                debug!(fingerprint = %alert.fingerprint, "CANCEL for unknown fingerprint ignored");
                return UpdateOutcome::Ignored;
            }
            (Some(AlertStatus::Cancel), AlertStatus::Cancel) => {
                if let Some(existing) = alerts.get_mut(&alert.fingerprint) {
                    existing.last_seen_tick = tick;
                    existing.last_seen_timestamp = timestamp;
                }
                return UpdateOutcome::Refreshed;
            }
            _ => {}
        }

        alert.last_seen_tick = tick;
        alert.last_seen_timestamp = timestamp;
        let outcome = match (previous, alert.status) {
            (None, AlertStatus::Create) => {
                info!(
                    fingerprint = %alert.fingerprint,
                    name = %alert.name,
                    source = %alert.source,
                    priority = alert.priority,
                    execution_id = %alert.execution_id,
                    "Alert created"
                );
                self.metrics.created.fetch_add(1, Ordering::Relaxed);
                UpdateOutcome::Created
            }
            (Some(AlertStatus::Cancel), AlertStatus::Create) => {
                info!(
                    fingerprint = %alert.fingerprint,
                    name = %alert.name,
                    previous_status = %AlertStatus::Cancel,
                    "Alert created"
                );
                self.metrics.created.fetch_add(1, Ordering::Relaxed);
                UpdateOutcome::Refired
            }
            (Some(AlertStatus::Create), AlertStatus::Cancel) => {
                info!(
                    fingerprint = %alert.fingerprint,
                    name = %alert.name,
                    "Alert resolved"
                );
                UpdateOutcome::Resolved
            }
            _ => {
                debug!(fingerprint = %alert.fingerprint, status = %alert.status, "Alert updated");
                UpdateOutcome::Updated
            }
        };
        alerts.insert(alert.fingerprint.clone(), alert);
        outcome
    }

    /// Removes an alert and its suppression entries. Returns whether an entry
    /// was removed.
    pub fn remove_alert(&self, fingerprint: &str) -> bool {
        let removed = self.alerts.lock().remove(fingerprint).is_some();
        if removed {
            self.suppression.clear_fingerprint(fingerprint);
            self.metrics.resolved.fetch_add(1, Ordering::Relaxed);
            debug!(fingerprint, "Alert removed from vector");
        }
        removed
    }

    /// The current state for a fingerprint, if any.
    pub fn get(&self, fingerprint: &str) -> Option<Alert> {
        self.alerts.lock().get(fingerprint).cloned()
    }

    /// A materialized copy ordered by `(priority asc, timestamp asc)`. This
    /// ordering is the authoritative priority used downstream.
    pub fn snapshot(&self) -> Vec<Alert> {
        let mut alerts: Vec<Alert> = self.alerts.lock().values().cloned().collect();
        alerts.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.timestamp.cmp(&b.timestamp))
        });
        alerts
    }

    /// Evicts entries whose `last_seen_tick` is older than the TTL, clearing
    /// their suppression entries. Returns how many were evicted.
    pub fn cleanup_expired(&self) -> usize {
        let current_tick = self.clock.tick();
        let expired: Vec<(String, u64)> = self
            .alerts
            .lock()
            .values()
            .filter(|a| current_tick.saturating_sub(a.last_seen_tick) > self.ttl_ticks)
            .map(|a| (a.fingerprint.clone(), a.last_seen_tick))
            .collect();

        for (fingerprint, last_seen_tick) in &expired {
            self.alerts.lock().remove(fingerprint);
            self.suppression.clear_fingerprint(fingerprint);
            self.metrics.expired.fetch_add(1, Ordering::Relaxed);
            warn!(
                fingerprint = %fingerprint,
                last_seen_tick,
                current_tick,
                "Alert expired from vector"
            );
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.alerts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.alerts.lock().is_empty()
    }

    pub fn metrics(&self) -> &VectorMetrics {
        &self.metrics
    }

    /// Empties the vector. Test surface.
    pub fn clear(&self) {
        self.alerts.lock().clear();
    }
}
