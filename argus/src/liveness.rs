//! Per-callback self-diagnosis.
//!
//! Every well-behaved callback stamps its execution here on success (or on a
//! handled failure). A callback that throws without catching never stamps, so
//! it shows up as unhealthy within two of its intervals. This is the primary
//! self-diagnosis mechanism feeding the heartbeat service.

use ahash::AHashMap;
use parking_lot::Mutex;

/// One entry per registered callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LivenessEntry {
    pub last_execution_tick: u64,
    pub expected_interval_ticks: u64,
}

/// A named entry, as returned by the snapshot queries.
#[derive(Clone, Debug)]
pub struct LivenessRecord {
    pub name: String,
    pub entry: LivenessEntry,
}

#[derive(Debug, Default)]
pub struct LivenessVector {
    entries: Mutex<AHashMap<String, LivenessEntry>>,
}

// === impl LivenessEntry ===

impl LivenessEntry {
    /// Healthy iff the entry is younger than twice its expected interval.
    pub fn is_healthy(&self, current_tick: u64) -> bool {
        current_tick.saturating_sub(self.last_execution_tick) < self.expected_interval_ticks * 2
    }

    pub fn age(&self, current_tick: u64) -> u64 {
        current_tick.saturating_sub(self.last_execution_tick)
    }
}

// === impl LivenessVector ===

impl LivenessVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrites the entry for `name`.
    pub fn record_execution(&self, name: &str, expected_interval_ticks: u64, current_tick: u64) {
        self.entries.lock().insert(
            name.to_string(),
            LivenessEntry {
                last_execution_tick: current_tick,
                expected_interval_ticks: expected_interval_ticks.max(1),
            },
        );
    }

    pub fn is_healthy(&self, current_tick: u64) -> bool {
        self.entries
            .lock()
            .values()
            .all(|entry| entry.is_healthy(current_tick))
    }

    /// The entries whose age has reached twice their expected interval.
    pub fn unhealthy_callbacks(&self, current_tick: u64) -> Vec<LivenessRecord> {
        self.entries
            .lock()
            .iter()
            .filter(|(_, entry)| !entry.is_healthy(current_tick))
            .map(|(name, entry)| LivenessRecord {
                name: name.clone(),
                entry: *entry,
            })
            .collect()
    }

    pub fn snapshot(&self) -> Vec<LivenessRecord> {
        let mut records: Vec<_> = self
            .entries
            .lock()
            .iter()
            .map(|(name, entry)| LivenessRecord {
                name: name.clone(),
                entry: *entry,
            })
            .collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }

    pub fn count(&self) -> usize {
        self.entries.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn healthy_until_twice_the_interval() {
        let vector = LivenessVector::new();
        vector.record_execution("snapshot", 10, 100);

        assert!(vector.is_healthy(100));
        assert!(vector.is_healthy(119));
        // age == 2x interval is the unhealthy boundary
        assert!(!vector.is_healthy(120));
        assert!(!vector.is_healthy(200));
    }

    #[test]
    fn restamping_overwrites() {
        let vector = LivenessVector::new();
        vector.record_execution("snapshot", 10, 100);
        assert!(!vector.is_healthy(120));

        vector.record_execution("snapshot", 10, 120);
        assert!(vector.is_healthy(139));
        assert_eq!(vector.count(), 1);
    }

    #[test]
    fn unhealthy_callbacks_are_listed() {
        let vector = LivenessVector::new();
        vector.record_execution("good", 30, 100);
        vector.record_execution("stuck", 10, 50);

        let unhealthy = vector.unhealthy_callbacks(110);
        assert_eq!(unhealthy.len(), 1);
        assert_eq!(unhealthy[0].name, "stuck");
        assert_eq!(unhealthy[0].entry.age(110), 60);
        assert!(!vector.is_healthy(110));
    }

    #[test]
    fn empty_vector_is_healthy() {
        let vector = LivenessVector::new();
        assert!(vector.is_healthy(1000));
        assert!(vector.unhealthy_callbacks(1000).is_empty());
        assert_eq!(vector.count(), 0);
    }
}
