//! The periodic NOC snapshot.
//!
//! Every round drains expired entries, takes a priority-ordered snapshot, and
//! enqueues at most one CREATE (the highest-priority active incident) plus
//! one batch of all unsuppressed CANCELs. The one-CREATE-per-round shape is an
//! intentional rate limit: concurrent incidents drain across successive
//! snapshots in priority order, while CANCELs close incidents and go out
//! together.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use super::queue::{NocAction, NocDecision, NocQueueSender};
use crate::alert::{Alert, AlertStatus};
use crate::suppression::SuppressionCache;
use crate::vector::AlertsVector;

pub struct NocSnapshot {
    vector: Arc<AlertsVector>,
    suppression: Arc<SuppressionCache>,
    queue: NocQueueSender,
}

// === impl NocSnapshot ===

impl NocSnapshot {
    pub fn new(
        vector: Arc<AlertsVector>,
        suppression: Arc<SuppressionCache>,
        queue: NocQueueSender,
    ) -> Self {
        Self {
            vector,
            suppression,
            queue,
        }
    }

    /// One snapshot round.
    pub fn run(&self, correlation_id: &str) {
        self.vector.cleanup_expired();
        let snapshot = self.vector.snapshot();
        let snapshot_time = Utc::now();

        if let Some(create) = snapshot.iter().find(|a| a.status == AlertStatus::Create) {
            if self.suppression.was_recently_processed(create) {
                info!(
                    fingerprint = %create.fingerprint,
                    correlation_id,
                    "Highest-priority CREATE suppressed"
                );
            } else {
                self.suppression.mark_as_processed(create);
                self.queue.enqueue(NocDecision {
                    action: NocAction::HandleCreate(create.clone()),
                    snapshot_time,
                    correlation_id: correlation_id.to_string(),
                });
            }
        }

        let cancels: Vec<Alert> = snapshot
            .iter()
            .filter(|a| a.status == AlertStatus::Cancel)
            .filter(|a| !self.suppression.was_recently_processed(a))
            .cloned()
            .collect();
        if !cancels.is_empty() {
            for cancel in &cancels {
                self.suppression.mark_as_processed(cancel);
            }
            debug!(count = cancels.len(), correlation_id, "Enqueueing CANCELs");
            self.queue.enqueue(NocDecision {
                action: NocAction::HandleCancels(cancels),
                snapshot_time,
                correlation_id: correlation_id.to_string(),
            });
        }
    }
}
