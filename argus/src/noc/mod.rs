//! NOC (Network Operations Center) integration.
//!
//! Alerts leave the process through a two-phase protocol: the leader POSTs the
//! payload to the send endpoint (Phase 1), then every replica POSTs a filter
//! to the verify endpoint and compares the echoed payload against what was
//! sent (Phase 2). A shared consecutive-failure counter gates the file
//! heartbeat when the NOC is unreachable.

pub mod client;
pub mod health;
pub mod payload;
pub mod queue;
pub mod snapshot;

pub use self::{
    client::{HttpNocClient, NocError, NocTransport},
    health::NocHealth,
    payload::{NocFilter, NocPayload},
    queue::{NocAction, NocDecision, NocDispatcher, NocQueueSender},
};

use tracing::{debug, warn};

/// Result of one two-phase exchange.
#[derive(Clone, Copy, Debug)]
pub struct TwoPhaseOutcome {
    /// Phase 1 reached the receiver with a 2xx. Always false on followers.
    pub sent: bool,
    /// Phase 2 returned a payload matching what was sent.
    pub verified: bool,
}

/// Runs one two-phase exchange against the NOC.
///
/// Phase 1 (leader only) POSTs `payload` to the send endpoint; a failure is
/// logged but does not short-circuit Phase 2, since the receiver may have
/// accepted the write despite an error body. Phase 2 (every role) POSTs a
/// filter built from the payload most recently known to have been sent:
/// `cached` when present (typically on the follower), the fresh `payload`
/// otherwise. The echo is compared on `suppressionKey`/`level`/`source`.
pub async fn two_phase(
    transport: &dyn NocTransport,
    is_leader: bool,
    payload: &NocPayload,
    cached: Option<&NocPayload>,
) -> TwoPhaseOutcome {
    let mut sent = false;
    if is_leader {
        match transport.send(payload).await {
            Ok(()) => {
                debug!(suppression_key = %payload.suppression_key, "NOC send accepted");
                sent = true;
            }
            Err(error) => warn!(
                suppression_key = %payload.suppression_key,
                %error,
                "NOC send failed; verifying anyway"
            ),
        }
    }

    let reference = if sent { payload } else { cached.unwrap_or(payload) };
    let filter = NocFilter::from(reference.clone());
    let verified = match transport.verify(&filter).await {
        Ok(received) => {
            let matches = reference.matches(&received);
            if !matches {
                warn!(
                    suppression_key = %reference.suppression_key,
                    received_key = %received.suppression_key,
                    "NOC verify comparison failed"
                );
            }
            matches
        }
        Err(error) => {
            warn!(suppression_key = %reference.suppression_key, %error, "NOC verify failed");
            false
        }
    };

    TwoPhaseOutcome { sent, verified }
}
