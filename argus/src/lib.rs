#![forbid(unsafe_code)]

//! Argus is a Kubernetes-resident monitoring sidecar.
//!
//! It aggregates health signals from the Kubernetes API, pushed Prometheus
//! alerts, a Prometheus watchdog heartbeat, and a local filesystem probe into
//! a priority-ordered vector of active alerts, and forwards those alerts to a
//! downstream NOC endpoint with a two-phase send/verify protocol. A replicated
//! deployment elects one leader via a Kubernetes lease; only the leader
//! performs the mutating NOC send and writes the on-disk liveness heartbeat.

pub mod admin;
pub mod alert;
pub mod config;
pub mod heartbeat;
pub mod leader;
pub mod liveness;
pub mod log;
pub mod noc;
pub mod runtime;
pub mod shutdown;
pub mod sources;
pub mod suppression;
pub mod timer;
pub mod vector;
pub mod watchdog;

pub use self::{
    alert::{Alert, AlertStatus},
    config::ArgusConfig,
    timer::CentralTimer,
    vector::AlertsVector,
};

/// Lower-case alphanumeric suffix used for correlation ids, execution ids,
/// and generated pod identities.
pub(crate) fn random_suffix(len: usize) -> String {
    use rand::{distributions::Alphanumeric, Rng};

    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(|b| (b as char).to_ascii_lowercase())
        .collect()
}
