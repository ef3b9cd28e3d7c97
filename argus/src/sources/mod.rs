//! Alert sources.
//!
//! Sources create alerts and hand them to the alerts vector; they never talk
//! to the NOC themselves. The Kubernetes layer and the filesystem probe run
//! as timer callbacks; the Prometheus source is event-driven from HTTP
//! ingress.

pub mod k8s_layer;
pub mod prometheus;
pub mod status_fs;

pub use self::{
    k8s_layer::K8sLayerSource,
    prometheus::{PrometheusAlert, PrometheusSource},
    status_fs::StatusFileSystemSource,
};
