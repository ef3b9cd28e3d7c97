//! Filesystem probe for the heartbeat destination.
//!
//! Verifies that the directory receiving the heartbeat file exists and is
//! writable by creating and deleting a uniquely named probe file. The result
//! is emitted as an alert every cycle so the vector always reflects the
//! current state.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::alert::{Alert, AlertStatus};
use crate::config::DefaultNocConfig;
use crate::vector::AlertsVector;

/// Fingerprint and priority of the filesystem alert.
pub const STATUS_FS_FINGERPRINT: &str = "status-filesystem";
pub const STATUS_FS_PRIORITY: i32 = -6;

pub struct StatusFileSystemSource {
    directory: PathBuf,
    defaults: DefaultNocConfig,
    vector: Arc<AlertsVector>,
}

// === impl StatusFileSystemSource ===

impl StatusFileSystemSource {
    pub fn new(directory: PathBuf, defaults: DefaultNocConfig, vector: Arc<AlertsVector>) -> Self {
        Self {
            directory,
            defaults,
            vector,
        }
    }

    /// One probe cycle.
    pub async fn probe(&self) {
        let (status, summary) = match self.check().await {
            Ok(()) => {
                debug!(directory = %self.directory.display(), "Heartbeat directory writable");
                (
                    AlertStatus::Cancel,
                    format!("{} is writable", self.directory.display()),
                )
            }
            Err(error) => {
                warn!(
                    directory = %self.directory.display(),
                    %error,
                    "Heartbeat directory probe failed"
                );
                (
                    AlertStatus::Create,
                    format!("{} is not writable: {error}", self.directory.display()),
                )
            }
        };

        let behavior = match status {
            AlertStatus::Create => &self.defaults.create_noc_behavior,
            AlertStatus::Cancel => &self.defaults.cancel_noc_behavior,
        };
        let alert = Alert::new(
            STATUS_FS_FINGERPRINT,
            "status-filesystem",
            "status-filesystem",
            status,
            STATUS_FS_PRIORITY,
        )
        .with_payload_template(behavior)
        .with_summary(summary);
        self.vector.update_alert(alert);
    }

    async fn check(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.directory).await?;
        let probe = self
            .directory
            .join(format!(".argus-probe-{}", crate::random_suffix(8)));
        tokio::fs::write(&probe, b"probe").await?;
        tokio::fs::remove_file(&probe).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::suppression::SuppressionCache;
    use crate::timer::TickClock;

    fn source(directory: PathBuf) -> (Arc<AlertsVector>, StatusFileSystemSource) {
        let clock = Arc::new(TickClock::new());
        let suppression = Arc::new(SuppressionCache::new(
            clock.clone(),
            &DefaultNocConfig::default(),
        ));
        let vector = Arc::new(AlertsVector::new(clock, suppression, 86400));
        let source =
            StatusFileSystemSource::new(directory, DefaultNocConfig::default(), vector.clone());
        (vector, source)
    }

    #[tokio::test]
    async fn writable_directory_cancels() {
        let dir = tempfile::tempdir().unwrap();
        let (vector, source) = source(dir.path().to_path_buf());

        source.probe().await;
        // a CANCEL with no prior entry never inserts
        assert!(vector.get(STATUS_FS_FINGERPRINT).is_none());

        // no probe files left behind
        let leftovers = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn unwritable_directory_creates_an_alert() {
        let dir = tempfile::tempdir().unwrap();
        // A file where the directory should be makes create_dir_all fail.
        let blocked = dir.path().join("blocked");
        std::fs::write(&blocked, b"x").unwrap();
        let (vector, source) = source(blocked);

        source.probe().await;
        let alert = vector.get(STATUS_FS_FINGERPRINT).expect("alert");
        assert_eq!(alert.status, AlertStatus::Create);
        assert_eq!(alert.priority, STATUS_FS_PRIORITY);
    }

    #[tokio::test]
    async fn recovery_resolves_the_alert() {
        let dir = tempfile::tempdir().unwrap();
        let blocked = dir.path().join("blocked");
        std::fs::write(&blocked, b"x").unwrap();
        let (vector, source) = source(blocked.clone());

        source.probe().await;
        assert_eq!(
            vector.get(STATUS_FS_FINGERPRINT).unwrap().status,
            AlertStatus::Create
        );

        std::fs::remove_file(&blocked).unwrap();
        source.probe().await;
        assert_eq!(
            vector.get(STATUS_FS_FINGERPRINT).unwrap().status,
            AlertStatus::Cancel
        );
    }
}
