//! Drives graceful shutdown when the process receives a signal.

use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing::debug;

pub use drain::Watch;

/// Drives shutdown by watching signals
#[derive(Debug)]
#[must_use = "call `Shutdown::signaled` to await a signal"]
pub struct Shutdown {
    signals: Signals,
    tx: drain::Signal,
}

/// Indicates whether shutdown completed gracefully or was forced by a second
/// signal
#[derive(Debug, thiserror::Error)]
#[error("process aborted by signal")]
pub struct Aborted(());

/// Indicates an error registering a signal handler
#[derive(Debug, thiserror::Error)]
#[error("failed to register signal handler: {0}")]
pub struct RegisterError(#[from] std::io::Error);

#[derive(Debug)]
struct Signals {
    interrupt: Signal,
    terminate: Signal,
}

/// Creates a shutdown channel
///
/// [`Shutdown`] watches for `SIGINT` and `SIGTERM` signals. When a signal is
/// received, [`Watch`] instances are notified and, when all watches are
/// dropped, the shutdown is completed. If a second signal is received while
/// waiting for watches to be dropped, the shutdown is aborted.
pub fn register() -> Result<(Shutdown, Watch), RegisterError> {
    let signals = Signals::new()?;

    let (tx, rx) = drain::channel();
    let shutdown = Shutdown { signals, tx };
    Ok((shutdown, rx))
}

// === impl Shutdown ===

impl Shutdown {
    /// Watches for signals and drives shutdown
    ///
    /// When a signal is received, the shutdown is initiated, notifying all
    /// [`Watch`] instances. When all watches are dropped, the shutdown is
    /// completed.
    ///
    /// If a second signal is received while waiting for watches to be dropped,
    /// this future completes immediately with an [`Aborted`] error.
    pub async fn signaled(self) -> Result<(), Aborted> {
        let Self {
            mut signals,
            mut tx,
        } = self;

        tokio::select! {
            _ = signals.recv() => {
                debug!("draining");
            },

            _ = tx.closed() => {
                debug!("all shutdown receivers dropped");
                // Drain can't do anything if the receivers have been dropped
                return Ok(());
            }
        }

        tokio::select! {
            _ = tx.drain() => {
                debug!("drained");
                Ok(())
            },

            _ = signals.recv() => {
                debug!("aborting");
                Err(Aborted(()))
            },
        }
    }
}

// === impl Signals ===

impl Signals {
    fn new() -> std::io::Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    async fn recv(&mut self) {
        tokio::select! {
            _ = self.interrupt.recv() => {}
            _ = self.terminate.recv() => {}
        }
    }
}
