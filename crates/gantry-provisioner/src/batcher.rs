//! Change-event coalescing for the provisioning loop
//!
//! Pending-pod events arrive in bursts (a deployment scale-up creates many
//! pods at once). The batcher collapses a burst into a single scheduling
//! trigger: the batch closes after a quiet period, or at a hard ceiling
//! measured from the first event.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

/// Sender half: watch handlers call this on every relevant change event
#[derive(Clone)]
pub struct BatchHandle {
    tx: mpsc::Sender<()>,
}

impl BatchHandle {
    /// Signal that a pending pod was seen; never blocks
    pub fn trigger(&self) {
        // a full channel already guarantees a wakeup
        let _ = self.tx.try_send(());
    }
}

/// Receiver half: the provisioning loop waits on this
pub struct Batcher {
    rx: mpsc::Receiver<()>,
    idle: Duration,
    max: Duration,
}

/// Create a connected batcher pair
pub fn batcher(idle: Duration, max: Duration) -> (BatchHandle, Batcher) {
    let (tx, rx) = mpsc::channel(1);
    (BatchHandle { tx }, Batcher { rx, idle, max })
}

impl Batcher {
    /// Wait for the next batch of change events
    ///
    /// Returns `None` when every handle is dropped. Otherwise blocks for the
    /// first event, then drains follow-on events until `idle` elapses with
    /// no event or `max` elapses from the first.
    pub async fn wait(&mut self) -> Option<()> {
        self.rx.recv().await?;
        let deadline = Instant::now() + self.max;
        let mut events = 1usize;
        loop {
            let idle_deadline = Instant::now() + self.idle;
            let closes_at = idle_deadline.min(deadline);
            tokio::select! {
                received = self.rx.recv() => match received {
                    Some(()) => {
                        events += 1;
                        if Instant::now() >= deadline {
                            break;
                        }
                    }
                    None => break,
                },
                _ = tokio::time::sleep_until(closes_at) => break,
            }
        }
        debug!(events, "Batch window closed");
        Some(())
    }
}
