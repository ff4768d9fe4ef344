//! Periodic peer-count polling for status displays.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Anything that can report how many chat peers it is connected to.
pub trait PeerCount: Send + Sync + 'static {
    fn peer_count(&self) -> usize;
}

impl<T: PeerCount + ?Sized> PeerCount for Arc<T> {
    #[inline]
    fn peer_count(&self) -> usize {
        (**self).peer_count()
    }
}

/// Publishes a peer-count snapshot on a watch channel at a fixed interval.
pub struct PeerCountMonitor;

impl PeerCountMonitor {
    /// Polls `source` every `interval` until `cancel` fires or every receiver
    /// is dropped. The receiver starts with the current count.
    pub fn spawn<P: PeerCount>(
        source: P,
        interval: Duration,
        cancel: CancellationToken,
    ) -> watch::Receiver<usize> {
        let (tx, rx) = watch::channel(source.peer_count());

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => break,
                    _ = tx.closed() => break,
                    _ = ticker.tick() => {
                        let count = source.peer_count();
                        tx.send_if_modified(|current| {
                            if *current == count {
                                return false;
                            }
                            debug!(peers = count, "Peer count changed");
                            *current = count;
                            true
                        });
                    }
                }
            }
        });

        rx
    }
}
