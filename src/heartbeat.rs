//! # Heartbeat
//!
//! One shared periodic ticker drives every background concern: the
//! publish retry queue, the expiry sweep, and history pruning. Having a
//! single clock keeps background work coalesced instead of scattering
//! timers across components.

use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Default pulse interval
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);

/// Shared periodic ticker
///
/// Broadcasts a monotonically increasing pulse counter. Subscribers that
/// want a coarser cadence (the expiry sweep runs roughly every 30s) act
/// on every Nth pulse.
pub struct Heartbeat {
    events: broadcast::Sender<u64>,
    handle: JoinHandle<()>,
}

impl Heartbeat {
    /// Start ticking at the given interval
    pub fn start(interval: Duration) -> Self {
        let (events, _) = broadcast::channel(16);
        let tx = events.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; skip it so pulse 1 arrives
            // one interval after start.
            ticker.tick().await;
            let mut pulse: u64 = 0;
            loop {
                ticker.tick().await;
                pulse += 1;
                // No subscribers yet is fine; keep ticking
                let _ = tx.send(pulse);
            }
        });
        Self { events, handle }
    }

    /// Subscribe to pulses
    pub fn subscribe(&self) -> broadcast::Receiver<u64> {
        self.events.subscribe()
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pulses_are_monotonic() {
        let heartbeat = Heartbeat::start(Duration::from_millis(10));
        let mut rx = heartbeat.subscribe();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(second > first);
    }

    #[tokio::test]
    async fn test_ticker_stops_on_drop() {
        let heartbeat = Heartbeat::start(Duration::from_millis(10));
        let mut rx = heartbeat.subscribe();
        drop(heartbeat);

        // Channel closes once the ticker task is aborted
        loop {
            match rx.recv().await {
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
                Err(_) => continue,
            }
        }
    }
}
