// Expiry checker: periodically hands expired leases to the revoke worker.

use super::store::LeaseStore;
use crate::{time::Clock, LeaseId};
use dashmap::DashSet;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

#[derive(Debug)]
pub struct ExpiryChecker {
    store: Arc<LeaseStore>,
    clock: Arc<dyn Clock>,
    in_flight: Arc<DashSet<LeaseId>>,
    queue: mpsc::Sender<LeaseId>,
    interval: Duration,
    jitter: Duration,
}

impl ExpiryChecker {
    pub fn new(
        store: Arc<LeaseStore>,
        clock: Arc<dyn Clock>,
        in_flight: Arc<DashSet<LeaseId>>,
        queue: mpsc::Sender<LeaseId>,
        interval: Duration,
        jitter: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            in_flight,
            queue,
            interval,
            jitter,
        }
    }

    /// Queues every expired lease not already awaiting revocation.
    /// Returns how many were queued.
    pub fn scan_once(&self) -> usize {
        let now = self.clock.now();
        let mut queued = 0;

        for id in self.store.expired(now) {
            if !self.in_flight.insert(id) {
                continue;
            }
            match self.queue.try_send(id) {
                Ok(()) => queued += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // Picked up again on the next scan
                    self.in_flight.remove(&id);
                    warn!(lease = %id, "revoke queue full");
                    break;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    self.in_flight.remove(&id);
                    break;
                }
            }
        }

        if queued > 0 {
            info!(queued, "expired leases queued for revocation");
        }
        queued
    }

    fn next_delay(&self) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return self.interval;
        }
        self.interval + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            let delay = self.next_delay();
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            self.scan_once();
        }
        debug!("expiry checker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::ManualClock;

    fn checker(
        capacity: usize,
    ) -> (
        ExpiryChecker,
        Arc<LeaseStore>,
        Arc<ManualClock>,
        Arc<DashSet<LeaseId>>,
        mpsc::Receiver<LeaseId>,
    ) {
        let store = Arc::new(LeaseStore::new());
        let clock = Arc::new(ManualClock::new());
        let in_flight = Arc::new(DashSet::new());
        let (tx, rx) = mpsc::channel(capacity);
        let checker = ExpiryChecker::new(
            store.clone(),
            clock.clone(),
            in_flight.clone(),
            tx,
            Duration::from_millis(10),
            Duration::ZERO,
        );
        (checker, store, clock, in_flight, rx)
    }

    #[tokio::test]
    async fn test_expired_lease_is_queued_once() {
        let (checker, store, clock, in_flight, mut rx) = checker(8);
        store.insert(LeaseId(1), 5, 0).unwrap();
        store.insert(LeaseId(2), 50, 0).unwrap();

        assert_eq!(checker.scan_once(), 0);

        clock.advance(Duration::from_secs(5));
        assert_eq!(checker.scan_once(), 1);
        assert_eq!(rx.recv().await, Some(LeaseId(1)));

        // Still in flight: not submitted again
        assert_eq!(checker.scan_once(), 0);

        in_flight.remove(&LeaseId(1));
        assert_eq!(checker.scan_once(), 1);
    }

    #[tokio::test]
    async fn test_full_queue_clears_in_flight_marker() {
        let (checker, store, clock, in_flight, _rx) = checker(1);
        store.insert(LeaseId(1), 5, 0).unwrap();
        store.insert(LeaseId(2), 5, 0).unwrap();
        clock.advance(Duration::from_secs(6));

        assert_eq!(checker.scan_once(), 1);
        assert_eq!(in_flight.len(), 1);
    }
}
