// Core lease data structures

use crate::time::{secs_to_millis, Millis};
use crate::LeaseId;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Mutable part of a lease, guarded by the per-lease lock.
#[derive(Debug, Default)]
pub struct LeaseBody {
    /// Keys currently bound to this lease.
    pub keys: BTreeSet<String>,
    /// Set once revocation has been applied. A revoked record is dead
    /// even to callers that fetched it before it left the store.
    pub revoked: bool,
}

/// A granted lease.
///
/// The TTL never changes after grant. The deadline is only written while
/// the body lock is held, but is readable without it so the expiry scan
/// never waits on keep-alives.
#[derive(Debug)]
pub struct LeaseRecord {
    pub id: LeaseId,
    ttl: i64,
    deadline: AtomicU64,
    pub(crate) body: Arc<Mutex<LeaseBody>>,
}

impl LeaseRecord {
    pub fn new(id: LeaseId, ttl: i64, now: Millis) -> Self {
        Self {
            id,
            ttl,
            deadline: AtomicU64::new(now.saturating_add(secs_to_millis(ttl))),
            body: Arc::new(Mutex::new(LeaseBody::default())),
        }
    }

    /// Granted TTL in seconds.
    pub fn ttl(&self) -> i64 {
        self.ttl
    }

    pub fn deadline(&self) -> Millis {
        self.deadline.load(Ordering::SeqCst)
    }

    pub fn is_expired(&self, now: Millis) -> bool {
        self.deadline() <= now
    }

    /// Restarts the countdown from `now` with the full granted TTL.
    pub fn refresh(&self, now: Millis) {
        self.deadline
            .store(now.saturating_add(secs_to_millis(self.ttl)), Ordering::SeqCst);
    }

    /// Whole seconds left before expiry, rounded up. Zero once expired.
    pub fn remaining_ttl(&self, now: Millis) -> i64 {
        let left = self.deadline().saturating_sub(now);
        left.div_ceil(1000) as i64
    }
}
