// Lease record store: id allocation, lookup and per-lease locking

use super::record::{LeaseBody, LeaseRecord};
use crate::time::{Clock, Millis};
use crate::{Error, LeaseId, Result};
use dashmap::DashMap;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::OwnedMutexGuard;

const COUNTER_BITS: u32 = 48;
const COUNTER_MASK: u64 = (1 << COUNTER_BITS) - 1;

/// Allocates lease ids: a random node prefix over a per-process counter.
///
/// The prefix keeps ids from different managers apart. The counter starts
/// at the current wall time in milliseconds, so a restarted manager lands
/// past the ids of its previous run as long as that run averaged under one
/// grant per millisecond. Replay covers the rest via `advance_past`.
#[derive(Debug)]
pub struct IdGenerator {
    prefix: u64,
    counter: AtomicU64,
}

fn wall_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl IdGenerator {
    pub fn new() -> Self {
        // 15 bits so every id stays a positive i64
        let prefix = rand::rng().random_range(1..(1u64 << 15));
        // 48 bits of milliseconds last until the year 10889
        Self::with_prefix(prefix, wall_millis())
    }

    pub fn with_prefix(prefix: u64, start: u64) -> Self {
        Self {
            prefix: prefix & 0x7fff,
            counter: AtomicU64::new(start & COUNTER_MASK),
        }
    }

    pub fn next(&self) -> LeaseId {
        let suffix = self.counter.fetch_add(1, Ordering::SeqCst) & COUNTER_MASK;
        LeaseId(((self.prefix << COUNTER_BITS) | suffix) as i64)
    }

    /// Makes sure `seen` is never handed out again.
    pub fn advance_past(&self, seen: LeaseId) {
        let raw = seen.0 as u64;
        if raw >> COUNTER_BITS == self.prefix {
            self.counter
                .fetch_max((raw & COUNTER_MASK) + 1, Ordering::SeqCst);
        }
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive access to one live lease.
pub struct LeaseGuard {
    pub record: Arc<LeaseRecord>,
    pub body: OwnedMutexGuard<LeaseBody>,
}

impl std::fmt::Debug for LeaseGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseGuard")
            .field("id", &self.record.id)
            .field("keys", &self.body.keys.len())
            .finish()
    }
}

/// All granted, not yet revoked leases.
///
/// Sharded map of records; each record carries its own lock, so work on
/// different leases never contends.
#[derive(Debug)]
pub struct LeaseStore {
    records: DashMap<LeaseId, Arc<LeaseRecord>>,
    ids: IdGenerator,
}

impl LeaseStore {
    pub fn new() -> Self {
        Self::with_ids(IdGenerator::new())
    }

    pub fn with_ids(ids: IdGenerator) -> Self {
        Self {
            records: DashMap::new(),
            ids,
        }
    }

    /// An id that is neither live nor previously issued by this store.
    pub fn allocate_id(&self) -> LeaseId {
        loop {
            let id = self.ids.next();
            if !id.is_none() && !self.records.contains_key(&id) {
                return id;
            }
        }
    }

    pub fn insert(&self, id: LeaseId, ttl: i64, now: Millis) -> Result<Arc<LeaseRecord>> {
        use dashmap::mapref::entry::Entry;

        match self.records.entry(id) {
            Entry::Occupied(_) => Err(Error::LeaseExists { id }),
            Entry::Vacant(slot) => {
                self.ids.advance_past(id);
                let record = Arc::new(LeaseRecord::new(id, ttl, now));
                slot.insert(record.clone());
                Ok(record)
            }
        }
    }

    pub fn get(&self, id: LeaseId) -> Option<Arc<LeaseRecord>> {
        self.records.get(&id).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, id: LeaseId) -> Option<Arc<LeaseRecord>> {
        self.records.remove(&id).map(|(_, record)| record)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> Vec<Arc<LeaseRecord>> {
        self.records
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Ids whose deadline has passed, read from a snapshot of deadlines
    /// without taking any lease lock.
    pub fn expired(&self, now: Millis) -> Vec<LeaseId> {
        self.records
            .iter()
            .filter(|entry| entry.value().is_expired(now))
            .map(|entry| *entry.key())
            .collect()
    }

    /// Locks a lease that has not been revoked. Expired leases are still
    /// returned; callers decide whether expiry matters to them.
    pub async fn lock(&self, id: LeaseId) -> Option<LeaseGuard> {
        let record = self.get(id)?;
        let body = record.body.clone().lock_owned().await;
        if body.revoked {
            return None;
        }
        Some(LeaseGuard { record, body })
    }

    /// Locks a lease that is neither revoked nor expired at `now`.
    pub async fn lock_live(&self, id: LeaseId, clock: &dyn Clock) -> Result<LeaseGuard> {
        match self.lock(id).await {
            Some(guard) if !guard.record.is_expired(clock.now()) => Ok(guard),
            _ => Err(Error::LeaseNotFound { id }),
        }
    }

    /// Locks several leases in ascending id order. Duplicates and
    /// `LeaseId::NONE` are skipped; absent leases yield `None`.
    pub async fn lock_ordered(&self, ids: &[LeaseId]) -> Vec<(LeaseId, Option<LeaseGuard>)> {
        let mut ordered: Vec<LeaseId> = ids.iter().copied().filter(|id| !id.is_none()).collect();
        ordered.sort();
        ordered.dedup();

        let mut guards = Vec::with_capacity(ordered.len());
        for id in ordered {
            guards.push((id, self.lock(id).await));
        }
        guards
    }
}

impl Default for LeaseStore {
    fn default() -> Self {
        Self::new()
    }
}
