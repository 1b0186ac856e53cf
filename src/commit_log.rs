use crate::{message::LogEntry, Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

/// The durable, ordered log every lease mutation is committed through.
///
/// `append` returns only once the entry is durable; an error means the
/// entry was not committed and nothing of it may be applied.
#[async_trait]
pub trait CommitLog: Send + Sync + std::fmt::Debug {
    async fn append(&self, entry: &LogEntry) -> Result<u64>;

    /// Every committed entry, in commit order.
    async fn entries(&self) -> Result<Vec<LogEntry>>;
}

#[derive(Debug, Clone)]
struct SealedRecord {
    index: u64,
    payload: Vec<u8>,
    checksum: [u8; 32],
}

/// Log kept in memory as checksummed, encoded records.
#[derive(Debug)]
pub struct InMemoryCommitLog {
    records: RwLock<Vec<SealedRecord>>,
    available: AtomicBool,
}

impl InMemoryCommitLog {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(Vec::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulates losing (or regaining) quorum.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flips a byte in a stored record. Test hook for replay verification.
    pub fn corrupt(&self, index: u64) {
        let mut records = self.records.write();
        if let Some(record) = records.iter_mut().find(|r| r.index == index) {
            if let Some(byte) = record.payload.first_mut() {
                *byte ^= 0xff;
            }
        }
    }
}

impl Default for InMemoryCommitLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommitLog for InMemoryCommitLog {
    async fn append(&self, entry: &LogEntry) -> Result<u64> {
        if !self.available.load(Ordering::SeqCst) {
            warn!(mutations = entry.mutations.len(), "commit log rejected entry");
            return Err(Error::Unavailable("no quorum".to_string()));
        }

        let mut records = self.records.write();
        let index = records.last().map_or(1, |r| r.index + 1);

        let mut sealed = entry.clone();
        sealed.index = index;
        let payload = bincode::serialize(&sealed)?;
        let checksum = *blake3::hash(&payload).as_bytes();

        records.push(SealedRecord {
            index,
            payload,
            checksum,
        });
        debug!(index, mutations = entry.mutations.len(), "committed log entry");
        Ok(index)
    }

    async fn entries(&self) -> Result<Vec<LogEntry>> {
        let records = self.records.read();
        let mut entries = Vec::with_capacity(records.len());
        for record in records.iter() {
            if *blake3::hash(&record.payload).as_bytes() != record.checksum {
                return Err(Error::Internal(format!(
                    "checksum mismatch in log entry {}",
                    record.index
                )));
            }
            entries.push(bincode::deserialize(&record.payload)?);
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{message::Mutation, LeaseId};

    fn grant(id: i64) -> LogEntry {
        LogEntry::single(Mutation::Grant {
            lease: LeaseId(id),
            ttl: 10,
        })
    }

    #[tokio::test]
    async fn test_append_assigns_sequential_indexes() {
        let log = InMemoryCommitLog::new();
        assert_eq!(log.append(&grant(1)).await.unwrap(), 1);
        assert_eq!(log.append(&grant(2)).await.unwrap(), 2);

        let entries = log.entries().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].index, 2);
        assert_eq!(entries[1].mutations, grant(2).mutations);
    }

    #[tokio::test]
    async fn test_unavailable_log_commits_nothing() {
        let log = InMemoryCommitLog::new();
        log.set_available(false);

        let err = log.append(&grant(1)).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(log.is_empty());

        log.set_available(true);
        assert_eq!(log.append(&grant(1)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_corrupted_record_fails_replay() {
        let log = InMemoryCommitLog::new();
        log.append(&grant(1)).await.unwrap();
        log.corrupt(1);

        assert!(matches!(log.entries().await, Err(Error::Internal(_))));
    }
}
