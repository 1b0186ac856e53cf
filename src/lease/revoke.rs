// Revocation engine: removes a lease and every key bound to it as one
// committed log entry.

use super::store::{LeaseGuard, LeaseStore};
use crate::{
    commit_log::CommitLog,
    message::{LogEntry, Mutation},
    storage::Storage,
    time::Clock,
    Error, LeaseId, Result,
};
use dashmap::DashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Why a lease is being revoked. Only affects logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevokeReason {
    Requested,
    Expired,
}

#[derive(Debug)]
pub struct Revoker {
    store: Arc<LeaseStore>,
    storage: Arc<dyn Storage>,
    log: Arc<dyn CommitLog>,
    clock: Arc<dyn Clock>,
}

impl Revoker {
    pub fn new(
        store: Arc<LeaseStore>,
        storage: Arc<dyn Storage>,
        log: Arc<dyn CommitLog>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            storage,
            log,
            clock,
        }
    }

    /// Revokes `id`, returning the keys that were deleted with it.
    pub async fn revoke(&self, id: LeaseId) -> Result<Vec<String>> {
        let guard = self
            .store
            .lock(id)
            .await
            .ok_or(Error::LeaseNotFound { id })?;
        self.revoke_locked(guard, RevokeReason::Requested).await
    }

    /// Revokes `id` if it is still expired once its lock is held.
    /// Returns `None` when a keep-alive renewed it after it was queued.
    pub async fn revoke_expired(&self, id: LeaseId) -> Result<Option<Vec<String>>> {
        let guard = self
            .store
            .lock(id)
            .await
            .ok_or(Error::LeaseNotFound { id })?;
        if !guard.record.is_expired(self.clock.now()) {
            debug!(lease = %id, "lease renewed before its expiry was handled");
            return Ok(None);
        }
        self.revoke_locked(guard, RevokeReason::Expired)
            .await
            .map(Some)
    }

    // The lease lock is held from lookup through apply, so nobody can
    // observe the key deletes without the record removal or the reverse.
    // If the commit fails nothing has been touched.
    async fn revoke_locked(&self, mut guard: LeaseGuard, reason: RevokeReason) -> Result<Vec<String>> {
        let id = guard.record.id;
        let keys: Vec<String> = guard.body.keys.iter().cloned().collect();

        let indexed = self.storage.keys_for(id).await?;
        if indexed != keys {
            error!(
                lease = %id,
                attached = keys.len(),
                indexed = indexed.len(),
                "attached key accounting mismatch"
            );
            return Err(Error::Internal(format!(
                "lease {id} lists keys {keys:?} but the store binds {indexed:?} to it"
            )));
        }

        let mut mutations: Vec<Mutation> = keys
            .iter()
            .map(|key| Mutation::Delete { key: key.clone() })
            .collect();
        mutations.push(Mutation::Revoke { lease: id });
        let index = self.log.append(&LogEntry::new(mutations)).await?;

        let deleted = self.storage.apply_deletes(&keys).await?;
        guard.body.keys.clear();
        guard.body.revoked = true;
        self.store.remove(id);

        info!(lease = %id, keys = deleted, index, ?reason, "lease revoked");
        Ok(keys)
    }

    /// Drains expired lease ids handed over by the expiry checker.
    ///
    /// Every id is cleared from `in_flight` once its attempt finishes,
    /// whatever the outcome, so a failed revocation is retried on a
    /// later scan.
    pub async fn run(
        self: Arc<Self>,
        mut queue: mpsc::Receiver<LeaseId>,
        in_flight: Arc<DashSet<LeaseId>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let id = tokio::select! {
                _ = shutdown.changed() => break,
                next = queue.recv() => match next {
                    Some(id) => id,
                    None => break,
                },
            };

            match self.revoke_expired(id).await {
                Ok(_) => {}
                Err(Error::LeaseNotFound { .. }) => {
                    debug!(lease = %id, "expired lease already gone");
                }
                Err(e) if e.is_retryable() => {
                    warn!(lease = %id, error = %e, "expired lease revocation deferred");
                }
                Err(e) => {
                    error!(lease = %id, error = %e, "expired lease revocation failed");
                }
            }
            in_flight.remove(&id);
        }
        debug!("revoke worker stopped");
    }
}
