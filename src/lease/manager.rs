// Lessor: the lease manager facade tying records, keys, the commit log
// and the background expiry machinery together.

use super::{
    checker::ExpiryChecker,
    keepalive::{KeepAliveCoordinator, KeepAliveStream},
    revoke::Revoker,
    store::{LeaseGuard, LeaseStore},
};
use crate::{
    commit_log::CommitLog,
    config::LessorConfig,
    message::{LogEntry, Mutation},
    storage::{KeyValue, Storage},
    time::Clock,
    Error, LeaseId, Result,
};
use bytes::Bytes;
use dashmap::DashSet;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Inspection view of a live lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseStatus {
    pub id: LeaseId,
    pub granted_ttl: i64,
    /// Seconds left, rounded up.
    pub remaining_ttl: i64,
    pub keys: Vec<String>,
}

#[derive(Debug)]
struct Background {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

/// Locks held while a key moves between leases.
struct Binding {
    previous: Option<LeaseId>,
    guards: Vec<(LeaseId, Option<LeaseGuard>)>,
}

impl Binding {
    fn guard_mut(&mut self, id: LeaseId) -> Option<&mut LeaseGuard> {
        self.guards
            .iter_mut()
            .find(|(held, _)| *held == id)
            .and_then(|(_, guard)| guard.as_mut())
    }

    /// Moves `key` from the previous lease's set to `target`'s.
    fn rebind(&mut self, key: &str, target: LeaseId) {
        if self.previous == Some(target) {
            return;
        }
        if let Some(previous) = self.previous {
            if let Some(guard) = self.guard_mut(previous) {
                guard.body.keys.remove(key);
            }
        }
        if let Some(guard) = self.guard_mut(target) {
            guard.body.keys.insert(key.to_string());
        }
    }
}

/// Grants, renews and revokes leases and keeps keys bound to them.
#[derive(Debug)]
pub struct Lessor {
    config: LessorConfig,
    store: Arc<LeaseStore>,
    storage: Arc<dyn Storage>,
    log: Arc<dyn CommitLog>,
    clock: Arc<dyn Clock>,
    keepalive: Arc<KeepAliveCoordinator>,
    revoker: Arc<Revoker>,
    /// Expired leases handed to the revoke worker and not yet finished.
    in_flight: Arc<DashSet<LeaseId>>,
    /// Ids being granted but not yet in the store.
    pending: DashSet<LeaseId>,
    background: Mutex<Option<Background>>,
}

impl Lessor {
    pub fn new(
        config: LessorConfig,
        storage: Arc<dyn Storage>,
        log: Arc<dyn CommitLog>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(LeaseStore::new());
        let keepalive = Arc::new(KeepAliveCoordinator::new(
            store.clone(),
            log.clone(),
            clock.clone(),
        ));
        let revoker = Arc::new(Revoker::new(
            store.clone(),
            storage.clone(),
            log.clone(),
            clock.clone(),
        ));

        Ok(Self {
            config,
            store,
            storage,
            log,
            clock,
            keepalive,
            revoker,
            in_flight: Arc::new(DashSet::new()),
            pending: DashSet::new(),
            background: Mutex::new(None),
        })
    }

    /// Rebuilds lease and key state from every committed log entry.
    ///
    /// `storage` must be empty; it is repopulated from the log. Surviving
    /// leases get a full TTL from now, since the time spent down is unknown.
    pub async fn recover(
        config: LessorConfig,
        storage: Arc<dyn Storage>,
        log: Arc<dyn CommitLog>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let lessor = Self::new(config, storage, log, clock)?;
        let entries = lessor.log.entries().await?;
        let count = entries.len();
        for entry in entries {
            for mutation in entry.mutations {
                lessor.apply_replayed(mutation).await?;
            }
        }

        let now = lessor.clock.now();
        for record in lessor.store.records() {
            let _body = record.body.lock().await;
            record.refresh(now);
        }
        info!(entries = count, leases = lessor.store.len(), "lessor recovered from log");
        Ok(lessor)
    }

    async fn apply_replayed(&self, mutation: Mutation) -> Result<()> {
        match mutation {
            Mutation::Grant { lease, ttl } => {
                if self.store.get(lease).is_none() {
                    self.store.insert(lease, ttl, self.clock.now())?;
                }
            }
            // Deadlines are reset once replay finishes
            Mutation::Renew { .. } => {}
            Mutation::Revoke { lease } => {
                if let Some(record) = self.store.remove(lease) {
                    let mut body = record.body.lock().await;
                    let keys: Vec<String> = body.keys.iter().cloned().collect();
                    self.storage.apply_deletes(&keys).await?;
                    body.keys.clear();
                    body.revoked = true;
                }
            }
            Mutation::Put { key, value, lease } => {
                let previous = self.storage.put(&key, value, lease).await?;
                self.replay_rebind(&key, previous, lease).await;
            }
            Mutation::Delete { key } => {
                if let Some(removed) = self.storage.delete(&key).await? {
                    self.replay_rebind(&key, Some(removed.lease), LeaseId::NONE)
                        .await;
                }
            }
            Mutation::Attach { lease, key } => {
                let previous = self.storage.lease_of(&key).await?;
                self.storage.set_lease(&key, lease).await?;
                self.replay_rebind(&key, previous, lease).await;
            }
            Mutation::Detach { lease, key } => {
                self.storage.set_lease(&key, LeaseId::NONE).await?;
                self.replay_rebind(&key, Some(lease), LeaseId::NONE).await;
            }
        }
        Ok(())
    }

    async fn replay_rebind(&self, key: &str, previous: Option<LeaseId>, target: LeaseId) {
        let ids = [previous.unwrap_or(LeaseId::NONE), target];
        let mut binding = Binding {
            previous: previous.filter(|id| !id.is_none()),
            guards: self.store.lock_ordered(&ids).await,
        };
        binding.rebind(key, target);
    }

    /// Spawns the expiry checker and the revoke worker. Idempotent.
    pub fn start(&self) {
        let mut background = self.background.lock();
        if background.is_some() {
            return;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (queue_tx, queue_rx) = mpsc::channel(self.config.revoke_queue);
        let checker = ExpiryChecker::new(
            self.store.clone(),
            self.clock.clone(),
            self.in_flight.clone(),
            queue_tx,
            self.config.check_interval,
            self.config.check_jitter,
        );

        let tasks = vec![
            tokio::spawn(checker.run(shutdown_rx.clone())),
            tokio::spawn(
                self.revoker
                    .clone()
                    .run(queue_rx, self.in_flight.clone(), shutdown_rx),
            ),
        ];
        *background = Some(Background {
            shutdown: shutdown_tx,
            tasks,
        });
        info!(interval = ?self.config.check_interval, "lessor started");
    }

    /// Stops the background tasks and waits for them to finish.
    pub async fn shutdown(&self) {
        let background = self.background.lock().take();
        if let Some(background) = background {
            let _ = background.shutdown.send(true);
            for task in background.tasks {
                if let Err(e) = task.await {
                    warn!(error = %e, "lessor task ended abnormally");
                }
            }
            info!("lessor stopped");
        }
    }

    pub fn config(&self) -> &LessorConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Grants a lease with a fresh id. Returns the id and the TTL actually
    /// granted, which may have been clamped.
    pub async fn grant(&self, ttl: i64) -> Result<(LeaseId, i64)> {
        let granted = self.config.clamp_ttl(ttl)?;
        let id = self.store.allocate_id();
        self.grant_inner(id, ttl, granted).await
    }

    /// Grants a lease under an id chosen by the caller.
    pub async fn grant_with_id(&self, id: LeaseId, ttl: i64) -> Result<(LeaseId, i64)> {
        let granted = self.config.clamp_ttl(ttl)?;
        if id.0 <= 0 {
            return Err(Error::Other(anyhow::anyhow!("lease id must be positive, got {id}")));
        }
        self.grant_inner(id, ttl, granted).await
    }

    async fn grant_inner(&self, id: LeaseId, requested: i64, ttl: i64) -> Result<(LeaseId, i64)> {
        if !self.pending.insert(id) {
            return Err(Error::LeaseExists { id });
        }
        let result = self.commit_grant(id, ttl).await;
        self.pending.remove(&id);
        result?;

        info!(lease = %id, ttl, requested, "lease granted");
        Ok((id, ttl))
    }

    async fn commit_grant(&self, id: LeaseId, ttl: i64) -> Result<()> {
        if self.store.get(id).is_some() {
            return Err(Error::LeaseExists { id });
        }
        self.log
            .append(&LogEntry::single(Mutation::Grant { lease: id, ttl }))
            .await?;
        self.store.insert(id, ttl, self.clock.now())?;
        Ok(())
    }

    /// Revokes a lease and deletes every key bound to it.
    pub async fn revoke(&self, id: LeaseId) -> Result<()> {
        self.revoker.revoke(id).await?;
        Ok(())
    }

    /// One-shot renewal. Returns the granted TTL.
    pub async fn keep_alive_once(&self, id: LeaseId) -> Result<i64> {
        Ok(self.keepalive.renew(id).await?.ttl)
    }

    pub fn keep_alive_stream(&self) -> KeepAliveStream {
        self.keepalive.open_stream(self.config.keepalive_buffer)
    }

    pub async fn get(&self, id: LeaseId) -> Result<LeaseStatus> {
        let guard = self.store.lock_live(id, self.clock.as_ref()).await?;
        Ok(LeaseStatus {
            id,
            granted_ttl: guard.record.ttl(),
            remaining_ttl: guard.record.remaining_ttl(self.clock.now()),
            keys: guard.body.keys.iter().cloned().collect(),
        })
    }

    /// Ids of leases that are neither revoked nor expired.
    pub fn leases(&self) -> Vec<LeaseId> {
        let now = self.clock.now();
        let mut ids: Vec<LeaseId> = self
            .store
            .records()
            .into_iter()
            .filter(|record| !record.is_expired(now))
            .map(|record| record.id)
            .collect();
        ids.sort();
        ids
    }

    /// Locks the lease `key` is bound to along with `target`, retrying until
    /// the binding read before locking is still the current one.
    async fn lock_binding(&self, key: &str, target: LeaseId) -> Result<Binding> {
        loop {
            let previous = self.storage.lease_of(key).await?;
            let ids = [previous.unwrap_or(LeaseId::NONE), target];
            let guards = self.store.lock_ordered(&ids).await;

            if self.storage.lease_of(key).await? == previous {
                let mut binding = Binding { previous, guards };
                if !target.is_none() {
                    let now = self.clock.now();
                    match binding.guard_mut(target) {
                        Some(guard) if !guard.record.is_expired(now) => {}
                        _ => return Err(Error::LeaseNotFound { id: target }),
                    }
                }
                return Ok(binding);
            }
            debug!(key, "key binding changed while locking, retrying");
        }
    }

    /// Writes a key, binding it to `lease` or unbinding it when `None`.
    pub async fn put(&self, key: &str, value: impl Into<Bytes>, lease: Option<LeaseId>) -> Result<()> {
        let target = lease.unwrap_or(LeaseId::NONE);
        let value = value.into();
        let mut binding = self.lock_binding(key, target).await?;

        self.log
            .append(&LogEntry::single(Mutation::Put {
                key: key.to_string(),
                value: value.clone(),
                lease: target,
            }))
            .await?;
        self.storage.put(key, value, target).await?;
        binding.rebind(key, target);
        Ok(())
    }

    pub async fn get_key(&self, key: &str) -> Result<Option<KeyValue>> {
        self.storage.get(key).await
    }

    /// Deletes a key. Returns whether it existed.
    pub async fn delete_key(&self, key: &str) -> Result<bool> {
        let mut binding = self.lock_binding(key, LeaseId::NONE).await?;
        if self.storage.get(key).await?.is_none() {
            return Ok(false);
        }

        self.log
            .append(&LogEntry::single(Mutation::Delete {
                key: key.to_string(),
            }))
            .await?;
        self.storage.delete(key).await?;
        binding.rebind(key, LeaseId::NONE);
        Ok(true)
    }

    /// Binds an existing key to `id`, detaching it from any other lease.
    pub async fn attach(&self, id: LeaseId, key: &str) -> Result<()> {
        if id.is_none() {
            return Err(Error::LeaseNotFound { id });
        }
        let mut binding = self.lock_binding(key, id).await?;
        if binding.previous == Some(id) {
            return Ok(());
        }
        if self.storage.get(key).await?.is_none() {
            return Err(Error::KeyNotFound {
                key: key.to_string(),
            });
        }

        self.log
            .append(&LogEntry::single(Mutation::Attach {
                lease: id,
                key: key.to_string(),
            }))
            .await?;
        self.storage.set_lease(key, id).await?;
        binding.rebind(key, id);
        debug!(lease = %id, key, "key attached");
        Ok(())
    }

    /// Unbinds `key` from `id`. A key not bound to `id` is left alone.
    pub async fn detach(&self, id: LeaseId, key: &str) -> Result<()> {
        let mut guard = self.store.lock_live(id, self.clock.as_ref()).await?;
        if !guard.body.keys.contains(key) {
            return Ok(());
        }

        self.log
            .append(&LogEntry::single(Mutation::Detach {
                lease: id,
                key: key.to_string(),
            }))
            .await?;
        self.storage.set_lease(key, LeaseId::NONE).await?;
        guard.body.keys.remove(key);
        debug!(lease = %id, key, "key detached");
        Ok(())
    }
}
