use crate::{Error, LeaseId, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub value: Bytes,
    /// `LeaseId::NONE` when the key is not bound to a lease.
    pub lease: LeaseId,
    /// Number of writes since the key was created.
    pub version: u64,
}

/// The key-value store the lessor binds keys in.
///
/// Implementations keep the key -> lease relation alongside each key and
/// a reverse index from lease to keys.
#[async_trait]
pub trait Storage: Send + Sync + std::fmt::Debug {
    /// Writes `key`, returning the lease it was bound to before, if any.
    async fn put(&self, key: &str, value: Bytes, lease: LeaseId) -> Result<Option<LeaseId>>;
    async fn get(&self, key: &str) -> Result<Option<KeyValue>>;
    async fn delete(&self, key: &str) -> Result<Option<KeyValue>>;
    async fn lease_of(&self, key: &str) -> Result<Option<LeaseId>>;
    /// Rebinds an existing key without touching its value.
    async fn set_lease(&self, key: &str, lease: LeaseId) -> Result<()>;
    /// Deletes every listed key as one atomic step. Returns how many existed.
    async fn apply_deletes(&self, keys: &[String]) -> Result<usize>;
    /// Keys bound to `lease`, in key order.
    async fn keys_for(&self, lease: LeaseId) -> Result<Vec<String>>;
}

#[derive(Debug, Default)]
struct Tables {
    data: BTreeMap<String, KeyValue>,
    by_lease: HashMap<LeaseId, BTreeSet<String>>,
}

impl Tables {
    fn unindex(&mut self, key: &str, lease: LeaseId) {
        if lease.is_none() {
            return;
        }
        if let Some(keys) = self.by_lease.get_mut(&lease) {
            keys.remove(key);
            if keys.is_empty() {
                self.by_lease.remove(&lease);
            }
        }
    }

    fn index(&mut self, key: &str, lease: LeaseId) {
        if !lease.is_none() {
            self.by_lease
                .entry(lease)
                .or_default()
                .insert(key.to_string());
        }
    }

    fn remove(&mut self, key: &str) -> Option<KeyValue> {
        let removed = self.data.remove(key)?;
        self.unindex(key, removed.lease);
        Some(removed)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryStorage {
    tables: RwLock<Tables>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tables.read().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn put(&self, key: &str, value: Bytes, lease: LeaseId) -> Result<Option<LeaseId>> {
        let mut tables = self.tables.write();
        let (previous, version) = match tables.data.get(key) {
            Some(existing) => (existing.lease, existing.version + 1),
            None => (LeaseId::NONE, 1),
        };

        tables.unindex(key, previous);
        tables.index(key, lease);
        tables.data.insert(
            key.to_string(),
            KeyValue {
                value,
                lease,
                version,
            },
        );

        Ok((!previous.is_none()).then_some(previous))
    }

    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        Ok(self.tables.read().data.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<Option<KeyValue>> {
        Ok(self.tables.write().remove(key))
    }

    async fn lease_of(&self, key: &str) -> Result<Option<LeaseId>> {
        Ok(self
            .tables
            .read()
            .data
            .get(key)
            .map(|kv| kv.lease)
            .filter(|lease| !lease.is_none()))
    }

    async fn set_lease(&self, key: &str, lease: LeaseId) -> Result<()> {
        let mut tables = self.tables.write();
        let previous = match tables.data.get_mut(key) {
            Some(kv) => std::mem::replace(&mut kv.lease, lease),
            None => {
                return Err(Error::KeyNotFound {
                    key: key.to_string(),
                })
            }
        };
        tables.unindex(key, previous);
        tables.index(key, lease);
        Ok(())
    }

    async fn apply_deletes(&self, keys: &[String]) -> Result<usize> {
        let mut tables = self.tables.write();
        Ok(keys.iter().filter(|key| tables.remove(key).is_some()).count())
    }

    async fn keys_for(&self, lease: LeaseId) -> Result<Vec<String>> {
        Ok(self
            .tables
            .read()
            .by_lease
            .get(&lease)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_tracks_previous_binding() {
        let storage = InMemoryStorage::new();
        let first = storage
            .put("key", Bytes::from_static(b"v1"), LeaseId(1))
            .await
            .unwrap();
        assert_eq!(first, None);

        let second = storage
            .put("key", Bytes::from_static(b"v2"), LeaseId(2))
            .await
            .unwrap();
        assert_eq!(second, Some(LeaseId(1)));

        assert!(storage.keys_for(LeaseId(1)).await.unwrap().is_empty());
        assert_eq!(storage.keys_for(LeaseId(2)).await.unwrap(), vec!["key"]);

        let kv = storage.get("key").await.unwrap().unwrap();
        assert_eq!(kv.value, Bytes::from_static(b"v2"));
        assert_eq!(kv.version, 2);
    }

    #[tokio::test]
    async fn test_apply_deletes_skips_missing_keys() {
        let storage = InMemoryStorage::new();
        storage
            .put("a", Bytes::from_static(b"1"), LeaseId(5))
            .await
            .unwrap();
        storage
            .put("b", Bytes::from_static(b"2"), LeaseId(5))
            .await
            .unwrap();

        let keys = vec!["a".to_string(), "b".to_string(), "missing".to_string()];
        assert_eq!(storage.apply_deletes(&keys).await.unwrap(), 2);
        assert!(storage.is_empty());
        assert!(storage.keys_for(LeaseId(5)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_set_lease_requires_key() {
        let storage = InMemoryStorage::new();
        let err = storage.set_lease("ghost", LeaseId(3)).await.unwrap_err();
        assert!(matches!(err, Error::KeyNotFound { .. }));

        storage
            .put("real", Bytes::from_static(b"x"), LeaseId::NONE)
            .await
            .unwrap();
        storage.set_lease("real", LeaseId(3)).await.unwrap();
        assert_eq!(storage.lease_of("real").await.unwrap(), Some(LeaseId(3)));

        storage.set_lease("real", LeaseId::NONE).await.unwrap();
        assert_eq!(storage.lease_of("real").await.unwrap(), None);
    }
}
