use async_trait::async_trait;
use lessor::message::LogEntry;
use lessor::test_utils::{eventually, fast_config, init_tracing, LessorHarness};
use lessor::{CommitLog, InMemoryCommitLog, InMemoryStorage, Lessor, ManualClock, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(2);

/// Commit log whose appends take `delay` of lease time to complete.
#[derive(Debug)]
struct SlowLog {
    inner: InMemoryCommitLog,
    clock: Arc<ManualClock>,
    delay_ms: AtomicU64,
}

impl SlowLog {
    fn new(clock: Arc<ManualClock>) -> Self {
        Self {
            inner: InMemoryCommitLog::new(),
            clock,
            delay_ms: AtomicU64::new(0),
        }
    }

    fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }
}

#[async_trait]
impl CommitLog for SlowLog {
    async fn append(&self, entry: &LogEntry) -> Result<u64> {
        self.clock
            .advance(Duration::from_millis(self.delay_ms.load(Ordering::SeqCst)));
        self.inner.append(entry).await
    }

    async fn entries(&self) -> Result<Vec<LogEntry>> {
        self.inner.entries().await
    }
}

#[tokio::test]
async fn test_expired_lease_deletes_keys() {
    let h = LessorHarness::new();
    h.lessor.start();

    let (id, _) = h.lessor.grant(10).await.unwrap();
    h.lessor.put("key", "val", Some(id)).await.unwrap();
    h.lessor.put("plain", "val", None).await.unwrap();

    h.clock.advance(Duration::from_secs(10));
    let storage = h.storage.clone();
    assert!(
        eventually(WAIT, || {
            let storage = storage.clone();
            async move { storage.len() == 1 }
        })
        .await,
        "expired lease was not revoked"
    );

    assert!(h.lessor.get_key("key").await.unwrap().is_none());
    assert!(h.lessor.get_key("plain").await.unwrap().is_some());
    assert!(h.lessor.revoke(id).await.unwrap_err().is_not_found());
    h.lessor.shutdown().await;
}

#[tokio::test]
async fn test_kept_alive_lease_never_expires() {
    let h = LessorHarness::new();
    h.lessor.start();

    let (id, _) = h.lessor.grant(10).await.unwrap();
    h.lessor.put("key", "val", Some(id)).await.unwrap();

    for _ in 0..20 {
        h.clock.advance(Duration::from_secs(8));
        h.lessor.keep_alive_once(id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert!(h.lessor.get_key("key").await.unwrap().is_some());
    assert_eq!(h.lessor.leases(), vec![id]);
    h.lessor.shutdown().await;
}

#[tokio::test]
async fn test_failed_expiry_is_retried() {
    let h = LessorHarness::new();
    let (id, _) = h.lessor.grant(10).await.unwrap();
    h.lessor.put("key", "val", Some(id)).await.unwrap();

    h.log.set_available(false);
    h.lessor.start();
    h.clock.advance(Duration::from_secs(11));

    // Several scans fail while the log is down
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.lessor.get_key("key").await.unwrap().is_some());

    h.log.set_available(true);
    let storage = h.storage.clone();
    assert!(
        eventually(WAIT, || {
            let storage = storage.clone();
            async move { storage.is_empty() }
        })
        .await,
        "expiry was not retried after the log came back"
    );
    h.lessor.shutdown().await;
}

#[tokio::test]
async fn test_many_leases_expire_once_each() {
    let h = LessorHarness::new();
    h.lessor.start();

    let mut ids = Vec::new();
    for i in 0..50 {
        let (id, _) = h.lessor.grant(5).await.unwrap();
        h.lessor.put(&format!("key_{i}"), "v", Some(id)).await.unwrap();
        ids.push(id);
    }
    let committed_before = h.log.len();

    h.clock.advance(Duration::from_secs(5));
    let storage = h.storage.clone();
    assert!(
        eventually(WAIT, || {
            let storage = storage.clone();
            async move { storage.is_empty() }
        })
        .await
    );
    tokio::time::sleep(Duration::from_millis(50)).await;

    // One revoke entry per lease
    assert_eq!(h.log.len(), committed_before + ids.len());
    assert!(h.lessor.leases().is_empty());
    h.lessor.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_stops_expiry() {
    let h = LessorHarness::new();
    h.lessor.start();
    h.lessor.shutdown().await;

    let (id, _) = h.lessor.grant(5).await.unwrap();
    h.lessor.put("key", "val", Some(id)).await.unwrap();
    h.clock.advance(Duration::from_secs(6));
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(h.lessor.get_key("key").await.unwrap().is_some());
    assert!(h.lessor.get(id).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_renewal_committed_past_deadline_is_rejected() {
    init_tracing();
    let clock = Arc::new(ManualClock::new());
    let log = Arc::new(SlowLog::new(clock.clone()));
    let storage = Arc::new(InMemoryStorage::new());
    let lessor = Lessor::new(fast_config(), storage.clone(), log.clone(), clock.clone()).unwrap();
    lessor.start();

    let (id, _) = lessor.grant(10).await.unwrap();
    lessor.put("key", "val", Some(id)).await.unwrap();

    // One second left; the renewal takes two to commit
    clock.advance(Duration::from_secs(9));
    log.set_delay(Duration::from_secs(2));
    let err = lessor.keep_alive_once(id).await.unwrap_err();
    assert!(err.is_not_found());
    log.set_delay(Duration::ZERO);

    // The caller was told the lease is gone, and it is
    assert!(
        eventually(WAIT, || {
            let storage = storage.clone();
            async move { storage.is_empty() }
        })
        .await
    );
    assert!(lessor.get(id).await.unwrap_err().is_not_found());
    lessor.shutdown().await;
}

#[tokio::test]
async fn test_slow_renewal_within_deadline_keeps_key() {
    init_tracing();
    let clock = Arc::new(ManualClock::new());
    let log = Arc::new(SlowLog::new(clock.clone()));
    let storage = Arc::new(InMemoryStorage::new());
    let lessor = Lessor::new(fast_config(), storage.clone(), log.clone(), clock.clone()).unwrap();
    lessor.start();

    let (id, granted) = lessor.grant(10).await.unwrap();
    lessor.put("key", "val", Some(id)).await.unwrap();

    clock.advance(Duration::from_secs(9));
    log.set_delay(Duration::from_millis(500));
    assert_eq!(lessor.keep_alive_once(id).await.unwrap(), granted);
    log.set_delay(Duration::ZERO);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(lessor.get_key("key").await.unwrap().is_some());
    assert_eq!(lessor.get(id).await.unwrap().remaining_ttl, granted);
    lessor.shutdown().await;
}
