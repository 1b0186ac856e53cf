use crate::{
    commit_log::InMemoryCommitLog, config::LessorConfig, lease::Lessor,
    storage::InMemoryStorage, time::ManualClock, Result,
};
use std::future::Future;
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

static TRACING: Once = Once::new();

/// Installs a test-friendly subscriber once per process. Honors `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Config with a fast expiry scan, suitable for tests driving a
/// `ManualClock`.
pub fn fast_config() -> LessorConfig {
    LessorConfig {
        min_ttl: 2,
        check_interval: Duration::from_millis(10),
        check_jitter: Duration::from_millis(5),
        ..LessorConfig::default()
    }
}

/// A lessor wired to in-memory collaborators and a manual clock.
pub struct LessorHarness {
    pub lessor: Arc<Lessor>,
    pub storage: Arc<InMemoryStorage>,
    pub log: Arc<InMemoryCommitLog>,
    pub clock: Arc<ManualClock>,
}

impl LessorHarness {
    pub fn new() -> Self {
        Self::with_config(fast_config())
    }

    pub fn with_config(config: LessorConfig) -> Self {
        init_tracing();
        let storage = Arc::new(InMemoryStorage::new());
        let log = Arc::new(InMemoryCommitLog::new());
        let clock = Arc::new(ManualClock::new());
        let lessor = Lessor::new(config, storage.clone(), log.clone(), clock.clone())
            .expect("test config is valid");

        Self {
            lessor: Arc::new(lessor),
            storage,
            log,
            clock,
        }
    }

    /// Simulates a crash: keeps the log and clock, loses everything else,
    /// and recovers a new lessor from the log.
    pub async fn restart(&self) -> Result<LessorHarness> {
        self.lessor.shutdown().await;
        let storage = Arc::new(InMemoryStorage::new());
        let lessor = Lessor::recover(
            self.lessor.config().clone(),
            storage.clone(),
            self.log.clone(),
            self.clock.clone(),
        )
        .await?;

        Ok(LessorHarness {
            lessor: Arc::new(lessor),
            storage,
            log: self.log.clone(),
            clock: self.clock.clone(),
        })
    }
}

impl Default for LessorHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Polls `check` until it returns true or `timeout` passes.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(5)).await;
    }
}
