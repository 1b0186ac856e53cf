// Keep-alive coordinator: one-shot renewals and streaming sessions.

use super::store::LeaseStore;
use crate::{
    commit_log::CommitLog,
    message::{LogEntry, Mutation},
    time::Clock,
    Error, LeaseId, Result,
};
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Answer to one renewal request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAliveResponse {
    pub id: LeaseId,
    /// The granted TTL, which the countdown now restarts from.
    pub ttl: i64,
}

#[derive(Debug)]
pub struct KeepAliveCoordinator {
    store: Arc<LeaseStore>,
    log: Arc<dyn CommitLog>,
    clock: Arc<dyn Clock>,
}

impl KeepAliveCoordinator {
    pub fn new(store: Arc<LeaseStore>, log: Arc<dyn CommitLog>, clock: Arc<dyn Clock>) -> Self {
        Self { store, log, clock }
    }

    /// Restarts the countdown of `id` from its granted TTL.
    ///
    /// Renewals of one lease are serialized on its lock, so the last one to
    /// finish leaves the latest deadline. The deadline moves only after the
    /// renewal is committed; dropping this future earlier changes nothing.
    ///
    /// A lease whose deadline passes while the renewal is being committed
    /// stays expired and the caller gets `LeaseNotFound`.
    pub async fn renew(&self, id: LeaseId) -> Result<KeepAliveResponse> {
        let guard = self.store.lock_live(id, self.clock.as_ref()).await?;

        self.log
            .append(&LogEntry::single(Mutation::Renew { lease: id }))
            .await?;
        let now = self.clock.now();
        if guard.record.is_expired(now) {
            debug!(lease = %id, "lease expired while its renewal was committed");
            return Err(Error::LeaseNotFound { id });
        }
        guard.record.refresh(now);

        let ttl = guard.record.ttl();
        debug!(lease = %id, ttl, "lease kept alive");
        Ok(KeepAliveResponse { id, ttl })
    }

    /// Opens a streaming session. Requests are answered in arrival order,
    /// one response each; an unknown lease yields an error response and
    /// leaves the session open.
    pub fn open_stream(self: &Arc<Self>, buffer: usize) -> KeepAliveStream {
        let (request_tx, mut request_rx) = mpsc::channel::<LeaseId>(buffer);
        let (response_tx, response_rx) = mpsc::channel::<Result<KeepAliveResponse>>(buffer);
        let coordinator = self.clone();

        let task = tokio::spawn(async move {
            while let Some(id) = request_rx.recv().await {
                let response = coordinator.renew(id).await;
                if response_tx.send(response).await.is_err() {
                    break;
                }
            }
            debug!("keep-alive stream closed");
        });

        KeepAliveStream {
            requests: request_tx,
            responses: response_rx,
            task,
        }
    }
}

/// Client side of a streaming keep-alive session.
///
/// Dropping the stream ends the session; leases it was renewing simply
/// stop being renewed.
#[derive(Debug)]
pub struct KeepAliveStream {
    requests: mpsc::Sender<LeaseId>,
    responses: mpsc::Receiver<Result<KeepAliveResponse>>,
    task: JoinHandle<()>,
}

impl KeepAliveStream {
    pub async fn send(&self, id: LeaseId) -> Result<()> {
        self.requests
            .send(id)
            .await
            .map_err(|_| Error::Other(anyhow::anyhow!("keep-alive stream closed")))
    }

    pub async fn recv(&mut self) -> Option<Result<KeepAliveResponse>> {
        self.responses.recv().await
    }

    /// Sends one request and waits for its response.
    pub async fn keep_alive(&mut self, id: LeaseId) -> Result<KeepAliveResponse> {
        self.send(id).await?;
        self.recv()
            .await
            .unwrap_or_else(|| Err(Error::Other(anyhow::anyhow!("keep-alive stream closed"))))
    }

    /// Stops accepting requests and waits for in-flight ones to drain.
    pub async fn close(self) {
        let KeepAliveStream {
            requests,
            mut responses,
            task,
        } = self;
        drop(requests);
        while responses.recv().await.is_some() {}
        let _ = task.await;
    }
}

impl Stream for KeepAliveStream {
    type Item = Result<KeepAliveResponse>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.responses.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{commit_log::InMemoryCommitLog, time::ManualClock};
    use futures::StreamExt;
    use std::time::Duration;

    fn coordinator() -> (Arc<KeepAliveCoordinator>, Arc<LeaseStore>, Arc<ManualClock>) {
        let store = Arc::new(LeaseStore::new());
        let clock = Arc::new(ManualClock::new());
        let log = Arc::new(InMemoryCommitLog::new());
        let coordinator = Arc::new(KeepAliveCoordinator::new(
            store.clone(),
            log,
            clock.clone(),
        ));
        (coordinator, store, clock)
    }

    #[tokio::test]
    async fn test_renew_restores_granted_ttl() {
        let (coordinator, store, clock) = coordinator();
        let record = store.insert(LeaseId(1), 10, 0).unwrap();

        clock.advance(Duration::from_secs(7));
        let response = coordinator.renew(LeaseId(1)).await.unwrap();

        assert_eq!(response.ttl, 10);
        assert_eq!(record.deadline(), 17_000);
    }

    #[tokio::test]
    async fn test_expired_lease_cannot_be_renewed() {
        let (coordinator, store, clock) = coordinator();
        let record = store.insert(LeaseId(1), 10, 0).unwrap();

        clock.advance(Duration::from_secs(10));
        let err = coordinator.renew(LeaseId(1)).await.unwrap_err();

        assert!(err.is_not_found());
        assert_eq!(record.deadline(), 10_000);
    }

    #[tokio::test]
    async fn test_stream_survives_unknown_lease() {
        let (coordinator, store, _clock) = coordinator();
        store.insert(LeaseId(1), 10, 0).unwrap();

        let mut stream = coordinator.open_stream(4);
        stream.send(LeaseId(99)).await.unwrap();
        stream.send(LeaseId(1)).await.unwrap();

        let first = stream.next().await.unwrap();
        assert!(first.unwrap_err().is_not_found());
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second, KeepAliveResponse { id: LeaseId(1), ttl: 10 });

        stream.close().await;
    }
}
