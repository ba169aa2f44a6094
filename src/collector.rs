//! Result collection shared by all workers.
//!
//! Request ids come from one atomic counter; outcomes travel over an
//! unbounded channel to a single aggregating task that owns the list. No
//! lock is held by the workers at any point.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::outcome::RequestOutcome;

/// Owner side of the collector. Created before the workers start and
/// finished after every worker has returned.
pub struct ResultCollector {
    handle: CollectorHandle,
    task: JoinHandle<Vec<RequestOutcome>>,
}

/// Worker side of the collector. Cheap to clone; one per worker.
#[derive(Clone)]
pub struct CollectorHandle {
    next_id: Arc<AtomicU64>,
    tx: mpsc::UnboundedSender<RequestOutcome>,
}

impl ResultCollector {
    /// Start the aggregating task. Must be called inside a tokio runtime.
    pub fn spawn() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<RequestOutcome>();

        let task = tokio::spawn(async move {
            let mut outcomes = Vec::new();
            while let Some(outcome) = rx.recv().await {
                outcomes.push(outcome);
            }
            outcomes
        });

        Self {
            handle: CollectorHandle {
                next_id: Arc::new(AtomicU64::new(0)),
                tx,
            },
            task,
        }
    }

    /// New handle for a worker
    pub fn handle(&self) -> CollectorHandle {
        self.handle.clone()
    }

    /// Number of ids issued so far
    pub fn issued(&self) -> u64 {
        self.handle.next_id.load(Ordering::SeqCst)
    }

    /// Close the collector and return every submitted outcome in arrival
    /// order.
    ///
    /// Completes once all worker handles have been dropped.
    pub async fn finish(self) -> Vec<RequestOutcome> {
        let Self { handle, task } = self;
        drop(handle);

        match task.await {
            Ok(outcomes) => outcomes,
            Err(e) => {
                tracing::error!("Result collector task failed: {}", e);
                Vec::new()
            }
        }
    }
}

impl CollectorHandle {
    /// Issue the next request id. Ids are unique and strictly increasing
    /// in issue order across all handles.
    pub fn next_request_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Append an outcome
    pub fn submit(&self, outcome: RequestOutcome) {
        if let Err(e) = self.tx.send(outcome) {
            // Only possible if the aggregating task is gone
            tracing::error!(request_id = e.0.request_id, "Outcome dropped: collector closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::HashSet;

    #[tokio::test]
    async fn test_ids_start_at_zero_and_increase() {
        let collector = ResultCollector::spawn();
        let handle = collector.handle();

        assert_eq!(handle.next_request_id(), 0);
        assert_eq!(handle.next_request_id(), 1);
        assert_eq!(handle.next_request_id(), 2);
        assert_eq!(collector.issued(), 3);

        drop(handle);
        assert!(collector.finish().await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_ids_unique_and_no_lost_appends() {
        let collector = ResultCollector::spawn();
        let mut tasks = Vec::new();

        for _ in 0..16 {
            let handle = collector.handle();
            tasks.push(tokio::spawn(async move {
                for _ in 0..250 {
                    let id = handle.next_request_id();
                    handle.submit(RequestOutcome::started(id, Utc::now()));
                    tokio::task::yield_now().await;
                }
            }));
        }

        for task in tasks {
            task.await.unwrap();
        }

        let issued = collector.issued();
        let outcomes = collector.finish().await;
        let ids: HashSet<u64> = outcomes.iter().map(|o| o.request_id).collect();

        assert_eq!(outcomes.len(), 4000);
        assert_eq!(issued, 4000);
        assert_eq!(ids.len(), 4000);
        assert_eq!(ids.iter().max(), Some(&3999));
    }

    #[tokio::test]
    async fn test_finish_waits_for_outstanding_handles() {
        let collector = ResultCollector::spawn();
        let handle = collector.handle();

        let late = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            let id = handle.next_request_id();
            handle.submit(RequestOutcome::started(id, Utc::now()));
        });

        let outcomes = collector.finish().await;
        late.await.unwrap();

        assert_eq!(outcomes.len(), 1);
    }
}
