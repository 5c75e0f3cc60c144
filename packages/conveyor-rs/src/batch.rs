//! Post-commit notification batching.
//!
//! Notifications must never be observable before the state change that
//! caused them, so mutations performed inside a transaction buffer their
//! wake-ups here and the scope owner flushes the batch **after** commit.
//! Flushing is concurrent and best-effort: a failed publish is logged as a
//! `NotifyAdapterError` event and dropped; the poll loop guarantees
//! progress either way.
//!
//! Nested scopes share the outer batch (the context simply carries the same
//! `Arc`), so one commit produces one flush.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use futures::future::join_all;
use uuid::Uuid;

use crate::events::{EventSink, QueueEvent};
use crate::notify::NotifyAdapter;

/// Buffered wake-ups of one transaction scope.
#[derive(Debug, Default)]
pub struct NotifyBatch {
    scheduled: Mutex<HashMap<String, usize>>,
    completed_chains: Mutex<HashSet<Uuid>>,
    ownership_lost: Mutex<HashSet<Uuid>>,
}

impl NotifyBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer a job-scheduled wake-up for `type_name`.
    pub fn job_scheduled(&self, type_name: &str) {
        let mut scheduled = self.scheduled.lock().expect("batch lock poisoned");
        *scheduled.entry(type_name.to_string()).or_insert(0) += 1;
    }

    /// Buffer a chain-completed wake-up.
    pub fn job_chain_completed(&self, chain_id: Uuid) {
        self.completed_chains
            .lock()
            .expect("batch lock poisoned")
            .insert(chain_id);
    }

    /// Buffer an ownership-lost wake-up.
    pub fn job_ownership_lost(&self, job_id: Uuid) {
        self.ownership_lost
            .lock()
            .expect("batch lock poisoned")
            .insert(job_id);
    }

    pub fn is_empty(&self) -> bool {
        self.scheduled.lock().expect("batch lock poisoned").is_empty()
            && self
                .completed_chains
                .lock()
                .expect("batch lock poisoned")
                .is_empty()
            && self
                .ownership_lost
                .lock()
                .expect("batch lock poisoned")
                .is_empty()
    }

    /// Publish everything buffered so far, concurrently. Call after commit.
    ///
    /// Failures are reported to `events` and swallowed.
    pub async fn flush(&self, notify: &dyn NotifyAdapter, events: &dyn EventSink) {
        let scheduled: Vec<(String, usize)> = self
            .scheduled
            .lock()
            .expect("batch lock poisoned")
            .drain()
            .collect();
        let completed: Vec<Uuid> = self
            .completed_chains
            .lock()
            .expect("batch lock poisoned")
            .drain()
            .collect();
        let lost: Vec<Uuid> = self
            .ownership_lost
            .lock()
            .expect("batch lock poisoned")
            .drain()
            .collect();

        let scheduled_futures = scheduled.iter().map(|(type_name, count)| {
            let type_name = type_name.clone();
            let count = *count;
            async move {
                notify
                    .notify_job_scheduled(&type_name, count)
                    .await
                    .map_err(|e| ("job_scheduled", e))
            }
        });
        let completed_futures = completed.iter().map(|chain_id| {
            let chain_id = *chain_id;
            async move {
                notify
                    .notify_job_chain_completed(chain_id)
                    .await
                    .map_err(|e| ("chain_completed", e))
            }
        });
        let lost_futures = lost.iter().map(|job_id| {
            let job_id = *job_id;
            async move {
                notify
                    .notify_job_ownership_lost(job_id)
                    .await
                    .map_err(|e| ("ownership_lost", e))
            }
        });

        let (scheduled_results, completed_results, lost_results) = futures::join!(
            join_all(scheduled_futures),
            join_all(completed_futures),
            join_all(lost_futures)
        );

        for result in scheduled_results
            .into_iter()
            .chain(completed_results)
            .chain(lost_results)
        {
            if let Err((channel, err)) = result {
                events.emit(QueueEvent::NotifyAdapterError {
                    channel: channel.to_string(),
                    detail: err.to_string(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::*;
    use crate::events::CollectingEventSink;
    use crate::notify::{
        ChainCompletedCallback, InProcessNotifyAdapter, JobScheduledCallback, NotifyError,
        NotifySubscription, OwnershipLostCallback,
    };

    #[tokio::test]
    async fn flush_publishes_all_channels() {
        let notify = InProcessNotifyAdapter::new();
        let events = CollectingEventSink::new();

        let scheduled_hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&scheduled_hits);
        let _sub = notify
            .listen_job_scheduled(
                &["greet".to_string()],
                Arc::new(move |_, count| {
                    counter.fetch_add(count, Ordering::SeqCst);
                }),
            )
            .await
            .unwrap();

        let chain_id = Uuid::new_v4();
        let completed_hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&completed_hits);
        let _sub2 = notify
            .listen_job_chain_completed(
                chain_id,
                Arc::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await
            .unwrap();

        let batch = NotifyBatch::new();
        batch.job_scheduled("greet");
        batch.job_scheduled("greet");
        batch.job_chain_completed(chain_id);
        assert!(!batch.is_empty());

        batch.flush(&notify, &events).await;

        assert_eq!(scheduled_hits.load(Ordering::SeqCst), 2);
        assert_eq!(completed_hits.load(Ordering::SeqCst), 1);
        assert!(batch.is_empty());
        assert_eq!(events.count_kind("notify_adapter_error"), 0);
    }

    #[tokio::test]
    async fn duplicate_chain_completions_collapse() {
        let notify = InProcessNotifyAdapter::new();
        let events = CollectingEventSink::new();
        let chain_id = Uuid::new_v4();

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let _sub = notify
            .listen_job_chain_completed(
                chain_id,
                Arc::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await
            .unwrap();

        let batch = NotifyBatch::new();
        batch.job_chain_completed(chain_id);
        batch.job_chain_completed(chain_id);
        batch.flush(&notify, &events).await;

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    struct FailingNotify;

    #[async_trait]
    impl crate::notify::NotifyAdapter for FailingNotify {
        async fn notify_job_scheduled(&self, _: &str, _: usize) -> Result<(), NotifyError> {
            Err(NotifyError(anyhow::anyhow!("transport down")))
        }
        async fn listen_job_scheduled(
            &self,
            _: &[String],
            _: JobScheduledCallback,
        ) -> Result<NotifySubscription, NotifyError> {
            Ok(NotifySubscription::inert())
        }
        async fn notify_job_chain_completed(&self, _: Uuid) -> Result<(), NotifyError> {
            Err(NotifyError(anyhow::anyhow!("transport down")))
        }
        async fn listen_job_chain_completed(
            &self,
            _: Uuid,
            _: ChainCompletedCallback,
        ) -> Result<NotifySubscription, NotifyError> {
            Ok(NotifySubscription::inert())
        }
        async fn notify_job_ownership_lost(&self, _: Uuid) -> Result<(), NotifyError> {
            Err(NotifyError(anyhow::anyhow!("transport down")))
        }
        async fn listen_job_ownership_lost(
            &self,
            _: Uuid,
            _: OwnershipLostCallback,
        ) -> Result<NotifySubscription, NotifyError> {
            Ok(NotifySubscription::inert())
        }
    }

    #[tokio::test]
    async fn flush_failures_are_logged_not_raised() {
        let events = CollectingEventSink::new();
        let batch = NotifyBatch::new();
        batch.job_scheduled("greet");
        batch.job_chain_completed(Uuid::new_v4());
        batch.job_ownership_lost(Uuid::new_v4());

        batch.flush(&FailingNotify, &events).await;

        assert_eq!(events.count_kind("notify_adapter_error"), 3);
    }
}
