//! Best-effort wake-up notifications.
//!
//! Three logical channels tie producers to consumers:
//!
//! | Channel | Producer event | Consumer |
//! |---|---|---|
//! | job-scheduled | a new pending job of some type exists | workers polling that type |
//! | chain-completed | a chain reached terminal state | waiters on that chain |
//! | ownership-lost | a running job was externally reassigned | the worker holding the lease |
//!
//! Notifications may be lost (the poll loop is the correctness safety net)
//! and must never block the producer for long. [`NoopNotifyAdapter`] is a
//! valid implementation; the system then runs purely on polling.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use uuid::Uuid;

/// A notification could not be published. Callers log and move on.
#[derive(Debug, Error)]
#[error("notify adapter failure: {0}")]
pub struct NotifyError(#[from] pub anyhow::Error);

/// Callback for job-scheduled notifications: `(type_name, count)`.
pub type JobScheduledCallback = Arc<dyn Fn(&str, usize) + Send + Sync>;
/// Callback for chain-completed notifications.
pub type ChainCompletedCallback = Arc<dyn Fn(Uuid) + Send + Sync>;
/// Callback for ownership-lost notifications.
pub type OwnershipLostCallback = Arc<dyn Fn(Uuid) + Send + Sync>;

/// Active listener registration; dropping it unsubscribes.
pub struct NotifySubscription {
    dispose: Option<Box<dyn FnOnce() + Send>>,
}

impl NotifySubscription {
    pub fn new(dispose: impl FnOnce() + Send + 'static) -> Self {
        Self {
            dispose: Some(Box::new(dispose)),
        }
    }

    /// A subscription with nothing behind it (noop adapters).
    pub fn inert() -> Self {
        Self { dispose: None }
    }
}

impl Drop for NotifySubscription {
    fn drop(&mut self) {
        if let Some(dispose) = self.dispose.take() {
            dispose();
        }
    }
}

impl std::fmt::Debug for NotifySubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotifySubscription")
            .field("active", &self.dispose.is_some())
            .finish()
    }
}

/// Wake-up transport. All operations are best-effort.
///
/// Listener callbacks must be cheap and non-blocking (typically a
/// `tokio::sync::Notify` poke); they may run on the publisher's task.
/// Implementations that hold one physical transport subscription per channel
/// should fan out to all local subscribers from it.
#[async_trait]
pub trait NotifyAdapter: Send + Sync + 'static {
    async fn notify_job_scheduled(&self, type_name: &str, count: usize)
        -> Result<(), NotifyError>;

    async fn listen_job_scheduled(
        &self,
        type_names: &[String],
        callback: JobScheduledCallback,
    ) -> Result<NotifySubscription, NotifyError>;

    async fn notify_job_chain_completed(&self, chain_id: Uuid) -> Result<(), NotifyError>;

    async fn listen_job_chain_completed(
        &self,
        chain_id: Uuid,
        callback: ChainCompletedCallback,
    ) -> Result<NotifySubscription, NotifyError>;

    async fn notify_job_ownership_lost(&self, job_id: Uuid) -> Result<(), NotifyError>;

    async fn listen_job_ownership_lost(
        &self,
        job_id: Uuid,
        callback: OwnershipLostCallback,
    ) -> Result<NotifySubscription, NotifyError>;
}

/// Publishes nothing, delivers nothing. Everything rides on polling.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifyAdapter;

#[async_trait]
impl NotifyAdapter for NoopNotifyAdapter {
    async fn notify_job_scheduled(
        &self,
        _type_name: &str,
        _count: usize,
    ) -> Result<(), NotifyError> {
        Ok(())
    }

    async fn listen_job_scheduled(
        &self,
        _type_names: &[String],
        _callback: JobScheduledCallback,
    ) -> Result<NotifySubscription, NotifyError> {
        Ok(NotifySubscription::inert())
    }

    async fn notify_job_chain_completed(&self, _chain_id: Uuid) -> Result<(), NotifyError> {
        Ok(())
    }

    async fn listen_job_chain_completed(
        &self,
        _chain_id: Uuid,
        _callback: ChainCompletedCallback,
    ) -> Result<NotifySubscription, NotifyError> {
        Ok(NotifySubscription::inert())
    }

    async fn notify_job_ownership_lost(&self, _job_id: Uuid) -> Result<(), NotifyError> {
        Ok(())
    }

    async fn listen_job_ownership_lost(
        &self,
        _job_id: Uuid,
        _callback: OwnershipLostCallback,
    ) -> Result<NotifySubscription, NotifyError> {
        Ok(NotifySubscription::inert())
    }
}

/// In-process notify transport backed by shared subscriber registries.
///
/// Delivery is synchronous and at-most-once: publishing walks the matching
/// subscribers and invokes their callbacks inline. Subscribers that
/// unsubscribe concurrently may or may not see the notification.
#[derive(Clone, Default)]
pub struct InProcessNotifyAdapter {
    next_id: Arc<AtomicU64>,
    scheduled: Arc<DashMap<u64, (HashSet<String>, JobScheduledCallback)>>,
    chain_completed: Arc<DashMap<u64, (Uuid, ChainCompletedCallback)>>,
    ownership_lost: Arc<DashMap<u64, (Uuid, OwnershipLostCallback)>>,
}

impl InProcessNotifyAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    fn subscriber_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Subscriber count across all channels, for tests and introspection.
    pub fn subscriber_count(&self) -> usize {
        self.scheduled.len() + self.chain_completed.len() + self.ownership_lost.len()
    }
}

impl std::fmt::Debug for InProcessNotifyAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessNotifyAdapter")
            .field("scheduled_subscribers", &self.scheduled.len())
            .field("chain_completed_subscribers", &self.chain_completed.len())
            .field("ownership_lost_subscribers", &self.ownership_lost.len())
            .finish()
    }
}

#[async_trait]
impl NotifyAdapter for InProcessNotifyAdapter {
    async fn notify_job_scheduled(
        &self,
        type_name: &str,
        count: usize,
    ) -> Result<(), NotifyError> {
        for entry in self.scheduled.iter() {
            let (type_names, callback) = entry.value();
            if type_names.contains(type_name) {
                callback(type_name, count);
            }
        }
        Ok(())
    }

    async fn listen_job_scheduled(
        &self,
        type_names: &[String],
        callback: JobScheduledCallback,
    ) -> Result<NotifySubscription, NotifyError> {
        let id = self.subscriber_id();
        self.scheduled
            .insert(id, (type_names.iter().cloned().collect(), callback));
        let registry = Arc::clone(&self.scheduled);
        Ok(NotifySubscription::new(move || {
            registry.remove(&id);
        }))
    }

    async fn notify_job_chain_completed(&self, chain_id: Uuid) -> Result<(), NotifyError> {
        for entry in self.chain_completed.iter() {
            let (subscribed, callback) = entry.value();
            if *subscribed == chain_id {
                callback(chain_id);
            }
        }
        Ok(())
    }

    async fn listen_job_chain_completed(
        &self,
        chain_id: Uuid,
        callback: ChainCompletedCallback,
    ) -> Result<NotifySubscription, NotifyError> {
        let id = self.subscriber_id();
        self.chain_completed.insert(id, (chain_id, callback));
        let registry = Arc::clone(&self.chain_completed);
        Ok(NotifySubscription::new(move || {
            registry.remove(&id);
        }))
    }

    async fn notify_job_ownership_lost(&self, job_id: Uuid) -> Result<(), NotifyError> {
        for entry in self.ownership_lost.iter() {
            let (subscribed, callback) = entry.value();
            if *subscribed == job_id {
                callback(job_id);
            }
        }
        Ok(())
    }

    async fn listen_job_ownership_lost(
        &self,
        job_id: Uuid,
        callback: OwnershipLostCallback,
    ) -> Result<NotifySubscription, NotifyError> {
        let id = self.subscriber_id();
        self.ownership_lost.insert(id, (job_id, callback));
        let registry = Arc::clone(&self.ownership_lost);
        Ok(NotifySubscription::new(move || {
            registry.remove(&id);
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[tokio::test]
    async fn scheduled_notifications_filter_by_type() {
        let adapter = InProcessNotifyAdapter::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&hits);
        let _sub = adapter
            .listen_job_scheduled(
                &["greet".to_string()],
                Arc::new(move |_, _| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await
            .unwrap();

        adapter.notify_job_scheduled("greet", 1).await.unwrap();
        adapter.notify_job_scheduled("other", 1).await.unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn payloads_round_trip() {
        let adapter = InProcessNotifyAdapter::new();
        let seen = Arc::new(std::sync::Mutex::new(None));

        let slot = Arc::clone(&seen);
        let chain_id = Uuid::new_v4();
        let _sub = adapter
            .listen_job_chain_completed(
                chain_id,
                Arc::new(move |id| {
                    *slot.lock().unwrap() = Some(id);
                }),
            )
            .await
            .unwrap();

        adapter.notify_job_chain_completed(chain_id).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), Some(chain_id));
    }

    #[tokio::test]
    async fn chain_completed_filters_by_chain() {
        let adapter = InProcessNotifyAdapter::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&hits);
        let _sub = adapter
            .listen_job_chain_completed(
                Uuid::new_v4(),
                Arc::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await
            .unwrap();

        adapter
            .notify_job_chain_completed(Uuid::new_v4())
            .await
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn dropping_subscription_unsubscribes() {
        let adapter = InProcessNotifyAdapter::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&hits);
        let sub = adapter
            .listen_job_ownership_lost(
                Uuid::new_v4(),
                Arc::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await
            .unwrap();

        assert_eq!(adapter.subscriber_count(), 1);
        drop(sub);
        assert_eq!(adapter.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn many_subscribers_share_a_channel() {
        let adapter = InProcessNotifyAdapter::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let mut subs = Vec::new();
        for _ in 0..3 {
            let counter = Arc::clone(&hits);
            subs.push(
                adapter
                    .listen_job_scheduled(
                        &["fetch".to_string()],
                        Arc::new(move |_, _| {
                            counter.fetch_add(1, Ordering::SeqCst);
                        }),
                    )
                    .await
                    .unwrap(),
            );
        }

        adapter.notify_job_scheduled("fetch", 2).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn noop_adapter_is_valid() {
        let adapter = NoopNotifyAdapter;
        adapter.notify_job_scheduled("greet", 1).await.unwrap();
        let sub = adapter
            .listen_job_scheduled(&["greet".to_string()], Arc::new(|_, _| {}))
            .await
            .unwrap();
        drop(sub);
    }
}
