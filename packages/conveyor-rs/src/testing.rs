//! Test support: an assembled in-process queue and fault injection.
//!
//! These utilities back the crate's own test suites and are exported for
//! downstream integration tests. None of them belong in a production
//! deployment.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::client::Client;
use crate::error::QueueError;
use crate::events::{CollectingEventSink, EventSink};
use crate::job::{ChainSnapshot, Job, Schedule};
use crate::memory::MemoryStateAdapter;
use crate::notify::InProcessNotifyAdapter;
use crate::registry::JobTypeRegistry;
use crate::state::{
    AcquiredJob, AddBlockersOutcome, CreateJobOutcome, CreateJobRequest, ReapedJob, StateAdapter,
    StateContext, TransactionToken,
};
use crate::time::SharedClock;

/// A fully wired in-process queue: memory state, in-process notify,
/// collecting event sink.
pub struct TestQueue {
    pub client: Client,
    pub state: Arc<MemoryStateAdapter>,
    pub notify: Arc<InProcessNotifyAdapter>,
    pub events: Arc<CollectingEventSink>,
}

impl TestQueue {
    pub fn new(registry: JobTypeRegistry) -> Self {
        Self::build(Arc::new(MemoryStateAdapter::new()), registry)
    }

    /// Use a specific clock (usually a `ManualClock`) for scheduling.
    pub fn with_clock(registry: JobTypeRegistry, clock: SharedClock) -> Self {
        Self::build(Arc::new(MemoryStateAdapter::with_clock(clock)), registry)
    }

    fn build(state: Arc<MemoryStateAdapter>, registry: JobTypeRegistry) -> Self {
        let notify = Arc::new(InProcessNotifyAdapter::new());
        let events = Arc::new(CollectingEventSink::new());
        let client = Client::new(
            Arc::clone(&state) as Arc<dyn StateAdapter>,
            Arc::clone(&notify) as Arc<dyn crate::notify::NotifyAdapter>,
            Arc::new(registry),
        )
        .with_event_sink(Arc::clone(&events) as Arc<dyn EventSink>);
        Self {
            client,
            state,
            notify,
            events,
        }
    }
}

/// Delegating state adapter that fails the next N operations with a
/// transient error. For exercising the retry decorator and worker
/// resilience.
pub struct FlakyStateAdapter {
    inner: Arc<dyn StateAdapter>,
    remaining_failures: AtomicUsize,
    observed_calls: AtomicUsize,
}

impl FlakyStateAdapter {
    pub fn new(inner: Arc<dyn StateAdapter>) -> Self {
        Self {
            inner,
            remaining_failures: AtomicUsize::new(0),
            observed_calls: AtomicUsize::new(0),
        }
    }

    /// Make the next `n` operations fail with a transient error.
    pub fn fail_next(&self, n: usize) {
        self.remaining_failures.store(n, Ordering::SeqCst);
    }

    /// Total operations observed (including failed ones).
    pub fn observed_calls(&self) -> usize {
        self.observed_calls.load(Ordering::SeqCst)
    }

    fn check(&self, operation: &'static str) -> Result<(), QueueError> {
        self.observed_calls.fetch_add(1, Ordering::SeqCst);
        let mut remaining = self.remaining_failures.load(Ordering::SeqCst);
        loop {
            if remaining == 0 {
                return Ok(());
            }
            match self.remaining_failures.compare_exchange(
                remaining,
                remaining - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    return Err(QueueError::transient(anyhow::anyhow!(
                        "injected transient failure in {operation}"
                    )))
                }
                Err(current) => remaining = current,
            }
        }
    }
}

#[async_trait]
impl StateAdapter for FlakyStateAdapter {
    async fn begin(&self) -> Result<TransactionToken, QueueError> {
        self.check("begin")?;
        self.inner.begin().await
    }

    async fn commit(&self, token: TransactionToken) -> Result<(), QueueError> {
        self.check("commit")?;
        self.inner.commit(token).await
    }

    async fn rollback(&self, token: TransactionToken) -> Result<(), QueueError> {
        // Rollback stays reliable so injected failures cannot leak locks.
        self.inner.rollback(token).await
    }

    async fn create_job(
        &self,
        ctx: &StateContext,
        request: CreateJobRequest,
    ) -> Result<CreateJobOutcome, QueueError> {
        self.check("create_job")?;
        self.inner.create_job(ctx, request).await
    }

    async fn add_job_blockers(
        &self,
        ctx: &StateContext,
        job_id: Uuid,
        blocked_by_chain_ids: &[Uuid],
    ) -> Result<AddBlockersOutcome, QueueError> {
        self.check("add_job_blockers")?;
        self.inner
            .add_job_blockers(ctx, job_id, blocked_by_chain_ids)
            .await
    }

    async fn schedule_blocked_jobs(
        &self,
        ctx: &StateContext,
        blocked_by_chain_id: Uuid,
    ) -> Result<Vec<Job>, QueueError> {
        self.check("schedule_blocked_jobs")?;
        self.inner
            .schedule_blocked_jobs(ctx, blocked_by_chain_id)
            .await
    }

    async fn get_job_by_id(
        &self,
        ctx: &StateContext,
        job_id: Uuid,
    ) -> Result<Option<Job>, QueueError> {
        self.check("get_job_by_id")?;
        self.inner.get_job_by_id(ctx, job_id).await
    }

    async fn get_job_chain_by_id(
        &self,
        ctx: &StateContext,
        chain_id: Uuid,
    ) -> Result<Option<ChainSnapshot>, QueueError> {
        self.check("get_job_chain_by_id")?;
        self.inner.get_job_chain_by_id(ctx, chain_id).await
    }

    async fn get_job_blockers(
        &self,
        ctx: &StateContext,
        job_id: Uuid,
    ) -> Result<Vec<ChainSnapshot>, QueueError> {
        self.check("get_job_blockers")?;
        self.inner.get_job_blockers(ctx, job_id).await
    }

    async fn acquire_job(
        &self,
        ctx: &StateContext,
        type_names: &[String],
        worker_id: &str,
        lease_duration: Duration,
    ) -> Result<Option<AcquiredJob>, QueueError> {
        self.check("acquire_job")?;
        self.inner
            .acquire_job(ctx, type_names, worker_id, lease_duration)
            .await
    }

    async fn get_next_job_available_in(
        &self,
        ctx: &StateContext,
        type_names: &[String],
    ) -> Result<Option<Duration>, QueueError> {
        self.check("get_next_job_available_in")?;
        self.inner.get_next_job_available_in(ctx, type_names).await
    }

    async fn renew_job_lease(
        &self,
        ctx: &StateContext,
        job_id: Uuid,
        worker_id: &str,
        lease_duration: Duration,
    ) -> Result<Job, QueueError> {
        self.check("renew_job_lease")?;
        self.inner
            .renew_job_lease(ctx, job_id, worker_id, lease_duration)
            .await
    }

    async fn reschedule_job(
        &self,
        ctx: &StateContext,
        job_id: Uuid,
        schedule: Schedule,
        error: Option<String>,
    ) -> Result<Job, QueueError> {
        self.check("reschedule_job")?;
        self.inner.reschedule_job(ctx, job_id, schedule, error).await
    }

    async fn complete_job(
        &self,
        ctx: &StateContext,
        job_id: Uuid,
        output: Option<Value>,
        worker_id: Option<&str>,
    ) -> Result<Job, QueueError> {
        self.check("complete_job")?;
        self.inner.complete_job(ctx, job_id, output, worker_id).await
    }

    async fn remove_expired_job_lease(
        &self,
        ctx: &StateContext,
        type_names: &[String],
        ignored_job_ids: &[Uuid],
    ) -> Result<Option<ReapedJob>, QueueError> {
        self.check("remove_expired_job_lease")?;
        self.inner
            .remove_expired_job_lease(ctx, type_names, ignored_job_ids)
            .await
    }

    async fn get_external_blockers(
        &self,
        ctx: &StateContext,
        root_chain_ids: &[Uuid],
    ) -> Result<Vec<Job>, QueueError> {
        self.check("get_external_blockers")?;
        self.inner.get_external_blockers(ctx, root_chain_ids).await
    }

    async fn delete_jobs_by_root_chain_ids(
        &self,
        ctx: &StateContext,
        root_chain_ids: &[Uuid],
    ) -> Result<u64, QueueError> {
        self.check("delete_jobs_by_root_chain_ids")?;
        self.inner
            .delete_jobs_by_root_chain_ids(ctx, root_chain_ids)
            .await
    }

    async fn get_job_for_update(
        &self,
        ctx: &StateContext,
        job_id: Uuid,
    ) -> Result<Option<Job>, QueueError> {
        self.check("get_job_for_update")?;
        self.inner.get_job_for_update(ctx, job_id).await
    }

    async fn get_current_job_for_update(
        &self,
        ctx: &StateContext,
        chain_id: Uuid,
    ) -> Result<Option<Job>, QueueError> {
        self.check("get_current_job_for_update")?;
        self.inner.get_current_job_for_update(ctx, chain_id).await
    }

    async fn migrate_to_latest(&self) -> Result<(), QueueError> {
        self.check("migrate_to_latest")?;
        self.inner.migrate_to_latest().await
    }
}
