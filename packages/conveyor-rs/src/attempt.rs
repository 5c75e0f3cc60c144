//! One attempt of one job.
//!
//! The [`AttemptRunner`] owns the lifecycle: take the lease, keep renewing
//! it in the background, run the handler through the middleware chain, then
//! record exactly one outcome: a completion (terminal output or
//! continuation) committed through [`AttemptContext::complete`], or a
//! reschedule with backoff.
//!
//! # Prepare / complete
//!
//! Handlers that need their own writes alongside the completion choose a
//! transactional shape with [`AttemptContext::prepare`]:
//!
//! - **atomic**: the prepare transaction stays open and `complete` commits
//!   both the handler's writes and the completion as one unit.
//! - **staged**: prepare commits on its own, the handler may do external
//!   I/O, and `complete` runs in a fresh transaction.
//!
//! Not calling `prepare` is staged with an empty prepare phase.
//!
//! # Ownership loss
//!
//! The lease renewer re-reads the job under a row lock before renewing. If
//! the job completed elsewhere or the lease moved to another worker, the
//! attempt is cancelled with the matching reason and exits without
//! rescheduling; `complete` re-checks the same conditions inside its
//! transaction, so a handler that races the loss cannot commit.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::backoff::{backoff_delay, RetryConfig};
use crate::client::{Client, Completion, CompletionScope};
use crate::context::QueueContext;
use crate::error::{AttemptError, QueueError};
use crate::events::QueueEvent;
use crate::job::{Job, Schedule};
use crate::middleware::{AttemptMiddleware, Next};
use crate::state::{run_in_transaction, StateContext};
use crate::time::{AttemptSignal, CancelReason};
use crate::worker::LeaseConfig;

/// Transactional shape of an attempt's prepare phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepareMode {
    /// Prepare and complete commit as one transaction.
    Atomic,
    /// Prepare commits first; complete opens a fresh transaction.
    Staged,
}

/// A blocker chain as seen by the handler: terminal by the time the job
/// runs, with its output resolved.
#[derive(Debug, Clone)]
pub struct ResolvedBlocker {
    pub chain_id: Uuid,
    pub chain_type_name: String,
    pub output: Option<Value>,
}

/// Immutable view of the job an attempt is running, including its resolved
/// blockers in declaration order.
#[derive(Debug, Clone)]
pub struct JobSnapshot {
    pub job: Job,
    pub blockers: Vec<ResolvedBlocker>,
}

enum AttemptPhase {
    Idle,
    Prepared {
        /// Open transaction of an atomic prepare; `None` after staged.
        transaction: Option<crate::state::TransactionToken>,
        batch: Option<Arc<crate::batch::NotifyBatch>>,
    },
    Completed {
        job: Job,
        terminal: bool,
    },
}

struct AttemptInner {
    client: Client,
    snapshot: JobSnapshot,
    worker_id: String,
    signal: AttemptSignal,
    phase: tokio::sync::Mutex<AttemptPhase>,
}

/// Context handed to job handlers.
#[derive(Clone)]
pub struct AttemptContext {
    inner: Arc<AttemptInner>,
}

impl AttemptContext {
    fn new(client: Client, snapshot: JobSnapshot, worker_id: String, signal: AttemptSignal) -> Self {
        Self {
            inner: Arc::new(AttemptInner {
                client,
                snapshot,
                worker_id,
                signal,
                phase: tokio::sync::Mutex::new(AttemptPhase::Idle),
            }),
        }
    }

    #[cfg(test)]
    pub(crate) fn for_testing(
        client: Client,
        job: Job,
        worker_id: String,
        signal: AttemptSignal,
    ) -> Self {
        Self::new(
            client,
            JobSnapshot {
                job,
                blockers: Vec::new(),
            },
            worker_id,
            signal,
        )
    }

    /// The job being attempted (read-only snapshot).
    pub fn job(&self) -> &Job {
        &self.inner.snapshot.job
    }

    /// The full snapshot including resolved blockers.
    pub fn snapshot(&self) -> &JobSnapshot {
        &self.inner.snapshot
    }

    /// Resolved blocker chains, in declaration order.
    pub fn blockers(&self) -> &[ResolvedBlocker] {
        &self.inner.snapshot.blockers
    }

    pub fn worker_id(&self) -> &str {
        &self.inner.worker_id
    }

    /// Typed cancellation signal; fires on worker shutdown or ownership
    /// loss. Handlers should return promptly once it is set.
    pub fn signal(&self) -> &AttemptSignal {
        &self.inner.signal
    }

    pub fn client(&self) -> &Client {
        &self.inner.client
    }

    /// Open the attempt's prepare phase. At most once per attempt.
    pub async fn prepare<T, F, Fut>(&self, mode: PrepareMode, f: F) -> Result<T, AttemptError>
    where
        F: FnOnce(QueueContext) -> Fut + Send,
        Fut: Future<Output = Result<T, AttemptError>> + Send,
    {
        let mut phase = self.inner.phase.lock().await;
        if !matches!(*phase, AttemptPhase::Idle) {
            return Err(QueueError::PrepareAlreadyCalled {
                job_id: self.job().id,
            }
            .into());
        }

        let client = &self.inner.client;
        let batch = Arc::new(crate::batch::NotifyBatch::new());

        match mode {
            PrepareMode::Atomic => {
                let token = client.state().begin().await?;
                let ctx = QueueContext::new()
                    .join_transaction(StateContext::with_transaction(token))
                    .with_notify_batch(Arc::clone(&batch));
                match f(ctx).await {
                    Ok(value) => {
                        *phase = AttemptPhase::Prepared {
                            transaction: Some(token),
                            batch: Some(batch),
                        };
                        Ok(value)
                    }
                    Err(err) => {
                        if let Err(rollback_err) = client.state().rollback(token).await {
                            tracing::warn!(error = %rollback_err, "prepare rollback failed");
                        }
                        Err(err)
                    }
                }
            }
            PrepareMode::Staged => {
                let base = QueueContext::new().with_notify_batch(Arc::clone(&batch));
                let result =
                    run_in_transaction(&**client.state(), base.state(), |sc| {
                        f(base.join_transaction(sc))
                    })
                    .await?;
                batch
                    .flush(client.notify().as_ref(), client.events().as_ref())
                    .await;
                *phase = AttemptPhase::Prepared {
                    transaction: None,
                    batch: None,
                };
                Ok(result)
            }
        }
    }

    /// Record the attempt's one completion.
    ///
    /// Re-reads the job under a row lock and refuses when it was completed
    /// elsewhere or the lease moved; `f` then returns either
    /// [`Completion::output`] or the continuation created through the
    /// scope. Commits (joining an atomic prepare transaction when one is
    /// open) and flushes the buffered notifications.
    pub async fn complete<F, Fut>(&self, f: F) -> Result<Job, AttemptError>
    where
        F: FnOnce(CompletionScope) -> Fut + Send,
        Fut: Future<Output = Result<Completion, AttemptError>> + Send,
    {
        let mut phase = self.inner.phase.lock().await;
        if let AttemptPhase::Completed { job, .. } = &*phase {
            return Err(QueueError::CompletionAlreadyRecorded { job_id: job.id }.into());
        }

        let client = &self.inner.client;
        let state = client.state();

        let (token, batch) = match std::mem::replace(&mut *phase, AttemptPhase::Idle) {
            AttemptPhase::Prepared {
                transaction: Some(token),
                batch,
            } => (
                token,
                batch.unwrap_or_else(|| Arc::new(crate::batch::NotifyBatch::new())),
            ),
            _ => (
                state.begin().await?,
                Arc::new(crate::batch::NotifyBatch::new()),
            ),
        };

        let ctx = QueueContext::new()
            .join_transaction(StateContext::with_transaction(token))
            .with_notify_batch(Arc::clone(&batch));

        let job_id = self.job().id;
        let result: Result<(Job, bool), AttemptError> = async {
            let current = state
                .get_job_for_update(ctx.state(), job_id)
                .await?
                .ok_or(QueueError::JobNotFound { job_id })?;
            if current.is_completed() {
                return Err(QueueError::JobAlreadyCompleted { job_id }.into());
            }
            if !current.is_leased_by(&self.inner.worker_id) {
                return Err(QueueError::JobTakenByAnotherWorker {
                    job_id,
                    leased_by: current.leased_by.clone(),
                }
                .into());
            }

            let scope = CompletionScope::new(client.clone(), ctx.clone(), current.clone());
            let completion = f(scope).await?;
            let done = client
                .apply_completion(&ctx, &current, completion, Some(&self.inner.worker_id))
                .await?;
            Ok(done)
        }
        .await;

        match result {
            Ok((job, terminal)) => {
                state.commit(token).await?;
                batch
                    .flush(client.notify().as_ref(), client.events().as_ref())
                    .await;
                *phase = AttemptPhase::Completed {
                    job: job.clone(),
                    terminal,
                };
                Ok(job)
            }
            Err(err) => {
                if let Err(rollback_err) = state.rollback(token).await {
                    tracing::warn!(error = %rollback_err, "completion rollback failed");
                }
                Err(err)
            }
        }
    }

    /// The committed completion of this attempt, if any.
    pub(crate) async fn take_completion(&self) -> Option<(Job, bool)> {
        let phase = self.inner.phase.lock().await;
        match &*phase {
            AttemptPhase::Completed { job, terminal } => Some((job.clone(), *terminal)),
            _ => None,
        }
    }

    /// Roll back a dangling atomic prepare transaction. No-op otherwise.
    pub(crate) async fn abandon(&self) {
        let mut phase = self.inner.phase.lock().await;
        if matches!(
            &*phase,
            AttemptPhase::Prepared {
                transaction: Some(_),
                ..
            }
        ) {
            if let AttemptPhase::Prepared {
                transaction: Some(token),
                ..
            } = std::mem::replace(&mut *phase, AttemptPhase::Idle)
            {
                if let Err(err) = self.inner.client.state().rollback(token).await {
                    tracing::warn!(error = %err, "abandoned prepare rollback failed");
                }
            }
        }
    }
}

impl std::fmt::Debug for AttemptContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttemptContext")
            .field("job_id", &self.inner.snapshot.job.id)
            .field("worker_id", &self.inner.worker_id)
            .finish()
    }
}

/// Processes one attempt of a job.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn run(&self, ctx: &AttemptContext) -> Result<(), AttemptError>;
}

/// [`JobHandler`] from an async closure.
pub struct FnJobHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> JobHandler for FnJobHandler<F>
where
    F: Fn(AttemptContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), AttemptError>> + Send + 'static,
{
    async fn run(&self, ctx: &AttemptContext) -> Result<(), AttemptError> {
        (self.f)(ctx.clone()).await
    }
}

/// Wrap an async closure as a [`JobHandler`].
pub fn handler_fn<F, Fut>(f: F) -> FnJobHandler<F>
where
    F: Fn(AttemptContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), AttemptError>> + Send + 'static,
{
    FnJobHandler { f }
}

/// Runs one acquired job to its outcome. Spawned detached by the worker's
/// dispatch loop.
pub(crate) struct AttemptRunner {
    pub(crate) client: Client,
    pub(crate) job: Job,
    pub(crate) worker_id: String,
    pub(crate) lease: LeaseConfig,
    pub(crate) retry: RetryConfig,
    pub(crate) middlewares: Arc<Vec<Arc<dyn AttemptMiddleware>>>,
    pub(crate) handler: Arc<dyn JobHandler>,
    pub(crate) signal: AttemptSignal,
}

impl AttemptRunner {
    pub(crate) async fn run(self) {
        let client = &self.client;
        let events = client.events();
        let state = client.state();
        let detached = StateContext::detached();
        let started = std::time::Instant::now();

        events.emit(QueueEvent::JobAttemptStarted {
            job_id: self.job.id,
            chain_id: self.job.chain_id,
            type_name: self.job.type_name.clone(),
            worker_id: self.worker_id.clone(),
            attempt: self.job.attempt,
        });

        // Take ownership before anything else.
        if let Err(err) = state
            .renew_job_lease(&detached, self.job.id, &self.worker_id, self.lease.lease)
            .await
        {
            if err.is_ownership_loss() {
                tracing::debug!(job_id = %self.job.id, error = %err, "job no longer ours before first renewal");
            } else {
                events.emit(QueueEvent::StateAdapterError {
                    operation: "renew_job_lease".to_string(),
                    detail: err.to_string(),
                });
            }
            return;
        }

        let blockers = match state.get_job_blockers(&detached, self.job.id).await {
            Ok(chains) => chains
                .into_iter()
                .map(|chain| ResolvedBlocker {
                    chain_id: chain.chain_id(),
                    chain_type_name: chain.root.chain_type_name.clone(),
                    output: chain.latest.output.clone(),
                })
                .collect(),
            Err(err) => {
                self.handle_failure(AttemptError::Queue(err)).await;
                return;
            }
        };

        // Ownership-lost notifications make the renewer re-check early.
        let ownership_wake = Arc::new(Notify::new());
        let _ownership_sub = {
            let wake = Arc::clone(&ownership_wake);
            client
                .notify()
                .listen_job_ownership_lost(
                    self.job.id,
                    Arc::new(move |_| {
                        wake.notify_one();
                    }),
                )
                .await
                .ok()
        };

        let renew_stop = CancellationToken::new();
        let renewer = tokio::spawn(renew_lease_loop(
            client.clone(),
            self.job.clone(),
            self.worker_id.clone(),
            self.lease.clone(),
            self.signal.clone(),
            Arc::clone(&ownership_wake),
            renew_stop.clone(),
        ));

        let ctx = AttemptContext::new(
            client.clone(),
            JobSnapshot {
                job: self.job.clone(),
                blockers,
            },
            self.worker_id.clone(),
            self.signal.clone(),
        );

        let result = Next::new(&self.middlewares, &*self.handler).run(&ctx).await;

        let completion = ctx.take_completion().await;
        ctx.abandon().await;

        renew_stop.cancel();
        let _ = renewer.await;

        match (result, completion) {
            (handler_result, Some((_, terminal))) => {
                if let Err(err) = handler_result {
                    tracing::warn!(
                        job_id = %self.job.id,
                        error = %err,
                        "handler failed after recording its completion"
                    );
                }
                events.emit(QueueEvent::JobAttemptCompleted {
                    job_id: self.job.id,
                    type_name: self.job.type_name.clone(),
                    worker_id: self.worker_id.clone(),
                    attempt: self.job.attempt,
                    terminal,
                    duration_ms: started.elapsed().as_millis() as u64,
                });
            }
            (result, None) => {
                // An attempt that lost ownership exits without touching the
                // job again, whatever the handler returned.
                if matches!(
                    self.signal.reason(),
                    Some(CancelReason::TakenByAnotherWorker | CancelReason::AlreadyCompleted)
                ) {
                    tracing::debug!(
                        job_id = %self.job.id,
                        reason = ?self.signal.reason(),
                        "attempt exits after ownership loss"
                    );
                    return;
                }
                match result {
                    Ok(()) => {
                        self.handle_failure(AttemptError::Other(anyhow::anyhow!(
                            "handler finished without recording a completion"
                        )))
                        .await;
                    }
                    Err(err) => self.handle_failure(err).await,
                }
            }
        }
    }

    async fn handle_failure(&self, err: AttemptError) {
        let events = self.client.events();

        if err.is_ownership_loss() {
            // The job is no longer ours; someone else is responsible now.
            if let AttemptError::Queue(QueueError::JobTakenByAnotherWorker {
                leased_by, ..
            }) = &err
            {
                if self.signal.reason().is_none() {
                    events.emit(QueueEvent::JobTakenByAnotherWorker {
                        job_id: self.job.id,
                        type_name: self.job.type_name.clone(),
                        worker_id: self.worker_id.clone(),
                        leased_by: leased_by.clone(),
                    });
                }
            }
            tracing::debug!(job_id = %self.job.id, error = %err, "attempt exits without reschedule");
            return;
        }

        let (schedule, detail) = match err {
            AttemptError::Reschedule { schedule, reason } => {
                (schedule, reason.unwrap_or_else(|| "rescheduled by handler".to_string()))
            }
            other => (
                Schedule::After(backoff_delay(self.job.attempt, &self.retry)),
                other.to_string(),
            ),
        };

        let client = self.client.clone();
        let job_id = self.job.id;
        let worker_id = self.worker_id.clone();
        let error_text = detail.clone();
        let rescheduled: Result<Job, QueueError> = client
            .clone()
            .with_notify(move |ctx| async move {
                // Guard against a reaped-and-reacquired job: only the lease
                // holder may put it back to pending.
                let current = client
                    .state()
                    .get_job_for_update(ctx.state(), job_id)
                    .await?
                    .ok_or(QueueError::JobNotFound { job_id })?;
                if current.is_completed() {
                    return Err(QueueError::JobAlreadyCompleted { job_id });
                }
                if !current.is_leased_by(&worker_id) {
                    return Err(QueueError::JobTakenByAnotherWorker {
                        job_id,
                        leased_by: current.leased_by,
                    });
                }
                let job = client
                    .state()
                    .reschedule_job(ctx.state(), job_id, schedule, Some(error_text))
                    .await?;
                client.buffer_job_scheduled(&ctx, &job.type_name, "reschedule_job");
                Ok(job)
            })
            .await;

        match rescheduled {
            Ok(job) => {
                events.emit(QueueEvent::JobAttemptFailed {
                    job_id: job.id,
                    type_name: job.type_name.clone(),
                    worker_id: self.worker_id.clone(),
                    attempt: self.job.attempt,
                    error: detail,
                    retry_at: job.scheduled_at,
                });
            }
            Err(err) if err.is_ownership_loss() => {
                tracing::debug!(job_id = %self.job.id, error = %err, "job moved on while rescheduling");
            }
            Err(err) => {
                events.emit(QueueEvent::StateAdapterError {
                    operation: "reschedule_job".to_string(),
                    detail: err.to_string(),
                });
            }
        }
    }
}

/// Background lease renewal for one attempt.
///
/// Re-reads the job under a row lock each round: completion elsewhere or a
/// reassigned lease cancels the attempt with the matching reason; otherwise
/// the lease is extended. Transient faults back off with jitter, bounded by
/// the renew interval.
async fn renew_lease_loop(
    client: Client,
    job: Job,
    worker_id: String,
    lease: LeaseConfig,
    signal: AttemptSignal,
    wake: Arc<Notify>,
    stop: CancellationToken,
) {
    let state = client.state();
    let events = client.events();
    let mut consecutive_errors: u32 = 0;

    loop {
        let delay = if consecutive_errors == 0 {
            lease.renew_interval
        } else {
            let base = Duration::from_millis(250)
                .mul_f64(2f64.powi(consecutive_errors.min(6) as i32));
            base.min(lease.renew_interval)
                .mul_f64(0.5 + fastrand::f64() / 2.0)
        };

        tokio::select! {
            _ = stop.cancelled() => return,
            _ = signal.cancelled() => return,
            _ = wake.notified() => {}
            _ = tokio::time::sleep(delay) => {}
        }

        let worker = worker_id.clone();
        let state_handle = Arc::clone(state);
        let lease_duration = lease.lease;
        let job_id = job.id;
        let check = run_in_transaction(
            &**state,
            &StateContext::detached(),
            |sc| async move {
                let current = state_handle
                    .get_job_for_update(&sc, job_id)
                    .await?
                    .ok_or(QueueError::JobNotFound { job_id })?;
                if current.is_completed() {
                    return Err(QueueError::JobAlreadyCompleted { job_id });
                }
                if !current.is_leased_by(&worker) {
                    return Err(QueueError::JobTakenByAnotherWorker {
                        job_id,
                        leased_by: current.leased_by,
                    });
                }
                state_handle
                    .renew_job_lease(&sc, job_id, &worker, lease_duration)
                    .await
            },
        )
        .await;

        match check {
            Ok(_) => {
                consecutive_errors = 0;
            }
            Err(QueueError::JobAlreadyCompleted { .. }) => {
                signal.cancel(CancelReason::AlreadyCompleted);
                return;
            }
            Err(QueueError::JobTakenByAnotherWorker { leased_by, .. }) => {
                events.emit(QueueEvent::JobTakenByAnotherWorker {
                    job_id: job.id,
                    type_name: job.type_name.clone(),
                    worker_id: worker_id.clone(),
                    leased_by,
                });
                signal.cancel(CancelReason::TakenByAnotherWorker);
                return;
            }
            Err(QueueError::JobNotFound { .. }) => {
                signal.cancel(CancelReason::TakenByAnotherWorker);
                return;
            }
            Err(err) => {
                consecutive_errors += 1;
                tracing::warn!(
                    job_id = %job.id,
                    error = %err,
                    consecutive_errors,
                    "lease renewal failed"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{Completion, ContinueWith, StartJobChain};
    use crate::job::JobStatus;
    use crate::memory::MemoryStateAdapter;
    use crate::notify::NoopNotifyAdapter;
    use crate::registry::{JobTypeRegistry, JobTypeSpec};
    use crate::state::StateAdapter;

    struct Fixture {
        client: Client,
        state: Arc<MemoryStateAdapter>,
    }

    fn fixture() -> Fixture {
        let state = Arc::new(MemoryStateAdapter::new());
        let registry = JobTypeRegistry::new()
            .with(JobTypeSpec::entry("work").with_continuations(["work:next"]))
            .with(JobTypeSpec::internal("work:next"));
        let client = Client::new(
            Arc::clone(&state) as Arc<dyn StateAdapter>,
            Arc::new(NoopNotifyAdapter),
            Arc::new(registry),
        );
        Fixture { client, state }
    }

    /// Start a chain and acquire its first job as `worker_id`.
    async fn acquired_context(f: &Fixture, worker_id: &str) -> AttemptContext {
        let client = f.client.clone();
        client
            .clone()
            .with_notify(move |ctx| async move {
                client
                    .start_job_chain(&ctx, StartJobChain::new("work", serde_json::json!({})))
                    .await
            })
            .await
            .unwrap();

        let acquired = f
            .state
            .acquire_job(
                &StateContext::detached(),
                &["work".to_string()],
                worker_id,
                Duration::from_secs(60),
            )
            .await
            .unwrap()
            .unwrap();

        AttemptContext::for_testing(
            f.client.clone(),
            acquired.job,
            worker_id.to_string(),
            AttemptSignal::new(),
        )
    }

    #[tokio::test]
    async fn complete_with_terminal_output() {
        let f = fixture();
        let ctx = acquired_context(&f, "w1").await;

        let job = ctx
            .complete(|_scope| async move {
                Ok(Completion::output(serde_json::json!({"done": true})))
            })
            .await
            .unwrap();

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.completed_by.as_deref(), Some("w1"));
        assert_eq!(job.output, Some(serde_json::json!({"done": true})));
    }

    #[tokio::test]
    async fn complete_twice_is_refused() {
        let f = fixture();
        let ctx = acquired_context(&f, "w1").await;

        ctx.complete(|_scope| async move { Ok(Completion::output(serde_json::json!({}))) })
            .await
            .unwrap();

        let err = ctx
            .complete(|_scope| async move { Ok(Completion::output(serde_json::json!({}))) })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AttemptError::Queue(QueueError::CompletionAlreadyRecorded { .. })
        ));
    }

    #[tokio::test]
    async fn complete_refuses_after_lease_loss() {
        let f = fixture();
        let ctx = acquired_context(&f, "w1").await;

        // Another worker steals the lease (reap + reacquire elsewhere).
        let job_id = ctx.job().id;
        {
            let state = Arc::clone(&f.state);
            run_in_transaction::<_, _, QueueError, _, _>(
                &*state,
                &StateContext::detached(),
                |sc| {
                    let state = Arc::clone(&f.state);
                    async move {
                        // Reap-and-reacquire as w2.
                        state
                            .reschedule_job(&sc, job_id, Schedule::After(Duration::ZERO), None)
                            .await?;
                        state
                            .acquire_job(&sc, &["work".to_string()], "w2", Duration::from_secs(60))
                            .await?;
                        Ok(())
                    }
                },
            )
            .await
            .unwrap();
        }

        let err = ctx
            .complete(|_scope| async move { Ok(Completion::output(serde_json::json!({}))) })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AttemptError::Queue(QueueError::JobTakenByAnotherWorker { .. })
        ));

        // Nothing committed for w1.
        let row = f
            .state
            .get_job_by_id(&StateContext::detached(), job_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, JobStatus::Running);
        assert_eq!(row.leased_by.as_deref(), Some("w2"));
    }

    #[tokio::test]
    async fn prepare_may_only_run_once() {
        let f = fixture();
        let ctx = acquired_context(&f, "w1").await;

        ctx.prepare(PrepareMode::Staged, |_| async move { Ok(()) })
            .await
            .unwrap();
        let err = ctx
            .prepare(PrepareMode::Staged, |_| async move { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AttemptError::Queue(QueueError::PrepareAlreadyCalled { .. })
        ));
    }

    #[tokio::test]
    async fn atomic_prepare_commits_with_completion() {
        let f = fixture();
        let ctx = acquired_context(&f, "w1").await;

        ctx.prepare(PrepareMode::Atomic, |_prep| async move { Ok(()) })
            .await
            .unwrap();
        let job = ctx
            .complete(|_scope| async move {
                Ok(Completion::output(serde_json::json!({"ok": true})))
            })
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn abandon_rolls_back_dangling_atomic_prepare() {
        let f = fixture();
        let ctx = acquired_context(&f, "w1").await;

        // An atomic prepare that creates no completion.
        ctx.prepare(PrepareMode::Atomic, |_prep| async move { Ok(()) })
            .await
            .unwrap();
        ctx.abandon().await;

        // The store lock was released: detached reads work again.
        let row = f
            .state
            .get_job_by_id(&StateContext::detached(), ctx.job().id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, JobStatus::Running);
    }

    #[tokio::test]
    async fn completion_continuation_through_scope() {
        let f = fixture();
        let ctx = acquired_context(&f, "w1").await;

        let job = ctx
            .complete(|scope| async move {
                scope
                    .continue_with(ContinueWith::new("work:next", serde_json::json!({"step": 2})))
                    .await
                    .map_err(AttemptError::from)
            })
            .await
            .unwrap();

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.output, None);

        let jobs = f.state.jobs_snapshot().await;
        assert_eq!(jobs.len(), 2);
        let next = jobs.iter().find(|j| j.type_name == "work:next").unwrap();
        assert_eq!(next.chain_id, job.chain_id);
        assert_eq!(next.origin_id, Some(job.id));
        assert_eq!(next.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn handler_fn_adapts_closures() {
        let f = fixture();
        let ctx = acquired_context(&f, "w1").await;

        let handler = handler_fn(|ctx: AttemptContext| async move {
            ctx.complete(|_scope| async move {
                Ok(Completion::output(serde_json::json!({"from": "closure"})))
            })
            .await?;
            Ok(())
        });
        handler.run(&ctx).await.unwrap();

        assert_eq!(
            ctx.take_completion().await.map(|(job, terminal)| (
                job.output,
                terminal
            )),
            Some((Some(serde_json::json!({"from": "closure"})), true))
        );
    }
}
