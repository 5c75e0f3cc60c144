//! Producer-facing queue operations.
//!
//! The [`Client`] bundles the adapters, registry, and event sink, and
//! exposes the chain operations: start a chain (optionally behind
//! blockers), complete a chain externally, delete chain trees, and run
//! code under a notify scope.
//!
//! # Transactions and notifications
//!
//! `start_job_chain` and `complete_job_chain` must run inside a state
//! transaction. [`Client::with_notify`] is the usual way to get one: it
//! opens a transaction plus a notify batch and flushes the batch after
//! commit, so no wake-up is ever observable before the state that caused
//! it.
//!
//! ```ignore
//! let chain = client
//!     .with_notify(|ctx| {
//!         let client = client.clone();
//!         async move {
//!             client
//!                 .start_job_chain(&ctx, StartJobChain::new("greet", json!({ "name": "World" })))
//!                 .await
//!         }
//!     })
//!     .await?;
//! let done = client
//!     .wait_for_job_chain_completion(chain.id, WaitOptions::new(Duration::from_secs(10)))
//!     .await?;
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use crate::batch::NotifyBatch;
use crate::context::QueueContext;
use crate::error::QueueError;
use crate::events::{EventSink, QueueEvent, TracingEventSink};
use crate::job::{Deduplication, Job, JobChain, JobOrigin, JobStatus, Schedule};
use crate::notify::NotifyAdapter;
use crate::registry::JobTypeRegistry;
use crate::state::{run_in_transaction, CreateJobRequest, StateAdapter};

/// Request to start a new job chain.
#[derive(Debug, Clone)]
pub struct StartJobChain {
    pub type_name: String,
    pub input: Value,
    pub schedule: Option<Schedule>,
    pub deduplication: Option<Deduplication>,
}

impl StartJobChain {
    pub fn new(type_name: impl Into<String>, input: Value) -> Self {
        Self {
            type_name: type_name.into(),
            input,
            schedule: None,
            deduplication: None,
        }
    }

    pub fn with_schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = Some(schedule);
        self
    }

    pub fn with_deduplication(mut self, deduplication: Deduplication) -> Self {
        self.deduplication = Some(deduplication);
        self
    }
}

/// Request to continue a chain with its next job.
#[derive(Debug, Clone)]
pub struct ContinueWith {
    pub type_name: String,
    pub input: Value,
    pub schedule: Option<Schedule>,
}

impl ContinueWith {
    pub fn new(type_name: impl Into<String>, input: Value) -> Self {
        Self {
            type_name: type_name.into(),
            input,
            schedule: None,
        }
    }

    pub fn with_schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = Some(schedule);
        self
    }
}

pub(crate) enum CompletionKind {
    Terminal(Value),
    Continuation(Job),
}

/// The one outcome of completing a job: either a terminal output or the
/// continuation job created through [`CompletionScope::continue_with`].
pub struct Completion {
    pub(crate) kind: CompletionKind,
}

impl Completion {
    /// Terminal completion with the given output.
    pub fn output(value: Value) -> Self {
        Self {
            kind: CompletionKind::Terminal(value),
        }
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            CompletionKind::Terminal(_) => f.write_str("Completion::Terminal"),
            CompletionKind::Continuation(job) => {
                write!(f, "Completion::Continuation({})", job.id)
            }
        }
    }
}

/// Handed to completion callbacks: the current job under row lock, plus the
/// only way to create a continuation.
pub struct CompletionScope {
    client: Client,
    ctx: QueueContext,
    job: Job,
    continued: Arc<AtomicBool>,
}

impl CompletionScope {
    pub(crate) fn new(client: Client, ctx: QueueContext, job: Job) -> Self {
        Self {
            client,
            ctx,
            job,
            continued: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The job being completed, as read under the row lock.
    pub fn job(&self) -> &Job {
        &self.job
    }

    /// The transactional context of this completion, for callers that need
    /// to write application state in the same unit of work.
    pub fn context(&self) -> &QueueContext {
        &self.ctx
    }

    /// Insert the continuation job for this chain. At most once per
    /// completion.
    pub async fn continue_with(&self, request: ContinueWith) -> Result<Completion, QueueError> {
        let job = self.create_continuation(request).await?;
        Ok(Completion {
            kind: CompletionKind::Continuation(job),
        })
    }

    /// Like [`continue_with`](Self::continue_with), but the continuation
    /// starts behind blocker chains created by `blockers`. The closure runs
    /// in a context whose origin is the continuation job.
    pub async fn continue_with_blockers<F, Fut>(
        &self,
        request: ContinueWith,
        blockers: F,
    ) -> Result<Completion, QueueError>
    where
        F: FnOnce(QueueContext) -> Fut + Send,
        Fut: Future<Output = Result<Vec<JobChain>, QueueError>> + Send,
    {
        let job = self.create_continuation(request).await?;
        let job = self
            .client
            .attach_blockers(&self.ctx, job, blockers)
            .await?;
        Ok(Completion {
            kind: CompletionKind::Continuation(job),
        })
    }

    async fn create_continuation(&self, request: ContinueWith) -> Result<Job, QueueError> {
        if self.continued.swap(true, Ordering::SeqCst) {
            return Err(QueueError::CompletionAlreadyRecorded {
                job_id: self.job.id,
            });
        }

        let registry = self.client.registry();
        registry.validate_continuation(&self.job.type_name, &request.type_name)?;
        registry.validate_input(&request.type_name, &request.input)?;

        let outcome = self
            .client
            .state()
            .create_job(
                self.ctx.state(),
                CreateJobRequest {
                    type_name: request.type_name,
                    chain_type_name: self.job.chain_type_name.clone(),
                    input: request.input,
                    chain_id: Some(self.job.chain_id),
                    root_chain_id: Some(self.job.root_chain_id),
                    origin_id: Some(self.job.id),
                    deduplication: None,
                    schedule: request.schedule,
                },
            )
            .await?;

        if !outcome.deduplicated {
            self.client.events().emit(QueueEvent::JobCreated {
                job_id: outcome.job.id,
                chain_id: outcome.job.chain_id,
                root_chain_id: outcome.job.root_chain_id,
                type_name: outcome.job.type_name.clone(),
                scheduled_at: outcome.job.scheduled_at,
                deduplicated: false,
            });
        }
        Ok(outcome.job)
    }
}

struct ClientInner {
    state: Arc<dyn StateAdapter>,
    notify: Arc<dyn NotifyAdapter>,
    registry: Arc<JobTypeRegistry>,
    events: Arc<dyn EventSink>,
}

/// Cheap-to-clone handle over the queue's collaborators.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub fn new(
        state: Arc<dyn StateAdapter>,
        notify: Arc<dyn NotifyAdapter>,
        registry: Arc<JobTypeRegistry>,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                state,
                notify,
                registry,
                events: Arc::new(TracingEventSink),
            }),
        }
    }

    /// Replace the event sink (the default logs through `tracing`).
    pub fn with_event_sink(self, events: Arc<dyn EventSink>) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                state: Arc::clone(&self.inner.state),
                notify: Arc::clone(&self.inner.notify),
                registry: Arc::clone(&self.inner.registry),
                events,
            }),
        }
    }

    pub fn state(&self) -> &Arc<dyn StateAdapter> {
        &self.inner.state
    }

    pub fn notify(&self) -> &Arc<dyn NotifyAdapter> {
        &self.inner.notify
    }

    pub fn registry(&self) -> &Arc<JobTypeRegistry> {
        &self.inner.registry
    }

    pub fn events(&self) -> &Arc<dyn EventSink> {
        &self.inner.events
    }

    /// Run `f` inside a transaction with a notify scope, flushing the
    /// buffered notifications after commit. Joins an outer transaction or
    /// scope instead of nesting when `f` is called from one.
    pub async fn with_notify<T, E, F, Fut>(&self, f: F) -> Result<T, E>
    where
        E: From<QueueError>,
        F: FnOnce(QueueContext) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let batch = Arc::new(NotifyBatch::new());
        let base = QueueContext::new().with_notify_batch(Arc::clone(&batch));
        let state = Arc::clone(&self.inner.state);
        let result =
            run_in_transaction(&*state, base.state(), |sc| f(base.join_transaction(sc))).await?;
        batch
            .flush(self.inner.notify.as_ref(), self.inner.events.as_ref())
            .await;
        Ok(result)
    }

    /// Start a new job chain. Must run inside a transaction.
    ///
    /// Outside a job context the type must be an entry type; inside one
    /// (a blocker scope) it must be a declared blocker of the originating
    /// type, and the new chain records its parent linkage.
    pub async fn start_job_chain(
        &self,
        ctx: &QueueContext,
        request: StartJobChain,
    ) -> Result<JobChain, QueueError> {
        self.start_job_chain_with_blockers(ctx, request, |_| async { Ok(Vec::new()) })
            .await
    }

    /// Start a job chain that may not run before the blocker chains
    /// returned by `blockers` are terminal. The closure runs in a context
    /// whose origin is the new job, so chains it starts record their
    /// parentage; it may also return pre-existing chains to fan in on.
    pub async fn start_job_chain_with_blockers<F, Fut>(
        &self,
        ctx: &QueueContext,
        request: StartJobChain,
        blockers: F,
    ) -> Result<JobChain, QueueError>
    where
        F: FnOnce(QueueContext) -> Fut + Send,
        Fut: Future<Output = Result<Vec<JobChain>, QueueError>> + Send,
    {
        ctx.state().require_transaction("start_job_chain")?;

        let registry = self.registry();
        match ctx.origin() {
            None => {
                registry.validate_entry(&request.type_name)?;
            }
            Some(origin) => {
                registry.validate_blocker(&origin.type_name, &request.type_name)?;
            }
        }
        registry.validate_input(&request.type_name, &request.input)?;

        let outcome = self
            .state()
            .create_job(
                ctx.state(),
                CreateJobRequest {
                    type_name: request.type_name.clone(),
                    chain_type_name: request.type_name.clone(),
                    input: request.input,
                    chain_id: None,
                    root_chain_id: ctx.origin().map(|o| o.root_chain_id),
                    origin_id: ctx.origin().map(|o| o.origin_id),
                    deduplication: request.deduplication,
                    schedule: request.schedule,
                },
            )
            .await?;
        let job = outcome.job;

        if outcome.deduplicated {
            return Ok(JobChain {
                id: job.chain_id,
                type_name: job.type_name,
                input: job.input,
                deduplicated: true,
            });
        }

        self.events().emit(QueueEvent::JobCreated {
            job_id: job.id,
            chain_id: job.chain_id,
            root_chain_id: job.root_chain_id,
            type_name: job.type_name.clone(),
            scheduled_at: job.scheduled_at,
            deduplicated: false,
        });
        self.events().emit(QueueEvent::JobChainCreated {
            chain_id: job.chain_id,
            type_name: job.type_name.clone(),
        });

        let job = self.attach_blockers(ctx, job, blockers).await?;

        if job.status == JobStatus::Pending {
            self.buffer_job_scheduled(ctx, &job.type_name, "start_job_chain");
        }

        Ok(JobChain {
            id: job.chain_id,
            type_name: job.type_name,
            input: job.input,
            deduplicated: false,
        })
    }

    /// Run the blockers closure in the job's origin scope and record the
    /// resulting edges. Returns the job re-read after the edges were added.
    pub(crate) async fn attach_blockers<F, Fut>(
        &self,
        ctx: &QueueContext,
        job: Job,
        blockers: F,
    ) -> Result<Job, QueueError>
    where
        F: FnOnce(QueueContext) -> Fut + Send,
        Fut: Future<Output = Result<Vec<JobChain>, QueueError>> + Send,
    {
        let scope = ctx.with_origin(JobOrigin::of(&job));
        let chains = blockers(scope).await?;
        if chains.is_empty() {
            return Ok(job);
        }

        for chain in &chains {
            self.registry()
                .validate_blocker(&job.type_name, &chain.type_name)?;
        }

        let chain_ids: Vec<Uuid> = chains.iter().map(|c| c.id).collect();
        let outcome = self
            .state()
            .add_job_blockers(ctx.state(), job.id, &chain_ids)
            .await?;

        if !outcome.incomplete_blocker_chain_ids.is_empty() {
            self.events().emit(QueueEvent::JobBlocked {
                job_id: outcome.job.id,
                type_name: outcome.job.type_name.clone(),
                blocked_by_chain_ids: outcome.incomplete_blocker_chain_ids,
            });
        }
        Ok(outcome.job)
    }

    /// Complete the current job of a chain from outside a worker.
    ///
    /// Loads the chain's latest job under a row lock, refuses if it is
    /// already completed, runs `complete`, and records either the terminal
    /// output or the continuation it produced. `completed_by` stays `None`.
    /// A running job completed this way has its leasing worker notified
    /// through the ownership-lost channel.
    pub async fn complete_job_chain<F, Fut>(
        &self,
        ctx: &QueueContext,
        chain_id: Uuid,
        type_name: &str,
        complete: F,
    ) -> Result<Job, QueueError>
    where
        F: FnOnce(CompletionScope) -> Fut + Send,
        Fut: Future<Output = Result<Completion, QueueError>> + Send,
    {
        ctx.state().require_transaction("complete_job_chain")?;

        let current = self
            .state()
            .get_current_job_for_update(ctx.state(), chain_id)
            .await?
            .ok_or(QueueError::ChainNotFound { chain_id })?;

        if current.chain_type_name != type_name {
            return Err(QueueError::ChainTypeMismatch {
                chain_id,
                expected: type_name.to_string(),
                actual: current.chain_type_name,
            });
        }
        if current.is_completed() {
            return Err(QueueError::JobAlreadyCompleted { job_id: current.id });
        }
        let was_running = current.status == JobStatus::Running;

        let scope = CompletionScope::new(self.clone(), ctx.clone(), current.clone());
        let completion = complete(scope).await?;
        let (job, _terminal) = self.apply_completion(ctx, &current, completion, None).await?;

        if was_running {
            self.buffer_ownership_lost(ctx, current.id, "complete_job_chain");
        }
        Ok(job)
    }

    /// Record a completion: the terminal write plus its cascade, or the
    /// predecessor's completion next to an already-created continuation.
    /// Returns the completed row and whether the chain is now terminal.
    pub(crate) async fn apply_completion(
        &self,
        ctx: &QueueContext,
        current: &Job,
        completion: Completion,
        worker_id: Option<&str>,
    ) -> Result<(Job, bool), QueueError> {
        match completion.kind {
            CompletionKind::Terminal(output) => {
                self.registry()
                    .validate_output(&current.type_name, &output)?;

                let job = self
                    .state()
                    .complete_job(ctx.state(), current.id, Some(output), worker_id)
                    .await?;

                let unblocked = self
                    .state()
                    .schedule_blocked_jobs(ctx.state(), current.chain_id)
                    .await?;
                for released in &unblocked {
                    self.events().emit(QueueEvent::JobUnblocked {
                        job_id: released.id,
                        type_name: released.type_name.clone(),
                        scheduled_at: released.scheduled_at,
                    });
                    self.buffer_job_scheduled(ctx, &released.type_name, "schedule_blocked_jobs");
                }

                self.buffer_chain_completed(ctx, current.chain_id, "complete_job");
                self.events().emit(QueueEvent::JobCompleted {
                    job_id: job.id,
                    chain_id: job.chain_id,
                    type_name: job.type_name.clone(),
                    completed_by: job.completed_by.clone(),
                });
                self.events().emit(QueueEvent::JobChainCompleted {
                    chain_id: job.chain_id,
                    chain_type_name: job.chain_type_name.clone(),
                });
                Ok((job, true))
            }
            CompletionKind::Continuation(next) => {
                let job = self
                    .state()
                    .complete_job(ctx.state(), current.id, None, worker_id)
                    .await?;

                if next.status == JobStatus::Pending {
                    self.buffer_job_scheduled(ctx, &next.type_name, "continue_with");
                }
                self.events().emit(QueueEvent::JobCompleted {
                    job_id: job.id,
                    chain_id: job.chain_id,
                    type_name: job.type_name.clone(),
                    completed_by: job.completed_by.clone(),
                });
                Ok((job, false))
            }
        }
    }

    /// Delete whole chain trees by their root chain ids.
    ///
    /// Refused while any job outside the trees still blocks on a chain
    /// inside them.
    pub async fn delete_job_chains(
        &self,
        ctx: &QueueContext,
        root_chain_ids: &[Uuid],
    ) -> Result<u64, QueueError> {
        ctx.state().require_transaction("delete_job_chains")?;

        let external = self
            .state()
            .get_external_blockers(ctx.state(), root_chain_ids)
            .await?;
        if !external.is_empty() {
            return Err(QueueError::ChainExternallyBlocked {
                job_ids: external.into_iter().map(|j| j.id).collect(),
            });
        }

        let deleted = self
            .state()
            .delete_jobs_by_root_chain_ids(ctx.state(), root_chain_ids)
            .await?;
        self.events().emit(QueueEvent::JobChainDeleted {
            root_chain_ids: root_chain_ids.to_vec(),
            deleted,
        });
        Ok(deleted)
    }

    pub(crate) fn buffer_job_scheduled(
        &self,
        ctx: &QueueContext,
        type_name: &str,
        operation: &'static str,
    ) {
        match ctx.notify_batch() {
            Some(batch) => batch.job_scheduled(type_name),
            None => self.emit_notify_absence(operation),
        }
    }

    pub(crate) fn buffer_chain_completed(
        &self,
        ctx: &QueueContext,
        chain_id: Uuid,
        operation: &'static str,
    ) {
        match ctx.notify_batch() {
            Some(batch) => batch.job_chain_completed(chain_id),
            None => self.emit_notify_absence(operation),
        }
    }

    pub(crate) fn buffer_ownership_lost(
        &self,
        ctx: &QueueContext,
        job_id: Uuid,
        operation: &'static str,
    ) {
        match ctx.notify_batch() {
            Some(batch) => batch.job_ownership_lost(job_id),
            None => self.emit_notify_absence(operation),
        }
    }

    fn emit_notify_absence(&self, operation: &'static str) {
        self.events().emit(QueueEvent::NotifyContextAbsence {
            operation: operation.to_string(),
        });
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("registered_types", &self.inner.registry.len())
            .finish()
    }
}
