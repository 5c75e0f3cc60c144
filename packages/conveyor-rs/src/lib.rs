//! # Conveyor
//!
//! A durable, transactional job queue whose source of truth is a database
//! behind a pluggable state adapter. Producers enqueue typed jobs inside
//! their own transaction; workers process them asynchronously with
//! automatic retries, leasing, deduplication, fan-out/fan-in blockers, and
//! continuation chains that outlive process restarts.
//!
//! ## Core concepts
//!
//! - **Job**: one durable unit of work; the only persistent entity.
//! - **Chain**: a sequence of jobs sharing a `chain_id`, advanced by
//!   inserting a *continuation* in the same transaction that completes its
//!   predecessor. At most one non-completed job per chain.
//! - **Blocker**: an edge declaring that a job cannot run until another
//!   chain is terminal; the fan-in primitive.
//! - **Lease**: a worker's temporary exclusive claim on a running job,
//!   renewed in the background and reaped by other workers on expiry.
//! - **Terminal**: a chain whose latest job completed without creating a
//!   continuation.
//!
//! ## Architecture
//!
//! ```text
//! Producer                              Worker
//!    │ with_notify                         │ dispatch loop
//!    ▼                                     ▼
//! Client.start_job_chain()            acquire_job() ──► AttemptRunner
//!    │                                     ▲               │ renew lease
//!    ▼ create_job / add_job_blockers       │               ▼
//! StateAdapter ◄────────────────────────────────────── complete / continue
//!    │ commit                                              │ commit
//!    ▼                                                     ▼
//! NotifyBatch.flush() ──► NotifyAdapter ──► job-scheduled / chain-completed
//!                                           / ownership-lost wake-ups
//! ```
//!
//! Notifications are best-effort accelerators; every consumer also polls,
//! so a lost message costs latency, never correctness.
//!
//! ## Guarantees
//!
//! - **Exactly-once completion** per job: the completing transaction
//!   re-reads the row under lock and refuses when the job completed
//!   elsewhere or the lease moved.
//! - **At-least-once attempts**: a crashed worker's lease expires and the
//!   job is reaped back to pending.
//! - **Commit-ordered chains**: a continuation exists only once its
//!   predecessor's completion committed, in the same transaction.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use conveyor::{
//!     handler_fn, AttemptContext, Client, Completion, JobTypeRegistry, JobTypeSpec,
//!     MemoryStateAdapter, InProcessNotifyAdapter, Processor, StartJobChain, WaitOptions,
//!     Worker, WorkerConfig,
//! };
//!
//! let registry = JobTypeRegistry::new().with(JobTypeSpec::entry("greet"));
//! let client = Client::new(
//!     Arc::new(MemoryStateAdapter::new()),
//!     Arc::new(InProcessNotifyAdapter::new()),
//!     Arc::new(registry),
//! );
//!
//! let worker = Worker::new(client.clone(), WorkerConfig::with_worker_id("worker-1"))
//!     .register("greet", Processor::new(handler_fn(|ctx: AttemptContext| async move {
//!         let name = ctx.job().input["name"].as_str().unwrap_or("world").to_string();
//!         ctx.complete(|_scope| async move {
//!             Ok(Completion::output(serde_json::json!({
//!                 "greeting": format!("Hello, {name}!")
//!             })))
//!         })
//!         .await?;
//!         Ok(())
//!     })));
//! worker.start();
//!
//! let chain = client
//!     .with_notify(|ctx| {
//!         let client = client.clone();
//!         async move {
//!             client
//!                 .start_job_chain(
//!                     &ctx,
//!                     StartJobChain::new("greet", serde_json::json!({ "name": "World" })),
//!                 )
//!                 .await
//!         }
//!     })
//!     .await?;
//!
//! let done = client
//!     .wait_for_job_chain_completion(chain.id, WaitOptions::new(Duration::from_secs(10)))
//!     .await?;
//! ```

// Core modules
mod attempt;
mod backoff;
mod batch;
mod client;
mod context;
mod error;
mod events;
mod job;
mod memory;
mod middleware;
mod notify;
mod registry;
mod state;
mod time;
mod wait;
mod worker;

// Test support (in-process queue assembly, fault injection)
pub mod testing;

// Data model
pub use crate::job::{
    ChainSnapshot, Deduplication, DeduplicationScope, Job, JobChain, JobOrigin, JobStatus,
    Schedule,
};

// Errors
pub use crate::error::{
    AttemptError, JobTypeValidationError, QueueError, ValidationErrorCode, WaitAbortReason,
    WaitForCompletionError,
};

// State adapter contract + reference implementation
pub use crate::memory::{MemoryStateAdapter, QueueStats};
pub use crate::state::{
    run_in_transaction, AcquiredJob, AddBlockersOutcome, CreateJobOutcome, CreateJobRequest,
    ReapedJob, StateAdapter, StateContext, TransactionToken,
};

// Notify adapter contract + implementations
pub use crate::batch::NotifyBatch;
pub use crate::notify::{
    ChainCompletedCallback, InProcessNotifyAdapter, JobScheduledCallback, NoopNotifyAdapter,
    NotifyAdapter, NotifyError, NotifySubscription, OwnershipLostCallback,
};

// Context passing
pub use crate::context::QueueContext;

// Client operations
pub use crate::client::{Client, Completion, CompletionScope, ContinueWith, StartJobChain};
pub use crate::wait::{WaitOptions, DEFAULT_WAIT_POLL_INTERVAL};

// Type registry
pub use crate::registry::{JobTypeKind, JobTypeRegistry, JobTypeSpec, PayloadValidator};

// Worker side
pub use crate::attempt::{
    handler_fn, AttemptContext, FnJobHandler, JobHandler, JobSnapshot, PrepareMode,
    ResolvedBlocker,
};
pub use crate::middleware::{AttemptMiddleware, Next};
pub use crate::worker::{LeaseConfig, Processor, Worker, WorkerConfig};

// Observability
pub use crate::events::{
    CollectingEventSink, EventSink, NullEventSink, QueueEvent, TracingEventSink,
};

// Retry / backoff helpers
pub use crate::backoff::{backoff_delay, with_retries, AdapterRetryPolicy, RetryConfig};

// Clock / sleep / cancellation helpers
pub use crate::time::{
    sleep_cancellable, AttemptSignal, CancelReason, Clock, ManualClock, SharedClock,
    SleepOutcome, SystemClock,
};

// Re-export commonly used external types
pub use async_trait::async_trait;
