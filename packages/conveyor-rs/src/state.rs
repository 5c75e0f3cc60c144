//! The state adapter contract.
//!
//! The state adapter is the only component that touches persistent state.
//! The rest of the queue depends solely on this trait; SQL, document-store,
//! and in-memory backends must be indistinguishable to callers.
//!
//! # Transactions
//!
//! Transactions are explicit tokens. `begin` opens a unit of work, every
//! operation takes a [`StateContext`] that either carries the token (the
//! operation joins that unit) or does not (the operation runs standalone),
//! and [`run_in_transaction`] wraps the begin/commit/rollback dance while
//! joining an already-open outer transaction instead of nesting.
//!
//! Operations that mutate chain structure (`create_job`,
//! `add_job_blockers`, `complete_job`, `schedule_blocked_jobs`) and the
//! row-locking reads refuse to run outside a transaction.
//!
//! # Concurrency requirements for implementations
//!
//! - `create_job` + `add_job_blockers` must be atomic under at least
//!   snapshot isolation.
//! - `acquire_job` must hand concurrent acquirers disjoint rows without
//!   aborting (`SELECT ... FOR UPDATE SKIP LOCKED`, atomic
//!   find-one-and-update, or equivalent).
//! - `now()` should come from the server side where possible to tolerate
//!   clock skew across worker processes.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::error::QueueError;
use crate::job::{ChainSnapshot, Deduplication, Job, Schedule};

/// Opaque handle of one open transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionToken(u64);

impl TransactionToken {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TransactionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tx-{}", self.0)
    }
}

/// Carries the (optional) transaction a state operation should join.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateContext {
    transaction: Option<TransactionToken>,
}

impl StateContext {
    /// A context outside any transaction.
    pub fn detached() -> Self {
        Self::default()
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    pub fn transaction(&self) -> Option<TransactionToken> {
        self.transaction
    }

    pub fn with_transaction(token: TransactionToken) -> Self {
        Self {
            transaction: Some(token),
        }
    }

    /// Error helper for operations that must run transactionally.
    pub fn require_transaction(&self, operation: &'static str) -> Result<(), QueueError> {
        if self.in_transaction() {
            Ok(())
        } else {
            Err(QueueError::TransactionRequired { operation })
        }
    }
}

/// Insert request for one job row.
#[derive(Debug, Clone)]
pub struct CreateJobRequest {
    pub type_name: String,
    pub chain_type_name: String,
    pub input: Value,
    /// Present for continuations: the chain being extended.
    pub chain_id: Option<Uuid>,
    /// Present when the chain is spawned from inside another job.
    pub root_chain_id: Option<Uuid>,
    /// The job that caused this insert, if any.
    pub origin_id: Option<Uuid>,
    pub deduplication: Option<Deduplication>,
    pub schedule: Option<Schedule>,
}

impl CreateJobRequest {
    /// A request for the first job of a fresh chain.
    pub fn new(type_name: impl Into<String>, input: Value) -> Self {
        let type_name = type_name.into();
        Self {
            chain_type_name: type_name.clone(),
            type_name,
            input,
            chain_id: None,
            root_chain_id: None,
            origin_id: None,
            deduplication: None,
            schedule: None,
        }
    }
}

/// Result of `create_job`: the (possibly pre-existing) row.
#[derive(Debug, Clone)]
pub struct CreateJobOutcome {
    pub job: Job,
    /// True when an existing row satisfied the request.
    pub deduplicated: bool,
}

/// Result of `add_job_blockers`.
#[derive(Debug, Clone)]
pub struct AddBlockersOutcome {
    /// The job after the call; `blocked` when any blocker is incomplete.
    pub job: Job,
    /// The blocker chains that were not yet terminal, in edge order.
    pub incomplete_blocker_chain_ids: Vec<Uuid>,
}

/// Result of `acquire_job`.
#[derive(Debug, Clone)]
pub struct AcquiredJob {
    pub job: Job,
    /// Hint that more runnable jobs were visible; lets the dispatch loop
    /// skip a poll sleep.
    pub has_more: bool,
}

/// Result of `remove_expired_job_lease`.
#[derive(Debug, Clone)]
pub struct ReapedJob {
    /// The job after the flip back to pending.
    pub job: Job,
    /// Who held the expired lease.
    pub previous_worker_id: Option<String>,
}

/// Persistent state operations.
///
/// Every method returns `QueueError`; infrastructure faults are wrapped as
/// `Transient` (retryable) or `Backend` (not), ownership faults as the
/// typed `JobNotFound` / `JobAlreadyCompleted` / `JobTakenByAnotherWorker`
/// variants.
#[async_trait]
pub trait StateAdapter: Send + Sync + 'static {
    /// Open a unit of work. Serializable-enough: effects of concurrent
    /// transactions must not interleave observably.
    async fn begin(&self) -> Result<TransactionToken, QueueError>;

    async fn commit(&self, token: TransactionToken) -> Result<(), QueueError>;

    async fn rollback(&self, token: TransactionToken) -> Result<(), QueueError>;

    /// Insert a job row, subject to the deduplication resolution order:
    ///
    /// 1. When `chain_id` and `origin_id` are both set and a row with that
    ///    pair exists, return it (`deduplicated = true`); this makes
    ///    continuation creation idempotent across complete-phase retries.
    /// 2. When `deduplication` is set, return the most recent first-of-chain
    ///    row with the same key that satisfies the scope and window.
    /// 3. Otherwise insert: `scheduled_at` from the schedule (or now),
    ///    status `pending`, `attempt = 0`.
    ///
    /// Requires a transaction.
    async fn create_job(
        &self,
        ctx: &StateContext,
        request: CreateJobRequest,
    ) -> Result<CreateJobOutcome, QueueError>;

    /// Record ordered blocker edges and flip the job `pending → blocked`
    /// when any blocker chain is not terminal. Requires a transaction.
    async fn add_job_blockers(
        &self,
        ctx: &StateContext,
        job_id: Uuid,
        blocked_by_chain_ids: &[Uuid],
    ) -> Result<AddBlockersOutcome, QueueError>;

    /// Called when `blocked_by_chain_id` became terminal: flip every job it
    /// blocked whose blockers are now all terminal `blocked → pending` with
    /// `scheduled_at = now`. Returns the transitioned rows. Requires a
    /// transaction.
    async fn schedule_blocked_jobs(
        &self,
        ctx: &StateContext,
        blocked_by_chain_id: Uuid,
    ) -> Result<Vec<Job>, QueueError>;

    async fn get_job_by_id(
        &self,
        ctx: &StateContext,
        job_id: Uuid,
    ) -> Result<Option<Job>, QueueError>;

    async fn get_job_chain_by_id(
        &self,
        ctx: &StateContext,
        chain_id: Uuid,
    ) -> Result<Option<ChainSnapshot>, QueueError>;

    /// Blocker chains of a job, in edge-insertion order.
    async fn get_job_blockers(
        &self,
        ctx: &StateContext,
        job_id: Uuid,
    ) -> Result<Vec<ChainSnapshot>, QueueError>;

    /// Atomically select the earliest runnable pending job among
    /// `type_names`, flip it to `running`, increment `attempt`, and lease it
    /// to `worker_id`. Concurrent acquirers must see disjoint rows.
    async fn acquire_job(
        &self,
        ctx: &StateContext,
        type_names: &[String],
        worker_id: &str,
        lease_duration: Duration,
    ) -> Result<Option<AcquiredJob>, QueueError>;

    /// Time until the next pending job among `type_names` becomes runnable;
    /// zero when one is runnable now, `None` when there is none. Bounds the
    /// dispatch loop's poll sleep.
    async fn get_next_job_available_in(
        &self,
        ctx: &StateContext,
        type_names: &[String],
    ) -> Result<Option<Duration>, QueueError>;

    /// Extend the lease of a running job held by `worker_id`.
    async fn renew_job_lease(
        &self,
        ctx: &StateContext,
        job_id: Uuid,
        worker_id: &str,
        lease_duration: Duration,
    ) -> Result<Job, QueueError>;

    /// Failed attempt: clear the lease, flip back to `pending`, set
    /// `scheduled_at` per the schedule, and record the attempt error.
    async fn reschedule_job(
        &self,
        ctx: &StateContext,
        job_id: Uuid,
        schedule: Schedule,
        error: Option<String>,
    ) -> Result<Job, QueueError>;

    /// Terminal row update: `completed`, `completed_at = now`,
    /// `completed_by = worker_id` (`None` for external completion), output
    /// stored, lease cleared. Requires a transaction.
    async fn complete_job(
        &self,
        ctx: &StateContext,
        job_id: Uuid,
        output: Option<Value>,
        worker_id: Option<&str>,
    ) -> Result<Job, QueueError>;

    /// Find one running job of `type_names` whose lease expired and flip it
    /// back to `pending`. `ignored_job_ids` excludes this worker's own
    /// in-flight attempts.
    async fn remove_expired_job_lease(
        &self,
        ctx: &StateContext,
        type_names: &[String],
        ignored_job_ids: &[Uuid],
    ) -> Result<Option<ReapedJob>, QueueError>;

    /// Jobs outside the given root chains holding blocker edges that point
    /// inside them. Non-empty forbids deletion of the trees.
    async fn get_external_blockers(
        &self,
        ctx: &StateContext,
        root_chain_ids: &[Uuid],
    ) -> Result<Vec<Job>, QueueError>;

    /// Cascade-delete every job whose `root_chain_id` is in the set.
    /// Returns the number of deleted jobs.
    async fn delete_jobs_by_root_chain_ids(
        &self,
        ctx: &StateContext,
        root_chain_ids: &[Uuid],
    ) -> Result<u64, QueueError>;

    /// Row-locking read of one job. Requires a transaction.
    async fn get_job_for_update(
        &self,
        ctx: &StateContext,
        job_id: Uuid,
    ) -> Result<Option<Job>, QueueError>;

    /// Row-locking read of a chain's latest job. Requires a transaction.
    async fn get_current_job_for_update(
        &self,
        ctx: &StateContext,
        chain_id: Uuid,
    ) -> Result<Option<Job>, QueueError>;

    /// Idempotent schema bring-up.
    async fn migrate_to_latest(&self) -> Result<(), QueueError>;
}

/// Run `f` inside a transaction, committing on `Ok` and rolling back on
/// `Err`. When `ctx` already carries a transaction, `f` joins it and
/// commit/rollback are left to the outer scope.
pub async fn run_in_transaction<S, T, E, F, Fut>(
    state: &S,
    ctx: &StateContext,
    f: F,
) -> Result<T, E>
where
    S: StateAdapter + ?Sized,
    E: From<QueueError>,
    F: FnOnce(StateContext) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    if ctx.in_transaction() {
        return f(*ctx).await;
    }

    let token = state.begin().await?;
    match f(StateContext::with_transaction(token)).await {
        Ok(value) => {
            state.commit(token).await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = state.rollback(token).await {
                tracing::warn!(%token, error = %rollback_err, "rollback failed");
            }
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detached_context_is_not_transactional() {
        let ctx = StateContext::detached();
        assert!(!ctx.in_transaction());
        assert!(ctx.transaction().is_none());

        let err = ctx.require_transaction("create_job").unwrap_err();
        assert!(matches!(
            err,
            QueueError::TransactionRequired {
                operation: "create_job"
            }
        ));
    }

    #[test]
    fn transactional_context_carries_token() {
        let token = TransactionToken::new(7);
        let ctx = StateContext::with_transaction(token);
        assert!(ctx.in_transaction());
        assert_eq!(ctx.transaction(), Some(token));
        assert!(ctx.require_transaction("complete_job").is_ok());
    }

    #[test]
    fn create_request_defaults_chain_type_to_type() {
        let request = CreateJobRequest::new("greet", serde_json::json!({}));
        assert_eq!(request.chain_type_name, "greet");
        assert!(request.chain_id.is_none());
        assert!(request.deduplication.is_none());
    }
}
