//! Reference in-memory state adapter.
//!
//! The whole store lives behind one async mutex. A transaction takes the
//! lock for its entire lifetime and keeps a snapshot for rollback, which
//! makes the adapter serializable by construction: nothing interleaves with
//! an open transaction, `FOR UPDATE` reads are trivially exclusive, and
//! concurrent acquirers can never see the same row.
//!
//! That is the right trade-off for a reference implementation and the test
//! substrate; production backends get their concurrency from the database
//! (skip-locked selects, atomic find-and-update) instead of a global lock.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use smallvec::SmallVec;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::error::QueueError;
use crate::job::{ChainSnapshot, Job, JobStatus, Schedule};
use crate::state::{
    AcquiredJob, AddBlockersOutcome, CreateJobOutcome, CreateJobRequest, ReapedJob, StateAdapter,
    StateContext, TransactionToken,
};
use crate::time::{SharedClock, SystemClock};

/// One blocker edge: `job_id` cannot run until `blocked_by_chain_id` is
/// terminal. `index` preserves declaration order.
#[derive(Debug, Clone)]
struct BlockerEdge {
    job_id: Uuid,
    blocked_by_chain_id: Uuid,
    index: usize,
}

#[derive(Debug, Clone)]
struct StoredJob {
    job: Job,
    /// Monotonic insert sequence, used for stable ordering and as the
    /// creation-order tiebreaker.
    seq: u64,
}

#[derive(Debug, Clone, Default)]
struct MemoryStore {
    jobs: HashMap<Uuid, StoredJob>,
    edges: Vec<BlockerEdge>,
    seq: u64,
}

impl MemoryStore {
    fn insert_job(&mut self, job: Job) -> Job {
        self.seq += 1;
        let stored = StoredJob {
            job: job.clone(),
            seq: self.seq,
        };
        self.jobs.insert(job.id, stored);
        job
    }

    fn latest_of_chain(&self, chain_id: Uuid) -> Option<&StoredJob> {
        self.jobs
            .values()
            .filter(|s| s.job.chain_id == chain_id)
            .max_by_key(|s| s.seq)
    }

    /// A chain with no jobs is treated as not terminal: nothing blocked on
    /// it can ever be released, which is the safe direction.
    fn chain_is_terminal(&self, chain_id: Uuid) -> bool {
        self.latest_of_chain(chain_id)
            .map(|s| s.job.is_completed())
            .unwrap_or(false)
    }

    fn chain_snapshot(&self, chain_id: Uuid) -> Option<ChainSnapshot> {
        let root = self.jobs.get(&chain_id)?;
        let latest = self.latest_of_chain(chain_id)?;
        Some(ChainSnapshot {
            root: root.job.clone(),
            latest: latest.job.clone(),
        })
    }

    fn edges_of(&self, job_id: Uuid) -> SmallVec<[&BlockerEdge; 4]> {
        let mut edges: SmallVec<[&BlockerEdge; 4]> = self
            .edges
            .iter()
            .filter(|e| e.job_id == job_id)
            .collect();
        edges.sort_by_key(|e| e.index);
        edges
    }
}

/// Counts by status, for introspection and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    pub blocked: usize,
    pub running: usize,
    pub completed: usize,
}

struct TxSlot {
    guard: OwnedMutexGuard<MemoryStore>,
    snapshot: MemoryStore,
}

/// Lease expiry instant, saturating at the far future for unrepresentable
/// durations.
fn lease_expiry(now: DateTime<Utc>, lease_duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(lease_duration)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// In-memory [`StateAdapter`].
pub struct MemoryStateAdapter {
    store: Arc<Mutex<MemoryStore>>,
    transactions: DashMap<u64, TxSlot>,
    next_token: AtomicU64,
    clock: SharedClock,
}

impl Default for MemoryStateAdapter {
    fn default() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }
}

impl MemoryStateAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            store: Arc::new(Mutex::new(MemoryStore::default())),
            transactions: DashMap::new(),
            next_token: AtomicU64::new(1),
            clock,
        }
    }

    /// Run `f` against the store, joining the context's transaction when one
    /// is open and taking the lock briefly otherwise.
    async fn with_store<T>(
        &self,
        ctx: &StateContext,
        f: impl FnOnce(&mut MemoryStore, DateTime<Utc>) -> Result<T, QueueError>,
    ) -> Result<T, QueueError> {
        let now = self.clock.now();
        match ctx.transaction() {
            Some(token) => {
                let mut slot = self.transactions.get_mut(&token.value()).ok_or_else(|| {
                    QueueError::backend(anyhow::anyhow!("unknown transaction {token}"))
                })?;
                f(&mut slot.guard, now)
            }
            None => {
                let mut guard = self.store.lock().await;
                f(&mut guard, now)
            }
        }
    }

    /// Counts by status.
    pub async fn stats(&self) -> QueueStats {
        let guard = self.store.lock().await;
        let mut stats = QueueStats::default();
        for stored in guard.jobs.values() {
            match stored.job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Blocked => stats.blocked += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Completed => stats.completed += 1,
            }
        }
        stats
    }

    /// Every job row, in creation order.
    pub async fn jobs_snapshot(&self) -> Vec<Job> {
        let guard = self.store.lock().await;
        let mut jobs: Vec<&StoredJob> = guard.jobs.values().collect();
        jobs.sort_by_key(|s| s.seq);
        jobs.iter().map(|s| s.job.clone()).collect()
    }
}

impl std::fmt::Debug for MemoryStateAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStateAdapter")
            .field("open_transactions", &self.transactions.len())
            .finish()
    }
}

#[async_trait]
impl StateAdapter for MemoryStateAdapter {
    async fn begin(&self) -> Result<TransactionToken, QueueError> {
        let guard = Arc::clone(&self.store).lock_owned().await;
        let snapshot = guard.clone();
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.transactions.insert(token, TxSlot { guard, snapshot });
        Ok(TransactionToken::new(token))
    }

    async fn commit(&self, token: TransactionToken) -> Result<(), QueueError> {
        self.transactions
            .remove(&token.value())
            .map(|_| ())
            .ok_or_else(|| QueueError::backend(anyhow::anyhow!("unknown transaction {token}")))
    }

    async fn rollback(&self, token: TransactionToken) -> Result<(), QueueError> {
        let (_, mut slot) = self
            .transactions
            .remove(&token.value())
            .ok_or_else(|| QueueError::backend(anyhow::anyhow!("unknown transaction {token}")))?;
        *slot.guard = slot.snapshot;
        Ok(())
    }

    async fn create_job(
        &self,
        ctx: &StateContext,
        request: CreateJobRequest,
    ) -> Result<CreateJobOutcome, QueueError> {
        ctx.require_transaction("create_job")?;
        self.with_store(ctx, |store, now| {
            // Continuation idempotency: one continuation per (chain, origin).
            if let (Some(chain_id), Some(origin_id)) = (request.chain_id, request.origin_id) {
                let existing = store
                    .jobs
                    .values()
                    .find(|s| s.job.chain_id == chain_id && s.job.origin_id == Some(origin_id));
                if let Some(stored) = existing {
                    return Ok(CreateJobOutcome {
                        job: stored.job.clone(),
                        deduplicated: true,
                    });
                }
            }

            if let Some(dedup) = &request.deduplication {
                let window = dedup
                    .window
                    .map(|w| chrono::Duration::from_std(w).unwrap_or(chrono::Duration::MAX));
                let candidate = store
                    .jobs
                    .values()
                    .filter(|s| {
                        s.job.is_first_of_chain()
                            && s.job.deduplication_key.as_deref() == Some(dedup.key.as_str())
                    })
                    .filter(|s| match dedup.scope {
                        crate::job::DeduplicationScope::Any => true,
                        crate::job::DeduplicationScope::Incomplete => {
                            !store.chain_is_terminal(s.job.chain_id)
                        }
                    })
                    .filter(|s| match window {
                        // A zero window matches nothing: created_at <= now
                        // makes the age non-negative.
                        Some(w) => now.signed_duration_since(s.job.created_at) < w,
                        None => true,
                    })
                    .max_by_key(|s| s.seq);
                if let Some(stored) = candidate {
                    return Ok(CreateJobOutcome {
                        job: stored.job.clone(),
                        deduplicated: true,
                    });
                }
            }

            let id = Uuid::new_v4();
            let chain_id = request.chain_id.unwrap_or(id);
            let root_chain_id = request.root_chain_id.unwrap_or(chain_id);
            let scheduled_at = request
                .schedule
                .map(|s| s.resolve(now))
                .unwrap_or(now);
            let deduplication_key = if request.chain_id.is_none() {
                request.deduplication.as_ref().map(|d| d.key.clone())
            } else {
                None
            };

            let job = store.insert_job(Job {
                id,
                type_name: request.type_name.clone(),
                chain_id,
                chain_type_name: request.chain_type_name.clone(),
                root_chain_id,
                origin_id: request.origin_id,
                input: request.input.clone(),
                output: None,
                status: JobStatus::Pending,
                created_at: now,
                scheduled_at,
                completed_at: None,
                completed_by: None,
                attempt: 0,
                last_attempt_at: None,
                last_attempt_error: None,
                leased_by: None,
                leased_until: None,
                deduplication_key,
            });
            Ok(CreateJobOutcome {
                job,
                deduplicated: false,
            })
        })
        .await
    }

    async fn add_job_blockers(
        &self,
        ctx: &StateContext,
        job_id: Uuid,
        blocked_by_chain_ids: &[Uuid],
    ) -> Result<AddBlockersOutcome, QueueError> {
        ctx.require_transaction("add_job_blockers")?;
        self.with_store(ctx, |store, _now| {
            if !store.jobs.contains_key(&job_id) {
                return Err(QueueError::JobNotFound { job_id });
            }

            let base_index = store.edges.iter().filter(|e| e.job_id == job_id).count();
            for (offset, chain_id) in blocked_by_chain_ids.iter().enumerate() {
                store.edges.push(BlockerEdge {
                    job_id,
                    blocked_by_chain_id: *chain_id,
                    index: base_index + offset,
                });
            }

            let mut seen = HashSet::new();
            let incomplete: Vec<Uuid> = blocked_by_chain_ids
                .iter()
                .copied()
                .filter(|chain_id| seen.insert(*chain_id))
                .filter(|chain_id| !store.chain_is_terminal(*chain_id))
                .collect();

            let stored = store.jobs.get_mut(&job_id).expect("job checked above");
            if !incomplete.is_empty() && stored.job.status == JobStatus::Pending {
                stored.job.status = JobStatus::Blocked;
            }

            Ok(AddBlockersOutcome {
                job: stored.job.clone(),
                incomplete_blocker_chain_ids: incomplete,
            })
        })
        .await
    }

    async fn schedule_blocked_jobs(
        &self,
        ctx: &StateContext,
        blocked_by_chain_id: Uuid,
    ) -> Result<Vec<Job>, QueueError> {
        ctx.require_transaction("schedule_blocked_jobs")?;
        self.with_store(ctx, |store, now| {
            let mut candidates: Vec<Uuid> = Vec::new();
            for edge in &store.edges {
                if edge.blocked_by_chain_id == blocked_by_chain_id
                    && !candidates.contains(&edge.job_id)
                {
                    candidates.push(edge.job_id);
                }
            }

            let releasable: Vec<Uuid> = candidates
                .into_iter()
                .filter(|job_id| {
                    store
                        .jobs
                        .get(job_id)
                        .map(|s| s.job.status == JobStatus::Blocked)
                        .unwrap_or(false)
                })
                .filter(|job_id| {
                    store
                        .edges_of(*job_id)
                        .iter()
                        .all(|e| store.chain_is_terminal(e.blocked_by_chain_id))
                })
                .collect();

            let mut transitioned = Vec::with_capacity(releasable.len());
            for job_id in releasable {
                let stored = store.jobs.get_mut(&job_id).expect("candidate exists");
                stored.job.status = JobStatus::Pending;
                stored.job.scheduled_at = now;
                transitioned.push(stored.job.clone());
            }
            Ok(transitioned)
        })
        .await
    }

    async fn get_job_by_id(
        &self,
        ctx: &StateContext,
        job_id: Uuid,
    ) -> Result<Option<Job>, QueueError> {
        self.with_store(ctx, |store, _| {
            Ok(store.jobs.get(&job_id).map(|s| s.job.clone()))
        })
        .await
    }

    async fn get_job_chain_by_id(
        &self,
        ctx: &StateContext,
        chain_id: Uuid,
    ) -> Result<Option<ChainSnapshot>, QueueError> {
        self.with_store(ctx, |store, _| Ok(store.chain_snapshot(chain_id)))
            .await
    }

    async fn get_job_blockers(
        &self,
        ctx: &StateContext,
        job_id: Uuid,
    ) -> Result<Vec<ChainSnapshot>, QueueError> {
        self.with_store(ctx, |store, _| {
            let mut seen = HashSet::new();
            Ok(store
                .edges_of(job_id)
                .iter()
                .filter(|e| seen.insert(e.blocked_by_chain_id))
                .filter_map(|e| store.chain_snapshot(e.blocked_by_chain_id))
                .collect())
        })
        .await
    }

    async fn acquire_job(
        &self,
        ctx: &StateContext,
        type_names: &[String],
        worker_id: &str,
        lease_duration: Duration,
    ) -> Result<Option<AcquiredJob>, QueueError> {
        self.with_store(ctx, |store, now| {
            let mut runnable: Vec<(DateTime<Utc>, u64, Uuid)> = store
                .jobs
                .values()
                .filter(|s| {
                    s.job.status == JobStatus::Pending
                        && s.job.scheduled_at <= now
                        && type_names.iter().any(|t| *t == s.job.type_name)
                })
                .map(|s| (s.job.scheduled_at, s.seq, s.job.id))
                .collect();
            runnable.sort();

            let Some((_, _, job_id)) = runnable.first().copied() else {
                return Ok(None);
            };
            let has_more = runnable.len() > 1;

            let stored = store.jobs.get_mut(&job_id).expect("candidate exists");
            stored.job.status = JobStatus::Running;
            stored.job.attempt += 1;
            stored.job.leased_by = Some(worker_id.to_string());
            stored.job.leased_until = Some(lease_expiry(now, lease_duration));

            Ok(Some(AcquiredJob {
                job: stored.job.clone(),
                has_more,
            }))
        })
        .await
    }

    async fn get_next_job_available_in(
        &self,
        ctx: &StateContext,
        type_names: &[String],
    ) -> Result<Option<Duration>, QueueError> {
        self.with_store(ctx, |store, now| {
            Ok(store
                .jobs
                .values()
                .filter(|s| {
                    s.job.status == JobStatus::Pending
                        && type_names.iter().any(|t| *t == s.job.type_name)
                })
                .map(|s| s.job.scheduled_at.signed_duration_since(now))
                .min()
                .map(|delta| delta.to_std().unwrap_or(Duration::ZERO)))
        })
        .await
    }

    async fn renew_job_lease(
        &self,
        ctx: &StateContext,
        job_id: Uuid,
        worker_id: &str,
        lease_duration: Duration,
    ) -> Result<Job, QueueError> {
        self.with_store(ctx, |store, now| {
            let stored = store
                .jobs
                .get_mut(&job_id)
                .ok_or(QueueError::JobNotFound { job_id })?;
            if stored.job.is_completed() {
                return Err(QueueError::JobAlreadyCompleted { job_id });
            }
            if stored.job.status != JobStatus::Running || !stored.job.is_leased_by(worker_id) {
                return Err(QueueError::JobTakenByAnotherWorker {
                    job_id,
                    leased_by: stored.job.leased_by.clone(),
                });
            }
            stored.job.leased_until = Some(lease_expiry(now, lease_duration));
            Ok(stored.job.clone())
        })
        .await
    }

    async fn reschedule_job(
        &self,
        ctx: &StateContext,
        job_id: Uuid,
        schedule: Schedule,
        error: Option<String>,
    ) -> Result<Job, QueueError> {
        self.with_store(ctx, |store, now| {
            let stored = store
                .jobs
                .get_mut(&job_id)
                .ok_or(QueueError::JobNotFound { job_id })?;
            if stored.job.is_completed() {
                return Err(QueueError::JobAlreadyCompleted { job_id });
            }
            stored.job.status = JobStatus::Pending;
            stored.job.scheduled_at = schedule.resolve(now);
            stored.job.leased_by = None;
            stored.job.leased_until = None;
            stored.job.last_attempt_at = Some(now);
            stored.job.last_attempt_error = error;
            Ok(stored.job.clone())
        })
        .await
    }

    async fn complete_job(
        &self,
        ctx: &StateContext,
        job_id: Uuid,
        output: Option<Value>,
        worker_id: Option<&str>,
    ) -> Result<Job, QueueError> {
        ctx.require_transaction("complete_job")?;
        self.with_store(ctx, |store, now| {
            let stored = store
                .jobs
                .get_mut(&job_id)
                .ok_or(QueueError::JobNotFound { job_id })?;
            if stored.job.is_completed() {
                return Err(QueueError::JobAlreadyCompleted { job_id });
            }
            stored.job.status = JobStatus::Completed;
            stored.job.output = output;
            stored.job.completed_at = Some(now);
            stored.job.completed_by = worker_id.map(str::to_string);
            stored.job.leased_by = None;
            stored.job.leased_until = None;
            Ok(stored.job.clone())
        })
        .await
    }

    async fn remove_expired_job_lease(
        &self,
        ctx: &StateContext,
        type_names: &[String],
        ignored_job_ids: &[Uuid],
    ) -> Result<Option<ReapedJob>, QueueError> {
        self.with_store(ctx, |store, now| {
            let mut expired: Vec<(DateTime<Utc>, u64, Uuid)> = store
                .jobs
                .values()
                .filter(|s| {
                    s.job.status == JobStatus::Running
                        && s.job.leased_until.map(|t| t <= now).unwrap_or(false)
                        && type_names.iter().any(|t| *t == s.job.type_name)
                        && !ignored_job_ids.contains(&s.job.id)
                })
                .filter_map(|s| s.job.leased_until.map(|t| (t, s.seq, s.job.id)))
                .collect();
            expired.sort();

            let Some((_, _, job_id)) = expired.first().copied() else {
                return Ok(None);
            };

            let stored = store.jobs.get_mut(&job_id).expect("candidate exists");
            let previous_worker_id = stored.job.leased_by.take();
            stored.job.status = JobStatus::Pending;
            stored.job.leased_until = None;

            Ok(Some(ReapedJob {
                job: stored.job.clone(),
                previous_worker_id,
            }))
        })
        .await
    }

    async fn get_external_blockers(
        &self,
        ctx: &StateContext,
        root_chain_ids: &[Uuid],
    ) -> Result<Vec<Job>, QueueError> {
        self.with_store(ctx, |store, _| {
            let roots: HashSet<Uuid> = root_chain_ids.iter().copied().collect();
            let inside_chains: HashSet<Uuid> = store
                .jobs
                .values()
                .filter(|s| roots.contains(&s.job.root_chain_id))
                .map(|s| s.job.chain_id)
                .collect();

            let mut seen = HashSet::new();
            let mut external = Vec::new();
            for edge in &store.edges {
                if !inside_chains.contains(&edge.blocked_by_chain_id) {
                    continue;
                }
                if let Some(stored) = store.jobs.get(&edge.job_id) {
                    if !roots.contains(&stored.job.root_chain_id) && seen.insert(stored.job.id) {
                        external.push(stored.job.clone());
                    }
                }
            }
            Ok(external)
        })
        .await
    }

    async fn delete_jobs_by_root_chain_ids(
        &self,
        ctx: &StateContext,
        root_chain_ids: &[Uuid],
    ) -> Result<u64, QueueError> {
        self.with_store(ctx, |store, _| {
            let roots: HashSet<Uuid> = root_chain_ids.iter().copied().collect();
            let removed_jobs: HashSet<Uuid> = store
                .jobs
                .values()
                .filter(|s| roots.contains(&s.job.root_chain_id))
                .map(|s| s.job.id)
                .collect();
            let removed_chains: HashSet<Uuid> = store
                .jobs
                .values()
                .filter(|s| roots.contains(&s.job.root_chain_id))
                .map(|s| s.job.chain_id)
                .collect();

            store.jobs.retain(|id, _| !removed_jobs.contains(id));
            store.edges.retain(|e| {
                !removed_jobs.contains(&e.job_id)
                    && !removed_chains.contains(&e.blocked_by_chain_id)
            });
            Ok(removed_jobs.len() as u64)
        })
        .await
    }

    async fn get_job_for_update(
        &self,
        ctx: &StateContext,
        job_id: Uuid,
    ) -> Result<Option<Job>, QueueError> {
        ctx.require_transaction("get_job_for_update")?;
        self.with_store(ctx, |store, _| {
            Ok(store.jobs.get(&job_id).map(|s| s.job.clone()))
        })
        .await
    }

    async fn get_current_job_for_update(
        &self,
        ctx: &StateContext,
        chain_id: Uuid,
    ) -> Result<Option<Job>, QueueError> {
        ctx.require_transaction("get_current_job_for_update")?;
        self.with_store(ctx, |store, _| {
            Ok(store.latest_of_chain(chain_id).map(|s| s.job.clone()))
        })
        .await
    }

    async fn migrate_to_latest(&self) -> Result<(), QueueError> {
        Ok(())
    }
}
