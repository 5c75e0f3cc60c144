//! The persistent job record and its satellite value types.
//!
//! A [`Job`] row is the only durable entity in the queue. Jobs link into
//! **chains**: every job carries the `chain_id` of the chain it belongs to,
//! and a chain advances by inserting a *continuation* job in the same
//! transaction that completes its predecessor. A chain is **terminal** once
//! its latest job is completed without having created a continuation.
//!
//! Ownership rules:
//! - The database owns every row. Workers gain temporary exclusive access
//!   through the `running` status plus the lease fields.
//! - Everything handed to application code is a read-only snapshot; mutation
//!   goes through the state adapter.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a single job row.
///
/// `pending → (blocked ↔ pending) → running → {pending, completed}`.
/// `completed` is terminal for the row; the chain may still continue through
/// a freshly inserted pending job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Runnable once `scheduled_at` has passed.
    Pending,
    /// Waiting for at least one blocker chain to become terminal.
    Blocked,
    /// Leased by a worker.
    Running,
    /// Terminal for this row.
    Completed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Blocked => "blocked",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A durable job row.
///
/// `input` is immutable after insert; `output` is set only on terminal
/// completion. Payloads are opaque JSON values end to end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Primary key, generated by the state adapter.
    pub id: Uuid,
    /// Which registered handler runs this job.
    pub type_name: String,
    /// Chain membership; equals `id` for the first job of a chain.
    pub chain_id: Uuid,
    /// `type_name` of the first job in the chain.
    pub chain_type_name: String,
    /// Chain id of the outermost producer; equals `chain_id` for chains not
    /// spawned from inside another job.
    pub root_chain_id: Uuid,
    /// The job that caused this one to exist (continuation or blocker
    /// parent); `None` for externally started chains.
    pub origin_id: Option<Uuid>,
    /// Opaque input payload.
    pub input: serde_json::Value,
    /// Terminal output payload.
    pub output: Option<serde_json::Value>,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    /// Earliest instant this job may be acquired.
    pub scheduled_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Worker that completed the job; `None` for external completion.
    pub completed_by: Option<String>,
    /// Incremented on each acquisition.
    pub attempt: i32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_attempt_error: Option<String>,
    pub leased_by: Option<String>,
    pub leased_until: Option<DateTime<Utc>>,
    /// Set only on the first job of a chain when the caller requested
    /// deduplication.
    pub deduplication_key: Option<String>,
}

impl Job {
    /// True when this row opened its chain.
    pub fn is_first_of_chain(&self) -> bool {
        self.id == self.chain_id
    }

    pub fn is_completed(&self) -> bool {
        self.status == JobStatus::Completed
    }

    /// True when `worker_id` currently holds the lease.
    pub fn is_leased_by(&self, worker_id: &str) -> bool {
        self.leased_by.as_deref() == Some(worker_id)
    }
}

/// When a job becomes runnable.
///
/// Absolute time and relative delay are mutually exclusive by construction,
/// which settles the ambiguity of supplying both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Schedule {
    /// Runnable at the given instant; instants in the past mean "now".
    At(DateTime<Utc>),
    /// Runnable after the given delay.
    After(Duration),
}

impl Schedule {
    /// Resolve to an absolute instant against `now`. Unrepresentable
    /// delays saturate at the far future.
    pub fn resolve(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Schedule::At(at) => *at,
            Schedule::After(delay) => chrono::Duration::from_std(*delay)
                .ok()
                .and_then(|delta| now.checked_add_signed(delta))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }
}

/// Which prior chains a deduplication key may match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeduplicationScope {
    /// Match only chains that are not yet terminal.
    Incomplete,
    /// Match chains in any state.
    Any,
}

/// Deduplication request for the first job of a chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deduplication {
    pub key: String,
    pub scope: DeduplicationScope,
    /// Only consider prior chains created within this window. A zero window
    /// never deduplicates.
    pub window: Option<Duration>,
}

impl Deduplication {
    pub fn new(key: impl Into<String>, scope: DeduplicationScope) -> Self {
        Self {
            key: key.into(),
            scope,
            window: None,
        }
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = Some(window);
        self
    }
}

/// Linkage of work created from inside another job.
///
/// Carried on the context so chains started from a job (blockers,
/// continuations) record their parentage without any ambient state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOrigin {
    /// The job that is creating new work.
    pub origin_id: Uuid,
    pub chain_id: Uuid,
    pub root_chain_id: Uuid,
    /// `type_name` of the originating job, used to validate declared edges.
    pub type_name: String,
}

impl JobOrigin {
    /// Origin scope for work spawned by `job`.
    pub fn of(job: &Job) -> Self {
        Self {
            origin_id: job.id,
            chain_id: job.chain_id,
            root_chain_id: job.root_chain_id,
            type_name: job.type_name.clone(),
        }
    }
}

/// Root and latest job of one chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainSnapshot {
    /// The first job of the chain (`id == chain_id`).
    pub root: Job,
    /// The most recently created job; equal to `root` for single-job chains.
    pub latest: Job,
}

impl ChainSnapshot {
    pub fn chain_id(&self) -> Uuid {
        self.root.chain_id
    }

    /// A chain is terminal iff its latest job is completed: a continuation
    /// is inserted in the same transaction that completes its predecessor,
    /// so a completed latest job cannot have a successor.
    pub fn is_terminal(&self) -> bool {
        self.latest.is_completed()
    }

    /// Terminal output of the chain, if any.
    pub fn output(&self) -> Option<&serde_json::Value> {
        self.latest.output.as_ref()
    }
}

/// Handle returned when starting a chain.
#[derive(Debug, Clone)]
pub struct JobChain {
    /// Chain id (also the id of the first job).
    pub id: Uuid,
    pub type_name: String,
    pub input: serde_json::Value,
    /// True when an existing chain satisfied the request instead of a new
    /// insert.
    pub deduplicated: bool,
}
