//! Clock abstraction, cancellable sleeps, and typed attempt cancellation.
//!
//! Every timestamp the queue compares comes from one [`Clock`], so tests can
//! drive scheduling deterministically with [`ManualClock`] instead of racing
//! the wall clock.

use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

/// Source of "now" for all scheduling decisions.
pub trait Clock: Send + Sync + std::fmt::Debug + 'static {
    fn now(&self) -> DateTime<Utc>;
}

pub type SharedClock = Arc<dyn Clock>;

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to. For tests.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Start at the current wall-clock instant.
    pub fn starting_now() -> Self {
        Self::new(Utc::now())
    }

    pub fn advance(&self, delta: Duration) {
        let mut now = self.now.lock().expect("clock lock poisoned");
        *now += chrono::Duration::from_std(delta).unwrap_or(chrono::Duration::MAX);
    }

    pub fn set(&self, instant: DateTime<Utc>) {
        *self.now.lock().expect("clock lock poisoned") = instant;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("clock lock poisoned")
    }
}

/// How a cancellable sleep ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepOutcome {
    Elapsed,
    Cancelled,
}

/// Sleep for `duration`, waking early if `signal` fires.
pub async fn sleep_cancellable(duration: Duration, signal: &CancellationToken) -> SleepOutcome {
    tokio::select! {
        _ = signal.cancelled() => SleepOutcome::Cancelled,
        _ = tokio::time::sleep(duration) => SleepOutcome::Elapsed,
    }
}

/// Why an in-flight attempt was asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The worker is shutting down; the handler should return promptly.
    WorkerStopping,
    /// The job was completed elsewhere (externally or by another worker).
    AlreadyCompleted,
    /// The lease was reassigned to another worker.
    TakenByAnotherWorker,
}

impl CancelReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CancelReason::WorkerStopping => "worker_stopping",
            CancelReason::AlreadyCompleted => "already_completed",
            CancelReason::TakenByAnotherWorker => "taken_by_another_worker",
        }
    }
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A cancellation token that remembers why it fired.
///
/// The first cancel wins; later reasons are discarded. Cheap to clone,
/// shared between the dispatch loop, the lease renewer, and the handler.
#[derive(Debug, Clone, Default)]
pub struct AttemptSignal {
    token: CancellationToken,
    reason: Arc<OnceLock<CancelReason>>,
}

impl AttemptSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self, reason: CancelReason) {
        let _ = self.reason.set(reason);
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The reason of the first cancel, once cancelled.
    pub fn reason(&self) -> Option<CancelReason> {
        self.reason.get().copied()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// The raw token, for `select!` arms and child scopes.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}
