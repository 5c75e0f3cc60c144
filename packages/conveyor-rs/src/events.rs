//! Typed queue lifecycle events.
//!
//! These are facts about what the queue did, emitted to an [`EventSink`] for
//! logging, metrics, or test assertions. Payloads flow through verbatim; the
//! core never adds secrets of its own.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A fact about the queue lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum QueueEvent {
    WorkerStarted {
        worker_id: String,
        type_names: Vec<String>,
        concurrency: usize,
    },
    WorkerStopped {
        worker_id: String,
    },
    /// A dispatch-loop iteration failed; the loop sleeps and retries.
    WorkerError {
        worker_id: String,
        operation: String,
        error: String,
    },

    JobCreated {
        job_id: Uuid,
        chain_id: Uuid,
        root_chain_id: Uuid,
        type_name: String,
        scheduled_at: DateTime<Utc>,
        deduplicated: bool,
    },
    JobAttemptStarted {
        job_id: Uuid,
        chain_id: Uuid,
        type_name: String,
        worker_id: String,
        attempt: i32,
    },
    JobAttemptCompleted {
        job_id: Uuid,
        type_name: String,
        worker_id: String,
        attempt: i32,
        /// False when the attempt created a continuation.
        terminal: bool,
        duration_ms: u64,
    },
    JobAttemptFailed {
        job_id: Uuid,
        type_name: String,
        worker_id: String,
        attempt: i32,
        error: String,
        retry_at: DateTime<Utc>,
    },
    JobCompleted {
        job_id: Uuid,
        chain_id: Uuid,
        type_name: String,
        /// `None` when completed externally.
        completed_by: Option<String>,
    },
    JobBlocked {
        job_id: Uuid,
        type_name: String,
        blocked_by_chain_ids: Vec<Uuid>,
    },
    JobUnblocked {
        job_id: Uuid,
        type_name: String,
        scheduled_at: DateTime<Utc>,
    },
    /// An expired lease was observed by a reaper.
    JobLeaseExpired {
        job_id: Uuid,
        type_name: String,
        leased_by: Option<String>,
    },
    /// An expired-lease job was flipped back to pending.
    JobReaped {
        job_id: Uuid,
        type_name: String,
        previous_worker_id: Option<String>,
        worker_id: String,
    },
    /// A running attempt discovered its lease now belongs to someone else.
    JobTakenByAnotherWorker {
        job_id: Uuid,
        type_name: String,
        worker_id: String,
        leased_by: Option<String>,
    },

    JobChainCreated {
        chain_id: Uuid,
        type_name: String,
    },
    JobChainCompleted {
        chain_id: Uuid,
        chain_type_name: String,
    },
    JobChainDeleted {
        root_chain_ids: Vec<Uuid>,
        deleted: u64,
    },

    /// A notification could not be published; polling covers the gap.
    NotifyAdapterError {
        channel: String,
        detail: String,
    },
    /// An adapter call failed after exhausting retries.
    StateAdapterError {
        operation: String,
        detail: String,
    },
    /// A state mutation happened outside a notify scope; the notification
    /// was skipped and consumers fall back to polling.
    NotifyContextAbsence {
        operation: String,
    },
}

impl QueueEvent {
    /// Stable snake_case tag, usable as a log field or metric label.
    pub fn kind(&self) -> &'static str {
        match self {
            QueueEvent::WorkerStarted { .. } => "worker_started",
            QueueEvent::WorkerStopped { .. } => "worker_stopped",
            QueueEvent::WorkerError { .. } => "worker_error",
            QueueEvent::JobCreated { .. } => "job_created",
            QueueEvent::JobAttemptStarted { .. } => "job_attempt_started",
            QueueEvent::JobAttemptCompleted { .. } => "job_attempt_completed",
            QueueEvent::JobAttemptFailed { .. } => "job_attempt_failed",
            QueueEvent::JobCompleted { .. } => "job_completed",
            QueueEvent::JobBlocked { .. } => "job_blocked",
            QueueEvent::JobUnblocked { .. } => "job_unblocked",
            QueueEvent::JobLeaseExpired { .. } => "job_lease_expired",
            QueueEvent::JobReaped { .. } => "job_reaped",
            QueueEvent::JobTakenByAnotherWorker { .. } => "job_taken_by_another_worker",
            QueueEvent::JobChainCreated { .. } => "job_chain_created",
            QueueEvent::JobChainCompleted { .. } => "job_chain_completed",
            QueueEvent::JobChainDeleted { .. } => "job_chain_deleted",
            QueueEvent::NotifyAdapterError { .. } => "notify_adapter_error",
            QueueEvent::StateAdapterError { .. } => "state_adapter_error",
            QueueEvent::NotifyContextAbsence { .. } => "notify_context_absence",
        }
    }
}

/// Receives queue events. Must be cheap and non-blocking.
pub trait EventSink: Send + Sync + 'static {
    fn emit(&self, event: QueueEvent);
}

/// Renders events as structured `tracing` records. The default sink.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: QueueEvent) {
        let kind = event.kind();
        match &event {
            QueueEvent::WorkerError {
                worker_id,
                operation,
                error,
            } => {
                tracing::error!(kind, %worker_id, %operation, %error, "queue event");
            }
            QueueEvent::StateAdapterError { operation, detail } => {
                tracing::error!(kind, %operation, %detail, "queue event");
            }
            QueueEvent::NotifyAdapterError { channel, detail } => {
                tracing::warn!(kind, %channel, %detail, "queue event");
            }
            QueueEvent::NotifyContextAbsence { operation } => {
                tracing::warn!(kind, %operation, "queue event");
            }
            QueueEvent::JobAttemptFailed {
                job_id,
                type_name,
                worker_id,
                attempt,
                error,
                retry_at,
            } => {
                tracing::warn!(
                    kind,
                    %job_id,
                    %type_name,
                    %worker_id,
                    attempt,
                    %error,
                    %retry_at,
                    "queue event"
                );
            }
            other => {
                let detail = serde_json::to_string(other).unwrap_or_default();
                tracing::debug!(kind, %detail, "queue event");
            }
        }
    }
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn emit(&self, _event: QueueEvent) {}
}

/// Buffers events for assertions. For tests.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: std::sync::Mutex<Vec<QueueEvent>>,
}

impl CollectingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything emitted so far.
    pub fn snapshot(&self) -> Vec<QueueEvent> {
        self.events.lock().expect("sink lock poisoned").clone()
    }

    /// Drain the buffer.
    pub fn take(&self) -> Vec<QueueEvent> {
        std::mem::take(&mut *self.events.lock().expect("sink lock poisoned"))
    }

    pub fn count_kind(&self, kind: &str) -> usize {
        self.events
            .lock()
            .expect("sink lock poisoned")
            .iter()
            .filter(|e| e.kind() == kind)
            .count()
    }
}

impl EventSink for CollectingEventSink {
    fn emit(&self, event: QueueEvent) {
        self.events.lock().expect("sink lock poisoned").push(event);
    }
}
