//! Structured error types for the queue.
//!
//! [`QueueError`] is the pattern-matchable taxonomy exposed at every
//! boundary. `anyhow::Error` stays internal transport: adapters wrap
//! infrastructure faults into [`QueueError::Transient`] (retried by the
//! backoff decorator) or [`QueueError::Backend`] (surfaced as-is).
//!
//! The ownership-loss variants (`JobNotFound`, `JobAlreadyCompleted`,
//! `JobTakenByAnotherWorker`) carry a handling strategy with them: an
//! attempt that hits one of these no longer owns its job and must exit
//! without rescheduling.

use thiserror::Error;
use uuid::Uuid;

use crate::job::Schedule;

/// Which rule a job-type validation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationErrorCode {
    /// The type name is not registered.
    UnknownType,
    /// The type is registered but is not an entry type.
    NotEntry,
    /// The input payload failed the registered validator.
    InputInvalid,
    /// The output payload failed the registered validator.
    OutputInvalid,
    /// The continuation target is not a declared edge of the current type.
    ContinuationInvalid,
    /// The blocker type is not a declared edge of the starting type.
    BlockerInvalid,
}

impl ValidationErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationErrorCode::UnknownType => "unknown_type",
            ValidationErrorCode::NotEntry => "not_entry",
            ValidationErrorCode::InputInvalid => "input_invalid",
            ValidationErrorCode::OutputInvalid => "output_invalid",
            ValidationErrorCode::ContinuationInvalid => "continuation_invalid",
            ValidationErrorCode::BlockerInvalid => "blocker_invalid",
        }
    }
}

/// A producer-side validation failure. Nothing is persisted when one of
/// these is returned.
#[derive(Debug, Clone, Error)]
#[error("job type validation failed ({code}) for '{type_name}': {detail}", code = .code.as_str())]
pub struct JobTypeValidationError {
    pub code: ValidationErrorCode,
    pub type_name: String,
    pub detail: String,
}

impl JobTypeValidationError {
    pub fn new(
        code: ValidationErrorCode,
        type_name: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            code,
            type_name: type_name.into(),
            detail: detail.into(),
        }
    }
}

/// Why a wait ended without the chain reaching terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitAbortReason {
    /// The caller-provided deadline elapsed.
    Timeout,
    /// The caller-provided signal fired.
    Aborted,
}

impl std::fmt::Display for WaitAbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WaitAbortReason::Timeout => f.write_str("timeout"),
            WaitAbortReason::Aborted => f.write_str("aborted"),
        }
    }
}

/// Returned by `wait_for_job_chain_completion` when the chain did not reach
/// terminal state in time. No state is affected.
#[derive(Debug, Clone, Error)]
#[error("wait for completion of chain {chain_id} ended: {reason}")]
pub struct WaitForCompletionError {
    pub chain_id: Uuid,
    pub reason: WaitAbortReason,
}

/// The queue error taxonomy.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("job {job_id} not found")]
    JobNotFound { job_id: Uuid },

    #[error("job {job_id} is already completed")]
    JobAlreadyCompleted { job_id: Uuid },

    #[error("job {job_id} is held by another worker (leased by {leased_by:?})")]
    JobTakenByAnotherWorker {
        job_id: Uuid,
        leased_by: Option<String>,
    },

    #[error("chain {chain_id} not found")]
    ChainNotFound { chain_id: Uuid },

    #[error("chain {chain_id} is currently of type '{actual}', expected '{expected}'")]
    ChainTypeMismatch {
        chain_id: Uuid,
        expected: String,
        actual: String,
    },

    #[error("chains cannot be deleted: blocked from outside by jobs {job_ids:?}")]
    ChainExternallyBlocked { job_ids: Vec<Uuid> },

    #[error("{operation} requires an open transaction")]
    TransactionRequired { operation: &'static str },

    #[error("prepare may only be called once per attempt (job {job_id})")]
    PrepareAlreadyCalled { job_id: Uuid },

    #[error("a completion was already recorded for job {job_id} in this attempt")]
    CompletionAlreadyRecorded { job_id: Uuid },

    #[error(transparent)]
    Validation(#[from] JobTypeValidationError),

    #[error(transparent)]
    Wait(#[from] WaitForCompletionError),

    /// Infrastructure fault worth retrying (connection reset, serialization
    /// conflict, ...).
    #[error("transient state adapter failure: {0}")]
    Transient(#[source] anyhow::Error),

    /// Infrastructure fault that is not worth retrying.
    #[error("state adapter failure: {0}")]
    Backend(#[source] anyhow::Error),
}

impl QueueError {
    pub fn transient(err: impl Into<anyhow::Error>) -> Self {
        QueueError::Transient(err.into())
    }

    pub fn backend(err: impl Into<anyhow::Error>) -> Self {
        QueueError::Backend(err.into())
    }

    /// The retry decorator only retries these.
    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::Transient(_))
    }

    /// True for errors that mean "this attempt no longer owns the job".
    /// An attempt hitting one of these exits without rescheduling.
    pub fn is_ownership_loss(&self) -> bool {
        matches!(
            self,
            QueueError::JobNotFound { .. }
                | QueueError::JobAlreadyCompleted { .. }
                | QueueError::JobTakenByAnotherWorker { .. }
        )
    }
}

/// Errors produced by attempt handlers.
///
/// Anything that is not a [`AttemptError::Reschedule`] or an ownership loss
/// causes a reschedule with the configured backoff curve.
#[derive(Debug, Error)]
pub enum AttemptError {
    /// Explicit reschedule requested by the handler; the embedded schedule
    /// replaces the backoff curve for this attempt.
    #[error("attempt requested reschedule: {reason:?}")]
    Reschedule {
        schedule: Schedule,
        reason: Option<String>,
    },

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AttemptError {
    /// Reschedule at an absolute instant.
    pub fn reschedule_at(at: chrono::DateTime<chrono::Utc>) -> Self {
        AttemptError::Reschedule {
            schedule: Schedule::At(at),
            reason: None,
        }
    }

    /// Reschedule after a delay.
    pub fn reschedule_after(delay: std::time::Duration) -> Self {
        AttemptError::Reschedule {
            schedule: Schedule::After(delay),
            reason: None,
        }
    }

    pub fn with_reason(self, reason: impl Into<String>) -> Self {
        match self {
            AttemptError::Reschedule { schedule, .. } => AttemptError::Reschedule {
                schedule,
                reason: Some(reason.into()),
            },
            other => other,
        }
    }

    pub fn is_ownership_loss(&self) -> bool {
        matches!(self, AttemptError::Queue(e) if e.is_ownership_loss())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ownership_loss_classification() {
        let job_id = Uuid::new_v4();
        assert!(QueueError::JobNotFound { job_id }.is_ownership_loss());
        assert!(QueueError::JobAlreadyCompleted { job_id }.is_ownership_loss());
        assert!(QueueError::JobTakenByAnotherWorker {
            job_id,
            leased_by: Some("worker-2".into()),
        }
        .is_ownership_loss());
        assert!(!QueueError::transient(anyhow::anyhow!("reset")).is_ownership_loss());
    }

    #[test]
    fn transient_classification() {
        assert!(QueueError::transient(anyhow::anyhow!("conn reset")).is_transient());
        assert!(!QueueError::backend(anyhow::anyhow!("schema missing")).is_transient());
        assert!(!QueueError::JobNotFound {
            job_id: Uuid::new_v4()
        }
        .is_transient());
    }

    #[test]
    fn validation_error_display_includes_code() {
        let err = JobTypeValidationError::new(
            ValidationErrorCode::NotEntry,
            "order:process",
            "only entry types may start a chain",
        );
        let text = err.to_string();
        assert!(text.contains("not_entry"));
        assert!(text.contains("order:process"));
    }

    #[test]
    fn attempt_error_reschedule_carries_schedule() {
        let err = AttemptError::reschedule_after(std::time::Duration::from_millis(250))
            .with_reason("rate limited");
        match err {
            AttemptError::Reschedule { schedule, reason } => {
                assert_eq!(
                    schedule,
                    Schedule::After(std::time::Duration::from_millis(250))
                );
                assert_eq!(reason.as_deref(), Some("rate limited"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn attempt_error_wraps_queue_ownership_loss() {
        let err = AttemptError::from(QueueError::JobAlreadyCompleted {
            job_id: Uuid::new_v4(),
        });
        assert!(err.is_ownership_loss());

        let err = AttemptError::from(anyhow::anyhow!("boom"));
        assert!(!err.is_ownership_loss());
    }

    #[test]
    fn wait_error_reason_display() {
        let err = WaitForCompletionError {
            chain_id: Uuid::new_v4(),
            reason: WaitAbortReason::Timeout,
        };
        assert!(err.to_string().contains("timeout"));
    }
}
