//! Explicit per-call context.
//!
//! No ambient task-local state anywhere: every queue operation receives a
//! [`QueueContext`] bundling the transaction it should join, the notify
//! batch collecting its wake-ups, and, when running on behalf of a job,
//! the origin linkage of that job. Cheap to clone and derive.

use std::sync::Arc;

use crate::batch::NotifyBatch;
use crate::job::JobOrigin;
use crate::state::StateContext;

/// Context threaded through client and worker operations.
#[derive(Debug, Clone, Default)]
pub struct QueueContext {
    state: StateContext,
    batch: Option<Arc<NotifyBatch>>,
    origin: Option<JobOrigin>,
}

impl QueueContext {
    /// A root context: no transaction, no notify scope, no origin.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &StateContext {
        &self.state
    }

    pub fn in_transaction(&self) -> bool {
        self.state.in_transaction()
    }

    /// The notify batch of the enclosing scope, if any.
    pub fn notify_batch(&self) -> Option<&Arc<NotifyBatch>> {
        self.batch.as_ref()
    }

    /// Origin linkage when this context runs on behalf of a job.
    pub fn origin(&self) -> Option<&JobOrigin> {
        self.origin.as_ref()
    }

    /// Derive a context that joins the given state transaction.
    pub fn join_transaction(&self, state: StateContext) -> Self {
        Self {
            state,
            batch: self.batch.clone(),
            origin: self.origin.clone(),
        }
    }

    /// Derive a context with a notify scope. Joins an existing outer scope
    /// instead of replacing it.
    pub fn with_notify_batch(&self, batch: Arc<NotifyBatch>) -> Self {
        Self {
            state: self.state,
            batch: Some(self.batch.clone().unwrap_or(batch)),
            origin: self.origin.clone(),
        }
    }

    /// Derive a context scoped to work created by `origin`.
    pub fn with_origin(&self, origin: JobOrigin) -> Self {
        Self {
            state: self.state,
            batch: self.batch.clone(),
            origin: Some(origin),
        }
    }

    /// Derive a context without origin linkage.
    pub fn without_origin(&self) -> Self {
        Self {
            state: self.state,
            batch: self.batch.clone(),
            origin: None,
        }
    }
}
