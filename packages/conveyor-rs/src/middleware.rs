//! Attempt middlewares.
//!
//! Middlewares wrap the handler body of every attempt in declaration order,
//! tower-style: each one receives the context and a [`Next`] it must call
//! (or short-circuit) to proceed.

use std::sync::Arc;

use async_trait::async_trait;

use crate::attempt::{AttemptContext, JobHandler};
use crate::error::AttemptError;

/// Wraps one attempt execution.
#[async_trait]
pub trait AttemptMiddleware: Send + Sync + 'static {
    async fn handle(&self, ctx: &AttemptContext, next: Next<'_>) -> Result<(), AttemptError>;
}

/// The remaining middleware chain plus the final handler.
pub struct Next<'a> {
    pub(crate) middlewares: &'a [Arc<dyn AttemptMiddleware>],
    pub(crate) handler: &'a dyn JobHandler,
}

impl<'a> Next<'a> {
    pub(crate) fn new(
        middlewares: &'a [Arc<dyn AttemptMiddleware>],
        handler: &'a dyn JobHandler,
    ) -> Self {
        Self {
            middlewares,
            handler,
        }
    }

    /// Run the rest of the chain.
    pub async fn run(self, ctx: &AttemptContext) -> Result<(), AttemptError> {
        match self.middlewares.split_first() {
            Some((head, rest)) => {
                head.handle(ctx, Next::new(rest, self.handler)).await
            }
            None => self.handler.run(ctx).await,
        }
    }
}
