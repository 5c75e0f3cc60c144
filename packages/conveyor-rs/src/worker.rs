//! The worker: notify-accelerated polling dispatch over a processor map.
//!
//! One dispatch task acquires runnable jobs and spawns a detached
//! [`AttemptRunner`](crate::attempt::AttemptRunner) per acquisition, bounded
//! by a concurrency semaphore. When nothing is runnable it reaps one
//! expired lease if there is one, otherwise sleeps until the earliest of:
//! the poll interval, the next scheduled job, a job-scheduled notification,
//! or shutdown.
//!
//! Dispatch errors never kill the worker: they are emitted as
//! `worker_error` events and the loop retries after a poll-interval sleep.
//!
//! ```ignore
//! let worker = Worker::new(client.clone(), WorkerConfig::with_worker_id("worker-1"))
//!     .register("greet", Processor::new(handler_fn(|ctx: AttemptContext| async move {
//!         let name = ctx.job().input["name"].as_str().unwrap_or("world").to_string();
//!         ctx.complete(|_scope| async move {
//!             Ok(Completion::output(json!({ "greeting": format!("Hello, {name}!") })))
//!         })
//!         .await?;
//!         Ok(())
//!     })));
//! worker.start();
//! // ...
//! worker.stop().await;
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::attempt::{AttemptRunner, JobHandler};
use crate::backoff::{with_retries, AdapterRetryPolicy, RetryConfig};
use crate::client::Client;
use crate::error::QueueError;
use crate::events::QueueEvent;
use crate::middleware::AttemptMiddleware;
use crate::state::{run_in_transaction, AcquiredJob, StateContext};
use crate::time::{AttemptSignal, CancelReason};

/// Lease timing of a running attempt. The renew interval must stay well
/// under the lease itself.
#[derive(Debug, Clone, PartialEq)]
pub struct LeaseConfig {
    pub lease: Duration,
    pub renew_interval: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            lease: Duration::from_millis(60_000),
            renew_interval: Duration::from_millis(30_000),
        }
    }
}

impl LeaseConfig {
    pub fn new(lease: Duration, renew_interval: Duration) -> Self {
        Self {
            lease,
            renew_interval,
        }
    }
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Reported in events and recorded in `leased_by` / `completed_by`.
    pub worker_id: String,
    /// Max in-flight attempts.
    pub concurrency: usize,
    /// Idle poll bound.
    pub poll_interval: Duration,
    /// Default attempt backoff curve; overridable per processor.
    pub retry: RetryConfig,
    /// Default lease timing; overridable per processor.
    pub lease: LeaseConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4()),
            concurrency: 1,
            poll_interval: Duration::from_millis(60_000),
            retry: RetryConfig::default(),
            lease: LeaseConfig::default(),
        }
    }
}

impl WorkerConfig {
    pub fn with_worker_id(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }
}

/// A handler plus its per-type overrides.
#[derive(Clone)]
pub struct Processor {
    pub(crate) handler: Arc<dyn JobHandler>,
    pub(crate) retry: Option<RetryConfig>,
    pub(crate) lease: Option<LeaseConfig>,
}

impl Processor {
    pub fn new(handler: impl JobHandler) -> Self {
        Self {
            handler: Arc::new(handler),
            retry: None,
            lease: None,
        }
    }

    pub fn from_arc(handler: Arc<dyn JobHandler>) -> Self {
        Self {
            handler,
            retry: None,
            lease: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_lease(mut self, lease: LeaseConfig) -> Self {
        self.lease = Some(lease);
        self
    }
}

/// A worker bound to a set of job types.
pub struct Worker {
    client: Client,
    config: WorkerConfig,
    processors: HashMap<String, Processor>,
    middlewares: Vec<Arc<dyn AttemptMiddleware>>,
    shutdown: CancellationToken,
    in_flight: Arc<DashMap<Uuid, AttemptSignal>>,
    attempts: TaskTracker,
    dispatch: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    pub fn new(client: Client, config: WorkerConfig) -> Self {
        Self {
            client,
            config,
            processors: HashMap::new(),
            middlewares: Vec::new(),
            shutdown: CancellationToken::new(),
            in_flight: Arc::new(DashMap::new()),
            attempts: TaskTracker::new(),
            dispatch: std::sync::Mutex::new(None),
        }
    }

    /// Register the processor for a job type.
    pub fn register(mut self, type_name: impl Into<String>, processor: Processor) -> Self {
        self.processors.insert(type_name.into(), processor);
        self
    }

    /// Append an attempt middleware; middlewares wrap attempts in the order
    /// they were added.
    pub fn with_middleware(mut self, middleware: Arc<dyn AttemptMiddleware>) -> Self {
        self.middlewares.push(middleware);
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// The job types this worker can process.
    pub fn type_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.processors.keys().cloned().collect();
        names.sort();
        names
    }

    /// Spawn the dispatch task. Idempotent.
    pub fn start(&self) {
        let mut guard = self.dispatch.lock().expect("dispatch lock poisoned");
        if guard.is_some() {
            return;
        }

        let type_names = Arc::new(self.type_names());
        self.client.events().emit(QueueEvent::WorkerStarted {
            worker_id: self.config.worker_id.clone(),
            type_names: type_names.as_ref().clone(),
            concurrency: self.config.concurrency,
        });

        let dispatch = DispatchLoop {
            client: self.client.clone(),
            config: self.config.clone(),
            processors: Arc::new(self.processors.clone()),
            middlewares: Arc::new(self.middlewares.clone()),
            type_names,
            shutdown: self.shutdown.clone(),
            in_flight: Arc::clone(&self.in_flight),
            semaphore: Arc::new(Semaphore::new(self.config.concurrency.max(1))),
            attempts: self.attempts.clone(),
        };
        *guard = Some(tokio::spawn(dispatch.run()));
    }

    /// Cancel dispatch, signal in-flight attempts with `worker_stopping`,
    /// and wait for them to finish.
    pub async fn stop(&self) {
        self.shutdown.cancel();

        let handle = self
            .dispatch
            .lock()
            .expect("dispatch lock poisoned")
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        for entry in self.in_flight.iter() {
            entry.value().cancel(CancelReason::WorkerStopping);
        }
        self.attempts.close();
        self.attempts.wait().await;

        self.client.events().emit(QueueEvent::WorkerStopped {
            worker_id: self.config.worker_id.clone(),
        });
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("worker_id", &self.config.worker_id)
            .field("type_names", &self.type_names())
            .field("concurrency", &self.config.concurrency)
            .finish()
    }
}

struct DispatchLoop {
    client: Client,
    config: WorkerConfig,
    processors: Arc<HashMap<String, Processor>>,
    middlewares: Arc<Vec<Arc<dyn AttemptMiddleware>>>,
    type_names: Arc<Vec<String>>,
    shutdown: CancellationToken,
    in_flight: Arc<DashMap<Uuid, AttemptSignal>>,
    semaphore: Arc<Semaphore>,
    attempts: TaskTracker,
}

impl DispatchLoop {
    async fn run(self) {
        let events = self.client.events().clone();
        let retry_policy = AdapterRetryPolicy::default();

        // Wake the idle sleep on job-scheduled notifications for our types.
        let wake = Arc::new(Notify::new());
        let _scheduled_sub = {
            let wake = Arc::clone(&wake);
            match self
                .client
                .notify()
                .listen_job_scheduled(
                    &self.type_names,
                    Arc::new(move |_, _| {
                        wake.notify_one();
                    }),
                )
                .await
            {
                Ok(subscription) => Some(subscription),
                Err(err) => {
                    events.emit(QueueEvent::NotifyAdapterError {
                        channel: "job_scheduled".to_string(),
                        detail: err.to_string(),
                    });
                    None
                }
            }
        };

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            // Wait for a concurrency slot, cancellable by shutdown.
            let permit = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                permit = Arc::clone(&self.semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            match self.acquire(&retry_policy).await {
                Ok(Some(AcquiredJob { job, has_more: _ })) => {
                    let Some(processor) = self.processors.get(&job.type_name) else {
                        // Cannot happen with our own type set; park the job
                        // instead of losing it.
                        tracing::warn!(job_id = %job.id, type_name = %job.type_name, "acquired a job without a processor");
                        let _ = self
                            .client
                            .state()
                            .reschedule_job(
                                &StateContext::detached(),
                                job.id,
                                crate::job::Schedule::After(self.config.poll_interval),
                                Some("no processor registered".to_string()),
                            )
                            .await;
                        drop(permit);
                        continue;
                    };

                    let signal = AttemptSignal::new();
                    self.in_flight.insert(job.id, signal.clone());

                    let runner = AttemptRunner {
                        client: self.client.clone(),
                        job,
                        worker_id: self.config.worker_id.clone(),
                        lease: processor
                            .lease
                            .clone()
                            .unwrap_or_else(|| self.config.lease.clone()),
                        retry: processor
                            .retry
                            .clone()
                            .unwrap_or_else(|| self.config.retry.clone()),
                        middlewares: Arc::clone(&self.middlewares),
                        handler: Arc::clone(&processor.handler),
                        signal,
                    };

                    let in_flight = Arc::clone(&self.in_flight);
                    self.attempts.spawn(async move {
                        let job_id = runner.job.id;
                        runner.run().await;
                        in_flight.remove(&job_id);
                        drop(permit);
                    });
                    // Loop straight back into acquisition; `has_more` only
                    // tells us the next acquire is likely to hit.
                    continue;
                }
                Ok(None) => {
                    drop(permit);
                    if self.reap_or_sleep(&wake).await {
                        break;
                    }
                }
                Err(err) => {
                    drop(permit);
                    events.emit(QueueEvent::WorkerError {
                        worker_id: self.config.worker_id.clone(),
                        operation: "acquire_job".to_string(),
                        error: err.to_string(),
                    });
                    crate::time::sleep_cancellable(self.config.poll_interval, &self.shutdown)
                        .await;
                }
            }
        }
    }

    async fn acquire(
        &self,
        retry_policy: &AdapterRetryPolicy,
    ) -> Result<Option<AcquiredJob>, QueueError> {
        let events = self.client.events();
        with_retries("acquire_job", retry_policy, events.as_ref(), || {
            let state = Arc::clone(self.client.state());
            let type_names = Arc::clone(&self.type_names);
            let worker_id = self.config.worker_id.clone();
            let lease = self.config.lease.lease;
            async move {
                let inner = Arc::clone(&state);
                run_in_transaction(&*state, &StateContext::detached(), |sc| async move {
                    inner
                        .acquire_job(&sc, &type_names, &worker_id, lease)
                        .await
                })
                .await
            }
        })
        .await
    }

    /// Reap one expired lease, or sleep until something can change.
    /// Returns true when shutdown was requested.
    async fn reap_or_sleep(&self, wake: &Arc<Notify>) -> bool {
        let events = self.client.events();
        let state = self.client.state();
        let detached = StateContext::detached();

        let ignored: Vec<Uuid> = self.in_flight.iter().map(|entry| *entry.key()).collect();
        match state
            .remove_expired_job_lease(&detached, &self.type_names, &ignored)
            .await
        {
            Ok(Some(reaped)) => {
                events.emit(QueueEvent::JobLeaseExpired {
                    job_id: reaped.job.id,
                    type_name: reaped.job.type_name.clone(),
                    leased_by: reaped.previous_worker_id.clone(),
                });
                events.emit(QueueEvent::JobReaped {
                    job_id: reaped.job.id,
                    type_name: reaped.job.type_name.clone(),
                    previous_worker_id: reaped.previous_worker_id.clone(),
                    worker_id: self.config.worker_id.clone(),
                });
                // Tell the previous holder right away; polling would catch
                // it on its next renewal anyway.
                if let Err(err) = self
                    .client
                    .notify()
                    .notify_job_ownership_lost(reaped.job.id)
                    .await
                {
                    events.emit(QueueEvent::NotifyAdapterError {
                        channel: "ownership_lost".to_string(),
                        detail: err.to_string(),
                    });
                }
                // Loop immediately: the reaped job is acquirable now.
                false
            }
            Ok(None) => {
                let bound = state
                    .get_next_job_available_in(&detached, &self.type_names)
                    .await
                    .ok()
                    .flatten();
                let sleep_for = bound
                    .map(|d| d.min(self.config.poll_interval))
                    .unwrap_or(self.config.poll_interval)
                    // Floor keeps a runnable-but-contended queue from
                    // turning the loop into a busy spin.
                    .max(Duration::from_millis(10));

                tokio::select! {
                    _ = self.shutdown.cancelled() => true,
                    _ = wake.notified() => false,
                    _ = tokio::time::sleep(sleep_for) => false,
                }
            }
            Err(err) => {
                events.emit(QueueEvent::WorkerError {
                    worker_id: self.config.worker_id.clone(),
                    operation: "remove_expired_job_lease".to_string(),
                    error: err.to_string(),
                });
                crate::time::sleep_cancellable(self.config.poll_interval, &self.shutdown).await;
                false
            }
        }
    }
}
