//! Blocking until a chain reaches terminal state.
//!
//! Notification-first with a polling safety net: a chain-completed
//! subscription wakes the waiter early, while a periodic re-read guarantees
//! progress even when every notification is lost.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::client::Client;
use crate::error::{QueueError, WaitAbortReason, WaitForCompletionError};
use crate::events::QueueEvent;
use crate::job::Job;
use crate::state::StateContext;

/// Default re-read interval while waiting.
pub const DEFAULT_WAIT_POLL_INTERVAL: Duration = Duration::from_secs(15);

/// Options for [`Client::wait_for_job_chain_completion`].
#[derive(Debug, Clone)]
pub struct WaitOptions {
    pub timeout: Duration,
    pub poll_interval: Duration,
    /// Caller-side abort signal.
    pub signal: Option<CancellationToken>,
}

impl WaitOptions {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            poll_interval: DEFAULT_WAIT_POLL_INTERVAL,
            signal: None,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_signal(mut self, signal: CancellationToken) -> Self {
        self.signal = Some(signal);
        self
    }
}

async fn aborted(signal: &Option<CancellationToken>) {
    match signal {
        Some(signal) => signal.cancelled().await,
        None => std::future::pending().await,
    }
}

impl Client {
    /// Wait until the chain's latest job is completed and return it.
    ///
    /// Ends with [`WaitForCompletionError`] (reason `Timeout` or `Aborted`)
    /// when the deadline passes or the caller's signal fires; the chain is
    /// unaffected either way.
    pub async fn wait_for_job_chain_completion(
        &self,
        chain_id: Uuid,
        options: WaitOptions,
    ) -> Result<Job, QueueError> {
        let detached = StateContext::detached();

        let snapshot = self
            .state()
            .get_job_chain_by_id(&detached, chain_id)
            .await?
            .ok_or(QueueError::ChainNotFound { chain_id })?;
        if snapshot.is_terminal() {
            return Ok(snapshot.latest);
        }

        let notified = Arc::new(Notify::new());
        let _subscription = {
            let notified = Arc::clone(&notified);
            match self
                .notify()
                .listen_job_chain_completed(
                    chain_id,
                    Arc::new(move |_| {
                        notified.notify_one();
                    }),
                )
                .await
            {
                Ok(subscription) => Some(subscription),
                Err(err) => {
                    // Degrade to pure polling.
                    self.events().emit(QueueEvent::NotifyAdapterError {
                        channel: "chain_completed".to_string(),
                        detail: err.to_string(),
                    });
                    None
                }
            }
        };

        let deadline = tokio::time::Instant::now() + options.timeout;
        loop {
            tokio::select! {
                _ = notified.notified() => {}
                _ = tokio::time::sleep(options.poll_interval) => {}
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(WaitForCompletionError {
                        chain_id,
                        reason: WaitAbortReason::Timeout,
                    }
                    .into());
                }
                _ = aborted(&options.signal) => {
                    return Err(WaitForCompletionError {
                        chain_id,
                        reason: WaitAbortReason::Aborted,
                    }
                    .into());
                }
            }

            let snapshot = self
                .state()
                .get_job_chain_by_id(&detached, chain_id)
                .await?
                .ok_or(QueueError::ChainNotFound { chain_id })?;
            if snapshot.is_terminal() {
                return Ok(snapshot.latest);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::client::{Completion, StartJobChain};
    use crate::memory::MemoryStateAdapter;
    use crate::notify::{InProcessNotifyAdapter, NoopNotifyAdapter, NotifyAdapter};
    use crate::registry::{JobTypeRegistry, JobTypeSpec};
    use crate::state::StateAdapter;

    fn client_with(notify: Arc<dyn NotifyAdapter>) -> Client {
        Client::new(
            Arc::new(MemoryStateAdapter::new()) as Arc<dyn StateAdapter>,
            notify,
            Arc::new(JobTypeRegistry::new().with(JobTypeSpec::entry("greet"))),
        )
    }

    async fn start(client: &Client) -> uuid::Uuid {
        let inner = client.clone();
        inner
            .clone()
            .with_notify(move |ctx| async move {
                inner
                    .start_job_chain(&ctx, StartJobChain::new("greet", serde_json::json!({})))
                    .await
            })
            .await
            .unwrap()
            .id
    }

    async fn complete(client: &Client, chain_id: uuid::Uuid) {
        let inner = client.clone();
        inner
            .clone()
            .with_notify(move |ctx| async move {
                inner
                    .complete_job_chain(&ctx, chain_id, "greet", |_| async move {
                        Ok(Completion::output(serde_json::json!({"done": true})))
                    })
                    .await
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn returns_immediately_for_terminal_chains() {
        let client = client_with(Arc::new(NoopNotifyAdapter));
        let chain_id = start(&client).await;
        complete(&client, chain_id).await;

        let job = client
            .wait_for_job_chain_completion(chain_id, WaitOptions::new(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(job.output, Some(serde_json::json!({"done": true})));
    }

    #[tokio::test]
    async fn unknown_chain_is_an_error() {
        let client = client_with(Arc::new(NoopNotifyAdapter));
        let err = client
            .wait_for_job_chain_completion(
                uuid::Uuid::new_v4(),
                WaitOptions::new(Duration::from_millis(50)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::ChainNotFound { .. }));
    }

    #[tokio::test]
    async fn notification_wakes_the_waiter() {
        let client = client_with(Arc::new(InProcessNotifyAdapter::new()));
        let chain_id = start(&client).await;

        let waiter = client.clone();
        let handle = tokio::spawn(async move {
            waiter
                .wait_for_job_chain_completion(
                    chain_id,
                    // Poll far beyond the test horizon: only the
                    // notification can wake us in time.
                    WaitOptions::new(Duration::from_secs(5))
                        .with_poll_interval(Duration::from_secs(60)),
                )
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        complete(&client, chain_id).await;

        let job = handle.await.unwrap().unwrap();
        assert_eq!(job.output, Some(serde_json::json!({"done": true})));
    }

    #[tokio::test]
    async fn polling_covers_lost_notifications() {
        // Noop adapter: completion emits nothing, the poll must find it.
        let client = client_with(Arc::new(NoopNotifyAdapter));
        let chain_id = start(&client).await;

        let waiter = client.clone();
        let handle = tokio::spawn(async move {
            waiter
                .wait_for_job_chain_completion(
                    chain_id,
                    WaitOptions::new(Duration::from_secs(5))
                        .with_poll_interval(Duration::from_millis(20)),
                )
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        complete(&client, chain_id).await;

        let job = handle.await.unwrap().unwrap();
        assert_eq!(job.output, Some(serde_json::json!({"done": true})));
    }

    #[tokio::test]
    async fn timeout_reports_timeout_reason() {
        let client = client_with(Arc::new(NoopNotifyAdapter));
        let chain_id = start(&client).await;

        let err = client
            .wait_for_job_chain_completion(
                chain_id,
                WaitOptions::new(Duration::from_millis(30))
                    .with_poll_interval(Duration::from_millis(10)),
            )
            .await
            .unwrap_err();
        match err {
            QueueError::Wait(wait) => {
                assert_eq!(wait.chain_id, chain_id);
                assert_eq!(wait.reason, WaitAbortReason::Timeout);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn caller_signal_reports_aborted_reason() {
        let client = client_with(Arc::new(NoopNotifyAdapter));
        let chain_id = start(&client).await;

        let signal = CancellationToken::new();
        let trigger = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = client
            .wait_for_job_chain_completion(
                chain_id,
                WaitOptions::new(Duration::from_secs(5))
                    .with_poll_interval(Duration::from_secs(60))
                    .with_signal(signal),
            )
            .await
            .unwrap_err();
        match err {
            QueueError::Wait(wait) => assert_eq!(wait.reason, WaitAbortReason::Aborted),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn subscription_is_disposed_after_wait() {
        let notify = Arc::new(InProcessNotifyAdapter::new());
        let client = client_with(Arc::clone(&notify) as Arc<dyn NotifyAdapter>);
        let chain_id = start(&client).await;

        let _ = client
            .wait_for_job_chain_completion(
                chain_id,
                WaitOptions::new(Duration::from_millis(20))
                    .with_poll_interval(Duration::from_millis(10)),
            )
            .await;

        assert_eq!(notify.subscriber_count(), 0);
    }
}
