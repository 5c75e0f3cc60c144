//! Retry behaviour: backoff-driven reschedules and handler-requested
//! reschedules.

use std::time::{Duration, Instant};

use conveyor::testing::TestQueue;
use conveyor::{
    handler_fn, AttemptContext, AttemptError, Completion, JobTypeRegistry, JobTypeSpec,
    Processor, RetryConfig, StartJobChain, WaitOptions, Worker, WorkerConfig,
};
use serde_json::json;

fn wait_options() -> WaitOptions {
    WaitOptions::new(Duration::from_secs(5)).with_poll_interval(Duration::from_millis(20))
}

fn worker_config(id: &str) -> WorkerConfig {
    let mut config = WorkerConfig::with_worker_id(id);
    config.poll_interval = Duration::from_millis(20);
    config
}

#[tokio::test]
async fn failed_attempt_is_retried_with_backoff() {
    let queue = TestQueue::new(JobTypeRegistry::new().with(JobTypeSpec::entry("might-fail")));

    let retry = RetryConfig::new(
        Duration::from_millis(100),
        2.0,
        Duration::from_millis(1000),
    );
    let worker = Worker::new(queue.client.clone(), worker_config("w1")).register(
        "might-fail",
        Processor::new(handler_fn(|ctx: AttemptContext| async move {
            let should_fail = ctx.job().input["should_fail"].as_bool().unwrap_or(false);
            if should_fail && ctx.job().attempt < 2 {
                return Err(AttemptError::Other(anyhow::anyhow!("simulated failure")));
            }
            ctx.complete(|_scope| async move { Ok(Completion::output(json!({ "success": true }))) })
                .await?;
            Ok(())
        }))
        .with_retry(retry),
    );
    worker.start();

    let started = Instant::now();
    let client = queue.client.clone();
    let chain = queue
        .client
        .with_notify(move |ctx| async move {
            client
                .start_job_chain(
                    &ctx,
                    StartJobChain::new("might-fail", json!({ "should_fail": true })),
                )
                .await
        })
        .await
        .unwrap();

    let done = queue
        .client
        .wait_for_job_chain_completion(chain.id, wait_options())
        .await
        .unwrap();
    worker.stop().await;

    assert_eq!(done.output, Some(json!({ "success": true })));
    assert_eq!(done.attempt, 2);
    assert!(done.last_attempt_error.as_deref().unwrap().contains("simulated failure"));

    // The retry waited out the 100ms initial backoff.
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(queue.events.count_kind("job_attempt_failed"), 1);
    assert_eq!(queue.events.count_kind("job_attempt_completed"), 1);
}

#[tokio::test]
async fn handler_requested_reschedule_uses_its_own_schedule() {
    let queue = TestQueue::new(JobTypeRegistry::new().with(JobTypeSpec::entry("later")));

    let worker = Worker::new(queue.client.clone(), worker_config("w1")).register(
        "later",
        Processor::new(handler_fn(|ctx: AttemptContext| async move {
            if ctx.job().attempt < 2 {
                return Err(
                    AttemptError::reschedule_after(Duration::from_millis(50))
                        .with_reason("waiting for upstream"),
                );
            }
            ctx.complete(|_scope| async move { Ok(Completion::output(json!({ "ready": true }))) })
                .await?;
            Ok(())
        }))
        // The configured curve would wait far longer than the handler asks
        // for; completion in time proves the explicit schedule won.
        .with_retry(RetryConfig::new(
            Duration::from_secs(30),
            2.0,
            Duration::from_secs(60),
        )),
    );
    worker.start();

    let client = queue.client.clone();
    let chain = queue
        .client
        .with_notify(move |ctx| async move {
            client
                .start_job_chain(&ctx, StartJobChain::new("later", json!({})))
                .await
        })
        .await
        .unwrap();

    let done = queue
        .client
        .wait_for_job_chain_completion(chain.id, wait_options())
        .await
        .unwrap();
    worker.stop().await;

    assert_eq!(done.attempt, 2);
    assert!(done
        .last_attempt_error
        .as_deref()
        .unwrap()
        .contains("waiting for upstream"));
}
