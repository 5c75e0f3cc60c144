//! Fan-out/fan-in through blocker chains.

use std::time::Duration;

use conveyor::testing::TestQueue;
use conveyor::{
    handler_fn, AttemptContext, Completion, JobTypeRegistry, JobTypeSpec, Processor,
    StartJobChain, WaitOptions, Worker, WorkerConfig,
};
use serde_json::json;

fn registry() -> JobTypeRegistry {
    JobTypeRegistry::new()
        .with(
            JobTypeSpec::entry("process-with-blockers")
                .with_blockers(["fetch-user", "fetch-permissions"]),
        )
        .with(JobTypeSpec::internal("fetch-user"))
        .with(JobTypeSpec::internal("fetch-permissions"))
}

#[tokio::test]
async fn blocked_job_runs_after_all_blockers_and_sees_their_outputs() {
    let queue = TestQueue::new(registry());

    let mut config = WorkerConfig::with_worker_id("w1");
    config.poll_interval = Duration::from_millis(20);
    config.concurrency = 3;

    let worker = Worker::new(queue.client.clone(), config)
        .register(
            "fetch-user",
            Processor::new(handler_fn(|ctx: AttemptContext| async move {
                let user_id = ctx.job().input["user_id"].as_str().unwrap().to_string();
                ctx.complete(|_scope| async move {
                    Ok(Completion::output(
                        json!({ "user_id": user_id, "name": "Jo" }),
                    ))
                })
                .await?;
                Ok(())
            })),
        )
        .register(
            "fetch-permissions",
            Processor::new(handler_fn(|ctx: AttemptContext| async move {
                ctx.complete(|_scope| async move {
                    Ok(Completion::output(json!({ "roles": ["admin"] })))
                })
                .await?;
                Ok(())
            })),
        )
        .register(
            "process-with-blockers",
            Processor::new(handler_fn(|ctx: AttemptContext| async move {
                // By the time this runs, every blocker must be terminal
                // with a resolved output, in declaration order.
                let blockers = ctx.blockers().to_vec();
                assert_eq!(blockers.len(), 2);
                assert_eq!(blockers[0].chain_type_name, "fetch-user");
                assert_eq!(blockers[1].chain_type_name, "fetch-permissions");
                let user = blockers[0].output.clone().expect("user output");
                let permissions = blockers[1].output.clone().expect("permissions output");

                let task_id = ctx.job().input["task_id"].as_str().unwrap().to_string();
                ctx.complete(|_scope| async move {
                    Ok(Completion::output(json!({
                        "task_id": task_id,
                        "user": user,
                        "permissions": permissions,
                    })))
                })
                .await?;
                Ok(())
            })),
        );
    worker.start();

    let client = queue.client.clone();
    let chain = queue
        .client
        .with_notify(move |ctx| {
            let outer = client.clone();
            async move {
                outer
                    .clone()
                    .start_job_chain_with_blockers(
                        &ctx,
                        StartJobChain::new("process-with-blockers", json!({ "task_id": "t" })),
                        move |scope| {
                            let inner = outer.clone();
                            async move {
                                let user = inner
                                    .start_job_chain(
                                        &scope,
                                        StartJobChain::new(
                                            "fetch-user",
                                            json!({ "user_id": "u1" }),
                                        ),
                                    )
                                    .await?;
                                let permissions = inner
                                    .start_job_chain(
                                        &scope,
                                        StartJobChain::new(
                                            "fetch-permissions",
                                            json!({ "user_id": "u1" }),
                                        ),
                                    )
                                    .await?;
                                Ok(vec![user, permissions])
                            }
                        },
                    )
                    .await
            }
        })
        .await
        .unwrap();

    let done = queue
        .client
        .wait_for_job_chain_completion(
            chain.id,
            WaitOptions::new(Duration::from_secs(5)).with_poll_interval(Duration::from_millis(20)),
        )
        .await
        .unwrap();
    worker.stop().await;

    assert_eq!(
        done.output,
        Some(json!({
            "task_id": "t",
            "user": { "user_id": "u1", "name": "Jo" },
            "permissions": { "roles": ["admin"] },
        }))
    );

    // The main job was blocked first and unblocked exactly once.
    assert_eq!(queue.events.count_kind("job_blocked"), 1);
    assert_eq!(queue.events.count_kind("job_unblocked"), 1);

    // Three terminal chains: two blockers plus the main one.
    assert_eq!(queue.events.count_kind("job_chain_completed"), 3);
}
