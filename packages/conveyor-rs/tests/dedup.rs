//! Chain deduplication: scopes, windows, and concurrent starts.

use std::time::Duration;

use conveyor::testing::TestQueue;
use conveyor::{
    Completion, Deduplication, DeduplicationScope, JobChain, JobTypeRegistry, JobTypeSpec,
    QueueError, StartJobChain,
};
use serde_json::json;
use uuid::Uuid;

fn queue() -> TestQueue {
    TestQueue::new(JobTypeRegistry::new().with(JobTypeSpec::entry("sync-data")))
}

async fn start_with_dedup(queue: &TestQueue, dedup: Deduplication) -> JobChain {
    let client = queue.client.clone();
    queue
        .client
        .with_notify(move |ctx| async move {
            client
                .start_job_chain(
                    &ctx,
                    StartJobChain::new("sync-data", json!({ "source_id": "db" }))
                        .with_deduplication(dedup),
                )
                .await
        })
        .await
        .unwrap()
}

async fn complete_externally(queue: &TestQueue, chain_id: Uuid) {
    let client = queue.client.clone();
    queue
        .client
        .with_notify(move |ctx| async move {
            client
                .complete_job_chain(&ctx, chain_id, "sync-data", |_scope| async move {
                    Ok(Completion::output(json!({ "synced": true })))
                })
                .await
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn incomplete_scope_with_window() {
    let queue = queue();
    let dedup = Deduplication::new("sync:db", DeduplicationScope::Incomplete)
        .with_window(Duration::from_millis(500));

    let first = start_with_dedup(&queue, dedup.clone()).await;
    assert!(!first.deduplicated);

    // Immediately again: the incomplete chain within the window matches.
    let second = start_with_dedup(&queue, dedup.clone()).await;
    assert!(second.deduplicated);
    assert_eq!(second.id, first.id);

    // Finish the first chain and let the window pass.
    complete_externally(&queue, first.id).await;
    tokio::time::sleep(Duration::from_millis(600)).await;

    let third = start_with_dedup(&queue, dedup).await;
    assert!(!third.deduplicated);
    assert_ne!(third.id, first.id);

    assert_eq!(queue.state.jobs_snapshot().await.len(), 2);
}

#[tokio::test]
async fn incomplete_scope_ignores_completed_chains() {
    let queue = queue();
    let dedup = Deduplication::new("sync:db", DeduplicationScope::Incomplete);

    let first = start_with_dedup(&queue, dedup.clone()).await;
    complete_externally(&queue, first.id).await;

    // No window, but the chain is terminal: a fresh one is created.
    let second = start_with_dedup(&queue, dedup).await;
    assert!(!second.deduplicated);
    assert_ne!(second.id, first.id);
}

#[tokio::test]
async fn any_scope_matches_completed_chains_within_window() {
    let queue = queue();
    let dedup = Deduplication::new("sync:db", DeduplicationScope::Any)
        .with_window(Duration::from_millis(300));

    let first = start_with_dedup(&queue, dedup.clone()).await;
    complete_externally(&queue, first.id).await;

    let second = start_with_dedup(&queue, dedup.clone()).await;
    assert!(second.deduplicated);
    assert_eq!(second.id, first.id);

    tokio::time::sleep(Duration::from_millis(350)).await;
    let third = start_with_dedup(&queue, dedup).await;
    assert!(!third.deduplicated);
}

#[tokio::test]
async fn zero_window_never_deduplicates() {
    let queue = queue();
    let dedup =
        Deduplication::new("sync:db", DeduplicationScope::Any).with_window(Duration::ZERO);

    let first = start_with_dedup(&queue, dedup.clone()).await;
    let second = start_with_dedup(&queue, dedup).await;
    assert!(!first.deduplicated);
    assert!(!second.deduplicated);
    assert_ne!(second.id, first.id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_starts_create_exactly_one_chain() {
    let queue = queue();
    let dedup = Deduplication::new("sync:db", DeduplicationScope::Incomplete);

    let mut handles = Vec::new();
    for _ in 0..10 {
        let client = queue.client.clone();
        let dedup = dedup.clone();
        handles.push(tokio::spawn(async move {
            let inner = client.clone();
            client
                .with_notify(move |ctx| async move {
                    inner
                        .start_job_chain(
                            &ctx,
                            StartJobChain::new("sync-data", json!({ "source_id": "db" }))
                                .with_deduplication(dedup),
                        )
                        .await
                })
                .await
        }));
    }

    let mut created = Vec::new();
    let mut deduplicated = Vec::new();
    for handle in handles {
        let chain: Result<JobChain, QueueError> = handle.await.unwrap();
        let chain = chain.unwrap();
        if chain.deduplicated {
            deduplicated.push(chain.id);
        } else {
            created.push(chain.id);
        }
    }

    assert_eq!(created.len(), 1);
    assert_eq!(deduplicated.len(), 9);
    assert!(deduplicated.iter().all(|id| *id == created[0]));
    assert_eq!(queue.state.jobs_snapshot().await.len(), 1);
}
