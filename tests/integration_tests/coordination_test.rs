//! Coordination across instances sharing one store

use chrono::Utc;
use std::collections::HashSet;
use std::time::Duration;

use super::fixtures::listing_task;
use crate::common::{seed_proxies, shared_backends, test_config, Instance};
use offerflow::coordination::LockManager;

fn cluster(size: usize) -> Vec<Instance> {
    let (store, transport) = shared_backends();
    (1..=size)
        .map(|n| Instance::new(test_config("http://127.0.0.1:1", &format!("node-{n}")), &store, &transport))
        .collect()
}

#[tokio::test]
async fn test_proxy_leases_never_overlap() {
    let nodes = cluster(3);
    let uris: Vec<String> = (1..=5).map(|n| format!("http://10.0.0.{n}:8080")).collect();
    let uris: Vec<&str> = uris.iter().map(String::as_str).collect();
    seed_proxies(&nodes[0].runtime, &uris).await;

    let allocations = futures::future::join_all(
        nodes.iter().map(|node| node.runtime.proxies.allocate(Some(2))),
    )
    .await;

    let mut leased: Vec<String> = Vec::new();
    for leases in allocations {
        leased.extend(leases.unwrap().iter().map(|l| l.proxy_id()));
    }
    let unique: HashSet<_> = leased.iter().cloned().collect();
    assert_eq!(leased.len(), 5);
    assert_eq!(unique.len(), 5);

    // Nothing left for a fourth request
    assert!(nodes[0].runtime.proxies.allocate(Some(1)).await.unwrap().is_empty());

    let released: usize = futures::future::join_all(
        nodes.iter().map(|node| node.runtime.proxies.release_all()),
    )
    .await
    .into_iter()
    .sum();
    assert_eq!(released, 5);
}

#[tokio::test]
async fn test_task_lock_has_single_holder() {
    let (store, _transport) = shared_backends();
    let managers: Vec<LockManager> = (0..10)
        .map(|n| LockManager::new(store.clone(), format!("node-{n}")))
        .collect();

    let results = futures::future::join_all(
        managers
            .iter()
            .map(|m| m.acquire("it:lock:task:stickers", Duration::from_secs(30))),
    )
    .await;

    let winners: Vec<_> = results.into_iter().filter_map(|r| r.unwrap()).collect();
    assert_eq!(winners.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_expired_lease_is_reclaimed() {
    let nodes = cluster(2);
    seed_proxies(&nodes[0].runtime, &["http://10.0.0.1:8080"]).await;

    let crashed = nodes[0].runtime.proxies.allocate(Some(1)).await.unwrap();
    assert_eq!(crashed.len(), 1);
    assert!(nodes[1].runtime.proxies.allocate(Some(1)).await.unwrap().is_empty());

    // The holder never renews; the lease lapses after its TTL
    let ttl = nodes[0].runtime.config.proxies.lease_ttl();
    tokio::time::advance(ttl + Duration::from_secs(1)).await;

    let reclaimed = nodes[1].runtime.proxies.allocate(Some(1)).await.unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert!(!nodes[0].runtime.proxies.renew(&crashed[0]).await.unwrap());
}

#[tokio::test]
async fn test_unacked_item_is_recovered_by_scheduler() {
    let nodes = cluster(2);
    let queue = &nodes[0].runtime.queue;
    let task = listing_task("stickers", 10);
    queue.enqueue(&task.work_item()).await.unwrap();

    // A worker claims the item and dies before acknowledging it
    let claimed = queue.dequeue(Duration::from_secs(1)).await.unwrap().unwrap();
    assert_eq!(claimed.item.task_key, "stickers");
    assert!(queue.is_empty().await.unwrap());
    assert_eq!(queue.in_flight_len().await.unwrap(), 1);

    let visibility = nodes[0].runtime.config.worker.visibility_timeout();
    let later = Utc::now() + offerflow::utils::chrono_duration(visibility) + chrono::Duration::seconds(1);
    let report = nodes[1].runtime.scheduler().tick(later).await.unwrap();
    assert_eq!(report.recovered, 1);
    assert_eq!(queue.len().await.unwrap(), 1);
    assert_eq!(queue.in_flight_len().await.unwrap(), 0);

    let again = queue.dequeue(Duration::from_secs(1)).await.unwrap().unwrap();
    assert_eq!(again.item.id, claimed.item.id);
}

#[tokio::test]
async fn test_scheduler_lock_skips_concurrent_tick() {
    let nodes = cluster(2);
    let runtime = &nodes[0].runtime;
    runtime.scheduler().schedule(&listing_task("stickers", 10)).await.unwrap();

    let holder = LockManager::new(runtime.store.clone(), "elsewhere");
    let _lock = holder
        .acquire(&runtime.keys.scheduler_lock(), Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();

    let report = nodes[1].runtime.scheduler().tick(Utc::now()).await.unwrap();
    assert!(report.skipped);
    assert_eq!(runtime.queue.len().await.unwrap(), 0);
}
