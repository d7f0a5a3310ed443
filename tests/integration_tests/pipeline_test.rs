//! End-to-end pipeline tests
//!
//! Three instances compete for the same task over a shared store; exactly
//! one runs it and every offer reaches the transport once.

use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use wiremock::MockServer;

use super::fixtures::{listing_task, mount_listing, PROXIES};
use crate::common::{direct_clients, published, seed_proxies, shared_backends, test_config, Instance};
use offerflow::coordination::{InstanceStatus, LockManager};
use offerflow::fetcher::Disposition;

#[tokio::test]
async fn test_competing_instances_process_task_once() {
    let server = MockServer::start().await;
    mount_listing(&server, 2, 10, Duration::from_millis(200)).await;

    let (store, transport) = shared_backends();
    let instances: Vec<Instance> = (1..=3)
        .map(|n| Instance::new(test_config(&server.uri(), &format!("node-{n}")), &store, &transport))
        .collect();
    seed_proxies(&instances[0].runtime, PROXIES).await;

    let item = listing_task("stickers", 10).work_item();
    let fetchers: Vec<_> = instances.iter().map(Instance::fetcher).collect();
    let outcomes = futures::future::join_all(fetchers.iter().map(|f| f.process_task(&item))).await;

    let completed: Vec<_> = outcomes
        .iter()
        .filter(|o| o.disposition == Disposition::Completed)
        .collect();
    let contended = outcomes
        .iter()
        .filter(|o| o.disposition == Disposition::Contended)
        .count();
    assert_eq!(completed.len(), 1);
    assert_eq!(contended, 2);
    assert_eq!(completed[0].published_count, 20);

    let messages = published(&transport).await;
    let unique: HashSet<_> = messages.iter().map(|m| m.offer.item_id.clone()).collect();
    assert_eq!(messages.len(), 20);
    assert_eq!(unique.len(), 20);

    for instance in &instances {
        assert!(instance.runtime.proxies.held_proxies().await.is_empty());
    }
}

#[tokio::test]
async fn test_each_offer_carries_price_in_cents() {
    let server = MockServer::start().await;
    mount_listing(&server, 1, 3, Duration::ZERO).await;

    let (store, transport) = shared_backends();
    let instance = Instance::new(test_config(&server.uri(), "node-1"), &store, &transport);
    seed_proxies(&instance.runtime, PROXIES).await;

    let outcome = instance
        .fetcher()
        .process_task(&listing_task("stickers", 3).work_item())
        .await;
    assert_eq!(outcome.disposition, Disposition::Completed);

    let prices: Vec<u64> = published(&transport)
        .await
        .iter()
        .map(|m| m.offer.price)
        .collect();
    assert_eq!(prices, vec![100, 101, 102]);
}

#[tokio::test]
async fn test_workers_drain_scheduled_task() {
    let server = MockServer::start().await;
    mount_listing(&server, 2, 10, Duration::ZERO).await;

    let (store, transport) = shared_backends();
    let first = Instance::new(test_config(&server.uri(), "worker-1"), &store, &transport);
    let second = Instance::new(test_config(&server.uri(), "worker-2"), &store, &transport);
    seed_proxies(&first.runtime, PROXIES).await;

    let scheduler = first.runtime.scheduler();
    scheduler.schedule(&listing_task("stickers", 10)).await.unwrap();
    let report = scheduler.tick(Utc::now()).await.unwrap();
    assert_eq!(report.enqueued, 1);

    let workers = [
        Arc::new(first.runtime.worker(direct_clients()).unwrap()),
        Arc::new(second.runtime.worker(direct_clients()).unwrap()),
    ];
    let handles: Vec<_> = workers
        .iter()
        .map(|worker| {
            let worker = Arc::clone(worker);
            tokio::spawn(async move { worker.run().await })
        })
        .collect();

    let delivered = tokio::time::timeout(Duration::from_secs(10), async {
        while transport.len().await < 20 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(delivered.is_ok(), "offers were not delivered in time");

    // Give the finishing worker a moment to ack
    let acked = tokio::time::timeout(Duration::from_secs(5), async {
        while first.runtime.queue.in_flight_len().await.unwrap() > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(acked.is_ok(), "work item was not acknowledged");

    for worker in &workers {
        worker.shutdown();
    }
    let mut claimed = 0;
    for handle in handles {
        let summary = handle.await.unwrap().unwrap();
        claimed += summary.claimed;
        assert_eq!(summary.aborted_on_shutdown, 0);
    }
    assert_eq!(claimed, 1);

    assert_eq!(transport.len().await, 20);
    assert!(first.runtime.queue.is_empty().await.unwrap());

    let records = first.runtime.registry.instances().await.unwrap();
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.status == InstanceStatus::Stopped));

    let snapshot = first.runtime.proxies.snapshot().await.unwrap();
    assert!(snapshot.iter().all(|p| p.lease_owner.is_none()));
}

#[tokio::test]
async fn test_grace_expiry_aborts_and_redelivers() {
    let server = MockServer::start().await;
    mount_listing(&server, 1, 10, Duration::from_secs(10)).await;

    let (store, transport) = shared_backends();
    let mut config = test_config(&server.uri(), "worker-1");
    config.worker.shutdown_grace_secs = 1;
    let instance = Instance::new(config, &store, &transport);
    seed_proxies(&instance.runtime, &["http://10.0.0.1:8080"]).await;

    let queue = Arc::clone(&instance.runtime.queue);
    let item = listing_task("stickers", 10).work_item();
    queue.enqueue(&item).await.unwrap();

    let worker = Arc::new(instance.runtime.worker(direct_clients()).unwrap());
    let handle = {
        let worker = Arc::clone(&worker);
        tokio::spawn(async move { worker.run().await })
    };

    let requested = tokio::time::timeout(Duration::from_secs(5), async {
        while server.received_requests().await.unwrap_or_default().is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(requested.is_ok(), "first page was never requested");

    worker.shutdown();
    let summary = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("worker did not stop after the grace period")
        .unwrap()
        .unwrap();
    assert_eq!(summary.claimed, 1);
    assert_eq!(summary.aborted_on_shutdown, 1);
    assert_eq!(summary.locks_released, 1);
    assert_eq!(summary.leases_released, 1);
    assert!(transport.is_empty().await);

    // Lock and lease are free for whoever picks the item up next
    let other = LockManager::new(store.clone(), "worker-2");
    let lock_key = instance.runtime.keys.task_lock(&item.task_key);
    assert!(other.acquire(&lock_key, Duration::from_secs(5)).await.unwrap().is_some());
    let snapshot = instance.runtime.proxies.snapshot().await.unwrap();
    assert!(snapshot.iter().all(|p| p.lease_owner.is_none()));

    // The aborted item was never acked and comes back after its visibility deadline
    assert_eq!(queue.in_flight_len().await.unwrap(), 1);
    let visibility = instance.runtime.config.worker.visibility_timeout();
    let later = Utc::now() + offerflow::utils::chrono_duration(visibility) + chrono::Duration::seconds(1);
    assert_eq!(queue.requeue_expired(later).await.unwrap(), 1);
    let again = queue.dequeue(Duration::from_secs(1)).await.unwrap().unwrap();
    assert_eq!(again.item.id, item.id);
}
