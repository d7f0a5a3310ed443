//! Fetcher tests against a mock listing API

mod common;

use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::{offer_records, published, seed_proxies, shared_backends, test_config, Instance};
use offerflow::utils::retry::RetryPolicy;
use offerflow::coordination::LockManager;
use offerflow::fetcher::Disposition;
use offerflow::{Task, TaskParams, WorkItem};

const ITEMS_PATH: &str = "/exchange/v1/market/items";

fn work_item(page_size: u32, max_pages: Option<u32>) -> WorkItem {
    let mut params = TaskParams::new("a8db");
    params.page_size = page_size;
    params.max_pages = max_pages;
    Task::new("stickers", params, Duration::from_secs(300)).work_item()
}

async fn mount_offset(server: &MockServer, offset: u64, body: serde_json::Value) {
    Mock::given(method("GET"))
        .and(path(ITEMS_PATH))
        .and(query_param("offset", offset.to_string()))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

async fn instance(server: &MockServer) -> (Instance, std::sync::Arc<offerflow::publisher::MemoryTransport>) {
    let (store, transport) = shared_backends();
    let instance = Instance::new(test_config(&server.uri(), "fetch-1"), &store, &transport);
    seed_proxies(&instance.runtime, &["http://10.0.0.1:8080"]).await;
    (instance, transport)
}

#[tokio::test]
async fn test_offset_pagination_until_empty_page() {
    let server = MockServer::start().await;
    mount_offset(&server, 0, json!({ "objects": offer_records(0, 10) })).await;
    mount_offset(&server, 10, json!({ "objects": offer_records(10, 10) })).await;
    mount_offset(&server, 20, json!({ "objects": [] })).await;

    let (instance, transport) = instance(&server).await;
    let outcome = instance.fetcher().process_task(&work_item(10, None)).await;

    assert_eq!(outcome.disposition, Disposition::Completed);
    assert_eq!(outcome.published_count, 20);
    assert_eq!(outcome.pages, 3);
    assert!(outcome.errors.is_empty());

    let messages = published(&transport).await;
    let ids: Vec<_> = messages.iter().map(|m| m.offer.item_id.as_str()).collect();
    let expected: Vec<String> = (0..20).map(|i| format!("item-{i}")).collect();
    assert_eq!(ids, expected);
    assert!(messages.iter().all(|m| m.task_key == "stickers" && m.instance_id == "fetch-1"));
}

#[tokio::test]
async fn test_cursor_pagination() {
    let server = MockServer::start().await;
    mount_offset(&server, 0, json!({ "objects": offer_records(0, 5), "cursor": "c1" })).await;
    Mock::given(method("GET"))
        .and(path(ITEMS_PATH))
        .and(query_param("cursor", "c1"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "objects": offer_records(5, 5), "cursor": "c2" })),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(ITEMS_PATH))
        .and(query_param("cursor", "c2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "objects": null, "cursor": "" })))
        .mount(&server)
        .await;

    let (instance, transport) = instance(&server).await;
    let outcome = instance.fetcher().process_task(&work_item(5, None)).await;

    assert_eq!(outcome.disposition, Disposition::Completed);
    assert_eq!(outcome.published_count, 10);
    assert_eq!(outcome.pages, 3);
    assert_eq!(transport.len().await, 10);
}

#[tokio::test]
async fn test_malformed_records_are_counted_and_skipped() {
    let server = MockServer::start().await;
    let mut records = offer_records(0, 3);
    records.push(json!({ "itemId": "no-price", "title": "Broken" }));
    records.push(json!("not an object"));
    mount_offset(&server, 0, json!(records)).await;
    mount_offset(&server, 5, json!([])).await;

    let (instance, transport) = instance(&server).await;
    let outcome = instance.fetcher().process_task(&work_item(5, None)).await;

    assert_eq!(outcome.disposition, Disposition::Completed);
    assert_eq!(outcome.published_count, 3);
    assert_eq!(outcome.invalid_records, 2);
    assert_eq!(transport.len().await, 3);
}

#[tokio::test]
async fn test_server_error_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(ITEMS_PATH))
        .and(query_param("offset", "0"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    mount_offset(&server, 0, json!(offer_records(0, 4))).await;
    mount_offset(&server, 4, json!([])).await;

    let (instance, _transport) = instance(&server).await;
    let outcome = instance.fetcher().process_task(&work_item(4, None)).await;

    assert_eq!(outcome.disposition, Disposition::Completed);
    assert_eq!(outcome.published_count, 4);
}

#[tokio::test]
async fn test_rate_limited_response_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(ITEMS_PATH))
        .and(query_param("offset", "0"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "1"))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    mount_offset(&server, 0, json!(offer_records(0, 2))).await;
    mount_offset(&server, 2, json!([])).await;

    let (instance, _transport) = instance(&server).await;
    let outcome = instance.fetcher().process_task(&work_item(2, None)).await;

    assert_eq!(outcome.disposition, Disposition::Completed);
    assert_eq!(outcome.published_count, 2);

    // A 429 counts against the proxy before the successful retry resets it
    let health = instance
        .runtime
        .proxies
        .health("http://10.0.0.1:8080")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(health.consecutive_failures, 0);
}

#[tokio::test]
async fn test_exhausted_retries_abort_and_keep_published() {
    let server = MockServer::start().await;
    mount_offset(&server, 0, json!(offer_records(0, 10))).await;
    Mock::given(method("GET"))
        .and(path(ITEMS_PATH))
        .and(query_param("offset", "10"))
        .respond_with(ResponseTemplate::new(500))
        .expect(4)
        .mount(&server)
        .await;

    let (instance, transport) = instance(&server).await;
    let item = work_item(10, None);
    let outcome = instance.fetcher().process_task(&item).await;

    assert_eq!(outcome.disposition, Disposition::Aborted);
    assert_eq!(outcome.published_count, 10);
    assert_eq!(outcome.pages, 1);
    assert!(outcome.errors.iter().any(|e| e.contains("page 2")));
    assert_eq!(transport.len().await, 10);

    // Lock and lease are both returned
    assert!(instance.runtime.proxies.held_proxies().await.is_empty());
    let snapshot = instance.runtime.proxies.snapshot().await.unwrap();
    assert!(snapshot.iter().all(|p| p.lease_owner.is_none()));

    let other = LockManager::new(instance.runtime.store.clone(), "other");
    let lock_key = instance.runtime.keys.task_lock(&item.task_key);
    assert!(other.acquire(&lock_key, Duration::from_secs(5)).await.unwrap().is_some());
}

#[tokio::test]
async fn test_client_error_aborts_without_retry() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(ITEMS_PATH))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let (instance, transport) = instance(&server).await;
    let outcome = instance.fetcher().process_task(&work_item(10, None)).await;

    assert_eq!(outcome.disposition, Disposition::Aborted);
    assert_eq!(outcome.published_count, 0);
    assert!(transport.is_empty().await);
}

#[tokio::test]
async fn test_held_lock_is_contended() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(ITEMS_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(0)
        .mount(&server)
        .await;

    let (instance, _transport) = instance(&server).await;
    let item = work_item(10, None);
    let holder = LockManager::new(instance.runtime.store.clone(), "other");
    let lock_key = instance.runtime.keys.task_lock(&item.task_key);
    holder
        .acquire(&lock_key, Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();

    let outcome = instance.fetcher().process_task(&item).await;
    assert_eq!(outcome.disposition, Disposition::Contended);
    assert_eq!(outcome.pages, 0);
    assert!(instance.runtime.proxies.held_proxies().await.is_empty());
}

#[tokio::test]
async fn test_no_proxy_means_retry_later() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(ITEMS_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(0)
        .mount(&server)
        .await;

    let (store, transport) = shared_backends();
    let instance = Instance::new(test_config(&server.uri(), "fetch-1"), &store, &transport);
    let item = work_item(10, None);

    let outcome = instance.fetcher().process_task(&item).await;
    assert_eq!(outcome.disposition, Disposition::RetryLater);

    // The task lock is not left behind
    let other = LockManager::new(store.clone(), "other");
    let lock_key = instance.runtime.keys.task_lock(&item.task_key);
    assert!(other.acquire(&lock_key, Duration::from_secs(5)).await.unwrap().is_some());
}

#[tokio::test]
async fn test_page_cap_stops_pagination() {
    let server = MockServer::start().await;
    mount_offset(&server, 0, json!(offer_records(0, 10))).await;
    mount_offset(&server, 10, json!(offer_records(10, 10))).await;
    Mock::given(method("GET"))
        .and(path(ITEMS_PATH))
        .and(query_param("offset", "20"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!(offer_records(20, 10))))
        .expect(0)
        .mount(&server)
        .await;

    let (instance, _transport) = instance(&server).await;
    let outcome = instance.fetcher().process_task(&work_item(10, Some(2))).await;

    assert_eq!(outcome.disposition, Disposition::Completed);
    assert_eq!(outcome.pages, 2);
    assert_eq!(outcome.published_count, 20);
}

#[tokio::test]
async fn test_publish_failures_are_reported() {
    let server = MockServer::start().await;
    mount_offset(&server, 0, json!(offer_records(0, 5))).await;
    mount_offset(&server, 5, json!([])).await;

    let (instance, transport) = instance(&server).await;
    transport.fail_next(2);
    let outcome = instance.fetcher().process_task(&work_item(5, None)).await;

    assert_eq!(outcome.disposition, Disposition::Completed);
    assert_eq!(outcome.published_count, 3);
    assert_eq!(outcome.errors.len(), 2);
    assert_eq!(transport.len().await, 3);
}

#[tokio::test]
async fn test_claims_survive_retries_longer_than_their_ttl() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(ITEMS_PATH))
        .and(query_param("offset", "0"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(3)
        .expect(3)
        .mount(&server)
        .await;
    mount_offset(&server, 0, json!(offer_records(0, 2))).await;
    mount_offset(&server, 2, json!([])).await;

    // Four attempts 600ms apart span well past a one second TTL
    let (store, transport) = shared_backends();
    let mut config = test_config(&server.uri(), "fetch-1");
    config.proxies.lease_ttl_secs = 1;
    config.coordination.lock_ttl_secs = 1;
    config.fetch.retry = RetryPolicy::with_delays(3, 600, 600).without_jitter();
    let holder = Instance::new(config, &store, &transport);
    let rival = Instance::new(test_config(&server.uri(), "fetch-2"), &store, &transport);
    seed_proxies(&holder.runtime, &["http://10.0.0.1:8080"]).await;

    let item = work_item(2, None);
    let lock_key = holder.runtime.keys.task_lock(&item.task_key);
    let contender = async {
        let mut stolen = Vec::new();
        for _ in 0..16 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if !rival.runtime.proxies.allocate(Some(1)).await.unwrap().is_empty() {
                stolen.push("lease");
            }
            if rival
                .runtime
                .locks
                .acquire(&lock_key, Duration::from_secs(30))
                .await
                .unwrap()
                .is_some()
            {
                stolen.push("lock");
            }
        }
        stolen
    };

    let fetcher = holder.fetcher();
    let (outcome, stolen) = tokio::join!(fetcher.process_task(&item), contender);

    assert!(stolen.is_empty(), "rival took {stolen:?}");
    assert_eq!(outcome.disposition, Disposition::Completed, "{:?}", outcome.errors);
    assert_eq!(outcome.published_count, 2);
    assert_eq!(transport.len().await, 2);
}
