//! Common test utilities
#![allow(dead_code)]

use serde_json::{json, Value};
use std::sync::Arc;

use offerflow::config::Config;
use offerflow::fetcher::Fetcher;
use offerflow::proxy::{ClientProvider, DirectClientProvider, ProxyAddress};
use offerflow::publisher::MemoryTransport;
use offerflow::runtime::Runtime;
use offerflow::store::{MemoryStore, SharedStoreRef, StoreBackend};
use offerflow::utils::retry::RetryPolicy;
use std::time::Duration;

/// Configuration tuned for fast, deterministic tests against `base_url`
pub fn test_config(base_url: &str, instance_id: &str) -> Config {
    let mut config = Config::default();
    config.instance.id = Some(instance_id.to_string());
    config.store.backend = StoreBackend::Memory;
    config.store.key_prefix = "it".to_string();
    config.api.base_url = base_url.to_string();
    config.api.request_timeout_secs = 5;

    config.rate_limit.requests_per_second = 1_000;
    config.rate_limit.burst = 1_000;
    config.rate_limit.per_proxy_requests_per_second = 1_000;
    config.rate_limit.per_proxy_burst = 1_000;

    config.fetch.page_delay_ms = 0;
    config.fetch.retry = RetryPolicy::with_delays(3, 5, 50).without_jitter();
    config.proxies.allocation_retry = RetryPolicy::with_delays(1, 5, 10).without_jitter();
    config.publisher.retry = RetryPolicy::with_delays(0, 1, 1).without_jitter();

    config.worker.dequeue_timeout_secs = 1;
    config.worker.shutdown_grace_secs = 5;
    config
}

/// One instance's components over a shared store and transport
pub struct Instance {
    pub runtime: Runtime,
}

impl Instance {
    pub fn new(config: Config, store: &SharedStoreRef, transport: &Arc<MemoryTransport>) -> Self {
        let runtime = Runtime::with_parts(config, Arc::clone(store), transport.clone());
        Self { runtime }
    }

    pub fn fetcher(&self) -> Fetcher {
        let ctx = self.runtime.fetch_context(direct_clients());
        self.runtime.fetcher(ctx).unwrap()
    }
}

/// Shared backends for a simulated cluster
pub fn shared_backends() -> (SharedStoreRef, Arc<MemoryTransport>) {
    (Arc::new(MemoryStore::new()), Arc::new(MemoryTransport::new()))
}

/// Route requests straight to the mock server while still leasing proxies
pub fn direct_clients() -> Arc<dyn ClientProvider> {
    Arc::new(DirectClientProvider::new(Duration::from_secs(5)))
}

/// Load `uris` into the shared proxy pool
pub async fn seed_proxies(runtime: &Runtime, uris: &[&str]) {
    let proxies: Vec<ProxyAddress> = uris.iter().map(|u| u.parse().unwrap()).collect();
    runtime.proxies.sync(&proxies).await.unwrap();
}

/// `count` valid listing records numbered from `start`
pub fn offer_records(start: usize, count: usize) -> Vec<Value> {
    (start..start + count)
        .map(|i| {
            json!({
                "itemId": format!("item-{i}"),
                "title": format!("Sticker Capsule #{i}"),
                "price": { "USD": format!("{}", 100 + i) },
                "gameId": "a8db",
            })
        })
        .collect()
}

/// Decode every message the transport accepted
pub async fn published(transport: &MemoryTransport) -> Vec<offerflow::OfferMessage> {
    transport
        .messages()
        .await
        .into_iter()
        .map(|(_, payload)| serde_json::from_str(&payload).unwrap())
        .collect()
}
