//! Component wiring
//!
//! [`Runtime`] turns a validated [`Config`] into the shared components every
//! command needs, all pointed at the same store and key prefix.

use std::sync::Arc;
use tracing::info;

use crate::config::Config;
use crate::coordination::{InstanceRegistry, LockManager};
use crate::error::Result;
use crate::fetcher::{FetchContext, Fetcher, MarketClient};
use crate::proxy::{load_proxy_file, ClientProvider, HealthProber, ProxyPool};
use crate::publisher::{MemoryTransport, Publisher, RedisStreamTransport, Transport};
use crate::queue::WorkQueue;
use crate::ratelimit::RateLimiter;
use crate::scheduler::Scheduler;
use crate::server::AppState;
use crate::store::{Keyspace, MemoryStore, RedisStore, SharedStoreRef, StoreBackend};
use crate::worker::Worker;

/// Shared components for one process
pub struct Runtime {
    pub config: Config,
    pub instance_id: String,
    pub store: SharedStoreRef,
    pub keys: Keyspace,
    pub locks: Arc<LockManager>,
    pub registry: Arc<InstanceRegistry>,
    pub proxies: Arc<ProxyPool>,
    pub queue: Arc<WorkQueue>,
    pub publisher: Arc<Publisher>,
}

impl Runtime {
    /// Connect to the configured store and outbound transport
    pub async fn connect(config: Config) -> Result<Self> {
        let (store, transport): (SharedStoreRef, Arc<dyn Transport>) = match config.store.backend {
            StoreBackend::Redis => {
                let redis = RedisStore::connect(&config.store.url, config.store.pool_size).await?;
                let transport =
                    RedisStreamTransport::new(redis.pool(), config.publisher.stream_max_len);
                (Arc::new(redis), Arc::new(transport))
            }
            StoreBackend::Memory => {
                tracing::warn!("Using in-memory store; state is not shared between processes");
                (
                    Arc::new(MemoryStore::new()),
                    Arc::new(MemoryTransport::with_max_len(config.publisher.stream_max_len)),
                )
            }
        };

        store.ping().await?;
        Ok(Self::with_parts(config, store, transport))
    }

    /// Assemble around an existing store and transport
    pub fn with_parts(config: Config, store: SharedStoreRef, transport: Arc<dyn Transport>) -> Self {
        let instance_id = config.instance_id();
        let keys = Keyspace::new(config.store.key_prefix.clone());

        let locks = Arc::new(LockManager::new(Arc::clone(&store), instance_id.clone()));
        let registry = Arc::new(InstanceRegistry::new(Arc::clone(&store), keys.clone()));
        let proxies = Arc::new(ProxyPool::new(
            Arc::clone(&store),
            keys.clone(),
            instance_id.clone(),
            config.proxies.clone(),
        ));
        let queue = Arc::new(WorkQueue::new(
            Arc::clone(&store),
            keys.clone(),
            config.worker.visibility_timeout(),
        ));
        let publisher = Arc::new(Publisher::new(transport, &config.publisher));

        Self {
            config,
            instance_id,
            store,
            keys,
            locks,
            registry,
            proxies,
            queue,
            publisher,
        }
    }

    /// Load the configured proxy file into the shared pool
    ///
    /// Returns the number of proxies now in the pool, 0 when no file is set.
    pub async fn load_proxies(&self) -> Result<usize> {
        let Some(path) = &self.config.proxies.file else {
            return Ok(0);
        };
        let proxies = load_proxy_file(path).await?;
        let total = self.proxies.sync(&proxies).await?;
        info!(file = %path.display(), loaded = proxies.len(), total, "Proxy list loaded");
        Ok(total)
    }

    /// Scheduler over this runtime's queue and locks
    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(
            Arc::clone(&self.store),
            self.keys.clone(),
            Arc::clone(&self.queue),
            Arc::clone(&self.locks),
            self.config.scheduler.clone(),
        )
    }

    /// Fetch dependencies with a fresh instance-local rate limiter
    pub fn fetch_context(&self, clients: Arc<dyn ClientProvider>) -> FetchContext {
        FetchContext {
            instance_id: self.instance_id.clone(),
            keys: self.keys.clone(),
            locks: Arc::clone(&self.locks),
            proxies: Arc::clone(&self.proxies),
            clients,
            limiter: Arc::new(RateLimiter::new(self.config.rate_limit.clone())),
            publisher: Arc::clone(&self.publisher),
        }
    }

    /// Fetcher sharing `ctx`
    pub fn fetcher(&self, ctx: FetchContext) -> Result<Fetcher> {
        Ok(Fetcher::new(
            ctx,
            MarketClient::new(&self.config.api)?,
            self.config.fetch.clone(),
            self.config.coordination.lock_ttl(),
        ))
    }

    /// Worker with health probing through `clients`
    pub fn worker(&self, clients: Arc<dyn ClientProvider>) -> Result<Worker> {
        let ctx = self.fetch_context(Arc::clone(&clients));
        let fetcher = Arc::new(self.fetcher(ctx.clone())?);
        let prober = Arc::new(HealthProber::new(
            Arc::clone(&self.proxies),
            clients,
            self.config.proxies.probe_url.clone(),
        ));

        Ok(Worker::new(
            ctx,
            fetcher,
            Arc::clone(&self.queue),
            Arc::clone(&self.registry),
            self.config.coordination.clone(),
            self.config.worker.clone(),
        )
        .with_prober(prober, self.config.proxies.health_check_interval()))
    }

    /// Status server state
    pub fn app_state(&self) -> AppState {
        AppState {
            instance_id: self.instance_id.clone(),
            registry: Arc::clone(&self.registry),
            queue: Arc::clone(&self.queue),
            instance_expiry: self.config.coordination.instance_expiry(),
        }
    }
}
