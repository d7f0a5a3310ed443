//! offerflow - Distributed marketplace listing ingestion
//!
//! Many processes cooperatively page through a marketplace listing API,
//! each request routed through a leased proxy, and publish every validated
//! offer to an outbound Redis stream. All coordination state lives in a
//! shared store, so any number of instances can run side by side without
//! fetching the same task or proxy twice.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`config`] - Configuration loading and validation
//! - [`store`] - Shared key-value store (Redis or in-memory)
//! - [`coordination`] - Distributed locks, instance registry, heartbeats
//! - [`proxy`] - Proxy list parsing, shared proxy pool, health probing
//! - [`ratelimit`] - Token-bucket admission per instance and per proxy
//! - [`fetcher`] - Task processing against the listing API
//! - [`publisher`] - Offer delivery to the outbound topic
//! - [`queue`] - Priority work queue with delayed and in-flight sets
//! - [`scheduler`] - Periodic task schedules
//! - [`worker`] - Instance runtime tying everything together
//! - [`server`] - Status endpoints
//! - [`metrics`] - Prometheus metrics
//! - [`utils`] - Retry policy, per-domain errors, helpers
//!
//! # Example
//!
//! ```no_run
//! use offerflow::config::Config;
//! use offerflow::proxy::ReqwestClientProvider;
//! use offerflow::runtime::Runtime;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> offerflow::Result<()> {
//!     let config = Config::load(None)?;
//!     let timeout = config.api.request_timeout();
//!     let runtime = Runtime::connect(config).await?;
//!     runtime.load_proxies().await?;
//!
//!     let worker = runtime.worker(Arc::new(ReqwestClientProvider::new(timeout)))?;
//!     worker.run().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod coordination;
pub mod error;
pub mod fetcher;
pub mod metrics;
pub mod models;
pub mod proxy;
pub mod publisher;
pub mod queue;
pub mod ratelimit;
pub mod runtime;
pub mod scheduler;
pub mod server;
pub mod store;
pub mod utils;
pub mod worker;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, ErrorCategory, OfferflowErrorTrait, Result};
    pub use crate::fetcher::{Disposition, FetchOutcome, Fetcher};
    pub use crate::models::{OfferMessage, ParsedOffer, Task, TaskParams, WorkItem};
    pub use crate::queue::WorkQueue;
    pub use crate::runtime::Runtime;
    pub use crate::scheduler::Scheduler;
    pub use crate::store::{Keyspace, SharedStore, SharedStoreRef};
    pub use crate::worker::Worker;
}

// Direct re-exports for convenience
pub use error::{Error, Result};
pub use models::{OfferMessage, ParsedOffer, Task, TaskParams, WorkItem};
