//! Configuration management for offerflow
//!
//! Configuration is assembled once at startup: defaults, then an optional
//! TOML file, then `OFFERFLOW_*` environment variables. The result is
//! validated before anything connects; invalid values are fatal.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

use crate::coordination::CoordinationConfig;
use crate::fetcher::{ApiConfig, FetchConfig};
use crate::proxy::ProxyPoolConfig;
use crate::publisher::PublisherConfig;
use crate::ratelimit::RateLimitConfig;
use crate::scheduler::SchedulerConfig;
use crate::server::ServerConfig;
use crate::store::{StoreBackend, StoreConfig};
use crate::utils::error::ConfigError;
use crate::worker::WorkerConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub instance: InstanceConfig,
    pub store: StoreConfig,
    pub api: ApiConfig,
    pub proxies: ProxyPoolConfig,
    pub rate_limit: RateLimitConfig,
    pub fetch: FetchConfig,
    pub coordination: CoordinationConfig,
    pub scheduler: SchedulerConfig,
    pub worker: WorkerConfig,
    pub publisher: PublisherConfig,
    pub logging: LoggingConfig,
    pub server: ServerConfig,
}

/// Identity of this process
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    /// Fixed instance id; generated from the hostname when unset
    pub id: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    env_var(name)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| ConfigError::invalid(name, format!("'{raw}': {e}")))
        })
        .transpose()
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }

    /// Defaults, optional file, environment overrides, validation
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Override fields from `OFFERFLOW_*` environment variables
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Some(id) = env_var("OFFERFLOW_INSTANCE_ID") {
            self.instance.id = Some(id);
        }

        if let Some(backend) = env_var("OFFERFLOW_STORE_BACKEND") {
            self.store.backend = match backend.to_ascii_lowercase().as_str() {
                "redis" => StoreBackend::Redis,
                "memory" => StoreBackend::Memory,
                other => {
                    return Err(ConfigError::invalid(
                        "OFFERFLOW_STORE_BACKEND",
                        format!("unknown backend '{other}'"),
                    ))
                }
            };
        }
        if let Some(url) = env_var("OFFERFLOW_REDIS_URL").or_else(|| env_var("REDIS_URL")) {
            self.store.url = url;
        }
        if let Some(prefix) = env_var("OFFERFLOW_KEY_PREFIX") {
            self.store.key_prefix = prefix;
        }

        if let Some(url) = env_var("OFFERFLOW_API_BASE_URL") {
            self.api.base_url = url;
        }
        if let Some(key) = env_var("OFFERFLOW_API_KEY") {
            self.api.api_key = Some(key);
        }

        if let Some(file) = env_var("OFFERFLOW_PROXY_FILE") {
            self.proxies.file = Some(file.into());
        }
        if let Some(max) = env_parse::<usize>("OFFERFLOW_MAX_PROXIES_PER_INSTANCE")? {
            self.proxies.max_proxies_per_instance = Some(max);
        }

        if let Some(rps) = env_parse("OFFERFLOW_REQUESTS_PER_SECOND")? {
            self.rate_limit.requests_per_second = rps;
        }
        if let Some(n) = env_parse("OFFERFLOW_MAX_CONCURRENT")? {
            self.rate_limit.max_concurrent = n;
        }
        if let Some(n) = env_parse("OFFERFLOW_MAX_IN_FLIGHT")? {
            self.worker.max_in_flight = n;
        }
        if let Some(secs) = env_parse("OFFERFLOW_LOCK_TTL_SECS")? {
            self.coordination.lock_ttl_secs = secs;
        }

        if let Some(topic) = env_var("OFFERFLOW_TOPIC") {
            self.publisher.topic = topic;
        }

        if let Some(level) = env_var("OFFERFLOW_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = env_var("OFFERFLOW_LOG_FORMAT") {
            self.logging.format = format;
        }

        if let Some(addr) = env_parse("OFFERFLOW_SERVER_ADDR")? {
            self.server.bind_address = addr;
            self.server.enabled = true;
        }

        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store.backend == StoreBackend::Redis && self.store.url.trim().is_empty() {
            return Err(ConfigError::invalid("store.url", "required for the redis backend"));
        }
        if self.store.pool_size == 0 {
            return Err(ConfigError::invalid("store.pool_size", "must be greater than 0"));
        }
        if self.store.key_prefix.trim().is_empty() {
            return Err(ConfigError::invalid("store.key_prefix", "must not be empty"));
        }

        url::Url::parse(&self.api.base_url)
            .map_err(|e| ConfigError::invalid("api.base_url", e.to_string()))?;
        if self.api.request_timeout_secs == 0 {
            return Err(ConfigError::invalid("api.request_timeout_secs", "must be positive"));
        }

        if self.proxies.lease_ttl_secs == 0 {
            return Err(ConfigError::invalid("proxies.lease_ttl_secs", "must be positive"));
        }
        if self.proxies.failure_threshold == 0 {
            return Err(ConfigError::invalid("proxies.failure_threshold", "must be positive"));
        }
        if self.proxies.max_proxies_per_instance == Some(0) {
            return Err(ConfigError::invalid(
                "proxies.max_proxies_per_instance",
                "must be positive when set",
            ));
        }

        let limits = &self.rate_limit;
        if limits.requests_per_second == 0 || limits.per_proxy_requests_per_second == 0 {
            return Err(ConfigError::invalid("rate_limit", "rates must be positive"));
        }
        if limits.max_concurrent == 0 || limits.per_proxy_max_concurrent == 0 {
            return Err(ConfigError::invalid("rate_limit", "concurrency caps must be positive"));
        }

        if self.fetch.max_pages == 0 {
            return Err(ConfigError::invalid("fetch.max_pages", "must be positive"));
        }

        let coordination = &self.coordination;
        if coordination.lock_ttl_secs == 0 {
            return Err(ConfigError::invalid("coordination.lock_ttl_secs", "must be positive"));
        }
        if coordination.heartbeat_interval_secs == 0 {
            return Err(ConfigError::invalid(
                "coordination.heartbeat_interval_secs",
                "must be positive",
            ));
        }
        if coordination.instance_expiry_secs <= coordination.heartbeat_interval_secs {
            return Err(ConfigError::invalid(
                "coordination.instance_expiry_secs",
                "must exceed heartbeat_interval_secs",
            ));
        }

        if self.scheduler.tick_interval_secs == 0 || self.scheduler.lock_ttl_secs == 0 {
            return Err(ConfigError::invalid("scheduler", "intervals must be positive"));
        }

        // Claims are renewed before each request attempt and must outlive the
        // longest gap until the next renewal
        let renewal_gap = self.api.request_timeout() + self.fetch.retry.max_delay() + self.fetch.page_delay();
        if self.proxies.lease_ttl() <= renewal_gap {
            return Err(ConfigError::invalid(
                "proxies.lease_ttl_secs",
                format!("must exceed request timeout + max retry delay + page delay ({}s)", renewal_gap.as_secs_f64()),
            ));
        }
        if coordination.lock_ttl() <= renewal_gap {
            return Err(ConfigError::invalid(
                "coordination.lock_ttl_secs",
                format!("must exceed request timeout + max retry delay + page delay ({}s)", renewal_gap.as_secs_f64()),
            ));
        }

        if self.worker.max_in_flight == 0 {
            return Err(ConfigError::invalid("worker.max_in_flight", "must be greater than 0"));
        }
        if self.worker.visibility_timeout_secs <= coordination.lock_ttl_secs {
            return Err(ConfigError::invalid(
                "worker.visibility_timeout_secs",
                "must exceed coordination.lock_ttl_secs",
            ));
        }

        if self.publisher.topic.trim().is_empty() {
            return Err(ConfigError::invalid("publisher.topic", "must not be empty"));
        }

        if !LOG_LEVELS.contains(&self.logging.level.to_ascii_lowercase().as_str()) {
            return Err(ConfigError::invalid(
                "logging.level",
                format!("expected one of {}", LOG_LEVELS.join(", ")),
            ));
        }
        if !matches!(self.logging.format.as_str(), "text" | "json") {
            return Err(ConfigError::invalid("logging.format", "expected 'text' or 'json'"));
        }

        Ok(())
    }

    /// Instance id from config, or one generated for this process
    pub fn instance_id(&self) -> String {
        self.instance
            .id
            .clone()
            .unwrap_or_else(crate::utils::generate_instance_id)
    }
}
