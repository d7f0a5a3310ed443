// Core data structures for the offerflow pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

use crate::scheduler::error::{SchedulerError, SchedulerResult};
use crate::utils::error::ValidationError;

/// Upstream query parameters for one task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskParams {
    /// Marketplace game identifier (e.g., "a8db" for CS2)
    pub game_id: String,

    /// Price currency requested from the API
    #[serde(default = "default_currency")]
    pub currency: String,

    /// Records requested per page (`limit`)
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Upper bound on pages fetched per run
    #[serde(default)]
    pub max_pages: Option<u32>,

    /// Delay between pages in milliseconds, overriding the fetch default
    #[serde(default)]
    pub page_delay_ms: Option<u64>,

    /// Extra query parameters passed through verbatim
    #[serde(default)]
    pub filters: BTreeMap<String, String>,
}

fn default_currency() -> String {
    "USD".to_string()
}

fn default_page_size() -> u32 {
    100
}

impl TaskParams {
    /// Parameters for `game_id` with defaults elsewhere
    pub fn new(game_id: impl Into<String>) -> Self {
        Self {
            game_id: game_id.into(),
            currency: default_currency(),
            page_size: default_page_size(),
            max_pages: None,
            page_delay_ms: None,
            filters: BTreeMap::new(),
        }
    }

    /// Per-task page delay, when set
    pub fn page_delay(&self) -> Option<Duration> {
        self.page_delay_ms.map(Duration::from_millis)
    }
}

/// A persistent, periodically executed ingestion job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique key; also the lock key suffix
    pub task_key: String,

    /// Upstream query parameters
    pub params: TaskParams,

    /// Higher runs first
    #[serde(default)]
    pub priority: i32,

    /// Seconds between runs
    pub interval_secs: u64,

    /// Next time the task becomes due
    pub next_run_at: DateTime<Utc>,
}

impl Task {
    /// Create a task that is due immediately
    pub fn new(task_key: impl Into<String>, params: TaskParams, interval: Duration) -> Self {
        Self {
            task_key: task_key.into(),
            params,
            priority: 0,
            interval_secs: interval.as_secs(),
            next_run_at: Utc::now(),
        }
    }

    /// Set priority
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the first due time
    #[must_use]
    pub fn with_next_run_at(mut self, at: DateTime<Utc>) -> Self {
        self.next_run_at = at;
        self
    }

    /// Interval between runs
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Whether the task is due at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_run_at <= now
    }

    /// Reject definitions the pipeline cannot run
    pub fn validate(&self) -> SchedulerResult<()> {
        if self.task_key.trim().is_empty() {
            return Err(SchedulerError::invalid_task("", "task_key must not be empty"));
        }
        if self.task_key.contains(char::is_whitespace) {
            return Err(SchedulerError::invalid_task(
                &self.task_key,
                "task_key must not contain whitespace",
            ));
        }
        if self.interval_secs == 0 {
            return Err(SchedulerError::invalid_task(
                &self.task_key,
                "interval must be positive",
            ));
        }
        if self.params.game_id.is_empty() {
            return Err(SchedulerError::invalid_task(&self.task_key, "game_id is required"));
        }
        if self.params.page_size == 0 {
            return Err(SchedulerError::invalid_task(
                &self.task_key,
                "page_size must be positive",
            ));
        }
        Ok(())
    }

    /// Snapshot the task into a work item
    pub fn work_item(&self) -> WorkItem {
        WorkItem {
            id: Uuid::new_v4(),
            task_key: self.task_key.clone(),
            params: self.params.clone(),
            priority: self.priority,
            enqueued_at: Utc::now(),
            attempt: 0,
        }
    }
}

/// Immutable snapshot of a task placed on the work queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Unique per enqueue
    pub id: Uuid,

    /// Key of the task this item was taken from
    pub task_key: String,

    /// Parameters as they were at enqueue time
    pub params: TaskParams,

    /// Queue priority (higher first)
    pub priority: i32,

    /// When the snapshot was taken
    pub enqueued_at: DateTime<Utc>,

    /// Number of earlier re-enqueues of this run
    #[serde(default)]
    pub attempt: u32,
}

impl WorkItem {
    /// A fresh snapshot for re-enqueueing the same run
    pub fn next_attempt(&self) -> Self {
        Self {
            id: Uuid::new_v4(),
            enqueued_at: Utc::now(),
            attempt: self.attempt + 1,
            ..self.clone()
        }
    }
}

/// A validated marketplace listing
///
/// `price` is in minor currency units (cents for USD).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedOffer {
    pub item_id: String,
    pub title: String,
    pub price: u64,
    pub currency: String,
    pub game_id: String,
    /// The upstream record as received
    pub raw_attributes: Map<String, Value>,
}

impl ParsedOffer {
    /// Validate one upstream record
    ///
    /// Accepts `itemId` or `item_id`, falls back from `title` to
    /// `marketHashName`, and takes the price either as a number of cents, a
    /// string of cents, or an object keyed by currency.
    pub fn from_record(record: &Value, params: &TaskParams) -> Result<Self, ValidationError> {
        let object = record.as_object().ok_or(ValidationError::NotAnObject)?;

        let item_id = text_field(object, &["itemId", "item_id"])
            .ok_or(ValidationError::MissingField("itemId"))?;
        let title = text_field(object, &["title", "marketHashName"])
            .ok_or(ValidationError::MissingField("title"))?;
        let currency = text_field(object, &["currency"]).unwrap_or_else(|| params.currency.clone());
        let game_id =
            text_field(object, &["gameId", "game_id"]).unwrap_or_else(|| params.game_id.clone());

        let price = match object.get("price") {
            None | Some(Value::Null) => return Err(ValidationError::MissingField("price")),
            Some(value) => parse_price(value, &currency)?,
        };

        Ok(Self {
            item_id,
            title,
            price,
            currency,
            game_id,
            raw_attributes: object.clone(),
        })
    }
}

/// First non-empty string (or number) among `names`
fn text_field(object: &Map<String, Value>, names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| match object.get(*name) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

fn parse_price(value: &Value, currency: &str) -> Result<u64, ValidationError> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| ValidationError::InvalidPrice(n.to_string())),
        Value::String(s) => s
            .trim()
            .parse::<u64>()
            .map_err(|_| ValidationError::InvalidPrice(s.clone())),
        Value::Object(by_currency) => match by_currency.get(currency) {
            Some(inner @ (Value::Number(_) | Value::String(_))) => parse_price(inner, currency),
            _ => Err(ValidationError::InvalidPrice(format!(
                "no {currency} amount in {value}"
            ))),
        },
        other => Err(ValidationError::InvalidPrice(other.to_string())),
    }
}

/// Envelope emitted on the outbound topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfferMessage {
    pub message_id: Uuid,
    pub task_key: String,
    pub instance_id: String,
    pub published_at: DateTime<Utc>,
    pub offer: ParsedOffer,
}

impl OfferMessage {
    /// Wrap an offer for publishing
    pub fn new(task_key: impl Into<String>, instance_id: impl Into<String>, offer: ParsedOffer) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            task_key: task_key.into(),
            instance_id: instance_id.into(),
            published_at: Utc::now(),
            offer,
        }
    }
}
