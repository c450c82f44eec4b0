use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use serde_inline_default::serde_inline_default;

use crate::{Result, WorkerResult};

/// Environment variable overriding [`QueueConfig::connection_string`].
pub const CONNECTION_ENV: &str = "RUAMQ_CONNECTION";

/// Name of the shared headers exchange.
pub const DEFAULT_EXCHANGE: &str = "ruamq";

/// What to do with a delivery that matches no response, worker or handler.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UnroutablePolicy {
    /// Reject with requeue, every time.
    #[default]
    Requeue,
    /// Reject without requeue.
    Discard,
    /// Requeue until the delivery has been attempted this many extra times,
    /// then discard.
    RequeueUpTo(u32),
}

impl UnroutablePolicy {
    /// Outcome for an unroutable delivery seen `delivery_count` times before.
    #[must_use]
    pub fn resolve(self, delivery_count: u32) -> WorkerResult {
        match self {
            UnroutablePolicy::Requeue => WorkerResult::Requeue,
            UnroutablePolicy::Discard => WorkerResult::Failed,
            UnroutablePolicy::RequeueUpTo(limit) if delivery_count < limit => {
                WorkerResult::Requeue
            }
            UnroutablePolicy::RequeueUpTo(_) => WorkerResult::Failed,
        }
    }
}

#[serde_inline_default]
#[derive(Deserialize, Serialize, Debug, PartialEq, Eq, Clone)]
pub struct QueueConfig {
    /// `memory://<name>` for an in-process broker, `amqp://` or `amqps://`
    /// for an AMQP broker.
    #[serde_inline_default("memory://default".to_owned())]
    pub connection_string: String,
    /// Maximum unsettled deliveries per consumer, 0 for no limit.
    #[serde_inline_default(0)]
    pub prefetch: u16,
    #[serde_inline_default(DEFAULT_EXCHANGE.to_owned())]
    pub exchange: String,
    #[serde_inline_default(Duration::from_secs(30))]
    #[serde(with = "humantime_serde")]
    pub rpc_timeout: Duration,
    #[serde_inline_default(UnroutablePolicy::Requeue)]
    pub unroutable: UnroutablePolicy,
    /// Outcome for a payload that cannot be decoded.
    #[serde_inline_default(WorkerResult::Requeue)]
    pub decode_failure: WorkerResult,
}

impl Default for QueueConfig {
    fn default() -> Self {
        serde_json::from_value(serde_json::Value::Object(serde_json::Map::default())).unwrap()
    }
}

impl QueueConfig {
    /// Loads the configuration from an optional JSON file, then applies the
    /// `RUAMQ_CONNECTION` environment override.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)?;
                serde_json::from_str(&text)?
            }
            None => Self::default(),
        };
        Ok(config.with_overrides(|key| std::env::var(key).ok()))
    }

    /// Applies environment overrides read through `lookup`. Only
    /// [`CONNECTION_ENV`] is recognised.
    #[must_use]
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(connection_string) = lookup(CONNECTION_ENV).filter(|s| !s.is_empty()) {
            tracing::debug!("connection string overridden by {CONNECTION_ENV}");
            self.connection_string = connection_string;
        }
        self
    }
}
