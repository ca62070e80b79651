//! # Configuration
//!
//! Every setting comes from a `COUNTER_*` environment variable with a
//! default. Unset variables are logged with the default they fall back to;
//! unparseable values fail startup with [`Error::Config`].
//!
//! | Variable | Default | Meaning |
//! |----------|---------|---------|
//! | `COUNTER_PORT` | `8080` | HTTP/WebSocket port |
//! | `COUNTER_STORE_PATH` | `counter.db` | shared SQLite file |
//! | `COUNTER_RATE_LIMIT_WINDOW_SECS` | `86400` | multiply window per user |
//! | `COUNTER_IDLE_TIMEOUT_SECS` | `30` | close sessions silent this long |
//! | `COUNTER_SESSION_QUEUE_SIZE` | `64` | outbound frames per session |
//! | `COUNTER_PAYMENT_TIMEOUT_MS` | `10000` | payment verification deadline |
//! | `COUNTER_PRESENCE_INTERVAL_MS` | `2000` | viewer presence refresh |
//! | `COUNTER_FEED_POLL_MS` | `100` | shared log poll interval |
//! | `COUNTER_HISTORY_INTERVAL_SECS` | `60` | history snapshot interval, `0` disables |
//! | `COUNTER_LOG_RETENTION` | `100000` | change log rows kept, `0` disables pruning |
//! | `COUNTER_INITIAL_VALUE` | `0` | value of a brand-new store |
//! | `COUNTER_CURRENCY` | `usd` | accepted payment currency |
//! | `COUNTER_BATCH_TIMEOUT_MS` | `2` | group commit window |
//! | `COUNTER_BUSY_TIMEOUT_MS` | `5000` | max wait for the shared write lock |
//! | `COUNTER_ADMIN_TOKEN` | unset | bearer token for `POST /api/payments` |

use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::info;

use crate::api::StoreConfig;
use crate::error::{Error, Result};
use crate::processor::ProcessorConfig;
use crate::types::BigCount;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub store_path: PathBuf,
    pub rate_limit_window: Duration,
    pub idle_timeout: Duration,
    pub session_queue_size: usize,
    pub payment_timeout: Duration,
    pub presence_interval: Duration,
    pub feed_poll_interval: Duration,
    /// `None` disables history snapshots.
    pub history_interval: Option<Duration>,
    /// `None` disables log pruning.
    pub log_retention: Option<u64>,
    pub initial_value: BigCount,
    pub currency: String,
    pub batch_timeout: Duration,
    pub busy_timeout: Duration,
    /// `None` disables the payment webhook.
    pub admin_token: Option<String>,
}

impl Config {
    /// Loads the configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Loads the configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let history_secs: u64 = try_load(&lookup, "COUNTER_HISTORY_INTERVAL_SECS", "60")?;
        let log_retention: u64 = try_load(&lookup, "COUNTER_LOG_RETENTION", "100000")?;
        let session_queue_size: usize = try_load(&lookup, "COUNTER_SESSION_QUEUE_SIZE", "64")?;
        let presence_ms: u64 = try_load(&lookup, "COUNTER_PRESENCE_INTERVAL_MS", "2000")?;
        let feed_poll_ms: u64 = try_load(&lookup, "COUNTER_FEED_POLL_MS", "100")?;

        if session_queue_size == 0 {
            return Err(Error::Config("COUNTER_SESSION_QUEUE_SIZE must be at least 1".to_string()));
        }
        if presence_ms == 0 || feed_poll_ms == 0 {
            return Err(Error::Config("intervals must be greater than zero".to_string()));
        }

        Ok(Self {
            port: try_load(&lookup, "COUNTER_PORT", "8080")?,
            store_path: try_load(&lookup, "COUNTER_STORE_PATH", "counter.db")?,
            rate_limit_window: Duration::from_secs(try_load(&lookup, "COUNTER_RATE_LIMIT_WINDOW_SECS", "86400")?),
            idle_timeout: Duration::from_secs(try_load(&lookup, "COUNTER_IDLE_TIMEOUT_SECS", "30")?),
            session_queue_size,
            payment_timeout: Duration::from_millis(try_load(&lookup, "COUNTER_PAYMENT_TIMEOUT_MS", "10000")?),
            presence_interval: Duration::from_millis(presence_ms),
            feed_poll_interval: Duration::from_millis(feed_poll_ms),
            history_interval: (history_secs > 0).then(|| Duration::from_secs(history_secs)),
            log_retention: (log_retention > 0).then_some(log_retention),
            initial_value: try_load(&lookup, "COUNTER_INITIAL_VALUE", "0")?,
            currency: try_load::<String>(&lookup, "COUNTER_CURRENCY", "usd")?.to_ascii_lowercase(),
            batch_timeout: Duration::from_millis(try_load(&lookup, "COUNTER_BATCH_TIMEOUT_MS", "2")?),
            busy_timeout: Duration::from_millis(try_load(&lookup, "COUNTER_BUSY_TIMEOUT_MS", "5000")?),
            admin_token: lookup("COUNTER_ADMIN_TOKEN").filter(|t| !t.is_empty()),
        })
    }

    /// Settings for [`CounterStore`](crate::api::CounterStore).
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            initial_value: self.initial_value.clone(),
            batch_timeout: self.batch_timeout,
            busy_timeout: self.busy_timeout,
            feed_poll_interval: self.feed_poll_interval,
            log_retention: self.log_retention,
            history_interval: self.history_interval,
            ..StoreConfig::default()
        }
    }

    /// Settings for [`OperationProcessor`](crate::processor::OperationProcessor).
    pub fn processor_config(&self) -> ProcessorConfig {
        ProcessorConfig {
            rate_limit_window: self.rate_limit_window,
            payment_timeout: self.payment_timeout,
            currency: self.currency.clone(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            store_path: PathBuf::from("counter.db"),
            rate_limit_window: Duration::from_secs(86_400),
            idle_timeout: Duration::from_secs(30),
            session_queue_size: 64,
            payment_timeout: Duration::from_millis(10_000),
            presence_interval: Duration::from_millis(2_000),
            feed_poll_interval: Duration::from_millis(100),
            history_interval: Some(Duration::from_secs(60)),
            log_retention: Some(100_000),
            initial_value: BigCount::zero(),
            currency: "usd".to_string(),
            batch_timeout: Duration::from_millis(2),
            busy_timeout: Duration::from_millis(5_000),
            admin_token: None,
        }
    }
}

fn try_load<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: &str) -> Result<T>
where
    T::Err: Display,
{
    lookup(key)
        .unwrap_or_else(|| {
            info!("{key} not set, using default: {default}");
            default.to_string()
        })
        .parse()
        .map_err(|e| Error::Config(format!("invalid {key} value: {e}")))
}
