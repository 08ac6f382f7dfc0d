use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::binder::BindMode;
use crate::dispatcher::{DispatcherConfig, DEFAULT_QUEUE_CAPACITY, DEFAULT_WORKERS};

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub bind_mode: BindMode,
    pub dispatcher: DispatcherConfig,
    /// Zero disables expiry.
    pub assume_ttl: Duration,
    pub schedule_interval: Duration,
    pub demo_nodes: usize,
    pub demo_pods: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let log_level = lookup("SKED_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let async_calls = flag(&lookup, "SKED_ASYNC_API_CALLS", true);
        let wait_on_finish = flag(&lookup, "SKED_BIND_WAIT_ON_FINISH", false);
        let bind_mode = match (async_calls, wait_on_finish) {
            (false, _) => BindMode::Sync,
            (true, false) => BindMode::Async,
            (true, true) => BindMode::AsyncAwait,
        };

        let dispatcher = DispatcherConfig {
            queue_capacity: parse(&lookup, "SKED_DISPATCH_QUEUE_CAPACITY", DEFAULT_QUEUE_CAPACITY)?,
            workers: parse(&lookup, "SKED_DISPATCH_WORKERS", DEFAULT_WORKERS)?,
            drain_timeout: Duration::from_millis(parse(
                &lookup,
                "SKED_DISPATCH_DRAIN_TIMEOUT_MS",
                5000,
            )?),
        };

        Ok(Self {
            log_level,
            bind_mode,
            dispatcher,
            assume_ttl: Duration::from_secs(parse(&lookup, "SKED_ASSUME_TTL_SECS", 30)?),
            schedule_interval: Duration::from_millis(parse(
                &lookup,
                "SKED_SCHEDULE_INTERVAL_MS",
                1000,
            )?),
            demo_nodes: parse(&lookup, "SKED_DEMO_NODES", 3)?,
            demo_pods: parse(&lookup, "SKED_DEMO_PODS", 10)?,
        })
    }
}

fn flag(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: bool) -> bool {
    lookup(name)
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(default)
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(name) {
        Some(value) => value
            .trim()
            .parse()
            .with_context(|| format!("invalid {name}: {value:?}")),
        None => Ok(default),
    }
}
