// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::errors::AgentError;
use crate::host::Host;
use crate::queue;
use crate::recovery::RetryPolicy;
use crate::sender::WorkerTimings;
use std::env;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_BATCH_SIZE: usize = 50;
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;
pub const DEFAULT_WORKER_COUNT: usize = 3;
pub const MAX_BATCH_SIZE: usize = 100_000;
pub const MAX_QUEUE_CAPACITY: usize = queue::MAX_CAPACITY;
pub const DEFAULT_RECOVER_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_EXCEPTION_LOG_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_NO_CLIENT_BACKOFF: Duration = Duration::from_secs(2);

/// Configuration for the relay agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Ingestion endpoints, in initial selection order
    pub hosts: Vec<Host>,
    /// Events per batch
    pub batch_size: usize,
    /// Maximum number of batches waiting for a sender
    pub queue_capacity: usize,
    /// Number of concurrent sender workers
    pub worker_count: usize,
    /// Cooldown before a failed host is retried
    pub recover_interval: Duration,
    /// Upper bound for exponential recovery backoff; `None` keeps the interval fixed
    pub recover_backoff_cap: Option<Duration>,
    /// Minimum gap between two queue overflow warnings
    pub exception_log_interval: Duration,
    /// How long a flush waits for room in the queue
    pub flush_timeout: Duration,
    /// How long an idle worker waits for a batch before flushing
    pub poll_timeout: Duration,
    /// How long a worker sleeps when no host is healthy
    pub no_client_backoff: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            batch_size: DEFAULT_BATCH_SIZE,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            worker_count: DEFAULT_WORKER_COUNT,
            recover_interval: DEFAULT_RECOVER_INTERVAL,
            recover_backoff_cap: None,
            exception_log_interval: DEFAULT_EXCEPTION_LOG_INTERVAL,
            flush_timeout: DEFAULT_FLUSH_TIMEOUT,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            no_client_backoff: DEFAULT_NO_CLIENT_BACKOFF,
        }
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|val| val.trim().parse::<T>().ok())
        .unwrap_or(default)
}

impl RelayConfig {
    /// Default configuration targeting `hosts`
    #[must_use]
    pub fn with_hosts(hosts: Vec<Host>) -> Self {
        Self {
            hosts,
            ..Default::default()
        }
    }

    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, AgentError> {
        let default_port = env::var("FLUME_PORT")
            .ok()
            .and_then(|port| port.trim().parse::<u16>().ok());
        let hosts = match env::var("FLUME_HOSTS") {
            Ok(list) => Host::parse_list(&list, default_port)?,
            Err(_) => Vec::new(),
        };
        let recover_backoff_cap = env::var("FLUME_RECOVER_BACKOFF_CAP_SECS")
            .ok()
            .and_then(|secs| secs.trim().parse::<u64>().ok())
            .map(Duration::from_secs);

        let config = Self {
            hosts,
            batch_size: env_or("FLUME_BATCH_SIZE", DEFAULT_BATCH_SIZE),
            queue_capacity: env_or("FLUME_QUEUE_CAPACITY", DEFAULT_QUEUE_CAPACITY),
            worker_count: env_or("FLUME_WORKER_COUNT", DEFAULT_WORKER_COUNT),
            recover_interval: Duration::from_secs(env_or(
                "FLUME_RECOVER_INTERVAL_SECS",
                DEFAULT_RECOVER_INTERVAL.as_secs(),
            )),
            recover_backoff_cap,
            exception_log_interval: Duration::from_secs(env_or(
                "FLUME_EXCEPTION_LOG_INTERVAL_SECS",
                DEFAULT_EXCEPTION_LOG_INTERVAL.as_secs(),
            )),
            ..Default::default()
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.hosts.is_empty() {
            return Err(AgentError::InvalidConfig(
                "at least one host is required".to_string(),
            ));
        }

        if self.batch_size == 0 {
            return Err(AgentError::InvalidConfig(
                "batch size must be greater than 0".to_string(),
            ));
        }
        if self.batch_size > MAX_BATCH_SIZE {
            return Err(AgentError::InvalidConfig(format!(
                "batch size must be at most {MAX_BATCH_SIZE}, got {}",
                self.batch_size
            )));
        }
        if self.queue_capacity == 0 {
            return Err(AgentError::InvalidConfig(
                "queue capacity must be greater than 0".to_string(),
            ));
        }
        if self.queue_capacity > MAX_QUEUE_CAPACITY {
            return Err(AgentError::InvalidConfig(format!(
                "queue capacity must be at most {MAX_QUEUE_CAPACITY}, got {}",
                self.queue_capacity
            )));
        }
        if self.worker_count == 0 {
            return Err(AgentError::InvalidConfig(
                "worker count must be greater than 0".to_string(),
            ));
        }

        if self.recover_interval.is_zero() {
            return Err(AgentError::InvalidConfig(
                "recover interval must be greater than 0".to_string(),
            ));
        }
        if let Some(cap) = self.recover_backoff_cap {
            if cap < self.recover_interval {
                return Err(AgentError::InvalidConfig(format!(
                    "recover backoff cap ({}s) must not be below the recover interval ({}s)",
                    cap.as_secs_f64(),
                    self.recover_interval.as_secs_f64()
                )));
            }
        }

        Ok(())
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        let policy = RetryPolicy::fixed(self.recover_interval);
        match self.recover_backoff_cap {
            Some(cap) => policy.with_backoff_cap(cap),
            None => policy,
        }
    }

    #[must_use]
    pub fn worker_timings(&self) -> WorkerTimings {
        WorkerTimings {
            poll_timeout: self.poll_timeout,
            no_client_backoff: self.no_client_backoff,
        }
    }
}
