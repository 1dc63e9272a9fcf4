// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::pool::ConnectionPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long a quarantined host waits before the next reconnect attempt.
///
/// Without a cap every attempt waits `interval`, forever. With a cap the wait
/// doubles after each consecutive failure until it reaches the cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub max_backoff: Option<Duration>,
}

impl RetryPolicy {
    #[must_use]
    pub fn fixed(interval: Duration) -> Self {
        Self {
            interval,
            max_backoff: None,
        }
    }

    #[must_use]
    pub fn with_backoff_cap(mut self, cap: Duration) -> Self {
        self.max_backoff = Some(cap);
        self
    }

    #[must_use]
    pub fn delay_for(&self, failures: u32) -> Duration {
        match self.max_backoff {
            None => self.interval,
            Some(cap) => {
                let exponent = failures.saturating_sub(1).min(16);
                self.interval
                    .saturating_mul(1 << exponent)
                    .min(cap)
                    .max(self.interval)
            }
        }
    }
}

/// Background task reconnecting quarantined hosts.
pub struct RecoveryLoop {
    pool: Arc<ConnectionPool>,
    policy: RetryPolicy,
    cancel_token: CancellationToken,
}

impl RecoveryLoop {
    #[must_use]
    pub fn new(
        pool: Arc<ConnectionPool>,
        policy: RetryPolicy,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            pool,
            policy,
            cancel_token,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(self) {
        debug!("Recovery loop started");
        loop {
            self.recover_due().await;
            tokio::select! {
                () = self.cancel_token.cancelled() => break,
                () = tokio::time::sleep(self.policy.interval) => {}
            }
        }
        debug!("Recovery loop stopped");
    }

    /// Attempts every host whose cooldown has elapsed. Returns how many were reinstated.
    pub async fn recover_due(&self) -> usize {
        let mut recovered = 0;
        for (host, entry) in self.pool.quarantined() {
            let delay = self.policy.delay_for(entry.failures);
            if Instant::now().duration_since(entry.failed_at) < delay {
                continue;
            }
            match self.pool.try_reconnect(&host).await {
                Ok(client) => {
                    let id = self.pool.reinstate(host.clone(), client);
                    info!("Recovered {host} as {id}");
                    recovered += 1;
                }
                Err(e) => {
                    let failures = self.pool.quarantine(host.clone());
                    warn!(
                        failures,
                        "Error when recovering client, host is {host}: {e}"
                    );
                }
            }
        }
        recovered
    }
}
