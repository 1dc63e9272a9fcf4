// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::accumulator::EventAccumulator;
use crate::config::RelayConfig;
use crate::errors::AgentError;
use crate::event::Event;
use crate::host::Host;
use crate::pool::ConnectionPool;
use crate::queue::DispatchQueue;
use crate::recovery::RecoveryLoop;
use crate::sender::{deliver, SenderWorkerPool};
use crate::transport::Transport;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as TokioMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Status of the relay agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStatus {
    /// Built but not started; submitted events are buffered.
    Created,
    /// Workers and recovery are running.
    Running,
    /// Shutdown has begun or finished. The agent cannot be restarted.
    Stopped,
}

/// Outcome of the shutdown drain, counted in batches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub delivered: usize,
    pub failed: usize,
    pub undelivered: usize,
}

struct RunningTasks {
    workers: SenderWorkerPool,
    recovery: JoinHandle<()>,
}

/// Owns the pool, queue, accumulator and background tasks of one relay.
///
/// Producers call [`submit`](Self::submit) from any thread; it never waits and
/// never fails because a host is down.
pub struct RelayAgent {
    config: RelayConfig,
    pool: Arc<ConnectionPool>,
    queue: Arc<DispatchQueue>,
    accumulator: Arc<EventAccumulator>,
    cancel_token: CancellationToken,
    status: Mutex<AgentStatus>,
    tasks: TokioMutex<Option<RunningTasks>>,
    late_submit_logged: AtomicBool,
}

impl RelayAgent {
    pub fn new(config: RelayConfig, transport: Arc<dyn Transport>) -> Result<Self, AgentError> {
        config.validate()?;
        let queue = Arc::new(DispatchQueue::new(config.queue_capacity));
        let accumulator = Arc::new(EventAccumulator::new(
            Arc::clone(&queue),
            config.batch_size,
            config.flush_timeout,
            config.exception_log_interval,
        ));
        Ok(Self {
            pool: Arc::new(ConnectionPool::new(transport)),
            queue,
            accumulator,
            cancel_token: CancellationToken::new(),
            status: Mutex::new(AgentStatus::Created),
            tasks: TokioMutex::new(None),
            late_submit_logged: AtomicBool::new(false),
            config,
        })
    }

    /// Swaps `from` for `to`; false if the agent was in another state.
    fn transition(&self, from: AgentStatus, to: AgentStatus) -> bool {
        #[allow(clippy::expect_used)]
        let mut status = self.status.lock().expect("lock poisoned");
        if *status != from {
            return false;
        }
        *status = to;
        true
    }

    /// Connects to every host, then spawns the recovery loop and the sender workers.
    ///
    /// Hosts that refuse the initial connection are quarantined; starting never
    /// fails because of them.
    pub async fn start(&self) -> Result<(), AgentError> {
        let mut tasks = self.tasks.lock().await;
        if !self.transition(AgentStatus::Created, AgentStatus::Running) {
            return Err(AgentError::AlreadyStarted);
        }

        info!(
            "Starting relay to {} hosts with {} workers",
            self.config.hosts.len(),
            self.config.worker_count
        );
        self.pool.connect_all(&self.config.hosts).await;
        if self.pool.healthy_count() == 0 {
            error!("No host accepted a connection, events are queued until one recovers");
        }

        let recovery = RecoveryLoop::new(
            Arc::clone(&self.pool),
            self.config.retry_policy(),
            self.cancel_token.clone(),
        )
        .spawn();
        let workers = SenderWorkerPool::spawn(
            self.config.worker_count,
            Arc::clone(&self.pool),
            Arc::clone(&self.queue),
            Arc::clone(&self.accumulator),
            self.config.worker_timings(),
            self.cancel_token.clone(),
        );
        *tasks = Some(RunningTasks { workers, recovery });
        Ok(())
    }

    /// Buffers an event; a full batch is handed to the senders.
    ///
    /// Once shutdown has begun nothing drains the queue any more, so the event is
    /// dropped. The first such drop is logged as a warning.
    pub fn submit(&self, event: Event) {
        if self.status() == AgentStatus::Stopped {
            if self.late_submit_logged.swap(true, Ordering::Relaxed) {
                debug!("Relay is stopped, dropped a submitted event");
            } else {
                warn!("Relay is stopped, dropping events submitted after shutdown");
            }
            return;
        }
        self.accumulator.append(event);
    }

    /// Hands the partial batch to the senders, waiting up to the flush timeout for room.
    /// Does nothing once shutdown has begun.
    pub async fn flush(&self) {
        if self.status() == AgentStatus::Stopped {
            return;
        }
        self.accumulator.flush().await;
    }

    /// Stops the background tasks and delivers whatever is still queued.
    ///
    /// Waits for workers to finish their current send, enqueues the partial batch,
    /// then sends queued batches one by one until the queue is empty or no healthy
    /// client remains. All clients are closed before returning.
    pub async fn shutdown(&self) -> Result<DrainReport, AgentError> {
        if !self.transition(AgentStatus::Running, AgentStatus::Stopped) {
            return Err(AgentError::NotRunning);
        }
        info!("Stopping relay");
        self.cancel_token.cancel();

        if let Some(tasks) = self.tasks.lock().await.take() {
            tasks.workers.join().await;
            if let Err(e) = tasks.recovery.await {
                error!("Recovery loop panicked: {e}");
            }
        }

        self.accumulator.try_flush();
        let report = self.drain().await;
        self.pool.close_all().await;

        info!(
            "Relay stopped: {} batches delivered, {} failed, {} undelivered",
            report.delivered, report.failed, report.undelivered
        );
        Ok(report)
    }

    async fn drain(&self) -> DrainReport {
        let mut report = DrainReport::default();
        while !self.queue.is_empty() {
            let Some(lease) = self.pool.select_client() else {
                report.undelivered = self.queue.len();
                error!(
                    "No healthy client while stopping, {} batches were not delivered",
                    report.undelivered
                );
                break;
            };
            let Some(batch) = self.queue.poll_now().await else {
                break;
            };
            if deliver(&self.pool, &lease, &batch).await {
                report.delivered += 1;
            } else {
                report.failed += 1;
            }
        }
        debug!("Drain finished: {report:?}");
        report
    }

    #[must_use]
    pub fn status(&self) -> AgentStatus {
        #[allow(clippy::expect_used)]
        let status = self.status.lock().expect("lock poisoned");
        *status
    }

    /// Full batches waiting for a sender.
    #[must_use]
    pub fn pending_batches(&self) -> usize {
        self.queue.len()
    }

    /// Events in the in-progress batch.
    #[must_use]
    pub fn buffered_events(&self) -> usize {
        self.accumulator.buffered()
    }

    #[must_use]
    pub fn healthy_clients(&self) -> usize {
        self.pool.healthy_count()
    }

    #[must_use]
    pub fn quarantined_hosts(&self) -> Vec<Host> {
        self.pool
            .quarantined()
            .into_iter()
            .map(|(host, _)| host)
            .collect()
    }

    /// Batches dropped because the queue was full.
    #[must_use]
    pub fn dropped_batches(&self) -> u64 {
        self.accumulator.dropped_batches()
    }

    #[must_use]
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::test_support::FakeTransport;
    use tracing_test::traced_test;

    fn config(hosts: &[&str]) -> RelayConfig {
        RelayConfig {
            batch_size: 2,
            ..RelayConfig::with_hosts(hosts.iter().map(|h| Host::new(*h, 4141)).collect())
        }
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let transport = Arc::new(FakeTransport::default());
        let result = RelayAgent::new(RelayConfig::default(), transport);
        assert!(matches!(result, Err(AgentError::InvalidConfig(_))));
    }

    #[test]
    fn test_new_rejects_oversized_limits_without_allocating() {
        for config in [
            RelayConfig {
                queue_capacity: usize::MAX,
                ..config(&["flume-1"])
            },
            RelayConfig {
                batch_size: usize::MAX,
                ..config(&["flume-1"])
            },
        ] {
            let transport = Arc::new(FakeTransport::default());
            let result = RelayAgent::new(config, transport);
            assert!(matches!(result, Err(AgentError::InvalidConfig(_))));
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn test_submit_after_shutdown_is_dropped_and_logged() {
        let transport = FakeTransport::default();
        let agent = RelayAgent::new(config(&["flume-1"]), Arc::new(transport.clone())).unwrap();
        agent.start().await.unwrap();
        agent.shutdown().await.unwrap();

        for body in ["late-1", "late-2", "late-3"] {
            agent.submit(Event::new(body));
        }
        agent.flush().await;

        assert_eq!(agent.pending_batches(), 0);
        assert_eq!(agent.buffered_events(), 0);
        assert!(transport.sent().is_empty());
        logs_assert(|lines: &[&str]| {
            match lines
                .iter()
                .filter(|l| l.contains("dropping events submitted after shutdown"))
                .count()
            {
                1 => Ok(()),
                n => Err(format!("expected one warning, found {n}")),
            }
        });
    }

    #[tokio::test]
    async fn test_lifecycle_transitions() {
        let transport = Arc::new(FakeTransport::default());
        let agent = RelayAgent::new(config(&["flume-1"]), transport).unwrap();
        assert_eq!(agent.status(), AgentStatus::Created);
        assert_eq!(agent.shutdown().await, Err(AgentError::NotRunning));

        agent.start().await.unwrap();
        assert_eq!(agent.status(), AgentStatus::Running);
        assert_eq!(agent.healthy_clients(), 1);
        assert_eq!(agent.start().await, Err(AgentError::AlreadyStarted));

        agent.shutdown().await.unwrap();
        assert_eq!(agent.status(), AgentStatus::Stopped);
        assert_eq!(agent.healthy_clients(), 0);
        assert_eq!(agent.shutdown().await, Err(AgentError::NotRunning));
        assert_eq!(agent.start().await, Err(AgentError::AlreadyStarted));
    }

    #[tokio::test]
    async fn test_events_submitted_before_start_are_delivered_on_shutdown() {
        let transport = FakeTransport::default();
        let agent = RelayAgent::new(config(&["flume-1"]), Arc::new(transport.clone())).unwrap();
        for body in ["a", "b", "c"] {
            agent.submit(Event::new(body));
        }
        assert_eq!(agent.pending_batches(), 1);
        assert_eq!(agent.buffered_events(), 1);

        agent.start().await.unwrap();
        let report = agent.shutdown().await.unwrap();

        let delivered: Vec<u8> = transport
            .sent()
            .into_iter()
            .flat_map(|(_, batch)| batch)
            .flat_map(|e| e.body)
            .collect();
        assert_eq!(delivered, b"abc");
        assert_eq!(report.undelivered, 0);
        assert_eq!(agent.pending_batches(), 0);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_unreachable_hosts_do_not_fail_start() {
        let transport = FakeTransport::default();
        let hosts = config(&["flume-1", "flume-2"]);
        for host in &hosts.hosts {
            transport.set_unreachable(host, true);
        }
        let agent = RelayAgent::new(hosts.clone(), Arc::new(transport)).unwrap();

        agent.start().await.unwrap();
        assert_eq!(agent.healthy_clients(), 0);
        assert_eq!(agent.quarantined_hosts(), hosts.hosts);

        agent.submit(Event::new("x"));
        agent.submit(Event::new("y"));
        let report = agent.shutdown().await.unwrap();
        assert_eq!(
            report,
            DrainReport {
                delivered: 0,
                failed: 0,
                undelivered: 1,
            }
        );
        assert!(logs_contain("No host accepted a connection"));
        assert!(logs_contain(
            "No healthy client while stopping, 1 batches were not delivered"
        ));
    }
}
