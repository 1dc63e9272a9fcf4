// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Worker tasks moving batches from the dispatch queue to healthy clients.

use crate::accumulator::EventAccumulator;
use crate::event::Event;
use crate::pool::{ClientLease, ConnectionPool};
use crate::queue::DispatchQueue;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Sends one batch over `lease`. A failed send evicts the client and drops the batch.
///
/// Returns whether the batch was delivered.
pub async fn deliver(pool: &ConnectionPool, lease: &ClientLease, batch: &[Event]) -> bool {
    match lease.send_batch(batch).await {
        Ok(()) => {
            debug!("Sent {} events to {}", batch.len(), lease.host);
            true
        }
        Err(e) => {
            error!(
                "Failed to send {} events to {}, host is {}: {e}",
                batch.len(),
                lease.id,
                lease.host
            );
            pool.mark_failed(lease.id).await;
            false
        }
    }
}

/// Timing knobs shared by every worker.
#[derive(Debug, Clone, Copy)]
pub struct WorkerTimings {
    pub poll_timeout: Duration,
    pub no_client_backoff: Duration,
}

struct SenderWorker {
    index: usize,
    pool: Arc<ConnectionPool>,
    queue: Arc<DispatchQueue>,
    accumulator: Arc<EventAccumulator>,
    timings: WorkerTimings,
    cancel_token: CancellationToken,
}

impl SenderWorker {
    async fn run(self) {
        debug!("Sender worker {} started", self.index);
        while !self.cancel_token.is_cancelled() {
            let Some(lease) = self.pool.select_client() else {
                tokio::select! {
                    () = self.cancel_token.cancelled() => break,
                    () = tokio::time::sleep(self.timings.no_client_backoff) => {}
                }
                continue;
            };

            let batch = tokio::select! {
                () = self.cancel_token.cancelled() => break,
                batch = self.queue.poll(self.timings.poll_timeout) => batch,
            };

            match batch {
                // idle: push out whatever producers left in the partial batch
                None => self.accumulator.flush().await,
                Some(batch) => {
                    deliver(&self.pool, &lease, &batch).await;
                }
            }
        }
        debug!("Sender worker {} stopped", self.index);
    }
}

pub struct SenderWorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl SenderWorkerPool {
    /// Spawns `worker_count` workers on the current runtime.
    #[must_use]
    pub fn spawn(
        worker_count: usize,
        pool: Arc<ConnectionPool>,
        queue: Arc<DispatchQueue>,
        accumulator: Arc<EventAccumulator>,
        timings: WorkerTimings,
        cancel_token: CancellationToken,
    ) -> Self {
        let handles = (0..worker_count)
            .map(|index| {
                let worker = SenderWorker {
                    index,
                    pool: Arc::clone(&pool),
                    queue: Arc::clone(&queue),
                    accumulator: Arc::clone(&accumulator),
                    timings,
                    cancel_token: cancel_token.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();
        Self { handles }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Waits for every worker to exit. Only returns promptly once the token is cancelled.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("Sender worker panicked: {e}");
            }
        }
    }
}
