// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Batches submitted events and hands full batches to the dispatch queue.
//!
//! Producers never wait on a full queue: the batch is dropped and a warning is
//! logged at most once per interval, with the number of drops suppressed since
//! the previous warning.

use crate::errors::QueueError;
use crate::event::{Event, EventBatch};
use crate::queue::DispatchQueue;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// Logs queue overflow at most once per interval.
struct OverflowWarning {
    interval: Duration,
    last_logged: Mutex<Option<Instant>>,
    suppressed: AtomicU64,
    total: AtomicU64,
}

impl OverflowWarning {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_logged: Mutex::new(None),
            suppressed: AtomicU64::new(0),
            total: AtomicU64::new(0),
        }
    }

    fn record(&self, capacity: usize, dropped_events: usize) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.suppressed.fetch_add(1, Ordering::Relaxed);

        let should_log = {
            #[allow(clippy::expect_used)]
            let mut last = self.last_logged.lock().expect("lock poisoned");
            let now = Instant::now();
            match *last {
                Some(at) if now.duration_since(at) < self.interval => false,
                _ => {
                    *last = Some(now);
                    true
                }
            }
        };

        if should_log {
            let dropped_batches = self.suppressed.swap(0, Ordering::Relaxed);
            warn!(
                dropped_batches,
                total_dropped = self.total.load(Ordering::Relaxed),
                "The send queue is over its max size of {capacity} batches, dropped a batch of {dropped_events} events"
            );
        }
    }

    fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}

pub struct EventAccumulator {
    batch_size: usize,
    flush_timeout: Duration,
    buffer: Mutex<EventBatch>,
    queue: Arc<DispatchQueue>,
    overflow: OverflowWarning,
}

impl EventAccumulator {
    #[must_use]
    pub fn new(
        queue: Arc<DispatchQueue>,
        batch_size: usize,
        flush_timeout: Duration,
        exception_log_interval: Duration,
    ) -> Self {
        Self {
            batch_size: batch_size.max(1),
            flush_timeout,
            buffer: Mutex::new(Vec::new()),
            queue,
            overflow: OverflowWarning::new(exception_log_interval),
        }
    }

    #[allow(clippy::expect_used)]
    fn buffer(&self) -> MutexGuard<'_, EventBatch> {
        self.buffer.lock().expect("lock poisoned")
    }

    /// Adds an event; a full batch is enqueued without waiting.
    ///
    /// A new batch is started whether or not the queue accepted the full one.
    pub fn append(&self, event: Event) {
        let rejected = {
            let mut buffer = self.buffer();
            buffer.push(event);
            if buffer.len() < self.batch_size {
                return;
            }
            let batch = mem::take(&mut *buffer);
            let size = batch.len();
            // enqueue under the lock so batches reach the queue in cut order
            self.queue.offer(batch).err().map(|e| (e, size))
        };

        if let Some((e, size)) = rejected {
            self.on_rejected(&e, size);
        }
    }

    /// Enqueues the partial batch, waiting up to the flush timeout for room.
    /// On timeout the batch is dropped.
    pub async fn flush(&self) {
        let Some(batch) = self.take_partial() else {
            return;
        };
        let size = batch.len();
        debug!("Flushing partial batch of {size} events");
        if let Err(e) = self.queue.offer_timeout(batch, self.flush_timeout).await {
            error!("Send queue is full when flushing, dropped {size} events: {e}");
        }
    }

    /// Enqueues the partial batch without waiting.
    pub fn try_flush(&self) {
        let rejected = {
            let mut buffer = self.buffer();
            if buffer.is_empty() {
                return;
            }
            let batch = mem::take(&mut *buffer);
            let size = batch.len();
            self.queue.offer(batch).err().map(|e| (e, size))
        };

        if let Some((e, size)) = rejected {
            self.on_rejected(&e, size);
        }
    }

    fn take_partial(&self) -> Option<EventBatch> {
        let mut buffer = self.buffer();
        if buffer.is_empty() {
            None
        } else {
            Some(mem::take(&mut *buffer))
        }
    }

    fn on_rejected(&self, e: &QueueError, size: usize) {
        match e {
            QueueError::Full { capacity } => self.overflow.record(*capacity, size),
            _ => error!("Failed to enqueue batch of {size} events: {e}"),
        }
    }

    /// Events waiting in the in-progress batch.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer().len()
    }

    /// Batches dropped because the queue was full.
    #[must_use]
    pub fn dropped_batches(&self) -> u64 {
        self.overflow.total()
    }

    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }
}
