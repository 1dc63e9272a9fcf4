// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded FIFO of batches shared by producers and sender workers.
//!
//! Capacity is counted in batches, not events. Producers never wait longer than the
//! timeout they ask for, and consumers poll with a timeout so they get a chance to
//! observe cancellation even when no traffic arrives.

use crate::errors::QueueError;
use crate::event::EventBatch;
use std::time::Duration;
use tokio::sync::mpsc::error::{SendTimeoutError, TryRecvError, TrySendError};
use tokio::sync::{mpsc, Mutex};

/// Largest number of batches a queue will hold.
pub const MAX_CAPACITY: usize = 1_000_000;

pub struct DispatchQueue {
    tx: mpsc::Sender<EventBatch>,
    // mpsc has a single receiver; workers take turns waiting on it.
    rx: Mutex<mpsc::Receiver<EventBatch>>,
    capacity: usize,
}

impl DispatchQueue {
    /// Creates a queue holding at most `capacity` batches, clamped to `1..=MAX_CAPACITY`.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, MAX_CAPACITY);
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Mutex::new(rx),
            capacity,
        }
    }

    /// Enqueues without waiting. Fails with [`QueueError::Full`] at capacity.
    pub fn offer(&self, batch: EventBatch) -> Result<(), QueueError> {
        self.tx.try_send(batch).map_err(|e| match e {
            TrySendError::Full(_) => QueueError::Full {
                capacity: self.capacity,
            },
            TrySendError::Closed(_) => QueueError::Closed,
        })
    }

    /// Enqueues, waiting at most `timeout` for room.
    pub async fn offer_timeout(
        &self,
        batch: EventBatch,
        timeout: Duration,
    ) -> Result<(), QueueError> {
        self.tx
            .send_timeout(batch, timeout)
            .await
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => QueueError::Timeout,
                SendTimeoutError::Closed(_) => QueueError::Closed,
            })
    }

    /// Takes the oldest batch, waiting at most `timeout` for one to arrive.
    pub async fn poll(&self, timeout: Duration) -> Option<EventBatch> {
        tokio::time::timeout(timeout, async {
            let mut rx = self.rx.lock().await;
            rx.recv().await
        })
        .await
        .ok()
        .flatten()
    }

    /// Takes the oldest batch if one is queued right now.
    pub async fn poll_now(&self) -> Option<EventBatch> {
        let mut rx = self.rx.lock().await;
        match rx.try_recv() {
            Ok(batch) => Some(batch),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
