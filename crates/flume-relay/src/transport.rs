// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Boundary to the wire-level RPC client.
//!
//! The relay never serializes events itself: a [`Transport`] opens connections to
//! hosts and each [`Client`] ships whole batches. Implementations must be cheap to
//! share across tasks since every sender worker calls into them concurrently.

use crate::errors::{CloseError, ConnectError, SendError};
use crate::event::Event;
use crate::host::Host;
use async_trait::async_trait;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens a new connection to `host`.
    async fn connect(&self, host: &Host) -> Result<Box<dyn Client>, ConnectError>;
}

#[async_trait]
pub trait Client: Send + Sync {
    /// Delivers one batch. Any error evicts this client from the pool.
    async fn send_batch(&self, events: &[Event]) -> Result<(), SendError>;

    async fn close(&self) -> Result<(), CloseError>;
}
