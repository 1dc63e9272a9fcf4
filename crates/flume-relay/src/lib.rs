// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # Flume Relay
//!
//! Buffers log events in memory, groups them into fixed-size batches and ships
//! the batches to a set of RPC ingestion hosts from a pool of sender tasks.
//!
//! ## Architecture
//!
//! - [`accumulator`]: cuts submitted events into batches
//! - [`queue`]: bounded FIFO of batches between producers and senders
//! - [`sender`]: worker tasks delivering batches to healthy clients
//! - [`pool`]: round-robin client selection and host quarantine
//! - [`recovery`]: background reconnection of quarantined hosts
//! - [`agent`]: lifecycle, including the drain on shutdown
//! - [`layer`]: `tracing` layer feeding application logs into an agent
//!
//! Delivery is at most once: a batch whose send fails is dropped and its host is
//! quarantined, and a batch that finds the queue full is dropped with a
//! rate-limited warning. Producers never block on the network.
//!
//! The wire protocol is behind [`transport::Transport`].

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod accumulator;
pub mod agent;
pub mod config;
pub mod errors;
pub mod event;
pub mod host;
pub mod layer;
pub mod pool;
pub mod queue;
pub mod recovery;
pub mod sender;
pub mod transport;

pub use agent::{AgentStatus, DrainReport, RelayAgent};
pub use config::RelayConfig;
pub use errors::{AgentError, CloseError, ConnectError, SendError};
pub use event::{Event, EventBatch};
pub use host::Host;
pub use layer::{HeaderValue, RelayLayer};
pub use transport::{Client, Transport};
