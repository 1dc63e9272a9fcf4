// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Healthy connections, round-robin selection and host quarantine.
//!
//! Clients live in an arena keyed by [`ClientId`]; senders receive a
//! [`ClientLease`] for the duration of one send while the pool keeps ownership.
//! A host is either backing a healthy client or sitting in quarantine, never both.
//! Every read and mutation goes through one mutex, and no await happens while it
//! is held: connects and closes run outside the lock.

use crate::errors::{ConnectError, SendError};
use crate::event::Event;
use crate::host::Host;
use crate::transport::{Client, Transport};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// A client borrowed from the pool for one send.
#[derive(Clone)]
pub struct ClientLease {
    pub id: ClientId,
    pub host: Host,
    client: Arc<dyn Client>,
}

impl ClientLease {
    pub async fn send_batch(&self, events: &[Event]) -> Result<(), SendError> {
        self.client.send_batch(events).await
    }
}

impl fmt::Debug for ClientLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientLease")
            .field("id", &self.id)
            .field("host", &self.host)
            .finish_non_exhaustive()
    }
}

/// When a host last failed and how many times in a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuarantineEntry {
    pub failed_at: Instant,
    pub failures: u32,
}

struct Slot {
    host: Host,
    client: Arc<dyn Client>,
}

#[derive(Default)]
struct PoolState {
    healthy: Vec<ClientId>,
    slots: HashMap<ClientId, Slot>,
    quarantine: HashMap<Host, QuarantineEntry>,
    cursor: usize,
    next_id: u64,
}

impl PoolState {
    fn insert(&mut self, host: Host, client: Arc<dyn Client>) -> ClientId {
        let id = ClientId(self.next_id);
        self.next_id += 1;
        self.quarantine.remove(&host);
        self.healthy.push(id);
        self.slots.insert(id, Slot { host, client });
        id
    }

    fn record_failure(&mut self, host: Host) -> u32 {
        let now = Instant::now();
        let entry = self.quarantine.entry(host).or_insert(QuarantineEntry {
            failed_at: now,
            failures: 0,
        });
        entry.failed_at = now;
        entry.failures = entry.failures.saturating_add(1);
        entry.failures
    }
}

pub struct ConnectionPool {
    transport: Arc<dyn Transport>,
    state: Mutex<PoolState>,
}

impl ConnectionPool {
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            state: Mutex::new(PoolState::default()),
        }
    }

    #[allow(clippy::expect_used)]
    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().expect("lock poisoned")
    }

    /// Connects to every host in order. Failures quarantine the host and are not fatal.
    pub async fn connect_all(&self, hosts: &[Host]) {
        for host in hosts {
            match self.try_reconnect(host).await {
                Ok(client) => {
                    let id = self.reinstate(host.clone(), client);
                    debug!("Connected to {host} as {id}");
                }
                Err(e) => {
                    warn!("Error when initializing client, host is {host}: {e}");
                    self.quarantine(host.clone());
                }
            }
        }
    }

    /// Next healthy client in round-robin order, or `None` when every host is down.
    pub fn select_client(&self) -> Option<ClientLease> {
        let mut state = self.state();
        if state.healthy.is_empty() {
            return None;
        }
        if state.cursor >= state.healthy.len() {
            state.cursor = 0;
        }
        let id = state.healthy[state.cursor];
        state.cursor += 1;
        let slot = state.slots.get(&id)?;
        Some(ClientLease {
            id,
            host: slot.host.clone(),
            client: Arc::clone(&slot.client),
        })
    }

    /// Evicts a client after a failed send, quarantines its host and closes it.
    ///
    /// Returns false when the client was already evicted, in which case its host's
    /// quarantine record is left untouched.
    pub async fn mark_failed(&self, id: ClientId) -> bool {
        let slot = {
            let mut state = self.state();
            let Some(slot) = state.slots.remove(&id) else {
                return false;
            };
            state.healthy.retain(|healthy| *healthy != id);
            state.record_failure(slot.host.clone());
            slot
        };
        warn!("Quarantined {} after evicting {id}", slot.host);
        if let Err(e) = slot.client.close().await {
            debug!("Ignoring close error for {id} ({}): {e}", slot.host);
        }
        true
    }

    /// Opens a fresh connection to `host`. The pool is not modified.
    pub async fn try_reconnect(&self, host: &Host) -> Result<Arc<dyn Client>, ConnectError> {
        self.transport.connect(host).await.map(Arc::from)
    }

    /// Moves `host` out of quarantine and adds its new client to the healthy set.
    pub fn reinstate(&self, host: Host, client: Arc<dyn Client>) -> ClientId {
        self.state().insert(host, client)
    }

    /// Records a failure for `host`, refreshing its timestamp. Returns the
    /// number of consecutive failures.
    pub fn quarantine(&self, host: Host) -> u32 {
        self.state().record_failure(host)
    }

    /// Closes and forgets every healthy client.
    pub async fn close_all(&self) {
        let slots: Vec<(ClientId, Slot)> = {
            let mut state = self.state();
            state.healthy.clear();
            state.cursor = 0;
            state.slots.drain().collect()
        };
        for (id, slot) in slots {
            if let Err(e) = slot.client.close().await {
                debug!("Ignoring close error for {id} ({}): {e}", slot.host);
            }
        }
        info!("Closed all clients");
    }

    #[must_use]
    pub fn healthy_count(&self) -> usize {
        self.state().healthy.len()
    }

    /// Hosts backing the healthy clients, in selection order.
    #[must_use]
    pub fn healthy_hosts(&self) -> Vec<Host> {
        let state = self.state();
        state
            .healthy
            .iter()
            .filter_map(|id| state.slots.get(id).map(|slot| slot.host.clone()))
            .collect()
    }

    #[must_use]
    pub fn host_of(&self, id: ClientId) -> Option<Host> {
        self.state().slots.get(&id).map(|slot| slot.host.clone())
    }

    /// Snapshot of the quarantine map.
    #[must_use]
    pub fn quarantined(&self) -> Vec<(Host, QuarantineEntry)> {
        let state = self.state();
        let mut hosts: Vec<(Host, QuarantineEntry)> = state
            .quarantine
            .iter()
            .map(|(host, entry)| (host.clone(), *entry))
            .collect();
        hosts.sort_by(|a, b| a.0.cmp(&b.0));
        hosts
    }
}
