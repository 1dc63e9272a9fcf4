// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Mock transport standing in for the RPC client

use async_trait::async_trait;
use flume_relay::{Client, CloseError, ConnectError, Event, Host, SendError, Transport};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::time::Instant;

#[derive(Default)]
struct MockState {
    unreachable: HashSet<Host>,
    failing: HashSet<Host>,
    connects: Vec<(Host, Instant)>,
    batches: Vec<(Host, Vec<Event>)>,
    closes: usize,
}

/// Transport whose hosts can refuse connections or fail sends on demand.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

#[allow(dead_code)]
impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unreachable(&self, host: &Host, unreachable: bool) {
        let mut state = self.state.lock().unwrap();
        if unreachable {
            state.unreachable.insert(host.clone());
        } else {
            state.unreachable.remove(host);
        }
    }

    pub fn set_failing(&self, host: &Host, failing: bool) {
        let mut state = self.state.lock().unwrap();
        if failing {
            state.failing.insert(host.clone());
        } else {
            state.failing.remove(host);
        }
    }

    /// Times at which `host` was dialed, successful or not.
    pub fn connect_attempts(&self, host: &Host) -> Vec<Instant> {
        self.state
            .lock()
            .unwrap()
            .connects
            .iter()
            .filter(|(h, _)| h == host)
            .map(|(_, at)| *at)
            .collect()
    }

    /// Batches acknowledged by any host, in arrival order.
    pub fn batches(&self) -> Vec<(Host, Vec<Event>)> {
        self.state.lock().unwrap().batches.clone()
    }

    pub fn batches_to(&self, host: &Host) -> usize {
        self.batches().iter().filter(|(h, _)| h == host).count()
    }

    pub fn bodies(&self) -> Vec<String> {
        self.batches()
            .iter()
            .flat_map(|(_, batch)| batch.iter())
            .map(|event| String::from_utf8_lossy(&event.body).into_owned())
            .collect()
    }

    pub fn closes(&self) -> usize {
        self.state.lock().unwrap().closes
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, host: &Host) -> Result<Box<dyn Client>, ConnectError> {
        let mut state = self.state.lock().unwrap();
        state.connects.push((host.clone(), Instant::now()));
        if state.unreachable.contains(host) {
            return Err(ConnectError(format!("connection refused by {host}")));
        }
        Ok(Box::new(MockClient {
            host: host.clone(),
            state: Arc::clone(&self.state),
        }))
    }
}

struct MockClient {
    host: Host,
    state: Arc<Mutex<MockState>>,
}

#[async_trait]
impl Client for MockClient {
    async fn send_batch(&self, events: &[Event]) -> Result<(), SendError> {
        let mut state = self.state.lock().unwrap();
        if state.failing.contains(&self.host) {
            return Err(SendError(format!("{} closed the connection", self.host)));
        }
        state.batches.push((self.host.clone(), events.to_vec()));
        Ok(())
    }

    async fn close(&self) -> Result<(), CloseError> {
        self.state.lock().unwrap().closes += 1;
        Ok(())
    }
}
