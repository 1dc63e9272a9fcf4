// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::errors::HostParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One remote ingestion endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Host {
    pub address: String,
    pub port: u16,
}

impl Host {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }

    /// Parses `address:port`, `[v6]:port`, or a bare `address` when `default_port` is set.
    pub fn parse_with_default(input: &str, default_port: Option<u16>) -> Result<Self, HostParseError> {
        let trimmed = input.trim();
        let err = |reason| HostParseError {
            input: input.to_string(),
            reason,
        };
        if trimmed.is_empty() {
            return Err(err("address is empty"));
        }

        let (address, port) = if let Some(rest) = trimmed.strip_prefix('[') {
            let (address, tail) = rest.split_once(']').ok_or_else(|| err("unclosed '['"))?;
            match tail.strip_prefix(':') {
                Some(port) => (address, Some(port)),
                None if tail.is_empty() => (address, None),
                None => return Err(err("unexpected characters after ']'")),
            }
        } else if trimmed.matches(':').count() == 1 {
            let (address, port) = trimmed.split_once(':').ok_or_else(|| err("missing port"))?;
            (address, Some(port))
        } else {
            (trimmed, None)
        };

        if address.is_empty() {
            return Err(err("address is empty"));
        }
        let port = match port {
            Some(port) => port
                .parse::<u16>()
                .map_err(|_| err("port is not a number"))?,
            None => default_port.ok_or_else(|| err("missing port"))?,
        };
        if port == 0 {
            return Err(err("port must be greater than 0"));
        }
        Ok(Host::new(address, port))
    }

    /// Parses a comma separated host list, skipping empty entries.
    pub fn parse_list(input: &str, default_port: Option<u16>) -> Result<Vec<Self>, HostParseError> {
        input
            .split(',')
            .filter(|entry| !entry.trim().is_empty())
            .map(|entry| Host::parse_with_default(entry, default_port))
            .collect()
    }
}

impl FromStr for Host {
    type Err = HostParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Host::parse_with_default(s, None)
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.address.contains(':') {
            write!(f, "[{}]:{}", self.address, self.port)
        } else {
            write!(f, "{}:{}", self.address, self.port)
        }
    }
}
