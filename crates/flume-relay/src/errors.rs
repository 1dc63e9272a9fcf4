// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

/// Opening a connection to a host failed. The host is quarantined and retried later.
#[derive(Debug, Error)]
#[error("failed to connect: {0}")]
pub struct ConnectError(pub String);

/// A batch could not be delivered over an open connection.
#[derive(Debug, Error)]
#[error("failed to send batch: {0}")]
pub struct SendError(pub String);

/// Closing an evicted connection failed. Always discarded by the pool.
#[derive(Debug, Error)]
#[error("failed to close client: {0}")]
pub struct CloseError(pub String);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("dispatch queue is full ({capacity} batches)")]
    Full { capacity: usize },

    #[error("timed out waiting for room in the dispatch queue")]
    Timeout,

    #[error("dispatch queue is closed")]
    Closed,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid host '{input}': {reason}")]
pub struct HostParseError {
    pub input: String,
    pub reason: &'static str,
}

/// Lifecycle misuse. Downstream delivery failures never surface through this type.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AgentError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Agent already started")]
    AlreadyStarted,

    #[error("Agent not running")]
    NotRunning,
}

impl From<HostParseError> for AgentError {
    fn from(e: HostParseError) -> Self {
        AgentError::InvalidConfig(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = AgentError::InvalidConfig("batch size must be greater than 0".to_string());
        assert_eq!(
            error.to_string(),
            "Invalid configuration: batch size must be greater than 0"
        );

        let error = QueueError::Full { capacity: 10 };
        assert_eq!(error.to_string(), "dispatch queue is full (10 batches)");
    }

    #[test]
    fn test_host_parse_error_converts_to_invalid_config() {
        let error: AgentError = HostParseError {
            input: "flume:abc".to_string(),
            reason: "port is not a number",
        }
        .into();
        assert_eq!(
            error,
            AgentError::InvalidConfig(
                "invalid host 'flume:abc': port is not a number".to_string()
            )
        );
    }
}
