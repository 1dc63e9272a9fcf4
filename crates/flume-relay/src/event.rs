// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single record to deliver: string headers plus an opaque body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

/// Events sent together in one remote call.
pub type EventBatch = Vec<Event>;

impl Event {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            headers: BTreeMap::new(),
            body: body.into(),
        }
    }

    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_builder() {
        let event = Event::new("payload")
            .with_header("service", "billing")
            .with_header("service", "checkout");

        assert_eq!(event.body, b"payload");
        assert_eq!(event.headers.len(), 1);
        assert_eq!(event.headers["service"], "checkout");
    }

    #[test]
    fn test_event_json_form() {
        let event = Event::new("hi").with_header("level", "INFO");
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            serde_json::json!({ "headers": { "level": "INFO" }, "body": [104, 105] })
        );

        let parsed: Event = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, event);
    }
}
