// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! `tracing` layer forwarding application log events to a [`RelayAgent`].
//!
//! # Usage
//!
//! ```no_run
//! use flume_relay::{RelayAgent, RelayLayer};
//! use std::sync::Arc;
//! use tracing_subscriber::layer::SubscriberExt;
//!
//! fn install(agent: Arc<RelayAgent>) {
//!     let layer = RelayLayer::new(agent)
//!         .with_header("service", "checkout")
//!         .with_field("region", "eu-west-1")
//!         .with_max_level(tracing::Level::INFO);
//!     let subscriber = tracing_subscriber::registry().with(layer);
//!     let _ = tracing::subscriber::set_global_default(subscriber);
//! }
//! ```
//!
//! # Body
//!
//! Each event becomes a JSON object:
//!
//! ```text
//! {"level":"INFO","target":"app::orders","message":"order placed","fields":{"order_id":42}}
//! ```
//!
//! `fields` merges configured fields, then the fields of every span in scope from
//! the root down, then the event's own fields. Later sources win on key clashes.

use crate::agent::RelayAgent;
use crate::event::Event;
use serde_json::{json, Map, Value};
use std::fmt;
use std::sync::Arc;
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id, Record};
use tracing::{Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::registry::LookupSpan;

/// Events from these targets are never forwarded, so the relay cannot feed itself.
const OWN_TARGET_PREFIX: &str = "flume_relay";

/// A header value fixed at configuration time or computed for every event.
#[derive(Clone)]
pub enum HeaderValue {
    Static(String),
    Dynamic(Arc<dyn Fn() -> String + Send + Sync>),
}

impl HeaderValue {
    fn resolve(&self) -> String {
        match self {
            HeaderValue::Static(value) => value.clone(),
            HeaderValue::Dynamic(f) => f(),
        }
    }
}

impl fmt::Debug for HeaderValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderValue::Static(value) => f.debug_tuple("Static").field(value).finish(),
            HeaderValue::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

#[derive(Clone)]
enum FieldValue {
    Static(Value),
    Dynamic(Arc<dyn Fn() -> Value + Send + Sync>),
}

impl FieldValue {
    fn resolve(&self) -> Value {
        match self {
            FieldValue::Static(value) => value.clone(),
            FieldValue::Dynamic(f) => f(),
        }
    }
}

/// Fields recorded on a span, kept in its extensions.
struct SpanFields(Map<String, Value>);

struct JsonVisitor<'a> {
    fields: &'a mut Map<String, Value>,
    message: Option<&'a mut String>,
}

impl<'a> JsonVisitor<'a> {
    fn new(fields: &'a mut Map<String, Value>) -> Self {
        Self {
            fields,
            message: None,
        }
    }

    fn with_message(fields: &'a mut Map<String, Value>, message: &'a mut String) -> Self {
        Self {
            fields,
            message: Some(message),
        }
    }

    fn insert(&mut self, field: &Field, value: Value) {
        if field.name() == "message" {
            if let Some(message) = self.message.as_mut() {
                **message = match value {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                return;
            }
        }
        self.fields.insert(field.name().to_string(), value);
    }
}

impl Visit for JsonVisitor<'_> {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.insert(field, Value::from(value));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field, Value::from(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.insert(field, Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, Value::from(value));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.insert(field, Value::from(format!("{value:?}")));
    }
}

/// Forwards every enabled `tracing` event to a relay agent as one [`Event`].
#[derive(Clone)]
pub struct RelayLayer {
    agent: Arc<RelayAgent>,
    headers: Vec<(String, HeaderValue)>,
    fields: Vec<(String, FieldValue)>,
    max_level: Level,
}

impl RelayLayer {
    #[must_use]
    pub fn new(agent: Arc<RelayAgent>) -> Self {
        Self {
            agent,
            headers: Vec::new(),
            fields: Vec::new(),
            max_level: Level::TRACE,
        }
    }

    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .push((key.into(), HeaderValue::Static(value.into())));
        self
    }

    /// Adds a header whose value is computed for each event.
    #[must_use]
    pub fn with_header_fn<F>(mut self, key: impl Into<String>, f: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.headers
            .push((key.into(), HeaderValue::Dynamic(Arc::new(f))));
        self
    }

    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields
            .push((key.into(), FieldValue::Static(value.into())));
        self
    }

    /// Adds a body field whose value is computed for each event.
    #[must_use]
    pub fn with_field_fn<F>(mut self, key: impl Into<String>, f: F) -> Self
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        self.fields
            .push((key.into(), FieldValue::Dynamic(Arc::new(f))));
        self
    }

    /// Drops events more verbose than `level`.
    #[must_use]
    pub fn with_max_level(mut self, level: Level) -> Self {
        self.max_level = level;
        self
    }

    fn should_forward(&self, metadata: &tracing::Metadata<'_>) -> bool {
        *metadata.level() <= self.max_level && !metadata.target().starts_with(OWN_TARGET_PREFIX)
    }
}

impl<S> Layer<S> for RelayLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let mut fields = Map::new();
        attrs.record(&mut JsonVisitor::new(&mut fields));
        span.extensions_mut().insert(SpanFields(fields));
    }

    fn on_record(&self, id: &Id, values: &Record<'_>, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let mut extensions = span.extensions_mut();
        if let Some(SpanFields(fields)) = extensions.get_mut::<SpanFields>() {
            values.record(&mut JsonVisitor::new(fields));
        }
    }

    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if !self.should_forward(metadata) {
            return;
        }

        let mut fields: Map<String, Value> = self
            .fields
            .iter()
            .map(|(key, value)| (key.clone(), value.resolve()))
            .collect();
        if let Some(scope) = ctx.event_scope(event) {
            for span in scope.from_root() {
                if let Some(SpanFields(span_fields)) = span.extensions().get::<SpanFields>() {
                    fields.extend(span_fields.iter().map(|(k, v)| (k.clone(), v.clone())));
                }
            }
        }
        let mut message = String::new();
        event.record(&mut JsonVisitor::with_message(&mut fields, &mut message));

        let body = json!({
            "level": metadata.level().as_str(),
            "target": metadata.target(),
            "message": message,
            "fields": fields,
        });
        let Ok(body) = serde_json::to_vec(&body) else {
            return;
        };

        let mut relayed = Event::new(body)
            .with_header("level", metadata.level().as_str())
            .with_header("target", metadata.target());
        for (key, value) in &self.headers {
            relayed = relayed.with_header(key.clone(), value.resolve());
        }
        self.agent.submit(relayed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use crate::host::Host;
    use crate::pool::test_support::FakeTransport;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tracing_subscriber::layer::SubscriberExt;

    async fn relay() -> (FakeTransport, Arc<RelayAgent>) {
        let transport = FakeTransport::default();
        let config = RelayConfig {
            batch_size: 1,
            ..RelayConfig::with_hosts(vec![Host::new("flume-1", 4141)])
        };
        let agent = Arc::new(RelayAgent::new(config, Arc::new(transport.clone())).unwrap());
        agent.start().await.unwrap();
        (transport, agent)
    }

    async fn delivered(transport: &FakeTransport, agent: &RelayAgent) -> Vec<Event> {
        agent.shutdown().await.unwrap();
        transport
            .sent()
            .into_iter()
            .flat_map(|(_, batch)| batch)
            .collect()
    }

    fn body(event: &Event) -> Value {
        serde_json::from_slice(&event.body).unwrap()
    }

    #[tokio::test]
    async fn test_event_becomes_json_body_with_headers() {
        let (transport, agent) = relay().await;
        let counter = Arc::new(AtomicU64::new(0));
        let layer = {
            let counter = Arc::clone(&counter);
            RelayLayer::new(Arc::clone(&agent))
                .with_header("service", "checkout")
                .with_header_fn("sequence", move || {
                    counter.fetch_add(1, Ordering::Relaxed).to_string()
                })
        };

        tracing::subscriber::with_default(tracing_subscriber::registry().with(layer), || {
            tracing::info!(target: "app", order_id = 42, paid = true, "order placed");
            tracing::warn!(target: "app::billing", "card declined");
        });

        let events = delivered(&transport, &agent).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].headers["service"], "checkout");
        assert_eq!(events[0].headers["sequence"], "0");
        assert_eq!(events[1].headers["sequence"], "1");
        assert_eq!(events[0].headers["level"], "INFO");
        assert_eq!(events[1].headers["target"], "app::billing");

        assert_eq!(
            body(&events[0]),
            json!({
                "level": "INFO",
                "target": "app",
                "message": "order placed",
                "fields": { "order_id": 42, "paid": true },
            })
        );
        assert_eq!(body(&events[1])["message"], "card declined");
    }

    #[tokio::test]
    async fn test_fields_merge_configured_span_and_event() {
        let (transport, agent) = relay().await;
        let layer = RelayLayer::new(Arc::clone(&agent))
            .with_field("region", "eu-west-1")
            .with_field("request", "configured")
            .with_field_fn("pid", || Value::from(7));

        tracing::subscriber::with_default(tracing_subscriber::registry().with(layer), || {
            let outer = tracing::info_span!(target: "app", "request", request = "outer", user = "ada");
            let _outer = outer.enter();
            let inner = tracing::info_span!(target: "app", "handler", request = "inner", step = tracing::field::Empty);
            inner.record("step", 3);
            let _inner = inner.enter();
            tracing::info!(target: "app", user = "grace", "handled");
        });

        let events = delivered(&transport, &agent).await;
        assert_eq!(
            body(&events[0])["fields"],
            json!({
                "region": "eu-west-1",
                "pid": 7,
                "request": "inner",
                "user": "grace",
                "step": 3,
            })
        );
    }

    #[tokio::test]
    async fn test_max_level_and_own_targets_are_skipped() {
        let (transport, agent) = relay().await;
        let layer = RelayLayer::new(Arc::clone(&agent)).with_max_level(Level::INFO);

        tracing::subscriber::with_default(tracing_subscriber::registry().with(layer), || {
            tracing::debug!(target: "app", "too chatty");
            tracing::error!(target: "flume_relay::sender", "relay internals");
            tracing::error!(target: "app", "kept");
        });

        let events = delivered(&transport, &agent).await;
        assert_eq!(events.len(), 1);
        assert_eq!(body(&events[0])["message"], "kept");
    }

    #[test]
    fn test_header_value_debug_hides_closures() {
        let value = HeaderValue::Dynamic(Arc::new(|| "x".to_string()));
        assert_eq!(format!("{value:?}"), "Dynamic(..)");
        assert_eq!(value.resolve(), "x");
        assert_eq!(
            format!("{:?}", HeaderValue::Static("a".to_string())),
            "Static(\"a\")"
        );
    }
}
