//! JSONL layer: one object per event.
//!
//! Each line carries `timestamp`, `level`, `service`, `pid`, `target`,
//! `message`, the event's structured `fields` and, inside spans, the span
//! chain from root to leaf.

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

#[derive(Debug, Serialize)]
struct LogLine<'a> {
    timestamp: String,
    level: &'static str,
    service: &'a str,
    pid: u32,
    target: &'a str,
    message: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    fields: BTreeMap<&'static str, Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    spans: Vec<&'static str>,
}

#[derive(Default)]
struct FieldCollector {
    message: Option<String>,
    fields: BTreeMap<&'static str, Value>,
}

impl FieldCollector {
    fn put(&mut self, field: &Field, value: Value) {
        if field.name() == "message" {
            self.message = Some(match value {
                Value::String(s) => s,
                other => other.to_string(),
            });
        } else {
            self.fields.insert(field.name(), value);
        }
    }
}

impl Visit for FieldCollector {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.put(field, Value::String(format!("{value:?}")));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field, Value::String(value.to_string()));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field, Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field, Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field, Value::Bool(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        let value = serde_json::Number::from_f64(value)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(value.to_string()));
        self.put(field, value);
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.put(field, Value::String(value.to_string()));
    }
}

/// Layer writing one JSON object per event through `W`.
pub struct JsonLayer<W> {
    service: String,
    pid: u32,
    make_writer: W,
}

impl<W> JsonLayer<W> {
    pub fn new(service: impl Into<String>, make_writer: W) -> Self {
        Self {
            service: service.into(),
            pid: std::process::id(),
            make_writer,
        }
    }
}

impl<S, W> Layer<S> for JsonLayer<W>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + 'static,
{
    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let mut collector = FieldCollector::default();
        event.record(&mut collector);

        let spans = ctx
            .event_scope(event)
            .map(|scope| scope.from_root().map(|span| span.name()).collect())
            .unwrap_or_default();

        let metadata = event.metadata();
        let line = LogLine {
            timestamp: Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
            level: metadata.level().as_str(),
            service: &self.service,
            pid: self.pid,
            target: metadata.target(),
            message: collector.message.unwrap_or_default(),
            fields: collector.fields,
            spans,
        };

        // One write per line: the writer may flush between calls.
        if let Ok(mut buf) = serde_json::to_vec(&line) {
            buf.push(b'\n');
            let mut writer = self.make_writer.make_writer();
            let _ = writer.write_all(&buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::io;
    use std::sync::Arc;
    use tracing_subscriber::layer::SubscriberExt;

    /// Keeps every `write` call as its own chunk.
    #[derive(Clone, Default)]
    struct Buffer(Arc<Mutex<Vec<Vec<u8>>>>);

    impl io::Write for Buffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().push(buf.to_vec());
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Buffer {
        type Writer = Buffer;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[test]
    fn writes_structured_line_per_event() {
        let buffer = Buffer::default();
        let subscriber =
            tracing_subscriber::registry().with(JsonLayer::new("inventory-outbox", buffer.clone()));

        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!("dispatch");
            let _entered = span.enter();
            tracing::info!(sequence = 7u64, multiple = true, "Published outbox message");
        });

        let chunks = buffer.0.lock().clone();
        assert_eq!(chunks.len(), 1);
        let line: Value = serde_json::from_slice(&chunks[0]).unwrap();

        assert_eq!(line["service"], "inventory-outbox");
        assert_eq!(line["level"], "INFO");
        assert_eq!(line["message"], "Published outbox message");
        assert_eq!(line["fields"]["sequence"], 7);
        assert_eq!(line["fields"]["multiple"], true);
        assert_eq!(line["spans"][0], "dispatch");
        assert_eq!(line["pid"], std::process::id());
    }

    #[test]
    fn each_line_reaches_the_writer_in_one_call() {
        let buffer = Buffer::default();
        let subscriber =
            tracing_subscriber::registry().with(JsonLayer::new("inventory-outbox", buffer.clone()));

        tracing::subscriber::with_default(subscriber, || {
            for sequence in 1..=3u64 {
                tracing::warn!(sequence, "Broker nacked outbox message, requeueing");
            }
        });

        let chunks = buffer.0.lock().clone();
        assert_eq!(chunks.len(), 3);
        for chunk in &chunks {
            assert_eq!(chunk.iter().filter(|&&b| b == b'\n').count(), 1);
            assert_eq!(chunk.last(), Some(&b'\n'));
        }
    }
}
