//! Custom tracing layer for JSONL output.
//!
//! This layer produces machine-parseable JSONL logs on stderr while
//! keeping stdout clean for command payloads. Correlation fields emitted by
//! `log_event!` are lifted to the top level; anything else lands in
//! `fields`. Values of credential-named fields are masked.

use std::io::{self, Write};
use std::sync::Mutex;

use chrono::Utc;
use tracing::span::{Attributes, Id};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

use super::events::Level;

/// Replacement written for masked values.
pub const MASKED: &str = "[masked]";

/// Field names lifted out of `fields` into the top-level object.
const CORRELATION_FIELDS: [&str; 4] = ["run_id", "host_id", "instance_id", "stage"];

/// Whether a field name denotes a credential.
fn is_sensitive(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    ["secret", "key", "token", "authorization", "signature", "password"]
        .iter()
        .any(|needle| name.contains(needle))
}

/// Storage for span context data.
#[derive(Debug, Clone, Default)]
struct SpanContext {
    fields: serde_json::Map<String, serde_json::Value>,
}

/// A visitor that extracts field values from tracing events.
struct JsonFieldVisitor {
    fields: serde_json::Map<String, serde_json::Value>,
    message: Option<String>,
}

impl JsonFieldVisitor {
    fn new() -> Self {
        JsonFieldVisitor {
            fields: serde_json::Map::new(),
            message: None,
        }
    }

    fn insert(&mut self, name: &str, value: serde_json::Value) {
        let value = if is_sensitive(name) {
            serde_json::Value::String(MASKED.to_string())
        } else {
            value
        };
        self.fields.insert(name.to_string(), value);
    }
}

impl tracing::field::Visit for JsonFieldVisitor {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.insert(field.name(), serde_json::Value::String(value.to_string()));
        }
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        let s = format!("{:?}", value);
        if field.name() == "message" {
            self.message = Some(s);
        } else {
            self.insert(field.name(), serde_json::Value::String(s));
        }
    }

    fn record_i64(&mut self, field: &tracing::field::Field, value: i64) {
        self.insert(field.name(), serde_json::Value::Number(value.into()));
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.insert(field.name(), serde_json::Value::Number(value.into()));
    }

    fn record_f64(&mut self, field: &tracing::field::Field, value: f64) {
        if let Some(n) = serde_json::Number::from_f64(value) {
            self.insert(field.name(), serde_json::Value::Number(n));
        }
    }

    fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
        self.insert(field.name(), serde_json::Value::Bool(value));
    }
}

/// JSONL tracing layer that outputs to stderr.
pub struct JsonlLayer<W = io::Stderr> {
    writer: Mutex<W>,
}

impl JsonlLayer<io::Stderr> {
    /// Create a new JSONL layer writing to stderr.
    pub fn stderr() -> Self {
        JsonlLayer {
            writer: Mutex::new(io::stderr()),
        }
    }
}

impl<W: Write> JsonlLayer<W> {
    /// Create a new JSONL layer with a custom writer.
    pub fn new(writer: W) -> Self {
        JsonlLayer {
            writer: Mutex::new(writer),
        }
    }
}

impl<S, W> Layer<S> for JsonlLayer<W>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: Write + 'static,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let mut visitor = JsonFieldVisitor::new();
        attrs.record(&mut visitor);

        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(SpanContext {
                fields: visitor.fields,
            });
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let ts = Utc::now();

        let mut visitor = JsonFieldVisitor::new();
        event.record(&mut visitor);

        // Inherit span fields the event did not set itself, innermost first.
        if let Some(scope) = ctx.event_scope(event) {
            for span in scope {
                if let Some(span_ctx) = span.extensions().get::<SpanContext>() {
                    for (key, value) in &span_ctx.fields {
                        visitor
                            .fields
                            .entry(key.clone())
                            .or_insert_with(|| value.clone());
                    }
                }
            }
        }

        let level: Level = (*event.metadata().level()).into();
        let mut obj = serde_json::Map::new();

        obj.insert("ts".to_string(), serde_json::json!(ts.to_rfc3339()));
        obj.insert("level".to_string(), serde_json::json!(level));
        obj.insert(
            "event".to_string(),
            serde_json::json!(event.metadata().target()),
        );

        for name in CORRELATION_FIELDS {
            if let Some(value) = visitor.fields.remove(name) {
                obj.insert(name.to_string(), value);
            }
        }
        if let Some(msg) = visitor.message {
            obj.insert("message".to_string(), serde_json::json!(msg));
        }

        if !visitor.fields.is_empty() {
            obj.insert(
                "fields".to_string(),
                serde_json::Value::Object(visitor.fields),
            );
        }

        let json = serde_json::to_string(&serde_json::Value::Object(obj)).unwrap_or_default();
        if let Ok(mut writer) = self.writer.lock() {
            let _ = writeln!(writer, "{}", json);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::{LogContext, Stage};
    use labstats_common::InstanceId;
    use std::sync::Arc;
    use tracing_subscriber::layer::SubscriberExt;

    fn make_buffer_layer() -> (Arc<Mutex<Vec<u8>>>, impl Layer<tracing_subscriber::Registry>) {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        struct BufWriter(Arc<Mutex<Vec<u8>>>);
        impl Write for BufWriter {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                self.0.lock().unwrap().write(buf)
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }
        let layer = JsonlLayer::new(BufWriter(buffer.clone()));
        (buffer, layer)
    }

    fn parse_single(buffer: &Arc<Mutex<Vec<u8>>>) -> serde_json::Value {
        let output = buffer.lock().unwrap();
        let json_str = String::from_utf8_lossy(&output);
        serde_json::from_str(json_str.trim()).expect("valid JSON line")
    }

    #[test]
    fn layer_records_level_and_message() {
        let (buffer, layer) = make_buffer_layer();
        let subscriber = tracing_subscriber::registry().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(target: "cycle.fetch_failed", message = "spot api down");
        });

        let parsed = parse_single(&buffer);
        assert_eq!(parsed["level"], "warn");
        assert_eq!(parsed["event"], "cycle.fetch_failed");
        assert_eq!(parsed["message"], "spot api down");
        assert!(parsed["ts"].is_string());
    }

    #[test]
    fn correlation_fields_are_top_level() {
        let (buffer, layer) = make_buffer_layer();
        let subscriber = tracing_subscriber::registry().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(
                target: "cycle.finished",
                run_id = "run-abc",
                instance_id = 77u64,
                stage = "upload",
                uploaded = 4u64,
                message = "done"
            );
        });

        let parsed = parse_single(&buffer);
        assert_eq!(parsed["run_id"], "run-abc");
        assert_eq!(parsed["instance_id"], 77);
        assert_eq!(parsed["stage"], "upload");
        assert_eq!(parsed["fields"]["uploaded"], 4);
        assert!(parsed["fields"].get("run_id").is_none());
    }

    #[test]
    fn instance_id_only_when_known() {
        let (buffer, layer) = make_buffer_layer();
        let subscriber = tracing_subscriber::registry().with(layer);
        let ctx = LogContext::new("run-abc", "host-xyz");

        tracing::subscriber::with_default(subscriber, || {
            crate::log_event!(ctx, INFO, "stop.completed", Stage::Stop, "no instance yet");
            let ctx = ctx.clone().with_instance(InstanceId(77));
            crate::log_event!(ctx, INFO, "stop.completed", Stage::Stop, "instance 77");
        });

        let output = buffer.lock().unwrap();
        let lines: Vec<serde_json::Value> = String::from_utf8_lossy(&output)
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["run_id"], "run-abc");
        assert!(lines[0].get("instance_id").is_none());
        assert_eq!(lines[1]["instance_id"], 77);
    }

    #[test]
    fn credential_fields_are_masked() {
        let (buffer, layer) = make_buffer_layer();
        let subscriber = tracing_subscriber::registry().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            tracing::debug!(
                target: "config.loaded",
                oauth_secret = "hunter2",
                oauth_key = "abc",
                server_host = "https://spot.test",
                message = "loaded"
            );
        });

        let parsed = parse_single(&buffer);
        assert_eq!(parsed["fields"]["oauth_secret"], MASKED);
        assert_eq!(parsed["fields"]["oauth_key"], MASKED);
        assert_eq!(parsed["fields"]["server_host"], "https://spot.test");
    }

    #[test]
    fn span_fields_are_inherited() {
        let (buffer, layer) = make_buffer_layer();
        let subscriber = tracing_subscriber::registry().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!("cycle", run_id = "run-span", cycle = 3u64);
            let _entered = span.enter();
            tracing::info!(target: "cycle.started", message = "go");
        });

        let parsed = parse_single(&buffer);
        assert_eq!(parsed["run_id"], "run-span");
        assert_eq!(parsed["fields"]["cycle"], 3);
    }

    #[test]
    fn sensitivity_by_name() {
        assert!(is_sensitive("oauth_secret"));
        assert!(is_sensitive("Authorization"));
        assert!(is_sensitive("api_token"));
        assert!(!is_sensitive("spot"));
        assert!(!is_sensitive("labstats_url"));
    }
}
