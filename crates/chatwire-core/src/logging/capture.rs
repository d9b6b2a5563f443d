//! In-memory log sink for assertions.
//!
//! A few engine conditions surface only as logs: a send while the socket is
//! down, a dropped malformed frame, a failing handler. Tests install a sink
//! with [`capture_logs`] and look those records up.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

/// One recorded log line.
#[derive(Clone, Debug)]
pub struct LogRecord {
    /// Severity.
    pub level: Level,
    /// Rendered message.
    pub message: String,
    /// Structured fields, rendered with `Debug` (`%` fields print bare).
    pub fields: BTreeMap<String, String>,
}

/// Shared handle on everything logged while the guard is alive.
#[derive(Clone, Default)]
pub struct LogSink {
    records: Arc<Mutex<Vec<LogRecord>>>,
}

impl LogSink {
    /// Whether a record at `level` mentions `text`.
    pub fn contains(&self, level: Level, text: &str) -> bool {
        self.records
            .lock()
            .iter()
            .any(|r| r.level == level && r.message.contains(text))
    }

    /// First record whose message mentions `text`.
    pub fn find(&self, text: &str) -> Option<LogRecord> {
        self.records
            .lock()
            .iter()
            .find(|r| r.message.contains(text))
            .cloned()
    }
}

#[derive(Default)]
struct Fields {
    message: String,
    rest: BTreeMap<String, String>,
}

impl Visit for Fields {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        let rendered = format!("{value:?}");
        if field.name() == "message" {
            self.message = rendered;
        } else {
            let _ = self.rest.insert(field.name().to_owned(), rendered);
        }
    }
}

impl<S: Subscriber> Layer<S> for LogSink {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut fields = Fields::default();
        event.record(&mut fields);
        self.records.lock().push(LogRecord {
            level: *event.metadata().level(),
            message: fields.message,
            fields: fields.rest,
        });
    }
}

/// Route every event on this thread into a fresh sink until the guard drops.
/// Tasks spawned on a current-thread runtime land there too.
pub fn capture_logs() -> (LogSink, tracing::subscriber::DefaultGuard) {
    let sink = LogSink::default();
    let guard = tracing_subscriber::registry()
        .with(sink.clone())
        .set_default();
    (sink, guard)
}
