//! Centralized application log ring buffer and `tracing` wiring.
//!
//! Every `tracing` event passes through [`LogRingLayer`], which stores a
//! structured copy (level, source, message, fields) in a fixed-capacity
//! circular buffer and fans it out to live subscribers. This is the only
//! user-visible failure surface of the extension host: a UI layer reads
//! [`AppLog::entries`] or follows [`AppLog::subscribe`].

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::ShellConfig;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A single log entry stored in the ring buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: u64,
    pub timestamp_ms: i64,
    pub level: String,
    pub source: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_json: Option<String>,
}

// ---------------------------------------------------------------------------
// Ring buffer
// ---------------------------------------------------------------------------

pub const LOG_RING_CAPACITY: usize = 1000;

/// Fixed-capacity circular buffer for structured log entries.
pub struct LogRingBuffer {
    entries: VecDeque<LogEntry>,
    capacity: usize,
    /// Monotonically increasing ID for the next entry
    next_id: u64,
}

impl LogRingBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            next_id: 1,
        }
    }

    /// Push a new entry, evicting the oldest when full. Returns the stored entry.
    pub fn push(
        &mut self,
        level: String,
        source: String,
        message: String,
        data_json: Option<String>,
    ) -> LogEntry {
        let entry = LogEntry {
            id: self.next_id,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            level,
            source,
            message,
            data_json,
        };
        self.next_id += 1;

        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry.clone());
        entry
    }

    /// The most recent `limit` entries, oldest first. `0` returns everything.
    pub fn get_entries(&self, limit: usize) -> Vec<LogEntry> {
        let take = if limit == 0 {
            self.entries.len()
        } else {
            limit.min(self.entries.len())
        };
        let skip = self.entries.len() - take;
        self.entries.iter().skip(skip).cloned().collect()
    }

    /// Remove all entries. IDs keep increasing afterwards.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Shared log handle
// ---------------------------------------------------------------------------

/// Process-wide log store shared by the tracing layer and its readers.
pub struct AppLog {
    buffer: Mutex<LogRingBuffer>,
    live: broadcast::Sender<LogEntry>,
}

impl AppLog {
    pub fn new(capacity: usize) -> Arc<Self> {
        let (live, _) = broadcast::channel(256);
        Arc::new(Self {
            buffer: Mutex::new(LogRingBuffer::new(capacity)),
            live,
        })
    }

    pub fn push(
        &self,
        level: &str,
        source: &str,
        message: String,
        data_json: Option<String>,
    ) -> u64 {
        let entry = self
            .buffer
            .lock()
            .push(level.to_string(), source.to_string(), message, data_json);
        let id = entry.id;
        // No receivers is the common case
        let _ = self.live.send(entry);
        id
    }

    pub fn entries(&self, limit: usize) -> Vec<LogEntry> {
        self.buffer.lock().get_entries(limit)
    }

    pub fn clear(&self) {
        self.buffer.lock().clear();
    }

    /// Follow entries as they are pushed.
    pub fn subscribe(&self) -> broadcast::Receiver<LogEntry> {
        self.live.subscribe()
    }
}

// ---------------------------------------------------------------------------
// tracing layer
// ---------------------------------------------------------------------------

/// Copies every event into an [`AppLog`].
pub struct LogRingLayer {
    log: Arc<AppLog>,
}

impl LogRingLayer {
    pub fn new(log: Arc<AppLog>) -> Self {
        Self { log }
    }
}

#[derive(Default)]
struct FieldCollector {
    message: Option<String>,
    fields: serde_json::Map<String, serde_json::Value>,
}

impl Visit for FieldCollector {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.fields
                .insert(field.name().to_string(), serde_json::Value::from(value));
        }
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields
            .insert(field.name().to_string(), serde_json::Value::from(value));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields
            .insert(field.name().to_string(), serde_json::Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields
            .insert(field.name().to_string(), serde_json::Value::from(value));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let rendered = format!("{value:?}");
        if field.name() == "message" {
            self.message = Some(rendered);
        } else {
            self.fields
                .insert(field.name().to_string(), serde_json::Value::from(rendered));
        }
    }
}

impl<S: Subscriber> Layer<S> for LogRingLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut collector = FieldCollector::default();
        event.record(&mut collector);

        let meta = event.metadata();
        let data_json = if collector.fields.is_empty() {
            None
        } else {
            serde_json::to_string(&collector.fields).ok()
        };
        self.log.push(
            &meta.level().as_str().to_lowercase(),
            meta.target(),
            collector.message.unwrap_or_default(),
            data_json,
        );
    }
}

/// Install the global subscriber: env filter, fmt output and the log ring.
/// `RUST_LOG` wins over `config.log_filter`. Calling it twice keeps the first
/// subscriber and still returns a usable (detached) log.
pub fn init_logging(config: &ShellConfig) -> Arc<AppLog> {
    let log = AppLog::new(config.log_ring_capacity);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_filter));

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .with(LogRingLayer::new(log.clone()));

    #[cfg(feature = "tokio-console")]
    let registry = registry.with(console_subscriber::spawn());

    if let Err(e) = registry.try_init() {
        eprintln!("[logging] Subscriber already installed: {e}");
    }

    log
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
