//! Spans as produced by instrumentation, and the stamped records the buffer owns.
//!
//! A `Span` is mutable while the operation runs. Once it ends it is handed to
//! a `SpanSink`, which stamps it with the session id and global attributes and
//! turns it into an immutable `SpanRecord`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::attributes::{AttributeValue, Attributes, normalize_attributes};
use super::session::SessionId;

/// Completion status of a span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SpanStatus {
    #[default]
    Unset,
    Ok,
    Error,
}

/// A span still owned by the code that produced it.
#[derive(Debug, Clone)]
pub struct Span {
    pub name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub attributes: Attributes,
    pub status: SpanStatus,
}

impl Span {
    /// Start a span now.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            start_time: Utc::now(),
            end_time: None,
            attributes: Attributes::new(),
            status: SpanStatus::Unset,
        }
    }

    /// A zero-duration span, used for point-in-time events.
    pub fn event(name: impl Into<String>) -> Self {
        let mut span = Self::new(name);
        span.end_time = Some(span.start_time);
        span
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_attributes(mut self, attrs: Attributes) -> Self {
        self.attributes.extend(attrs);
        self
    }

    pub fn with_status(mut self, status: SpanStatus) -> Self {
        self.status = status;
        self
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<AttributeValue>) {
        self.attributes.insert(key.into(), value.into());
    }

    /// Mark the span as ended successfully, keeping an earlier error status.
    pub fn end(&mut self) {
        if self.end_time.is_none() {
            self.end_time = Some(Utc::now());
        }
        if self.status == SpanStatus::Unset {
            self.status = SpanStatus::Ok;
        }
    }

    /// Mark the span as failed.
    pub fn fail(&mut self, message: impl Into<String>) {
        self.status = SpanStatus::Error;
        self.attributes
            .insert("error.message".to_string(), AttributeValue::String(message.into()));
        if self.end_time.is_none() {
            self.end_time = Some(Utc::now());
        }
    }

    pub fn is_ended(&self) -> bool {
        self.end_time.is_some()
    }
}

/// A stamped span awaiting export. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanRecord {
    pub name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub attributes: Attributes,
    pub status: SpanStatus,
    pub session_id: SessionId,
    /// Encoded payload size, used for buffer accounting
    pub size_bytes: u64,
}

impl SpanRecord {
    /// Stamp an ended span. Span attributes win over globals on key collisions.
    pub fn stamp(span: Span, session_id: SessionId, globals: &Attributes) -> Self {
        let end_time = span.end_time.unwrap_or_else(Utc::now).max(span.start_time);

        let mut attributes = globals.clone();
        attributes.extend(span.attributes);
        normalize_attributes(&mut attributes);

        let mut record = Self {
            name: span.name,
            start_time: span.start_time,
            end_time,
            attributes,
            status: span.status,
            session_id,
            size_bytes: 0,
        };
        record.size_bytes = record.estimated_size();
        record
    }

    /// Approximate encoded size of this record.
    pub fn estimated_size(&self) -> u64 {
        // fixed cost: two RFC 3339 timestamps, status, session id, framing
        let fixed = 2 * 32 + 8 + 32 + 16;
        let attrs: usize = self
            .attributes
            .iter()
            .map(|(k, v)| k.len() + v.encoded_len() + 4)
            .sum();
        (fixed + self.name.len() + attrs) as u64
    }

    pub fn duration_ms(&self) -> u64 {
        (self.end_time - self.start_time).num_milliseconds().max(0) as u64
    }

    pub fn attribute(&self, key: &str) -> Option<&AttributeValue> {
        self.attributes.get(key)
    }
}

/// Destination for ended spans.
pub trait SpanSink: Send + Sync {
    fn record(&self, span: Span);
}

/// RAII guard that hands its span to the sink when dropped.
///
/// An unfinished span is ended successfully on drop.
pub struct SpanGuard {
    sink: Arc<dyn SpanSink>,
    span: Option<Span>,
}

impl SpanGuard {
    pub fn new(sink: Arc<dyn SpanSink>, span: Span) -> Self {
        Self {
            sink,
            span: Some(span),
        }
    }

    /// Access the span mutably for adding attributes.
    pub fn span_mut(&mut self) -> Option<&mut Span> {
        self.span.as_mut()
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<AttributeValue>) {
        if let Some(span) = self.span.as_mut() {
            span.set_attribute(key, value);
        }
    }

    pub fn end(mut self) {
        if let Some(mut span) = self.span.take() {
            span.end();
            self.sink.record(span);
        }
    }

    pub fn fail(mut self, message: impl Into<String>) {
        if let Some(mut span) = self.span.take() {
            span.fail(message);
            self.sink.record(span);
        }
    }
}

impl Drop for SpanGuard {
    fn drop(&mut self) {
        if let Some(mut span) = self.span.take() {
            span.end();
            self.sink.record(span);
        }
    }
}
