//! The exporter seam. Network transport lives behind `SpanExporter`; the
//! agent only guarantees that batches reach it in order and are retried on failure.

use async_trait::async_trait;
use std::sync::Arc;

use super::span::SpanRecord;
use crate::error::AgentResult;

/// Accounting for one exported batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExportSummary {
    /// Records handled, including any dropped by filters
    pub processed: usize,
    /// Records actually shipped
    pub exported: usize,
    pub dropped: usize,
}

impl ExportSummary {
    pub fn all(count: usize) -> Self {
        Self {
            processed: count,
            exported: count,
            dropped: 0,
        }
    }
}

/// Ships a batch off-device. Must tolerate duplicate delivery on retry.
#[async_trait]
pub trait SpanExporter: Send + Sync {
    async fn export(&self, batch: Vec<SpanRecord>) -> AgentResult<ExportSummary>;
}

/// Logs every span, then forwards to the wrapped exporter if there is one.
pub struct LoggingExporter {
    inner: Option<Arc<dyn SpanExporter>>,
}

impl LoggingExporter {
    /// Log and accept every batch.
    pub fn new() -> Self {
        Self { inner: None }
    }

    pub fn wrapping(inner: Arc<dyn SpanExporter>) -> Self {
        Self { inner: Some(inner) }
    }
}

impl Default for LoggingExporter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SpanExporter for LoggingExporter {
    async fn export(&self, batch: Vec<SpanRecord>) -> AgentResult<ExportSummary> {
        for record in &batch {
            log::info!(
                "[EXPORT] span '{}' session={} status={:?} duration={}ms attributes={}",
                record.name,
                record.session_id,
                record.status,
                record.duration_ms(),
                serde_json::to_string(&record.attributes).unwrap_or_default()
            );
        }
        match &self.inner {
            Some(inner) => inner.export(batch).await,
            None => Ok(ExportSummary::all(batch.len())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::attributes::Attributes;
    use crate::telemetry::session::SessionId;
    use crate::telemetry::span::Span;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recording {
        batches: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl SpanExporter for Recording {
        async fn export(&self, batch: Vec<SpanRecord>) -> AgentResult<ExportSummary> {
            self.batches.lock().push(batch.len());
            Ok(ExportSummary::all(batch.len()))
        }
    }

    #[tokio::test]
    async fn test_logging_exporter_forwards() {
        let inner = Arc::new(Recording::default());
        let exporter = LoggingExporter::wrapping(inner.clone());
        let record = SpanRecord::stamp(Span::event("tap"), SessionId::from("s"), &Attributes::new());

        let summary = exporter.export(vec![record.clone(), record]).await.unwrap();
        assert_eq!(summary, ExportSummary::all(2));
        assert_eq!(*inner.batches.lock(), vec![2]);
    }

    #[tokio::test]
    async fn test_standalone_logging_exporter_accepts() {
        let summary = LoggingExporter::new().export(Vec::new()).await.unwrap();
        assert_eq!(summary.processed, 0);
    }
}
