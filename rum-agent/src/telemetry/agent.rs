//! The telemetry facade.
//!
//! `RumAgent` owns one instance of each pipeline component and wires them
//! together: recorded spans are stamped with the current session and a
//! snapshot of the global attributes, buffered, and periodically flushed
//! through the filter chain to the exporter. Failed flushes requeue their
//! batch and back off exponentially.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::attributes::{AttributeValue, Attributes, GlobalAttributes};
use super::clock::{Clock, SystemClock};
use super::exporter::{ExportSummary, LoggingExporter, SpanExporter};
use super::filter::{ExportDecorationChain, ExportDecorationChainBuilder, FilterStage};
use super::retry::{Backoff, RetryPolicy};
use super::sampler::SessionSampler;
use super::session::{SessionId, SessionTracker};
use super::span::{Span, SpanGuard, SpanRecord, SpanSink, SpanStatus};
use super::store::{BufferedSpanStore, EnqueueOutcome, PersistenceStatus, SpanPersistence, StoreStats};
use super::watchdog::{MonitoredContext, ResponsivenessWatchdog};
use crate::config::AgentConfig;
use crate::db::Database;
use crate::error::{AgentError, AgentResult};

pub const SESSION_CHANGE_SPAN_NAME: &str = "sessionId.change";
pub const PREVIOUS_SESSION_ID_KEY: &str = "rum.previous_session_id";
pub const APP_KEY: &str = "app";
pub const DEPLOYMENT_ENVIRONMENT_KEY: &str = "deployment.environment";

/// Point-in-time view of the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentStats {
    pub store: StoreStats,
    /// Spans discarded because their session was not sampled
    pub sampled_out: u64,
    pub consecutive_flush_failures: u32,
}

pub struct RumAgentBuilder {
    config: AgentConfig,
    exporter: Option<Arc<dyn SpanExporter>>,
    clock: Arc<dyn Clock>,
    persistence: Option<Arc<dyn SpanPersistence>>,
    stages: ExportDecorationChainBuilder,
}

impl RumAgentBuilder {
    pub fn exporter(mut self, exporter: Arc<dyn SpanExporter>) -> Self {
        self.exporter = Some(exporter);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Use `persistence` instead of the SQLite file named by the config.
    /// Only consulted when disk buffering is enabled.
    pub fn persistence(mut self, persistence: Arc<dyn SpanPersistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Register a programmatic filter stage. Stages run after the configured
    /// rules, in the order they were added here.
    pub fn filter_stage<S: FilterStage + 'static>(mut self, stage: S) -> AgentResult<Self> {
        self.stages.stage(stage)?;
        Ok(self)
    }

    pub fn build(self) -> AgentResult<Arc<RumAgent>> {
        let config = self.config;
        config.validate()?;

        let mut chain = ExportDecorationChain::builder();
        chain.rules(config.filters.iter().cloned())?;
        chain.append(self.stages);
        let chain = chain.build();

        let exporter: Arc<dyn SpanExporter> = self
            .exporter
            .unwrap_or_else(|| Arc::new(LoggingExporter::new()));
        let exporter: Arc<dyn SpanExporter> = if config.debug_enabled {
            Arc::new(LoggingExporter::wrapping(exporter))
        } else {
            exporter
        };
        let exporter: Arc<dyn SpanExporter> = Arc::new(chain.wrap(exporter));

        let store = open_store(&config, self.persistence);

        let globals = GlobalAttributes::new(seed_globals(&config));
        let sessions = SessionTracker::new(
            config.inactivity_timeout(),
            config.max_session_lifetime(),
            self.clock.clone(),
        );

        log::info!(
            "[AGENT] '{}' started: {} filter stage(s), buffer {} bytes ({}), sampling {}",
            config.application_name,
            chain.len(),
            store.max_capacity_bytes(),
            if store.is_durable() { "disk" } else { "memory" },
            config.session_sampling_ratio
        );

        Ok(Arc::new(RumAgent {
            sessions,
            sampler: SessionSampler::new(config.session_sampling_ratio),
            globals,
            store,
            exporter,
            chain,
            backoff: Backoff::new(RetryPolicy::from_config(&config)),
            flush_lock: tokio::sync::Mutex::new(()),
            sampled_out: AtomicU64::new(0),
            clock: self.clock,
            cancel: CancellationToken::new(),
            config,
        }))
    }
}

fn seed_globals(config: &AgentConfig) -> Attributes {
    let mut globals = Attributes::new();
    globals.insert(
        APP_KEY.to_string(),
        AttributeValue::from(config.application_name.as_str()),
    );
    if let Some(environment) = &config.deployment_environment {
        globals.insert(
            DEPLOYMENT_ENVIRONMENT_KEY.to_string(),
            AttributeValue::from(environment.as_str()),
        );
    }
    globals.extend(config.global_attributes.clone());
    globals
}

/// Disk-backed when configured and openable, otherwise in memory.
fn open_store(config: &AgentConfig, persistence: Option<Arc<dyn SpanPersistence>>) -> BufferedSpanStore {
    if !config.disk_buffering_enabled {
        return BufferedSpanStore::in_memory(config.max_buffer_bytes);
    }

    let persistence = match persistence {
        Some(p) => Ok(p),
        None => Database::new(&config.database_path)
            .map(|db| Arc::new(db) as Arc<dyn SpanPersistence>)
            .map_err(AgentError::from),
    };

    match persistence.and_then(|p| BufferedSpanStore::open(p, config.max_buffer_bytes)) {
        Ok(store) => store,
        Err(e) => {
            log::warn!(
                "[AGENT] Disk buffering unavailable ({}), buffering in memory",
                e
            );
            BufferedSpanStore::in_memory(config.max_buffer_bytes)
        }
    }
}

pub struct RumAgent {
    config: AgentConfig,
    sessions: SessionTracker,
    sampler: SessionSampler,
    globals: GlobalAttributes,
    store: BufferedSpanStore,
    exporter: Arc<dyn SpanExporter>,
    chain: ExportDecorationChain,
    backoff: Backoff,
    flush_lock: tokio::sync::Mutex<()>,
    sampled_out: AtomicU64,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
}

impl RumAgent {
    pub fn builder(config: AgentConfig) -> RumAgentBuilder {
        RumAgentBuilder {
            config,
            exporter: None,
            clock: Arc::new(SystemClock),
            persistence: None,
            stages: ExportDecorationChain::builder(),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Stamp and buffer an ended span. Returns `None` when the current
    /// session is sampled out.
    pub fn record(&self, span: Span) -> Option<EnqueueOutcome> {
        let stamp = self.sessions.touch(None);

        if let Some(previous) = &stamp.previous {
            let change = Span::event(SESSION_CHANGE_SPAN_NAME)
                .with_attribute(PREVIOUS_SESSION_ID_KEY, previous.as_str());
            self.enqueue(change, stamp.id.clone());
        }

        self.enqueue(span, stamp.id)
    }

    fn enqueue(&self, span: Span, session_id: SessionId) -> Option<EnqueueOutcome> {
        if !self.sampler.is_sampled(&session_id) {
            self.sampled_out.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let globals = self.globals.snapshot();
        let record = SpanRecord::stamp(span, session_id, &globals);
        let outcome = self.store.enqueue(record);

        if outcome.evicted > 0 {
            log::debug!("[AGENT] Buffer full, evicted {} oldest span(s)", outcome.evicted);
        }
        if let PersistenceStatus::Degraded(e) = &outcome.persistence {
            log::debug!("[AGENT] {}", e);
        }
        Some(outcome)
    }

    /// Record a zero-duration span.
    pub fn add_event(&self, name: impl Into<String>, attributes: Attributes) -> Option<EnqueueOutcome> {
        self.record(Span::event(name).with_attributes(attributes))
    }

    /// Record an error-status span describing `error`, named after its type.
    pub fn add_exception<E>(&self, error: &E, attributes: Attributes) -> Option<EnqueueOutcome>
    where
        E: std::error::Error + ?Sized,
    {
        let full_type = std::any::type_name::<E>();
        let short_type = full_type.rsplit("::").next().unwrap_or(full_type);

        let mut span = Span::event(short_type)
            .with_attributes(attributes)
            .with_attribute("exception.type", full_type)
            .with_attribute("exception.message", error.to_string())
            .with_attribute("component", "error")
            .with_status(SpanStatus::Error);
        span.end();
        self.record(span)
    }

    /// Start a span that is recorded when the guard ends or drops.
    pub fn start_span(self: &Arc<Self>, name: impl Into<String>) -> SpanGuard {
        let sink: Arc<dyn SpanSink> = self.clone();
        SpanGuard::new(sink, Span::new(name))
    }

    /// Apply `mutator` to the global attributes atomically. Affects only
    /// spans recorded afterwards.
    pub fn update_global_attributes<F>(&self, mutator: F)
    where
        F: FnOnce(&mut Attributes),
    {
        self.globals.update(mutator);
    }

    pub fn set_global_attribute(&self, key: impl Into<String>, value: impl Into<AttributeValue>) {
        self.globals.set(key, value);
    }

    pub fn remove_global_attribute(&self, key: &str) {
        self.globals.remove(key);
    }

    pub fn global_attributes(&self) -> Arc<Attributes> {
        self.globals.snapshot()
    }

    /// The current session id, rotating first if it expired.
    pub fn session_id(&self) -> SessionId {
        self.sessions.current_session_id()
    }

    pub fn sessions(&self) -> &SessionTracker {
        &self.sessions
    }

    pub fn filter_chain(&self) -> &ExportDecorationChain {
        &self.chain
    }

    pub fn stats(&self) -> AgentStats {
        AgentStats {
            store: self.store.stats(),
            sampled_out: self.sampled_out.load(Ordering::Relaxed),
            consecutive_flush_failures: self.backoff.consecutive_failures(),
        }
    }

    /// Drain one batch and export it.
    ///
    /// On success the batch is discarded from the buffer. On failure or
    /// timeout it goes back to the front of the buffer in its original order
    /// and the backoff advances; the error is returned.
    pub async fn flush(&self) -> AgentResult<ExportSummary> {
        let _guard = self.flush_lock.lock().await;

        let batch = self.store.drain_batch(self.config.flush_batch_size);
        if batch.is_empty() {
            return Ok(ExportSummary::default());
        }

        let timeout = self.config.flush_timeout();
        let result = match tokio::time::timeout(timeout, self.exporter.export(batch.to_records())).await {
            Ok(result) => result,
            Err(_elapsed) => Err(AgentError::ExportTimeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
        };

        match result {
            Ok(summary) => {
                self.store.acknowledge(batch);
                self.backoff.reset();
                log::debug!(
                    "[AGENT] Flushed {} span(s), {} filtered",
                    summary.exported,
                    summary.dropped
                );
                Ok(summary)
            }
            Err(e) => {
                let count = batch.len();
                self.store.requeue(batch);
                let delay = self.backoff.record_failure();
                if e.is_retryable() {
                    log::warn!(
                        "[AGENT] Flush of {} span(s) failed: {}; retrying in {}ms",
                        count,
                        e,
                        delay.as_millis()
                    );
                } else {
                    log::error!(
                        "[AGENT] Flush of {} span(s) failed: {}; retrying in {}ms",
                        count,
                        e,
                        delay.as_millis()
                    );
                }
                Err(e)
            }
        }
    }

    /// How long the flush loop waits before its next attempt.
    pub fn next_flush_delay(&self) -> Duration {
        self.backoff
            .pending_delay()
            .unwrap_or_else(|| self.config.flush_interval())
    }

    /// Flush on the configured interval, backing off after failures, until
    /// shutdown. A full batch is followed immediately by another flush.
    pub fn spawn_flush_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let agent = Arc::clone(self);
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let mut delay = agent.config.flush_interval();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }

                delay = match agent.flush().await {
                    Ok(summary)
                        if summary.processed == agent.config.flush_batch_size && !agent.store.is_empty() =>
                    {
                        Duration::ZERO
                    }
                    _ => agent.next_flush_delay(),
                };
            }
            log::debug!("[AGENT] Flush loop stopped");
        })
    }

    /// Start the responsiveness watchdog on `context`. Returns `None` when
    /// ANR detection is disabled.
    pub fn spawn_watchdog(
        self: &Arc<Self>,
        context: Arc<dyn MonitoredContext>,
    ) -> Option<(Arc<ResponsivenessWatchdog>, tokio::task::JoinHandle<()>)> {
        if !self.config.anr_detection_enabled {
            log::debug!("[AGENT] ANR detection disabled");
            return None;
        }

        let sink: Arc<dyn SpanSink> = self.clone();
        let watchdog = Arc::new(ResponsivenessWatchdog::new(
            context,
            sink,
            self.clock.clone(),
            self.config.stall_threshold(),
            self.config.heartbeat_interval(),
        ));
        let handle = watchdog.spawn(self.cancel.child_token());
        Some((watchdog, handle))
    }

    /// Stop background tasks and make one last flush attempt. Spans that
    /// still fail to export stay buffered (and on disk, when enabled).
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if let Err(e) = self.flush().await {
            log::warn!("[AGENT] Final flush failed: {}", e);
        }
        let stats = self.store.stats();
        log::info!(
            "[AGENT] Shut down with {} span(s) buffered, {} evicted overall",
            stats.queued,
            stats.dropped_total
        );
    }

    pub fn is_shut_down(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl SpanSink for RumAgent {
    fn record(&self, span: Span) {
        RumAgent::record(self, span);
    }
}
