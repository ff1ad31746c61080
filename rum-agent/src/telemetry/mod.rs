//! Client-side RUM telemetry pipeline.
//!
//! Spans flow from instrumentation through `RumAgent::record`, get stamped
//! with the session and global attributes, wait in the `BufferedSpanStore`,
//! and leave through the `ExportDecorationChain`-wrapped exporter on flush.
//! The `SessionTracker` and `ResponsivenessWatchdog` feed the same pipeline.

pub mod agent;
pub mod attributes;
pub mod clock;
pub mod exporter;
pub mod filter;
pub mod retry;
pub mod sampler;
pub mod session;
pub mod span;
pub mod store;
pub mod watchdog;


// Re-export key types for convenience
pub use agent::{AgentStats, RumAgent, RumAgentBuilder};
pub use attributes::{AttributeValue, Attributes, GlobalAttributes};
pub use clock::{Clock, ManualClock, SystemClock};
pub use exporter::{ExportSummary, LoggingExporter, SpanExporter};
pub use filter::{ExportDecorationChain, FilterOutcome, FilterRule, FilterStage, FnStage};
pub use retry::{Backoff, RetryPolicy};
pub use sampler::SessionSampler;
pub use session::{Session, SessionId, SessionTracker};
pub use span::{Span, SpanGuard, SpanRecord, SpanSink, SpanStatus};
pub use store::{BufferedSpanStore, EnqueueOutcome, PersistenceStatus, SpanBatch, SpanPersistence, StoreStats};
pub use watchdog::{Heartbeat, LoopContext, MonitoredContext, ResponsivenessWatchdog, WatchdogState};
