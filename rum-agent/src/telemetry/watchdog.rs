//! Responsiveness watchdog (ANR detection).
//!
//! Every heartbeat period the watchdog posts a heartbeat to the monitored
//! context and checks whether the previous one was acknowledged. A heartbeat
//! left unacknowledged for longer than the stall threshold moves the watchdog
//! to `Stalled` and emits one "ANR" span carrying the context's stack. The
//! watchdog returns to `Monitoring` once that heartbeat finally runs.
//!
//! The state machine is driven by `tick()`, so it can be stepped
//! deterministically with a `ManualClock`; `spawn` drives it from a tokio
//! interval until cancelled.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use super::clock::Clock;
use super::span::{Span, SpanSink, SpanStatus};

pub const ANR_SPAN_NAME: &str = "ANR";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogState {
    Idle,
    Monitoring,
    Stalled,
}

/// A heartbeat posted to the monitored context. Running it is the
/// acknowledgment.
#[derive(Debug)]
pub struct Heartbeat {
    seq: u64,
    acked: Arc<AtomicU64>,
}

impl Heartbeat {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn acknowledge(self) {
        self.acked.fetch_max(self.seq, Ordering::SeqCst);
    }
}

/// The execution context being watched, e.g. a UI or event loop.
pub trait MonitoredContext: Send + Sync {
    /// Queue `heartbeat` to run on the context. Must not block.
    fn post(&self, heartbeat: Heartbeat);

    /// The context's current call stack, as text.
    fn capture_stack(&self) -> String;
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    seq: u64,
    posted_at: Instant,
}

#[derive(Debug)]
struct WatchdogInner {
    state: WatchdogState,
    pending: Option<Pending>,
    next_seq: u64,
}

pub struct ResponsivenessWatchdog {
    context: Arc<dyn MonitoredContext>,
    sink: Arc<dyn SpanSink>,
    clock: Arc<dyn Clock>,
    stall_threshold: Duration,
    heartbeat_interval: Duration,
    acked: Arc<AtomicU64>,
    inner: Mutex<WatchdogInner>,
    stalls_total: AtomicU64,
}

impl ResponsivenessWatchdog {
    pub fn new(
        context: Arc<dyn MonitoredContext>,
        sink: Arc<dyn SpanSink>,
        clock: Arc<dyn Clock>,
        stall_threshold: Duration,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            context,
            sink,
            clock,
            stall_threshold,
            heartbeat_interval,
            acked: Arc::new(AtomicU64::new(0)),
            inner: Mutex::new(WatchdogInner {
                state: WatchdogState::Idle,
                pending: None,
                next_seq: 1,
            }),
            stalls_total: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> WatchdogState {
        self.inner.lock().state
    }

    /// Stall episodes detected since start.
    pub fn stalls_total(&self) -> u64 {
        self.stalls_total.load(Ordering::Relaxed)
    }

    /// Idle -> Monitoring. Has no effect once started.
    pub fn start(&self) {
        let mut inner = self.inner.lock();
        if inner.state == WatchdogState::Idle {
            inner.state = WatchdogState::Monitoring;
            log::debug!(
                "[WATCHDOG] Monitoring started (threshold {}ms)",
                self.stall_threshold.as_millis()
            );
        }
    }

    /// Advance the state machine by one heartbeat period.
    pub fn tick(&self) -> WatchdogState {
        let now = self.clock.now();
        let acked = self.acked.load(Ordering::SeqCst);

        let mut to_post = None;
        let mut stalled_for = None;

        let state = {
            let mut inner = self.inner.lock();
            if inner.state == WatchdogState::Idle {
                return WatchdogState::Idle;
            }

            if let Some(pending) = inner.pending {
                if acked >= pending.seq {
                    inner.pending = None;
                    if inner.state == WatchdogState::Stalled {
                        log::info!(
                            "[WATCHDOG] Context recovered after {}ms",
                            now.saturating_duration_since(pending.posted_at).as_millis()
                        );
                        inner.state = WatchdogState::Monitoring;
                    }
                }
            }

            match inner.pending {
                None => {
                    let seq = inner.next_seq;
                    inner.next_seq += 1;
                    inner.pending = Some(Pending { seq, posted_at: now });
                    to_post = Some(Heartbeat {
                        seq,
                        acked: self.acked.clone(),
                    });
                }
                Some(pending) if inner.state == WatchdogState::Monitoring => {
                    let waited = now.saturating_duration_since(pending.posted_at);
                    if waited > self.stall_threshold {
                        inner.state = WatchdogState::Stalled;
                        stalled_for = Some(waited);
                    }
                }
                // still stalled; the episode's span is already out
                Some(_) => {}
            }

            inner.state
        };

        if let Some(heartbeat) = to_post {
            self.context.post(heartbeat);
        }
        if let Some(waited) = stalled_for {
            self.report_stall(waited);
        }
        state
    }

    fn report_stall(&self, waited: Duration) {
        self.stalls_total.fetch_add(1, Ordering::Relaxed);
        let stack = self.context.capture_stack();
        log::warn!(
            "[WATCHDOG] Monitored context unresponsive for {}ms",
            waited.as_millis()
        );

        let mut span = Span::event(ANR_SPAN_NAME)
            .with_attribute("exception.stacktrace", stack)
            .with_attribute("component", "error")
            .with_attribute("anr.threshold_ms", self.stall_threshold.as_millis() as i64)
            .with_attribute("anr.waited_ms", waited.as_millis() as i64)
            .with_status(SpanStatus::Error);
        span.end();
        self.sink.record(span);
    }

    /// Start monitoring and tick every heartbeat interval until `cancel` fires.
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let watchdog = Arc::clone(self);
        watchdog.start();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(watchdog.heartbeat_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        log::debug!("[WATCHDOG] Stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        watchdog.tick();
                    }
                }
            }
        })
    }
}

type StackProvider = Box<dyn Fn() -> String + Send + Sync>;

/// A `MonitoredContext` for hosts that run their own loop: heartbeats queue
/// up here and run when the loop calls `pump()`.
pub struct LoopContext {
    name: String,
    queue: Mutex<VecDeque<Heartbeat>>,
    stack_provider: Option<StackProvider>,
}

impl LoopContext {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            queue: Mutex::new(VecDeque::new()),
            stack_provider: None,
        }
    }

    /// Use `provider` to describe what the loop is doing when it stalls.
    pub fn with_stack_provider<F>(mut self, provider: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.stack_provider = Some(Box::new(provider));
        self
    }

    /// Run every queued heartbeat. Call from the monitored loop.
    pub fn pump(&self) -> usize {
        let drained: Vec<Heartbeat> = self.queue.lock().drain(..).collect();
        let count = drained.len();
        for heartbeat in drained {
            heartbeat.acknowledge();
        }
        count
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }
}

impl MonitoredContext for LoopContext {
    fn post(&self, heartbeat: Heartbeat) {
        self.queue.lock().push_back(heartbeat);
    }

    fn capture_stack(&self) -> String {
        match &self.stack_provider {
            Some(provider) => provider(),
            None => format!(
                "{}: {} heartbeat(s) waiting, loop not pumped",
                self.name,
                self.pending()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::clock::ManualClock;

    #[derive(Default)]
    struct Collected {
        spans: Mutex<Vec<Span>>,
    }

    impl SpanSink for Collected {
        fn record(&self, span: Span) {
            self.spans.lock().push(span);
        }
    }

    struct Fixture {
        clock: Arc<ManualClock>,
        context: Arc<LoopContext>,
        sink: Arc<Collected>,
        watchdog: ResponsivenessWatchdog,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new());
        let context = Arc::new(
            LoopContext::new("main").with_stack_provider(|| "at main_loop\nat render_frame".to_string()),
        );
        let sink = Arc::new(Collected::default());
        let watchdog = ResponsivenessWatchdog::new(
            context.clone(),
            sink.clone(),
            clock.clone(),
            Duration::from_secs(5),
            Duration::from_secs(1),
        );
        watchdog.start();
        Fixture {
            clock,
            context,
            sink,
            watchdog,
        }
    }

    #[test]
    fn test_idle_until_started() {
        let clock = Arc::new(ManualClock::new());
        let context = Arc::new(LoopContext::new("main"));
        let watchdog = ResponsivenessWatchdog::new(
            context.clone(),
            Arc::new(Collected::default()),
            clock,
            Duration::from_secs(5),
            Duration::from_secs(1),
        );
        assert_eq!(watchdog.tick(), WatchdogState::Idle);
        assert_eq!(context.pending(), 0);
    }

    #[test]
    fn test_prompt_acks_never_stall() {
        let f = fixture();
        for _ in 0..100 {
            f.watchdog.tick();
            f.clock.advance(Duration::from_secs(1));
            f.context.pump();
        }
        assert_eq!(f.watchdog.state(), WatchdogState::Monitoring);
        assert!(f.sink.spans.lock().is_empty());
    }

    #[test]
    fn test_slow_but_timely_ack_is_not_a_stall() {
        let f = fixture();
        for _ in 0..20 {
            f.watchdog.tick();
            for _ in 0..4 {
                f.clock.advance(Duration::from_secs(1));
                f.watchdog.tick();
            }
            f.context.pump();
        }
        assert!(f.sink.spans.lock().is_empty());
    }

    #[test]
    fn test_withheld_heartbeat_emits_exactly_one_span() {
        let f = fixture();
        f.watchdog.tick();
        for _ in 0..6 {
            f.clock.advance(Duration::from_secs(1));
            f.watchdog.tick();
        }
        assert_eq!(f.watchdog.state(), WatchdogState::Stalled);

        // still blocked: no duplicate
        for _ in 0..10 {
            f.clock.advance(Duration::from_secs(1));
            f.watchdog.tick();
        }

        let spans = f.sink.spans.lock();
        assert_eq!(spans.len(), 1);
        let anr = &spans[0];
        assert_eq!(anr.name, ANR_SPAN_NAME);
        assert_eq!(anr.status, SpanStatus::Error);
        let stack = anr.attributes["exception.stacktrace"].as_str().unwrap();
        assert!(!stack.is_empty());
        assert_eq!(anr.attributes["component"].as_str(), Some("error"));
        assert_eq!(f.watchdog.stalls_total(), 1);
    }

    #[test]
    fn test_recovers_and_detects_next_episode() {
        let f = fixture();
        f.watchdog.tick();
        f.clock.advance(Duration::from_secs(6));
        assert_eq!(f.watchdog.tick(), WatchdogState::Stalled);

        f.context.pump();
        assert_eq!(f.watchdog.tick(), WatchdogState::Monitoring);

        // new heartbeat was posted on recovery; withhold it too
        f.clock.advance(Duration::from_secs(6));
        assert_eq!(f.watchdog.tick(), WatchdogState::Stalled);
        assert_eq!(f.sink.spans.lock().len(), 2);
    }

    #[test]
    fn test_default_stack_description_is_not_empty() {
        let context = LoopContext::new("ui");
        context.post(Heartbeat {
            seq: 1,
            acked: Arc::new(AtomicU64::new(0)),
        });
        assert!(context.capture_stack().contains("ui"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_loop_detects_stall_and_stops() {
        let f = fixture();
        let watchdog = Arc::new(ResponsivenessWatchdog::new(
            f.context.clone(),
            f.sink.clone(),
            f.clock.clone(),
            Duration::from_millis(50),
            Duration::from_millis(10),
        ));
        let cancel = CancellationToken::new();
        let handle = watchdog.spawn(cancel.clone());

        // the loop is never pumped
        tokio::time::sleep(Duration::from_millis(30)).await;
        f.clock.advance(Duration::from_millis(80));
        tokio::time::sleep(Duration::from_millis(30)).await;

        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(watchdog.stalls_total(), 1);
        assert_eq!(f.sink.spans.lock().len(), 1);
    }
}
