//! Session identity with inactivity-based rotation.
//!
//! # Rotation
//! ```text
//! now - last_activity_at > inactivity_timeout  → rotate
//! now - created_at      >= max_lifetime        → rotate
//! ```
//! The check, the rotation and the activity update all happen under one lock,
//! so concurrent callers observe the same id for the same instant and no
//! rotation is lost.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::clock::Clock;

/// Opaque 128-bit session identifier, rendered as 32 lowercase hex chars.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        loop {
            let bytes: [u8; 16] = rand::random();
            // the all-zero id is reserved as invalid
            if bytes.iter().any(|b| *b != 0) {
                return SessionId(hex::encode(bytes));
            }
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Low 64 bits of the id, used for sampling decisions.
    pub fn low_bits(&self) -> u64 {
        let tail = match self.0.len().checked_sub(16) {
            Some(start) => self.0.get(start..),
            None => Some(self.0.as_str()),
        };
        tail.and_then(|t| u64::from_str_radix(t, 16).ok()).unwrap_or(0)
    }
}

impl From<&str> for SessionId {
    fn from(raw: &str) -> Self {
        SessionId(raw.to_string())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub created_at: Instant,
    pub last_activity_at: Instant,
}

impl Session {
    fn start(now: Instant) -> Self {
        Self {
            id: SessionId::generate(),
            created_at: now,
            last_activity_at: now,
        }
    }
}

/// Result of stamping activity onto the current session.
#[derive(Debug, Clone)]
pub struct SessionStamp {
    pub id: SessionId,
    /// Set when this call rotated the session away from a previous one
    pub previous: Option<SessionId>,
}

type SessionListener = Arc<dyn Fn(&SessionId, &SessionId) + Send + Sync>;

/// Owns the current session. One per running agent.
pub struct SessionTracker {
    inactivity_timeout: Duration,
    max_lifetime: Duration,
    clock: Arc<dyn Clock>,
    current: Mutex<Option<Session>>,
    listeners: RwLock<Vec<SessionListener>>,
}

impl SessionTracker {
    pub fn new(inactivity_timeout: Duration, max_lifetime: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            inactivity_timeout,
            max_lifetime,
            clock,
            current: Mutex::new(None),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// The active id, rotating first if the session has expired.
    pub fn current_session_id(&self) -> SessionId {
        self.current_session_id_at(None)
    }

    /// As `current_session_id`, for a caller-supplied reading. A missing
    /// reading is treated as now.
    pub fn current_session_id_at(&self, now: Option<Instant>) -> SessionId {
        self.resolve(now, false).id
    }

    /// Record activity at `now` (or the clock's now). An expired session is
    /// rotated first, never extended.
    pub fn mark_activity(&self, now: Option<Instant>) {
        self.resolve(now, true);
    }

    /// Rotate if expired, then record activity, in one step.
    pub fn touch(&self, now: Option<Instant>) -> SessionStamp {
        self.resolve(now, true)
    }

    /// Register a callback invoked with `(previous, next)` after each rotation.
    pub fn on_session_change<F>(&self, listener: F)
    where
        F: Fn(&SessionId, &SessionId) + Send + Sync + 'static,
    {
        self.listeners.write().push(Arc::new(listener));
    }

    /// Snapshot of the current session, if one has started.
    pub fn session(&self) -> Option<Session> {
        self.current.lock().clone()
    }

    fn resolve(&self, now: Option<Instant>, mark_activity: bool) -> SessionStamp {
        let now = now.unwrap_or_else(|| self.clock.now());

        let stamp = {
            let mut current = self.current.lock();
            let mut previous = None;
            let next = match current.take() {
                Some(session) if self.is_expired(&session, now) => {
                    previous = Some(session.id);
                    Session::start(now)
                }
                Some(session) => session,
                None => Session::start(now),
            };

            let session = current.insert(next);
            if mark_activity && now > session.last_activity_at {
                session.last_activity_at = now;
            }

            SessionStamp {
                id: session.id.clone(),
                previous,
            }
        };

        if let Some(previous) = &stamp.previous {
            log::debug!("[SESSION] Rotated session {} -> {}", previous, stamp.id);
            let listeners = self.listeners.read().clone();
            for listener in listeners {
                listener(previous, &stamp.id);
            }
        }

        stamp
    }

    fn is_expired(&self, session: &Session, now: Instant) -> bool {
        let idle = now.saturating_duration_since(session.last_activity_at);
        let age = now.saturating_duration_since(session.created_at);
        idle > self.inactivity_timeout || age >= self.max_lifetime
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::clock::ManualClock;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn tracker(timeout_secs: u64, clock: Arc<ManualClock>) -> SessionTracker {
        SessionTracker::new(
            Duration::from_secs(timeout_secs),
            Duration::from_secs(4 * 60 * 60),
            clock,
        )
    }

    #[test]
    fn test_rotates_after_inactivity() {
        let clock = Arc::new(ManualClock::new());
        let sessions = tracker(10, clock.clone());

        let first = sessions.current_session_id();
        clock.set_elapsed(Duration::from_secs(5));
        assert_eq!(sessions.current_session_id(), first);

        clock.set_elapsed(Duration::from_secs(16));
        let second = sessions.current_session_id();
        assert_ne!(second, first);
        assert_eq!(second.as_str().len(), 32);
    }

    #[test]
    fn test_activity_extends_session() {
        let clock = Arc::new(ManualClock::new());
        let sessions = tracker(10, clock.clone());

        let first = sessions.current_session_id();
        clock.set_elapsed(Duration::from_secs(8));
        sessions.mark_activity(None);
        clock.set_elapsed(Duration::from_secs(16));
        assert_eq!(sessions.current_session_id(), first);
    }

    #[test]
    fn test_rotation_resets_timestamps() {
        let clock = Arc::new(ManualClock::new());
        let sessions = tracker(10, clock.clone());
        sessions.current_session_id();

        clock.set_elapsed(Duration::from_secs(30));
        let stamp = sessions.touch(None);
        assert!(stamp.previous.is_some());

        let session = sessions.session().unwrap();
        assert_eq!(session.created_at, clock.at(Duration::from_secs(30)));
        assert_eq!(session.last_activity_at, session.created_at);
    }

    #[test]
    fn test_max_lifetime_rotates_active_session() {
        let clock = Arc::new(ManualClock::new());
        let sessions = SessionTracker::new(
            Duration::from_secs(60),
            Duration::from_secs(120),
            clock.clone(),
        );

        let first = sessions.touch(None).id;
        for secs in (30..=90).step_by(30) {
            clock.set_elapsed(Duration::from_secs(secs));
            assert_eq!(sessions.touch(None).id, first);
        }
        clock.set_elapsed(Duration::from_secs(120));
        assert_ne!(sessions.touch(None).id, first);
    }

    #[test]
    fn test_stale_reading_does_not_rotate_or_rewind() {
        let clock = Arc::new(ManualClock::new());
        let sessions = tracker(10, clock.clone());
        clock.set_elapsed(Duration::from_secs(5));
        let first = sessions.touch(None).id;

        // a reading older than the session start counts as no elapsed time
        let stale = clock.at(Duration::from_secs(1));
        assert_eq!(sessions.touch(Some(stale)).id, first);
        let session = sessions.session().unwrap();
        assert!(session.last_activity_at >= session.created_at);
    }

    #[test]
    fn test_listeners_see_previous_and_next() {
        let clock = Arc::new(ManualClock::new());
        let sessions = tracker(10, clock.clone());
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        sessions.on_session_change(move |prev, next| {
            assert_ne!(prev, next);
            seen.fetch_add(1, Ordering::SeqCst);
        });

        sessions.current_session_id();
        clock.set_elapsed(Duration::from_secs(11));
        sessions.current_session_id();
        sessions.current_session_id();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_callers_agree_after_expiry() {
        let clock = Arc::new(ManualClock::new());
        let sessions = Arc::new(tracker(10, clock.clone()));
        let first = sessions.current_session_id();
        clock.set_elapsed(Duration::from_secs(60));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let s = Arc::clone(&sessions);
                thread::spawn(move || s.current_session_id())
            })
            .collect();
        let ids: HashSet<SessionId> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(ids.len(), 1);
        assert!(!ids.contains(&first));
    }

    #[test]
    fn test_low_bits_parse() {
        let id = SessionId::from("0000000000000000000000000000000f");
        assert_eq!(id.low_bits(), 15);
        assert_eq!(SessionId::from("zz").low_bits(), 0);
        // a multi-byte char straddling the cut must not panic
        assert_eq!(SessionId::from("xé123456789abcdef").low_bits(), 0);
        assert_eq!(SessionId::from("ééééééééééééééééé").low_bits(), 0);
    }

    #[test]
    fn test_mark_activity_after_expiry_rotates() {
        let clock = Arc::new(ManualClock::new());
        let sessions = tracker(10, clock.clone());
        let first = sessions.current_session_id();

        clock.set_elapsed(Duration::from_secs(16));
        sessions.mark_activity(None);
        clock.set_elapsed(Duration::from_secs(17));

        let second = sessions.current_session_id();
        assert_ne!(second, first);
        let session = sessions.session().unwrap();
        assert_eq!(session.created_at, clock.at(Duration::from_secs(16)));
    }
}
