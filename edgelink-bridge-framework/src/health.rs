//! Session health tracking.
//!
//! Every long-lived external session (the cloud MQTT connection, the
//! radio-relay link) walks the same small state machine:
//!
//! ```text
//! Disconnected -> Connecting -> Connected
//!       ^              |            |
//!       +--------------+------------+   (any failure)
//! ```
//!
//! [`SessionHealth`] records those transitions, counts connects and
//! failures, and lets other tasks observe the current state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Connection state of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// No session exists.
    #[default]
    Disconnected,
    /// A connection attempt is in progress.
    Connecting,
    /// The session is up.
    Connected,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Disconnected => write!(f, "disconnected"),
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Connected => write!(f, "connected"),
        }
    }
}

/// Health tracker for one external session.
#[derive(Debug)]
pub struct SessionHealth {
    /// Session name used in logs ("cloud", "lora").
    name: String,
    /// Start time for uptime calculation.
    start_time: Instant,
    /// Current state, observable.
    state: watch::Sender<SessionState>,
    /// Successful connects.
    connects: AtomicU64,
    /// Failures of any kind (connect, subscribe, I/O).
    failures: AtomicU64,
    /// Failures since the last successful connect.
    consecutive_failures: AtomicU64,
    /// Millis since epoch of the last state change.
    last_change: AtomicU64,
    /// Last error message (if any).
    last_error: RwLock<Option<String>>,
}

/// Health snapshot for serialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    /// Session name.
    pub session: String,
    /// Current state.
    pub state: SessionState,
    /// Uptime in seconds.
    pub uptime_secs: u64,
    /// Successful connects.
    pub connects: u64,
    /// Reconnects (connects after the first one).
    pub reconnects: u64,
    /// Total failures.
    pub failures: u64,
    /// Failures since the last successful connect.
    pub consecutive_failures: u64,
    /// Last state change (millis since epoch).
    pub last_change: u64,
    /// Last error message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl SessionHealth {
    /// Create a new tracker in the `Disconnected` state.
    pub fn new(name: impl Into<String>) -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        Self {
            name: name.into(),
            start_time: Instant::now(),
            state,
            connects: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            consecutive_failures: AtomicU64::new(0),
            last_change: AtomicU64::new(now_millis()),
            last_error: RwLock::new(None),
        }
    }

    /// Session name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Observe state changes.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Record the start of a connection attempt.
    pub fn set_connecting(&self) {
        self.transition(SessionState::Connecting);
    }

    /// Record a successful connect.
    pub fn set_connected(&self) {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.consecutive_failures.store(0, Ordering::SeqCst);
        *self.last_error.write() = None;
        self.transition(SessionState::Connected);
    }

    /// Record an orderly teardown (no failure).
    pub fn set_disconnected(&self) {
        self.transition(SessionState::Disconnected);
    }

    /// Record a failure. Always leaves the session `Disconnected`.
    pub fn record_failure(&self, error: &str) {
        self.failures.fetch_add(1, Ordering::SeqCst);
        self.consecutive_failures.fetch_add(1, Ordering::SeqCst);
        *self.last_error.write() = Some(error.to_string());
        self.transition(SessionState::Disconnected);
    }

    /// Take a snapshot of the current counters.
    pub fn snapshot(&self) -> HealthSnapshot {
        let connects = self.connects.load(Ordering::SeqCst);
        HealthSnapshot {
            session: self.name.clone(),
            state: self.state(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            connects,
            reconnects: connects.saturating_sub(1),
            failures: self.failures.load(Ordering::SeqCst),
            consecutive_failures: self.consecutive_failures.load(Ordering::SeqCst),
            last_change: self.last_change.load(Ordering::SeqCst),
            last_error: self.last_error.read().clone(),
        }
    }

    fn transition(&self, next: SessionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            self.last_change.store(now_millis(), Ordering::SeqCst);
            tracing::debug!(session = %self.name, from = %previous, to = %next, "Session state change");
        }
    }
}

fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
