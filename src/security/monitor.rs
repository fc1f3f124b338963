//! In-memory log of security events with aggregate counters.
//!
//! One `SecurityMonitor` is created at startup and shared (`Arc`) with every
//! component that raises events. History is a ring buffer; statistics are
//! running counters, so they keep covering events the buffer has evicted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const DEFAULT_MAX_EVENTS: usize = 10_000;

const SUBSCRIBER_BUFFER: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SecurityEventType {
    /// Terminated by an OS resource limit (CPU, file size, memory).
    ProcessKilled,
    /// Terminated by the wall-clock watchdog.
    Timeout,
    /// A policy check failed and the action was blocked.
    PolicyDenied,
    /// A policy check failed in warn mode; the action went ahead.
    PolicyWarning,
    /// The command could not be started.
    SpawnFailed,
    /// Syscall filtering was requested but could not be prepared.
    FilterUnavailable,
    /// An audit record could not be persisted.
    AuditFailure,
}

impl fmt::Display for SecurityEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SecurityEventType::ProcessKilled => "PROCESS_KILLED",
            SecurityEventType::Timeout => "TIMEOUT",
            SecurityEventType::PolicyDenied => "POLICY_DENIED",
            SecurityEventType::PolicyWarning => "POLICY_WARNING",
            SecurityEventType::SpawnFailed => "SPAWN_FAILED",
            SecurityEventType::FilterUnavailable => "FILTER_UNAVAILABLE",
            SecurityEventType::AuditFailure => "AUDIT_FAILURE",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
            Severity::Critical => "CRITICAL",
        };
        f.write_str(s)
    }
}

/// An immutable record of something security-relevant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub id: Uuid,
    pub event_type: SecurityEventType,
    pub severity: Severity,
    pub details: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MonitorStatistics {
    pub total_events: u64,
    pub retained_events: usize,
    pub evicted_events: u64,
    pub by_type: BTreeMap<SecurityEventType, u64>,
    pub by_severity: BTreeMap<Severity, u64>,
}

#[derive(Debug, Default)]
struct MonitorState {
    events: VecDeque<SecurityEvent>,
    stats: MonitorStatistics,
}

#[derive(Debug)]
pub struct SecurityMonitor {
    state: Mutex<MonitorState>,
    /// `None` keeps every event for the life of the process.
    capacity: Option<usize>,
    sender: broadcast::Sender<SecurityEvent>,
}

impl Default for SecurityMonitor {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_MAX_EVENTS)
    }
}

impl SecurityMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Retain at most `max_events` events (at least one).
    pub fn with_capacity(max_events: usize) -> Self {
        Self::build(Some(max_events.max(1)))
    }

    pub fn unbounded() -> Self {
        Self::build(None)
    }

    fn build(capacity: Option<usize>) -> Self {
        let (sender, _) = broadcast::channel(SUBSCRIBER_BUFFER);
        Self {
            state: Mutex::new(MonitorState::default()),
            capacity,
            sender,
        }
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    // A writer that panicked mid-append cannot leave a partial event
    // behind (the push is the last step), so the data is still sound.
    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append one event and return it.
    pub fn record_event<I, K, V>(
        &self,
        event_type: SecurityEventType,
        severity: Severity,
        details: I,
    ) -> SecurityEvent
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let event = SecurityEvent {
            id: Uuid::new_v4(),
            event_type,
            severity,
            details: details
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            timestamp: Utc::now(),
        };

        match severity {
            Severity::Info => info!(event = %event_type, details = ?event.details, "security event"),
            Severity::Warning => warn!(event = %event_type, details = ?event.details, "security event"),
            Severity::Error | Severity::Critical => {
                error!(event = %event_type, severity = %severity, details = ?event.details, "security event")
            }
        }

        {
            let mut state = self.lock();
            state.stats.total_events += 1;
            *state.stats.by_type.entry(event_type).or_insert(0) += 1;
            *state.stats.by_severity.entry(severity).or_insert(0) += 1;
            if let Some(cap) = self.capacity {
                while state.events.len() >= cap {
                    state.events.pop_front();
                    state.stats.evicted_events += 1;
                }
            }
            state.events.push_back(event.clone());
        }

        // No subscribers is not an error.
        let _ = self.sender.send(event.clone());
        event
    }

    /// Retained history, oldest first.
    pub fn get_all_events(&self) -> Vec<SecurityEvent> {
        self.lock().events.iter().cloned().collect()
    }

    pub fn events_of_type(&self, event_type: SecurityEventType) -> Vec<SecurityEvent> {
        self.lock()
            .events
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }

    /// Counts over every event ever recorded, evicted ones included.
    pub fn get_statistics(&self) -> MonitorStatistics {
        let state = self.lock();
        let mut stats = state.stats.clone();
        stats.retained_events = state.events.len();
        stats
    }

    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Receive events recorded from now on. A slow receiver that falls more
    /// than the channel buffer behind sees `RecvError::Lagged`.
    pub fn subscribe(&self) -> broadcast::Receiver<SecurityEvent> {
        self.sender.subscribe()
    }
}
