//! Application-level security policy and the two process-wide sinks.
//!
//! ```text
//! ┌──────────────────────┬──────────────────────┐
//! │  filesystem.rs       │  network.rs          │
//! │  path + mode checks  │  destination host    │
//! │  (pure)              │  checks (pure)       │
//! ├──────────────────────┼──────────────────────┤
//! │  monitor.rs          │  audit.rs            │
//! │  in-memory events,   │  append-only JSONL,  │
//! │  statistics          │  SHA-256 hash chain  │
//! └──────────────────────┴──────────────────────┘
//! ```
//!
//! The access controls never perform I/O on the checked resource and hold
//! no mutable state. The monitor and audit log are created once at startup
//! and shared behind `Arc`.

pub mod audit;
pub mod filesystem;
pub mod monitor;
pub mod network;

pub use audit::{
    AUDIT_FILENAME, AuditEntry, AuditError, AuditLogger, AuditRecord, AuditResult, AuditStatistics,
    ExecutionRecord, FileAccessRecord, GENESIS_HASH, NetworkAccessRecord, audit_file_path,
};
pub use filesystem::{AccessMode, FileSystemAccessControl, FileSystemPolicy, FsAccessDecision, FsDenyReason};
pub use monitor::{
    DEFAULT_MAX_EVENTS, MonitorStatistics, SecurityEvent, SecurityEventType, SecurityMonitor, Severity,
};
pub use network::{HostPattern, NetAccessDecision, NetDenyReason, NetworkAccessControl, NetworkPolicy};
