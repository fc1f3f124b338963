//! warden - run untrusted commands under a sandbox policy.
//!
//! This crate provides:
//! - Syscall profiles and a seccomp-bpf filter installed between fork and exec
//! - Resource ceilings, process-group termination and a wall-clock watchdog
//! - Path and destination-host access checks
//! - An in-memory security event monitor and a hash-chained audit log
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use warden::sandbox::{SandboxConfig, SandboxManager, SecurityServices};
//! use warden::security::{AuditLogger, SecurityMonitor};
//!
//! let config = SandboxConfig::builder().timeout_secs(5.0).build()?;
//! let services = SecurityServices::new(
//!     Arc::new(SecurityMonitor::new()),
//!     Arc::new(AuditLogger::open("/var/lib/warden/audit.jsonl")?),
//! );
//! let manager = SandboxManager::new(config, "/srv/workspace", services);
//! let result = manager.execute(&["git", "status"]);
//! ```

pub mod cli;
pub mod config;
pub mod error;
pub mod paths;
pub mod sandbox;
pub mod security;

pub use config::Config;
pub use error::{ConfigError, ConfigResult};
