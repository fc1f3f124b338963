//! Append-only, hash-chained audit trail of sandbox decisions.
//!
//! Stored as JSONL at `<state_dir>/audit.jsonl`. Every line carries the
//! SHA-256 of the line before it, so editing or deleting a past entry
//! breaks the chain at the following line.
//!
//! # Format
//!
//! | Field | Description |
//! |-------|-------------|
//! | `ts` | RFC 3339 timestamp |
//! | `prev_entry_sha256` | SHA-256 of the previous JSONL line |
//! | `category` | `execution`, `file_access`, `network_access` or `chain_recovery` |
//! | ... | category-specific payload, flattened |
//!
//! The first entry uses 64 zeros as `prev_entry_sha256`. If the last line
//! on disk is not a valid entry (torn write, manual edit), the next append
//! first writes a `chain_recovery` entry linking to the corrupt line.

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use super::filesystem::AccessMode;
use crate::sandbox::{EnforcementMode, ExecutionOutcome, ResourceUsage, SyscallProfile};

pub const AUDIT_FILENAME: &str = "audit.jsonl";

/// `prev_entry_sha256` of the first entry in a chain.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit log I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to serialize audit entry: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl AuditError {
    fn io(path: &Path, source: io::Error) -> Self {
        AuditError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

pub type AuditResult<T> = std::result::Result<T, AuditError>;

/// One line of the audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub ts: DateTime<Utc>,
    pub prev_entry_sha256: String,
    #[serde(flatten)]
    pub record: AuditRecord,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "category", rename_all = "snake_case")]
pub enum AuditRecord {
    Execution(ExecutionRecord),
    FileAccess(FileAccessRecord),
    NetworkAccess(NetworkAccessRecord),
    /// Previous line was unreadable; a new chain segment starts here.
    ChainRecovery { detail: String },
}

impl AuditRecord {
    pub fn category(&self) -> &'static str {
        match self {
            AuditRecord::Execution(_) => "execution",
            AuditRecord::FileAccess(_) => "file_access",
            AuditRecord::NetworkAccess(_) => "network_access",
            AuditRecord::ChainRecovery { .. } => "chain_recovery",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: Uuid,
    pub command: Vec<String>,
    pub workspace: PathBuf,
    /// `false` marks a pass-through run with the sandbox switched off.
    pub sandboxed: bool,
    pub mode: EnforcementMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<SyscallProfile>,
    pub outcome: ExecutionOutcome,
    pub exit_code: i32,
    pub killed: bool,
    pub timed_out: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_usage: Option<ResourceUsage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub policy_violations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileAccessRecord {
    pub path: PathBuf,
    pub operation: AccessMode,
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkAccessRecord {
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub protocol: String,
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AuditStatistics {
    pub total_entries: usize,
    pub corrupted_lines: usize,
    pub executions: usize,
    pub unsandboxed_executions: usize,
    pub failed_executions: usize,
    pub killed_executions: usize,
    pub timed_out_executions: usize,
    pub file_access_allowed: usize,
    pub file_access_denied: usize,
    pub network_access_allowed: usize,
    pub network_access_denied: usize,
    pub chain_recoveries: usize,
}

/// Where the chain currently ends, as last seen by this process.
#[derive(Debug, Default)]
struct ChainState {
    last_hash: Option<String>,
    known_len: u64,
}

/// Durable audit sink. Share one instance per process behind an `Arc`.
///
/// Appends are serialized by an in-process mutex and an exclusive advisory
/// lock on the file, so several processes may share one log.
#[derive(Debug)]
pub struct AuditLogger {
    path: PathBuf,
    chain: Mutex<ChainState>,
}

impl AuditLogger {
    /// Open (creating parent directories) the log at `path`.
    pub fn open(path: impl Into<PathBuf>) -> AuditResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| AuditError::io(parent, e))?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| AuditError::io(&path, e))?;
        debug!(path = %path.display(), "audit log opened");
        Ok(Self {
            path,
            chain: Mutex::new(ChainState::default()),
        })
    }

    /// Open `<state_dir>/audit.jsonl`.
    pub fn in_state_dir(state_dir: &Path) -> AuditResult<Self> {
        Self::open(audit_file_path(state_dir))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_chain(&self) -> MutexGuard<'_, ChainState> {
        self.chain.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn log_sandbox_execution(&self, record: ExecutionRecord) -> AuditResult<AuditEntry> {
        self.append(AuditRecord::Execution(record))
    }

    pub fn log_file_access(
        &self,
        path: &Path,
        operation: AccessMode,
        allowed: bool,
        reason: Option<&str>,
    ) -> AuditResult<AuditEntry> {
        self.append(AuditRecord::FileAccess(FileAccessRecord {
            path: path.to_path_buf(),
            operation,
            allowed,
            reason: reason.map(str::to_string),
        }))
    }

    pub fn log_network_access(
        &self,
        host: &str,
        port: Option<u16>,
        protocol: &str,
        allowed: bool,
        reason: Option<&str>,
    ) -> AuditResult<AuditEntry> {
        self.append(AuditRecord::NetworkAccess(NetworkAccessRecord {
            host: host.to_string(),
            port,
            protocol: protocol.to_string(),
            allowed,
            reason: reason.map(str::to_string),
        }))
    }

    /// Append one record, linking it to the current end of the chain.
    pub fn append(&self, record: AuditRecord) -> AuditResult<AuditEntry> {
        let mut chain = self.lock_chain();

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| AuditError::io(&self.path, e))?;
        let mut locked = LockedFile::exclusive(file).map_err(|e| AuditError::io(&self.path, e))?;

        self.append_locked(&mut chain, &mut locked.file, record)
    }

    fn append_locked(
        &self,
        chain: &mut ChainState,
        file: &mut File,
        record: AuditRecord,
    ) -> AuditResult<AuditEntry> {
        let len = file
            .metadata()
            .map_err(|e| AuditError::io(&self.path, e))?
            .len();

        // Another process (or a truncation) moved the end of the file.
        let prev_hash = match chain.last_hash.take() {
            Some(hash) if len == chain.known_len => hash,
            _ => self.resync(file)?,
        };

        let entry = AuditEntry {
            ts: Utc::now(),
            prev_entry_sha256: prev_hash,
            record,
        };
        let line = serde_json::to_string(&entry)?;
        write_line(file, &line).map_err(|e| AuditError::io(&self.path, e))?;

        chain.last_hash = Some(sha256_hex(line.as_bytes()));
        chain.known_len = file
            .metadata()
            .map_err(|e| AuditError::io(&self.path, e))?
            .len();
        Ok(entry)
    }

    /// Recompute the chain tip from disk, repairing a corrupt last line.
    fn resync(&self, file: &mut File) -> AuditResult<String> {
        let content = fs::read_to_string(&self.path).map_err(|e| AuditError::io(&self.path, e))?;
        let Some(last_line) = content.lines().rev().find(|l| !l.is_empty()) else {
            return Ok(GENESIS_HASH.to_string());
        };

        if serde_json::from_str::<AuditEntry>(last_line).is_ok() {
            return Ok(sha256_hex(last_line.as_bytes()));
        }

        warn!(
            path = %self.path.display(),
            bytes = last_line.len(),
            "audit log ends in a corrupted entry; starting a new chain segment"
        );
        let recovery = AuditEntry {
            ts: Utc::now(),
            prev_entry_sha256: sha256_hex(last_line.as_bytes()),
            record: AuditRecord::ChainRecovery {
                detail: format!(
                    "previous entry corrupted ({} bytes), new chain segment",
                    last_line.len()
                ),
            },
        };
        let json = serde_json::to_string(&recovery)?;
        // A torn write may have left the file without a trailing newline.
        if !content.ends_with('\n') {
            file.write_all(b"\n").map_err(|e| AuditError::io(&self.path, e))?;
        }
        write_line(file, &json).map_err(|e| AuditError::io(&self.path, e))?;
        Ok(sha256_hex(json.as_bytes()))
    }

    fn snapshot(&self) -> AuditResult<String> {
        // Holding the chain mutex and a shared file lock means no append from
        // any process is half-written while we read.
        let _chain = self.lock_chain();
        let file = File::open(&self.path).map_err(|e| AuditError::io(&self.path, e))?;
        let _locked = LockedFile::shared(file).map_err(|e| AuditError::io(&self.path, e))?;
        fs::read_to_string(&self.path).map_err(|e| AuditError::io(&self.path, e))
    }

    /// All readable entries, oldest first. Corrupted lines are skipped.
    pub fn read_all_entries(&self) -> AuditResult<Vec<AuditEntry>> {
        let content = self.snapshot()?;
        Ok(parse_entries(&content).0)
    }

    /// The `limit` most recent entries, in chronological order (oldest of
    /// the selection first, newest last).
    pub fn read_recent_entries(&self, limit: usize) -> AuditResult<Vec<AuditEntry>> {
        let mut entries = self.read_all_entries()?;
        let skip = entries.len().saturating_sub(limit);
        entries.drain(..skip);
        Ok(entries)
    }

    pub fn get_statistics(&self) -> AuditResult<AuditStatistics> {
        let content = self.snapshot()?;
        let (entries, corrupted_lines) = parse_entries(&content);

        let mut stats = AuditStatistics {
            total_entries: entries.len(),
            corrupted_lines,
            ..AuditStatistics::default()
        };
        for entry in &entries {
            match &entry.record {
                AuditRecord::Execution(exec) => {
                    stats.executions += 1;
                    if !exec.sandboxed {
                        stats.unsandboxed_executions += 1;
                    }
                    if exec.exit_code != 0 {
                        stats.failed_executions += 1;
                    }
                    if exec.killed {
                        stats.killed_executions += 1;
                    }
                    if exec.timed_out {
                        stats.timed_out_executions += 1;
                    }
                }
                AuditRecord::FileAccess(access) if access.allowed => stats.file_access_allowed += 1,
                AuditRecord::FileAccess(_) => stats.file_access_denied += 1,
                AuditRecord::NetworkAccess(access) if access.allowed => {
                    stats.network_access_allowed += 1
                }
                AuditRecord::NetworkAccess(_) => stats.network_access_denied += 1,
                AuditRecord::ChainRecovery { .. } => stats.chain_recoveries += 1,
            }
        }
        Ok(stats)
    }

    /// Indices (0-based, over non-empty lines) where the chain is broken.
    ///
    /// A line is broken if it does not parse or if its `prev_entry_sha256`
    /// is not the hash of the line before it. Empty means intact.
    pub fn verify_chain(&self) -> AuditResult<Vec<usize>> {
        let content = self.snapshot()?;
        Ok(verify_lines(&content))
    }
}

/// Advisory `flock` held for the guard's lifetime.
struct LockedFile {
    file: File,
}

impl LockedFile {
    fn exclusive(file: File) -> io::Result<Self> {
        FileExt::lock_exclusive(&file)?;
        Ok(Self { file })
    }

    fn shared(file: File) -> io::Result<Self> {
        FileExt::lock_shared(&file)?;
        Ok(Self { file })
    }
}

impl Drop for LockedFile {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn write_line(file: &mut File, line: &str) -> io::Result<()> {
    let mut buf = Vec::with_capacity(line.len() + 1);
    buf.extend_from_slice(line.as_bytes());
    buf.push(b'\n');
    file.write_all(&buf)?;
    file.sync_data()
}

fn parse_entries(content: &str) -> (Vec<AuditEntry>, usize) {
    let mut entries = Vec::new();
    let mut corrupted = 0;
    for line in content.lines().filter(|l| !l.is_empty()) {
        match serde_json::from_str::<AuditEntry>(line) {
            Ok(entry) => entries.push(entry),
            Err(_) => corrupted += 1,
        }
    }
    (entries, corrupted)
}

fn verify_lines(content: &str) -> Vec<usize> {
    let lines: Vec<&str> = content.lines().filter(|l| !l.is_empty()).collect();
    let mut broken = Vec::new();

    for (i, line) in lines.iter().enumerate() {
        let Ok(entry) = serde_json::from_str::<AuditEntry>(line) else {
            broken.push(i);
            continue;
        };
        let expected = if i == 0 {
            GENESIS_HASH.to_string()
        } else {
            sha256_hex(lines[i - 1].as_bytes())
        };
        if entry.prev_entry_sha256 != expected {
            broken.push(i);
        }
    }
    broken
}

pub fn audit_file_path(state_dir: &Path) -> PathBuf {
    state_dir.join(AUDIT_FILENAME)
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}
