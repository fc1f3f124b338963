//! Path admission for host-mediated file I/O.
//!
//! Every query is resolved to its real absolute form before any
//! comparison, so `..` segments and symlinks cannot smuggle a path out of
//! the workspace.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::error::{ConfigError, ConfigResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    Read,
    Write,
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessMode::Read => f.write_str("read"),
            AccessMode::Write => f.write_str("write"),
        }
    }
}

/// System credential stores that are never readable or writable.
const SENSITIVE_SYSTEM_PATHS: &[&str] = &[
    "/etc/passwd",
    "/etc/shadow",
    "/etc/gshadow",
    "/etc/sudoers",
    "/etc/sudoers.d",
    "/etc/master.passwd",
    "/etc/security/opasswd",
];

/// Credential files and directories under the user's home.
const SENSITIVE_HOME_ENTRIES: &[&str] = &[
    ".ssh", ".aws", ".gnupg", ".docker", ".kube", ".npmrc", ".pypirc", ".netrc",
];

/// Declarative filesystem policy. Paths are stored resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileSystemPolicy {
    workspace_root: PathBuf,
    read_only: bool,
    allowed_paths: BTreeSet<PathBuf>,
    denied_paths: BTreeSet<PathBuf>,
}

impl FileSystemPolicy {
    /// The workspace root must be an existing directory.
    pub fn new(workspace_root: impl AsRef<Path>) -> ConfigResult<Self> {
        let root = workspace_root.as_ref();
        let canonical = fs::canonicalize(root).map_err(|e| {
            ConfigError::InvalidFilesystemPolicy(format!(
                "workspace root {} is not accessible: {}",
                root.display(),
                e
            ))
        })?;
        if !canonical.is_dir() {
            return Err(ConfigError::InvalidFilesystemPolicy(format!(
                "workspace root {} is not a directory",
                canonical.display()
            )));
        }
        Ok(Self {
            workspace_root: canonical,
            read_only: false,
            allowed_paths: BTreeSet::new(),
            denied_paths: BTreeSet::new(),
        })
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Admit `path` (and everything beneath it) even though it lies outside
    /// the workspace. Relative paths are taken from the workspace root.
    pub fn allow_path(mut self, path: impl AsRef<Path>) -> Self {
        let resolved = self.resolve_or_lexical(path.as_ref());
        self.allowed_paths.insert(resolved);
        self
    }

    /// Refuse `path` and everything beneath it. Overrides any allow.
    pub fn deny_path(mut self, path: impl AsRef<Path>) -> Self {
        let resolved = self.resolve_or_lexical(path.as_ref());
        self.denied_paths.insert(resolved);
        self
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn allowed_paths(&self) -> &BTreeSet<PathBuf> {
        &self.allowed_paths
    }

    pub fn denied_paths(&self) -> &BTreeSet<PathBuf> {
        &self.denied_paths
    }

    fn resolve_or_lexical(&self, path: &Path) -> PathBuf {
        resolve_path(&self.workspace_root, path)
            .unwrap_or_else(|| lexical_absolute(&self.workspace_root, path))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FsDenyReason {
    /// The path (e.g. a dangling symlink) has no determinable real location.
    Unresolvable,
    OutsideWorkspace,
    DeniedPath,
    SensitivePath,
    ReadOnly,
}

impl FsDenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FsDenyReason::Unresolvable => "unresolvable",
            FsDenyReason::OutsideWorkspace => "outside_workspace",
            FsDenyReason::DeniedPath => "denied_path",
            FsDenyReason::SensitivePath => "sensitive_path",
            FsDenyReason::ReadOnly => "read_only",
        }
    }
}

impl fmt::Display for FsDenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FsAccessDecision {
    pub allowed: bool,
    /// The real path the decision was made on.
    pub resolved: Option<PathBuf>,
    pub reason: Option<FsDenyReason>,
}

impl FsAccessDecision {
    fn allow(resolved: PathBuf) -> Self {
        Self {
            allowed: true,
            resolved: Some(resolved),
            reason: None,
        }
    }

    fn deny(resolved: Option<PathBuf>, reason: FsDenyReason) -> Self {
        Self {
            allowed: false,
            resolved,
            reason: Some(reason),
        }
    }
}

/// Evaluates path requests against a [`FileSystemPolicy`].
///
/// Checks are pure over the immutable policy, so one instance can be
/// shared across threads without locking.
#[derive(Debug, Clone)]
pub struct FileSystemAccessControl {
    policy: FileSystemPolicy,
    sensitive_paths: Vec<PathBuf>,
}

impl FileSystemAccessControl {
    pub fn new(policy: FileSystemPolicy) -> Self {
        Self {
            policy,
            sensitive_paths: sensitive_paths(),
        }
    }

    pub fn policy(&self) -> &FileSystemPolicy {
        &self.policy
    }

    pub fn check_access(&self, path: impl AsRef<Path>, mode: AccessMode) -> bool {
        self.evaluate(path, mode).allowed
    }

    pub fn evaluate(&self, path: impl AsRef<Path>, mode: AccessMode) -> FsAccessDecision {
        let policy = &self.policy;
        let Some(resolved) = resolve_path(&policy.workspace_root, path.as_ref()) else {
            return FsAccessDecision::deny(None, FsDenyReason::Unresolvable);
        };

        let in_workspace = resolved.starts_with(&policy.workspace_root);
        if !in_workspace && !policy.allowed_paths.iter().any(|p| resolved.starts_with(p)) {
            return FsAccessDecision::deny(Some(resolved), FsDenyReason::OutsideWorkspace);
        }

        if policy.denied_paths.iter().any(|p| resolved.starts_with(p)) {
            return FsAccessDecision::deny(Some(resolved), FsDenyReason::DeniedPath);
        }
        if self.sensitive_paths.iter().any(|p| resolved.starts_with(p)) {
            return FsAccessDecision::deny(Some(resolved), FsDenyReason::SensitivePath);
        }

        if policy.read_only && mode == AccessMode::Write {
            return FsAccessDecision::deny(Some(resolved), FsDenyReason::ReadOnly);
        }

        FsAccessDecision::allow(resolved)
    }
}

fn sensitive_paths() -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = SENSITIVE_SYSTEM_PATHS.iter().map(PathBuf::from).collect();
    if let Some(base) = directories::BaseDirs::new() {
        let home = base.home_dir();
        paths.extend(SENSITIVE_HOME_ENTRIES.iter().map(|e| home.join(e)));
    }
    // macOS keeps /etc under /private; compare against both spellings.
    let canonical: Vec<PathBuf> = paths
        .iter()
        .filter_map(|p| fs::canonicalize(p).ok())
        .filter(|c| !paths.contains(c))
        .collect();
    paths.extend(canonical);
    paths
}

/// Resolve `path` (relative to `base`) to a real absolute path.
///
/// Existing prefixes are canonicalized one component at a time, so a
/// symlink anywhere along the way is followed before `..` is applied.
/// Components that do not exist yet are appended lexically. A dangling
/// symlink yields `None`: its eventual target is unknown.
pub fn resolve_path(base: &Path, path: &Path) -> Option<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    };

    let mut resolved = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => resolved.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                resolved.pop();
            }
            Component::Normal(part) => {
                resolved.push(part);
                if fs::symlink_metadata(&resolved).is_ok() {
                    resolved = fs::canonicalize(&resolved).ok()?;
                }
            }
        }
    }
    Some(resolved)
}

fn lexical_absolute(base: &Path, path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    };
    let mut out = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}
