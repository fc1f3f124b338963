//! XDG Base Directory compliant path resolution.
//!
//! Every directory is resolved through a three-level fallback:
//! 1. warden-specific env var (WARDEN_CONFIG_DIR, etc.)
//! 2. XDG env var (XDG_CONFIG_HOME, etc.) via `etcetera`
//! 3. Platform default (~/.config, etc.)
//!
//! All paths are absolute. Relative paths from env vars are ignored.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

const APP_DIR: &str = "warden";

/// Resolved directory paths, created once at startup.
#[derive(Debug, Clone)]
pub struct Paths {
    /// config.toml lives here
    pub config_dir: PathBuf,

    /// Default parent of the workspace
    pub data_dir: PathBuf,

    /// Directory sandboxed commands run in, unless the config names one.
    /// May be overridden independently via WARDEN_WORKSPACE.
    pub workspace: PathBuf,

    /// Audit log and other persistent state
    pub state_dir: PathBuf,
}

impl Paths {
    /// Resolve all paths using real environment variables.
    pub fn resolve() -> Result<Self> {
        Self::resolve_with_env(|key| std::env::var(key))
    }

    /// Resolve paths with a custom env var lookup (for testing).
    pub fn resolve_with_env<F>(env_fn: F) -> Result<Self>
    where
        F: Fn(&str) -> std::result::Result<String, std::env::VarError>,
    {
        use etcetera::BaseStrategy;

        let strategy = etcetera::choose_base_strategy()
            .map_err(|e| anyhow::anyhow!("Failed to determine base directories: {}", e))?;

        let config_dir = env_or(&env_fn, "WARDEN_CONFIG_DIR", || {
            strategy.config_dir().join(APP_DIR)
        });

        let data_dir = env_or(&env_fn, "WARDEN_DATA_DIR", || {
            strategy.data_dir().join(APP_DIR)
        });

        let state_dir = env_or(&env_fn, "WARDEN_STATE_DIR", || {
            // state_dir() is None on platforms without XDG_STATE_HOME.
            let base_state = strategy.state_dir().unwrap_or_else(|| strategy.data_dir());
            base_state.join(APP_DIR)
        });

        let workspace = resolve_workspace(&env_fn, &data_dir);

        Ok(Self {
            config_dir,
            data_dir,
            workspace,
            state_dir,
        })
    }

    /// config_dir/config.toml
    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }

    /// state_dir/audit.jsonl
    pub fn audit_log(&self) -> PathBuf {
        crate::security::audit_file_path(&self.state_dir)
    }

    /// Create the config and state directories with mode 0700.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.config_dir, &self.state_dir] {
            create_dir_with_mode(dir)?;
        }
        Ok(())
    }
}

/// Resolve an env var with fallback. Ignores empty and relative paths.
fn env_or<F>(env_fn: &F, var: &str, default: impl FnOnce() -> PathBuf) -> PathBuf
where
    F: Fn(&str) -> std::result::Result<String, std::env::VarError>,
{
    env_fn(var)
        .ok()
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .filter(|p| p.is_absolute())
        .unwrap_or_else(default)
}

/// WARDEN_WORKSPACE (with `~` expanded), else data_dir/workspace.
fn resolve_workspace<F>(env_fn: &F, data_dir: &Path) -> PathBuf
where
    F: Fn(&str) -> std::result::Result<String, std::env::VarError>,
{
    if let Ok(ws) = env_fn("WARDEN_WORKSPACE") {
        let trimmed = ws.trim();
        if !trimmed.is_empty() {
            let expanded = shellexpand::tilde(trimmed);
            let path = PathBuf::from(expanded.into_owned());
            if path.is_absolute() {
                return path;
            }
        }
    }

    data_dir.join("workspace")
}

fn create_dir_with_mode(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)
        .with_context(|| format!("Failed to create directory: {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
            .with_context(|| format!("Failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn make_env(
        map: HashMap<&str, &str>,
    ) -> impl Fn(&str) -> std::result::Result<String, std::env::VarError> {
        move |key: &str| {
            map.get(key)
                .map(|v| v.to_string())
                .ok_or(std::env::VarError::NotPresent)
        }
    }

    #[test]
    fn default_paths_are_xdg_compliant() {
        let paths = Paths::resolve_with_env(make_env(HashMap::new())).unwrap();

        assert!(paths.config_dir.ends_with("warden"), "config_dir: {:?}", paths.config_dir);
        assert!(paths.data_dir.ends_with("warden"), "data_dir: {:?}", paths.data_dir);
        assert!(paths.state_dir.ends_with("warden"), "state_dir: {:?}", paths.state_dir);
        assert!(paths.workspace.ends_with("workspace"));
        assert!(paths.config_dir.is_absolute());
    }

    #[test]
    fn warden_env_vars_override_xdg() {
        let mut env: HashMap<&str, &str> = HashMap::new();
        env.insert("WARDEN_CONFIG_DIR", "/custom/config");
        env.insert("WARDEN_DATA_DIR", "/custom/data");
        env.insert("WARDEN_STATE_DIR", "/custom/state");

        let paths = Paths::resolve_with_env(make_env(env)).unwrap();
        assert_eq!(paths.config_dir, PathBuf::from("/custom/config"));
        assert_eq!(paths.data_dir, PathBuf::from("/custom/data"));
        assert_eq!(paths.state_dir, PathBuf::from("/custom/state"));
        assert_eq!(paths.workspace, PathBuf::from("/custom/data/workspace"));
    }

    #[test]
    fn relative_and_empty_values_are_ignored() {
        let mut env: HashMap<&str, &str> = HashMap::new();
        env.insert("WARDEN_CONFIG_DIR", "relative/path");
        env.insert("WARDEN_STATE_DIR", "");
        env.insert("WARDEN_WORKSPACE", "not/absolute");

        let paths = Paths::resolve_with_env(make_env(env)).unwrap();
        assert!(paths.config_dir.is_absolute());
        assert!(paths.state_dir.is_absolute());
        assert!(paths.workspace.is_absolute());
    }

    #[test]
    fn workspace_override_independent_of_data_dir() {
        let mut env: HashMap<&str, &str> = HashMap::new();
        env.insert("WARDEN_WORKSPACE", "/projects/build-box");

        let paths = Paths::resolve_with_env(make_env(env)).unwrap();
        assert_eq!(paths.workspace, PathBuf::from("/projects/build-box"));
        assert!(paths.data_dir.ends_with("warden"));
    }

    #[test]
    fn convenience_accessors() {
        let paths = Paths::resolve_with_env(make_env(HashMap::new())).unwrap();
        assert!(paths.config_file().ends_with("config.toml"));
        assert!(paths.audit_log().ends_with("audit.jsonl"));
        assert!(paths.audit_log().starts_with(&paths.state_dir));
    }

    #[test]
    fn ensure_dirs_creates_config_and_state() {
        let tmp = tempfile::tempdir().unwrap();
        let mut env: HashMap<&str, &str> = HashMap::new();
        let config = tmp.path().join("cfg");
        let state = tmp.path().join("state");
        let config_s = config.to_string_lossy().to_string();
        let state_s = state.to_string_lossy().to_string();
        env.insert("WARDEN_CONFIG_DIR", &config_s);
        env.insert("WARDEN_STATE_DIR", &state_s);

        let paths = Paths::resolve_with_env(make_env(env)).unwrap();
        paths.ensure_dirs().unwrap();
        assert!(config.is_dir());
        assert!(state.is_dir());
    }
}
