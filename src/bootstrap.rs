use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};

use crate::types::RunnerConfig;

const TOKEN_FILE_NAME: &str = "token";

/// Minimal process-level configuration needed to dial the Control Plane,
/// distinct from the CP-pushed provider configuration handled by config
/// intake. Resolved from environment variables, optionally layered on top
/// of a persisted token file.
pub struct BootstrapConfig {
    pub runner_config: RunnerConfig,
    pub config_dir: PathBuf,
}

impl BootstrapConfig {
    /// Reads `EDGE_RUNNER_CP_URL`, `EDGE_RUNNER_TOKEN` (falling back to the
    /// persisted token file), and `EDGE_RUNNER_NAME` (falling back to the
    /// local hostname). No CLI argument parsing is introduced here — that
    /// front end is out of scope.
    pub fn from_env() -> Result<Self> {
        let config_dir = default_config_dir();

        let cp_url = std::env::var("EDGE_RUNNER_CP_URL")
            .context("EDGE_RUNNER_CP_URL must be set")?;

        let auth_token = match std::env::var("EDGE_RUNNER_TOKEN") {
            Ok(token) => token,
            Err(_) => TokenStorage::new(config_dir.clone())
                .load()?
                .context("no EDGE_RUNNER_TOKEN set and no persisted token file found")?,
        };

        let runner_name = std::env::var("EDGE_RUNNER_NAME").unwrap_or_else(|_| {
            hostname().unwrap_or_else(|| "edge-runner".to_string())
        });

        let runner_config = RunnerConfig {
            cp_url,
            auth_token,
            runner_name,
            reconnect_delay_initial: env_duration_secs("EDGE_RUNNER_RECONNECT_DELAY_INITIAL", 1),
            reconnect_delay_max: env_duration_secs("EDGE_RUNNER_RECONNECT_DELAY_MAX", 30),
            heartbeat_interval: env_duration_secs("EDGE_RUNNER_HEARTBEAT_INTERVAL", 15),
            health_check_interval: env_duration_secs("EDGE_RUNNER_HEALTH_CHECK_INTERVAL", 30),
        };

        Ok(Self {
            runner_config,
            config_dir,
        })
    }

    pub fn proxy_timeout(&self) -> Duration {
        env_duration_secs("EDGE_RUNNER_PROXY_TIMEOUT", 60)
    }
}

fn env_duration_secs(var: &str, default_secs: u64) -> Duration {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or_else(|| Duration::from_secs(default_secs))
}

fn default_config_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(".edge-runner")
}

fn hostname() -> Option<String> {
    std::env::var("HOSTNAME").ok().or_else(|| {
        std::process::Command::new("hostname")
            .output()
            .ok()
            .and_then(|out| String::from_utf8(out.stdout).ok())
            .map(|s| s.trim().to_string())
    })
}

/// Persists the auth token at `<config_dir>/token` with owner-only read and
/// write permissions. No other state is persisted by the core.
pub struct TokenStorage {
    path: PathBuf,
}

impl TokenStorage {
    pub fn new(config_dir: PathBuf) -> Self {
        Self {
            path: config_dir.join(TOKEN_FILE_NAME),
        }
    }

    pub fn store(&self, token: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).context("failed to create config directory")?;
        }
        std::fs::write(&self.path, token).context("failed to write token file")?;
        set_owner_only_permissions(&self.path)?;
        Ok(())
    }

    pub fn load(&self) -> Result<Option<String>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let token = std::fs::read_to_string(&self.path).context("failed to read token file")?;
        Ok(Some(token.trim().to_string()))
    }
}

#[cfg(unix)]
fn set_owner_only_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let permissions = std::fs::Permissions::from_mode(0o600);
    std::fs::set_permissions(path, permissions).context("failed to set token file permissions")
}

#[cfg(not(unix))]
fn set_owner_only_permissions(_path: &Path) -> Result<()> {
    Ok(())
}
