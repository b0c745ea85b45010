use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the relay executable, used to locate the server program
pub const SERVER_PROGRAM: &str = "ctrlc-relay";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Loopback control port; 0 allocates a free port per session
    pub port: u16,

    // Connection retry budget
    pub connect_timeout_ms: u64,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,

    // Acknowledgement of a termination request
    pub await_ack: bool,
    pub ack_timeout_ms: u64,

    /// Delay before the server exits after it was interrupted itself
    pub grace_period_ms: u64,

    /// Relay executable to spawn as the server
    pub server_program: Option<PathBuf>,
    /// File receiving the detached server's log output
    pub server_log: Option<PathBuf>,
    /// Session registry used by `ctrlc-relay launch` and `list`
    pub registry_path: Option<PathBuf>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: 0,
            connect_timeout_ms: 5000,
            initial_backoff_ms: 20,
            max_backoff_ms: 500,
            await_ack: true,
            ack_timeout_ms: 2000,
            grace_period_ms: 1000,
            server_program: None,
            server_log: None,
            registry_path: None,
        }
    }
}

impl RelayConfig {
    /// Load the first readable config file, falling back to defaults
    pub fn load() -> Self {
        let paths = [
            dirs::config_dir().map(|p| p.join("ctrlc-relay/config.toml")),
            dirs::home_dir().map(|p| p.join(".ctrlc-relay.toml")),
            Some(PathBuf::from("ctrlc-relay.toml")),
        ];

        for path in paths.into_iter().flatten() {
            if path.exists() {
                match Self::load_from(&path) {
                    Ok(config) => return config,
                    Err(e) => {
                        tracing::warn!(path = %path.display(), "ignoring config file: {e}");
                    }
                }
            }
        }

        RelayConfig::default()
    }

    /// Load a specific config file, reporting read and parse errors
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms.max(1))
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms.max(self.initial_backoff_ms).max(1))
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    /// Server program to spawn: the configured path, the relay binary next
    /// to the current executable, or `ctrlc-relay` from `PATH`
    pub fn server_program(&self) -> PathBuf {
        if let Some(program) = &self.server_program {
            return program.clone();
        }

        let sibling = std::env::current_exe().ok().and_then(|exe| {
            let dir = exe.parent()?;
            let candidate = dir.join(format!("{SERVER_PROGRAM}{}", std::env::consts::EXE_SUFFIX));
            candidate.exists().then_some(candidate)
        });

        sibling.unwrap_or_else(|| PathBuf::from(SERVER_PROGRAM))
    }

    pub fn registry_path(&self) -> PathBuf {
        self.registry_path.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("ctrlc-relay")
                .join("sessions.json")
        })
    }
}
