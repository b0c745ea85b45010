//! Session registry - tracks relay sessions started by `ctrlc-relay launch`

use crate::error::Result;
use crate::process::liveness::is_process_alive;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Terminating,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Running => f.write_str("running"),
            SessionStatus::Terminating => f.write_str("terminating"),
        }
    }
}

/// A relay session: one server process and the target it started
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelaySession {
    pub session_id: Uuid,
    pub port: u16,
    pub server_pid: u32,
    pub target_pid: u32,
    pub command: String,
    pub started_at: DateTime<Utc>,
    pub status: SessionStatus,
}

impl RelaySession {
    /// New running session started now
    pub fn new(port: u16, server_pid: u32, target_pid: u32, command: String) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            port,
            server_pid,
            target_pid,
            command,
            started_at: Utc::now(),
            status: SessionStatus::Running,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryData {
    sessions: Vec<RelaySession>,
}

/// Persistent registry of relay sessions
pub struct SessionRegistry {
    data: RegistryData,
    path: PathBuf,
}

impl SessionRegistry {
    /// Load the registry at `path`, creating its directory if needed
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let data = if path.exists() {
            let content = fs::read_to_string(&path)?;
            match serde_json::from_str(&content) {
                Ok(d) => d,
                Err(e) => {
                    tracing::warn!(path = %path.display(), "corrupted session registry, resetting: {e}");
                    RegistryData::default()
                }
            }
        } else {
            RegistryData::default()
        };

        Ok(Self { data, path })
    }

    /// File backing this registry
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Save registry to disk
    pub fn save(&self) -> Result<()> {
        let content = serde_json::to_string_pretty(&self.data)?;
        fs::write(&self.path, content)?;
        Ok(())
    }

    /// Record a session, replacing any stale entry on the same port
    pub fn register(&mut self, session: RelaySession) -> Result<()> {
        self.data.sessions.retain(|s| s.port != session.port);
        self.data.sessions.push(session);
        self.save()
    }

    /// Remove a session by id
    pub fn unregister(&mut self, session_id: Uuid) -> Result<()> {
        self.data.sessions.retain(|s| s.session_id != session_id);
        self.save()
    }

    /// Get all recorded sessions
    pub fn sessions(&self) -> &[RelaySession] {
        &self.data.sessions
    }

    /// Find session by id
    pub fn find_by_session(&self, session_id: Uuid) -> Option<&RelaySession> {
        self.data
            .sessions
            .iter()
            .find(|s| s.session_id == session_id)
    }

    /// Find session by control port
    pub fn find_by_port(&self, port: u16) -> Option<&RelaySession> {
        self.data.sessions.iter().find(|s| s.port == port)
    }

    /// Update status of a session
    pub fn update_status(&mut self, session_id: Uuid, status: SessionStatus) -> Result<()> {
        if let Some(session) = self
            .data
            .sessions
            .iter_mut()
            .find(|s| s.session_id == session_id)
        {
            session.status = status;
            self.save()?;
        }
        Ok(())
    }

    /// Remove sessions whose relay server is gone
    pub fn cleanup_dead(&mut self) -> Result<Vec<RelaySession>> {
        self.retain_alive(is_process_alive)
    }

    fn retain_alive(&mut self, alive: impl Fn(u32) -> bool) -> Result<Vec<RelaySession>> {
        let mut dead = Vec::new();

        self.data.sessions.retain(|s| {
            if alive(s.server_pid) {
                true
            } else {
                dead.push(s.clone());
                false
            }
        });

        if !dead.is_empty() {
            self.save()?;
        }

        Ok(dead)
    }
}
