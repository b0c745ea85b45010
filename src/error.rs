//! Error types for the relay client, server and registry

use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RelayError>;

#[derive(Debug, Error)]
pub enum RelayError {
    /// The server could not listen on its control port
    #[error("failed to bind control port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },

    /// The control connection could not be opened or is no longer open
    #[error("control connection: {0}")]
    Connection(String),

    /// Creating the relay server or the target process failed
    #[error("failed to spawn {what}: {source}")]
    Spawn {
        what: String,
        #[source]
        source: io::Error,
    },

    /// The console interrupt could not be raised
    #[error("failed to deliver console interrupt: {0}")]
    Signal(String),

    #[error("invalid command specification: {0}")]
    Command(String),

    #[error("config: {0}")]
    Config(String),

    #[error("session registry: {0}")]
    Registry(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl RelayError {
    /// Process exit code used by `ctrlc-relay serve` when it fails
    pub fn exit_code(&self) -> i32 {
        match self {
            RelayError::Bind { .. } => 2,
            RelayError::Spawn { .. } | RelayError::Command(_) => 3,
            RelayError::Signal(_) => 4,
            _ => 1,
        }
    }
}

impl From<toml::de::Error> for RelayError {
    fn from(err: toml::de::Error) -> Self {
        RelayError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::Registry(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_distinguish_failure_kinds() {
        let bind = RelayError::Bind {
            port: 9001,
            source: io::Error::from(io::ErrorKind::AddrInUse),
        };
        assert_eq!(bind.exit_code(), 2);
        assert_eq!(RelayError::Command("empty".into()).exit_code(), 3);
        assert_eq!(RelayError::Signal("denied".into()).exit_code(), 4);
        assert_eq!(RelayError::Connection("closed".into()).exit_code(), 1);
    }

    #[test]
    fn bind_error_names_the_port() {
        let err = RelayError::Bind {
            port: 8080,
            source: io::Error::from(io::ErrorKind::AddrInUse),
        };
        assert!(err.to_string().contains("8080"));
    }
}
