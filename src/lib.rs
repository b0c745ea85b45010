//! ctrlc-relay library - deliver a console interrupt to a process that the
//! caller cannot signal from its own process group

pub mod command;
pub mod config;
pub mod error;
pub mod process;
pub mod protocol;

// Re-export commonly used types
pub use command::CommandSpec;
pub use config::RelayConfig;
pub use error::{RelayError, Result};
pub use process::{Outcome, RelayClient, RelayServer, RelaySession, SessionRegistry};
