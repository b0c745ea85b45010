//! Process management: the relay client and server and their bookkeeping

pub mod client;
pub mod liveness;
pub mod registry;
pub mod server;
pub mod signal;

pub use client::RelayClient;
pub use liveness::{is_process_alive, wait_for_exit};
pub use registry::{RelaySession, SessionRegistry, SessionStatus};
pub use server::{Outcome, RelayServer, RelayState, Request};
