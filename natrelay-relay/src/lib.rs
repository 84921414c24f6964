//! natrelay relay library
//!
//! Multiplexes peers arriving over a key-addressed transport onto a single
//! backend process that speaks newline-delimited JSON-RPC on stdio. The
//! binary and the integration tests both build on [`Relay`].

use std::fmt;

pub mod backend;
pub mod config;
mod error;
pub mod fake;
mod health;
pub mod queue;
mod relay;
pub mod registry;
pub mod router;
pub mod sessions;
pub mod state;
pub mod status;
pub mod supervisor;

pub use backend::{Backend, BackendError, ProcessBackend};
pub use config::{BackendConfig, RelayConfig};
pub use error::RelayError;
pub use fake::FakeBackend;
pub use relay::{Relay, StartInfo};
pub use state::RelayState;
pub use status::{ClientStatus, RelayStatus};

/// Per-client outbound buffer. A client that lets it fill up is dropped.
pub const CHANNEL_BUFFER_SIZE: usize = 1024;

/// Why the backend is being restarted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryReason {
    BackendExited,
    WriteFailed,
    HealthCheckFailed,
}

impl fmt::Display for RecoveryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RecoveryReason::BackendExited => "backend exited",
            RecoveryReason::WriteFailed => "write to backend failed",
            RecoveryReason::HealthCheckFailed => "health check failed",
        };
        f.write_str(s)
    }
}
