//! Single-slot shared memory mailbox served by one process and shared by
//! many forked clients, coordinated by three process-shared semaphores.

pub mod core;
pub mod client;
mod errors;
pub mod handshake;
pub mod line_source;
pub mod server;
pub mod supervisor;


pub use crate::core::{ClientStats, MailboxConfig, LINE_SIZE};
pub use errors::{MailboxError, Result};
pub use handshake::Response;
pub use line_source::{LineSource, LineSourceKind};
pub use supervisor::{ClientReport, SessionConfig, SessionReport, Supervisor, TerminationReason};
