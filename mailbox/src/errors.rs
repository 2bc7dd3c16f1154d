use std::io;
use std::path::PathBuf;

use thiserror::Error;

use super::handshake::SemaphoreId;
use super::supervisor::TerminationReason;

#[derive(Debug, Error)]
pub enum MailboxError {
    #[error("Shared memory {op} failed: {source}")]
    SharedMemory {
        op: &'static str,
        #[source]
        source: shared_memory::ShmemError,
    },

    #[error("Shared memory link {0} already exists, remove it if no session is running")]
    LinkExists(PathBuf),

    #[error("Semaphore {op} on {id} failed: {source}")]
    Semaphore {
        op: &'static str,
        id: SemaphoreId,
        #[source]
        source: io::Error,
    },

    #[error("Semaphore destroy on {id} failed: {source}")]
    Teardown {
        id: SemaphoreId,
        #[source]
        source: io::Error,
    },

    #[error("Interrupted while waiting on {0}")]
    Interrupted(SemaphoreId),

    #[error("Signal registration failed: {0}")]
    Signal(#[source] io::Error),

    #[error("fork failed: {0}")]
    Fork(#[source] io::Error),

    #[error("waitpid on {pid} failed: {source}")]
    Wait {
        pid: i32,
        #[source]
        source: io::Error,
    },

    #[error("Client {pid} {reason}")]
    ClientFailed { pid: i32, reason: TerminationReason },

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Could not read document {path}: {source}")]
    LineSource {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Document {0} has no lines")]
    EmptyDocument(PathBuf),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, MailboxError>;

impl MailboxError {
    pub(crate) fn semaphore(op: &'static str, id: SemaphoreId) -> MailboxError {
        MailboxError::Semaphore {
            op,
            id,
            source: io::Error::last_os_error(),
        }
    }

    pub(crate) fn line_source(path: impl Into<PathBuf>, source: io::Error) -> MailboxError {
        MailboxError::LineSource {
            path: path.into(),
            source,
        }
    }
}
