use std::io;
use thiserror::Error;

/// Errors on the send / receive path.
///
/// `WouldBlock` and `Interrupted` are transient: `Interrupted` is absorbed by the retry logic
///  and never reaches callers, `WouldBlock` is resolved into a readiness wait (or a 'not done'
///  signal to the reactor) and reaches the application only for sockets in non-blocking mode.
#[derive(Debug, Error)]
pub enum HomaError {
    /// Registering the receive buffer region failed
    #[error("buffer configuration: {0}")]
    Configuration(String),
    #[error("operation would block")]
    WouldBlock,
    #[error("interrupted system call")]
    Interrupted,
    /// The buffer pool has no free pages - received pages were not recycled in time
    #[error("buffer pool exhausted")]
    ResourceExhausted,
    #[error("message of {0} bytes exceeds the maximum message length")]
    MessageTooLong(usize),
    #[error("transport error: {0}")]
    Transport(#[source] io::Error),
    #[error("operation cancelled")]
    Cancelled,
}

impl HomaError {
    /// Classify an OS-level error reported by the kernel transport
    pub fn from_os(e: io::Error) -> HomaError {
        match e.raw_os_error() {
            Some(libc::EINTR) => HomaError::Interrupted,
            Some(code) if code == libc::EAGAIN || code == libc::EWOULDBLOCK => HomaError::WouldBlock,
            Some(libc::ENOMEM) | Some(libc::ENOBUFS) => HomaError::ResourceExhausted,
            _ => match e.kind() {
                io::ErrorKind::Interrupted => HomaError::Interrupted,
                io::ErrorKind::WouldBlock => HomaError::WouldBlock,
                _ => HomaError::Transport(e),
            }
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, HomaError::WouldBlock | HomaError::Interrupted)
    }
}

impl From<io::Error> for HomaError {
    fn from(e: io::Error) -> Self {
        HomaError::from_os(e)
    }
}
