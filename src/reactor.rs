use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::io::unix::AsyncFd;
use tokio::select;
use tokio::sync::Notify;
use tracing::{debug, span, trace, Instrument, Level};
use crate::buffer_pages::BufferPageSet;
use crate::error::HomaError;
use crate::homa_sys::Interest;
use crate::operation::{PendingOperation, Status};
use crate::transport::HomaTransport;

/// Asynchronous readiness notification for a socket.
///
/// Implementations may report readiness spuriously; callers always re-attempt and wait again
///  if the socket turns out not to be ready after all.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Readiness: Send + Sync {
    async fn ready(&self, interest: Interest) -> Result<(), HomaError>;
}

/// Readiness of an OS socket, based on tokio's reactor
pub struct FdReadiness {
    fd: AsyncFd<RawFd>,
}

impl FdReadiness {
    /// Must be called inside a tokio runtime with I/O enabled. The file descriptor must stay
    ///  open until this is dropped.
    pub fn new(fd: RawFd) -> anyhow::Result<FdReadiness> {
        Ok(FdReadiness {
            fd: AsyncFd::new(fd)?,
        })
    }
}

#[async_trait]
impl Readiness for FdReadiness {
    async fn ready(&self, interest: Interest) -> Result<(), HomaError> {
        // the next attempt decides whether the socket is actually ready, so readiness is
        //  cleared right away
        match interest {
            Interest::Readable => {
                let mut guard = self.fd.readable().await
                    .map_err(HomaError::Transport)?;
                guard.clear_ready();
            }
            Interest::Writable => {
                let mut guard = self.fd.writable().await
                    .map_err(HomaError::Transport)?;
                guard.clear_ready();
            }
        }
        Ok(())
    }
}

#[derive(Default)]
struct CancelState {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Handle for cancelling an operation that is being driven asynchronously
#[derive(Clone, Default)]
pub struct CancelToken {
    state: Arc<CancelState>,
}

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        if !self.state.cancelled.swap(true, Ordering::AcqRel) {
            self.state.notify.notify_waiters();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Acquire)
    }

    pub async fn cancelled(&self) {
        loop {
            let notified = self.state.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Drive an operation to completion: attempt, wait for readiness, attempt again and so on,
///  until it is done or cancelled. The operation's completion handler is invoked exactly once
///  before this returns.
///
/// Returns the pages of a receive operation that were never handed to the kernel, because the
///  operation was cancelled or failed before its first attempt. The caller owns them and must
///  recycle them later.
pub async fn drive(mut op: PendingOperation, transport: &HomaTransport, readiness: &dyn Readiness, cancel: &CancelToken) -> BufferPageSet {
    let correlation_id = op.correlation_id();
    let span = span!(Level::TRACE, "drive", ?correlation_id);

    async move {
        loop {
            if cancel.is_cancelled() {
                let unsubmitted = op.take_unsubmitted_pages();
                op.cancel();
                return unsubmitted;
            }

            if op.step(transport) == Status::Done {
                op.complete();
                return BufferPageSet::new();
            }

            trace!("waiting for {:?}", op.interest());
            select! {
                _ = cancel.cancelled() => {
                    debug!("cancelled while waiting for readiness");
                }
                ready = readiness.ready(op.interest()) => {
                    if let Err(e) = ready {
                        debug!("error waiting for readiness: {}", e);
                        let unsubmitted = op.take_unsubmitted_pages();
                        op.fail(e);
                        return unsubmitted;
                    }
                }
            }
        }
    }
        .instrument(span)
        .await
}
