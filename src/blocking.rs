//! Synchronous send / receive: attempt, and if the socket is not ready, block the calling
//!  thread until it is and attempt again.
//!
//! This is the only place in the crate that blocks.

use std::thread;
use std::time::Duration;
use tracing::{debug, trace};
use crate::config::HomaConfig;
use crate::error::HomaError;
use crate::homa_sys::Interest;
use crate::retry::{non_blocking_recv, non_blocking_send, Attempt, RecvRequest, SendRequest};
use crate::transport::{HomaTransport, ReceivedMessage, SendCompletion};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockingMode {
    /// Return [HomaError::WouldBlock] instead of waiting
    pub non_blocking: bool,
    pub poll_timeout: Option<Duration>,
}

impl BlockingMode {
    pub fn blocking() -> BlockingMode {
        BlockingMode {
            non_blocking: false,
            poll_timeout: None,
        }
    }

    pub fn non_blocking() -> BlockingMode {
        BlockingMode {
            non_blocking: true,
            poll_timeout: None,
        }
    }

    pub fn from_config(config: &HomaConfig) -> BlockingMode {
        BlockingMode {
            non_blocking: config.non_blocking,
            poll_timeout: config.poll_timeout,
        }
    }
}

pub fn send(transport: &HomaTransport, request: &SendRequest, mode: BlockingMode) -> Result<SendCompletion, HomaError> {
    run(transport, Interest::Writable, mode, || non_blocking_send(transport, request))
}

pub fn receive(transport: &HomaTransport, request: &mut RecvRequest, mode: BlockingMode) -> Result<ReceivedMessage, HomaError> {
    run(transport, Interest::Readable, mode, || non_blocking_recv(transport, request))
}

const MIN_BACKOFF: Duration = Duration::from_micros(50);
const MAX_BACKOFF: Duration = Duration::from_millis(5);

/// Pause before waiting again when the socket reported readiness but the attempt found nothing
///  to do. This happens for a filtered receive while only non-matching messages are queued:
///  the socket stays readable, and waiting for readiness returns right away.
#[derive(Debug)]
struct Backoff {
    next: Duration,
}

impl Backoff {
    fn new() -> Backoff {
        Backoff {
            next: MIN_BACKOFF,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(MAX_BACKOFF);
        delay
    }
}

fn run<T>(transport: &HomaTransport, interest: Interest, mode: BlockingMode, mut attempt: impl FnMut() -> Attempt<T>) -> Result<T, HomaError> {
    let mut backoff = Backoff::new();
    let mut reported_ready = false;
    loop {
        match attempt() {
            Attempt::Completed(result) => return Ok(result),
            Attempt::Failed(e) => return Err(e),
            Attempt::WouldBlock => {
                if mode.non_blocking {
                    trace!("socket not ready and in non-blocking mode");
                    return Err(HomaError::WouldBlock);
                }
                if reported_ready {
                    let delay = backoff.next_delay();
                    trace!("socket was reported ready, but the attempt would block - backing off for {:?}", delay);
                    thread::sleep(delay);
                }
                debug!("socket not ready - waiting for {:?}", interest);
                reported_ready = wait_for_readiness(transport, interest, mode.poll_timeout)?;
            }
        }
    }
}

/// Returns `false` if the wait timed out
fn wait_for_readiness(transport: &HomaTransport, interest: Interest, timeout: Option<Duration>) -> Result<bool, HomaError> {
    loop {
        match transport.wait(interest, timeout) {
            // a timeout is just another occasion for an attempt
            Ok(ready) => return Ok(ready),
            Err(HomaError::Interrupted) => continue,
            Err(e) => return Err(e),
        }
    }
}
