//! Classification of a single send / receive attempt.
//!
//! Every asynchronous entry point and the blocking engine go through this module, which
//!  guarantees that
//! * an interrupted system call is retried immediately and never becomes visible to the caller,
//! * 'not ready' ([Attempt::WouldBlock]) is distinguishable from failure, and
//! * success and failure are mutually exclusive - a failed attempt carries no partial result.

use std::net::SocketAddr;
use bytes::Bytes;
use tracing::{debug, trace};
use crate::buffer_pages::BufferPageSet;
use crate::control_messages::RecvFlags;
use crate::error::HomaError;
use crate::transport::{HomaTransport, ReceivedMessage, SendCompletion};

#[derive(Debug)]
pub enum Attempt<T> {
    Completed(T),
    /// The socket was not ready; the caller must wait for readiness and try again
    WouldBlock,
    Failed(HomaError),
}

impl<T> Attempt<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Attempt<U> {
        match self {
            Attempt::Completed(t) => Attempt::Completed(f(t)),
            Attempt::WouldBlock => Attempt::WouldBlock,
            Attempt::Failed(e) => Attempt::Failed(e),
        }
    }

    pub fn is_would_block(&self) -> bool {
        matches!(self, Attempt::WouldBlock)
    }
}

/// Run `op` until it returns something other than [HomaError::Interrupted], and classify the
///  result.
pub fn attempt<T>(mut op: impl FnMut() -> Result<T, HomaError>) -> Attempt<T> {
    loop {
        match op() {
            Ok(result) => return Attempt::Completed(result),
            Err(HomaError::Interrupted) => {
                trace!("system call interrupted - retrying");
            }
            Err(HomaError::WouldBlock) => return Attempt::WouldBlock,
            Err(e) => {
                debug!("attempt failed: {}", e);
                return Attempt::Failed(e);
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct SendRequest {
    pub dest: SocketAddr,
    pub fragments: Vec<Bytes>,
    /// 0 for a new request, the request's id for a reply
    pub id: u64,
    pub completion_cookie: u64,
}

impl SendRequest {
    pub fn request(dest: SocketAddr, fragments: Vec<Bytes>, completion_cookie: u64) -> SendRequest {
        SendRequest {
            dest,
            fragments,
            id: 0,
            completion_cookie,
        }
    }

    pub fn reply(dest: SocketAddr, fragments: Vec<Bytes>, id: u64) -> SendRequest {
        SendRequest {
            dest,
            fragments,
            id,
            completion_cookie: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.fragments.iter().map(|f| f.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
pub struct RecvRequest {
    /// 0 for 'any message matching the filter'
    pub want_id: u64,
    pub filter: RecvFlags,
    /// Pages to return to the pool. They are handed to the kernel with the first attempt and
    ///  are empty afterwards.
    pub recycle: BufferPageSet,
}

impl RecvRequest {
    pub fn new(want_id: u64, filter: RecvFlags, recycle: BufferPageSet) -> RecvRequest {
        RecvRequest {
            want_id,
            filter,
            recycle,
        }
    }
}

pub fn non_blocking_send(transport: &HomaTransport, request: &SendRequest) -> Attempt<SendCompletion> {
    attempt(|| transport.send(request.dest, &request.fragments, request.id, request.completion_cookie))
}

pub fn non_blocking_recv(transport: &HomaTransport, request: &mut RecvRequest) -> Attempt<ReceivedMessage> {
    attempt(|| {
        // the kernel takes the pages regardless of the outcome, so retries must not repeat them
        let recycle = std::mem::take(&mut request.recycle);
        transport.receive(request.want_id, request.filter, &recycle, true)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use rstest::rstest;
    use crate::config::BPAGE_SIZE;
    use crate::homa_sys::MockHomaSys;

    fn peer() -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 2], 4000))
    }

    #[rstest]
    #[case::no_interrupt(0)]
    #[case::one_interrupt(1)]
    #[case::many_interrupts(5)]
    fn test_recv_interrupted_then_success(#[case] k: usize) {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in_mock = calls.clone();

        let mut sys = MockHomaSys::new();
        sys.expect_recvmsg()
            .times(k + 1)
            .returning(move |_, args| {
                let n = calls_in_mock.fetch_add(1, Ordering::SeqCst);
                // recycled pages go to the kernel with the first attempt only
                if n == 0 {
                    assert_eq!(args.pages().offsets(), &[BPAGE_SIZE as u32]);
                }
                else {
                    assert!(args.pages().is_empty());
                }

                if n < k {
                    Err(io::Error::from_raw_os_error(libc::EINTR))
                }
                else {
                    args.fill_received(7, 0, RecvFlags::REQUEST, peer(), &BufferPageSet::from_offsets(&[0]));
                    Ok(26)
                }
            });

        let transport = HomaTransport::new(3, Arc::new(sys));
        let mut request = RecvRequest::new(0, RecvFlags::REQUEST, BufferPageSet::from_offsets(&[BPAGE_SIZE as u32]));

        match non_blocking_recv(&transport, &mut request) {
            Attempt::Completed(received) => {
                assert_eq!(received.len, 26);
                assert_eq!(received.id, 7);
                assert_eq!(received.pages.offsets(), &[0]);
                assert_eq!(received.peer, Some(peer()));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), k + 1);
        assert!(request.recycle.is_empty());
    }

    #[test]
    fn test_send_interrupted_then_success() {
        let mut remaining_interrupts = 3;
        let mut sys = MockHomaSys::new();
        sys.expect_sendmsg()
            .times(4)
            .returning(move |_, _, _, args| {
                if remaining_interrupts > 0 {
                    remaining_interrupts -= 1;
                    return Err(io::Error::from_raw_os_error(libc::EINTR));
                }
                args.id = 12;
                Ok(3)
            });

        let transport = HomaTransport::new(3, Arc::new(sys));
        let request = SendRequest::request(peer(), vec![Bytes::from_static(b"abc")], 111);

        match non_blocking_send(&transport, &request) {
            Attempt::Completed(completion) => assert_eq!(completion, SendCompletion { bytes_sent: 3, id: 12 }),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_would_block() {
        let mut sys = MockHomaSys::new();
        sys.expect_recvmsg()
            .times(1)
            .returning(|_, _| Err(io::Error::from_raw_os_error(libc::EAGAIN)));

        let transport = HomaTransport::new(3, Arc::new(sys));
        let mut request = RecvRequest::new(0, RecvFlags::ANY, BufferPageSet::from_offsets(&[0]));

        assert!(non_blocking_recv(&transport, &mut request).is_would_block());
        // the pages were consumed even though no message was returned
        assert!(request.recycle.is_empty());
    }

    #[rstest]
    #[case::exhausted(libc::ENOMEM)]
    #[case::invalid(libc::EINVAL)]
    #[case::unreachable(libc::EHOSTUNREACH)]
    fn test_failed(#[case] errno: i32) {
        let mut sys = MockHomaSys::new();
        sys.expect_recvmsg()
            .times(1)
            .returning(move |_, _| Err(io::Error::from_raw_os_error(errno)));

        let transport = HomaTransport::new(3, Arc::new(sys));
        let mut request = RecvRequest::new(0, RecvFlags::ANY, BufferPageSet::new());

        assert!(matches!(non_blocking_recv(&transport, &mut request), Attempt::Failed(_)));
    }

    #[test]
    fn test_attempt_map() {
        assert!(matches!(Attempt::Completed(2).map(|x| x * 2), Attempt::Completed(4)));
        assert!(Attempt::<u32>::WouldBlock.map(|x| x * 2).is_would_block());
    }
}
