use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use bytes::Bytes;
use tracing::{debug, info, trace};
use crate::buffer_pages::BufferPageSet;
use crate::buffer_region::BufferRegion;
use crate::config::{BPAGE_SIZE, MAX_MESSAGE_LENGTH};
use crate::control_messages::{HomaRecvmsgArgs, HomaSendmsgArgs, RecvFlags};
use crate::error::HomaError;
use crate::homa_sys::{HomaSys, Interest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendCompletion {
    pub bytes_sent: usize,
    /// the RPC id - newly assigned by the kernel for requests, the reply's id otherwise
    pub id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub len: usize,
    pub id: u64,
    /// The cookie that was passed when sending the request. This is meaningful only for
    ///  replies, and 0 for received requests
    pub completion_cookie: u64,
    pub peer: Option<SocketAddr>,
    /// The pages holding the message. They are owned by the application until they are
    ///  recycled in a later receive call on the same socket
    pub pages: BufferPageSet,
}

impl ReceivedMessage {
    /// Requests are identified by the id's low-order bit, which the kernel sets for the
    ///  server side of an RPC
    pub fn is_request(&self) -> bool {
        self.id & 1 == 1
    }
}

/// The adapter for the three kernel-facing operations of a Homa socket: registering the buffer
///  pool, sending a message and receiving a message.
///
/// Every call here is a single kernel interaction. Errors are classified (see
///  [HomaError::from_os]) but not handled - retrying is up to the callers in [crate::retry].
pub struct HomaTransport {
    fd: RawFd,
    sys: Arc<dyn HomaSys>,
    buffer_registered: AtomicBool,
}

impl HomaTransport {
    pub fn new(fd: RawFd, sys: Arc<dyn HomaSys>) -> HomaTransport {
        HomaTransport {
            fd,
            sys,
            buffer_registered: AtomicBool::new(false),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn local_addr(&self) -> Result<SocketAddr, HomaError> {
        self.sys.local_addr(self.fd)
            .map_err(HomaError::Transport)
    }

    pub fn register_buffer(&self, region: &BufferRegion) -> Result<(), HomaError> {
        self.register_raw_buffer(region.as_ptr() as usize, region.len())
    }

    pub(crate) fn register_raw_buffer(&self, start: usize, length: usize) -> Result<(), HomaError> {
        if start % BPAGE_SIZE != 0 || length % BPAGE_SIZE != 0 || length == 0 {
            return Err(HomaError::Configuration(format!(
                "buffer region must be aligned to and sized in units of {} bytes, was {:#x} with {} bytes",
                BPAGE_SIZE, start, length)));
        }
        if self.buffer_registered.swap(true, Ordering::AcqRel) {
            return Err(HomaError::Configuration("buffer region is already registered".to_string()));
        }

        if let Err(e) = self.sys.set_buffer(self.fd, start, length) {
            self.buffer_registered.store(false, Ordering::Release);
            return Err(HomaError::Configuration(format!("kernel rejected buffer region: {}", e)));
        }
        info!("registered buffer region of {} pages for fd {}", length / BPAGE_SIZE, self.fd);
        Ok(())
    }

    /// Send a message: a new request if `id` is 0, otherwise the reply for the request with
    ///  that id. The completion cookie is passed back to this socket with the request's reply.
    pub fn send(&self, dest: SocketAddr, fragments: &[Bytes], id: u64, completion_cookie: u64) -> Result<SendCompletion, HomaError> {
        let len = fragments.iter().map(|f| f.len()).sum::<usize>();
        if len > MAX_MESSAGE_LENGTH {
            debug!("message of {} bytes to {:?} exceeds maximum message length", len, dest);
            return Err(HomaError::MessageTooLong(len));
        }

        let mut args = HomaSendmsgArgs {
            id,
            completion_cookie,
        };
        let bytes_sent = self.sys.sendmsg(self.fd, dest, fragments, &mut args)
            .map_err(HomaError::from_os)?;

        trace!("sent {} bytes to {:?} with id {}", bytes_sent, dest, args.id);
        Ok(SendCompletion {
            bytes_sent,
            id: args.id,
        })
    }

    /// Receive a message: `want_id` 0 accepts any message matching `filter`, otherwise only the
    ///  reply with that id.
    ///
    /// The pages in `recycle` are returned to the pool as part of the call, regardless of the
    ///  call's outcome - the application must not touch them afterwards.
    pub fn receive(&self, want_id: u64, filter: RecvFlags, recycle: &BufferPageSet, nonblocking: bool) -> Result<ReceivedMessage, HomaError> {
        let mut flags = filter;
        flags.set(RecvFlags::NONBLOCKING, nonblocking);

        let mut args = HomaRecvmsgArgs::for_receive(want_id, flags, recycle);
        let len = self.sys.recvmsg(self.fd, &mut args)
            .map_err(HomaError::from_os)?;

        let received = ReceivedMessage {
            len,
            id: args.id,
            completion_cookie: args.completion_cookie,
            peer: args.peer_addr(),
            pages: args.pages(),
        };
        trace!("received {} bytes with id {} from {:?} in {:?}", len, received.id, received.peer, received.pages);
        Ok(received)
    }

    /// Block until the socket is ready for `interest` or the timeout expires
    pub fn wait(&self, interest: Interest, timeout: Option<Duration>) -> Result<bool, HomaError> {
        self.sys.poll(self.fd, interest, timeout)
            .map_err(HomaError::from_os)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use mockall::predicate::{always, eq};
    use rstest::rstest;
    use crate::homa_sys::MockHomaSys;

    fn peer() -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 2], 4000))
    }

    #[test]
    fn test_register_buffer() {
        let mut sys = MockHomaSys::new();
        sys.expect_set_buffer()
            .with(eq(5), eq(0x10_0000), eq(4 * BPAGE_SIZE))
            .times(1)
            .returning(|_, _, _| Ok(()));

        let transport = HomaTransport::new(5, Arc::new(sys));
        transport.register_raw_buffer(0x10_0000, 4 * BPAGE_SIZE).unwrap();

        match transport.register_raw_buffer(0x10_0000, 4 * BPAGE_SIZE) {
            Err(HomaError::Configuration(_)) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[rstest]
    #[case::misaligned(0x10_0001, BPAGE_SIZE)]
    #[case::partial_page(0x10_0000, BPAGE_SIZE + 1)]
    #[case::empty(0x10_0000, 0)]
    fn test_register_buffer_invalid(#[case] start: usize, #[case] length: usize) {
        let mut sys = MockHomaSys::new();
        sys.expect_set_buffer().never();

        let transport = HomaTransport::new(5, Arc::new(sys));
        assert!(matches!(transport.register_raw_buffer(start, length), Err(HomaError::Configuration(_))));
    }

    #[test]
    fn test_register_buffer_rejected_by_kernel() {
        let mut sys = MockHomaSys::new();
        sys.expect_set_buffer()
            .times(2)
            .returning(|_, _, _| Err(io::Error::from_raw_os_error(libc::EINVAL)));

        let transport = HomaTransport::new(5, Arc::new(sys));
        assert!(matches!(transport.register_raw_buffer(0, BPAGE_SIZE), Err(HomaError::Configuration(_))));
        // a rejected registration does not count
        assert!(matches!(transport.register_raw_buffer(0, BPAGE_SIZE), Err(HomaError::Configuration(_))));
    }

    #[test]
    fn test_send_request_assigns_id() {
        let mut sys = MockHomaSys::new();
        sys.expect_sendmsg()
            .with(eq(5), eq(peer()), always(), always())
            .times(1)
            .returning(|_, _, fragments, args| {
                assert_eq!(args.id, 0);
                assert_eq!(args.completion_cookie, 111);
                args.id = 42;
                Ok(fragments.iter().map(|f| f.len()).sum())
            });

        let transport = HomaTransport::new(5, Arc::new(sys));
        let result = transport.send(peer(), &[Bytes::from_static(b"ABC"), Bytes::from_static(b"DE")], 0, 111).unwrap();
        assert_eq!(result, SendCompletion { bytes_sent: 5, id: 42 });
    }

    #[test]
    fn test_send_too_long() {
        let mut sys = MockHomaSys::new();
        sys.expect_sendmsg().never();

        let transport = HomaTransport::new(5, Arc::new(sys));
        let payload = Bytes::from(vec![0u8; MAX_MESSAGE_LENGTH + 1]);
        assert!(matches!(transport.send(peer(), &[payload], 0, 0), Err(HomaError::MessageTooLong(_))));
    }

    #[rstest]
    #[case::would_block(libc::EAGAIN, "WouldBlock")]
    #[case::interrupted(libc::EINTR, "Interrupted")]
    #[case::other(libc::ECONNREFUSED, "Transport")]
    fn test_send_error(#[case] errno: i32, #[case] expected: &str) {
        let mut sys = MockHomaSys::new();
        sys.expect_sendmsg()
            .returning(move |_, _, _, _| Err(io::Error::from_raw_os_error(errno)));

        let transport = HomaTransport::new(5, Arc::new(sys));
        let result = transport.send(peer(), &[Bytes::from_static(b"x")], 0, 0);
        let name = match result {
            Err(HomaError::WouldBlock) => "WouldBlock",
            Err(HomaError::Interrupted) => "Interrupted",
            Err(HomaError::Transport(_)) => "Transport",
            _ => "other",
        };
        assert_eq!(name, expected);
    }

    #[test]
    fn test_receive() {
        let mut sys = MockHomaSys::new();
        sys.expect_recvmsg()
            .times(1)
            .returning(|_, args| {
                assert_eq!(args.id, 0);
                assert_eq!(args.recv_flags(), RecvFlags::REQUEST | RecvFlags::NONBLOCKING);
                assert_eq!(args.pages().offsets(), &[2 * BPAGE_SIZE as u32]);

                args.fill_received(43, 0, RecvFlags::REQUEST, peer(), &BufferPageSet::from_offsets(&[0]));
                Ok(26)
            });

        let transport = HomaTransport::new(5, Arc::new(sys));
        let received = transport.receive(0, RecvFlags::REQUEST, &BufferPageSet::from_offsets(&[2 * BPAGE_SIZE as u32]), true).unwrap();

        assert_eq!(received, ReceivedMessage {
            len: 26,
            id: 43,
            completion_cookie: 0,
            peer: Some(peer()),
            pages: BufferPageSet::from_offsets(&[0]),
        });
        assert!(received.is_request());
    }

    #[test]
    fn test_receive_blocking_flag() {
        let mut sys = MockHomaSys::new();
        sys.expect_recvmsg()
            .times(1)
            .returning(|_, args| {
                assert_eq!(args.id, 42);
                assert_eq!(args.recv_flags(), RecvFlags::RESPONSE);
                Err(io::Error::from_raw_os_error(libc::ENOMEM))
            });

        let transport = HomaTransport::new(5, Arc::new(sys));
        let result = transport.receive(42, RecvFlags::RESPONSE, &BufferPageSet::new(), false);
        assert!(matches!(result, Err(HomaError::ResourceExhausted)));
    }
}
