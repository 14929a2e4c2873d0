use std::io;
use std::mem::size_of;
use std::net::SocketAddr;
use std::os::fd::{BorrowedFd, RawFd};
use std::time::Duration;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use tracing::trace;
use crate::config::{IPPROTO_HOMA, SO_HOMA_SET_BUF};
use crate::control_messages::{encode_sockaddr, HomaRecvmsgArgs, HomaSendmsgArgs, HomaSetBufArgs};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interest {
    Readable,
    Writable,
}

/// The kernel-facing primitives of the Homa transport. This is the seam between the protocol
///  logic and actual system calls, introduced to facilitate mocking the I/O part away for
///  testing, and to allow running against the in-process simulation in [crate::sim].
///
/// Implementations report raw OS errors; classification into transient vs. permanent errors
///  happens in [crate::transport::HomaTransport].
#[cfg_attr(test, automock)]
pub trait HomaSys: Send + Sync + 'static {
    /// Register `length` bytes starting at address `start` as the socket's receive buffer pool
    fn set_buffer(&self, fd: RawFd, start: usize, length: usize) -> io::Result<()>;

    /// Send a single message. `args.id` is 0 for a new request, in which case the kernel
    ///  writes the assigned id back into `args`.
    fn sendmsg(&self, fd: RawFd, dest: SocketAddr, fragments: &[Bytes], args: &mut HomaSendmsgArgs) -> io::Result<usize>;

    /// Receive a single message. The pages listed in `args` are returned to the pool as part of
    ///  the call, and on success `args` is overwritten with the received message's metadata.
    fn recvmsg(&self, fd: RawFd, args: &mut HomaRecvmsgArgs) -> io::Result<usize>;

    /// Block until the socket is ready for the given interest, or until the timeout expires.
    ///  Returns `false` on timeout.
    fn poll(&self, fd: RawFd, interest: Interest, timeout: Option<Duration>) -> io::Result<bool>;

    fn local_addr(&self, fd: RawFd) -> io::Result<SocketAddr>;
}


/// Homa system calls of the Linux kernel module
#[derive(Debug, Default, Clone, Copy)]
pub struct LinuxHoma;

impl LinuxHoma {
    fn sockaddr_len(dest: SocketAddr) -> libc::socklen_t {
        match dest {
            SocketAddr::V4(_) => size_of::<libc::sockaddr_in>() as libc::socklen_t,
            SocketAddr::V6(_) => size_of::<libc::sockaddr_in6>() as libc::socklen_t,
        }
    }
}

impl HomaSys for LinuxHoma {
    fn set_buffer(&self, fd: RawFd, start: usize, length: usize) -> io::Result<()> {
        let args = HomaSetBufArgs {
            start: start as *mut libc::c_void,
            length,
        };
        let result = unsafe {
            libc::setsockopt(
                fd,
                IPPROTO_HOMA,
                SO_HOMA_SET_BUF,
                &args as *const _ as *const libc::c_void,
                size_of::<HomaSetBufArgs>() as libc::socklen_t,
            )
        };
        if result < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn sendmsg(&self, fd: RawFd, dest: SocketAddr, fragments: &[Bytes], args: &mut HomaSendmsgArgs) -> io::Result<usize> {
        let mut iov = fragments.iter()
            .map(|f| libc::iovec {
                iov_base: f.as_ptr() as *mut libc::c_void,
                iov_len: f.len(),
            })
            .collect::<Vec<_>>();
        let mut name = encode_sockaddr(dest);

        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_name = name.as_mut_ptr() as *mut libc::c_void;
        msg.msg_namelen = Self::sockaddr_len(dest);
        msg.msg_iov = iov.as_mut_ptr();
        msg.msg_iovlen = iov.len() as _;
        msg.msg_control = args as *mut HomaSendmsgArgs as *mut libc::c_void;
        msg.msg_controllen = size_of::<HomaSendmsgArgs>() as _;

        trace!("sendmsg on fd {} to {:?}: {} fragments, id {}", fd, dest, fragments.len(), args.id);
        let result = unsafe { libc::sendmsg(fd, &msg, libc::MSG_DONTWAIT) };
        if result < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(result as usize)
    }

    fn recvmsg(&self, fd: RawFd, args: &mut HomaRecvmsgArgs) -> io::Result<usize> {
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_control = args as *mut HomaRecvmsgArgs as *mut libc::c_void;
        msg.msg_controllen = HomaRecvmsgArgs::SERIALIZED_LEN as _;

        trace!("recvmsg on fd {}: id {}, flags {:#x}, returning {} pages", fd, args.id, args.flags, args.num_bpages);
        let result = unsafe { libc::recvmsg(fd, &mut msg, 0) };
        if result < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(result as usize)
    }

    fn poll(&self, fd: RawFd, interest: Interest, timeout: Option<Duration>) -> io::Result<bool> {
        let mut fds = libc::pollfd {
            fd,
            events: match interest {
                Interest::Readable => libc::POLLIN,
                Interest::Writable => libc::POLLOUT,
            },
            revents: 0,
        };
        let timeout_millis = timeout
            .map(|t| t.as_millis().min(libc::c_int::MAX as u128) as libc::c_int)
            .unwrap_or(-1);

        let result = unsafe { libc::poll(&mut fds, 1, timeout_millis) };
        if result < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(result > 0)
    }

    fn local_addr(&self, fd: RawFd) -> io::Result<SocketAddr> {
        let fd = unsafe { BorrowedFd::borrow_raw(fd) };
        socket2::SockRef::from(&fd)
            .local_addr()?
            .as_socket()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "socket has no IP address"))
    }
}
