//! An in-process stand-in for the Homa kernel module.
//!
//! [SimNetwork] implements [HomaSys] for any number of sockets that exchange messages inside
//!  the process. It follows the kernel's contract for everything the crate relies on:
//! * requests get even ids assigned by the sender side; the receiver sees the id with the
//!   low-order bit set, and a reply carries that id back to the client
//! * the completion cookie passed with a request is echoed with its reply
//! * incoming messages are placed in the receiving socket's registered buffer region: one pool
//!   page per full page of data, and a shorter tail is packed into a page shared with the tails
//!   of other messages. A page stays allocated until every fragment in it is recycled.
//! * a receive fails with `ENOMEM` if there are not enough free pages, `EAGAIN` if there is no
//!   matching message and the call is non-blocking, `EINVAL` for offsets in pages that are not allocated
//!
//! There is no packet loss, no congestion and no timeouts.

use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use async_trait::async_trait;
use bit_set::BitSet;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};
use crate::buffer_pages::BufferPageSet;
use crate::buffer_region::BufferRegion;
use crate::config::{BPAGE_SIZE, MAX_BPAGES, MAX_MESSAGE_LENGTH};
use crate::control_messages::{HomaRecvmsgArgs, HomaSendmsgArgs, RecvFlags};
use crate::error::HomaError;
use crate::homa_sys::{HomaSys, Interest};
use crate::reactor::Readiness;

const FIRST_EPHEMERAL_PORT: u16 = 40000;
const FIRST_FD: RawFd = 1000;

#[derive(Debug)]
struct SimMessage {
    /// the id as seen by the receiving socket
    id: u64,
    from: SocketAddr,
    is_request: bool,
    data: Vec<u8>,
}

impl SimMessage {
    fn matches(&self, want_id: u64, flags: RecvFlags) -> bool {
        if want_id != 0 {
            return !self.is_request && self.id == want_id;
        }
        if self.is_request {
            flags.contains(RecvFlags::REQUEST)
        }
        else {
            flags.contains(RecvFlags::RESPONSE)
        }
    }
}

/// Tail fragments are packed into a shared page, each starting at a multiple of this
const TAIL_ALIGNMENT: usize = 64;

struct SimPool {
    start: usize,
    /// references held by the application, per page
    refs: Vec<u32>,
    free: BitSet,
    /// the page that short tail fragments are currently packed into, and its first unused byte
    tail_page: Option<(usize, usize)>,
}

impl SimPool {
    fn new(start: usize, num_pages: usize) -> SimPool {
        let mut free = BitSet::with_capacity(num_pages);
        for index in 0..num_pages {
            free.insert(index);
        }
        SimPool {
            start,
            refs: vec![0; num_pages],
            free,
            tail_page: None,
        }
    }

    fn in_use(&self) -> usize {
        self.refs.iter().filter(|&&refs| refs > 0).count()
    }

    fn release(&mut self, offset: u32) -> io::Result<()> {
        let index = offset as usize / BPAGE_SIZE;
        match self.refs.get_mut(index) {
            Some(refs) if *refs > 0 => {
                *refs -= 1;
                if *refs == 0 {
                    self.free.insert(index);
                    if matches!(self.tail_page, Some((tail, _)) if tail == index) {
                        self.tail_page = None;
                    }
                }
                Ok(())
            }
            _ => {
                warn!("recycling invalid buffer offset {}", offset);
                Err(io::Error::from_raw_os_error(libc::EINVAL))
            }
        }
    }

    /// lowest free page first
    fn take_free_page(&mut self) -> Option<usize> {
        let index = self.free.iter().next()?;
        self.free.remove(index);
        self.refs[index] = 1;
        Some(index)
    }

    fn write(&self, offset: usize, data: &[u8]) -> u32 {
        // SAFETY: the region was registered by the socket's owner and is mapped until the
        //  socket is closed, and unallocated parts of the pool are not accessed by the application
        unsafe { BufferRegion::write_raw(self.start, offset, data) };
        offset as u32
    }

    /// Copy `data` into the pool, returning its fragments, or `None` if there is not enough
    ///  room. Full pages get a page of their own, a shorter tail goes into the shared tail page.
    fn store(&mut self, data: &[u8]) -> Option<BufferPageSet> {
        let num_full = data.len() / BPAGE_SIZE;
        let tail_len = data.len() % BPAGE_SIZE;
        let num_fragments = num_full + usize::from(tail_len > 0);

        let tail_fits = match self.tail_page {
            Some((_, used)) => tail_len > 0 && used + tail_len <= BPAGE_SIZE,
            None => false,
        };
        let num_new_pages = num_full + usize::from(tail_len > 0 && !tail_fits);
        if num_fragments > MAX_BPAGES || num_new_pages > self.free.iter().count() {
            return None;
        }

        let mut offsets = Vec::with_capacity(num_fragments);
        for chunk in data[..num_full * BPAGE_SIZE].chunks(BPAGE_SIZE) {
            let index = self.take_free_page()?;
            offsets.push(self.write(index * BPAGE_SIZE, chunk));
        }
        if tail_len > 0 {
            let offset = match self.tail_page {
                Some((index, used)) if tail_fits => {
                    self.refs[index] += 1;
                    index * BPAGE_SIZE + used
                }
                _ => self.take_free_page()? * BPAGE_SIZE,
            };
            let used = (offset % BPAGE_SIZE + tail_len).next_multiple_of(TAIL_ALIGNMENT);
            self.tail_page = Some((offset / BPAGE_SIZE, used));
            offsets.push(self.write(offset, &data[num_full * BPAGE_SIZE..]));
        }
        Some(BufferPageSet::from_offsets(&offsets))
    }
}

struct SimSocket {
    addr: SocketAddr,
    pool: Option<SimPool>,
    inbox: VecDeque<SimMessage>,
    /// requests sent from this socket that have not received their reply yet: id -> cookie
    client_rpcs: FxHashMap<u64, u64>,
    /// requests received by this socket that were not replied to yet: id -> client address
    server_rpcs: FxHashMap<u64, SocketAddr>,
    readiness: Arc<Notify>,
}

impl SimSocket {
    fn deliver(&mut self, msg: SimMessage) {
        trace!("delivering message {} from {:?} to {:?}", msg.id, msg.from, self.addr);
        self.inbox.push_back(msg);
        wake(&self.readiness);
    }
}

fn wake(notify: &Notify) {
    // wake all current waiters, and leave a permit for a waiter that is just about to wait
    notify.notify_waiters();
    notify.notify_one();
}

#[derive(Default)]
struct SimState {
    sockets: FxHashMap<RawFd, SimSocket>,
    by_addr: FxHashMap<SocketAddr, RawFd>,
    next_port: u16,
    next_id: u64,
}

impl SimState {
    fn socket(&mut self, fd: RawFd) -> io::Result<&mut SimSocket> {
        self.sockets.get_mut(&fd)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))
    }

    fn ephemeral_addr(&mut self, ip: IpAddr) -> io::Result<SocketAddr> {
        for _ in 0..=(u16::MAX - FIRST_EPHEMERAL_PORT) {
            let port = self.next_port;
            self.next_port = if port == u16::MAX { FIRST_EPHEMERAL_PORT } else { port + 1 };

            let candidate = SocketAddr::new(ip, port);
            if !self.by_addr.contains_key(&candidate) {
                return Ok(candidate);
            }
        }
        Err(io::Error::from_raw_os_error(libc::EADDRINUSE))
    }
}

/// A simulated network of Homa sockets inside this process
pub struct SimNetwork {
    state: Mutex<SimState>,
    changed: Condvar,
    next_fd: AtomicI32,
}

impl SimNetwork {
    pub fn new() -> Arc<SimNetwork> {
        Arc::new(SimNetwork {
            state: Mutex::new(SimState {
                next_port: FIRST_EPHEMERAL_PORT,
                next_id: 2,
                ..SimState::default()
            }),
            changed: Condvar::new(),
            next_fd: AtomicI32::new(FIRST_FD),
        })
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap()
    }

    /// Create a socket bound to `addr`. Port 0 binds to an ephemeral port.
    pub fn open(&self, addr: SocketAddr) -> io::Result<RawFd> {
        let mut state = self.lock();
        let addr = if addr.port() == 0 {
            state.ephemeral_addr(addr.ip())?
        }
        else {
            addr
        };
        if state.by_addr.contains_key(&addr) {
            return Err(io::Error::from_raw_os_error(libc::EADDRINUSE));
        }

        let fd = self.next_fd.fetch_add(1, Ordering::Relaxed);
        state.by_addr.insert(addr, fd);
        state.sockets.insert(fd, SimSocket {
            addr,
            pool: None,
            inbox: VecDeque::new(),
            client_rpcs: FxHashMap::default(),
            server_rpcs: FxHashMap::default(),
            readiness: Arc::new(Notify::new()),
        });
        debug!("opened simulated socket {} at {:?}", fd, addr);
        Ok(fd)
    }

    pub fn close(&self, fd: RawFd) {
        let mut state = self.lock();
        if let Some(socket) = state.sockets.remove(&fd) {
            state.by_addr.remove(&socket.addr);
            if !socket.inbox.is_empty() {
                debug!("discarding {} undelivered messages of socket {}", socket.inbox.len(), fd);
            }
            wake(&socket.readiness);
            debug!("closed simulated socket {} at {:?}", fd, socket.addr);
        }
        self.changed.notify_all();
    }

    pub fn readiness(&self, fd: RawFd) -> Result<Arc<dyn Readiness>, HomaError> {
        let mut state = self.lock();
        let socket = state.socket(fd)?;
        Ok(Arc::new(SimReadiness {
            notify: socket.readiness.clone(),
        }))
    }

    /// number of pool pages of socket `fd` that are currently handed out to the application
    pub fn pool_usage(&self, fd: RawFd) -> Option<usize> {
        self.lock().sockets.get(&fd)
            .and_then(|s| s.pool.as_ref())
            .map(|p| p.in_use())
    }

    fn send_request(state: &mut SimState, fd: RawFd, dest: SocketAddr, data: Vec<u8>, args: &mut HomaSendmsgArgs) -> io::Result<()> {
        let dest_fd = *state.by_addr.get(&dest)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ECONNREFUSED))?;

        let id = state.next_id;
        state.next_id += 2;

        let sender = state.socket(fd)?;
        sender.client_rpcs.insert(id, args.completion_cookie);
        let from = sender.addr;
        args.id = id;

        let receiver = state.socket(dest_fd)?;
        receiver.server_rpcs.insert(id ^ 1, from);
        receiver.deliver(SimMessage {
            id: id ^ 1,
            from,
            is_request: true,
            data,
        });
        Ok(())
    }

    fn send_reply(state: &mut SimState, fd: RawFd, dest: SocketAddr, data: Vec<u8>, id: u64) -> io::Result<()> {
        let sender = state.socket(fd)?;
        if sender.server_rpcs.get(&id) != Some(&dest) {
            debug!("reply with id {} to {:?} does not match a pending request", id, dest);
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        sender.server_rpcs.remove(&id);
        let from = sender.addr;

        match state.by_addr.get(&dest).copied() {
            Some(client_fd) => {
                state.socket(client_fd)?
                    .deliver(SimMessage {
                        id: id ^ 1,
                        from,
                        is_request: false,
                        data,
                    });
            }
            None => debug!("client {:?} is gone - dropping reply {}", dest, id),
        }
        Ok(())
    }
}

impl HomaSys for SimNetwork {
    fn set_buffer(&self, fd: RawFd, start: usize, length: usize) -> io::Result<()> {
        let mut state = self.lock();
        let socket = state.socket(fd)?;
        if socket.pool.is_some() || start % BPAGE_SIZE != 0 || length % BPAGE_SIZE != 0 || length == 0 {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        socket.pool = Some(SimPool::new(start, length / BPAGE_SIZE));
        Ok(())
    }

    fn sendmsg(&self, fd: RawFd, dest: SocketAddr, fragments: &[Bytes], args: &mut HomaSendmsgArgs) -> io::Result<usize> {
        let data = fragments.iter()
            .flat_map(|f| f.iter().copied())
            .collect::<Vec<u8>>();
        if data.len() > MAX_MESSAGE_LENGTH {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        let len = data.len();

        let mut state = self.lock();
        if args.id == 0 {
            Self::send_request(&mut state, fd, dest, data, args)?;
        }
        else {
            Self::send_reply(&mut state, fd, dest, data, args.id)?;
        }
        drop(state);

        self.changed.notify_all();
        Ok(len)
    }

    fn recvmsg(&self, fd: RawFd, args: &mut HomaRecvmsgArgs) -> io::Result<usize> {
        let want_id = args.id;
        let flags = args.recv_flags();
        let recycle = args.pages();

        let mut state = self.lock();
        {
            let socket = state.socket(fd)?;
            let pool = socket.pool.as_mut()
                .ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))?;
            for offset in recycle.iter() {
                pool.release(offset)?;
            }
        }

        if want_id == 0 && !flags.intersects(RecvFlags::ANY) {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }

        loop {
            let SimSocket { pool, inbox, client_rpcs, .. } = state.socket(fd)?;
            if let Some(index) = inbox.iter().position(|m| m.matches(want_id, flags)) {
                let pages = match pool.as_mut().and_then(|p| p.store(&inbox[index].data)) {
                    Some(pages) => pages,
                    None => {
                        debug!("not enough free pages for message {} on socket {}", inbox[index].id, fd);
                        return Err(io::Error::from_raw_os_error(libc::ENOMEM));
                    }
                };
                let Some(msg) = inbox.remove(index) else {
                    return Err(io::Error::from_raw_os_error(libc::EINVAL));
                };

                let completion_cookie = if msg.is_request {
                    0
                }
                else {
                    client_rpcs.remove(&msg.id).unwrap_or_default()
                };
                let msg_flags = if msg.is_request { RecvFlags::REQUEST } else { RecvFlags::RESPONSE };
                args.fill_received(msg.id, completion_cookie, msg_flags, msg.from, &pages);
                return Ok(msg.data.len());
            }

            if flags.contains(RecvFlags::NONBLOCKING) {
                return Err(io::Error::from_raw_os_error(libc::EAGAIN));
            }
            state = self.changed.wait(state).unwrap();
        }
    }

    fn poll(&self, fd: RawFd, interest: Interest, timeout: Option<Duration>) -> io::Result<bool> {
        if interest == Interest::Writable {
            return Ok(true);
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.lock();
        loop {
            if !state.socket(fd)?.inbox.is_empty() {
                return Ok(true);
            }
            match deadline {
                None => {
                    state = self.changed.wait(state).unwrap();
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(false);
                    }
                    state = self.changed.wait_timeout(state, deadline - now).unwrap().0;
                }
            }
        }
    }

    fn local_addr(&self, fd: RawFd) -> io::Result<SocketAddr> {
        Ok(self.lock().socket(fd)?.addr)
    }
}

struct SimReadiness {
    notify: Arc<Notify>,
}

#[async_trait]
impl Readiness for SimReadiness {
    async fn ready(&self, interest: Interest) -> Result<(), HomaError> {
        if interest == Interest::Readable {
            self.notify.notified().await;
        }
        Ok(())
    }
}
