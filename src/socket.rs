use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::sync::oneshot;
use tracing::{debug, info, span, trace, Instrument, Level};
use crate::blocking::{self, BlockingMode};
use crate::buffer_pages::BufferPageSet;
use crate::buffer_region::BufferRegion;
use crate::config::{HomaConfig, IPPROTO_HOMA, MAX_BPAGES};
use crate::control_messages::RecvFlags;
use crate::error::HomaError;
use crate::homa_sys::{HomaSys, LinuxHoma};
use crate::operation::{CompletionHandler, OperationKind, OperationOutput, PendingOperation};
use crate::page_ledger::PageLedger;
use crate::reactor::{self, CancelToken, FdReadiness, Readiness};
use crate::retry::{RecvRequest, SendRequest};
use crate::sim::SimNetwork;
use crate::transport::{HomaTransport, ReceivedMessage, SendCompletion};

enum SocketHandle {
    Os(Socket),
    Simulated {
        network: Arc<SimNetwork>,
        fd: RawFd,
    },
}

impl SocketHandle {
    fn fd(&self) -> RawFd {
        match self {
            SocketHandle::Os(socket) => socket.as_raw_fd(),
            SocketHandle::Simulated { fd, .. } => *fd,
        }
    }
}

impl Drop for SocketHandle {
    fn drop(&mut self) {
        if let SocketHandle::Simulated { network, fd } = self {
            network.close(*fd);
        }
    }
}

/// Cancel tokens of the asynchronous operations in flight on a socket
#[derive(Default)]
struct InFlight {
    closed: bool,
    next_key: u64,
    tokens: FxHashMap<u64, CancelToken>,
}

impl InFlight {
    fn register(&mut self, cancel: &CancelToken) -> Result<u64, HomaError> {
        if self.closed {
            return Err(HomaError::Cancelled);
        }
        let key = self.next_key;
        self.next_key += 1;
        self.tokens.insert(key, cancel.clone());
        Ok(key)
    }

    fn close(&mut self) -> Vec<CancelToken> {
        self.closed = true;
        self.tokens.drain()
            .map(|(_, token)| token)
            .collect()
    }
}

/// Removes an operation's token from [InFlight] when the operation is finished, or when the
///  future driving it is dropped
struct Registration {
    in_flight: Arc<Mutex<InFlight>>,
    key: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.in_flight.lock().unwrap().tokens.remove(&self.key);
    }
}

/// The parts of a socket that an operation in flight works with. Spawned operations hold a
///  clone of this rather than the socket itself, so that dropping the socket closes it.
#[derive(Clone)]
struct OperationContext {
    transport: Arc<HomaTransport>,
    ledger: Arc<Mutex<PageLedger>>,
    /// pages released by the application, to be handed to the kernel with the next receive
    release_queue: Arc<Mutex<Vec<u32>>>,
    in_flight: Arc<Mutex<InFlight>>,
}

impl OperationContext {
    fn new(transport: HomaTransport) -> OperationContext {
        OperationContext {
            transport: Arc::new(transport),
            ledger: Default::default(),
            release_queue: Default::default(),
            in_flight: Default::default(),
        }
    }

    fn requeue(&self, pages: &BufferPageSet) {
        self.release_queue.lock().unwrap().extend(pages.iter());
    }

    fn register(&self, cancel: &CancelToken) -> Result<Registration, HomaError> {
        let key = self.in_flight.lock().unwrap().register(cancel)?;
        Ok(Registration {
            in_flight: self.in_flight.clone(),
            key,
        })
    }

    /// Drive an operation on the current task. The handler is invoked exactly once before this
    ///  returns, or with [HomaError::Cancelled] if the returned future is dropped early.
    async fn drive(&self, mut kind: OperationKind, handler: CompletionHandler, readiness: Result<Arc<dyn Readiness>, HomaError>, cancel: &CancelToken) {
        let registered = readiness.and_then(|readiness| Ok((readiness, self.register(cancel)?)));
        let (readiness, _registration) = match registered {
            Ok(registered) => registered,
            Err(e) => {
                self.requeue(&kind.take_unsubmitted_pages());
                handler(Err(e));
                return;
            }
        };

        let ledger = self.ledger.clone();
        let handler: CompletionHandler = Box::new(move |result| {
            if let Ok(output) = &result {
                if !output.pages.is_empty() {
                    ledger.lock().unwrap().acquire(&output.pages);
                }
            }
            handler(result)
        });

        let op = PendingOperation::new(kind, handler);
        let unsubmitted = reactor::drive(op, &self.transport, readiness.as_ref(), cancel).await;
        if !unsubmitted.is_empty() {
            debug!("re-queueing {} pages that were not recycled", unsubmitted.count());
            self.requeue(&unsubmitted);
        }
    }
}

/// A Homa socket with its registered receive buffer region.
///
/// All entry points share the socket's page bookkeeping: pages handed out by a receive are
///  owned by the application until they are passed back as `recycle` pages to a later receive
///  (or to [HomaSocket::release_pages]).
///
/// There are three flavors of every operation:
/// * synchronous (`send_request`, `receive_any`, ...), blocking the calling thread until the
///   operation is done unless the socket is in non-blocking mode
/// * `async` (`send_request_async`, ...), driven by the calling task
/// * callback style (`async_send_request`, ...), driven by a spawned tokio task and
///   cancellable through the returned [CancelToken]
///
/// [HomaSocket::close] cancels all asynchronous operations in flight, and so does dropping the
///  socket.
pub struct HomaSocket {
    // fields are dropped in declaration order: readiness registration before the file
    //  descriptor is closed, and the region only after that
    readiness: Mutex<Option<Arc<dyn Readiness>>>,
    context: OperationContext,
    handle: SocketHandle,
    region: BufferRegion,
    non_blocking: AtomicBool,
    poll_timeout: Option<Duration>,
}

impl HomaSocket {
    /// Open a socket of the Homa kernel module, bound to `addr`
    pub fn open(addr: SocketAddr, config: &HomaConfig) -> anyhow::Result<HomaSocket> {
        config.validate()?;

        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::from(IPPROTO_HOMA)))?;
        socket.bind(&addr.into())?;
        // readiness is handled by this crate, the socket itself never blocks
        socket.set_nonblocking(true)?;

        let fd = socket.as_raw_fd();
        Self::assemble(SocketHandle::Os(socket), fd, Arc::new(LinuxHoma), config)
    }

    /// Open a socket in an in-process [SimNetwork]
    pub fn open_simulated(network: &Arc<SimNetwork>, addr: SocketAddr, config: &HomaConfig) -> anyhow::Result<HomaSocket> {
        config.validate()?;

        let fd = network.open(addr)?;
        let handle = SocketHandle::Simulated {
            network: network.clone(),
            fd,
        };
        Self::assemble(handle, fd, network.clone(), config)
    }

    fn assemble(handle: SocketHandle, fd: RawFd, sys: Arc<dyn HomaSys>, config: &HomaConfig) -> anyhow::Result<HomaSocket> {
        let region = BufferRegion::new(config.region_pages)?;
        let transport = HomaTransport::new(fd, sys);
        transport.register_buffer(&region)?;

        let socket = HomaSocket {
            readiness: Mutex::new(None),
            context: OperationContext::new(transport),
            handle,
            region,
            non_blocking: AtomicBool::new(config.non_blocking),
            poll_timeout: config.poll_timeout,
        };
        info!("opened Homa socket {} at {:?} with {} buffer pages ({} bytes)", socket.handle.fd(), socket.local_addr()?, config.region_pages, config.region_len());
        Ok(socket)
    }

    pub fn local_addr(&self) -> Result<SocketAddr, HomaError> {
        self.context.transport.local_addr()
    }

    pub fn fd(&self) -> RawFd {
        self.handle.fd()
    }

    pub fn region(&self) -> &BufferRegion {
        &self.region
    }

    /// Cancel all asynchronous operations in flight, each of them delivering
    ///  [HomaError::Cancelled] to its handler. Operations started after this fail with
    ///  [HomaError::Cancelled] right away. The file descriptor is closed when the socket is
    ///  dropped.
    pub fn close(&self) {
        let tokens = self.context.in_flight.lock().unwrap().close();
        if !tokens.is_empty() {
            debug!("cancelling {} operations in flight on socket {}", tokens.len(), self.fd());
        }
        for token in tokens {
            token.cancel();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.context.in_flight.lock().unwrap().closed
    }

    fn ensure_open(&self) -> Result<(), HomaError> {
        if self.is_closed() {
            trace!("socket {} is closed", self.fd());
            return Err(HomaError::Cancelled);
        }
        Ok(())
    }

    /// Copy a received message out of the buffer region. The message's pages must not have
    ///  been recycled yet.
    pub fn read_message(&self, msg: &ReceivedMessage) -> Vec<u8> {
        self.region.read_message(&msg.pages, msg.len)
    }

    /// Number of buffer fragments currently owned by the application
    pub fn outstanding_pages(&self) -> usize {
        self.context.ledger.lock().unwrap().outstanding()
    }

    /// Switch the synchronous entry points between blocking and non-blocking mode
    pub fn set_non_blocking(&self, non_blocking: bool) {
        self.non_blocking.store(non_blocking, Ordering::Release);
    }

    pub fn is_non_blocking(&self) -> bool {
        self.non_blocking.load(Ordering::Acquire)
    }

    fn blocking_mode(&self) -> BlockingMode {
        BlockingMode {
            non_blocking: self.is_non_blocking(),
            poll_timeout: self.poll_timeout,
        }
    }

    /// Hand pages back to the kernel without receiving. They are passed on with the next
    ///  receive on this socket.
    pub fn release_pages(&self, pages: &BufferPageSet) {
        if pages.is_empty() {
            return;
        }
        let valid = self.context.ledger.lock().unwrap().release(pages);
        self.context.requeue(&valid);
    }

    /// Take pages to recycle with the next receive: `recycle` plus whatever was released
    ///  before, up to the number of pages that fit into a single call
    fn recycle_pages(&self, recycle: &BufferPageSet) -> BufferPageSet {
        self.release_pages(recycle);

        let mut queue = self.context.release_queue.lock().unwrap();
        let num_taken = queue.len().min(MAX_BPAGES);
        let taken = queue.drain(..num_taken).collect::<Vec<_>>();
        BufferPageSet::from_offsets(&taken)
    }

    fn track(&self, result: Result<ReceivedMessage, HomaError>) -> Result<ReceivedMessage, HomaError> {
        if let Ok(msg) = &result {
            self.context.ledger.lock().unwrap().acquire(&msg.pages);
        }
        result
    }

    pub fn send_request(&self, dest: SocketAddr, fragments: &[Bytes], completion_cookie: u64) -> Result<SendCompletion, HomaError> {
        self.ensure_open()?;
        let request = SendRequest::request(dest, fragments.to_vec(), completion_cookie);
        blocking::send(&self.context.transport, &request, self.blocking_mode())
    }

    /// Send the reply for the request with `id`, which must have been received from `dest`
    pub fn send_reply(&self, dest: SocketAddr, fragments: &[Bytes], id: u64) -> Result<SendCompletion, HomaError> {
        self.ensure_open()?;
        let request = SendRequest::reply(dest, fragments.to_vec(), id);
        blocking::send(&self.context.transport, &request, self.blocking_mode())
    }

    pub fn receive_request(&self, recycle: &BufferPageSet) -> Result<ReceivedMessage, HomaError> {
        self.receive(0, RecvFlags::REQUEST, recycle)
    }

    /// Receive the reply with `id`, or any reply if `id` is 0
    pub fn receive_reply(&self, id: u64, recycle: &BufferPageSet) -> Result<ReceivedMessage, HomaError> {
        self.receive(id, RecvFlags::RESPONSE, recycle)
    }

    pub fn receive_any(&self, recycle: &BufferPageSet) -> Result<ReceivedMessage, HomaError> {
        self.receive(0, RecvFlags::ANY, recycle)
    }

    fn receive(&self, want_id: u64, filter: RecvFlags, recycle: &BufferPageSet) -> Result<ReceivedMessage, HomaError> {
        self.ensure_open()?;
        let mut request = RecvRequest::new(want_id, filter, self.recycle_pages(recycle));
        let result = blocking::receive(&self.context.transport, &mut request, self.blocking_mode());
        self.track(result)
    }

    fn readiness(&self) -> Result<Arc<dyn Readiness>, HomaError> {
        let mut readiness = self.readiness.lock().unwrap();
        if let Some(r) = readiness.as_ref() {
            return Ok(r.clone());
        }

        let r: Arc<dyn Readiness> = match &self.handle {
            SocketHandle::Os(socket) => {
                let fd_readiness = FdReadiness::new(socket.as_raw_fd())
                    .map_err(|e| HomaError::Configuration(format!("cannot register socket with the runtime: {}", e)))?;
                Arc::new(fd_readiness)
            }
            SocketHandle::Simulated { network, fd } => network.readiness(*fd)?,
        };
        *readiness = Some(r.clone());
        Ok(r)
    }

    async fn run(&self, kind: OperationKind) -> Result<OperationOutput, HomaError> {
        let (tx, rx) = oneshot::channel();
        let handler: CompletionHandler = Box::new(move |result| {
            let _ = tx.send(result);
        });
        self.context.drive(kind, handler, self.readiness(), &CancelToken::new()).await;
        rx.await
            .unwrap_or(Err(HomaError::Cancelled))
    }

    pub async fn send_request_async(&self, dest: SocketAddr, fragments: Vec<Bytes>, completion_cookie: u64) -> Result<OperationOutput, HomaError> {
        self.run(OperationKind::send_request(dest, fragments, completion_cookie)).await
    }

    pub async fn send_reply_async(&self, dest: SocketAddr, fragments: Vec<Bytes>, id: u64) -> Result<OperationOutput, HomaError> {
        self.run(OperationKind::send_reply(dest, fragments, id)).await
    }

    pub async fn receive_request_async(&self, recycle: &BufferPageSet) -> Result<OperationOutput, HomaError> {
        let recycle = self.recycle_pages(recycle);
        self.run(OperationKind::receive_request(recycle)).await
    }

    pub async fn receive_reply_async(&self, id: u64, recycle: &BufferPageSet) -> Result<OperationOutput, HomaError> {
        let recycle = self.recycle_pages(recycle);
        self.run(OperationKind::receive_reply(id, recycle)).await
    }

    pub async fn receive_any_async(&self, recycle: &BufferPageSet) -> Result<OperationOutput, HomaError> {
        let recycle = self.recycle_pages(recycle);
        self.run(OperationKind::receive_any(recycle)).await
    }

    fn spawn(&self, kind: OperationKind, handler: CompletionHandler) -> CancelToken {
        let cancel = CancelToken::new();
        let context = self.context.clone();
        let readiness = self.readiness();
        let token = cancel.clone();
        let span = span!(Level::DEBUG, "homa_socket", fd = self.fd());
        tokio::spawn(async move {
            context.drive(kind, handler, readiness, &token).await;
        }.instrument(span));
        cancel
    }

    /// Send a request on a spawned task. Must be called inside a tokio runtime.
    pub fn async_send_request(&self, dest: SocketAddr, fragments: Vec<Bytes>, completion_cookie: u64, handler: CompletionHandler) -> CancelToken {
        self.spawn(OperationKind::send_request(dest, fragments, completion_cookie), handler)
    }

    pub fn async_send_reply(&self, dest: SocketAddr, fragments: Vec<Bytes>, id: u64, handler: CompletionHandler) -> CancelToken {
        self.spawn(OperationKind::send_reply(dest, fragments, id), handler)
    }

    pub fn async_receive_request(&self, recycle: &BufferPageSet, handler: CompletionHandler) -> CancelToken {
        let recycle = self.recycle_pages(recycle);
        self.spawn(OperationKind::receive_request(recycle), handler)
    }

    pub fn async_receive_reply(&self, id: u64, recycle: &BufferPageSet, handler: CompletionHandler) -> CancelToken {
        let recycle = self.recycle_pages(recycle);
        self.spawn(OperationKind::receive_reply(id, recycle), handler)
    }

    pub fn async_receive_any(&self, recycle: &BufferPageSet, handler: CompletionHandler) -> CancelToken {
        let recycle = self.recycle_pages(recycle);
        self.spawn(OperationKind::receive_any(recycle), handler)
    }
}

impl Drop for HomaSocket {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BPAGE_SIZE;

    type Results = Arc<Mutex<Vec<Result<OperationOutput, HomaError>>>>;

    fn collecting_handler() -> (CompletionHandler, Results) {
        let results: Results = Default::default();
        let results_in_handler = results.clone();
        let handler: CompletionHandler = Box::new(move |r| results_in_handler.lock().unwrap().push(r));
        (handler, results)
    }

    fn config(region_pages: usize) -> HomaConfig {
        HomaConfig {
            region_pages,
            ..HomaConfig::default_config()
        }
    }

    fn pair(network: &Arc<SimNetwork>) -> (HomaSocket, HomaSocket) {
        let a = HomaSocket::open_simulated(network, "127.0.0.1:0".parse().unwrap(), &config(16)).unwrap();
        let b = HomaSocket::open_simulated(network, "127.0.0.1:0".parse().unwrap(), &config(16)).unwrap();
        (a, b)
    }

    #[test]
    fn test_invalid_config() {
        let network = SimNetwork::new();
        assert!(HomaSocket::open_simulated(&network, "127.0.0.1:0".parse().unwrap(), &config(1)).is_err());
    }

    #[test]
    fn test_close_on_drop() {
        let network = SimNetwork::new();
        let socket = HomaSocket::open_simulated(&network, "127.0.0.1:5000".parse().unwrap(), &config(16)).unwrap();
        let fd = socket.fd();
        drop(socket);
        assert!(network.local_addr(fd).is_err());
        assert!(HomaSocket::open_simulated(&network, "127.0.0.1:5000".parse().unwrap(), &config(16)).is_ok());
    }

    #[test]
    fn test_non_blocking_mode() {
        let network = SimNetwork::new();
        let (a, _b) = pair(&network);
        a.set_non_blocking(true);
        assert!(matches!(a.receive_any(&BufferPageSet::new()), Err(HomaError::WouldBlock)));
    }

    #[test]
    fn test_ledger_tracks_pages() {
        let network = SimNetwork::new();
        let (a, b) = pair(&network);
        let b_addr = b.local_addr().unwrap();

        a.send_request(b_addr, &[Bytes::from_static(b"one")], 1).unwrap();
        a.send_request(b_addr, &[Bytes::from_static(b"two")], 2).unwrap();

        let first = b.receive_request(&BufferPageSet::new()).unwrap();
        assert_eq!(b.read_message(&first), b"one");
        assert_eq!(b.outstanding_pages(), 1);

        let second = b.receive_request(&first.pages).unwrap();
        assert_eq!(b.read_message(&second), b"two");
        assert_eq!(b.outstanding_pages(), 1);
        assert_eq!(network.pool_usage(b.fd()), Some(1));
    }

    #[test]
    fn test_release_pages_flushed_on_next_receive() {
        let network = SimNetwork::new();
        let (a, b) = pair(&network);
        let b_addr = b.local_addr().unwrap();

        a.send_request(b_addr, &[Bytes::from_static(b"one")], 1).unwrap();
        let first = b.receive_request(&BufferPageSet::new()).unwrap();
        b.release_pages(&first.pages);
        assert_eq!(b.outstanding_pages(), 0);
        assert_eq!(network.pool_usage(b.fd()), Some(1));

        // recycling a page twice is caught before it reaches the kernel
        b.release_pages(&first.pages);

        a.send_request(b_addr, &[Bytes::from_static(b"two")], 2).unwrap();
        let second = b.receive_request(&BufferPageSet::new()).unwrap();
        assert_eq!(second.pages.offsets(), &[0]);
        assert_eq!(network.pool_usage(b.fd()), Some(1));
    }

    #[test]
    fn test_multi_page_message() {
        let network = SimNetwork::new();
        let (a, b) = pair(&network);

        let payload = (0..3 * BPAGE_SIZE + 17).map(|i| (i % 251) as u8).collect::<Vec<_>>();
        a.send_request(b.local_addr().unwrap(), &[Bytes::from(payload.clone())], 0).unwrap();

        let msg = b.receive_any(&BufferPageSet::new()).unwrap();
        assert_eq!(msg.pages.count(), 4);
        assert_eq!(b.read_message(&msg), payload);
        assert_eq!(b.outstanding_pages(), 4);
    }

    #[tokio::test]
    async fn test_async_request_reply() {
        let network = SimNetwork::new();
        let (a, b) = pair(&network);
        let a_addr = a.local_addr().unwrap();
        let b_addr = b.local_addr().unwrap();

        let sent = a.send_request_async(b_addr, vec![Bytes::from_static(b"ping")], 7).await.unwrap();
        let request = b.receive_request_async(&BufferPageSet::new()).await.unwrap();
        assert_eq!(request.id, sent.id ^ 1);
        assert_eq!(request.peer, Some(a_addr));

        b.send_reply_async(a_addr, vec![Bytes::from_static(b"pong")], request.id).await.unwrap();
        let reply = a.receive_reply_async(sent.id, &BufferPageSet::new()).await.unwrap();
        assert_eq!(reply.id, sent.id);
        assert_eq!(reply.completion_cookie, 7);
        assert_eq!(a.region().slice(reply.pages.offsets()[0], reply.bytes_transferred), b"pong");
        assert_eq!(a.outstanding_pages(), 1);
    }

    #[tokio::test]
    async fn test_close_cancels_operations_in_flight() {
        let network = SimNetwork::new();
        let (a, _b) = pair(&network);

        let (handler, results) = collecting_handler();
        a.async_receive_any(&BufferPageSet::new(), handler);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(results.lock().unwrap().is_empty());
        assert_eq!(a.context.in_flight.lock().unwrap().tokens.len(), 1);

        a.close();
        tokio::time::sleep(Duration::from_millis(10)).await;
        {
            let results = results.lock().unwrap();
            assert_eq!(results.len(), 1);
            assert!(matches!(results[0], Err(HomaError::Cancelled)));
        }
        assert!(a.is_closed());
        assert!(a.context.in_flight.lock().unwrap().tokens.is_empty());

        // operations started after closing fail right away
        assert!(matches!(a.receive_any(&BufferPageSet::new()), Err(HomaError::Cancelled)));
        assert!(matches!(a.receive_any_async(&BufferPageSet::new()).await, Err(HomaError::Cancelled)));

        let (handler, results) = collecting_handler();
        a.async_receive_any(&BufferPageSet::new(), handler);
        tokio::time::sleep(Duration::from_millis(10)).await;
        let results = results.lock().unwrap();
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], Err(HomaError::Cancelled)));
    }

    #[tokio::test]
    async fn test_finished_operations_are_deregistered() {
        let network = SimNetwork::new();
        let (a, b) = pair(&network);

        a.send_request_async(b.local_addr().unwrap(), vec![Bytes::from_static(b"x")], 1).await.unwrap();
        b.receive_request_async(&BufferPageSet::new()).await.unwrap();

        let (handler, results) = collecting_handler();
        a.async_send_request(b.local_addr().unwrap(), vec![Bytes::from_static(b"y")], 2, handler);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(results.lock().unwrap()[0].is_ok());

        assert!(a.context.in_flight.lock().unwrap().tokens.is_empty());
        assert!(b.context.in_flight.lock().unwrap().tokens.is_empty());
    }
}
