use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use bytes::Bytes;
use tracing::{debug, span, trace, warn, Level};
use uuid::Uuid;
use crate::buffer_pages::BufferPageSet;
use crate::control_messages::RecvFlags;
use crate::error::HomaError;
use crate::homa_sys::Interest;
use crate::retry::{non_blocking_recv, non_blocking_send, Attempt, RecvRequest, SendRequest};
use crate::transport::HomaTransport;

/// The four kinds of asynchronous operation. They share a single [PendingOperation::step]
///  which dispatches on the kind.
#[derive(Debug, Clone)]
pub enum OperationKind {
    SendRequest(SendRequest),
    SendReply(SendRequest),
    ReceiveAny(RecvRequest),
    /// receive a request, or the reply with a given id
    ReceiveFiltered(RecvRequest),
}

impl OperationKind {
    pub fn send_request(dest: SocketAddr, fragments: Vec<Bytes>, completion_cookie: u64) -> OperationKind {
        OperationKind::SendRequest(SendRequest::request(dest, fragments, completion_cookie))
    }

    pub fn send_reply(dest: SocketAddr, fragments: Vec<Bytes>, id: u64) -> OperationKind {
        OperationKind::SendReply(SendRequest::reply(dest, fragments, id))
    }

    pub fn receive_any(recycle: BufferPageSet) -> OperationKind {
        OperationKind::ReceiveAny(RecvRequest::new(0, RecvFlags::ANY, recycle))
    }

    pub fn receive_request(recycle: BufferPageSet) -> OperationKind {
        OperationKind::ReceiveFiltered(RecvRequest::new(0, RecvFlags::REQUEST, recycle))
    }

    /// `id` 0 accepts any reply
    pub fn receive_reply(id: u64, recycle: BufferPageSet) -> OperationKind {
        OperationKind::ReceiveFiltered(RecvRequest::new(id, RecvFlags::RESPONSE, recycle))
    }

    pub fn interest(&self) -> Interest {
        match self {
            OperationKind::SendRequest(_) | OperationKind::SendReply(_) => Interest::Writable,
            OperationKind::ReceiveAny(_) | OperationKind::ReceiveFiltered(_) => Interest::Readable,
        }
    }

    /// Take the pages a receive was supposed to recycle but has not handed to the kernel yet
    pub fn take_unsubmitted_pages(&mut self) -> BufferPageSet {
        match self {
            OperationKind::SendRequest(_) | OperationKind::SendReply(_) => BufferPageSet::new(),
            OperationKind::ReceiveAny(request) | OperationKind::ReceiveFiltered(request) => std::mem::take(&mut request.recycle),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            OperationKind::SendRequest(_) => "send_request",
            OperationKind::SendReply(_) => "send_reply",
            OperationKind::ReceiveAny(_) => "receive_any",
            OperationKind::ReceiveFiltered(_) => "receive_filtered",
        }
    }
}

/// The result of a completed operation. For sends, `pages` is empty and `peer` is the
///  destination; for receives, everything describes the received message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationOutput {
    pub bytes_transferred: usize,
    pub id: u64,
    pub completion_cookie: u64,
    pub peer: Option<SocketAddr>,
    pub pages: BufferPageSet,
}

pub type CompletionHandler = Box<dyn FnOnce(Result<OperationOutput, HomaError>) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Pending,
    Attempting,
    Done,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Done,
    /// The socket was not ready; wait for readiness and step again
    NotDone,
}

/// An asynchronous send or receive, driven by a reactor calling [PendingOperation::step] on
///  readiness, and finished by [PendingOperation::complete] or [PendingOperation::cancel].
///
/// The completion handler is invoked exactly once over the operation's lifetime: with the
///  result on completion, with [HomaError::Cancelled] on cancellation, or with
///  [HomaError::Cancelled] when the operation is dropped unfinished.
pub struct PendingOperation {
    correlation_id: Uuid,
    kind: OperationKind,
    state: OperationState,
    result: Option<Result<OperationOutput, HomaError>>,
    handler: Option<CompletionHandler>,
    completed: bool,
}

impl Debug for PendingOperation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingOperation")
            .field("correlation_id", &self.correlation_id)
            .field("kind", &self.kind.name())
            .field("state", &self.state)
            .field("completed", &self.completed)
            .finish()
    }
}

impl PendingOperation {
    pub fn new(kind: OperationKind, handler: CompletionHandler) -> PendingOperation {
        PendingOperation {
            correlation_id: Uuid::new_v4(),
            kind,
            state: OperationState::Pending,
            result: None,
            handler: Some(handler),
            completed: false,
        }
    }

    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    pub fn state(&self) -> OperationState {
        self.state
    }

    pub fn interest(&self) -> Interest {
        self.kind.interest()
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn take_unsubmitted_pages(&mut self) -> BufferPageSet {
        self.kind.take_unsubmitted_pages()
    }

    /// Make a single non-blocking attempt. Once the operation is done or cancelled, this does
    ///  not touch the socket any more and just reports [Status::Done].
    pub fn step(&mut self, transport: &HomaTransport) -> Status {
        match self.state {
            OperationState::Done | OperationState::Cancelled => return Status::Done,
            OperationState::Pending | OperationState::Attempting => {}
        }

        let correlation_id = self.correlation_id;
        let span = span!(Level::TRACE, "homa_operation", ?correlation_id, kind = self.kind.name());
        let _entered = span.enter();

        self.state = OperationState::Attempting;
        let attempt = match &mut self.kind {
            OperationKind::SendRequest(request) | OperationKind::SendReply(request) => {
                let dest = request.dest;
                let completion_cookie = request.completion_cookie;
                non_blocking_send(transport, request)
                    .map(|c| OperationOutput {
                        bytes_transferred: c.bytes_sent,
                        id: c.id,
                        completion_cookie,
                        peer: Some(dest),
                        pages: BufferPageSet::new(),
                    })
            }
            OperationKind::ReceiveAny(request) | OperationKind::ReceiveFiltered(request) => {
                non_blocking_recv(transport, request)
                    .map(|r| OperationOutput {
                        bytes_transferred: r.len,
                        id: r.id,
                        completion_cookie: r.completion_cookie,
                        peer: r.peer,
                        pages: r.pages,
                    })
            }
        };

        match attempt {
            Attempt::Completed(output) => {
                trace!("operation completed: {:?}", output);
                self.result = Some(Ok(output));
                self.state = OperationState::Done;
                Status::Done
            }
            Attempt::Failed(e) => {
                debug!("operation failed: {}", e);
                self.result = Some(Err(e));
                self.state = OperationState::Done;
                Status::Done
            }
            Attempt::WouldBlock => {
                trace!("operation not ready");
                Status::NotDone
            }
        }
    }

    /// Invoke the completion handler with the operation's result
    pub fn complete(mut self) {
        let result = match self.result.take() {
            Some(result) => result,
            None => {
                warn!("operation {} completed before it was done - reporting it as cancelled", self.correlation_id);
                Err(HomaError::Cancelled)
            }
        };
        self.deliver(result);
    }

    /// Abandon the operation without further calls to the socket, invoking the completion
    ///  handler with [HomaError::Cancelled]
    pub fn cancel(mut self) {
        debug!("cancelling operation {}", self.correlation_id);
        self.state = OperationState::Cancelled;
        self.deliver(Err(HomaError::Cancelled));
    }

    /// Finish the operation with an error that did not come from an attempt, e.g. a failure
    ///  while waiting for readiness
    pub(crate) fn fail(mut self, e: HomaError) {
        self.state = OperationState::Done;
        self.deliver(Err(e));
    }

    fn deliver(&mut self, result: Result<OperationOutput, HomaError>) {
        if self.completed {
            return;
        }
        self.completed = true;
        if let Some(handler) = self.handler.take() {
            handler(result);
        }
    }
}

impl Drop for PendingOperation {
    fn drop(&mut self) {
        if !self.completed {
            debug!("operation {} dropped before completion", self.correlation_id);
            self.state = OperationState::Cancelled;
            self.deliver(Err(HomaError::Cancelled));
        }
    }
}
