//! Client and server side plumbing for the Homa transport protocol: sending request and reply
//!  messages through a Homa socket, and receiving them into a buffer region that is shared
//!  with the kernel.
//!
//! Homa is a message-oriented, connectionless transport designed for low-latency RPC inside a
//!  data center. The protocol itself (packets, grants, retransmission, congestion control) is
//!  implemented in a Linux kernel module; this crate wraps the socket interface the module
//!  exposes.
//!
//! ## RPC model
//!
//! * A client sends a *request* with id 0; the kernel assigns an RPC id and returns it.
//!   Together with the request, the client passes a *completion cookie*, an opaque `u64` that
//!   is handed back with the matching reply.
//! * The server receives the request with the same id, except that the low-order bit is set
//!   (that bit distinguishes the server's side of an RPC from the client's). It sends the reply
//!   on the id it received.
//! * The client receives the reply with its original id and its completion cookie.
//! * There is no connection setup; every request / reply pair stands on its own.
//!
//! ## Buffer pool
//!
//! Every socket registers a memory region with the kernel. The region is divided into pool
//!  pages of [config::BPAGE_SIZE] bytes, and received messages are placed directly into pool
//!  pages by the kernel:
//!
//! ```ascii
//!  region start (aligned to BPAGE_SIZE)
//!  |
//!  v
//!  +----------+----------+----------+----------+-----
//!  |  page 0  |  page 1  |  page 2  |  page 3  |  ...
//!  +----------+----------+----------+----------+-----
//!       ^                     ^          ^
//!       |                     |          |
//!       msg A (1 page)        msg B (2 pages)
//! ```
//!
//! A receive returns the message's pages as a list of byte offsets into the region
//!  ([buffer_pages::BufferPageSet]). From then on the application owns these pages, and the
//!  kernel does not touch them until the application passes them back as 'recycle' pages with
//!  a later receive call on the same socket. A message of maximum length
//!  ([config::MAX_MESSAGE_LENGTH]) occupies [config::MAX_BPAGES] pages.
//!
//! NB: Pages that are never recycled are lost to the kernel. Once all pages are owned by the
//!      application, receives fail with [error::HomaError::ResourceExhausted].
//!
//! ## Control block
//!
//! Metadata travels in a control block passed with `recvmsg` (native byte order):
//!
//! ```ascii
//!   0: id (u64) - in: the reply to wait for or 0; out: the received message's id
//!   8: completion cookie (u64) - out only, 0 for requests
//!  16: flags (i32) - in only: REQUEST, RESPONSE, NONBLOCKING
//!  20: peer address (28 bytes, sockaddr_in or sockaddr_in6) - out only
//!  48: number of pages (u32) - in: pages to recycle; out: pages holding the message
//!  52: padding (u32)
//!  56: page offsets (MAX_BPAGES x u32)
//! ```
//!
//! `sendmsg` passes a smaller block with the RPC id (0 for a new request, written back by the
//!  kernel) and the completion cookie.
//!
//! ## Layers
//!
//! * [transport::HomaTransport] - exactly one kernel interaction per call, with error
//!    classification
//! * [retry] - single non-blocking attempts, retrying interrupted system calls
//! * [blocking] - synchronous calls that wait for readiness on the calling thread
//! * [operation] and [reactor] - asynchronous operations with exactly-once completion
//! * [socket::HomaSocket] - opens and configures sockets, and keeps track of page ownership
//!
//! The kernel-facing system calls are behind the [homa_sys::HomaSys] trait, which is
//!  implemented for the Linux kernel module ([homa_sys::LinuxHoma]) and for an in-process
//!  simulation ([sim::SimNetwork]) that is used for testing, and when the kernel module is not
//!  available.
//!
//! ## Related:
//! * Homa paper: J. Ousterhout et al., 'Homa: A Receiver-Driven Low-Latency Transport Protocol
//!    Using Network Priorities', SIGCOMM 2018
//! * eRPC - user space RPC over UDP / RDMA, similar request / reply model
//! * io_uring provided buffers - the same 'kernel picks the buffer' approach for regular sockets

pub mod config;
pub mod error;
pub mod buffer_pages;
pub mod control_messages;
pub mod buffer_region;
pub mod page_ledger;
pub mod homa_sys;
pub mod transport;
pub mod retry;
pub mod blocking;
pub mod operation;
pub mod reactor;
pub mod sim;
pub mod socket;
