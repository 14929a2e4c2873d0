//! Control blocks exchanged with the kernel transport through `msg_control` of `sendmsg` /
//!  `recvmsg`, and the argument of the buffer registration socket option.
//!
//! These are fixed-layout records shared with the kernel, so their byte layout must match the
//!  kernel's definition exactly. All numbers are in native byte order.
//!
//! Receive control block (120 bytes):
//! ```ascii
//!   0: id (u64) - in: RPC id to wait for, 0 for 'any'. out: id of the received message
//!   8: completion cookie (u64) - out: the cookie passed when the request was sent, for
//!       responses only
//!  16: flags (i32) - in: REQUEST / RESPONSE / NONBLOCKING. out: kind of the received message
//!  20: peer address (28 bytes) - sockaddr_in or sockaddr_in6
//!  48: number of pages (u32) - in: number of pages returned to the pool. out: number of
//!       pages holding the received message
//!  52: padding (u32)
//!  56: page offsets (u32 * MAX_BPAGES)
//! ```

use std::mem::size_of;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use bytes::{Buf, BufMut, BytesMut};
use crate::buffer_pages::BufferPageSet;
use crate::config::MAX_BPAGES;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RecvFlags: i32 {
        const REQUEST = 0x01;
        const RESPONSE = 0x02;
        const NONBLOCKING = 0x04;
    }
}

impl RecvFlags {
    /// Accept both requests and responses
    pub const ANY: RecvFlags = RecvFlags::REQUEST.union(RecvFlags::RESPONSE);
}

const SOCKADDR_LEN: usize = 28;

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct HomaRecvmsgArgs {
    pub id: u64,
    pub completion_cookie: u64,
    pub flags: i32,
    pub peer_addr: [u8; SOCKADDR_LEN],
    pub num_bpages: u32,
    pub _pad: u32,
    pub bpage_offsets: [u32; MAX_BPAGES],
}

const _: () = assert!(size_of::<HomaRecvmsgArgs>() == 120);
const _: () = assert!(size_of::<libc::sockaddr_in6>() == SOCKADDR_LEN);

impl HomaRecvmsgArgs {
    pub const SERIALIZED_LEN: usize = size_of::<HomaRecvmsgArgs>();

    /// Set up the control block for a receive call
    pub fn for_receive(want_id: u64, flags: RecvFlags, recycle: &BufferPageSet) -> HomaRecvmsgArgs {
        let mut result = HomaRecvmsgArgs::zeroed();
        result.id = want_id;
        result.flags = flags.bits();
        result.set_pages(recycle);
        result
    }

    pub fn recv_flags(&self) -> RecvFlags {
        RecvFlags::from_bits_truncate(self.flags)
    }

    pub fn pages(&self) -> BufferPageSet {
        let count = (self.num_bpages as usize).min(MAX_BPAGES);
        BufferPageSet::from_offsets(&self.bpage_offsets[..count])
    }

    pub fn set_pages(&mut self, pages: &BufferPageSet) {
        self.num_bpages = pages.count();
        self.bpage_offsets = [0; MAX_BPAGES];
        self.bpage_offsets[..pages.offsets().len()].copy_from_slice(pages.offsets());
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        decode_sockaddr(&self.peer_addr)
    }

    pub fn set_peer_addr(&mut self, addr: SocketAddr) {
        self.peer_addr = encode_sockaddr(addr);
    }

    /// fill in the result of a receive - this is what the kernel does on a successful recvmsg
    pub fn fill_received(&mut self, id: u64, completion_cookie: u64, flags: RecvFlags, peer: SocketAddr, pages: &BufferPageSet) {
        *self = HomaRecvmsgArgs::zeroed();
        self.id = id;
        self.completion_cookie = completion_cookie;
        self.flags = flags.bits();
        self.set_peer_addr(peer);
        self.set_pages(pages);
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_slice(bytemuck::bytes_of(self));
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<HomaRecvmsgArgs> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            anyhow::bail!("receive control block requires {} bytes, got {}", Self::SERIALIZED_LEN, buf.remaining());
        }
        let mut raw = [0u8; Self::SERIALIZED_LEN];
        buf.copy_to_slice(&mut raw);
        Ok(bytemuck::pod_read_unaligned(&raw))
    }
}

/// Control block for `sendmsg`: an id of 0 sends a new request (the kernel assigns the id
///  and writes it back), a non-zero id sends the reply to the request with that id
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct HomaSendmsgArgs {
    pub id: u64,
    pub completion_cookie: u64,
}

const _: () = assert!(size_of::<HomaSendmsgArgs>() == 16);

/// Argument of the `SO_HOMA_SET_BUF` socket option
#[repr(C)]
#[derive(Debug)]
pub struct HomaSetBufArgs {
    pub start: *mut libc::c_void,
    pub length: libc::size_t,
}

pub fn encode_sockaddr(addr: SocketAddr) -> [u8; SOCKADDR_LEN] {
    let mut raw = [0u8; SOCKADDR_LEN];
    match addr {
        SocketAddr::V4(addr) => {
            let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
            sa.sin_family = libc::AF_INET as libc::sa_family_t;
            sa.sin_port = addr.port().to_be();
            sa.sin_addr.s_addr = u32::from(*addr.ip()).to_be();
            raw[..size_of::<libc::sockaddr_in>()].copy_from_slice(unsafe { as_bytes(&sa) });
        }
        SocketAddr::V6(addr) => {
            let mut sa: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
            sa.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sa.sin6_port = addr.port().to_be();
            sa.sin6_flowinfo = addr.flowinfo();
            sa.sin6_addr.s6_addr = addr.ip().octets();
            sa.sin6_scope_id = addr.scope_id();
            raw.copy_from_slice(unsafe { as_bytes(&sa) });
        }
    }
    raw
}

pub fn decode_sockaddr(raw: &[u8; SOCKADDR_LEN]) -> Option<SocketAddr> {
    let family = libc::sa_family_t::from_ne_bytes([raw[0], raw[1]]);
    match family as libc::c_int {
        libc::AF_INET => {
            let sa = unsafe { std::ptr::read_unaligned(raw.as_ptr() as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr));
            Some(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sa.sin_port))))
        }
        libc::AF_INET6 => {
            let sa = unsafe { std::ptr::read_unaligned(raw.as_ptr() as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sa.sin6_addr.s6_addr);
            Some(SocketAddr::V6(SocketAddrV6::new(ip, u16::from_be(sa.sin6_port), sa.sin6_flowinfo, sa.sin6_scope_id)))
        }
        _ => None,
    }
}

/// SAFETY: only for plain C structs without padding-dependent invariants
unsafe fn as_bytes<T>(value: &T) -> &[u8] {
    std::slice::from_raw_parts(value as *const T as *const u8, size_of::<T>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_recvmsg_args_size() {
        assert_eq!(size_of::<HomaRecvmsgArgs>(), 120);
        assert_eq!(HomaRecvmsgArgs::SERIALIZED_LEN, 120);

        let mut buf = BytesMut::new();
        HomaRecvmsgArgs::zeroed().ser(&mut buf);
        assert_eq!(buf.len(), 120);
    }

    #[test]
    fn test_field_offsets() {
        let mut args = HomaRecvmsgArgs::zeroed();
        args.id = 0x0102030405060708;
        args.completion_cookie = 111;
        args.flags = RecvFlags::RESPONSE.bits();
        args.num_bpages = 2;
        args.bpage_offsets[0] = 65536;
        args.bpage_offsets[MAX_BPAGES - 1] = 7;

        let mut buf = BytesMut::new();
        args.ser(&mut buf);

        assert_eq!(&buf[0..8], &0x0102030405060708u64.to_ne_bytes());
        assert_eq!(&buf[8..16], &111u64.to_ne_bytes());
        assert_eq!(&buf[16..20], &2i32.to_ne_bytes());
        assert_eq!(&buf[48..52], &2u32.to_ne_bytes());
        assert_eq!(&buf[56..60], &65536u32.to_ne_bytes());
        assert_eq!(&buf[116..120], &7u32.to_ne_bytes());
    }

    #[test]
    fn test_ser_deser() {
        let mut args = HomaRecvmsgArgs::for_receive(17, RecvFlags::REQUEST | RecvFlags::NONBLOCKING, &BufferPageSet::from_offsets(&[0, 131072]));
        args.set_peer_addr(SocketAddr::from(([127, 0, 0, 1], 4000)));

        let mut buf = BytesMut::new();
        args.ser(&mut buf);
        let mut b: &[u8] = &buf;
        let deser = HomaRecvmsgArgs::deser(&mut b).unwrap();
        assert!(b.is_empty());
        assert_eq!(deser, args);
        assert_eq!(deser.pages().offsets(), &[0, 131072]);
        assert_eq!(deser.recv_flags(), RecvFlags::REQUEST | RecvFlags::NONBLOCKING);
    }

    #[test]
    fn test_deser_too_short() {
        let mut b: &[u8] = &[0u8; 119];
        assert!(HomaRecvmsgArgs::deser(&mut b).is_err());
    }

    #[test]
    fn test_pages_clamps_corrupt_count() {
        let mut args = HomaRecvmsgArgs::zeroed();
        args.num_bpages = 1000;
        assert_eq!(args.pages().count() as usize, MAX_BPAGES);
    }

    #[rstest]
    #[case::v4_loopback(SocketAddr::from(([127, 0, 0, 1], 4000)))]
    #[case::v4_any(SocketAddr::from(([0, 0, 0, 0], 0)))]
    #[case::v6_loopback(SocketAddr::from((Ipv6Addr::LOCALHOST, 65535)))]
    #[case::v6_scoped(SocketAddr::V6(SocketAddrV6::new("fe80::1".parse().unwrap(), 99, 5, 3)))]
    fn test_sockaddr(#[case] addr: SocketAddr) {
        let raw = encode_sockaddr(addr);
        assert_eq!(decode_sockaddr(&raw), Some(addr));
    }

    #[test]
    fn test_sockaddr_unknown_family() {
        assert_eq!(decode_sockaddr(&[0u8; SOCKADDR_LEN]), None);
    }

    #[test]
    fn test_flags() {
        assert_eq!(RecvFlags::REQUEST.bits(), 1);
        assert_eq!(RecvFlags::RESPONSE.bits(), 2);
        assert_eq!(RecvFlags::NONBLOCKING.bits(), 4);
        assert_eq!(RecvFlags::ANY.bits(), 3);
    }
}
