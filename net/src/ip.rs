//! The seam to the IP layer.
//!
//! The protocol engine does not route or fragment. Outbound packets leave
//! through an [`IpOutput`] implementation supplied by the host; inbound
//! datagrams arrive with their IPv4 header in place and are described by
//! an [`Ipv4Header`] view.

use crate::inet::inet_chksum;
use crate::pbuf::Pbuf;
use crate::types::{IpProtocol, Ipv4Addr, NetResult};

pub const IP_HLEN: usize = 20;

/// Addresses of the single network interface the engine serves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NetIf {
    pub ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gw: Ipv4Addr,
}

impl NetIf {
    pub const fn new(ip: Ipv4Addr, netmask: Ipv4Addr, gw: Ipv4Addr) -> Self {
        Self { ip, netmask, gw }
    }

    /// `true` if `addr` is a broadcast address on this interface's subnet.
    pub fn is_broadcast(&self, addr: Ipv4Addr) -> bool {
        addr.is_broadcast_on(self.ip, self.netmask)
    }
}

/// Outbound IP layer.
///
/// `p` starts at the transport header; the implementation prepends the IP
/// header (the buffers are allocated with room for it) and transmits.
pub trait IpOutput {
    fn ip_output(
        &mut self,
        p: &Pbuf,
        src: Ipv4Addr,
        dst: Ipv4Addr,
        ttl: u8,
        proto: IpProtocol,
    ) -> NetResult;
}

/// Hand `p` to `io` and put its payload cursor back afterwards, so a queued
/// segment still starts at its transport header on retransmission.
pub fn ip_output_keep(
    io: &mut dyn IpOutput,
    p: &Pbuf,
    src: Ipv4Addr,
    dst: Ipv4Addr,
    ttl: u8,
    proto: IpProtocol,
) -> NetResult {
    let before = p.len();
    let res = io.ip_output(p, src, dst, ttl, proto);
    let grown = p.len().saturating_sub(before);
    if grown > 0 {
        let _ = p.header(-(grown as isize));
    }
    res
}

/// Parsed IPv4 header. Multi-byte fields are in host order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ipv4Header {
    /// Header length in bytes (IHL * 4).
    pub header_len: usize,
    pub total_len: usize,
    pub ttl: u8,
    pub proto: u8,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

impl Ipv4Header {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < IP_HLEN || data[0] >> 4 != 4 {
            return None;
        }
        let header_len = ((data[0] & 0x0f) as usize) * 4;
        if header_len < IP_HLEN || data.len() < header_len {
            return None;
        }
        let total_len = u16::from_be_bytes([data[2], data[3]]) as usize;
        if total_len < header_len {
            return None;
        }
        Some(Self {
            header_len,
            total_len,
            ttl: data[8],
            proto: data[9],
            src: Ipv4Addr([data[12], data[13], data[14], data[15]]),
            dst: Ipv4Addr([data[16], data[17], data[18], data[19]]),
        })
    }
}

/// Write a 20-byte IPv4 header (no options, DF clear) with a valid checksum.
pub fn write_header(
    out: &mut [u8],
    payload_len: usize,
    ttl: u8,
    proto: IpProtocol,
    src: Ipv4Addr,
    dst: Ipv4Addr,
) -> Option<usize> {
    if out.len() < IP_HLEN {
        return None;
    }
    let total = (IP_HLEN + payload_len) as u16;
    out[0] = 0x45;
    out[1] = 0;
    out[2..4].copy_from_slice(&total.to_be_bytes());
    out[4..8].fill(0);
    out[8] = ttl;
    out[9] = proto as u8;
    out[10..12].fill(0);
    out[12..16].copy_from_slice(&src.0);
    out[16..20].copy_from_slice(&dst.0);
    let sum = inet_chksum(&out[..IP_HLEN]);
    out[10..12].copy_from_slice(&sum.to_be_bytes());
    Some(IP_HLEN)
}
