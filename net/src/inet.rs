//! Internet checksum (RFC 1071) over slices and pbuf chains.

use crate::pbuf::Pbuf;
use crate::types::{IpProtocol, Ipv4Addr};

/// Running one's-complement sum that tolerates odd-length fragments, so a
/// chain can be summed node by node.
#[derive(Clone, Copy, Debug, Default)]
pub struct Checksum {
    sum: u32,
    odd: Option<u8>,
}

impl Checksum {
    pub const fn new() -> Self {
        Self { sum: 0, odd: None }
    }

    pub fn add_bytes(&mut self, mut data: &[u8]) {
        if let Some(hi) = self.odd.take() {
            let Some((&lo, rest)) = data.split_first() else {
                self.odd = Some(hi);
                return;
            };
            self.add_u16(u16::from_be_bytes([hi, lo]));
            data = rest;
        }
        let mut chunks = data.chunks_exact(2);
        for pair in &mut chunks {
            self.add_u16(u16::from_be_bytes([pair[0], pair[1]]));
        }
        if let [last] = chunks.remainder() {
            self.odd = Some(*last);
        }
    }

    #[inline]
    pub fn add_u16(&mut self, word: u16) {
        self.sum = self.sum.wrapping_add(word as u32);
        if self.sum > 0xffff_0000 {
            self.sum = (self.sum & 0xffff) + (self.sum >> 16);
        }
    }

    pub fn add_pbuf(&mut self, p: &Pbuf) {
        p.for_each_payload(|bytes| self.add_bytes(bytes));
    }

    /// Fold and complement.
    pub fn finish(mut self) -> u16 {
        if let Some(hi) = self.odd.take() {
            self.add_u16(u16::from_be_bytes([hi, 0]));
        }
        let mut sum = self.sum;
        while (sum >> 16) != 0 {
            sum = (sum & 0xffff) + (sum >> 16);
        }
        !(sum as u16)
    }
}

pub fn inet_chksum(data: &[u8]) -> u16 {
    let mut c = Checksum::new();
    c.add_bytes(data);
    c.finish()
}

pub fn inet_chksum_pbuf(p: &Pbuf) -> u16 {
    let mut c = Checksum::new();
    c.add_pbuf(p);
    c.finish()
}

/// Checksum over the IPv4 pseudo-header followed by the chain `p`.
pub fn inet_chksum_pseudo(p: &Pbuf, src: Ipv4Addr, dst: Ipv4Addr, proto: IpProtocol, len: usize) -> u16 {
    let mut c = Checksum::new();
    c.add_bytes(&src.0);
    c.add_bytes(&dst.0);
    c.add_u16(proto as u16);
    c.add_u16(len as u16);
    c.add_pbuf(p);
    c.finish()
}
