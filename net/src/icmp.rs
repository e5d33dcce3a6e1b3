//! ICMP: answering echo requests, reporting echo replies to the session
//! layer, generating echo requests and destination-unreachable messages.

use alloc::rc::Rc;
use alloc::vec::Vec;

use netsys_lib::{klog_debug, klog_trace};

use crate::config::{ICMP_ECHO_PAYLOAD, ICMP_TTL};
use crate::inet::inet_chksum;
use crate::ip::{IpOutput, Ipv4Header, NetIf};
use crate::pbuf::{BufStore, Pbuf, PbufKind, PbufLayer};
use crate::types::{IpProtocol, Ipv4Addr, NetError, NetResult};

pub const ICMP_ER: u8 = 0;
pub const ICMP_DUR: u8 = 3;
pub const ICMP_ECHO: u8 = 8;
pub const ICMP_TE: u8 = 11;

/// Echo and destination-unreachable headers are both 8 bytes.
pub const ICMP_HLEN: usize = 8;

/// Destination unreachable codes.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DestUnreach {
    Net = 0,
    Host = 1,
    Proto = 2,
    Port = 3,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EchoHeader {
    pub kind: u8,
    pub code: u8,
    pub checksum: u16,
    pub id: u16,
    pub seqno: u16,
}

impl EchoHeader {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < ICMP_HLEN {
            return None;
        }
        Some(Self {
            kind: data[0],
            code: data[1],
            checksum: u16::from_be_bytes([data[2], data[3]]),
            id: u16::from_be_bytes([data[4], data[5]]),
            seqno: u16::from_be_bytes([data[6], data[7]]),
        })
    }

    pub fn write(&self, out: &mut [u8]) -> Option<usize> {
        if out.len() < ICMP_HLEN {
            return None;
        }
        out[0] = self.kind;
        out[1] = self.code;
        out[2..4].copy_from_slice(&self.checksum.to_be_bytes());
        out[4..6].copy_from_slice(&self.id.to_be_bytes());
        out[6..8].copy_from_slice(&self.seqno.to_be_bytes());
        Some(ICMP_HLEN)
    }
}

/// Put a valid checksum into an ICMP message in place.
fn seal(msg: &mut [u8]) {
    msg[2] = 0;
    msg[3] = 0;
    let sum = inet_chksum(msg);
    msg[2..4].copy_from_slice(&sum.to_be_bytes());
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IcmpInput {
    /// An echo request was answered.
    Answered,
    /// An echo reply carrying this identifier arrived.
    EchoReply(u16),
    /// Malformed, bad checksum, or a type we do not handle.
    Ignored,
}

pub struct Icmp {
    store: Rc<BufStore>,
    seqno: u16,
}

impl Icmp {
    pub fn new(store: Rc<BufStore>) -> Self {
        Self { store, seqno: 0 }
    }

    fn send(
        &self,
        msg: &[u8],
        src: Ipv4Addr,
        dst: Ipv4Addr,
        io: &mut dyn IpOutput,
    ) -> NetResult {
        let p = Pbuf::from_slice(&self.store, PbufLayer::Ip, msg, PbufKind::Ram)
            .ok_or(NetError::NoBufs)?;
        let res = io.ip_output(&p, src, dst, ICMP_TTL, IpProtocol::Icmp);
        p.free();
        res
    }

    /// Handle an inbound ICMP message. `p` starts at the IPv4 header and is
    /// consumed.
    pub fn input(
        &mut self,
        p: Pbuf,
        iph: &Ipv4Header,
        netif: &NetIf,
        io: &mut dyn IpOutput,
    ) -> IcmpInput {
        if p.header(-(iph.header_len as isize)).is_err() || p.tot_len() < ICMP_HLEN {
            klog_debug!("icmp: short message from {}", iph.src);
            p.free();
            return IcmpInput::Ignored;
        }
        let mut msg = p.to_vec();
        p.free();

        match msg[0] {
            ICMP_ECHO => {
                if inet_chksum(&msg) != 0 {
                    klog_debug!("icmp: bad echo checksum from {}", iph.src);
                    return IcmpInput::Ignored;
                }
                msg[0] = ICMP_ER;
                seal(&mut msg);
                let src = if netif.is_broadcast(iph.dst) || iph.dst.is_multicast() {
                    netif.ip
                } else {
                    iph.dst
                };
                if let Err(e) = self.send(&msg, src, iph.src, io) {
                    klog_debug!("icmp: echo reply to {} failed: {}", iph.src, e);
                }
                IcmpInput::Answered
            }
            ICMP_ER => match EchoHeader::parse(&msg) {
                Some(hdr) => {
                    klog_trace!("icmp: echo reply id={} seq={}", hdr.id, hdr.seqno);
                    IcmpInput::EchoReply(hdr.id)
                }
                None => IcmpInput::Ignored,
            },
            kind => {
                klog_trace!("icmp: ignoring type={} from {}", kind, iph.src);
                IcmpInput::Ignored
            }
        }
    }

    /// Send an echo request with identifier `id` and a counting pattern
    /// payload.
    pub fn echo_output(
        &mut self,
        id: u16,
        dst: Ipv4Addr,
        netif: &NetIf,
        io: &mut dyn IpOutput,
    ) -> NetResult {
        let mut msg = Vec::with_capacity(ICMP_HLEN + ICMP_ECHO_PAYLOAD);
        msg.resize(ICMP_HLEN, 0);
        EchoHeader {
            kind: ICMP_ECHO,
            code: 0,
            checksum: 0,
            id,
            seqno: self.seqno,
        }
        .write(&mut msg);
        msg.extend((0..ICMP_ECHO_PAYLOAD).map(|i| i as u8));
        seal(&mut msg);
        self.seqno = self.seqno.wrapping_add(1);
        self.send(&msg, netif.ip, dst, io)
    }

    /// Send a caller-built ICMP message as is.
    pub fn raw_output(
        &self,
        msg: &[u8],
        dst: Ipv4Addr,
        netif: &NetIf,
        io: &mut dyn IpOutput,
    ) -> NetResult {
        if msg.len() < ICMP_HLEN {
            return Err(NetError::InvalidArgument);
        }
        self.send(msg, netif.ip, dst, io)
    }

    /// Report an undeliverable datagram to its sender. `orig` is the
    /// datagram from its IPv4 header on; its header and the first 8 bytes
    /// of payload are quoted.
    pub fn dest_unreach(
        &self,
        orig: &[u8],
        iph: &Ipv4Header,
        code: DestUnreach,
        netif: &NetIf,
        io: &mut dyn IpOutput,
    ) -> NetResult {
        let quote = orig.len().min(iph.header_len + 8);
        let mut msg = Vec::with_capacity(ICMP_HLEN + quote);
        msg.extend_from_slice(&[ICMP_DUR, code as u8, 0, 0, 0, 0, 0, 0]);
        msg.extend_from_slice(&orig[..quote]);
        seal(&mut msg);
        klog_debug!("icmp: unreachable code={:?} to {}", code, iph.src);
        self.send(&msg, netif.ip, iph.src, io)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetConfig;
    use crate::test_fixtures::{RecordingIo, ipv4_packet, netif};

    #[test]
    fn test_echo_request_is_answered() {
        let store = BufStore::new(&NetConfig::small());
        let mut icmp = Icmp::new(Rc::clone(&store));
        let mut io = RecordingIo::default();
        let nif = netif();
        let peer = Ipv4Addr::new(10, 0, 0, 1);

        let mut req = alloc::vec![ICMP_ECHO, 0, 0, 0, 0x12, 0x34, 0, 7, b'p', b'i', b'n', b'g'];
        seal(&mut req);
        let (p, iph) = ipv4_packet(&store, peer, nif.ip, IpProtocol::Icmp, &req);

        assert_eq!(icmp.input(p, &iph, &nif, &mut io), IcmpInput::Answered);
        assert_eq!(io.sent.len(), 1);
        let out = &io.sent[0];
        assert_eq!(out.src, nif.ip);
        assert_eq!(out.dst, peer);
        assert_eq!(out.data[0], ICMP_ER);
        assert_eq!(&out.data[4..], &req[4..]);
        assert_eq!(inet_chksum(&out.data), 0);
        assert!(store.is_idle());
    }

    #[test]
    fn test_corrupt_echo_is_ignored() {
        let store = BufStore::new(&NetConfig::small());
        let mut icmp = Icmp::new(Rc::clone(&store));
        let mut io = RecordingIo::default();
        let nif = netif();
        let mut req = alloc::vec![ICMP_ECHO, 0, 0, 0, 0, 1, 0, 1];
        seal(&mut req);
        req[7] ^= 0xff;
        let (p, iph) = ipv4_packet(&store, Ipv4Addr::new(10, 0, 0, 1), nif.ip, IpProtocol::Icmp, &req);
        assert_eq!(icmp.input(p, &iph, &nif, &mut io), IcmpInput::Ignored);
        assert!(io.sent.is_empty());
    }

    #[test]
    fn test_echo_output_counts_sequence() {
        let store = BufStore::new(&NetConfig::small());
        let mut icmp = Icmp::new(store);
        let mut io = RecordingIo::default();
        let nif = netif();
        let dst = Ipv4Addr::new(10, 0, 0, 1);
        icmp.echo_output(5, dst, &nif, &mut io).unwrap();
        icmp.echo_output(5, dst, &nif, &mut io).unwrap();

        let first = EchoHeader::parse(&io.sent[0].data).unwrap();
        let second = EchoHeader::parse(&io.sent[1].data).unwrap();
        assert_eq!(first.kind, ICMP_ECHO);
        assert_eq!(first.id, 5);
        assert_eq!(second.seqno, first.seqno.wrapping_add(1));
        assert_eq!(io.sent[0].data.len(), ICMP_HLEN + ICMP_ECHO_PAYLOAD);
        assert_eq!(io.sent[0].data[ICMP_HLEN + 49], 49);
        assert_eq!(inet_chksum(&io.sent[0].data), 0);
    }

    #[test]
    fn test_dest_unreach_quotes_header_and_eight_bytes() {
        let store = BufStore::new(&NetConfig::small());
        let icmp = Icmp::new(Rc::clone(&store));
        let mut io = RecordingIo::default();
        let nif = netif();
        let payload = [0xaau8; 30];
        let (p, iph) = ipv4_packet(&store, Ipv4Addr::new(10, 0, 0, 1), nif.ip, IpProtocol::Udp, &payload);
        let orig = p.to_vec();
        icmp.dest_unreach(&orig, &iph, DestUnreach::Port, &nif, &mut io).unwrap();
        let msg = &io.sent[0].data;
        assert_eq!(msg[0], ICMP_DUR);
        assert_eq!(msg[1], 3);
        assert_eq!(msg.len(), ICMP_HLEN + 28);
        assert_eq!(&msg[ICMP_HLEN..], &orig[..28]);
    }
}
