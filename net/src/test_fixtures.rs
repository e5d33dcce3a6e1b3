//! Shared helpers for the unit tests: a recording IP layer, packet builders
//! and a single-host TCP harness.

#![allow(dead_code)]

use alloc::rc::Rc;
use alloc::vec::Vec;

use crate::config::NetConfig;
use crate::inet::Checksum;
use crate::ip::{IP_HLEN, IpOutput, Ipv4Header, NetIf, write_header};
use crate::pbuf::{BufStore, Pbuf, PbufKind, PbufLayer};
use crate::tcp::{
    RecvVerdict, TCP_HLEN, Tcp, TcpCtx, TcpEvents, TcpFlags, TcpHandle, TcpHeader, TcpPcb,
};
use crate::types::{IpProtocol, Ipv4Addr, NetError, NetResult, Ssid};
use crate::udp::{UDP_HLEN, UdpHeader};

pub const LOCAL: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
pub const PEER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);

pub fn netif() -> NetIf {
    NetIf::new(LOCAL, Ipv4Addr::new(255, 255, 255, 0), PEER)
}

pub fn peer_netif() -> NetIf {
    NetIf::new(PEER, Ipv4Addr::new(255, 255, 255, 0), LOCAL)
}

pub fn store() -> Rc<BufStore> {
    BufStore::new(&NetConfig::small())
}

// =============================================================================
// Recording IP layer
// =============================================================================

/// One packet handed to the IP layer, from its transport header on.
#[derive(Clone, Debug)]
pub struct Sent {
    pub data: Vec<u8>,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub ttl: u8,
    pub proto: IpProtocol,
}

impl Sent {
    pub fn tcp(&self) -> TcpHeader {
        TcpHeader::parse(&self.data).expect("tcp header")
    }

    pub fn tcp_payload(&self) -> &[u8] {
        &self.data[self.tcp().header_len()..]
    }
}

#[derive(Default)]
pub struct RecordingIo {
    pub sent: Vec<Sent>,
    /// Fail every output with this error.
    pub fail: Option<NetError>,
}

impl RecordingIo {
    pub fn take(&mut self) -> Vec<Sent> {
        core::mem::take(&mut self.sent)
    }
}

impl IpOutput for RecordingIo {
    fn ip_output(
        &mut self,
        p: &Pbuf,
        src: Ipv4Addr,
        dst: Ipv4Addr,
        ttl: u8,
        proto: IpProtocol,
    ) -> NetResult {
        if let Some(e) = self.fail {
            return Err(e);
        }
        self.sent.push(Sent {
            data: p.to_vec(),
            src,
            dst,
            ttl,
            proto,
        });
        Ok(())
    }
}

// =============================================================================
// Packet builders
// =============================================================================

/// A received datagram: IPv4 header followed by `payload`, in one RAM
/// buffer.
pub fn ipv4_packet(
    store: &Rc<BufStore>,
    src: Ipv4Addr,
    dst: Ipv4Addr,
    proto: IpProtocol,
    payload: &[u8],
) -> (Pbuf, Ipv4Header) {
    let mut bytes = alloc::vec![0u8; IP_HLEN];
    write_header(&mut bytes, payload.len(), 64, proto, src, dst).expect("ip header");
    bytes.extend_from_slice(payload);
    let iph = Ipv4Header::parse(&bytes).expect("ip parse");
    let p = Pbuf::from_slice(store, PbufLayer::Raw, &bytes, PbufKind::Ram).expect("pbuf");
    (p, iph)
}

fn pseudo_sum(src: Ipv4Addr, dst: Ipv4Addr, proto: IpProtocol, bytes: &[u8]) -> u16 {
    let mut c = Checksum::new();
    c.add_bytes(&src.0);
    c.add_bytes(&dst.0);
    c.add_u16(proto as u16);
    c.add_u16(bytes.len() as u16);
    c.add_bytes(bytes);
    c.finish()
}

/// TCP segment bytes with a valid checksum.
pub fn tcp_bytes(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    hdr: TcpHeader,
    options: &[u8],
    payload: &[u8],
) -> Vec<u8> {
    let mut hdr = hdr;
    hdr.data_offset = (5 + options.len() / 4) as u8;
    hdr.checksum = 0;
    let mut bytes = alloc::vec![0u8; TCP_HLEN];
    hdr.write(&mut bytes);
    bytes.extend_from_slice(options);
    bytes.extend_from_slice(payload);
    let sum = pseudo_sum(src, dst, IpProtocol::Tcp, &bytes);
    bytes[16..18].copy_from_slice(&sum.to_be_bytes());
    bytes
}

/// Build an inbound TCP segment from `src` to `dst`.
pub fn tcp_packet(
    store: &Rc<BufStore>,
    src: Ipv4Addr,
    dst: Ipv4Addr,
    hdr: TcpHeader,
    options: &[u8],
    payload: &[u8],
) -> (Pbuf, Ipv4Header) {
    let bytes = tcp_bytes(src, dst, hdr, options, payload);
    ipv4_packet(store, src, dst, IpProtocol::Tcp, &bytes)
}

/// Header with flags, sequence, acknowledgement and a full window.
pub fn seg(sport: u16, dport: u16, seq: u32, ack: u32, flags: TcpFlags) -> TcpHeader {
    let mut hdr = TcpHeader::new(sport, dport, seq, flags);
    hdr.ack_num = ack;
    hdr.window_size = 8192;
    hdr
}

/// UDP datagram bytes with a valid checksum.
pub fn udp_bytes(src: Ipv4Addr, sport: u16, dst: Ipv4Addr, dport: u16, payload: &[u8]) -> Vec<u8> {
    let mut bytes = alloc::vec![0u8; UDP_HLEN];
    UdpHeader {
        src_port: sport,
        dst_port: dport,
        len: (UDP_HLEN + payload.len()) as u16,
        checksum: 0,
    }
    .write(&mut bytes);
    bytes.extend_from_slice(payload);
    let sum = match pseudo_sum(src, dst, IpProtocol::Udp, &bytes) {
        0 => 0xffff,
        s => s,
    };
    bytes[6..8].copy_from_slice(&sum.to_be_bytes());
    bytes
}

pub fn udp_packet(
    store: &Rc<BufStore>,
    src: Ipv4Addr,
    sport: u16,
    dst: Ipv4Addr,
    dport: u16,
    payload: &[u8],
) -> (Pbuf, Ipv4Header) {
    let bytes = udp_bytes(src, sport, dst, dport, payload);
    ipv4_packet(store, src, dst, IpProtocol::Udp, &bytes)
}

/// Re-deliver a recorded packet as a received datagram.
pub fn replay(store: &Rc<BufStore>, sent: &Sent) -> (Pbuf, Ipv4Header) {
    ipv4_packet(store, sent.src, sent.dst, sent.proto, &sent.data)
}

// =============================================================================
// TCP harness
// =============================================================================

/// Upcalls captured by the harness. Received data is kept as bytes and the
/// window reopened at once.
#[derive(Default)]
pub struct RecordingEvents {
    pub accepted: Vec<TcpHandle>,
    pub connected: Vec<(TcpHandle, NetResult)>,
    pub acked: u32,
    pub received: Vec<u8>,
    pub eof: bool,
    pub errors: Vec<(Option<Ssid>, NetError)>,
    /// Refuse passive opens.
    pub reject: bool,
}

impl TcpEvents for RecordingEvents {
    fn accept(&mut self, h: TcpHandle, _pcb: &mut TcpPcb) -> NetResult {
        if self.reject {
            return Err(NetError::ConnectionAborted);
        }
        self.accepted.push(h);
        Ok(())
    }

    fn connected(&mut self, h: TcpHandle, _pcb: &mut TcpPcb, result: NetResult) {
        self.connected.push((h, result));
    }

    fn sent(&mut self, _h: TcpHandle, _pcb: &mut TcpPcb, len: u32) {
        self.acked += len;
    }

    fn recv(&mut self, _h: TcpHandle, pcb: &mut TcpPcb, data: Option<Pbuf>) -> RecvVerdict {
        match data {
            Some(p) => {
                self.received.extend_from_slice(&p.to_vec());
                let len = p.tot_len();
                p.free();
                pcb.rcv_wnd = pcb.rcv_wnd.saturating_add(len as u16);
                RecvVerdict::Accepted
            }
            None => {
                self.eof = true;
                RecvVerdict::Accepted
            }
        }
    }

    fn err(&mut self, ssid: Option<Ssid>, err: NetError) {
        self.errors.push((ssid, err));
    }
}

/// One TCP engine with its interface, IP layer and upcall recorder.
pub struct Host {
    pub store: Rc<BufStore>,
    pub netif: NetIf,
    pub tcp: Tcp,
    pub io: RecordingIo,
    pub ev: RecordingEvents,
}

impl Host {
    pub fn new(netif: NetIf) -> Self {
        let cfg = NetConfig::small();
        Self::with_config(netif, &cfg)
    }

    pub fn with_config(netif: NetIf, cfg: &NetConfig) -> Self {
        let store = BufStore::new(cfg);
        Self {
            tcp: Tcp::new(cfg, Rc::clone(&store)),
            store,
            netif,
            io: RecordingIo::default(),
            ev: RecordingEvents::default(),
        }
    }

    pub fn run<R>(&mut self, f: impl FnOnce(&mut Tcp, &mut TcpCtx<'_>) -> R) -> R {
        let mut cx = TcpCtx::new(&self.netif, &mut self.io, &mut self.ev);
        f(&mut self.tcp, &mut cx)
    }

    /// Feed a segment built by [`tcp_packet`].
    pub fn input(&mut self, hdr: TcpHeader, options: &[u8], payload: &[u8]) {
        let (p, iph) = tcp_packet(&self.store, PEER, self.netif.ip, hdr, options, payload);
        self.run(|tcp, cx| tcp.input(p, &iph, cx));
    }

    /// Feed a packet recorded on another host.
    pub fn deliver(&mut self, sent: &Sent) {
        let (p, iph) = replay(&self.store, sent);
        self.run(|tcp, cx| tcp.input(p, &iph, cx));
    }

    /// Run the TCP timer `n` times.
    pub fn tmr(&mut self, n: usize) {
        for _ in 0..n {
            self.run(|tcp, cx| tcp.tmr(cx));
        }
    }

    /// Run the slow timer `n` times.
    pub fn slowtmr(&mut self, n: usize) {
        for _ in 0..n {
            self.run(|tcp, cx| tcp.slowtmr(cx));
        }
    }
}

/// Move every packet `from` has sent into `to`, repeatedly, until neither
/// side has anything left to say. Returns the number of packets moved.
pub fn pump(a: &mut Host, b: &mut Host) -> usize {
    let mut moved = 0;
    loop {
        let from_a = a.io.take();
        let from_b = b.io.take();
        if from_a.is_empty() && from_b.is_empty() {
            return moved;
        }
        moved += from_a.len() + from_b.len();
        for s in &from_a {
            b.deliver(s);
        }
        for s in &from_b {
            a.deliver(s);
        }
    }
}
