//! UDP protocol control blocks: binding, connecting, sending and inbound
//! demultiplexing.
//!
//! A PCB holds at most one undelivered datagram; the session layer drains
//! it on `UDPReceive`. Datagrams arriving while one is pending are dropped.

use alloc::rc::Rc;
use alloc::vec::Vec;

use bitflags::bitflags;
use netsys_lib::{klog_debug, klog_trace};

use crate::config::{NetConfig, TCP_LOCAL_PORT_RANGE_END, TCP_LOCAL_PORT_RANGE_START, UDP_TTL};
use crate::inet::inet_chksum_pseudo;
use crate::ip::{IP_HLEN, IpOutput, Ipv4Header, NetIf, ip_output_keep};
use crate::memp::{MempKind, Pool, PoolHandle};
use crate::pbuf::{BufStore, Pbuf, PbufKind, PbufLayer};
use crate::types::{IpProtocol, Ipv4Addr, NetError, NetResult, Port, Ssid};

pub const UDP_HLEN: usize = 8;

/// Largest payload whose datagram still fits an IPv4 total length.
pub const UDP_MAX_PAYLOAD: usize = u16::MAX as usize - IP_HLEN - UDP_HLEN;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UdpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    /// Header plus payload.
    pub len: u16,
    pub checksum: u16,
}

impl UdpHeader {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < UDP_HLEN {
            return None;
        }
        Some(Self {
            src_port: u16::from_be_bytes([data[0], data[1]]),
            dst_port: u16::from_be_bytes([data[2], data[3]]),
            len: u16::from_be_bytes([data[4], data[5]]),
            checksum: u16::from_be_bytes([data[6], data[7]]),
        })
    }

    pub fn write(&self, out: &mut [u8]) -> Option<usize> {
        if out.len() < UDP_HLEN {
            return None;
        }
        out[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        out[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        out[4..6].copy_from_slice(&self.len.to_be_bytes());
        out[6..8].copy_from_slice(&self.checksum.to_be_bytes());
        Some(UDP_HLEN)
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct UdpFlags: u8 {
        /// Remote address fixed by `connect`; input only matches it.
        const CONNECTED = 0x01;
    }
}

pub struct UdpPcb {
    pub local_ip: Ipv4Addr,
    pub remote_ip: Ipv4Addr,
    pub local_port: Port,
    pub remote_port: Port,
    pub flags: UdpFlags,
    pub ssid: Option<Ssid>,
    /// Datagram payload waiting for the session, with its source.
    pending: Option<(Pbuf, Ipv4Addr, Port)>,
}

impl UdpPcb {
    fn new(ssid: Option<Ssid>) -> Self {
        Self {
            local_ip: Ipv4Addr::ANY,
            remote_ip: Ipv4Addr::ANY,
            local_port: Port::ANY,
            remote_port: Port::ANY,
            flags: UdpFlags::empty(),
            ssid,
            pending: None,
        }
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Take the waiting datagram as bytes with its source address.
    pub fn take_pending(&mut self) -> Option<(Vec<u8>, Ipv4Addr, Port)> {
        let (p, ip, port) = self.pending.take()?;
        let data = p.to_vec();
        p.free();
        Some((data, ip, port))
    }
}

pub type UdpHandle = PoolHandle<UdpPcb>;

/// Outcome of demultiplexing one inbound datagram.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UdpInput {
    /// Stored on a PCB; the owning session should be woken.
    Delivered(Option<Ssid>),
    /// No PCB listens on the destination port.
    NoMatch,
    /// Malformed, bad checksum, or the PCB already holds a datagram.
    Dropped,
}

pub struct Udp {
    store: Rc<BufStore>,
    pcbs: Pool<UdpPcb>,
    /// Bound PCBs, most recent first.
    list: Vec<UdpHandle>,
}

impl Udp {
    pub fn new(cfg: &NetConfig, store: Rc<BufStore>) -> Self {
        Self {
            store,
            pcbs: Pool::new(MempKind::UdpPcb, MempKind::UdpPcb.capacity(cfg)),
            list: Vec::new(),
        }
    }

    pub fn new_pcb(&mut self, ssid: Option<Ssid>) -> Option<UdpHandle> {
        self.pcbs.alloc(UdpPcb::new(ssid))
    }

    pub fn pcb(&self, h: UdpHandle) -> Option<&UdpPcb> {
        self.pcbs.get(h)
    }

    pub fn pcb_mut(&mut self, h: UdpHandle) -> Option<&mut UdpPcb> {
        self.pcbs.get_mut(h)
    }

    pub fn pcbs_in_use(&self) -> usize {
        self.pcbs.used()
    }

    fn port_taken(&self, h: UdpHandle, ip: Ipv4Addr, port: Port) -> bool {
        self.list.iter().filter(|&&x| x != h).any(|&x| {
            self.pcbs.get(x).is_some_and(|p| {
                p.local_port == port && (p.local_ip.is_any() || ip.is_any() || p.local_ip == ip)
            })
        })
    }

    /// Bind to `ip`/`port`; port 0 takes the first free port of the local
    /// range.
    pub fn bind(&mut self, h: UdpHandle, ip: Ipv4Addr, port: Port) -> NetResult<Port> {
        if !self.pcbs.contains(h) {
            return Err(NetError::InvalidArgument);
        }
        let port = if port.is_any() {
            (TCP_LOCAL_PORT_RANGE_START..=TCP_LOCAL_PORT_RANGE_END)
                .map(Port)
                .find(|&p| !self.port_taken(h, ip, p))
                .ok_or(NetError::AddrInUse)?
        } else if self.port_taken(h, ip, port) {
            klog_debug!("udp: bind port={} in use", port);
            return Err(NetError::AddrInUse);
        } else {
            port
        };
        let pcb = self.pcbs.get_mut(h).ok_or(NetError::InvalidArgument)?;
        pcb.local_ip = ip;
        pcb.local_port = port;
        if !self.list.contains(&h) {
            self.list.insert(0, h);
        }
        Ok(port)
    }

    /// Fix the remote endpoint, binding to an ephemeral port first if needed.
    pub fn connect(&mut self, h: UdpHandle, ip: Ipv4Addr, port: Port) -> NetResult {
        let bound = self.pcbs.get(h).ok_or(NetError::InvalidArgument)?.local_port;
        if bound.is_any() {
            self.bind(h, Ipv4Addr::ANY, Port::ANY)?;
        }
        let pcb = self.pcbs.get_mut(h).ok_or(NetError::InvalidArgument)?;
        pcb.remote_ip = ip;
        pcb.remote_port = port;
        pcb.flags.insert(UdpFlags::CONNECTED);
        Ok(())
    }

    pub fn disconnect(&mut self, h: UdpHandle) {
        if let Some(pcb) = self.pcbs.get_mut(h) {
            pcb.remote_ip = Ipv4Addr::ANY;
            pcb.remote_port = Port::ANY;
            pcb.flags.remove(UdpFlags::CONNECTED);
        }
    }

    /// Unlink and free a PCB, dropping any pending datagram.
    pub fn remove(&mut self, h: UdpHandle) {
        self.list.retain(|&x| x != h);
        if let Some(mut pcb) = self.pcbs.free(h)
            && let Some((p, _, _)) = pcb.pending.take()
        {
            p.free();
        }
    }

    /// Send `data` to the connected peer.
    pub fn send(
        &mut self,
        h: UdpHandle,
        data: &[u8],
        netif: &NetIf,
        io: &mut dyn IpOutput,
    ) -> NetResult {
        if data.len() > UDP_MAX_PAYLOAD {
            return Err(NetError::MessageTooLong);
        }
        if self.pcbs.get(h).ok_or(NetError::InvalidArgument)?.local_port.is_any() {
            self.bind(h, Ipv4Addr::ANY, Port::ANY)?;
        }
        let pcb = self.pcbs.get(h).ok_or(NetError::InvalidArgument)?;
        let src = if pcb.local_ip.is_any() { netif.ip } else { pcb.local_ip };
        let dst = pcb.remote_ip;

        let p = Pbuf::alloc(&self.store, PbufLayer::Transport, data.len(), PbufKind::Pool)
            .ok_or(NetError::NoBufs)?;
        if p.copy_in(data).is_err() || p.header(UDP_HLEN as isize).is_err() {
            p.free();
            return Err(NetError::NoBufs);
        }
        let Ok(len) = u16::try_from(p.tot_len()) else {
            p.free();
            return Err(NetError::MessageTooLong);
        };
        let mut hdr = UdpHeader {
            src_port: pcb.local_port.0,
            dst_port: pcb.remote_port.0,
            len,
            checksum: 0,
        };
        let _ = p.with_payload_mut(|b| hdr.write(b));
        hdr.checksum = match inet_chksum_pseudo(&p, src, dst, IpProtocol::Udp, p.tot_len()) {
            0 => 0xffff,
            sum => sum,
        };
        let _ = p.with_payload_mut(|b| b[6..8].copy_from_slice(&hdr.checksum.to_be_bytes()));
        klog_trace!("udp: send {} bytes {} -> {}:{}", data.len(), src, dst, hdr.dst_port);
        let res = ip_output_keep(io, &p, src, dst, UDP_TTL, IpProtocol::Udp);
        p.free();
        res
    }

    /// Demultiplex a datagram. `p` starts at the IPv4 header and is consumed.
    ///
    /// An exact four-tuple match wins; otherwise the first PCB bound to the
    /// destination port takes it and, unless connected, learns the sender as
    /// its remote endpoint.
    pub fn input(&mut self, p: Pbuf, iph: &Ipv4Header) -> UdpInput {
        if p.header(-(iph.header_len as isize)).is_err() {
            p.free();
            return UdpInput::Dropped;
        }
        let mut raw = [0u8; UDP_HLEN];
        let copied = p.copy_out(0, &mut raw);
        let Some(hdr) = UdpHeader::parse(&raw[..copied]) else {
            p.free();
            return UdpInput::Dropped;
        };
        if (hdr.len as usize) < UDP_HLEN || (hdr.len as usize) > p.tot_len() {
            p.free();
            return UdpInput::Dropped;
        }
        p.realloc(hdr.len as usize);

        let exact = self.list.iter().copied().find(|&h| {
            self.pcbs.get(h).is_some_and(|u| {
                u.local_port.0 == hdr.dst_port
                    && u.remote_port.0 == hdr.src_port
                    && (u.remote_ip.is_any() || u.remote_ip == iph.src)
                    && (u.local_ip.is_any() || u.local_ip == iph.dst)
            })
        });
        let found = exact.or_else(|| {
            self.list.iter().copied().find(|&h| {
                self.pcbs.get(h).is_some_and(|u| {
                    u.local_port.0 == hdr.dst_port
                        && !u.flags.contains(UdpFlags::CONNECTED)
                        && (u.local_ip.is_any() || u.local_ip == iph.dst)
                })
            })
        });
        let Some(h) = found else {
            p.free();
            return UdpInput::NoMatch;
        };

        if hdr.checksum != 0
            && inet_chksum_pseudo(&p, iph.src, iph.dst, IpProtocol::Udp, p.tot_len()) != 0
        {
            klog_debug!("udp: bad checksum from {}", iph.src);
            p.free();
            return UdpInput::Dropped;
        }

        let Some(pcb) = self.pcbs.get_mut(h) else {
            p.free();
            return UdpInput::Dropped;
        };
        if exact.is_none() {
            pcb.remote_port = Port(hdr.src_port);
            pcb.remote_ip = iph.src;
        }
        if pcb.pending.is_some() || p.hide_front(UDP_HLEN).is_err() {
            klog_debug!("udp: dropping datagram for port={}", pcb.local_port);
            p.free();
            return UdpInput::Dropped;
        }
        pcb.pending = Some((p, iph.src, Port(hdr.src_port)));
        UdpInput::Delivered(pcb.ssid)
    }
}

#[cfg(test)]
#[path = "udp_tests.rs"]
mod udp_tests;
