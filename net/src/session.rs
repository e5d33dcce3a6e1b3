//! Session layer: maps synchronous capability requests onto the engine.
//!
//! # Architecture
//!
//! Every request carries a session id (`ssid`). A session owns at most one
//! UDP PCB and one TCP PCB (active or listening) plus the connection most
//! recently accepted on its listener. ICMP sessions live in a separate,
//! smaller table. Ports are owned exclusively through a 65536-bit map shared
//! by UDP and TCP.
//!
//! | Verb group | Creates session | Waits                          |
//! |------------|-----------------|--------------------------------|
//! | UDP        | bind, connect   | `UDPReceive` (optional timeout) |
//! | ICMP       | `ICMPOpen`      | `ICMPReceive`                  |
//! | TCP        | bind, connect   | `tcp_connect` (1 s), receive   |
//!
//! A request that cannot complete parks its session in the [`ParkTable`] and
//! returns [`Reply::Retry`]. The engine wakes the session when something
//! changes; the runtime then re-delivers the request, which either completes
//! or parks again. Expired waits and sessions closed under a waiter produce
//! one-shot outcomes that the retried request turns into result codes.
//!
//! A session disappears once it holds no PCB.

use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use netsys_abi::net::{NetSysOp, ResultCode, TCP_SEND_COPY};
use netsys_lib::{ParkTable, WaitOutcome, WakeToken, klog_debug, klog_info};

use crate::config::{
    NetConfig, TCP_CONNECT_TIMEOUT_MS, TCP_LOCAL_PORT_RANGE_END, TCP_LOCAL_PORT_RANGE_START,
};
use crate::icmp::Icmp;
use crate::ip::{IpOutput, NetIf};
use crate::pbuf::Pbuf;
use crate::tcp::{
    ListenHandle, RecvVerdict, SessionState, Tcp, TcpCtx, TcpEvents, TcpHandle, TcpPcb,
    TcpState, discard_recv,
};
use crate::types::{Ipv4Addr, NetError, NetResult, Port, Ssid};
use crate::udp::{Udp, UdpHandle};

/// Park keys of ICMP sessions are kept apart from the ssid keys used by
/// UDP and TCP waits.
const ICMP_KEY_BIT: u32 = 0x8000_0000;

#[inline]
fn park_key(ssid: Ssid) -> u32 {
    ssid.raw()
}

#[inline]
fn icmp_key(ssid: Ssid) -> u32 {
    ssid.raw() | ICMP_KEY_BIT
}

/// Echo identifier used for a session's pings.
#[inline]
pub fn icmp_id(ssid: Ssid) -> u16 {
    (ssid.raw() & 0xffff) as u16
}

// =============================================================================
// Errors
// =============================================================================

/// Session-boundary failure, one per result code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetSysError {
    PortInUse,
    MempExhausted,
    NoExistingSession,
    PbufsExhausted,
    UdpReceiveTimedOut,
    UdpNoBind,
    TcpAlreadyConnected,
    TcpConnectFailed,
    TcpConnectTimedOut,
    Closed,
    SessionsExhausted,
    TcpNotConnected,
    TcpSendBufferFull,
    UnknownRequest,
}

impl NetSysError {
    pub const fn code(self) -> ResultCode {
        match self {
            Self::PortInUse => ResultCode::PortInUse,
            Self::MempExhausted => ResultCode::MempExhausted,
            Self::NoExistingSession => ResultCode::NoExistingSession,
            Self::PbufsExhausted => ResultCode::PbufsExhausted,
            Self::UdpReceiveTimedOut => ResultCode::UdpReceiveTimedOut,
            Self::UdpNoBind => ResultCode::UdpNoBind,
            Self::TcpAlreadyConnected => ResultCode::TcpAlreadyConnected,
            Self::TcpConnectFailed => ResultCode::TcpConnectFailed,
            Self::TcpConnectTimedOut => ResultCode::TcpConnectTimedOut,
            Self::Closed => ResultCode::Closed,
            Self::SessionsExhausted => ResultCode::SessionsExhausted,
            Self::TcpNotConnected => ResultCode::TcpNotConnected,
            Self::TcpSendBufferFull => ResultCode::TcpSendBufferFull,
            Self::UnknownRequest => ResultCode::UnknownRequest,
        }
    }
}

impl fmt::Display for NetSysError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.code(), f)
    }
}

impl From<NetError> for NetSysError {
    fn from(e: NetError) -> Self {
        match e {
            NetError::NoBufs | NetError::MessageTooLong => Self::PbufsExhausted,
            NetError::NoMemory => Self::MempExhausted,
            NetError::AddrInUse => Self::PortInUse,
            NetError::NotConnected => Self::TcpNotConnected,
            NetError::AlreadyConnected => Self::TcpAlreadyConnected,
            NetError::SendBufferFull => Self::TcpSendBufferFull,
            NetError::InvalidArgument => Self::NoExistingSession,
            NetError::ConnectionReset
            | NetError::ConnectionAborted
            | NetError::Closed
            | NetError::TimedOut
            | NetError::InvalidPacket
            | NetError::Unreachable => Self::Closed,
        }
    }
}

// =============================================================================
// Requests and replies
// =============================================================================

/// A decoded session request. Byte payloads borrow the caller's buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Request<'a> {
    UdpConnect { ip: Ipv4Addr, port: Port },
    UdpBind { ip: Ipv4Addr, port: Port },
    UdpSend { data: &'a [u8] },
    /// `0` waits without a deadline.
    UdpReceive { timeout_ms: u32 },
    UdpClose,
    IcmpOpen,
    /// An empty `data` sends a generated echo request.
    IcmpPing { dst: Ipv4Addr, data: &'a [u8] },
    IcmpReceive,
    IcmpClose,
    TcpListen,
    TcpBind { ip: Ipv4Addr, port: Port },
    TcpConnect { ip: Ipv4Addr, port: Port },
    TcpSend { data: &'a [u8], copy: bool },
    /// `0` takes everything buffered.
    TcpReceive { max_len: usize },
    TcpClose,
}

impl<'a> Request<'a> {
    /// Decode the register form: addresses travel in network byte order in
    /// `w1`, ports in the low half of `w2`.
    pub fn decode(op: NetSysOp, w1: u32, w2: u32, data: &'a [u8]) -> Self {
        let ip = Ipv4Addr::from_u32_be(w1);
        let port = Port(w2 as u16);
        match op {
            NetSysOp::UdpConnect => Self::UdpConnect { ip, port },
            NetSysOp::UdpBind => Self::UdpBind { ip, port },
            NetSysOp::UdpSend => Self::UdpSend { data },
            NetSysOp::UdpReceive => Self::UdpReceive { timeout_ms: w1 },
            NetSysOp::UdpClose => Self::UdpClose,
            NetSysOp::IcmpOpen => Self::IcmpOpen,
            NetSysOp::IcmpPing => Self::IcmpPing { dst: ip, data },
            NetSysOp::IcmpReceive => Self::IcmpReceive,
            NetSysOp::IcmpClose => Self::IcmpClose,
            NetSysOp::TcpListen => Self::TcpListen,
            NetSysOp::TcpBind => Self::TcpBind { ip, port },
            NetSysOp::TcpConnect => Self::TcpConnect { ip, port },
            NetSysOp::TcpSend => Self::TcpSend {
                data,
                copy: w1 & TCP_SEND_COPY != 0,
            },
            NetSysOp::TcpReceive => Self::TcpReceive {
                max_len: w1 as usize,
            },
            NetSysOp::TcpClose => Self::TcpClose,
        }
    }

    pub const fn op(&self) -> NetSysOp {
        match self {
            Self::UdpConnect { .. } => NetSysOp::UdpConnect,
            Self::UdpBind { .. } => NetSysOp::UdpBind,
            Self::UdpSend { .. } => NetSysOp::UdpSend,
            Self::UdpReceive { .. } => NetSysOp::UdpReceive,
            Self::UdpClose => NetSysOp::UdpClose,
            Self::IcmpOpen => NetSysOp::IcmpOpen,
            Self::IcmpPing { .. } => NetSysOp::IcmpPing,
            Self::IcmpReceive => NetSysOp::IcmpReceive,
            Self::IcmpClose => NetSysOp::IcmpClose,
            Self::TcpListen => NetSysOp::TcpListen,
            Self::TcpBind { .. } => NetSysOp::TcpBind,
            Self::TcpConnect { .. } => NetSysOp::TcpConnect,
            Self::TcpSend { .. } => NetSysOp::TcpSend,
            Self::TcpReceive { .. } => NetSysOp::TcpReceive,
            Self::TcpClose => NetSysOp::TcpClose,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    Done,
    Data(Vec<u8>),
    Datagram {
        data: Vec<u8>,
        src: Ipv4Addr,
        port: Port,
    },
    PingReply,
    /// The caller is parked; the runtime re-delivers the request once the
    /// token is woken.
    Retry(WakeToken),
}

impl Reply {
    /// Result code to return now, `None` while the caller is parked.
    pub const fn code(&self) -> Option<ResultCode> {
        match self {
            Self::Done | Self::Data(_) | Self::Datagram { .. } => Some(ResultCode::Ok),
            Self::PingReply => Some(ResultCode::PingReplySuccess),
            Self::Retry(_) => None,
        }
    }
}

// =============================================================================
// Tables
// =============================================================================

/// The TCP side of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PcbRef {
    Active(TcpHandle),
    Listen(ListenHandle),
}

#[derive(Debug)]
pub struct Session {
    pub ssid: Ssid,
    pub udp: Option<UdpHandle>,
    pub udp_port: Option<Port>,
    pub tcp: Option<PcbRef>,
    pub tcp_port: Option<Port>,
    /// Most recent connection accepted on this session's listener.
    pub accepted: Option<TcpHandle>,
    /// Last asynchronous failure reported by the engine.
    pub tcp_error: Option<NetError>,
}

impl Session {
    fn new(ssid: Ssid) -> Self {
        Self {
            ssid,
            udp: None,
            udp_port: None,
            tcp: None,
            tcp_port: None,
            accepted: None,
            tcp_error: None,
        }
    }

    fn is_idle(&self) -> bool {
        self.udp.is_none() && self.tcp.is_none() && self.accepted.is_none()
    }

    /// The connection data verbs act on: the accepted child for a listener,
    /// the session's own PCB otherwise.
    pub fn connection(&self) -> Option<TcpHandle> {
        match self.tcp {
            Some(PcbRef::Active(h)) => Some(h),
            Some(PcbRef::Listen(_)) => self.accepted,
            None => None,
        }
    }
}

pub struct SessionTable {
    slots: Vec<Option<Session>>,
}

impl SessionTable {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self { slots }
    }

    pub fn get(&self, ssid: Ssid) -> Option<&Session> {
        self.slots.iter().flatten().find(|s| s.ssid == ssid)
    }

    pub fn get_mut(&mut self, ssid: Ssid) -> Option<&mut Session> {
        self.slots.iter_mut().flatten().find(|s| s.ssid == ssid)
    }

    pub fn get_or_create(&mut self, ssid: Ssid) -> Result<&mut Session, NetSysError> {
        let idx = match self
            .slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|s| s.ssid == ssid))
        {
            Some(i) => i,
            None => {
                let free = self
                    .slots
                    .iter()
                    .position(Option::is_none)
                    .ok_or(NetSysError::SessionsExhausted)?;
                self.slots[free] = Some(Session::new(ssid));
                klog_debug!("session: open ssid={}", ssid);
                free
            }
        };
        self.slots[idx].as_mut().ok_or(NetSysError::SessionsExhausted)
    }

    /// Drop the session if it no longer holds anything.
    pub fn reap(&mut self, ssid: Ssid) {
        for slot in self.slots.iter_mut() {
            if slot.as_ref().is_some_and(|s| s.ssid == ssid && s.is_idle()) {
                *slot = None;
                klog_debug!("session: closed ssid={}", ssid);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One bit per port; a set bit means some session owns the port.
pub struct PortMap {
    bits: Vec<u64>,
}

impl PortMap {
    pub fn new() -> Self {
        Self {
            bits: vec![0u64; netsys_abi::net::MAX_PORTS / 64],
        }
    }

    pub fn is_set(&self, port: Port) -> bool {
        let p = port.0 as usize;
        self.bits[p / 64] & (1 << (p % 64)) != 0
    }

    pub fn set(&mut self, port: Port) {
        let p = port.0 as usize;
        self.bits[p / 64] |= 1 << (p % 64);
    }

    pub fn clear(&mut self, port: Port) {
        let p = port.0 as usize;
        self.bits[p / 64] &= !(1 << (p % 64));
    }

    /// Lowest unowned port of the ephemeral range.
    pub fn first_free(&self) -> Option<Port> {
        (TCP_LOCAL_PORT_RANGE_START..=TCP_LOCAL_PORT_RANGE_END)
            .map(Port)
            .find(|&p| !self.is_set(p))
    }
}

impl Default for PortMap {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, Debug)]
struct IcmpSession {
    ssid: Ssid,
    /// An echo reply arrived and has not been collected.
    replied: bool,
}

pub struct IcmpSessions {
    entries: Vec<IcmpSession>,
    capacity: usize,
}

impl IcmpSessions {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn open(&mut self, ssid: Ssid) -> Result<(), NetSysError> {
        if self.is_open(ssid) || self.entries.len() >= self.capacity {
            return Err(NetSysError::SessionsExhausted);
        }
        self.entries.push(IcmpSession {
            ssid,
            replied: false,
        });
        Ok(())
    }

    pub fn close(&mut self, ssid: Ssid) -> Result<(), NetSysError> {
        let idx = self
            .entries
            .iter()
            .position(|e| e.ssid == ssid)
            .ok_or(NetSysError::NoExistingSession)?;
        self.entries.swap_remove(idx);
        Ok(())
    }

    pub fn is_open(&self, ssid: Ssid) -> bool {
        self.entries.iter().any(|e| e.ssid == ssid)
    }

    /// Record an echo reply for the session pinging with `id`.
    pub fn deliver_reply(&mut self, id: u16) -> Option<Ssid> {
        let entry = self.entries.iter_mut().find(|e| icmp_id(e.ssid) == id)?;
        entry.replied = true;
        Some(entry.ssid)
    }

    fn take_reply(&mut self, ssid: Ssid) -> Option<bool> {
        let entry = self.entries.iter_mut().find(|e| e.ssid == ssid)?;
        Some(core::mem::replace(&mut entry.replied, false))
    }
}

// =============================================================================
// Engine upcalls
// =============================================================================

/// Routes TCP upcalls to the owning session and wakes its parked caller.
/// Connections whose session is gone fall back to discarding.
pub struct SessionHooks<'a> {
    pub table: &'a mut SessionTable,
    pub park: &'a mut ParkTable,
}

impl SessionHooks<'_> {
    fn owner(&self, pcb: &TcpPcb) -> Option<Ssid> {
        pcb.ssid.filter(|&ssid| self.table.get(ssid).is_some())
    }
}

impl TcpEvents for SessionHooks<'_> {
    fn accept(&mut self, h: TcpHandle, pcb: &mut TcpPcb) -> NetResult {
        let Some(ssid) = pcb.ssid else {
            return Ok(());
        };
        let Some(session) = self.table.get_mut(ssid) else {
            pcb.ssid = None;
            return Err(NetError::ConnectionAborted);
        };
        session.accepted = Some(h);
        pcb.session_state = SessionState::Established;
        klog_debug!("session: ssid={} accepted {}:{}", ssid, pcb.remote_ip, pcb.remote_port);
        self.park.wake(park_key(ssid));
        Ok(())
    }

    fn connected(&mut self, _h: TcpHandle, pcb: &mut TcpPcb, result: NetResult) {
        pcb.session_state = match result {
            Ok(()) => SessionState::Established,
            Err(_) => SessionState::NoConnect,
        };
        if let Some(ssid) = self.owner(pcb) {
            self.park.wake(park_key(ssid));
        }
    }

    fn recv(&mut self, _h: TcpHandle, pcb: &mut TcpPcb, data: Option<Pbuf>) -> RecvVerdict {
        let Some(ssid) = self.owner(pcb) else {
            return discard_recv(pcb, data);
        };
        pcb.stage_recv(data);
        self.park.wake(park_key(ssid));
        RecvVerdict::Accepted
    }

    fn err(&mut self, ssid: Option<Ssid>, err: NetError) {
        let Some(ssid) = ssid else {
            return;
        };
        if let Some(session) = self.table.get_mut(ssid) {
            klog_info!("session: ssid={} connection lost: {}", ssid, err);
            session.tcp_error = Some(err);
            self.park.wake(park_key(ssid));
        }
    }
}

// =============================================================================
// Request dispatch
// =============================================================================

/// The engine components a request may touch.
pub struct Engine<'a> {
    pub netif: &'a NetIf,
    pub io: &'a mut dyn IpOutput,
    pub tcp: &'a mut Tcp,
    pub udp: &'a mut Udp,
    pub icmp: &'a mut Icmp,
    pub park: &'a mut ParkTable,
}

/// Run `f` against the TCP engine with session upcalls wired in.
pub fn with_tcp<R>(
    table: &mut SessionTable,
    eng: &mut Engine<'_>,
    f: impl FnOnce(&mut Tcp, &mut TcpCtx<'_>) -> R,
) -> R {
    let mut hooks = SessionHooks {
        table,
        park: &mut *eng.park,
    };
    let mut cx = TcpCtx::new(eng.netif, &mut *eng.io, &mut hooks);
    f(&mut *eng.tcp, &mut cx)
}

pub struct Sessions {
    pub table: SessionTable,
    pub ports: PortMap,
    pub icmp: IcmpSessions,
}

type VerbResult = Result<Reply, NetSysError>;

impl Sessions {
    pub fn new(cfg: &NetConfig) -> Self {
        Self {
            table: SessionTable::new(cfg.max_sessions),
            ports: PortMap::new(),
            icmp: IcmpSessions::new(cfg.max_icmp_sessions),
        }
    }

    pub fn handle(&mut self, eng: &mut Engine<'_>, ssid: Ssid, req: Request<'_>) -> VerbResult {
        klog_debug!("session: {} ssid={}", req.op().name(), ssid);
        // A cancellation is kept for the retry of the verb that parked. Any
        // verb that cannot wait means that retry never came.
        match req {
            Request::UdpReceive { .. }
            | Request::TcpConnect { .. }
            | Request::TcpReceive { .. }
            | Request::IcmpReceive => {}
            Request::IcmpOpen | Request::IcmpPing { .. } | Request::IcmpClose => {
                Self::discard_cancelled(eng.park, icmp_key(ssid));
            }
            _ => Self::discard_cancelled(eng.park, park_key(ssid)),
        }
        let res = match req {
            Request::UdpConnect { ip, port } => self.udp_connect(eng, ssid, ip, port),
            Request::UdpBind { ip, port } => self.udp_bind(eng, ssid, ip, port),
            Request::UdpSend { data } => self.udp_send(eng, ssid, data),
            Request::UdpReceive { timeout_ms } => self.udp_receive(eng, ssid, timeout_ms),
            Request::UdpClose => self.udp_close(eng, ssid),
            Request::IcmpOpen => self.icmp.open(ssid).map(|()| Reply::Done),
            Request::IcmpPing { dst, data } => self.icmp_ping(eng, ssid, dst, data),
            Request::IcmpReceive => self.icmp_receive(eng, ssid),
            Request::IcmpClose => {
                self.icmp.close(ssid)?;
                eng.park.cancel(icmp_key(ssid));
                Ok(Reply::Done)
            }
            Request::TcpListen => self.tcp_listen(eng, ssid),
            Request::TcpBind { ip, port } => self.tcp_bind(eng, ssid, ip, port),
            Request::TcpConnect { ip, port } => self.tcp_connect(eng, ssid, ip, port),
            Request::TcpSend { data, copy } => self.tcp_send(eng, ssid, data, copy),
            Request::TcpReceive { max_len } => self.tcp_receive(eng, ssid, max_len),
            Request::TcpClose => self.tcp_close(eng, ssid),
        };
        if let Err(e) = res {
            klog_debug!("session: {} ssid={} failed: {}", req.op().name(), ssid, e);
        }
        res
    }

    /// A caller whose session was closed while it was parked gets `Closed`
    /// on its retry.
    fn check_cancelled(park: &mut ParkTable, key: u32) -> Result<(), NetSysError> {
        if park.peek_outcome(key) == Some(WaitOutcome::Cancelled) {
            park.take_outcome(key);
            return Err(NetSysError::Closed);
        }
        Ok(())
    }

    fn discard_cancelled(park: &mut ParkTable, key: u32) {
        if park.peek_outcome(key) == Some(WaitOutcome::Cancelled) {
            park.forget(key);
        }
    }

    fn park(park: &mut ParkTable, key: u32, timeout_ms: Option<u32>) -> VerbResult {
        park.park(key, timeout_ms)
            .map(Reply::Retry)
            .map_err(|_| NetSysError::MempExhausted)
    }

    /// Resolve the port for a bind: 0 picks the first free ephemeral port,
    /// anything else must be unowned.
    fn claim_port(&self, port: Port) -> Result<Port, NetSysError> {
        if port.is_any() {
            self.ports.first_free().ok_or(NetSysError::PortInUse)
        } else if self.ports.is_set(port) {
            Err(NetSysError::PortInUse)
        } else {
            Ok(port)
        }
    }

    // ---------------------------------------------------------------------
    // UDP
    // ---------------------------------------------------------------------

    /// The session's UDP PCB, created on demand. The flag is set when the
    /// PCB was made by this call.
    fn udp_pcb(&mut self, eng: &mut Engine<'_>, ssid: Ssid) -> Result<(UdpHandle, bool), NetSysError> {
        if let Some(h) = self.table.get_or_create(ssid)?.udp
            && eng.udp.pcb(h).is_some()
        {
            return Ok((h, false));
        }
        let Some(h) = eng.udp.new_pcb(Some(ssid)) else {
            self.table.reap(ssid);
            return Err(NetSysError::MempExhausted);
        };
        if let Some(session) = self.table.get_mut(ssid) {
            session.udp = Some(h);
        }
        Ok((h, true))
    }

    /// Undo a UDP PCB made by a verb that then failed.
    fn drop_udp(&mut self, eng: &mut Engine<'_>, ssid: Ssid, h: UdpHandle) {
        eng.udp.remove(h);
        if let Some(session) = self.table.get_mut(ssid) {
            session.udp = None;
            if let Some(port) = session.udp_port.take() {
                self.ports.clear(port);
            }
        }
        self.table.reap(ssid);
    }

    fn udp_bind_port(
        &mut self,
        eng: &mut Engine<'_>,
        ssid: Ssid,
        h: UdpHandle,
        ip: Ipv4Addr,
        port: Port,
    ) -> Result<(), NetSysError> {
        let port = self.claim_port(port)?;
        let bound = eng.udp.bind(h, ip, port)?;
        self.ports.set(bound);
        if let Some(session) = self.table.get_mut(ssid)
            && let Some(old) = session.udp_port.replace(bound)
            && old != bound
        {
            self.ports.clear(old);
        }
        Ok(())
    }

    fn udp_bind(&mut self, eng: &mut Engine<'_>, ssid: Ssid, ip: Ipv4Addr, port: Port) -> VerbResult {
        let ip = if ip.is_any() { eng.netif.ip } else { ip };
        self.claim_port(port)?;
        let (h, fresh) = self.udp_pcb(eng, ssid)?;
        if let Err(e) = self.udp_bind_port(eng, ssid, h, ip, port) {
            if fresh {
                self.drop_udp(eng, ssid, h);
            }
            return Err(e);
        }
        Ok(Reply::Done)
    }

    fn udp_connect(&mut self, eng: &mut Engine<'_>, ssid: Ssid, ip: Ipv4Addr, port: Port) -> VerbResult {
        let (h, fresh) = self.udp_pcb(eng, ssid)?;
        let res = if eng.udp.pcb(h).is_some_and(|p| p.local_port.is_any()) {
            self.udp_bind_port(eng, ssid, h, Ipv4Addr::ANY, Port::ANY)
        } else {
            Ok(())
        };
        match res.and_then(|()| eng.udp.connect(h, ip, port).map_err(NetSysError::from)) {
            Ok(()) => Ok(Reply::Done),
            Err(e) => {
                if fresh {
                    self.drop_udp(eng, ssid, h);
                }
                Err(e)
            }
        }
    }

    fn udp_send(&mut self, eng: &mut Engine<'_>, ssid: Ssid, data: &[u8]) -> VerbResult {
        let h = self
            .table
            .get(ssid)
            .and_then(|s| s.udp)
            .ok_or(NetSysError::NoExistingSession)?;
        if eng.udp.pcb(h).ok_or(NetSysError::NoExistingSession)?.local_port.is_any() {
            self.udp_bind_port(eng, ssid, h, Ipv4Addr::ANY, Port::ANY)?;
        }
        eng.udp.send(h, data, eng.netif, &mut *eng.io)?;
        Ok(Reply::Done)
    }

    fn udp_receive(&mut self, eng: &mut Engine<'_>, ssid: Ssid, timeout_ms: u32) -> VerbResult {
        let key = park_key(ssid);
        Self::check_cancelled(eng.park, key)?;
        let h = self
            .table
            .get(ssid)
            .and_then(|s| s.udp)
            .ok_or(NetSysError::NoExistingSession)?;
        let pcb = eng.udp.pcb_mut(h).ok_or(NetSysError::NoExistingSession)?;
        if pcb.local_port.is_any() {
            return Err(NetSysError::UdpNoBind);
        }
        if let Some((data, src, port)) = pcb.take_pending() {
            eng.park.take_outcome(key);
            return Ok(Reply::Datagram { data, src, port });
        }
        if eng.park.take_outcome(key) == Some(WaitOutcome::TimedOut) {
            return Err(NetSysError::UdpReceiveTimedOut);
        }
        Self::park(eng.park, key, (timeout_ms > 0).then_some(timeout_ms))
    }

    fn udp_close(&mut self, eng: &mut Engine<'_>, ssid: Ssid) -> VerbResult {
        let session = self
            .table
            .get_mut(ssid)
            .ok_or(NetSysError::NoExistingSession)?;
        let h = session.udp.take().ok_or(NetSysError::NoExistingSession)?;
        if let Some(port) = session.udp_port.take() {
            self.ports.clear(port);
        }
        eng.udp.remove(h);
        eng.park.cancel(park_key(ssid));
        self.table.reap(ssid);
        Ok(Reply::Done)
    }

    // ---------------------------------------------------------------------
    // ICMP
    // ---------------------------------------------------------------------

    fn icmp_ping(&mut self, eng: &mut Engine<'_>, ssid: Ssid, dst: Ipv4Addr, data: &[u8]) -> VerbResult {
        if !self.icmp.is_open(ssid) {
            return Err(NetSysError::NoExistingSession);
        }
        if data.is_empty() {
            eng.icmp.echo_output(icmp_id(ssid), dst, eng.netif, &mut *eng.io)?;
        } else {
            eng.icmp.raw_output(data, dst, eng.netif, &mut *eng.io)?;
        }
        Ok(Reply::Done)
    }

    fn icmp_receive(&mut self, eng: &mut Engine<'_>, ssid: Ssid) -> VerbResult {
        let key = icmp_key(ssid);
        Self::check_cancelled(eng.park, key)?;
        match self.icmp.take_reply(ssid) {
            None => Err(NetSysError::NoExistingSession),
            Some(true) => {
                eng.park.take_outcome(key);
                Ok(Reply::PingReply)
            }
            Some(false) => {
                eng.park.take_outcome(key);
                Self::park(eng.park, key, None)
            }
        }
    }

    /// Note an inbound echo reply and wake the pinging session.
    pub fn icmp_reply(&mut self, park: &mut ParkTable, id: u16) {
        if let Some(ssid) = self.icmp.deliver_reply(id) {
            park.wake(icmp_key(ssid));
        }
    }

    // ---------------------------------------------------------------------
    // TCP
    // ---------------------------------------------------------------------

    /// Allocate a PCB stamped with `ssid`.
    fn new_tcp_pcb(&mut self, eng: &mut Engine<'_>, ssid: Ssid) -> Result<TcpHandle, NetSysError> {
        let h = with_tcp(&mut self.table, eng, |tcp, cx| tcp.new_pcb(cx))
            .ok_or(NetSysError::MempExhausted)?;
        if let Some(pcb) = eng.tcp.pcb_mut(h) {
            pcb.ssid = Some(ssid);
        }
        Ok(h)
    }

    fn tcp_bind_port(
        &mut self,
        eng: &mut Engine<'_>,
        ssid: Ssid,
        h: TcpHandle,
        ip: Ipv4Addr,
        port: Port,
    ) -> Result<(), NetSysError> {
        let port = self.claim_port(port)?;
        let bound = eng.tcp.bind(h, ip, port)?;
        self.ports.set(bound);
        if let Some(session) = self.table.get_mut(ssid)
            && let Some(old) = session.tcp_port.replace(bound)
            && old != bound
        {
            self.ports.clear(old);
        }
        Ok(())
    }

    /// Forget a session's TCP side after the engine dropped the connection.
    fn drop_tcp(&mut self, ssid: Ssid) {
        if let Some(session) = self.table.get_mut(ssid) {
            session.tcp = None;
            session.tcp_error = None;
            if let Some(port) = session.tcp_port.take() {
                self.ports.clear(port);
            }
        }
        self.table.reap(ssid);
    }

    fn tcp_bind(&mut self, eng: &mut Engine<'_>, ssid: Ssid, ip: Ipv4Addr, port: Port) -> VerbResult {
        let ip = if ip.is_any() { eng.netif.ip } else { ip };
        self.claim_port(port)?;
        let existing = self.table.get_or_create(ssid)?.tcp;
        let (h, fresh) = match existing {
            Some(PcbRef::Listen(_)) => return Err(NetSysError::TcpAlreadyConnected),
            Some(PcbRef::Active(h)) if eng.tcp.pcb(h).is_some() => (h, false),
            _ => {
                let h = match self.new_tcp_pcb(eng, ssid) {
                    Ok(h) => h,
                    Err(e) => {
                        self.table.reap(ssid);
                        return Err(e);
                    }
                };
                if let Some(session) = self.table.get_mut(ssid) {
                    session.tcp = Some(PcbRef::Active(h));
                }
                (h, true)
            }
        };
        if let Err(e) = self.tcp_bind_port(eng, ssid, h, ip, port) {
            if fresh {
                eng.tcp.release(h);
                self.drop_tcp(ssid);
            }
            return Err(e);
        }
        Ok(Reply::Done)
    }

    fn tcp_listen(&mut self, eng: &mut Engine<'_>, ssid: Ssid) -> VerbResult {
        let session = self
            .table
            .get_mut(ssid)
            .ok_or(NetSysError::NoExistingSession)?;
        let h = match session.tcp {
            Some(PcbRef::Active(h)) => h,
            Some(PcbRef::Listen(_)) => return Err(NetSysError::TcpAlreadyConnected),
            None => return Err(NetSysError::NoExistingSession),
        };
        let pcb = eng.tcp.pcb(h).ok_or(NetSysError::NoExistingSession)?;
        if pcb.local_port.is_any() {
            return Err(NetSysError::NoExistingSession);
        }
        let lh = eng.tcp.listen(h)?;
        session.tcp = Some(PcbRef::Listen(lh));
        Ok(Reply::Done)
    }

    fn tcp_connect(&mut self, eng: &mut Engine<'_>, ssid: Ssid, ip: Ipv4Addr, port: Port) -> VerbResult {
        let key = park_key(ssid);
        Self::check_cancelled(eng.park, key)?;

        let existing = self.table.get_or_create(ssid)?.tcp;
        let h = match existing {
            Some(PcbRef::Listen(_)) => return Err(NetSysError::TcpAlreadyConnected),
            Some(PcbRef::Active(h)) if eng.tcp.pcb(h).is_some() => h,
            Some(PcbRef::Active(_)) => {
                // The engine dropped the connection (reset or retransmit
                // limit) while the caller was waiting.
                eng.park.take_outcome(key);
                self.drop_tcp(ssid);
                return Err(NetSysError::TcpConnectFailed);
            }
            None => {
                let h = match self.new_tcp_pcb(eng, ssid) {
                    Ok(h) => h,
                    Err(e) => {
                        self.table.reap(ssid);
                        return Err(e);
                    }
                };
                if let Some(session) = self.table.get_mut(ssid) {
                    session.tcp = Some(PcbRef::Active(h));
                }
                let local = eng.netif.ip;
                if let Err(e) = self.tcp_bind_port(eng, ssid, h, local, Port::ANY) {
                    eng.tcp.release(h);
                    self.drop_tcp(ssid);
                    return Err(e);
                }
                h
            }
        };

        let outcome = eng.park.take_outcome(key);
        let pcb = eng.tcp.pcb_mut(h).ok_or(NetSysError::TcpConnectFailed)?;
        if outcome == Some(WaitOutcome::TimedOut) && pcb.session_state == SessionState::Connecting {
            pcb.session_state = SessionState::TimedOut;
        }

        let tcp_state = pcb.state;
        match pcb.session_state {
            SessionState::PreConnect => {
                if tcp_state != TcpState::Closed {
                    return Err(NetSysError::TcpAlreadyConnected);
                }
                with_tcp(&mut self.table, eng, |tcp, cx| tcp.connect(h, ip, port, cx))
                    .map_err(|_| NetSysError::TcpConnectFailed)?;
                if let Some(pcb) = eng.tcp.pcb_mut(h) {
                    pcb.session_state = SessionState::Connecting;
                }
                klog_debug!("session: ssid={} connecting to {}:{}", ssid, ip, port);
                Self::park(eng.park, key, Some(TCP_CONNECT_TIMEOUT_MS))
            }
            SessionState::Connecting => Self::park(eng.park, key, Some(TCP_CONNECT_TIMEOUT_MS)),
            SessionState::Established => Ok(Reply::Done),
            SessionState::TimedOut => {
                with_tcp(&mut self.table, eng, |tcp, cx| tcp.remove(h, cx));
                if let Some(pcb) = eng.tcp.pcb_mut(h) {
                    pcb.session_state = SessionState::PreConnect;
                }
                Err(NetSysError::TcpConnectTimedOut)
            }
            SessionState::NoConnect => {
                with_tcp(&mut self.table, eng, |tcp, cx| {
                    tcp.remove(h, cx);
                    tcp.release(h);
                });
                self.drop_tcp(ssid);
                Err(NetSysError::TcpConnectFailed)
            }
        }
    }

    /// Report a failure the engine raised since the last verb, once, and
    /// forget the connection it killed.
    fn take_tcp_error(&mut self, eng: &Engine<'_>, ssid: Ssid) -> Result<(), NetSysError> {
        let Some(session) = self.table.get_mut(ssid) else {
            return Ok(());
        };
        let Some(err) = session.tcp_error.take() else {
            return Ok(());
        };
        let gone = |h: TcpHandle| eng.tcp.pcb(h).is_none();
        match (session.tcp, session.accepted) {
            (Some(PcbRef::Listen(_)), Some(child)) if gone(child) => session.accepted = None,
            (Some(PcbRef::Active(h)), _) if gone(h) => self.drop_tcp(ssid),
            _ => {}
        }
        Err(err.into())
    }

    fn tcp_send(&mut self, eng: &mut Engine<'_>, ssid: Ssid, data: &[u8], copy: bool) -> VerbResult {
        self.take_tcp_error(eng, ssid)?;
        let session = self.table.get(ssid).ok_or(NetSysError::NoExistingSession)?;
        if session.tcp.is_none() {
            return Err(NetSysError::NoExistingSession);
        }
        let h = session.connection().ok_or(NetSysError::TcpNotConnected)?;
        if eng.tcp.pcb(h).is_none() {
            return Err(NetSysError::Closed);
        }
        eng.tcp.write(h, data, copy)?;
        if eng.tcp.pcb(h).is_some_and(|p| p.unacked.is_empty()) {
            with_tcp(&mut self.table, eng, |tcp, cx| tcp.output(h, cx))?;
        }
        Ok(Reply::Done)
    }

    fn tcp_receive(&mut self, eng: &mut Engine<'_>, ssid: Ssid, max_len: usize) -> VerbResult {
        let key = park_key(ssid);
        Self::check_cancelled(eng.park, key)?;
        if let Err(e) = self.take_tcp_error(eng, ssid) {
            eng.park.take_outcome(key);
            return Err(e);
        }
        let session = self.table.get(ssid).ok_or(NetSysError::NoExistingSession)?;
        let Some(h) = session.connection() else {
            if session.tcp.is_some() {
                // Listening with nothing accepted yet.
                eng.park.take_outcome(key);
                return Self::park(eng.park, key, None);
            }
            return Err(NetSysError::NoExistingSession);
        };
        let Some(pcb) = eng.tcp.pcb_mut(h) else {
            return Err(NetSysError::Closed);
        };
        if let Some(data) = pcb.take_recv(max_len) {
            eng.park.take_outcome(key);
            let n = data.len();
            with_tcp(&mut self.table, eng, |tcp, cx| tcp.recved(h, n, cx));
            return Ok(Reply::Data(data));
        }
        if pcb.recv_eof() {
            return Err(NetSysError::Closed);
        }
        eng.park.take_outcome(key);
        Self::park(eng.park, key, None)
    }

    fn tcp_close(&mut self, eng: &mut Engine<'_>, ssid: Ssid) -> VerbResult {
        let session = self
            .table
            .get_mut(ssid)
            .ok_or(NetSysError::NoExistingSession)?;
        let tcp = session.tcp.take();
        let accepted = session.accepted.take();
        session.tcp_error = None;
        if tcp.is_none() && accepted.is_none() {
            return Err(NetSysError::NoExistingSession);
        }
        if let Some(port) = session.tcp_port.take() {
            self.ports.clear(port);
        }

        let own = match tcp {
            Some(PcbRef::Active(h)) => Some(h),
            _ => None,
        };
        for h in [own, accepted].into_iter().flatten() {
            if let Some(pcb) = eng.tcp.pcb_mut(h) {
                pcb.ssid = None;
            }
            let _ = with_tcp(&mut self.table, eng, |t, cx| t.close(h, cx));
        }
        if let Some(PcbRef::Listen(lh)) = tcp {
            eng.tcp.close_listen(lh);
        }

        eng.park.cancel(park_key(ssid));
        self.table.reap(ssid);
        Ok(Reply::Done)
    }
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod session_tests;
