//! TCP protocol control blocks, the connection registry and its timers.
//!
//! # Architecture
//!
//! [`Tcp`] owns every PCB in generation-checked pools and keeps three
//! registries that follow a connection through its life:
//!
//! | List     | Holds                                         |
//! |----------|-----------------------------------------------|
//! | `listen` | [`TcpPcbListen`] entries waiting for SYNs     |
//! | `active` | bound, connecting, connected and closing PCBs |
//! | `tw`     | PCBs in TIME-WAIT                             |
//!
//! A PCB is on at most one list. Inbound segments are handled in
//! [`crate::tcp_in`], queuing and transmission in [`crate::tcp_out`].
//! Upcalls to the layer above go through [`TcpEvents`]; nothing blocks.
//!
//! Timers are counted in ticks of the slow timer (500 ms). [`Tcp::tmr`] is
//! called every 100 ms and runs the fast timer (delayed ACKs) on odd calls and
//! the slow timer (retransmission, timeouts) twice per cycle.

use alloc::collections::VecDeque;
use alloc::rc::Rc;
use alloc::vec;
use alloc::vec::Vec;

use bitflags::bitflags;
use netsys_lib::{klog_debug, klog_info};

use crate::config::{
    NetConfig, TCP_FIN_WAIT_TIMEOUT, TCP_ISS_SEED, TCP_LOCAL_PORT_RANGE_END,
    TCP_LOCAL_PORT_RANGE_START, TCP_MAXRTX, TCP_MSL, TCP_MSS, TCP_OOSEQ_TIMEOUT, TCP_SLOW_INTERVAL,
    TCP_SND_BUF, TCP_SYN_RCVD_TIMEOUT, TCP_SYNMAXRTX, TCP_WND,
};
use crate::ip::{IpOutput, NetIf};
use crate::memp::{MempKind, Pool, PoolHandle};
use crate::pbuf::{BufStore, Pbuf};
use crate::types::{Ipv4Addr, NetError, NetResult, Port, Ssid};

// =============================================================================
// Constants
// =============================================================================

/// TCP header length without options.
pub const TCP_HLEN: usize = 20;

/// Maximum TCP header length (40 bytes of options).
pub const TCP_HEADER_MAX_LEN: usize = 60;

pub const TCP_OPT_END: u8 = 0;
pub const TCP_OPT_NOP: u8 = 1;
pub const TCP_OPT_MSS: u8 = 2;
pub const TCP_OPT_MSS_LEN: u8 = 4;

pub const TCP_PRIO_MIN: u8 = 1;
pub const TCP_PRIO_NORMAL: u8 = 64;
pub const TCP_PRIO_MAX: u8 = 127;

/// Shift applied to the RTO on the n-th retransmission.
const TCP_BACKOFF: [u8; 13] = [1, 2, 3, 4, 5, 6, 7, 7, 7, 7, 7, 7, 7];

/// Initial retransmission timeout: 3 s in slow-timer ticks.
const TCP_INITIAL_RTO: u16 = (3000 / TCP_SLOW_INTERVAL) as u16;

// =============================================================================
// Flags
// =============================================================================

bitflags! {
    /// Header flag bits (byte 13, low six bits).
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct TcpFlags: u8 {
        const FIN = 0x01;
        const SYN = 0x02;
        const RST = 0x04;
        const PSH = 0x08;
        const ACK = 0x10;
        const URG = 0x20;
    }
}

bitflags! {
    /// Per-connection state bits. `RESET`, `CLOSED` and `GOT_FIN` are only
    /// produced while an inbound segment is processed.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PcbFlags: u8 {
        /// An ACK is owed but may wait for the fast timer.
        const ACK_DELAY = 0x01;
        /// An ACK goes out with the next output call.
        const ACK_NOW = 0x02;
        /// In fast recovery.
        const INFR = 0x04;
        const RESET = 0x08;
        const CLOSED = 0x10;
        const GOT_FIN = 0x20;
    }
}

// =============================================================================
// Header codec
// =============================================================================

/// Parsed TCP header. Multi-byte fields are in host order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq_num: u32,
    pub ack_num: u32,
    /// Header length in 32-bit words.
    pub data_offset: u8,
    pub flags: TcpFlags,
    pub window_size: u16,
    pub checksum: u16,
    pub urgent_ptr: u16,
}

impl TcpHeader {
    pub const fn new(src_port: u16, dst_port: u16, seq_num: u32, flags: TcpFlags) -> Self {
        Self {
            src_port,
            dst_port,
            seq_num,
            ack_num: 0,
            data_offset: 5,
            flags,
            window_size: 0,
            checksum: 0,
            urgent_ptr: 0,
        }
    }

    #[inline]
    pub const fn header_len(&self) -> usize {
        self.data_offset as usize * 4
    }

    /// Parse the fixed part of a header. `data` must hold the whole header
    /// including options.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < TCP_HLEN {
            return None;
        }
        let data_offset = data[12] >> 4;
        if data_offset < 5 || data.len() < data_offset as usize * 4 {
            return None;
        }
        Some(Self {
            src_port: u16::from_be_bytes([data[0], data[1]]),
            dst_port: u16::from_be_bytes([data[2], data[3]]),
            seq_num: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ack_num: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            data_offset,
            flags: TcpFlags::from_bits_truncate(data[13] & 0x3f),
            window_size: u16::from_be_bytes([data[14], data[15]]),
            checksum: u16::from_be_bytes([data[16], data[17]]),
            urgent_ptr: u16::from_be_bytes([data[18], data[19]]),
        })
    }

    /// Write the fixed 20 bytes. Options, if any, are left untouched.
    pub fn write(&self, out: &mut [u8]) -> Option<usize> {
        if out.len() < TCP_HLEN {
            return None;
        }
        out[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        out[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        out[4..8].copy_from_slice(&self.seq_num.to_be_bytes());
        out[8..12].copy_from_slice(&self.ack_num.to_be_bytes());
        out[12] = self.data_offset << 4;
        out[13] = self.flags.bits();
        out[14..16].copy_from_slice(&self.window_size.to_be_bytes());
        out[16..18].copy_from_slice(&self.checksum.to_be_bytes());
        out[18..20].copy_from_slice(&self.urgent_ptr.to_be_bytes());
        Some(TCP_HLEN)
    }
}

/// Encoded MSS option as carried on SYN segments.
pub const fn mss_option(mss: u16) -> [u8; 4] {
    let b = mss.to_be_bytes();
    [TCP_OPT_MSS, TCP_OPT_MSS_LEN, b[0], b[1]]
}

/// Find the MSS option in an options area. Unknown options are skipped by
/// their length byte; a zero length ends the walk.
pub fn parse_mss_option(options: &[u8]) -> Option<u16> {
    let mut i = 0;
    while i < options.len() {
        match options[i] {
            TCP_OPT_END => break,
            TCP_OPT_NOP => i += 1,
            TCP_OPT_MSS => {
                if options.get(i + 1) == Some(&TCP_OPT_MSS_LEN) && i + 3 < options.len() {
                    return Some(u16::from_be_bytes([options[i + 2], options[i + 3]]));
                }
                break;
            }
            _ => {
                let len = *options.get(i + 1)? as usize;
                if len == 0 {
                    break;
                }
                i += len;
            }
        }
    }
    None
}

// =============================================================================
// Sequence number arithmetic
// =============================================================================

/// `a` is before `b` in sequence space.
#[inline]
pub fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// `a` is before or equal to `b` in sequence space.
#[inline]
pub fn seq_le(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) <= 0
}

/// `a` is after `b` in sequence space.
#[inline]
pub fn seq_gt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

/// `a` is after or equal to `b` in sequence space.
#[inline]
pub fn seq_ge(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) >= 0
}

/// `lo <= a <= hi` in sequence space.
#[inline]
pub fn seq_between(a: u32, lo: u32, hi: u32) -> bool {
    seq_ge(a, lo) && seq_le(a, hi)
}

// =============================================================================
// States
// =============================================================================

/// RFC 793 connection states, in the order the congestion code compares them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TcpState {
    Closed,
    Listen,
    SynSent,
    SynRcvd,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
}

impl TcpState {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Listen => "LISTEN",
            Self::SynSent => "SYN_SENT",
            Self::SynRcvd => "SYN_RCVD",
            Self::Established => "ESTABLISHED",
            Self::FinWait1 => "FIN_WAIT_1",
            Self::FinWait2 => "FIN_WAIT_2",
            Self::CloseWait => "CLOSE_WAIT",
            Self::Closing => "CLOSING",
            Self::LastAck => "LAST_ACK",
            Self::TimeWait => "TIME_WAIT",
        }
    }

    /// Data may be queued for sending in this state.
    pub const fn can_send(self) -> bool {
        matches!(
            self,
            Self::SynSent | Self::SynRcvd | Self::Established | Self::CloseWait
        )
    }
}

/// Progress of an active open as seen by the session that started it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SessionState {
    #[default]
    PreConnect,
    Connecting,
    Established,
    TimedOut,
    NoConnect,
}

// =============================================================================
// Segments
// =============================================================================

/// A queued segment. Each one holds a slot of the TCP segment pool.
pub struct TcpSeg {
    /// Outbound: TCP header followed by payload. Inbound: payload only.
    pub p: Pbuf,
    /// Payload bytes; SYN and FIN are not counted.
    pub len: u32,
    pub hdr: TcpHeader,
    pub(crate) slot: PoolHandle<()>,
}

impl TcpSeg {
    #[inline]
    pub fn seqno(&self) -> u32 {
        self.hdr.seq_num
    }

    /// Sequence space consumed: payload plus one for SYN or FIN.
    #[inline]
    pub fn tcplen(&self) -> u32 {
        self.len + u32::from(self.hdr.flags.intersects(TcpFlags::SYN | TcpFlags::FIN))
    }
}

/// Release a segment and its slot. Returns the number of pbuf nodes freed.
pub(crate) fn seg_free(seg: TcpSeg, segs: &mut Pool<()>) -> usize {
    segs.free(seg.slot);
    seg.p.free()
}

pub(crate) fn segs_free(queue: &mut VecDeque<TcpSeg>, segs: &mut Pool<()>) -> usize {
    let mut released = 0;
    while let Some(seg) = queue.pop_front() {
        released += seg_free(seg, segs);
    }
    released
}

// =============================================================================
// Control blocks
// =============================================================================

pub type TcpHandle = PoolHandle<TcpPcb>;
pub type ListenHandle = PoolHandle<TcpPcbListen>;

/// The four values naming a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TcpTuple {
    pub local_ip: Ipv4Addr,
    pub local_port: Port,
    pub remote_ip: Ipv4Addr,
    pub remote_port: Port,
}

pub struct TcpPcb {
    pub local_ip: Ipv4Addr,
    pub remote_ip: Ipv4Addr,
    pub local_port: Port,
    pub remote_port: Port,

    pub state: TcpState,
    pub session_state: SessionState,
    pub ssid: Option<Ssid>,
    pub prio: u8,
    pub flags: PcbFlags,

    pub rcv_nxt: u32,
    pub rcv_wnd: u16,

    /// Slow-timer tick of the last segment received.
    pub tmr: u32,
    pub polltmr: u8,
    /// Ticks since the last transmission.
    pub rtime: u16,

    pub mss: u16,

    /// Tick the running RTT sample started at; zero when none runs.
    pub rttest: u32,
    pub rtseq: u32,
    /// Smoothed RTT, scaled by 8.
    pub sa: i16,
    /// RTT mean deviation, scaled by 4.
    pub sv: i16,
    pub rto: u16,
    pub nrtx: u8,

    pub lastack: u32,
    pub dupacks: u8,
    pub cwnd: u16,
    pub ssthresh: u16,

    pub snd_nxt: u32,
    pub snd_max: u32,
    pub snd_wnd: u16,
    pub snd_wl1: u32,
    pub snd_wl2: u32,
    /// Sequence number after the last byte queued.
    pub snd_lbb: u32,
    /// Bytes acknowledged by the segment being processed.
    pub acked: u32,
    pub snd_buf: u16,
    /// Pbuf nodes held by `unsent` and `unacked`.
    pub snd_queuelen: u32,

    pub unsent: VecDeque<TcpSeg>,
    pub unacked: VecDeque<TcpSeg>,
    pub ooseq: VecDeque<TcpSeg>,

    recv_buf: Option<Pbuf>,
    recv_eof: bool,
}

impl TcpPcb {
    pub fn new(prio: u8, iss: u32, ticks: u32) -> Self {
        Self {
            local_ip: Ipv4Addr::ANY,
            remote_ip: Ipv4Addr::ANY,
            local_port: Port::ANY,
            remote_port: Port::ANY,
            state: TcpState::Closed,
            session_state: SessionState::PreConnect,
            ssid: None,
            prio,
            flags: PcbFlags::empty(),
            rcv_nxt: 0,
            rcv_wnd: TCP_WND,
            tmr: ticks,
            polltmr: 0,
            rtime: 0,
            mss: TCP_MSS,
            rttest: 0,
            rtseq: 0,
            sa: 0,
            sv: TCP_INITIAL_RTO as i16,
            rto: TCP_INITIAL_RTO,
            nrtx: 0,
            lastack: iss,
            dupacks: 0,
            cwnd: 1,
            ssthresh: TCP_MSS.saturating_mul(10),
            snd_nxt: iss,
            snd_max: iss,
            snd_wnd: 0,
            snd_wl1: 0,
            snd_wl2: iss,
            snd_lbb: iss,
            acked: 0,
            snd_buf: TCP_SND_BUF,
            snd_queuelen: 0,
            unsent: VecDeque::new(),
            unacked: VecDeque::new(),
            ooseq: VecDeque::new(),
            recv_buf: None,
            recv_eof: false,
        }
    }

    pub fn tuple(&self) -> TcpTuple {
        TcpTuple {
            local_ip: self.local_ip,
            local_port: self.local_port,
            remote_ip: self.remote_ip,
            remote_port: self.remote_port,
        }
    }

    /// Arm a delayed ACK, or promote an already delayed one. Returns `true`
    /// when the ACK should go out now.
    pub(crate) fn schedule_ack(&mut self) -> bool {
        if self.flags.contains(PcbFlags::ACK_DELAY) {
            self.flags.remove(PcbFlags::ACK_DELAY);
            self.flags.insert(PcbFlags::ACK_NOW);
            true
        } else {
            self.flags.insert(PcbFlags::ACK_DELAY);
            false
        }
    }

    /// Current retransmission timeout from the RTT estimator.
    pub(crate) fn rto_estimate(&self) -> u16 {
        ((self.sa >> 3) as i32 + self.sv as i32).clamp(1, u16::MAX as i32) as u16
    }

    /// Append in-order data for the session, or mark end of stream.
    pub fn stage_recv(&mut self, data: Option<Pbuf>) {
        match data {
            Some(p) => match &self.recv_buf {
                Some(buf) => buf.cat(p),
                None => self.recv_buf = Some(p),
            },
            None => self.recv_eof = true,
        }
    }

    /// Bytes staged and not yet taken.
    pub fn recv_pending(&self) -> usize {
        self.recv_buf.as_ref().map_or(0, |p| p.tot_len())
    }

    pub fn recv_eof(&self) -> bool {
        self.recv_eof
    }

    /// Take up to `max` staged bytes (`0` takes everything).
    pub fn take_recv(&mut self, max: usize) -> Option<Vec<u8>> {
        let p = self.recv_buf.take()?;
        let total = p.tot_len();
        let n = if max == 0 { total } else { max.min(total) };
        let mut out = vec![0u8; n];
        p.copy_out(0, &mut out);
        self.recv_buf = p.skip(n);
        Some(out)
    }
}

/// A listening endpoint. Much smaller than a full PCB: it only needs what a
/// SYN must match and what the new connection inherits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TcpPcbListen {
    pub local_ip: Ipv4Addr,
    pub local_port: Port,
    pub ssid: Option<Ssid>,
    pub prio: u8,
}

// =============================================================================
// Upcalls
// =============================================================================

/// What the receiver did with delivered data.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecvVerdict {
    Accepted,
    /// Close the connection once the callback returns.
    Close,
}

/// Upcalls from the engine. Every method has a default so a user only
/// overrides what it cares about; the defaults discard data and close on
/// end of stream.
pub trait TcpEvents {
    /// A passive open completed. An error aborts the new connection.
    fn accept(&mut self, _h: TcpHandle, _pcb: &mut TcpPcb) -> NetResult {
        Ok(())
    }

    /// An active open completed or failed.
    fn connected(&mut self, _h: TcpHandle, _pcb: &mut TcpPcb, _result: NetResult) {}

    /// `len` bytes of sent data were acknowledged.
    fn sent(&mut self, _h: TcpHandle, _pcb: &mut TcpPcb, _len: u32) {}

    /// In-order data arrived, or `None` once the peer has closed.
    fn recv(&mut self, _h: TcpHandle, pcb: &mut TcpPcb, data: Option<Pbuf>) -> RecvVerdict {
        discard_recv(pcb, data)
    }

    /// The connection is gone. The PCB has already been released.
    fn err(&mut self, _ssid: Option<Ssid>, _err: NetError) {}
}

/// Receive handling for connections nobody reads from: drop the data,
/// reopen the window and close once the peer has.
pub fn discard_recv(pcb: &mut TcpPcb, data: Option<Pbuf>) -> RecvVerdict {
    match data {
        Some(p) => {
            let len = p.tot_len();
            p.free();
            pcb.rcv_wnd = (pcb.rcv_wnd as usize + len).min(TCP_WND as usize) as u16;
            RecvVerdict::Accepted
        }
        None => RecvVerdict::Close,
    }
}

/// Events sink that keeps every default.
pub struct NullEvents;

impl TcpEvents for NullEvents {}

/// Collaborators an engine call may need: the interface, the IP layer and
/// the upcall sink.
pub struct TcpCtx<'a> {
    pub netif: &'a NetIf,
    pub io: &'a mut dyn IpOutput,
    pub ev: &'a mut dyn TcpEvents,
}

impl<'a> TcpCtx<'a> {
    pub fn new(netif: &'a NetIf, io: &'a mut dyn IpOutput, ev: &'a mut dyn TcpEvents) -> Self {
        Self { netif, io, ev }
    }
}

/// Engine resources a PCB operation borrows next to the PCB itself.
pub(crate) struct SegCtx<'a> {
    pub store: &'a Rc<BufStore>,
    pub segs: &'a mut Pool<()>,
    pub ticks: u32,
}

// =============================================================================
// Engine
// =============================================================================

pub struct Tcp {
    pub(crate) store: Rc<BufStore>,
    pub(crate) pcbs: Pool<TcpPcb>,
    pub(crate) listen_pcbs: Pool<TcpPcbListen>,
    pub(crate) segs: Pool<()>,
    pub(crate) active: Vec<TcpHandle>,
    pub(crate) tw: Vec<TcpHandle>,
    pub(crate) listen: Vec<ListenHandle>,
    /// Slow-timer ticks since start.
    pub(crate) ticks: u32,
    timer: u8,
    iss: u32,
    port: u16,
    /// PCB whose segment is being processed; output for it is deferred.
    pub(crate) input_pcb: Option<TcpHandle>,
}

impl Tcp {
    pub fn new(cfg: &NetConfig, store: Rc<BufStore>) -> Self {
        Self {
            store,
            pcbs: Pool::new(MempKind::TcpPcb, MempKind::TcpPcb.capacity(cfg)),
            listen_pcbs: Pool::new(
                MempKind::TcpPcbListen,
                MempKind::TcpPcbListen.capacity(cfg),
            ),
            segs: Pool::new(MempKind::TcpSeg, MempKind::TcpSeg.capacity(cfg)),
            active: Vec::new(),
            tw: Vec::new(),
            listen: Vec::new(),
            ticks: 0,
            timer: 0,
            iss: TCP_ISS_SEED,
            port: TCP_LOCAL_PORT_RANGE_START,
            input_pcb: None,
        }
    }

    // ---------------------------------------------------------------------
    // Accessors
    // ---------------------------------------------------------------------

    pub fn pcb(&self, h: TcpHandle) -> Option<&TcpPcb> {
        self.pcbs.get(h)
    }

    pub fn pcb_mut(&mut self, h: TcpHandle) -> Option<&mut TcpPcb> {
        self.pcbs.get_mut(h)
    }

    pub fn listen_pcb(&self, h: ListenHandle) -> Option<&TcpPcbListen> {
        self.listen_pcbs.get(h)
    }

    pub fn ticks(&self) -> u32 {
        self.ticks
    }

    pub fn active_pcbs(&self) -> &[TcpHandle] {
        &self.active
    }

    pub fn tw_pcbs(&self) -> &[TcpHandle] {
        &self.tw
    }

    pub fn listen_pcbs(&self) -> &[ListenHandle] {
        &self.listen
    }

    pub fn pcbs_in_use(&self) -> usize {
        self.pcbs.used()
    }

    pub fn segs_in_use(&self) -> usize {
        self.segs.used()
    }

    pub(crate) fn split(&mut self, h: TcpHandle) -> Option<(&mut TcpPcb, SegCtx<'_>)> {
        let pcb = self.pcbs.get_mut(h)?;
        Some((
            pcb,
            SegCtx {
                store: &self.store,
                segs: &mut self.segs,
                ticks: self.ticks,
            },
        ))
    }

    /// Registry invariants: TIME-WAIT PCBs only on the TIME-WAIT list, no
    /// listening or TIME-WAIT PCB on the active list, no handle on both, and
    /// no stale handles.
    pub fn pcbs_sane(&self) -> bool {
        let active_ok = self.active.iter().all(|&h| {
            self.pcbs
                .get(h)
                .is_some_and(|p| !matches!(p.state, TcpState::Listen | TcpState::TimeWait))
                && !self.tw.contains(&h)
        });
        let tw_ok = self.tw.iter().all(|&h| {
            self.pcbs
                .get(h)
                .is_some_and(|p| p.state == TcpState::TimeWait)
        });
        let listen_ok = self.listen.iter().all(|&h| self.listen_pcbs.contains(h));
        active_ok && tw_ok && listen_ok
    }

    // ---------------------------------------------------------------------
    // Allocation
    // ---------------------------------------------------------------------

    pub(crate) fn next_iss(&mut self) -> u32 {
        self.iss = self.iss.wrapping_add(self.ticks);
        self.iss
    }

    /// Allocate a PCB of priority `prio`. When the pool is empty the oldest
    /// TIME-WAIT connection is evicted first, then the oldest active one of
    /// no higher priority.
    pub fn alloc(&mut self, prio: u8, cx: &mut TcpCtx<'_>) -> Option<TcpHandle> {
        if self.pcbs.is_exhausted() {
            self.kill_timewait(cx);
            if self.pcbs.is_exhausted() {
                self.kill_prio(prio, cx);
            }
        }
        let iss = self.next_iss();
        let ticks = self.ticks;
        self.pcbs.alloc(TcpPcb::new(prio, iss, ticks))
    }

    pub fn new_pcb(&mut self, cx: &mut TcpCtx<'_>) -> Option<TcpHandle> {
        self.alloc(TCP_PRIO_NORMAL, cx)
    }

    pub fn setprio(&mut self, h: TcpHandle, prio: u8) {
        if let Some(pcb) = self.pcbs.get_mut(h) {
            pcb.prio = prio;
        }
    }

    fn kill_timewait(&mut self, cx: &mut TcpCtx<'_>) {
        let ticks = self.ticks;
        let oldest = self
            .tw
            .iter()
            .filter_map(|&h| self.pcbs.get(h).map(|p| (h, ticks.wrapping_sub(p.tmr))))
            .max_by_key(|&(_, age)| age)
            .map(|(h, _)| h);
        if let Some(h) = oldest {
            klog_debug!("tcp: evicting TIME-WAIT pcb {:?}", h);
            self.abort(h, cx);
        }
    }

    fn kill_prio(&mut self, prio: u8, cx: &mut TcpCtx<'_>) {
        let ticks = self.ticks;
        let mut mprio = TCP_PRIO_MAX;
        let mut inactivity = 0;
        let mut victim = None;
        for &h in &self.active {
            let Some(pcb) = self.pcbs.get(h) else {
                continue;
            };
            let age = ticks.wrapping_sub(pcb.tmr);
            if pcb.prio <= prio && pcb.prio <= mprio && age >= inactivity {
                inactivity = age;
                victim = Some(h);
                mprio = pcb.prio;
            }
        }
        if let Some(h) = victim {
            klog_debug!("tcp: evicting pcb {:?} prio={} idle={}", h, mprio, inactivity);
            self.abort(h, cx);
        }
    }

    // ---------------------------------------------------------------------
    // Registries
    // ---------------------------------------------------------------------

    fn port_in_use(&self, port: u16) -> bool {
        let used = |h: &TcpHandle| self.pcbs.get(*h).is_some_and(|p| p.local_port.0 == port);
        self.active.iter().any(used)
            || self.tw.iter().any(used)
            || self
                .listen
                .iter()
                .any(|&h| self.listen_pcbs.get(h).is_some_and(|l| l.local_port.0 == port))
    }

    /// Next free ephemeral port, cycling through the local port range.
    pub fn new_port(&mut self) -> Option<Port> {
        let span = (TCP_LOCAL_PORT_RANGE_END - TCP_LOCAL_PORT_RANGE_START) as usize + 1;
        for _ in 0..span {
            self.port = self.port.wrapping_add(1);
            if self.port > TCP_LOCAL_PORT_RANGE_END || self.port < TCP_LOCAL_PORT_RANGE_START {
                self.port = TCP_LOCAL_PORT_RANGE_START;
            }
            if !self.port_in_use(self.port) {
                return Some(Port(self.port));
            }
        }
        None
    }

    pub(crate) fn register_active(&mut self, h: TcpHandle) {
        if !self.active.contains(&h) {
            self.active.insert(0, h);
        }
    }

    pub(crate) fn move_to_timewait(&mut self, h: TcpHandle) {
        self.active.retain(|&x| x != h);
        if !self.tw.contains(&h) {
            self.tw.insert(0, h);
        }
    }

    fn unlink(&mut self, h: TcpHandle) {
        self.active.retain(|&x| x != h);
        self.tw.retain(|&x| x != h);
    }

    /// Take a PCB off its list, drop its queues, flush a delayed ACK and
    /// leave it CLOSED. The PCB stays allocated.
    pub fn remove(&mut self, h: TcpHandle, cx: &mut TcpCtx<'_>) {
        self.unlink(h);
        let Some((pcb, mut sx)) = self.split(h) else {
            return;
        };
        purge(pcb, sx.segs);
        if pcb.state != TcpState::TimeWait && pcb.flags.contains(PcbFlags::ACK_DELAY) {
            pcb.flags.insert(PcbFlags::ACK_NOW);
            let _ = crate::tcp_out::output(pcb, &mut sx, cx);
        }
        pcb.state = TcpState::Closed;
    }

    /// Free a PCB and every segment it still holds.
    pub fn release(&mut self, h: TcpHandle) {
        self.unlink(h);
        if let Some(mut pcb) = self.pcbs.free(h) {
            segs_free(&mut pcb.unsent, &mut self.segs);
            segs_free(&mut pcb.unacked, &mut self.segs);
            segs_free(&mut pcb.ooseq, &mut self.segs);
        }
    }

    // ---------------------------------------------------------------------
    // User operations
    // ---------------------------------------------------------------------

    /// Bind to `ip`/`port`; port 0 picks an ephemeral port. A port is taken
    /// when another PCB uses it and either address is the wildcard or both
    /// are equal.
    pub fn bind(&mut self, h: TcpHandle, ip: Ipv4Addr, port: Port) -> NetResult<Port> {
        if !self.pcbs.contains(h) {
            return Err(NetError::InvalidArgument);
        }
        let port = if port.is_any() {
            self.new_port().ok_or(NetError::AddrInUse)?
        } else {
            port
        };
        let clash = |lip: Ipv4Addr| lip.is_any() || ip.is_any() || lip == ip;
        let active_clash = self.active.iter().filter(|&&x| x != h).any(|&x| {
            self.pcbs
                .get(x)
                .is_some_and(|p| p.local_port == port && clash(p.local_ip))
        });
        let listen_clash = self.listen.iter().any(|&x| {
            self.listen_pcbs
                .get(x)
                .is_some_and(|l| l.local_port == port && clash(l.local_ip))
        });
        if active_clash || listen_clash {
            klog_debug!("tcp: bind port={} in use", port);
            return Err(NetError::AddrInUse);
        }
        let pcb = self.pcbs.get_mut(h).ok_or(NetError::InvalidArgument)?;
        if !ip.is_any() {
            pcb.local_ip = ip;
        }
        pcb.local_port = port;
        self.register_active(h);
        Ok(port)
    }

    /// Turn a bound PCB into a listening endpoint. The full PCB is freed and
    /// replaced by a [`TcpPcbListen`].
    pub fn listen(&mut self, h: TcpHandle) -> NetResult<ListenHandle> {
        let pcb = self.pcbs.get(h).ok_or(NetError::InvalidArgument)?;
        if pcb.state != TcpState::Closed {
            return Err(NetError::AlreadyConnected);
        }
        let lpcb = TcpPcbListen {
            local_ip: pcb.local_ip,
            local_port: pcb.local_port,
            ssid: pcb.ssid,
            prio: pcb.prio,
        };
        let lh = self.listen_pcbs.alloc(lpcb).ok_or(NetError::NoMemory)?;
        self.release(h);
        self.listen.insert(0, lh);
        klog_debug!("tcp: listening port={}", lpcb.local_port);
        Ok(lh)
    }

    pub fn close_listen(&mut self, lh: ListenHandle) {
        self.listen.retain(|&x| x != lh);
        self.listen_pcbs.free(lh);
    }

    /// Start an active open: send a SYN carrying our MSS.
    pub fn connect(
        &mut self,
        h: TcpHandle,
        ip: Ipv4Addr,
        port: Port,
        cx: &mut TcpCtx<'_>,
    ) -> NetResult {
        let pcb = self.pcbs.get(h).ok_or(NetError::InvalidArgument)?;
        if pcb.state != TcpState::Closed {
            return Err(NetError::AlreadyConnected);
        }
        let local_port = if pcb.local_port.is_any() {
            self.new_port().ok_or(NetError::AddrInUse)?
        } else {
            pcb.local_port
        };
        let iss = self.next_iss();
        let pcb = self.pcbs.get_mut(h).ok_or(NetError::InvalidArgument)?;
        pcb.remote_ip = ip;
        pcb.remote_port = port;
        pcb.local_port = local_port;
        pcb.rcv_nxt = 0;
        pcb.snd_nxt = iss;
        pcb.lastack = iss.wrapping_sub(1);
        pcb.snd_lbb = iss.wrapping_sub(1);
        pcb.rcv_wnd = TCP_WND;
        pcb.snd_wnd = TCP_WND;
        pcb.mss = TCP_MSS;
        pcb.cwnd = 1;
        pcb.ssthresh = pcb.mss.saturating_mul(10);
        pcb.state = TcpState::SynSent;
        self.register_active(h);
        klog_debug!("tcp: connect {}:{} from port={}", ip, port, local_port);

        let (pcb, mut sx) = self.split(h).ok_or(NetError::InvalidArgument)?;
        crate::tcp_out::enqueue(
            pcb,
            &mut sx,
            crate::tcp_out::Payload::Empty,
            TcpFlags::SYN,
            &mss_option(TCP_MSS),
        )?;
        self.output(h, cx)
    }

    /// Close the sending side: free a connection that never got going, send
    /// FIN on an open one, nothing once a FIN is already out.
    pub fn close(&mut self, h: TcpHandle, cx: &mut TcpCtx<'_>) -> NetResult {
        let state = self.pcbs.get(h).ok_or(NetError::InvalidArgument)?.state;
        klog_debug!("tcp: close {:?} in {}", h, state.name());
        match state {
            TcpState::Closed | TcpState::Listen | TcpState::SynSent => {
                self.remove(h, cx);
                self.release(h);
                return Ok(());
            }
            TcpState::SynRcvd | TcpState::Established => {
                self.send_ctrl(h, TcpFlags::FIN)?;
                if let Some(pcb) = self.pcbs.get_mut(h) {
                    pcb.state = TcpState::FinWait1;
                }
            }
            TcpState::CloseWait => {
                self.send_ctrl(h, TcpFlags::FIN)?;
                if let Some(pcb) = self.pcbs.get_mut(h) {
                    pcb.state = TcpState::LastAck;
                }
            }
            _ => {}
        }
        self.output(h, cx)
    }

    /// Drop the connection at once. The peer gets a RST unless the PCB is in
    /// TIME-WAIT or never left CLOSED.
    pub fn abort(&mut self, h: TcpHandle, cx: &mut TcpCtx<'_>) {
        let Some(pcb) = self.pcbs.get(h) else {
            return;
        };
        if pcb.state == TcpState::TimeWait {
            self.release(h);
            return;
        }
        let seqno = pcb.snd_nxt;
        let ackno = pcb.rcv_nxt;
        let tuple = pcb.tuple();
        let ssid = pcb.ssid;
        let state = pcb.state;
        self.release(h);
        cx.ev.err(ssid, NetError::ConnectionAborted);
        if state != TcpState::Closed {
            crate::tcp_out::send_rst(&self.store, cx, seqno, ackno, &tuple);
        }
    }

    /// The application consumed `len` bytes: reopen the window and owe the
    /// peer a window update.
    pub fn recved(&mut self, h: TcpHandle, len: usize, cx: &mut TcpCtx<'_>) {
        let Some(pcb) = self.pcbs.get_mut(h) else {
            return;
        };
        pcb.rcv_wnd = (pcb.rcv_wnd as usize + len).min(TCP_WND as usize) as u16;
        if !pcb.flags.intersects(PcbFlags::ACK_DELAY | PcbFlags::ACK_NOW) && pcb.schedule_ack() {
            let _ = self.output(h, cx);
        }
    }

    // ---------------------------------------------------------------------
    // Timers
    // ---------------------------------------------------------------------

    /// Combined timer, called every `TCP_TMR_INTERVAL` ms.
    pub fn tmr(&mut self, cx: &mut TcpCtx<'_>) {
        self.timer += 1;
        if self.timer == 9 {
            self.timer = 0;
        }
        if self.timer & 1 == 1 {
            self.fasttmr(cx);
        }
        if self.timer == 0 || self.timer == 4 {
            self.slowtmr(cx);
        }
    }

    /// Send delayed ACKs.
    pub fn fasttmr(&mut self, cx: &mut TcpCtx<'_>) {
        for h in self.active.clone() {
            let Some((pcb, mut sx)) = self.split(h) else {
                continue;
            };
            if pcb.flags.contains(PcbFlags::ACK_DELAY) {
                pcb.flags.insert(PcbFlags::ACK_NOW);
                let _ = crate::tcp_out::output(pcb, &mut sx, cx);
                pcb.flags.remove(PcbFlags::ACK_DELAY | PcbFlags::ACK_NOW);
            }
        }
    }

    /// Retransmissions, give-up limits and the FIN-WAIT-2, SYN-RCVD,
    /// out-of-order and TIME-WAIT timeouts.
    pub fn slowtmr(&mut self, cx: &mut TcpCtx<'_>) {
        self.ticks = self.ticks.wrapping_add(1);
        let ticks = self.ticks;

        for h in self.active.clone() {
            let Some((pcb, mut sx)) = self.split(h) else {
                continue;
            };
            let mut remove = if pcb.state == TcpState::SynSent && pcb.nrtx == TCP_SYNMAXRTX {
                true
            } else {
                pcb.nrtx == TCP_MAXRTX
            };

            if !remove {
                pcb.rtime = pcb.rtime.saturating_add(1);
                if !pcb.unacked.is_empty() && pcb.rtime >= pcb.rto {
                    if pcb.state != TcpState::SynSent {
                        let shift = TCP_BACKOFF.get(pcb.nrtx as usize).copied().unwrap_or(7);
                        pcb.rto = pcb.rto_estimate().saturating_mul(1 << shift);
                    }
                    klog_debug!("tcp: rexmit {:?} nrtx={} rto={}", h, pcb.nrtx, pcb.rto);
                    crate::tcp_out::rexmit_queue(pcb);
                    let _ = crate::tcp_out::output(pcb, &mut sx, cx);
                    let eff = pcb.cwnd.min(pcb.snd_wnd);
                    pcb.ssthresh = eff >> 1;
                    if pcb.ssthresh < pcb.mss {
                        pcb.ssthresh = pcb.mss.saturating_mul(2);
                    }
                    pcb.cwnd = pcb.mss;
                }
            }

            let idle = ticks.wrapping_sub(pcb.tmr);
            if pcb.state == TcpState::FinWait2 && idle > TCP_FIN_WAIT_TIMEOUT / TCP_SLOW_INTERVAL {
                remove = true;
            }
            if !pcb.ooseq.is_empty() && idle >= pcb.rto as u32 * TCP_OOSEQ_TIMEOUT {
                segs_free(&mut pcb.ooseq, sx.segs);
            }
            if pcb.state == TcpState::SynRcvd && idle > TCP_SYN_RCVD_TIMEOUT / TCP_SLOW_INTERVAL {
                remove = true;
            }

            if remove {
                let ssid = pcb.ssid;
                klog_info!("tcp: giving up on {:?} in {}", h, pcb.state.name());
                self.release(h);
                cx.ev.err(ssid, NetError::TimedOut);
            }
        }

        for h in self.tw.clone() {
            let expired = self
                .pcbs
                .get(h)
                .is_some_and(|p| ticks.wrapping_sub(p.tmr) > 2 * TCP_MSL / TCP_SLOW_INTERVAL);
            if expired {
                self.release(h);
            }
        }
    }
}

/// Drop every queued segment of a connection that is still in progress.
pub(crate) fn purge(pcb: &mut TcpPcb, segs: &mut Pool<()>) {
    if matches!(
        pcb.state,
        TcpState::Closed | TcpState::TimeWait | TcpState::Listen
    ) {
        return;
    }
    segs_free(&mut pcb.ooseq, segs);
    segs_free(&mut pcb.unsent, segs);
    segs_free(&mut pcb.unacked, segs);
    pcb.snd_queuelen = 0;
}

#[cfg(test)]
#[path = "tcp_tests.rs"]
mod tcp_tests;
