//! Inbound TCP: demultiplexing, the connection state machine and the
//! receive path (acknowledgement processing, congestion control, in-order
//! delivery and the out-of-order queue).
//!
//! # Flow
//!
//! ```text
//! Tcp::input ─► active list ─► process ─► receive
//!            │                    └────► upcalls, output
//!            ├► TIME-WAIT list ─► timewait_input
//!            ├► listen list ────► listen_input (new SYN_RCVD pcb)
//!            └► no match ───────► RST
//! ```
//!
//! Output for the connection being processed is deferred until its upcalls
//! have run, so a segment triggers at most one transmission burst.

use netsys_lib::{klog_debug, klog_trace};

use crate::config::{TCP_MSS, TCP_SND_BUF};
use crate::inet::inet_chksum_pseudo;
use crate::ip::Ipv4Header;
use crate::memp::Pool;
use crate::pbuf::Pbuf;
use crate::tcp::{
    ListenHandle, PcbFlags, RecvVerdict, TCP_HEADER_MAX_LEN, TCP_HLEN, Tcp, TcpCtx, TcpFlags,
    TcpHandle, TcpHeader, TcpPcb, TcpSeg, TcpState, TcpTuple, mss_option, parse_mss_option,
    purge, seg_free, seq_between, seq_gt, seq_le, seq_lt,
};
use crate::tcp_out::{Payload, enqueue, rexmit_one, send_rst};
use crate::types::{IpProtocol, Ipv4Addr, NetError, Port};

/// A segment being processed, with what processing produced for the
/// upcalls.
pub(crate) struct Input {
    /// Payload with the TCP header hidden. Taken when queued or delivered.
    pub(crate) p: Option<Pbuf>,
    pub(crate) hdr: TcpHeader,
    /// Payload bytes.
    pub(crate) len: u32,
    pub(crate) peer_mss: Option<u16>,
    pub(crate) recv_flags: PcbFlags,
    pub(crate) recv_data: Option<Pbuf>,
    pub(crate) src: Ipv4Addr,
    pub(crate) dst: Ipv4Addr,
}

impl Input {
    #[inline]
    pub(crate) fn tcplen(&self) -> u32 {
        self.len + u32::from(self.hdr.flags.intersects(TcpFlags::SYN | TcpFlags::FIN))
    }

    fn release(self) {
        if let Some(p) = self.p {
            p.free();
        }
        if let Some(p) = self.recv_data {
            p.free();
        }
    }

    /// Shorten the payload to `len` bytes. A FIN past the new end is lost
    /// with the data.
    fn trim(&mut self, len: u32) {
        if len < self.len {
            self.len = len;
            if let Some(p) = &self.p {
                p.realloc(len as usize);
            }
            self.hdr.flags.remove(TcpFlags::FIN);
        }
    }
}

fn trim_seg(seg: &mut TcpSeg, len: u32) {
    if len < seg.len {
        seg.len = len;
        seg.p.realloc(len as usize);
        seg.hdr.flags.remove(TcpFlags::FIN);
    }
}

/// What `process` leaves for the caller once the PCB borrow has ended.
enum Step {
    Done,
    Abort,
    TimeWait,
}

impl Tcp {
    /// Handle one inbound TCP segment. `p` starts at the IPv4 header
    /// described by `iph` and is consumed.
    pub fn input(&mut self, p: Pbuf, iph: &Ipv4Header, cx: &mut TcpCtx<'_>) {
        if p.header(-(iph.header_len as isize)).is_err() || p.tot_len() < TCP_HLEN {
            klog_debug!("tcp: short segment from {}", iph.src);
            p.free();
            return;
        }
        if cx.netif.is_broadcast(iph.dst) || iph.dst.is_multicast() {
            p.free();
            return;
        }
        if inet_chksum_pseudo(&p, iph.src, iph.dst, IpProtocol::Tcp, p.tot_len()) != 0 {
            klog_debug!("tcp: bad checksum from {}", iph.src);
            p.free();
            return;
        }

        let mut raw = [0u8; TCP_HEADER_MAX_LEN];
        let n = p.copy_out(0, &mut raw);
        let Some(hdr) = TcpHeader::parse(&raw[..n]) else {
            klog_debug!("tcp: malformed header from {}", iph.src);
            p.free();
            return;
        };
        let hlen = hdr.header_len();
        if p.hide_front(hlen).is_err() {
            p.free();
            return;
        }
        let len = p.tot_len() as u32;
        klog_trace!(
            "tcp: in {}:{} -> {} seq={} ack={} flags={:?} len={}",
            iph.src,
            hdr.src_port,
            hdr.dst_port,
            hdr.seq_num,
            hdr.ack_num,
            hdr.flags,
            len
        );
        let inp = Input {
            p: Some(p),
            hdr,
            len,
            peer_mss: parse_mss_option(&raw[TCP_HLEN..hlen]),
            recv_flags: PcbFlags::empty(),
            recv_data: None,
            src: iph.src,
            dst: iph.dst,
        };

        let matches = |pcb: &TcpPcb| {
            pcb.state != TcpState::Closed
                && pcb.remote_port.0 == hdr.src_port
                && pcb.local_port.0 == hdr.dst_port
                && pcb.remote_ip == iph.src
                && pcb.local_ip == iph.dst
        };

        if let Some(i) = self
            .active
            .iter()
            .position(|&h| self.pcbs.get(h).is_some_and(matches))
        {
            let h = self.active.remove(i);
            self.active.insert(0, h);
            self.active_input(h, inp, cx);
            return;
        }

        if let Some(i) = self
            .tw
            .iter()
            .position(|&h| self.pcbs.get(h).is_some_and(|p| {
                p.remote_port.0 == hdr.src_port
                    && p.local_port.0 == hdr.dst_port
                    && p.remote_ip == iph.src
                    && p.local_ip == iph.dst
            }))
        {
            let h = self.tw.remove(i);
            self.tw.insert(0, h);
            self.timewait_input(h, inp, cx);
            return;
        }

        if let Some(i) = self.listen.iter().position(|&lh| {
            self.listen_pcbs.get(lh).is_some_and(|l| {
                l.local_port.0 == hdr.dst_port && (l.local_ip.is_any() || l.local_ip == iph.dst)
            })
        }) {
            let lh = self.listen.remove(i);
            self.listen.insert(0, lh);
            self.listen_input(lh, inp, cx);
            return;
        }

        if !hdr.flags.contains(TcpFlags::RST) {
            let tuple = TcpTuple {
                local_ip: iph.dst,
                local_port: Port(hdr.dst_port),
                remote_ip: iph.src,
                remote_port: Port(hdr.src_port),
            };
            send_rst(
                &self.store,
                cx,
                hdr.ack_num,
                hdr.seq_num.wrapping_add(inp.tcplen()),
                &tuple,
            );
        }
        inp.release();
    }

    fn active_input(&mut self, h: TcpHandle, mut inp: Input, cx: &mut TcpCtx<'_>) {
        self.input_pcb = Some(h);
        let step = self.process(h, &mut inp, cx);
        self.input_pcb = None;

        match step {
            Step::Abort => {
                inp.release();
                self.abort(h, cx);
                return;
            }
            Step::TimeWait => self.move_to_timewait(h),
            Step::Done => {}
        }

        if inp.recv_flags.contains(PcbFlags::RESET) {
            let mut ssid = None;
            if let Some(pcb) = self.pcbs.get_mut(h) {
                ssid = pcb.ssid;
                if pcb.state == TcpState::SynSent {
                    cx.ev.connected(h, pcb, Err(NetError::ConnectionReset));
                }
            }
            klog_debug!("tcp: connection {:?} reset by peer", h);
            self.release(h);
            cx.ev.err(ssid, NetError::ConnectionReset);
            inp.release();
            return;
        }
        if inp.recv_flags.contains(PcbFlags::CLOSED) {
            let ssid = self.pcbs.get(h).and_then(|p| p.ssid);
            self.remove(h, cx);
            self.release(h);
            cx.ev.err(ssid, NetError::Closed);
            inp.release();
            return;
        }

        let mut close = false;
        if let Some(pcb) = self.pcbs.get_mut(h) {
            if pcb.acked > 0 {
                let acked = pcb.acked;
                cx.ev.sent(h, pcb, acked);
            }
            if let Some(data) = inp.recv_data.take() {
                close |= cx.ev.recv(h, pcb, Some(data)) == RecvVerdict::Close;
            }
            if inp.recv_flags.contains(PcbFlags::GOT_FIN) {
                close |= cx.ev.recv(h, pcb, None) == RecvVerdict::Close;
            }
        }
        inp.release();
        if close {
            let _ = self.close(h, cx);
        }
        if self.pcbs.contains(h) {
            let _ = self.output(h, cx);
        }
    }

    /// The state machine. Runs with output deferred.
    fn process(&mut self, h: TcpHandle, inp: &mut Input, cx: &mut TcpCtx<'_>) -> Step {
        let Some((pcb, sx)) = self.split(h) else {
            return Step::Done;
        };
        let flags = inp.hdr.flags;
        let seqno = inp.hdr.seq_num;
        let ackno = inp.hdr.ack_num;
        pcb.acked = 0;

        if flags.contains(TcpFlags::RST) {
            let acceptable = if pcb.state == TcpState::SynSent {
                ackno == pcb.snd_nxt
            } else {
                seq_between(
                    seqno,
                    pcb.rcv_nxt,
                    pcb.rcv_nxt.wrapping_add(pcb.rcv_wnd as u32),
                )
            };
            if acceptable {
                inp.recv_flags.insert(PcbFlags::RESET);
                pcb.flags.remove(PcbFlags::ACK_DELAY);
            } else {
                klog_debug!("tcp: unacceptable rst seq={} rcv_nxt={}", seqno, pcb.rcv_nxt);
            }
            return Step::Done;
        }

        pcb.tmr = sx.ticks;

        match pcb.state {
            TcpState::SynSent => {
                let syn_acked = pcb
                    .unacked
                    .front()
                    .is_some_and(|s| ackno == s.seqno().wrapping_add(1));
                if flags.contains(TcpFlags::ACK | TcpFlags::SYN) && syn_acked {
                    pcb.rcv_nxt = seqno.wrapping_add(1);
                    pcb.lastack = ackno;
                    pcb.snd_wnd = inp.hdr.window_size;
                    pcb.snd_wl1 = seqno;
                    pcb.snd_wl2 = ackno;
                    pcb.state = TcpState::Established;
                    pcb.cwnd = pcb.mss;
                    if let Some(syn) = pcb.unacked.pop_front() {
                        pcb.snd_queuelen = pcb.snd_queuelen.saturating_sub(syn.p.clen() as u32);
                        seg_free(syn, sx.segs);
                    }
                    if let Some(mss) = inp.peer_mss {
                        pcb.mss = mss.clamp(1, TCP_MSS);
                    }
                    klog_debug!("tcp: {:?} established (active)", h);
                    cx.ev.connected(h, pcb, Ok(()));
                    pcb.schedule_ack();
                }
            }
            TcpState::SynRcvd => {
                if flags.contains(TcpFlags::ACK)
                    && seq_between(ackno, pcb.lastack.wrapping_add(1), pcb.snd_nxt)
                {
                    pcb.state = TcpState::Established;
                    klog_debug!("tcp: {:?} established (passive)", h);
                    if cx.ev.accept(h, pcb).is_err() {
                        return Step::Abort;
                    }
                    receive(pcb, inp, sx.segs, sx.ticks);
                    pcb.cwnd = pcb.mss;
                }
            }
            TcpState::Established | TcpState::CloseWait => {
                receive(pcb, inp, sx.segs, sx.ticks);
                if inp.recv_flags.contains(PcbFlags::GOT_FIN) {
                    pcb.flags.insert(PcbFlags::ACK_NOW);
                    pcb.state = TcpState::CloseWait;
                }
            }
            TcpState::FinWait1 => {
                receive(pcb, inp, sx.segs, sx.ticks);
                let fin_acked = flags.contains(TcpFlags::ACK) && ackno == pcb.snd_nxt;
                if inp.recv_flags.contains(PcbFlags::GOT_FIN) {
                    pcb.flags.insert(PcbFlags::ACK_NOW);
                    if fin_acked {
                        purge(pcb, sx.segs);
                        pcb.state = TcpState::TimeWait;
                        return Step::TimeWait;
                    }
                    pcb.state = TcpState::Closing;
                } else if fin_acked {
                    pcb.state = TcpState::FinWait2;
                }
            }
            TcpState::FinWait2 => {
                receive(pcb, inp, sx.segs, sx.ticks);
                if inp.recv_flags.contains(PcbFlags::GOT_FIN) {
                    pcb.flags.insert(PcbFlags::ACK_NOW);
                    purge(pcb, sx.segs);
                    pcb.state = TcpState::TimeWait;
                    return Step::TimeWait;
                }
            }
            TcpState::Closing => {
                receive(pcb, inp, sx.segs, sx.ticks);
                if flags.contains(TcpFlags::ACK) && ackno == pcb.snd_nxt {
                    pcb.flags.insert(PcbFlags::ACK_NOW);
                    purge(pcb, sx.segs);
                    pcb.state = TcpState::TimeWait;
                    return Step::TimeWait;
                }
            }
            TcpState::LastAck => {
                receive(pcb, inp, sx.segs, sx.ticks);
                if flags.contains(TcpFlags::ACK) && ackno == pcb.snd_nxt {
                    pcb.state = TcpState::Closed;
                    inp.recv_flags.insert(PcbFlags::CLOSED);
                }
            }
            TcpState::Closed | TcpState::Listen | TcpState::TimeWait => {}
        }
        Step::Done
    }

    /// A segment for a listening endpoint. A SYN spawns a connection in
    /// SYN-RCVD that inherits the endpoint's session and priority.
    fn listen_input(&mut self, lh: ListenHandle, inp: Input, cx: &mut TcpCtx<'_>) {
        let flags = inp.hdr.flags;
        let Some(&lpcb) = self.listen_pcbs.get(lh) else {
            inp.release();
            return;
        };
        if flags.contains(TcpFlags::RST) {
            // Nothing to answer.
        } else if flags.contains(TcpFlags::ACK) {
            let tuple = TcpTuple {
                local_ip: inp.dst,
                local_port: Port(inp.hdr.dst_port),
                remote_ip: inp.src,
                remote_port: Port(inp.hdr.src_port),
            };
            send_rst(
                &self.store,
                cx,
                inp.hdr.ack_num,
                inp.hdr.seq_num.wrapping_add(inp.tcplen()),
                &tuple,
            );
        } else if flags.contains(TcpFlags::SYN) {
            let Some(h) = self.alloc(lpcb.prio, cx) else {
                klog_debug!("tcp: no pcb for SYN to port={}", lpcb.local_port);
                inp.release();
                return;
            };
            let ticks = self.ticks;
            if let Some(pcb) = self.pcbs.get_mut(h) {
                pcb.local_ip = inp.dst;
                pcb.local_port = lpcb.local_port;
                pcb.remote_ip = inp.src;
                pcb.remote_port = Port(inp.hdr.src_port);
                pcb.state = TcpState::SynRcvd;
                pcb.rcv_nxt = inp.hdr.seq_num.wrapping_add(1);
                pcb.snd_wnd = inp.hdr.window_size;
                pcb.ssthresh = pcb.snd_wnd;
                pcb.snd_wl1 = inp.hdr.seq_num;
                pcb.ssid = lpcb.ssid;
                pcb.prio = lpcb.prio;
                pcb.tmr = ticks;
                if let Some(mss) = inp.peer_mss {
                    pcb.mss = mss.clamp(1, TCP_MSS);
                }
            }
            self.register_active(h);
            klog_debug!(
                "tcp: SYN from {}:{} on port={}",
                inp.src,
                inp.hdr.src_port,
                lpcb.local_port
            );
            if let Some((pcb, mut sx)) = self.split(h) {
                let _ = enqueue(
                    pcb,
                    &mut sx,
                    Payload::Empty,
                    TcpFlags::SYN | TcpFlags::ACK,
                    &mss_option(TCP_MSS),
                );
            }
            let _ = self.output(h, cx);
        }
        inp.release();
    }

    /// TIME-WAIT only re-acknowledges: the peer may not have seen our last
    /// ACK.
    fn timewait_input(&mut self, h: TcpHandle, inp: Input, cx: &mut TcpCtx<'_>) {
        let tcplen = inp.tcplen();
        let end = inp.hdr.seq_num.wrapping_add(tcplen);
        if let Some(pcb) = self.pcbs.get_mut(h) {
            if seq_gt(end, pcb.rcv_nxt) {
                pcb.rcv_nxt = end;
            }
            if tcplen > 0 {
                pcb.flags.insert(PcbFlags::ACK_NOW);
            }
        }
        inp.release();
        let _ = self.output(h, cx);
    }
}

// =============================================================================
// Receive path
// =============================================================================

/// Wrap the inbound payload as a queue segment. `None` when the segment
/// pool is empty.
fn to_seg(inp: &mut Input, segs: &mut Pool<()>) -> Option<TcpSeg> {
    let slot = segs.alloc(())?;
    let Some(p) = inp.p.take() else {
        segs.free(slot);
        return None;
    };
    Some(TcpSeg {
        p,
        len: inp.len,
        hdr: inp.hdr,
        slot,
    })
}

/// Process the acknowledgement and the data of a segment on a
/// synchronized connection.
pub(crate) fn receive(pcb: &mut TcpPcb, inp: &mut Input, segs: &mut Pool<()>, ticks: u32) {
    let flags = inp.hdr.flags;
    let ackno = inp.hdr.ack_num;
    let wnd = inp.hdr.window_size;

    if flags.contains(TcpFlags::ACK) {
        process_ack(pcb, inp.hdr.seq_num, ackno, wnd, segs, ticks);
    }

    let tcplen = inp.tcplen();
    if tcplen == 0 {
        let seqno = inp.hdr.seq_num;
        if !seq_between(
            seqno,
            pcb.rcv_nxt,
            pcb.rcv_nxt.wrapping_add(pcb.rcv_wnd as u32).wrapping_sub(1),
        ) {
            pcb.flags.insert(PcbFlags::ACK_NOW);
        }
        return;
    }

    // Cut off the part already received.
    let mut seqno = inp.hdr.seq_num;
    if seq_between(
        pcb.rcv_nxt,
        seqno.wrapping_add(1),
        seqno.wrapping_add(tcplen).wrapping_sub(1),
    ) {
        let off = pcb.rcv_nxt.wrapping_sub(seqno);
        if let Some(p) = &inp.p {
            let _ = p.hide_front(off as usize);
        }
        inp.len = inp.len.saturating_sub(off);
        seqno = pcb.rcv_nxt;
        inp.hdr.seq_num = seqno;
    } else if seq_lt(seqno, pcb.rcv_nxt) {
        // Entirely old: a retransmission of something already delivered.
        pcb.flags.insert(PcbFlags::ACK_NOW);
    }

    let in_window = seq_between(
        seqno,
        pcb.rcv_nxt,
        pcb.rcv_nxt.wrapping_add(pcb.rcv_wnd as u32).wrapping_sub(1),
    );
    if !in_window {
        pcb.flags.insert(PcbFlags::ACK_NOW);
        return;
    }

    if pcb.rcv_nxt == seqno {
        if let Some(front) = pcb.ooseq.front()
            && seq_le(front.seqno(), seqno.wrapping_add(inp.len))
        {
            inp.trim(front.seqno().wrapping_sub(seqno));
        }
        let tcplen = inp.tcplen();
        pcb.rcv_nxt = pcb.rcv_nxt.wrapping_add(tcplen);
        pcb.rcv_wnd = pcb.rcv_wnd.saturating_sub(tcplen.min(u16::MAX as u32) as u16);

        if let Some(p) = inp.p.take() {
            if p.tot_len() > 0 {
                inp.recv_data = Some(p);
            } else {
                p.free();
            }
        }
        if inp.hdr.flags.contains(TcpFlags::FIN) {
            inp.recv_flags.insert(PcbFlags::GOT_FIN);
        }

        while pcb.ooseq.front().is_some_and(|s| s.seqno() == pcb.rcv_nxt) {
            let Some(cseg) = pcb.ooseq.pop_front() else {
                break;
            };
            let clen = cseg.tcplen();
            pcb.rcv_nxt = pcb.rcv_nxt.wrapping_add(clen);
            pcb.rcv_wnd = pcb.rcv_wnd.saturating_sub(clen.min(u16::MAX as u32) as u16);
            if cseg.hdr.flags.contains(TcpFlags::FIN) {
                inp.recv_flags.insert(PcbFlags::GOT_FIN);
            }
            segs.free(cseg.slot);
            if cseg.p.tot_len() > 0 {
                match &inp.recv_data {
                    Some(data) => data.cat(cseg.p),
                    None => inp.recv_data = Some(cseg.p),
                }
            } else {
                cseg.p.free();
            }
        }
        pcb.schedule_ack();
    } else {
        pcb.flags.insert(PcbFlags::ACK_NOW);
        ooseq_insert(pcb, inp, segs);
    }
}

/// Window update, duplicate-ACK counting with fast retransmit, new-ACK
/// congestion growth, queue cleanup and the RTT estimator.
fn process_ack(
    pcb: &mut TcpPcb,
    seqno: u32,
    ackno: u32,
    wnd: u16,
    segs: &mut Pool<()>,
    ticks: u32,
) {
    let right_wnd_edge = pcb.snd_wl1.wrapping_add(pcb.snd_wnd as u32);
    if seq_lt(pcb.snd_wl1, seqno)
        || (pcb.snd_wl1 == seqno && seq_lt(pcb.snd_wl2, ackno))
        || (pcb.snd_wl2 == ackno && wnd > pcb.snd_wnd)
    {
        pcb.snd_wnd = wnd;
        pcb.snd_wl1 = seqno;
        pcb.snd_wl2 = ackno;
    }

    if pcb.lastack == ackno {
        pcb.acked = 0;
        if pcb.snd_wl1.wrapping_add(pcb.snd_wnd as u32) == right_wnd_edge {
            pcb.dupacks = pcb.dupacks.saturating_add(1);
            if pcb.dupacks >= 3 && !pcb.unacked.is_empty() {
                if !pcb.flags.contains(PcbFlags::INFR) {
                    klog_debug!("tcp: fast retransmit seq={}", ackno);
                    rexmit_one(pcb);
                    let flight = pcb.snd_max.wrapping_sub(pcb.lastack) / 2;
                    let floor = 2 * pcb.mss as u32;
                    pcb.ssthresh = flight.max(floor).min(u16::MAX as u32) as u16;
                    pcb.cwnd = pcb.ssthresh.saturating_add(pcb.mss.saturating_mul(3));
                    pcb.flags.insert(PcbFlags::INFR);
                } else if let Some(cwnd) = pcb.cwnd.checked_add(pcb.mss) {
                    pcb.cwnd = cwnd;
                }
            }
        }
    } else if seq_between(ackno, pcb.lastack.wrapping_add(1), pcb.snd_max) {
        if pcb.flags.contains(PcbFlags::INFR) {
            pcb.flags.remove(PcbFlags::INFR);
            pcb.cwnd = pcb.ssthresh;
        }
        pcb.nrtx = 0;
        pcb.rto = pcb.rto_estimate();
        pcb.acked = ackno.wrapping_sub(pcb.lastack);
        pcb.snd_buf = (pcb.snd_buf as u32 + pcb.acked).min(TCP_SND_BUF as u32) as u16;
        pcb.dupacks = 0;
        pcb.lastack = ackno;

        if pcb.state >= TcpState::Established {
            if pcb.cwnd < pcb.ssthresh {
                if let Some(cwnd) = pcb.cwnd.checked_add(pcb.mss) {
                    pcb.cwnd = cwnd;
                }
            } else {
                let mss = pcb.mss as u32;
                let grown = pcb.cwnd as u32 + mss * mss / (pcb.cwnd as u32).max(1);
                if grown > pcb.cwnd as u32 && grown <= u16::MAX as u32 {
                    pcb.cwnd = grown as u16;
                }
            }
        }

        while pcb
            .unacked
            .front()
            .is_some_and(|s| seq_le(s.seqno().wrapping_add(s.tcplen()), ackno))
        {
            let Some(seg) = pcb.unacked.pop_front() else {
                break;
            };
            pcb.snd_queuelen = pcb.snd_queuelen.saturating_sub(seg.p.clen() as u32);
            seg_free(seg, segs);
        }
        pcb.polltmr = 0;
    }

    // Segments moved back for retransmission may already be covered.
    while pcb.unsent.front().is_some_and(|s| {
        seq_between(ackno, s.seqno().wrapping_add(s.tcplen()), pcb.snd_max)
    }) {
        let Some(seg) = pcb.unsent.pop_front() else {
            break;
        };
        pcb.snd_queuelen = pcb.snd_queuelen.saturating_sub(seg.p.clen() as u32);
        seg_free(seg, segs);
        if let Some(next) = pcb.unsent.front() {
            pcb.snd_nxt = next.seqno();
        }
    }

    if pcb.rttest != 0 && seq_lt(pcb.rtseq, ackno) {
        let mut m = ticks.wrapping_sub(pcb.rttest) as i32;
        m -= (pcb.sa >> 3) as i32;
        let sa = pcb.sa as i32 + m;
        if m < 0 {
            m = -m;
        }
        m -= (pcb.sv >> 2) as i32;
        let sv = pcb.sv as i32 + m;
        pcb.sa = sa.clamp(i16::MIN as i32, i16::MAX as i32) as i16;
        pcb.sv = sv.clamp(i16::MIN as i32, i16::MAX as i32) as i16;
        pcb.rto = pcb.rto_estimate();
        pcb.rttest = 0;
    }
}

/// Queue an out-of-order segment, keeping `ooseq` sorted and free of
/// overlap. A segment with a known sequence number replaces the queued one
/// only when it is longer.
fn ooseq_insert(pcb: &mut TcpPcb, inp: &mut Input, segs: &mut Pool<()>) {
    let seqno = inp.hdr.seq_num;
    if pcb.ooseq.is_empty() {
        if let Some(seg) = to_seg(inp, segs) {
            pcb.ooseq.push_back(seg);
        }
        return;
    }

    let n = pcb.ooseq.len();
    for i in 0..n {
        let next_seq = pcb.ooseq[i].seqno();
        if seqno == next_seq {
            if inp.len > pcb.ooseq[i].len
                && let Some(seg) = to_seg(inp, segs)
            {
                let old = core::mem::replace(&mut pcb.ooseq[i], seg);
                seg_free(old, segs);
            }
            return;
        }

        if i == 0 {
            if seq_lt(seqno, next_seq) {
                if seq_gt(seqno.wrapping_add(inp.len), next_seq) {
                    inp.trim(next_seq.wrapping_sub(seqno));
                }
                if let Some(seg) = to_seg(inp, segs) {
                    pcb.ooseq.push_front(seg);
                }
                return;
            }
        } else {
            let prev_seq = pcb.ooseq[i - 1].seqno();
            if seq_lt(prev_seq, seqno) && seq_lt(seqno, next_seq) {
                if seq_gt(seqno.wrapping_add(inp.len), next_seq) {
                    inp.trim(next_seq.wrapping_sub(seqno));
                }
                if let Some(seg) = to_seg(inp, segs) {
                    pcb.ooseq.insert(i, seg);
                    let prev = &mut pcb.ooseq[i - 1];
                    if seq_gt(prev.seqno().wrapping_add(prev.len), seqno) {
                        trim_seg(prev, seqno.wrapping_sub(prev_seq));
                    }
                }
                return;
            }
        }

        if i == n - 1 && seq_gt(seqno, next_seq) {
            if let Some(seg) = to_seg(inp, segs) {
                pcb.ooseq.push_back(seg);
                let last = &mut pcb.ooseq[i];
                if seq_gt(last.seqno().wrapping_add(last.len), seqno) {
                    trim_seg(last, seqno.wrapping_sub(next_seq));
                }
            }
            return;
        }
    }
}

#[cfg(test)]
#[path = "tcp_in_tests.rs"]
mod tcp_in_tests;
