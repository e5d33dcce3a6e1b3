//! Outbound TCP: segmenting user data onto the send queue and transmitting
//! what the send and congestion windows allow.
//!
//! Segments are built at enqueue time with room for every lower header, so
//! transmission only fills in the acknowledgement fields and the checksum.
//! A segment leaves `unsent` when transmitted and waits on `unacked` until
//! the peer acknowledges it; retransmission moves it back.

use alloc::collections::VecDeque;
use alloc::rc::Rc;

use netsys_lib::{klog_debug, klog_warn};

use crate::config::{TCP_SND_QUEUELEN, TCP_TTL, TCP_WND};
use crate::inet::inet_chksum_pseudo;
use crate::ip::ip_output_keep;
use crate::pbuf::{BufStore, Pbuf, PbufKind, PbufLayer};
use crate::tcp::{
    PcbFlags, SegCtx, TCP_HLEN, Tcp, TcpCtx, TcpFlags, TcpHandle, TcpHeader, TcpPcb, TcpSeg,
    TcpState, TcpTuple, seq_lt, segs_free,
};
use crate::types::{IpProtocol, Ipv4Addr, NetError, NetResult};

/// Where the bytes of an enqueue come from.
pub(crate) enum Payload<'a> {
    Empty,
    /// Copied into freshly allocated buffers.
    Copy(&'a [u8]),
    /// Referenced in place; segments hold REF buffers onto it.
    Shared(&'a Rc<[u8]>),
}

impl Payload<'_> {
    fn len(&self) -> usize {
        match self {
            Self::Empty => 0,
            Self::Copy(d) => d.len(),
            Self::Shared(d) => d.len(),
        }
    }
}

/// Allocate one segment: a segment slot, then a buffer holding the options
/// (SYN) or `seglen` payload bytes from `pos`, with the TCP header revealed
/// in front.
fn build_segment(
    sx: &mut SegCtx<'_>,
    data: &Payload<'_>,
    pos: usize,
    seglen: usize,
    hdr: TcpHeader,
    optdata: &[u8],
) -> NetResult<TcpSeg> {
    let slot = sx.segs.alloc(()).ok_or(NetError::NoMemory)?;
    let p = if !optdata.is_empty() {
        Pbuf::from_slice(sx.store, PbufLayer::Transport, optdata, PbufKind::Ram)
    } else {
        match data {
            Payload::Empty => Pbuf::alloc(sx.store, PbufLayer::Transport, 0, PbufKind::Ram),
            Payload::Copy(d) => Pbuf::from_slice(
                sx.store,
                PbufLayer::Transport,
                &d[pos..pos + seglen],
                PbufKind::Ram,
            ),
            Payload::Shared(d) => {
                let head = Pbuf::alloc(sx.store, PbufLayer::Transport, 0, PbufKind::Ram);
                match (head, Pbuf::reference(sx.store, Rc::clone(d), pos..pos + seglen)) {
                    (Some(head), Some(body)) => {
                        head.cat(body);
                        Some(head)
                    }
                    _ => None,
                }
            }
        }
    };
    let Some(p) = p else {
        sx.segs.free(slot);
        klog_debug!("tcp: no buffer for {} byte segment", seglen);
        return Err(NetError::NoBufs);
    };
    if p.header(TCP_HLEN as isize).is_err() {
        p.free();
        sx.segs.free(slot);
        return Err(NetError::NoBufs);
    }
    Ok(TcpSeg {
        p,
        len: seglen as u32,
        hdr,
        slot,
    })
}

/// Split `data` into MSS-sized segments and append them to `unsent`. On any
/// failure nothing is queued and the send state is untouched.
pub(crate) fn enqueue(
    pcb: &mut TcpPcb,
    sx: &mut SegCtx<'_>,
    data: Payload<'_>,
    flags: TcpFlags,
    optdata: &[u8],
) -> NetResult {
    let len = data.len();
    if len > pcb.snd_buf as usize {
        klog_debug!("tcp: enqueue {} exceeds snd_buf {}", len, pcb.snd_buf);
        return Err(NetError::SendBufferFull);
    }
    let mut queuelen = pcb.snd_queuelen;
    if queuelen >= TCP_SND_QUEUELEN {
        return Err(NetError::SendBufferFull);
    }

    let optlen = optdata.len();
    let seqno = pcb.snd_lbb;
    let mss = (pcb.mss as usize).max(1);
    let mut queue: VecDeque<TcpSeg> = VecDeque::new();
    let mut left = len;
    let mut pos = 0;
    let mut last_seglen = 0;

    let built = loop {
        let seglen = left.min(mss);
        let mut hdr = TcpHeader::new(
            pcb.local_port.0,
            pcb.remote_port.0,
            seqno.wrapping_add(pos as u32),
            flags,
        );
        hdr.data_offset = (5 + optlen / 4) as u8;
        match build_segment(sx, &data, pos, seglen, hdr, optdata) {
            Ok(seg) => {
                queuelen += seg.p.clen() as u32;
                queue.push_back(seg);
            }
            Err(e) => break Err(e),
        }
        if queuelen > TCP_SND_QUEUELEN {
            break Err(NetError::SendBufferFull);
        }
        left -= seglen;
        pos += seglen;
        last_seglen = seglen;
        if left == 0 {
            break Ok(());
        }
    };
    if let Err(e) = built {
        segs_free(&mut queue, sx.segs);
        return Err(e);
    }

    // Coalesce the first new segment into the unsent tail when both carry
    // plain data and the result still fits one MSS.
    let mergeable = |tail: &TcpSeg, head: &TcpSeg| {
        tail.len > 0
            && head.len > 0
            && !tail.hdr.flags.intersects(TcpFlags::SYN | TcpFlags::FIN)
            && !flags.intersects(TcpFlags::SYN | TcpFlags::FIN)
            && tail.hdr.data_offset == 5
            && optlen == 0
            && (tail.len + head.len) as usize <= mss
    };
    let merge = match (pcb.unsent.back(), queue.front()) {
        (Some(tail), Some(head)) => mergeable(tail, head),
        _ => false,
    };
    if merge && let (Some(tail), Some(head)) = (pcb.unsent.back_mut(), queue.pop_front()) {
        let _ = head.p.header(-(TCP_HLEN as isize));
        tail.p.cat(head.p);
        tail.len += head.len;
        sx.segs.free(head.slot);
    }
    pcb.unsent.extend(queue);

    let ctl = u32::from(flags.intersects(TcpFlags::SYN | TcpFlags::FIN));
    pcb.snd_lbb = pcb.snd_lbb.wrapping_add(len as u32 + ctl);
    pcb.snd_buf = pcb.snd_buf.saturating_sub(len as u16);
    pcb.snd_queuelen = queuelen;

    if last_seglen > 0
        && let Some(back) = pcb.unsent.back_mut()
    {
        back.hdr.flags.insert(TcpFlags::PSH);
    }
    Ok(())
}

fn source_ip(pcb: &TcpPcb, cx: &TcpCtx<'_>) -> Ipv4Addr {
    if pcb.local_ip.is_any() {
        cx.netif.ip
    } else {
        pcb.local_ip
    }
}

/// Build and send a header-only segment. The buffer is released afterwards.
fn send_bare(
    store: &Rc<BufStore>,
    cx: &mut TcpCtx<'_>,
    hdr: &TcpHeader,
    src: Ipv4Addr,
    dst: Ipv4Addr,
) -> NetResult {
    let p = Pbuf::alloc(store, PbufLayer::Ip, TCP_HLEN, PbufKind::Ram).ok_or(NetError::NoBufs)?;
    let _ = p.with_payload_mut(|b| hdr.write(b));
    let sum = inet_chksum_pseudo(&p, src, dst, IpProtocol::Tcp, p.tot_len());
    let _ = p.with_payload_mut(|b| b[16..18].copy_from_slice(&sum.to_be_bytes()));
    let res = cx.io.ip_output(&p, src, dst, TCP_TTL, IpProtocol::Tcp);
    p.free();
    res
}

/// Send a RST answering a segment that matches no connection, or tearing
/// down an aborted one.
pub(crate) fn send_rst(
    store: &Rc<BufStore>,
    cx: &mut TcpCtx<'_>,
    seqno: u32,
    ackno: u32,
    tuple: &TcpTuple,
) {
    let mut hdr = TcpHeader::new(
        tuple.local_port.0,
        tuple.remote_port.0,
        seqno,
        TcpFlags::RST | TcpFlags::ACK,
    );
    hdr.ack_num = ackno;
    hdr.window_size = TCP_WND;
    let src = if tuple.local_ip.is_any() {
        cx.netif.ip
    } else {
        tuple.local_ip
    };
    klog_debug!("tcp: rst seq={} ack={} to {}:{}", seqno, ackno, tuple.remote_ip, tuple.remote_port);
    if let Err(e) = send_bare(store, cx, &hdr, src, tuple.remote_ip) {
        klog_warn!("tcp: rst not sent: {}", e);
    }
}

/// Fill in the acknowledgement fields and checksum of a queued segment and
/// pass it to the IP layer.
fn output_segment(
    seg: &mut TcpSeg,
    pcb: &mut TcpPcb,
    ticks: u32,
    cx: &mut TcpCtx<'_>,
) -> NetResult {
    seg.hdr.ack_num = pcb.rcv_nxt;
    // Advertise nothing rather than a window smaller than a segment.
    seg.hdr.window_size = if pcb.rcv_wnd < pcb.mss { 0 } else { pcb.rcv_wnd };
    seg.hdr.checksum = 0;

    if pcb.local_ip.is_any() {
        pcb.local_ip = cx.netif.ip;
    }
    pcb.rtime = 0;
    if pcb.rttest == 0 {
        pcb.rttest = ticks;
        pcb.rtseq = seg.seqno();
    }

    let hdr = seg.hdr;
    seg.p
        .with_payload_mut(|b| hdr.write(b))
        .map_err(|_| NetError::InvalidArgument)?
        .ok_or(NetError::InvalidArgument)?;
    let sum = inet_chksum_pseudo(
        &seg.p,
        pcb.local_ip,
        pcb.remote_ip,
        IpProtocol::Tcp,
        seg.p.tot_len(),
    );
    seg.hdr.checksum = sum;
    let _ = seg
        .p
        .with_payload_mut(|b| b[16..18].copy_from_slice(&sum.to_be_bytes()));
    ip_output_keep(
        cx.io,
        &seg.p,
        pcb.local_ip,
        pcb.remote_ip,
        TCP_TTL,
        IpProtocol::Tcp,
    )
}

/// Keep `unacked` ordered by sequence number; retransmitted segments may
/// arrive behind newer ones.
fn push_unacked(pcb: &mut TcpPcb, seg: TcpSeg) {
    let at = pcb
        .unacked
        .iter()
        .rposition(|s| seq_lt(s.seqno(), seg.seqno()))
        .map_or(0, |i| i + 1);
    pcb.unacked.insert(at, seg);
}

/// Transmit queued segments while they fit in `min(snd_wnd, cwnd)`. A
/// pending immediate ACK with nothing sendable goes out as a bare segment.
pub(crate) fn output(pcb: &mut TcpPcb, sx: &mut SegCtx<'_>, cx: &mut TcpCtx<'_>) -> NetResult {
    let wnd = pcb.snd_wnd.min(pcb.cwnd) as u32;
    let fits = |seg: &TcpSeg, lastack: u32| {
        seg.seqno().wrapping_sub(lastack).wrapping_add(seg.len) <= wnd
    };

    if pcb.flags.contains(PcbFlags::ACK_NOW)
        && pcb.unsent.front().is_none_or(|seg| !fits(seg, pcb.lastack))
    {
        let mut hdr = TcpHeader::new(
            pcb.local_port.0,
            pcb.remote_port.0,
            pcb.snd_nxt,
            TcpFlags::ACK,
        );
        hdr.ack_num = pcb.rcv_nxt;
        hdr.window_size = pcb.rcv_wnd;
        let src = source_ip(pcb, cx);
        send_bare(sx.store, cx, &hdr, src, pcb.remote_ip)?;
        pcb.flags.remove(PcbFlags::ACK_DELAY | PcbFlags::ACK_NOW);
        return Ok(());
    }

    while let Some(front) = pcb.unsent.front() {
        if !fits(front, pcb.lastack) {
            break;
        }
        let Some(mut seg) = pcb.unsent.pop_front() else {
            break;
        };
        if pcb.state != TcpState::SynSent {
            seg.hdr.flags.insert(TcpFlags::ACK);
            pcb.flags.remove(PcbFlags::ACK_DELAY | PcbFlags::ACK_NOW);
        }
        if let Err(e) = output_segment(&mut seg, pcb, sx.ticks, cx) {
            klog_debug!("tcp: ip output failed seq={}: {}", seg.seqno(), e);
        }
        pcb.snd_nxt = seg.seqno().wrapping_add(seg.tcplen());
        if seq_lt(pcb.snd_max, pcb.snd_nxt) {
            pcb.snd_max = pcb.snd_nxt;
        }
        if seg.tcplen() > 0 {
            push_unacked(pcb, seg);
        } else {
            crate::tcp::seg_free(seg, sx.segs);
        }
    }
    Ok(())
}

/// Move every unacknowledged segment back in front of `unsent`.
pub(crate) fn rexmit_queue(pcb: &mut TcpPcb) {
    if pcb.unacked.is_empty() {
        return;
    }
    let mut unsent = core::mem::take(&mut pcb.unacked);
    unsent.append(&mut pcb.unsent);
    pcb.unsent = unsent;
    if let Some(front) = pcb.unsent.front() {
        pcb.snd_nxt = front.seqno();
    }
    pcb.nrtx = pcb.nrtx.saturating_add(1);
    pcb.rttest = 0;
}

/// Move only the oldest unacknowledged segment back (fast retransmit).
pub(crate) fn rexmit_one(pcb: &mut TcpPcb) {
    let Some(seg) = pcb.unacked.pop_front() else {
        return;
    };
    pcb.snd_nxt = seg.seqno();
    pcb.unsent.push_front(seg);
    pcb.nrtx = pcb.nrtx.saturating_add(1);
    pcb.rttest = 0;
}

impl Tcp {
    /// Queue `data` for sending. With `copy` the bytes are copied into
    /// segment buffers; otherwise one shared copy is referenced by every
    /// segment. Nothing is transmitted until [`Tcp::output`].
    pub fn write(&mut self, h: TcpHandle, data: &[u8], copy: bool) -> NetResult {
        let (pcb, mut sx) = self.split(h).ok_or(NetError::InvalidArgument)?;
        if !pcb.state.can_send() {
            return Err(NetError::NotConnected);
        }
        if data.is_empty() {
            return Ok(());
        }
        if copy {
            enqueue(pcb, &mut sx, Payload::Copy(data), TcpFlags::empty(), &[])
        } else {
            let shared: Rc<[u8]> = Rc::from(data);
            enqueue(pcb, &mut sx, Payload::Shared(&shared), TcpFlags::empty(), &[])
        }
    }

    /// Queue a control segment (SYN or FIN) without payload.
    pub fn send_ctrl(&mut self, h: TcpHandle, flags: TcpFlags) -> NetResult {
        let (pcb, mut sx) = self.split(h).ok_or(NetError::InvalidArgument)?;
        enqueue(pcb, &mut sx, Payload::Empty, flags, &[])
    }

    /// Transmit whatever the windows allow. Deferred while an inbound
    /// segment for this connection is being processed.
    pub fn output(&mut self, h: TcpHandle, cx: &mut TcpCtx<'_>) -> NetResult {
        if self.input_pcb == Some(h) {
            return Ok(());
        }
        let (pcb, mut sx) = self.split(h).ok_or(NetError::InvalidArgument)?;
        output(pcb, &mut sx, cx)
    }

    /// Retransmit everything outstanding.
    pub fn rexmit(&mut self, h: TcpHandle, cx: &mut TcpCtx<'_>) -> NetResult {
        let pcb = self.pcbs.get_mut(h).ok_or(NetError::InvalidArgument)?;
        rexmit_queue(pcb);
        self.output(h, cx)
    }
}

#[cfg(test)]
#[path = "tcp_out_tests.rs"]
mod tcp_out_tests;
