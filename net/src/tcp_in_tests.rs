use alloc::vec::Vec;

use super::*;
use crate::memp::MempKind;
use crate::test_fixtures::{Host, LOCAL, PEER, netif, peer_netif, pump, seg};

const PEER_PORT: u16 = 5000;

/// The ephemeral port counter is bumped before use.
const FIRST_EPHEMERAL_PORT: u16 = crate::config::TCP_LOCAL_PORT_RANGE_START + 1;

/// Listen on port 80 and complete a passive open with PEER:5000, whose ISS
/// is 1000. Returns the new connection and our next sequence number.
fn accept_peer(host: &mut Host, peer_mss: u16) -> (TcpHandle, u32) {
    let h = host.run(|t, cx| t.new_pcb(cx)).unwrap();
    host.tcp.bind(h, Ipv4Addr::ANY, Port(80)).unwrap();
    host.tcp.listen(h).unwrap();

    host.input(seg(PEER_PORT, 80, 1000, 0, TcpFlags::SYN), &mss_option(peer_mss), &[]);
    let sent = host.io.take();
    assert_eq!(sent.len(), 1);
    let synack = sent[0].tcp();
    assert_eq!(synack.flags, TcpFlags::SYN | TcpFlags::ACK);
    assert_eq!(synack.ack_num, 1001);
    let snd = synack.seq_num.wrapping_add(1);

    host.input(seg(PEER_PORT, 80, 1001, snd, TcpFlags::ACK), &[], &[]);
    assert_eq!(host.ev.accepted.len(), 1);
    let child = host.ev.accepted[0];
    assert_eq!(host.tcp.pcb(child).unwrap().state, TcpState::Established);
    // The ACK of our SYN counts as one byte acknowledged.
    assert_eq!(host.ev.acked, 1);
    host.ev.acked = 0;
    (child, snd)
}

#[test]
fn test_handshake_between_two_hosts() {
    let mut server = Host::new(peer_netif());
    let mut client = Host::new(netif());

    let s = server.run(|t, cx| t.new_pcb(cx)).unwrap();
    server.tcp.bind(s, Ipv4Addr::ANY, Port(80)).unwrap();
    server.tcp.listen(s).unwrap();

    let c = client.run(|t, cx| t.new_pcb(cx)).unwrap();
    client.run(|t, cx| t.connect(c, PEER, Port(80), cx)).unwrap();
    assert_eq!(client.tcp.pcb(c).unwrap().local_port.0, FIRST_EPHEMERAL_PORT);

    // SYN and SYN|ACK; the final ACK waits for the fast timer.
    assert_eq!(pump(&mut client, &mut server), 2);
    assert_eq!(client.tcp.pcb(c).unwrap().state, TcpState::Established);
    assert_eq!(client.ev.connected, [(c, Ok(()))]);
    assert!(server.ev.accepted.is_empty());
    assert!(client.tcp.pcb(c).unwrap().flags.contains(PcbFlags::ACK_DELAY));

    client.tmr(1);
    assert_eq!(pump(&mut client, &mut server), 1);
    assert_eq!(server.ev.accepted.len(), 1);
    let child = server.ev.accepted[0];
    let pcb = server.tcp.pcb(child).unwrap();
    assert_eq!(pcb.state, TcpState::Established);
    assert_eq!(pcb.local_ip, PEER);
    assert_eq!(pcb.remote_ip, LOCAL);
    assert_eq!(pcb.mss, TCP_MSS);
    assert!(server.tcp.pcbs_sane() && client.tcp.pcbs_sane());
}

#[test]
fn test_data_flows_and_is_acknowledged() {
    let mut server = Host::new(peer_netif());
    let mut client = Host::new(netif());
    let s = server.run(|t, cx| t.new_pcb(cx)).unwrap();
    server.tcp.bind(s, Ipv4Addr::ANY, Port(80)).unwrap();
    server.tcp.listen(s).unwrap();
    let c = client.run(|t, cx| t.new_pcb(cx)).unwrap();
    client.run(|t, cx| t.connect(c, PEER, Port(80), cx)).unwrap();
    pump(&mut client, &mut server);
    client.tmr(1);
    pump(&mut client, &mut server);

    client.tcp.write(c, b"hello", true).unwrap();
    client.run(|t, cx| t.output(c, cx)).unwrap();
    let sent = client.io.sent.last().unwrap();
    assert!(sent.tcp().flags.contains(TcpFlags::ACK | TcpFlags::PSH));
    assert_eq!(sent.tcp_payload(), b"hello");

    pump(&mut client, &mut server);
    assert_eq!(server.ev.received, b"hello");
    assert_eq!(client.tcp.pcb(c).unwrap().unacked.len(), 1);

    // In-order data is acknowledged by the fast timer.
    server.tmr(1);
    pump(&mut client, &mut server);
    assert_eq!(client.ev.acked, 5);
    let pcb = client.tcp.pcb(c).unwrap();
    assert!(pcb.unacked.is_empty());
    assert_eq!(pcb.snd_buf, TCP_SND_BUF);
}

#[test]
fn test_out_of_order_segment_is_held_until_gap_fills() {
    let mut host = Host::new(netif());
    let (child, snd) = accept_peer(&mut host, 1460);
    assert_eq!(host.tcp.pcb(child).unwrap().mss, 1460);

    host.input(seg(PEER_PORT, 80, 1006, snd, TcpFlags::ACK), &[], b"world");
    assert!(host.ev.received.is_empty());
    assert_eq!(host.tcp.pcb(child).unwrap().ooseq.len(), 1);
    // A gap is reported at once.
    let dup = host.io.take();
    assert_eq!(dup.len(), 1);
    assert_eq!(dup[0].tcp().ack_num, 1001);

    host.input(seg(PEER_PORT, 80, 1001, snd, TcpFlags::ACK), &[], b"hello");
    assert_eq!(host.ev.received, b"helloworld");
    let pcb = host.tcp.pcb(child).unwrap();
    assert!(pcb.ooseq.is_empty());
    assert_eq!(pcb.rcv_nxt, 1011);
    assert!(host.io.sent.is_empty());

    host.tmr(1);
    let ack = host.io.take();
    assert_eq!(ack.len(), 1);
    assert_eq!(ack[0].tcp().ack_num, 1011);
    assert_eq!(host.tcp.segs_in_use(), 0);
}

#[test]
fn test_retransmitted_data_is_trimmed() {
    let mut host = Host::new(netif());
    let (_, snd) = accept_peer(&mut host, 1460);
    host.input(seg(PEER_PORT, 80, 1001, snd, TcpFlags::ACK), &[], b"abc");
    // Overlaps the three bytes already delivered.
    host.input(seg(PEER_PORT, 80, 1001, snd, TcpFlags::ACK), &[], b"abcdef");
    assert_eq!(host.ev.received, b"abcdef");
}

#[test]
fn test_three_duplicate_acks_trigger_one_retransmission() {
    let mut host = Host::new(netif());
    let (child, snd) = accept_peer(&mut host, 1460);
    host.io.take();

    host.tcp.write(child, &[7u8; 300], true).unwrap();
    host.run(|t, cx| t.output(child, cx)).unwrap();
    assert_eq!(host.io.take().len(), 1);

    for _ in 0..3 {
        host.input(seg(PEER_PORT, 80, 1001, snd, TcpFlags::ACK), &[], &[]);
    }
    let resent = host.io.take();
    assert_eq!(resent.len(), 1);
    assert_eq!(resent[0].tcp().seq_num, snd);
    assert_eq!(resent[0].tcp_payload().len(), 300);
    let pcb = host.tcp.pcb(child).unwrap();
    assert!(pcb.flags.contains(PcbFlags::INFR));
    assert_eq!(pcb.ssthresh, 2 * 1460);
    assert_eq!(pcb.cwnd, 2 * 1460 + 3 * 1460);

    // Further duplicates only inflate the window.
    host.input(seg(PEER_PORT, 80, 1001, snd, TcpFlags::ACK), &[], &[]);
    assert!(host.io.sent.is_empty());
    assert_eq!(host.tcp.pcb(child).unwrap().cwnd, 2 * 1460 + 4 * 1460);

    // A new ACK deflates it to ssthresh, then congestion avoidance adds
    // mss * mss / cwnd.
    host.input(seg(PEER_PORT, 80, 1001, snd + 300, TcpFlags::ACK), &[], &[]);
    let pcb = host.tcp.pcb(child).unwrap();
    assert!(!pcb.flags.contains(PcbFlags::INFR));
    assert_eq!(pcb.cwnd, 2 * 1460 + 730);
    assert!(pcb.unacked.is_empty());
    assert_eq!(host.ev.acked, 300);
}

#[test]
fn test_rst_outside_window_is_ignored() {
    let mut host = Host::new(netif());
    let (child, _) = accept_peer(&mut host, 1460);

    host.input(seg(PEER_PORT, 80, 1001 + 70_000, 0, TcpFlags::RST), &[], &[]);
    assert!(host.tcp.pcb(child).is_some());
    assert!(host.ev.errors.is_empty());

    host.input(seg(PEER_PORT, 80, 1001, 0, TcpFlags::RST), &[], &[]);
    assert!(host.tcp.pcb(child).is_none());
    assert_eq!(host.ev.errors, [(None, NetError::ConnectionReset)]);
    assert!(host.tcp.active_pcbs().is_empty());
}

#[test]
fn test_rst_refuses_active_open() {
    let mut host = Host::new(netif());
    let h = host.run(|t, cx| t.new_pcb(cx)).unwrap();
    host.run(|t, cx| t.connect(h, PEER, Port(80), cx)).unwrap();
    let syn = host.io.take()[0].tcp();

    // Wrong acknowledgement: not for our SYN.
    let port = syn.src_port;
    host.input(seg(80, port, 0, syn.seq_num, TcpFlags::RST | TcpFlags::ACK), &[], &[]);
    assert!(host.tcp.pcb(h).is_some());

    host.input(
        seg(80, port, 0, syn.seq_num + 1, TcpFlags::RST | TcpFlags::ACK),
        &[],
        &[],
    );
    assert!(host.tcp.pcb(h).is_none());
    assert_eq!(host.ev.connected, [(h, Err(NetError::ConnectionReset))]);
    assert_eq!(host.ev.errors, [(None, NetError::ConnectionReset)]);
    assert_eq!(host.tcp.segs_in_use(), 0);
}

#[test]
fn test_segment_for_closed_port_is_reset() {
    let mut host = Host::new(netif());
    host.input(seg(PEER_PORT, 9, 1000, 0, TcpFlags::SYN), &[], &[]);

    assert_eq!(host.io.sent.len(), 1);
    let rst = host.io.sent[0].tcp();
    assert_eq!(rst.flags, TcpFlags::RST | TcpFlags::ACK);
    assert_eq!(rst.seq_num, 0);
    assert_eq!(rst.ack_num, 1001);
    assert_eq!((rst.src_port, rst.dst_port), (9, PEER_PORT));
    assert_eq!(host.io.sent[0].dst, PEER);

    // Never answer a RST with a RST.
    host.input(seg(PEER_PORT, 9, 1000, 0, TcpFlags::RST), &[], &[]);
    assert_eq!(host.io.sent.len(), 1);
    assert!(host.store.is_idle());
}

#[test]
fn test_listener_resets_stray_ack() {
    let mut host = Host::new(netif());
    let h = host.run(|t, cx| t.new_pcb(cx)).unwrap();
    host.tcp.bind(h, Ipv4Addr::ANY, Port(80)).unwrap();
    host.tcp.listen(h).unwrap();

    host.input(seg(PEER_PORT, 80, 1000, 5555, TcpFlags::ACK), &[], &[]);
    assert_eq!(host.io.sent.len(), 1);
    let rst = host.io.sent[0].tcp();
    assert!(rst.flags.contains(TcpFlags::RST));
    assert_eq!(rst.seq_num, 5555);
    assert_eq!(rst.ack_num, 1000);
    assert_eq!(host.tcp.pcbs_in_use(), 0);
}

#[test]
fn test_refused_accept_aborts_connection() {
    let mut host = Host::new(netif());
    host.ev.reject = true;
    let h = host.run(|t, cx| t.new_pcb(cx)).unwrap();
    host.tcp.bind(h, Ipv4Addr::ANY, Port(80)).unwrap();
    host.tcp.listen(h).unwrap();

    host.input(seg(PEER_PORT, 80, 1000, 0, TcpFlags::SYN), &[], &[]);
    let snd = host.io.take()[0].tcp().seq_num.wrapping_add(1);
    host.input(seg(PEER_PORT, 80, 1001, snd, TcpFlags::ACK), &[], &[]);

    assert_eq!(host.tcp.pcbs_in_use(), 0);
    assert_eq!(host.ev.errors, [(None, NetError::ConnectionAborted)]);
    let rst = host.io.take();
    assert_eq!(rst.len(), 1);
    assert!(rst[0].tcp().flags.contains(TcpFlags::RST));
}

#[test]
fn test_active_close_reaches_time_wait() {
    let mut host = Host::new(netif());
    let (child, snd) = accept_peer(&mut host, 1460);
    host.io.take();

    host.run(|t, cx| t.close(child, cx)).unwrap();
    let fin = host.io.take();
    assert!(fin[0].tcp().flags.contains(TcpFlags::FIN));
    assert_eq!(host.tcp.pcb(child).unwrap().state, TcpState::FinWait1);

    host.input(seg(PEER_PORT, 80, 1001, snd + 1, TcpFlags::ACK), &[], &[]);
    assert_eq!(host.tcp.pcb(child).unwrap().state, TcpState::FinWait2);

    host.input(seg(PEER_PORT, 80, 1001, snd + 1, TcpFlags::FIN | TcpFlags::ACK), &[], &[]);
    assert_eq!(host.tcp.pcb(child).unwrap().state, TcpState::TimeWait);
    assert!(host.ev.eof);
    assert_eq!(host.tcp.tw_pcbs(), [child]);
    assert!(host.tcp.active_pcbs().is_empty());
    let ack = host.io.take();
    assert_eq!(ack.len(), 1);
    assert_eq!(ack[0].tcp().ack_num, 1002);

    // A retransmitted FIN is acknowledged again.
    host.input(seg(PEER_PORT, 80, 1001, snd + 1, TcpFlags::FIN | TcpFlags::ACK), &[], &[]);
    assert_eq!(host.io.take().len(), 1);

    host.slowtmr((2 * crate::config::TCP_MSL / crate::config::TCP_SLOW_INTERVAL) as usize + 1);
    assert!(host.tcp.pcb(child).is_none());
    assert!(host.tcp.tw_pcbs().is_empty());
}

#[test]
fn test_passive_close_reports_closed() {
    let mut host = Host::new(netif());
    let (child, snd) = accept_peer(&mut host, 1460);
    host.io.take();

    host.input(seg(PEER_PORT, 80, 1001, snd, TcpFlags::FIN | TcpFlags::ACK), &[], &[]);
    assert_eq!(host.tcp.pcb(child).unwrap().state, TcpState::CloseWait);
    assert!(host.ev.eof);
    assert_eq!(host.io.take()[0].tcp().ack_num, 1002);

    host.run(|t, cx| t.close(child, cx)).unwrap();
    assert_eq!(host.tcp.pcb(child).unwrap().state, TcpState::LastAck);
    host.input(seg(PEER_PORT, 80, 1002, snd + 1, TcpFlags::ACK), &[], &[]);

    assert!(host.tcp.pcb(child).is_none());
    assert_eq!(host.ev.errors, [(None, NetError::Closed)]);
    assert_eq!(host.tcp.segs_in_use(), 0);
}

#[test]
fn test_corrupt_segment_is_dropped() {
    let mut host = Host::new(netif());
    let mut bad = crate::test_fixtures::tcp_bytes(
        PEER,
        LOCAL,
        seg(PEER_PORT, 9, 1000, 0, TcpFlags::SYN),
        &[],
        &[],
    );
    bad[4] ^= 0xff;
    let (p, iph) =
        crate::test_fixtures::ipv4_packet(&host.store, PEER, LOCAL, IpProtocol::Tcp, &bad);
    host.run(|t, cx| t.input(p, &iph, cx));
    assert!(host.io.sent.is_empty());
    assert!(host.store.is_idle());
}

/// An established PCB with 4000 bytes in flight from sequence 1000.
fn sender(cwnd: u16, ssthresh: u16) -> TcpPcb {
    let mut pcb = TcpPcb::new(1, 1000, 0);
    pcb.state = TcpState::Established;
    pcb.mss = 100;
    pcb.cwnd = cwnd;
    pcb.ssthresh = ssthresh;
    pcb.lastack = 1000;
    pcb.snd_nxt = 5000;
    pcb.snd_max = 5000;
    pcb
}

#[test]
fn test_cwnd_grows_per_ack_then_per_window() {
    let mut segs = Pool::new(MempKind::TcpSeg, 4);
    let mut pcb = sender(100, 300);

    // Slow start: one MSS per ACK below ssthresh.
    process_ack(&mut pcb, 1, 1100, 8000, &mut segs, 0);
    assert_eq!(pcb.cwnd, 200);
    process_ack(&mut pcb, 1, 1200, 8000, &mut segs, 0);
    assert_eq!(pcb.cwnd, 300);

    // Congestion avoidance: mss * mss / cwnd per ACK.
    process_ack(&mut pcb, 1, 1300, 8000, &mut segs, 0);
    assert_eq!(pcb.cwnd, 333);
    process_ack(&mut pcb, 1, 1400, 8000, &mut segs, 0);
    assert_eq!(pcb.cwnd, 363);
    assert_eq!(pcb.lastack, 1400);

    // A duplicate ACK leaves it alone.
    process_ack(&mut pcb, 1, 1400, 8000, &mut segs, 0);
    assert_eq!(pcb.cwnd, 363);
    assert_eq!(pcb.dupacks, 1);
}

#[test]
fn test_cwnd_is_not_grown_before_established() {
    let mut segs = Pool::new(MempKind::TcpSeg, 4);
    let mut pcb = sender(100, 300);
    pcb.state = TcpState::SynRcvd;
    process_ack(&mut pcb, 1, 1100, 8000, &mut segs, 0);
    assert_eq!(pcb.cwnd, 100);
    assert_eq!(pcb.acked, 100);
}

#[test]
fn test_timed_ack_updates_rto_estimate() {
    let mut segs = Pool::new(MempKind::TcpSeg, 4);
    let mut pcb = sender(100, 300);
    pcb.sa = 0;
    pcb.sv = 6;

    // First sample: 16 ticks.
    pcb.rttest = 10;
    pcb.rtseq = 1000;
    process_ack(&mut pcb, 1, 1100, 8000, &mut segs, 26);
    assert_eq!((pcb.sa, pcb.sv), (16, 21));
    assert_eq!(pcb.rto, 23);
    assert_eq!(pcb.rttest, 0);

    // Second sample: 8 ticks, smoothed against the first.
    pcb.rttest = 30;
    pcb.rtseq = 1100;
    process_ack(&mut pcb, 1, 1200, 8000, &mut segs, 38);
    assert_eq!((pcb.sa, pcb.sv), (22, 22));
    assert_eq!(pcb.rto, 24);

    // No sample running: the estimate stands.
    process_ack(&mut pcb, 1, 1300, 8000, &mut segs, 90);
    assert_eq!((pcb.sa, pcb.sv, pcb.rto), (22, 22, 24));
}

#[test]
fn test_simultaneous_close_passes_through_closing() {
    let mut host = Host::new(netif());
    let (child, snd) = accept_peer(&mut host, 1460);
    host.io.take();

    host.run(|t, cx| t.close(child, cx)).unwrap();
    assert!(host.io.take()[0].tcp().flags.contains(TcpFlags::FIN));
    assert_eq!(host.tcp.pcb(child).unwrap().state, TcpState::FinWait1);

    // The peer's FIN crosses ours and does not acknowledge it.
    host.input(seg(PEER_PORT, 80, 1001, snd, TcpFlags::FIN | TcpFlags::ACK), &[], &[]);
    assert_eq!(host.tcp.pcb(child).unwrap().state, TcpState::Closing);
    let ack = host.io.take();
    assert_eq!(ack.len(), 1);
    assert_eq!(ack[0].tcp().ack_num, 1002);

    host.input(seg(PEER_PORT, 80, 1002, snd + 1, TcpFlags::ACK), &[], &[]);
    assert_eq!(host.tcp.pcb(child).unwrap().state, TcpState::TimeWait);
    assert_eq!(host.tcp.tw_pcbs(), [child]);
    assert!(host.tcp.active_pcbs().is_empty());
    assert!(host.tcp.pcbs_sane());
}

#[test]
fn test_time_wait_match_moves_to_front() {
    let mut host = Host::new(netif());
    let lh = host.run(|t, cx| t.new_pcb(cx)).unwrap();
    host.tcp.bind(lh, Ipv4Addr::ANY, Port(80)).unwrap();
    host.tcp.listen(lh).unwrap();

    let mut conns = Vec::new();
    for port in [5000, 5001] {
        host.io.take();
        host.input(seg(port, 80, 1000, 0, TcpFlags::SYN), &[], &[]);
        let snd = host.io.take()[0].tcp().seq_num.wrapping_add(1);
        host.input(seg(port, 80, 1001, snd, TcpFlags::ACK), &[], &[]);
        let child = *host.ev.accepted.last().unwrap();
        host.run(|t, cx| t.close(child, cx)).unwrap();
        host.input(seg(port, 80, 1001, snd + 1, TcpFlags::FIN | TcpFlags::ACK), &[], &[]);
        assert_eq!(host.tcp.pcb(child).unwrap().state, TcpState::TimeWait);
        conns.push(child);
    }
    assert_eq!(host.tcp.tw_pcbs(), [conns[1], conns[0]]);
    host.io.take();

    // A retransmitted FIN from the older connection.
    host.input(seg(5000, 80, 1001, 0, TcpFlags::FIN | TcpFlags::ACK), &[], &[]);
    assert_eq!(host.io.take().len(), 1);
    assert_eq!(host.tcp.tw_pcbs(), [conns[0], conns[1]]);
}
