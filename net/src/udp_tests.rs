use alloc::vec;

use super::*;
use crate::test_fixtures::{
    LOCAL, PEER, RecordingIo, ipv4_packet, netif, peer_netif, replay, store, udp_bytes, udp_packet,
};

fn engine() -> (Rc<BufStore>, Udp) {
    let store = store();
    let udp = Udp::new(&NetConfig::small(), Rc::clone(&store));
    (store, udp)
}

fn from_peer(store: &Rc<BufStore>, sport: u16, dport: u16, payload: &[u8]) -> (Pbuf, Ipv4Header) {
    udp_packet(store, PEER, sport, LOCAL, dport, payload)
}

#[test]
fn test_bind_rejects_overlapping_addresses() {
    let (_store, mut udp) = engine();
    let a = udp.new_pcb(None).unwrap();
    let b = udp.new_pcb(None).unwrap();

    assert_eq!(udp.bind(a, Ipv4Addr::ANY, Port(53)), Ok(Port(53)));
    assert_eq!(udp.bind(b, Ipv4Addr::ANY, Port(53)), Err(NetError::AddrInUse));
    assert_eq!(udp.bind(b, LOCAL, Port(53)), Err(NetError::AddrInUse));
    // Rebinding the same PCB is fine.
    assert_eq!(udp.bind(a, LOCAL, Port(53)), Ok(Port(53)));
}

#[test]
fn test_bind_any_port_takes_first_free() {
    let (_store, mut udp) = engine();
    let a = udp.new_pcb(None).unwrap();
    let b = udp.new_pcb(None).unwrap();
    assert_eq!(udp.bind(a, Ipv4Addr::ANY, Port::ANY), Ok(Port(4096)));
    assert_eq!(udp.bind(b, Ipv4Addr::ANY, Port::ANY), Ok(Port(4097)));
}

#[test]
fn test_pool_limits_pcbs() {
    let (_store, mut udp) = engine();
    for _ in 0..crate::config::MEMP_NUM_UDP_PCB {
        assert!(udp.new_pcb(None).is_some());
    }
    assert!(udp.new_pcb(None).is_none());
    assert_eq!(udp.pcbs_in_use(), crate::config::MEMP_NUM_UDP_PCB);
}

#[test]
fn test_connect_binds_implicitly() {
    let (_store, mut udp) = engine();
    let h = udp.new_pcb(None).unwrap();
    udp.connect(h, PEER, Port(7)).unwrap();

    let pcb = udp.pcb(h).unwrap();
    assert_eq!(pcb.local_port, Port(4096));
    assert_eq!((pcb.remote_ip, pcb.remote_port), (PEER, Port(7)));
    assert!(pcb.flags.contains(UdpFlags::CONNECTED));

    udp.disconnect(h);
    let pcb = udp.pcb(h).unwrap();
    assert!(!pcb.flags.contains(UdpFlags::CONNECTED));
    assert!(pcb.remote_ip.is_any());
}

#[test]
fn test_send_produces_checksummed_datagram() {
    let (store, mut udp) = engine();
    let mut io = RecordingIo::default();
    let h = udp.new_pcb(None).unwrap();
    udp.connect(h, PEER, Port(7)).unwrap();
    udp.send(h, b"ping", &netif(), &mut io).unwrap();

    assert_eq!(io.sent.len(), 1);
    let sent = &io.sent[0];
    assert_eq!((sent.src, sent.dst, sent.proto), (LOCAL, PEER, IpProtocol::Udp));
    let hdr = UdpHeader::parse(&sent.data).unwrap();
    assert_eq!((hdr.src_port, hdr.dst_port, hdr.len), (4096, 7, 12));
    assert_ne!(hdr.checksum, 0);
    assert_eq!(&sent.data[UDP_HLEN..], b"ping");
    assert!(store.is_idle());

    // The peer accepts it.
    let (peer_store, mut peer) = engine();
    let echo = peer.new_pcb(Ssid::new(1)).unwrap();
    peer.bind(echo, peer_netif().ip, Port(7)).unwrap();
    let (p, iph) = replay(&peer_store, sent);
    assert_eq!(peer.input(p, &iph), UdpInput::Delivered(Ssid::new(1)));
    let (data, src, port) = peer.pcb_mut(echo).unwrap().take_pending().unwrap();
    assert_eq!((data.as_slice(), src, port), (&b"ping"[..], LOCAL, Port(4096)));
}

#[test]
fn test_send_failure_is_reported() {
    let (store, mut udp) = engine();
    let mut io = RecordingIo {
        fail: Some(NetError::Unreachable),
        ..Default::default()
    };
    let h = udp.new_pcb(None).unwrap();
    udp.connect(h, PEER, Port(7)).unwrap();
    assert_eq!(udp.send(h, b"x", &netif(), &mut io), Err(NetError::Unreachable));
    assert!(store.is_idle());
}

#[test]
fn test_oversized_payload_is_refused() {
    let (store, mut udp) = engine();
    let mut io = RecordingIo::default();
    let h = udp.new_pcb(None).unwrap();
    udp.connect(h, PEER, Port(7)).unwrap();

    let data = vec![0u8; UDP_MAX_PAYLOAD + 1];
    assert_eq!(
        udp.send(h, &data, &netif(), &mut io),
        Err(NetError::MessageTooLong)
    );
    assert!(io.sent.is_empty());
    assert!(store.is_idle());
    assert_eq!(UDP_MAX_PAYLOAD, 65507);
}

#[test]
fn test_input_delivers_and_learns_sender() {
    let (store, mut udp) = engine();
    let h = udp.new_pcb(Ssid::new(5)).unwrap();
    udp.bind(h, Ipv4Addr::ANY, Port(53)).unwrap();

    let (p, iph) = from_peer(&store, 999, 53, b"hi");
    assert_eq!(udp.input(p, &iph), UdpInput::Delivered(Ssid::new(5)));
    let pcb = udp.pcb_mut(h).unwrap();
    assert_eq!((pcb.remote_ip, pcb.remote_port), (PEER, Port(999)));
    assert!(pcb.has_pending());
    let (data, src, port) = pcb.take_pending().unwrap();
    assert_eq!(data, b"hi");
    assert_eq!((src, port), (PEER, Port(999)));
    assert!(!pcb.has_pending());
    assert!(store.is_idle());
}

#[test]
fn test_second_datagram_dropped_while_one_pending() {
    let (store, mut udp) = engine();
    let h = udp.new_pcb(None).unwrap();
    udp.bind(h, Ipv4Addr::ANY, Port(53)).unwrap();

    let (p, iph) = from_peer(&store, 999, 53, b"first");
    assert_eq!(udp.input(p, &iph), UdpInput::Delivered(None));
    let (p, iph) = from_peer(&store, 999, 53, b"second");
    assert_eq!(udp.input(p, &iph), UdpInput::Dropped);
    let (data, _, _) = udp.pcb_mut(h).unwrap().take_pending().unwrap();
    assert_eq!(data, b"first");
}

#[test]
fn test_unbound_port_is_no_match() {
    let (store, mut udp) = engine();
    let (p, iph) = from_peer(&store, 999, 53, b"hi");
    assert_eq!(udp.input(p, &iph), UdpInput::NoMatch);
    assert!(store.is_idle());
}

#[test]
fn test_bad_checksum_is_dropped() {
    let (store, mut udp) = engine();
    let h = udp.new_pcb(None).unwrap();
    udp.bind(h, Ipv4Addr::ANY, Port(53)).unwrap();

    let mut bytes = udp_bytes(PEER, 999, LOCAL, 53, b"hello");
    bytes[UDP_HLEN] ^= 0x20;
    let (p, iph) = ipv4_packet(&store, PEER, LOCAL, IpProtocol::Udp, &bytes);
    assert_eq!(udp.input(p, &iph), UdpInput::Dropped);
    assert!(!udp.pcb(h).unwrap().has_pending());

    // A zero checksum means none was computed.
    bytes[6..8].copy_from_slice(&[0, 0]);
    let (p, iph) = ipv4_packet(&store, PEER, LOCAL, IpProtocol::Udp, &bytes);
    assert_eq!(udp.input(p, &iph), UdpInput::Delivered(None));
}

#[test]
fn test_length_beyond_datagram_is_dropped() {
    let (store, mut udp) = engine();
    let h = udp.new_pcb(None).unwrap();
    udp.bind(h, Ipv4Addr::ANY, Port(53)).unwrap();

    let mut bytes = udp_bytes(PEER, 999, LOCAL, 53, b"hello");
    bytes[4..6].copy_from_slice(&100u16.to_be_bytes());
    let (p, iph) = ipv4_packet(&store, PEER, LOCAL, IpProtocol::Udp, &bytes);
    assert_eq!(udp.input(p, &iph), UdpInput::Dropped);
    assert!(store.is_idle());
}

#[test]
fn test_connected_pcb_ignores_other_sources() {
    let (store, mut udp) = engine();
    let h = udp.new_pcb(None).unwrap();
    udp.connect(h, PEER, Port(7)).unwrap();

    let stranger = Ipv4Addr::new(10, 0, 0, 9);
    let (p, iph) = udp_packet(&store, stranger, 7, LOCAL, 4096, b"x");
    assert_eq!(udp.input(p, &iph), UdpInput::NoMatch);

    let (p, iph) = from_peer(&store, 7, 4096, b"y");
    assert_eq!(udp.input(p, &iph), UdpInput::Delivered(None));
    assert_eq!(udp.pcb(h).unwrap().remote_port, Port(7));
}

#[test]
fn test_remove_frees_pending_datagram() {
    let (store, mut udp) = engine();
    let h = udp.new_pcb(None).unwrap();
    udp.bind(h, Ipv4Addr::ANY, Port(53)).unwrap();
    let (p, iph) = from_peer(&store, 999, 53, b"hi");
    udp.input(p, &iph);

    udp.remove(h);
    assert!(udp.pcb(h).is_none());
    assert_eq!(udp.pcbs_in_use(), 0);
    assert!(store.is_idle());

    // The port is free again.
    let h = udp.new_pcb(None).unwrap();
    assert_eq!(udp.bind(h, Ipv4Addr::ANY, Port(53)), Ok(Port(53)));
}
