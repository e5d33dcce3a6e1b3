//! Packet buffer tests: length bookkeeping, reference counting, partial free.

use alloc::rc::Rc;
use alloc::vec::Vec;

use super::*;
use crate::config::NetConfig;

fn store() -> Rc<BufStore> {
    BufStore::new(&NetConfig::small())
}

/// Walk a chain and check `tot_len(node) == len(node) + tot_len(next)`.
fn tot_len_consistent(p: &Pbuf) -> bool {
    let mut cur = Some(p.clone());
    while let Some(q) = cur {
        let next = q.next();
        let expect = q.len() + next.as_ref().map_or(0, |n| n.tot_len());
        if q.tot_len() != expect {
            return false;
        }
        cur = next;
    }
    true
}

#[test]
fn test_ram_alloc_reserves_header_room() {
    let s = store();
    let p = Pbuf::alloc(&s, PbufLayer::Transport, 100, PbufKind::Ram).unwrap();
    assert_eq!(p.len(), 100);
    assert_eq!(p.tot_len(), 100);
    assert_eq!(p.kind(), PbufKind::Ram);
    p.header(PbufLayer::Transport.offset() as isize).unwrap();
    assert_eq!(p.len(), 154);
    assert_eq!(p.header(1), Err(PbufError::OutOfRange));
    p.header(-54).unwrap();
    assert_eq!(p.tot_len(), 100);
    drop(p);
    assert!(s.is_idle());
}

#[test]
fn test_pool_alloc_chains_cells() {
    let s = store();
    let bufsize = s.pool_bufsize();
    let size = bufsize * 2;
    let p = Pbuf::alloc(&s, PbufLayer::Raw, size, PbufKind::Pool).unwrap();
    assert_eq!(p.clen(), 2);
    assert_eq!(p.tot_len(), size);
    assert!(tot_len_consistent(&p));
    assert_eq!(s.pool_available(), s.pool_capacity() - 2);
    assert_eq!(p.free(), 2);
    assert!(s.is_idle());
}

#[test]
fn test_pool_exhaustion_returns_cells() {
    let s = store();
    let too_big = s.pool_bufsize() * (s.pool_capacity() + 1);
    assert!(Pbuf::alloc(&s, PbufLayer::Raw, too_big, PbufKind::Pool).is_none());
    assert_eq!(s.pool_available(), s.pool_capacity());
}

#[test]
fn test_rom_is_hide_only() {
    static DATA: &[u8] = b"hello world";
    let s = store();
    let p = Pbuf::rom(&s, DATA).unwrap();
    assert_eq!(s.meta_available(), NetConfig::small().memp_num_pbuf - 1);
    assert_eq!(p.header(2), Err(PbufError::ReadOnly));
    p.header(-6).unwrap();
    assert_eq!(p.to_vec(), b"world");
    assert_eq!(p.copy_in(b"x"), Err(PbufError::ReadOnly));
    drop(p);
    assert!(s.is_idle());
}

#[test]
fn test_reference_shares_bytes() {
    let s = store();
    let data: Rc<[u8]> = Rc::from(&b"0123456789"[..]);
    let a = Pbuf::reference(&s, Rc::clone(&data), 0..4).unwrap();
    let b = Pbuf::reference(&s, Rc::clone(&data), 4..10).unwrap();
    a.chain(&b);
    drop(b);
    assert_eq!(a.to_vec(), b"0123456789");
    assert!(Pbuf::reference(&s, data, 3..11).is_none());
}

#[test]
fn test_chain_takes_reference_and_sums_lengths() {
    let s = store();
    let h = Pbuf::from_slice(&s, PbufLayer::Raw, b"abc", PbufKind::Ram).unwrap();
    let t = Pbuf::from_slice(&s, PbufLayer::Raw, b"defgh", PbufKind::Ram).unwrap();
    h.chain(&t);
    assert_eq!(t.ref_count(), 2);
    assert_eq!(h.tot_len(), 8);
    assert_eq!(h.clen(), 2);
    assert!(tot_len_consistent(&h));
    assert_eq!(h.to_vec(), b"abcdefgh");
    drop(t);
    assert_eq!(h.free(), 2);
    assert!(s.is_idle());
}

#[test]
fn test_partial_free_stops_at_shared_node() {
    let s = store();
    let a = Pbuf::from_slice(&s, PbufLayer::Raw, b"aa", PbufKind::Ram).unwrap();
    let b = Pbuf::from_slice(&s, PbufLayer::Raw, b"bb", PbufKind::Ram).unwrap();
    let c = Pbuf::from_slice(&s, PbufLayer::Raw, b"cc", PbufKind::Ram).unwrap();
    b.chain(&c);
    drop(c);
    a.chain(&b);
    // `b` is referenced by `a` and by this handle.
    assert_eq!(b.ref_count(), 2);
    assert_eq!(a.free(), 1);
    assert_eq!(b.ref_count(), 1);
    assert_eq!(b.to_vec(), b"bbcc");
    assert_eq!(b.free(), 2);
    assert!(s.is_idle());
}

#[test]
fn test_free_of_shared_head_releases_nothing() {
    let s = store();
    let a = Pbuf::from_slice(&s, PbufLayer::Raw, b"x", PbufKind::Ram).unwrap();
    let extra = a.clone();
    assert_eq!(a.free(), 0);
    assert_eq!(extra.ref_count(), 1);
    assert_eq!(extra.free(), 1);
}

#[test]
fn test_realloc_shrinks_chain() {
    let s = store();
    let a = Pbuf::from_slice(&s, PbufLayer::Raw, &[1u8; 100], PbufKind::Ram).unwrap();
    let b = Pbuf::from_slice(&s, PbufLayer::Raw, &[2u8; 100], PbufKind::Ram).unwrap();
    let c = Pbuf::from_slice(&s, PbufLayer::Raw, &[3u8; 100], PbufKind::Ram).unwrap();
    a.chain(&b);
    b.chain(&c);
    drop(b);
    drop(c);
    a.realloc(150);
    assert_eq!(a.tot_len(), 150);
    assert_eq!(a.clen(), 2);
    assert!(tot_len_consistent(&a));
    let bytes = a.to_vec();
    assert_eq!(bytes[99], 1);
    assert_eq!(bytes[100], 2);
    assert!(s.with_arena(|ar| ar.check()));
    a.realloc(500);
    assert_eq!(a.tot_len(), 150);
    drop(a);
    assert!(s.is_idle());
}

#[test]
fn test_hide_front_across_nodes() {
    let s = store();
    let a = Pbuf::from_slice(&s, PbufLayer::Raw, b"abc", PbufKind::Ram).unwrap();
    let b = Pbuf::from_slice(&s, PbufLayer::Raw, b"defg", PbufKind::Ram).unwrap();
    a.chain(&b);
    drop(b);
    a.hide_front(5).unwrap();
    assert_eq!(a.tot_len(), 2);
    assert_eq!(a.len(), 0);
    assert_eq!(a.to_vec(), b"fg");
    assert_eq!(a.hide_front(3), Err(PbufError::OutOfRange));
}

#[test]
fn test_skip_releases_drained_nodes() {
    let s = store();
    let a = Pbuf::from_slice(&s, PbufLayer::Raw, b"abc", PbufKind::Ram).unwrap();
    let b = Pbuf::from_slice(&s, PbufLayer::Raw, b"def", PbufKind::Ram).unwrap();
    a.chain(&b);
    drop(b);
    let rest = a.skip(4).unwrap();
    assert_eq!(rest.to_vec(), b"ef");
    assert_eq!(rest.clen(), 1);
    assert!(rest.skip(2).is_none());
    assert!(s.is_idle());
}

#[test]
fn test_copy_out_with_offset() {
    let s = store();
    let a = Pbuf::from_slice(&s, PbufLayer::Raw, b"hello ", PbufKind::Ram).unwrap();
    let b = Pbuf::from_slice(&s, PbufLayer::Raw, b"world", PbufKind::Pool).unwrap();
    a.chain(&b);
    let mut out = [0u8; 7];
    assert_eq!(a.copy_out(3, &mut out), 7);
    assert_eq!(&out, b"lo worl");
    let mut all = Vec::new();
    a.for_each_payload(|bytes| all.extend_from_slice(bytes));
    assert_eq!(all, b"hello world");
}

#[test]
fn test_rom_alloc_via_alloc_is_rejected() {
    let s = store();
    assert!(Pbuf::alloc(&s, PbufLayer::Raw, 4, PbufKind::Rom).is_none());
    assert!(Pbuf::alloc(&s, PbufLayer::Raw, 4, PbufKind::Ref).is_none());
}
