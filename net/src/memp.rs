//! Typed fixed-capacity object pools.
//!
//! Every kind of protocol object (UDP PCB, TCP PCB, listen PCB, TCP segment,
//! pbuf metadata) comes from its own [`Pool`]. A pool is a slab of slots with
//! an intrusive singly linked free list; alloc pops the head and free pushes
//! it back, both O(1). Handles carry a generation so a handle to a freed slot
//! never reaches the slot's next owner.

use core::fmt;
use core::marker::PhantomData;

use alloc::vec::Vec;

use netsys_lib::klog_debug;

use crate::config::NetConfig;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MempKind {
    Pbuf,
    UdpPcb,
    TcpPcb,
    TcpPcbListen,
    TcpSeg,
}

impl MempKind {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Pbuf => "PBUF",
            Self::UdpPcb => "UDP_PCB",
            Self::TcpPcb => "TCP_PCB",
            Self::TcpPcbListen => "TCP_PCB_LISTEN",
            Self::TcpSeg => "TCP_SEG",
        }
    }

    /// Capacity of this kind under `cfg`.
    pub const fn capacity(self, cfg: &NetConfig) -> usize {
        match self {
            Self::Pbuf => cfg.memp_num_pbuf,
            Self::UdpPcb => cfg.memp_num_udp_pcb,
            Self::TcpPcb => cfg.memp_num_tcp_pcb,
            Self::TcpPcbListen => cfg.memp_num_tcp_pcb_listen,
            Self::TcpSeg => cfg.memp_num_tcp_seg,
        }
    }
}

// =============================================================================
// Handles
// =============================================================================

/// Generation-checked reference to a slot in a `Pool<T>`.
pub struct PoolHandle<T> {
    index: u32,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> PoolHandle<T> {
    #[inline]
    pub const fn index(&self) -> usize {
        self.index as usize
    }
}

impl<T> Clone for PoolHandle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for PoolHandle<T> {}

impl<T> PartialEq for PoolHandle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for PoolHandle<T> {}

impl<T> fmt::Debug for PoolHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

// =============================================================================
// Pool
// =============================================================================

struct Slot<T> {
    value: Option<T>,
    generation: u32,
    next_free: Option<u32>,
}

pub struct Pool<T> {
    kind: MempKind,
    slots: Vec<Slot<T>>,
    free_head: Option<u32>,
    used: usize,
    /// Highest simultaneous use seen.
    max_used: usize,
    /// Allocation requests refused because the pool was empty.
    failures: usize,
}

impl<T> Pool<T> {
    /// Build a pool of `capacity` slots, all on the free list.
    pub fn new(kind: MempKind, capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        for i in 0..capacity {
            let next_free = if i + 1 < capacity {
                Some((i + 1) as u32)
            } else {
                None
            };
            slots.push(Slot {
                value: None,
                generation: 0,
                next_free,
            });
        }
        Self {
            kind,
            slots,
            free_head: if capacity > 0 { Some(0) } else { None },
            used: 0,
            max_used: 0,
            failures: 0,
        }
    }

    /// Place `value` in a free slot. `None` when the pool is exhausted.
    pub fn alloc(&mut self, value: T) -> Option<PoolHandle<T>> {
        let Some(index) = self.free_head else {
            self.failures += 1;
            klog_debug!("memp: {} exhausted used={}", self.kind.name(), self.used);
            return None;
        };
        let slot = &mut self.slots[index as usize];
        self.free_head = slot.next_free.take();
        slot.value = Some(value);
        self.used += 1;
        self.max_used = self.max_used.max(self.used);
        Some(PoolHandle {
            index,
            generation: slot.generation,
            _marker: PhantomData,
        })
    }

    /// Return a slot to the free list, handing back its value. Stale handles
    /// yield `None` and leave the pool untouched.
    pub fn free(&mut self, handle: PoolHandle<T>) -> Option<T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        slot.next_free = self.free_head;
        self.free_head = Some(handle.index);
        self.used -= 1;
        Some(value)
    }

    pub fn get(&self, handle: PoolHandle<T>) -> Option<&T> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.value.as_ref()
    }

    pub fn get_mut(&mut self, handle: PoolHandle<T>) -> Option<&mut T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.value.as_mut()
    }

    pub fn contains(&self, handle: PoolHandle<T>) -> bool {
        self.get(handle).is_some()
    }

    /// Iterate over every live object together with its handle.
    pub fn iter(&self) -> impl Iterator<Item = (PoolHandle<T>, &T)> + '_ {
        self.slots.iter().enumerate().filter_map(|(i, slot)| {
            slot.value.as_ref().map(|v| {
                (
                    PoolHandle {
                        index: i as u32,
                        generation: slot.generation,
                        _marker: PhantomData,
                    },
                    v,
                )
            })
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (PoolHandle<T>, &mut T)> + '_ {
        self.slots.iter_mut().enumerate().filter_map(|(i, slot)| {
            let generation = slot.generation;
            slot.value.as_mut().map(|v| {
                (
                    PoolHandle {
                        index: i as u32,
                        generation,
                        _marker: PhantomData,
                    },
                    v,
                )
            })
        })
    }

    pub fn kind(&self) -> MempKind {
        self.kind
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn available(&self) -> usize {
        self.slots.len() - self.used
    }

    pub fn is_exhausted(&self) -> bool {
        self.free_head.is_none()
    }

    pub fn stats(&self) -> MempStats {
        MempStats {
            kind: self.kind,
            used: self.used,
            max_used: self.max_used,
            capacity: self.slots.len(),
            failures: self.failures,
        }
    }
}

impl<T: Default> Pool<T> {
    /// Allocate a zero-initialised object.
    pub fn alloc_default(&mut self) -> Option<PoolHandle<T>> {
        self.alloc(T::default())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MempStats {
    pub kind: MempKind,
    pub used: usize,
    pub max_used: usize,
    pub capacity: usize,
    pub failures: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhaustion_and_reuse() {
        let mut pool: Pool<u32> = Pool::new(MempKind::UdpPcb, 2);
        let a = pool.alloc(1).unwrap();
        let b = pool.alloc(2).unwrap();
        assert!(pool.alloc(3).is_none());
        assert_eq!(pool.stats().failures, 1);
        assert_eq!(pool.free(a), Some(1));
        let c = pool.alloc(4).unwrap();
        assert_eq!(c.index(), a.index());
        assert_eq!(pool.get(b), Some(&2));
        assert_eq!(pool.used(), 2);
        assert_eq!(pool.stats().max_used, 2);
    }

    #[test]
    fn test_stale_handle_is_rejected() {
        let mut pool: Pool<u32> = Pool::new(MempKind::TcpPcb, 1);
        let a = pool.alloc(7).unwrap();
        pool.free(a);
        let b = pool.alloc(8).unwrap();
        assert_ne!(a, b);
        assert_eq!(pool.get(a), None);
        assert_eq!(pool.free(a), None);
        assert_eq!(pool.get(b), Some(&8));
    }

    #[test]
    fn test_alloc_default_is_zeroed() {
        let mut pool: Pool<[u8; 4]> = Pool::new(MempKind::TcpSeg, 1);
        let h = pool.alloc_default().unwrap();
        assert_eq!(pool.get(h), Some(&[0u8; 4]));
    }

    #[test]
    fn test_iter_visits_live_objects() {
        let mut pool: Pool<u32> = Pool::new(MempKind::TcpPcbListen, 4);
        let a = pool.alloc(1).unwrap();
        let _b = pool.alloc(2).unwrap();
        pool.free(a);
        let live: alloc::vec::Vec<u32> = pool.iter().map(|(_, v)| *v).collect();
        assert_eq!(live, alloc::vec![2]);
        for (_, v) in pool.iter_mut() {
            *v += 10;
        }
        assert_eq!(pool.iter().map(|(_, v)| *v).sum::<u32>(), 12);
    }

    #[test]
    fn test_default_capacities() {
        let cfg = NetConfig::default();
        assert_eq!(MempKind::Pbuf.capacity(&cfg), 100);
        assert_eq!(MempKind::UdpPcb.capacity(&cfg), 4);
        assert_eq!(MempKind::TcpPcb.capacity(&cfg), 7);
        assert_eq!(MempKind::TcpPcbListen.capacity(&cfg), 10);
        assert_eq!(MempKind::TcpSeg.capacity(&cfg), 50);
    }
}
