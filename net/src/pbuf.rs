//! Packet buffers.
//!
//! # Architecture
//!
//! A [`Pbuf`] is a reference-counted node of a singly linked chain. Each node
//! has a payload window (`offset`, `len`) into its storage and the total
//! length of itself plus every node after it (`tot_len`).
//!
//! Storage comes in four kinds:
//!
//! | Kind | Backing | Header room |
//! |------|---------|-------------|
//! | `Ram`  | one arena block ([`crate::mem`]) | reveal/hide |
//! | `Pool` | one fixed-size cell per node | reveal/hide |
//! | `Rom`  | `&'static [u8]` + one metadata slot | hide only |
//! | `Ref`  | shared `Rc<[u8]>` + one metadata slot | hide only |
//!
//! Reference counting is the `Rc` strong count: cloning a `Pbuf` takes a
//! reference and dropping one releases it. When a node's count reaches zero
//! its storage returns to its allocator and the reference it held on its
//! successor is dropped, so release walks down the chain only as far as the
//! successors also reach zero. [`Pbuf::free`] makes that walk explicit and
//! reports how many nodes it released.
//!
//! All allocators live in a shared [`BufStore`] so that a node can release
//! its storage from `Drop`.

use alloc::boxed::Box;
use alloc::rc::Rc;
use alloc::vec;
use alloc::vec::Vec;
use core::cell::RefCell;
use core::fmt;
use core::ops::Range;

use netsys_lib::{align_up_usize, klog_debug, klog_warn};

use crate::config::{MEM_ALIGNMENT, NetConfig, PBUF_IP_HLEN, PBUF_LINK_HLEN, PBUF_TRANSPORT_HLEN};
use crate::mem::{Arena, MemPtr};
use crate::memp::{MempKind, Pool, PoolHandle};

// =============================================================================
// Layers and kinds
// =============================================================================

/// How much header room to reserve in front of the payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PbufLayer {
    Transport,
    Ip,
    Link,
    Raw,
}

impl PbufLayer {
    pub const fn offset(self) -> usize {
        match self {
            Self::Transport => PBUF_TRANSPORT_HLEN + PBUF_IP_HLEN + PBUF_LINK_HLEN,
            Self::Ip => PBUF_IP_HLEN + PBUF_LINK_HLEN,
            Self::Link => PBUF_LINK_HLEN,
            Self::Raw => 0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PbufKind {
    Ram,
    Rom,
    Ref,
    Pool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PbufError {
    /// The payload cursor would move outside the storage or past `len`.
    OutOfRange,
    /// The storage is read-only (ROM/REF).
    ReadOnly,
}

impl fmt::Display for PbufError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfRange => write!(f, "pbuf header adjustment out of range"),
            Self::ReadOnly => write!(f, "pbuf storage is read-only"),
        }
    }
}

// =============================================================================
// Store
// =============================================================================

/// Free list of fixed-size POOL cells.
struct CellPool {
    free: Vec<Box<[u8]>>,
    capacity: usize,
    bufsize: usize,
}

impl CellPool {
    fn new(capacity: usize, bufsize: usize) -> Self {
        let free = (0..capacity)
            .map(|_| vec![0u8; bufsize].into_boxed_slice())
            .collect();
        Self {
            free,
            capacity,
            bufsize,
        }
    }
}

/// Allocators shared by every pbuf of one stack instance.
pub struct BufStore {
    arena: RefCell<Arena>,
    cells: RefCell<CellPool>,
    meta: RefCell<Pool<()>>,
}

impl BufStore {
    pub fn new(cfg: &NetConfig) -> Rc<Self> {
        Rc::new(Self {
            arena: RefCell::new(Arena::new(cfg.mem_size)),
            cells: RefCell::new(CellPool::new(cfg.pbuf_pool_size, cfg.pbuf_pool_bufsize)),
            meta: RefCell::new(Pool::new(MempKind::Pbuf, MempKind::Pbuf.capacity(cfg))),
        })
    }

    /// Run `f` with the arena, e.g. to inspect its invariants.
    pub fn with_arena<R>(&self, f: impl FnOnce(&Arena) -> R) -> R {
        f(&self.arena.borrow())
    }

    pub fn pool_available(&self) -> usize {
        self.cells.borrow().free.len()
    }

    pub fn pool_capacity(&self) -> usize {
        self.cells.borrow().capacity
    }

    pub fn pool_bufsize(&self) -> usize {
        self.cells.borrow().bufsize
    }

    pub fn meta_available(&self) -> usize {
        self.meta.borrow().available()
    }

    /// `true` when every allocator is back to its initial state.
    pub fn is_idle(&self) -> bool {
        self.arena.borrow().is_pristine()
            && self.pool_available() == self.pool_capacity()
            && self.meta.borrow().used() == 0
    }
}

// =============================================================================
// Nodes
// =============================================================================

enum Storage {
    Ram(MemPtr),
    Pool(Box<[u8]>),
    Rom(&'static [u8]),
    Ref(Rc<[u8]>),
}

struct PbufNode {
    store: Rc<BufStore>,
    storage: Storage,
    meta: Option<PoolHandle<()>>,
    /// Payload start within the storage.
    offset: usize,
    len: usize,
    tot_len: usize,
    next: Option<Pbuf>,
}

impl PbufNode {
    fn kind(&self) -> PbufKind {
        match self.storage {
            Storage::Ram(_) => PbufKind::Ram,
            Storage::Pool(_) => PbufKind::Pool,
            Storage::Rom(_) => PbufKind::Rom,
            Storage::Ref(_) => PbufKind::Ref,
        }
    }

    fn window(&self) -> Range<usize> {
        self.offset..self.offset + self.len
    }

    fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let range = self.window();
        match &self.storage {
            Storage::Ram(ptr) => {
                let arena = self.store.arena.borrow();
                let r = f(arena.bytes(*ptr).get(range).unwrap_or(&[]));
                r
            }
            Storage::Pool(cell) => f(cell.get(range).unwrap_or(&[])),
            Storage::Rom(data) => f(data.get(range).unwrap_or(&[])),
            Storage::Ref(data) => f(data.get(range).unwrap_or(&[])),
        }
    }

    fn with_bytes_mut<R>(&mut self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R, PbufError> {
        let range = self.window();
        match &mut self.storage {
            Storage::Ram(ptr) => {
                let mut arena = self.store.arena.borrow_mut();
                let bytes = arena.bytes_mut(*ptr).get_mut(range).ok_or(PbufError::OutOfRange)?;
                let r = f(bytes);
                Ok(r)
            }
            Storage::Pool(cell) => Ok(f(cell.get_mut(range).ok_or(PbufError::OutOfRange)?)),
            Storage::Rom(_) | Storage::Ref(_) => Err(PbufError::ReadOnly),
        }
    }

    fn release_storage(&mut self) {
        match core::mem::replace(&mut self.storage, Storage::Rom(&[])) {
            Storage::Ram(ptr) => self.store.arena.borrow_mut().free(ptr),
            Storage::Pool(cell) => self.store.cells.borrow_mut().free.push(cell),
            Storage::Rom(_) | Storage::Ref(_) => {}
        }
        if let Some(meta) = self.meta.take() {
            self.store.meta.borrow_mut().free(meta);
        }
    }
}

impl Drop for PbufNode {
    fn drop(&mut self) {
        self.release_storage();
        // Unlink successors iteratively; recursion depth would otherwise grow
        // with chain length.
        let mut next = self.next.take();
        while let Some(p) = next {
            match Rc::try_unwrap(p.0) {
                Ok(cell) => {
                    let mut node = cell.into_inner();
                    next = node.next.take();
                }
                Err(_) => break,
            }
        }
    }
}

// =============================================================================
// Pbuf
// =============================================================================

/// Counted reference to the head of a pbuf chain.
pub struct Pbuf(Rc<RefCell<PbufNode>>);

impl Clone for Pbuf {
    /// Take another reference (`pbuf_ref`).
    fn clone(&self) -> Self {
        Pbuf(Rc::clone(&self.0))
    }
}

impl fmt::Debug for Pbuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let n = self.0.borrow();
        f.debug_struct("Pbuf")
            .field("kind", &n.kind())
            .field("len", &n.len)
            .field("tot_len", &n.tot_len)
            .field("ref", &Rc::strong_count(&self.0))
            .finish()
    }
}

impl Pbuf {
    fn from_node(node: PbufNode) -> Self {
        Pbuf(Rc::new(RefCell::new(node)))
    }

    /// Allocate a buffer of `size` payload bytes with header room for
    /// `layer`. Only `Ram` and `Pool` own storage; ROM and REF buffers are
    /// made with [`Pbuf::rom`] and [`Pbuf::reference`].
    pub fn alloc(store: &Rc<BufStore>, layer: PbufLayer, size: usize, kind: PbufKind) -> Option<Pbuf> {
        let offset = layer.offset();
        match kind {
            PbufKind::Ram => {
                let total = align_up_usize(offset + size, MEM_ALIGNMENT).max(MEM_ALIGNMENT);
                let ptr = store.arena.borrow_mut().alloc(total);
                let Some(ptr) = ptr else {
                    klog_debug!("pbuf: arena exhausted size={}", size);
                    return None;
                };
                Some(Self::from_node(PbufNode {
                    store: Rc::clone(store),
                    storage: Storage::Ram(ptr),
                    meta: None,
                    offset,
                    len: size,
                    tot_len: size,
                    next: None,
                }))
            }
            PbufKind::Pool => Self::alloc_pool(store, offset, size),
            PbufKind::Rom | PbufKind::Ref => {
                klog_warn!("pbuf: alloc called for {:?}, use rom()/reference()", kind);
                None
            }
        }
    }

    fn alloc_pool(store: &Rc<BufStore>, offset: usize, size: usize) -> Option<Pbuf> {
        let bufsize = store.pool_bufsize();
        if offset >= bufsize {
            return None;
        }
        let mut nodes: Vec<Pbuf> = Vec::new();
        let mut remaining = size;
        let mut node_offset = offset;
        loop {
            let cell = store.cells.borrow_mut().free.pop();
            let Some(cell) = cell else {
                klog_debug!("pbuf: pool exhausted size={}", size);
                return None;
            };
            let len = remaining.min(bufsize - node_offset);
            nodes.push(Self::from_node(PbufNode {
                store: Rc::clone(store),
                storage: Storage::Pool(cell),
                meta: None,
                offset: node_offset,
                len,
                tot_len: remaining,
                next: None,
            }));
            remaining -= len;
            node_offset = 0;
            if remaining == 0 {
                break;
            }
        }
        for i in (1..nodes.len()).rev() {
            let next = nodes[i].clone();
            nodes[i - 1].0.borrow_mut().next = Some(next);
        }
        nodes.into_iter().next()
    }

    /// Wrap static bytes without copying.
    pub fn rom(store: &Rc<BufStore>, data: &'static [u8]) -> Option<Pbuf> {
        let meta = store.meta.borrow_mut().alloc(());
        let meta = meta?;
        Some(Self::from_node(PbufNode {
            store: Rc::clone(store),
            storage: Storage::Rom(data),
            meta: Some(meta),
            offset: 0,
            len: data.len(),
            tot_len: data.len(),
            next: None,
        }))
    }

    /// Reference `range` of shared bytes without copying.
    pub fn reference(store: &Rc<BufStore>, data: Rc<[u8]>, range: Range<usize>) -> Option<Pbuf> {
        if range.end > data.len() || range.start > range.end {
            return None;
        }
        let meta = store.meta.borrow_mut().alloc(());
        let meta = meta?;
        let len = range.end - range.start;
        Some(Self::from_node(PbufNode {
            store: Rc::clone(store),
            storage: Storage::Ref(data),
            meta: Some(meta),
            offset: range.start,
            len,
            tot_len: len,
            next: None,
        }))
    }

    /// Allocate and fill a buffer with a copy of `data`.
    pub fn from_slice(store: &Rc<BufStore>, layer: PbufLayer, data: &[u8], kind: PbufKind) -> Option<Pbuf> {
        let p = Self::alloc(store, layer, data.len(), kind)?;
        p.copy_in(data).ok()?;
        Some(p)
    }

    // ---------------------------------------------------------------------
    // Accessors
    // ---------------------------------------------------------------------

    pub fn len(&self) -> usize {
        self.0.borrow().len
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().tot_len == 0
    }

    pub fn tot_len(&self) -> usize {
        self.0.borrow().tot_len
    }

    pub fn kind(&self) -> PbufKind {
        self.0.borrow().kind()
    }

    /// Number of references held on this node.
    pub fn ref_count(&self) -> usize {
        Rc::strong_count(&self.0)
    }

    /// Take a new reference on the next node of the chain.
    pub fn next(&self) -> Option<Pbuf> {
        self.0.borrow().next.clone()
    }

    /// `true` if both handles reference the same node.
    pub fn ptr_eq(&self, other: &Pbuf) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// Number of nodes in the chain starting here.
    pub fn clen(&self) -> usize {
        let mut n = 0;
        self.for_each_node(|_| n += 1);
        n
    }

    fn for_each_node(&self, mut f: impl FnMut(&PbufNode)) {
        let mut cur = Some(self.clone());
        while let Some(p) = cur {
            let node = p.0.borrow();
            f(&node);
            let next = node.next.clone();
            drop(node);
            cur = next;
        }
    }

    /// Run `f` over the payload of this node only.
    pub fn with_payload<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        self.0.borrow().with_bytes(f)
    }

    /// Run `f` over the writable payload of this node only.
    pub fn with_payload_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R, PbufError> {
        self.0.borrow_mut().with_bytes_mut(f)
    }

    /// Visit the payload of every node of the chain in order.
    pub fn for_each_payload(&self, mut f: impl FnMut(&[u8])) {
        self.for_each_node(|n| n.with_bytes(&mut f));
    }

    /// Copy chain bytes starting at `offset` into `dst`. Returns the number of
    /// bytes copied.
    pub fn copy_out(&self, offset: usize, dst: &mut [u8]) -> usize {
        let mut skip = offset;
        let mut copied = 0;
        self.for_each_payload(|bytes| {
            if copied == dst.len() {
                return;
            }
            if skip >= bytes.len() {
                skip -= bytes.len();
                return;
            }
            let src = &bytes[skip..];
            skip = 0;
            let n = src.len().min(dst.len() - copied);
            dst[copied..copied + n].copy_from_slice(&src[..n]);
            copied += n;
        });
        copied
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.tot_len());
        self.for_each_payload(|b| out.extend_from_slice(b));
        out
    }

    /// Copy `src` into the chain payloads, front to back.
    pub fn copy_in(&self, src: &[u8]) -> Result<usize, PbufError> {
        let mut written = 0;
        let mut cur = Some(self.clone());
        while let Some(p) = cur {
            if written == src.len() {
                break;
            }
            let mut node = p.0.borrow_mut();
            let n = node.with_bytes_mut(|dst| {
                let n = dst.len().min(src.len() - written);
                dst[..n].copy_from_slice(&src[written..written + n]);
                n
            })?;
            written += n;
            let next = node.next.clone();
            drop(node);
            cur = next;
        }
        Ok(written)
    }

    // ---------------------------------------------------------------------
    // Header room
    // ---------------------------------------------------------------------

    /// Move the payload start of this node: a positive `delta` reveals
    /// header bytes, a negative one hides them. `len` and `tot_len` follow.
    pub fn header(&self, delta: isize) -> Result<(), PbufError> {
        let mut node = self.0.borrow_mut();
        if delta >= 0 {
            let d = delta as usize;
            match node.storage {
                Storage::Rom(_) | Storage::Ref(_) if d > 0 => return Err(PbufError::ReadOnly),
                _ => {}
            }
            if d > node.offset {
                return Err(PbufError::OutOfRange);
            }
            node.offset -= d;
            node.len += d;
            node.tot_len += d;
        } else {
            let d = delta.unsigned_abs();
            if d > node.len {
                return Err(PbufError::OutOfRange);
            }
            node.offset += d;
            node.len -= d;
            node.tot_len -= d;
        }
        Ok(())
    }

    /// Hide `n` bytes from the front of the chain while keeping this node as
    /// the head; nodes drained completely are left with `len == 0`.
    pub fn hide_front(&self, n: usize) -> Result<(), PbufError> {
        if n > self.tot_len() {
            return Err(PbufError::OutOfRange);
        }
        let new_tot = self.tot_len() - n;
        let mut off = n;
        let mut q = self.clone();
        loop {
            let next = {
                let mut node = q.0.borrow_mut();
                if node.len >= off {
                    break;
                }
                off -= node.len;
                node.offset += node.len;
                node.len = 0;
                node.tot_len = new_tot;
                node.next.clone()
            };
            match next {
                Some(p) => q = p,
                None => return Err(PbufError::OutOfRange),
            }
        }
        q.header(-(off as isize))
    }

    /// Consume `n` bytes from the front, releasing nodes that become empty.
    /// Returns the remaining chain, if any bytes are left.
    pub fn skip(self, n: usize) -> Option<Pbuf> {
        let mut head = self;
        let mut n = n;
        loop {
            let len = head.len();
            if n < len {
                break;
            }
            match head.next() {
                Some(next) => {
                    n -= len;
                    head.free();
                    head = next;
                }
                None => {
                    head.free();
                    return None;
                }
            }
        }
        if n > 0 && head.header(-(n as isize)).is_err() {
            return None;
        }
        Some(head)
    }

    // ---------------------------------------------------------------------
    // Chain operations
    // ---------------------------------------------------------------------

    /// Shrink the chain to `new_len` bytes. Nodes past the new end are
    /// released and a RAM tail node gives its unused bytes back to the
    /// arena. Growing is not supported and leaves the chain unchanged.
    pub fn realloc(&self, new_len: usize) {
        let tot = self.tot_len();
        if new_len >= tot {
            return;
        }
        let shrink = tot - new_len;
        let mut rem = new_len;
        let mut q = self.clone();
        loop {
            let next = {
                let mut node = q.0.borrow_mut();
                if rem <= node.len {
                    break;
                }
                rem -= node.len;
                node.tot_len -= shrink;
                node.next.clone()
            };
            match next {
                Some(p) => q = p,
                None => return,
            }
        }
        let rest = {
            let mut node = q.0.borrow_mut();
            if let Storage::Ram(ptr) = node.storage {
                if rem != node.len {
                    let keep = align_up_usize(node.offset + rem, MEM_ALIGNMENT).max(MEM_ALIGNMENT);
                    let store = Rc::clone(&node.store);
                    let shrunk = store.arena.borrow_mut().shrink(ptr, keep);
                    debug_assert_eq!(shrunk, Some(ptr));
                }
            }
            node.len = rem;
            node.tot_len = rem;
            node.next.take()
        };
        drop(q);
        if let Some(rest) = rest {
            rest.free();
        }
    }

    /// Append `tail` to this chain, taking a new reference on it
    /// (`pbuf_chain`). The caller keeps its own reference.
    pub fn chain(&self, tail: &Pbuf) {
        let add = tail.tot_len();
        let mut q = self.clone();
        loop {
            let next = {
                let mut node = q.0.borrow_mut();
                node.tot_len += add;
                node.next.clone()
            };
            match next {
                Some(p) => q = p,
                None => break,
            }
        }
        q.0.borrow_mut().next = Some(tail.clone());
    }

    /// Append `tail`, consuming the caller's reference (`pbuf_cat`).
    pub fn cat(&self, tail: Pbuf) {
        self.chain(&tail);
    }

    /// Drop this reference and report how many nodes were released: the
    /// walk continues down the chain only while each successor's count
    /// also reaches zero.
    pub fn free(self) -> usize {
        let mut released = 0;
        let mut cur = Some(self);
        while let Some(p) = cur {
            if Rc::strong_count(&p.0) != 1 {
                break;
            }
            released += 1;
            cur = p.0.borrow_mut().next.take();
        }
        released
    }
}

#[cfg(test)]
#[path = "pbuf_tests.rs"]
mod pbuf_tests;
