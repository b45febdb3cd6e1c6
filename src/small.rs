//! Pool view specialized for fixed-size bin pages, plus the free-list layer
//! sitting in front of it.
//!
//! `FreeNode`/`FreeList` store the next pointer directly in the freed slot,
//! the usual free-list-in-place trick for a bump/bin allocator: no separate
//! metadata allocation is needed to track free slots, since a free slot has
//! no live contents to protect. This module adds a `host` back-pointer to
//! that layout because one `Buckets` can carve pages from more than one
//! `Pool`.

use crate::attr::Attr;
use crate::bitvector::BitVector;
use crate::attr::Segment;
use crate::debug::{DebugOptions, MEMSTOMP_ALLOC_BYTE, MEMSTOMP_FREE_BYTE};
use crate::pool::{PageTag, Pool, PAGE_SIZE};
use crate::runtime::Runtime;
use std::mem;
use std::ptr::NonNull;

pub const BIN_SIZES: [usize; 8] = [16, 32, 64, 128, 256, 512, 1024, 2048];
const BIN_TAGS: [PageTag; 8] = [
    PageTag::B16,
    PageTag::B32,
    PageTag::B64,
    PageTag::B128,
    PageTag::B256,
    PageTag::B512,
    PageTag::B1024,
    PageTag::B2048,
];

/// Maps a requested byte size to its bin tag: the smallest bin size that
/// fits `requested`.
///
/// Returns `None` for `requested > 2048`: those allocations must be routed
/// to the large-object path by the caller.
pub fn bin_table(requested: usize) -> Option<PageTag> {
    if requested > 2048 {
        return None;
    }
    for (tag, &sz) in BIN_TAGS.iter().zip(BIN_SIZES.iter()) {
        if requested <= sz {
            return Some(*tag);
        }
    }
    unreachable!("2048 is the largest bin size and is checked above")
}

pub fn bin_index(tag: PageTag) -> usize {
    BIN_TAGS.iter().position(|&t| t == tag).expect("not a small-bin tag")
}

/// A free bin-sized slot's in-place representation. Never constructed in
/// isolation: this struct is `ptr::write`n directly into reclaimed slot
/// memory. Requires every bin size to be at least
/// `2 * size_of::<usize>()` (16 bytes on 64-bit), which is a structural
/// invariant of the size-class set.
#[repr(C)]
struct FreeNode {
    next: *mut FreeNode,
    /// Weak back-reference: the pool outlives every slot it manages.
    host: *mut Pool,
}

const _: () = assert!(BIN_SIZES[0] >= mem::size_of::<FreeNode>());

/// A singly-linked stack of free slots for one bin class.
pub struct FreeList {
    head: *mut FreeNode,
}

impl Default for FreeList {
    fn default() -> Self {
        FreeList { head: std::ptr::null_mut() }
    }
}

impl FreeList {
    pub fn new() -> Self {
        FreeList::default()
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    /// Push `slot` onto the head of this list. O(1). Does not validate that
    /// `slot` actually belongs to a bin page of the right size; that's
    /// enforced by the caller.
    ///
    /// # Safety
    /// `slot` must point to `size_of::<FreeNode>()` writable bytes that are
    /// not concurrently accessed.
    pub unsafe fn free(&mut self, slot: *mut u8, host: *mut Pool) {
        let node = slot as *mut FreeNode;
        std::ptr::write(node, FreeNode { next: self.head, host });
        self.head = node;
    }

    /// Pop the head slot, returning its address and owning pool pointer.
    ///
    /// # Safety
    /// The list must only contain nodes written by [`FreeList::free`] or the
    /// page-carving step in [`Buckets::alloc`].
    pub unsafe fn pop(&mut self) -> Option<(*mut u8, *mut Pool)> {
        if self.head.is_null() {
            return None;
        }
        let node = &*self.head;
        let addr = self.head as *mut u8;
        let host = node.host;
        self.head = node.next;
        Some((addr, host))
    }
}

/// Borrowed view of a `Pool` known to be configured `is_large_object = false`.
pub struct SmallObjectPool<'a> {
    pool: &'a mut Pool,
}

impl<'a> SmallObjectPool<'a> {
    /// Wrap a small `Pool`. Panics if `pool.is_large_object()` is true.
    pub fn new(pool: &'a mut Pool) -> Self {
        assert!(!pool.is_large_object(), "SmallObjectPool requires a pool created with is_large_object = false");
        SmallObjectPool { pool }
    }

    pub fn pool(&self) -> &Pool {
        self.pool
    }

    /// Linear scan from `search_start` for the first `B_FREE` page; tags it
    /// `bin`, decrements `free_pages`, advances `search_start`, and returns
    /// the page's base address. `None` on exhaustion.
    pub fn alloc_page(&mut self, bin: PageTag) -> Option<NonNull<u8>> {
        assert!(bin.is_small_bin(), "alloc_page requires a bin tag");
        let npages = self.pool.npages;
        let mut pn = self.pool.search_start;
        while pn < npages {
            if self.pool.page_table[pn] == PageTag::BFree {
                self.pool.page_table[pn] = bin;
                self.pool.free_pages -= 1;
                self.pool.search_start = pn + 1;
                let base = self.pool.base.expect("pool destroyed").as_ptr() as usize;
                log::debug!(target: "heapcore::pool", "carved bin page {} as {:?}", pn, bin);
                return NonNull::new((base + pn * PAGE_SIZE) as *mut u8);
            }
            pn += 1;
        }
        None
    }

    /// Page index -> tag (must be a small-bin tag) -> bin size.
    pub fn get_size(&self, p: usize) -> usize {
        let pn = self.pool.page_of(p);
        self.pool.page_table[pn].bin_size().expect("page is not a small-bin page")
    }

    /// Round `p` down to its slot boundary and return base/size/attr, or the
    /// empty descriptor if `p`'s page is not a bin page.
    pub fn get_info(&self, p: usize) -> crate::attr::BlkInfo {
        use crate::attr::BlkInfo;
        let pn = self.pool.page_of(p);
        let bin_size = match self.pool.page_table[pn].bin_size() {
            Some(sz) => sz,
            None => return BlkInfo::none(),
        };
        let slot_addr = p & !(bin_size - 1);
        let biti = self.pool.biti_of(slot_addr);
        BlkInfo {
            base: std::ptr::NonNull::new(slot_addr as *mut u8),
            size: bin_size,
            attr: self.pool.get_bits(biti),
        }
    }

    /// For each bin page: walk its slots, finalize+record any whose
    /// `finals` bit is set and whose finalizer lives in `segment`, then
    /// flush the accumulated `free_bits`/attribute clears for that page in
    /// one bulk call. Does not relink freed slots into any `FreeList` or
    /// reclaim the page itself. That bookkeeping is left to the embedding
    /// collector's own sweep-driver step.
    pub fn run_finalizers<R: Runtime>(&mut self, segment: Segment, runtime: &mut R) {
        let npages = self.pool.npages;
        let base = self.pool.base.expect("pool destroyed").as_ptr() as usize;
        let bits_per_page = PAGE_SIZE >> self.pool.shift;
        let debug = self.pool.debug;

        for pn in 0..npages {
            let size = match self.pool.page_table[pn].bin_size() {
                Some(sz) => sz,
                None => continue,
            };
            let bitstride = size / 16;
            let base_bit = pn * bits_per_page;
            let num_slots = PAGE_SIZE / size;
            let mut to_free = BitVector::allocate(bits_per_page);
            let mut any_freed = false;

            for slot_idx in 0..num_slots {
                let local_bit = slot_idx * bitstride;
                let biti = base_bit + local_bit;
                let has_finals = self.pool.finals.as_ref().map_or(false, |f| f.n_bits() > 0 && f.test(biti));
                if !has_finals {
                    continue;
                }
                let slot_addr = base + pn * PAGE_SIZE + slot_idx * size;
                let attr = self.pool.get_bits(biti);
                let p = slot_addr as *const u8;
                if runtime.has_finalizer_in_segment(p, size, attr, segment) {
                    runtime.finalize_from_gc(p, size, attr);
                    to_free.set(local_bit);
                    any_freed = true;
                    if debug.contains(DebugOptions::MEMSTOMP) {
                        unsafe { std::ptr::write_bytes(slot_addr as *mut u8, MEMSTOMP_FREE_BYTE, size) };
                    }
                }
            }

            if any_freed {
                self.pool.free_page_bits(pn, &to_free);
            }
        }
    }
}

/// `more_memory` callback the driver supplies to [`Buckets::alloc`]: must
/// return a pool with at least one free page, or fail higher up (e.g. by
/// triggering a collection or aborting via `Runtime::on_out_of_memory`).
pub trait MoreMemory {
    fn more_memory(&mut self, bin: PageTag) -> *mut Pool;
}

impl<F: FnMut(PageTag) -> *mut Pool> MoreMemory for F {
    fn more_memory(&mut self, bin: PageTag) -> *mut Pool {
        self(bin)
    }
}

/// One `FreeList` per small-bin class.
pub struct Buckets {
    free_lists: [FreeList; 8],
}

impl Default for Buckets {
    fn default() -> Self {
        Buckets { free_lists: std::array::from_fn(|_| FreeList::new()) }
    }
}

impl Buckets {
    pub fn new() -> Self {
        Buckets::default()
    }

    /// Carve the page returned by `more_memory` into `allocated_size`-byte
    /// slots and chain them onto `free_lists[idx]` (last slot's `next` is
    /// null).
    ///
    /// # Safety
    /// `pool_ptr` must be a valid, non-aliased `*mut Pool` configured as a
    /// small pool, with at least one free page.
    unsafe fn carve_new_page(&mut self, pool_ptr: *mut Pool, bin: PageTag, idx: usize) {
        let mut view = SmallObjectPool::new(&mut *pool_ptr);
        let page = view
            .alloc_page(bin)
            .expect("more_memory must return a pool with a free page");
        let allocated_size = bin.bin_size().expect("carve_new_page requires a bin tag");
        let num_slots = PAGE_SIZE / allocated_size;
        let page_base = page.as_ptr() as usize;
        for i in 0..num_slots {
            let slot = (page_base + i * allocated_size) as *mut u8;
            self.free_lists[idx].free(slot, pool_ptr);
        }
    }

    /// Look up `requested`'s bin, refill the free list via `more_memory` if
    /// empty, pop a slot, and record `flags` on it. Returns the slot address
    /// and the bin's fixed allocation size.
    ///
    /// # Safety
    /// `more_memory` must return a live, non-aliased small `Pool` pointer
    /// with at least one free page whenever the free list is empty.
    pub unsafe fn alloc(
        &mut self,
        requested: usize,
        flags: Attr,
        mut more_memory: impl MoreMemory,
    ) -> (*mut u8, usize) {
        let bin = bin_table(requested).expect("requested size must be routed to the large path above 2048 bytes");
        let allocated_size = bin.bin_size().unwrap();
        let idx = bin_index(bin);

        if self.free_lists[idx].is_empty() {
            let pool_ptr = more_memory.more_memory(bin);
            self.carve_new_page(pool_ptr, bin, idx);
        }

        let (slot, host) = self.free_lists[idx].pop().expect("just refilled this free list");
        if !flags.is_empty() {
            let pool = &mut *host;
            let biti = pool.biti_of(slot as usize);
            pool.set_bits(biti, flags);
        }
        if (&*host).debug.contains(DebugOptions::MEMSTOMP) {
            std::ptr::write_bytes(slot, MEMSTOMP_ALLOC_BYTE, allocated_size);
        }
        (&mut *host).ledger_record_alloc(slot as usize);
        (slot, allocated_size)
    }

    /// Push a slot back onto its bin's free list. O(1); does not validate
    /// that `slot` belongs to a bin page.
    ///
    /// # Safety
    /// `slot` must have come from a prior `alloc` of the same bin size and
    /// must not be referenced again after this call.
    pub unsafe fn free(&mut self, slot: *mut u8, host: *mut Pool, bin: PageTag) {
        let idx = bin_index(bin);
        (&mut *host).ledger_record_free(slot as usize);
        self.free_lists[idx].free(slot, host);
    }
}
