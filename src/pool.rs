//! One contiguous virtual-address region: page table, attribute bitmaps, and
//! the bookkeeping shared between the small- and large-object views.
//!
//! Page reservation uses `libc::mmap`/`libc::munmap` for page-aligned
//! virtual memory. A `Pool` here is a single mmap'd region rather than a
//! list of fixed-size regions scanned by some outer arena manager, because
//! allocating *new* pools and choosing among them is explicitly the upper
//! driver's job.

use crate::attr::Attr;
use crate::bitvector::BitVector;
use crate::debug::{AllocLedger, DebugOptions};
use crate::error::PoolInitError;
use std::ptr::NonNull;

pub const PAGE_SIZE: usize = 4096;
pub const POOL_SIZE_MIN: usize = PAGE_SIZE * 256;

/// Divisor shift for small pools: one bit per 16 bytes.
pub const SMALL_BIT_SHIFT: u32 = 4;
/// Divisor shift for large pools: one bit per page.
pub const LARGE_BIT_SHIFT: u32 = 12;

/// Page table tag. The value space is closed; add new tags only here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageTag {
    B16 = 0,
    B32,
    B64,
    B128,
    B256,
    B512,
    B1024,
    B2048,
    /// Start of a large (page-spanning) allocation run.
    BPage,
    /// Continuation of a large allocation run.
    BPagePlus,
    /// Unallocated page.
    BFree,
}

impl PageTag {
    /// `Some(bin_size)` if this tag names a small-bin class.
    pub fn bin_size(self) -> Option<usize> {
        use PageTag::*;
        Some(match self {
            B16 => 16,
            B32 => 32,
            B64 => 64,
            B128 => 128,
            B256 => 256,
            B512 => 512,
            B1024 => 1024,
            B2048 => 2048,
            BPage | BPagePlus | BFree => return None,
        })
    }

    pub fn is_small_bin(self) -> bool {
        self.bin_size().is_some()
    }
}

/// One contiguous, page-aligned virtual region with its own page table and
/// attribute bitmaps.
///
/// Small and large pools share this representation; `is_large_object`
/// selects the bit stride and which auxiliary fields are meaningful.
/// Code specific to one view lives in
/// [`crate::large::LargeObjectPool`] / [`crate::small::SmallObjectPool`],
/// which borrow a `Pool` and dispatch on this flag.
pub struct Pool {
    pub(crate) base: Option<NonNull<u8>>,
    pub(crate) top: usize,
    pub(crate) npages: usize,
    pub(crate) free_pages: usize,
    pub(crate) page_table: Vec<PageTag>,
    pub(crate) is_large_object: bool,
    pub(crate) shift: u32,

    pub(crate) mark: BitVector,
    pub(crate) no_scan: BitVector,
    pub(crate) appendable: BitVector,
    /// Small pools only; zero bits on a large pool.
    pub(crate) free_bits: BitVector,

    pub(crate) finals: Option<BitVector>,
    pub(crate) struct_finals: Option<BitVector>,
    /// Large pools only.
    pub(crate) no_interior: Option<BitVector>,

    /// Lower bound: no free page exists below this index.
    pub(crate) search_start: usize,
    /// Upper bound on the largest contiguous free run (large pools only).
    pub(crate) largest_free: usize,

    /// Large pools only: run length at a `BPage` start, offset-back at a
    /// `BPagePlus`, unspecified elsewhere.
    pub(crate) b_page_offsets: Vec<usize>,

    pub(crate) debug: DebugOptions,
    pub(crate) ledger: Option<AllocLedger>,
}

/// Page-aligned anonymous mapping of `size` bytes via `libc::mmap`.
///
/// This is a primitive OS operation with no policy of its own, so it is a
/// free function rather than part of the `Runtime` trait.
pub fn os_map(size: usize) -> Result<NonNull<u8>, PoolInitError> {
    unsafe {
        let p = libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        );
        if p == libc::MAP_FAILED {
            return Err(PoolInitError::MapFailed(std::io::Error::last_os_error()));
        }
        Ok(NonNull::new_unchecked(p as *mut u8))
    }
}

/// Unmap a region previously returned by [`os_map`].
pub fn os_unmap(addr: NonNull<u8>, size: usize) -> Result<(), PoolInitError> {
    let rc = unsafe { libc::munmap(addr.as_ptr() as *mut libc::c_void, size) };
    if rc != 0 {
        return Err(PoolInitError::MapFailed(std::io::Error::last_os_error()));
    }
    Ok(())
}

impl Pool {
    /// Map `n_pages * PAGE_SIZE` bytes, allocate the always-present bitmaps,
    /// and mark every page free.
    pub fn initialize(n_pages: usize, is_large_object: bool) -> Result<Pool, PoolInitError> {
        let size = n_pages.checked_mul(PAGE_SIZE).ok_or(PoolInitError::SizeOverflow)?;
        let base = os_map(size)?;
        let top = base.as_ptr() as usize + size;
        let shift = if is_large_object { LARGE_BIT_SHIFT } else { SMALL_BIT_SHIFT };
        let n_bits = size >> shift;

        log::debug!(target: "heapcore::pool", "mapped pool: {} pages at {:p}, large={}", n_pages, base.as_ptr(), is_large_object);

        let debug = DebugOptions::from_env();
        let ledger = if debug.contains(DebugOptions::LOGGING) {
            Some(AllocLedger::new())
        } else {
            None
        };

        Ok(Pool {
            base: Some(base),
            top,
            npages: n_pages,
            free_pages: n_pages,
            page_table: vec![PageTag::BFree; n_pages],
            is_large_object,
            shift,
            mark: BitVector::allocate(n_bits),
            no_scan: BitVector::allocate(n_bits),
            appendable: BitVector::allocate(n_bits),
            free_bits: if is_large_object { BitVector::allocate(0) } else { BitVector::allocate(n_bits) },
            finals: None,
            struct_finals: None,
            no_interior: None,
            search_start: 0,
            largest_free: n_pages,
            b_page_offsets: if is_large_object { vec![0; n_pages] } else { Vec::new() },
            debug,
            ledger,
        })
    }

    /// Unmap memory and free the page table/bitmaps. Calling this while any
    /// live allocation references the pool is undefined behavior.
    pub fn destroy(&mut self) {
        if let Some(base) = self.base.take() {
            let size = self.npages * PAGE_SIZE;
            if let Err(e) = os_unmap(base, size) {
                log::debug!(target: "heapcore::pool", "munmap failed during destroy: {}", e);
            }
        }
        self.page_table.clear();
        self.mark.destroy();
        self.no_scan.destroy();
        self.appendable.destroy();
        self.free_bits.destroy();
        self.finals = None;
        self.struct_finals = None;
        self.no_interior = None;
        self.b_page_offsets.clear();
        self.npages = 0;
        self.free_pages = 0;
    }

    pub fn base(&self) -> Option<NonNull<u8>> {
        self.base
    }

    pub fn top(&self) -> usize {
        self.top
    }

    pub fn npages(&self) -> usize {
        self.npages
    }

    pub fn free_pages(&self) -> usize {
        self.free_pages
    }

    pub fn is_large_object(&self) -> bool {
        self.is_large_object
    }

    pub fn page_table(&self) -> &[PageTag] {
        &self.page_table
    }

    /// Lower bound: no free page exists below this index. A hint, safe to
    /// re-read after any mutation.
    pub fn search_start(&self) -> usize {
        self.search_start
    }

    /// Upper bound on the largest contiguous free run. Meaningful for large
    /// pools only; may over-estimate, never under-estimate.
    pub fn largest_free(&self) -> usize {
        self.largest_free
    }

    /// `page_of(p) = (p - base) / PAGE_SIZE`. Precondition: `base <= p < top`.
    pub fn page_of(&self, p: usize) -> usize {
        let base = self.base.expect("page_of called on a destroyed pool").as_ptr() as usize;
        assert!(p >= base && p < self.top, "pointer {:#x} not in pool [{:#x}, {:#x})", p, base, self.top);
        (p - base) / PAGE_SIZE
    }

    /// Bit index for an offset within the pool, per the pool's bit stride.
    fn biti_for_offset(&self, offset: usize) -> usize {
        offset >> self.shift
    }

    /// Reads `finals`, `struct_finals`, `no_scan`, `no_interior`, and
    /// `appendable` at `biti`, folding set bits into the returned mask.
    /// Bitmaps with zero `n_bits` (not yet allocated) read as zero.
    pub fn get_bits(&self, biti: usize) -> Attr {
        let mut attr = Attr::NONE;
        if self.no_scan.n_bits() > 0 && self.no_scan.test(biti) {
            attr |= Attr::NO_SCAN;
        }
        if self.appendable.n_bits() > 0 && self.appendable.test(biti) {
            attr |= Attr::APPENDABLE;
        }
        if let Some(finals) = &self.finals {
            if finals.n_bits() > 0 && finals.test(biti) {
                attr |= Attr::FINALIZE;
            }
        }
        if let Some(sf) = &self.struct_finals {
            if sf.n_bits() > 0 && sf.test(biti) {
                attr |= Attr::STRUCT_FINAL;
            }
        }
        if self.is_large_object {
            if let Some(ni) = &self.no_interior {
                if ni.n_bits() > 0 && ni.test(biti) {
                    attr |= Attr::NO_INTERIOR;
                }
            }
        }
        attr
    }

    /// Lazily allocates the corresponding bitmap (sized to match `mark`) for
    /// each requested flag, then sets the bit. `NO_INTERIOR` is ignored on
    /// small-object pools.
    pub fn set_bits(&mut self, biti: usize, mask: Attr) {
        let n_bits = self.mark.n_bits();
        if mask.contains(Attr::NO_SCAN) {
            self.no_scan.set(biti);
        }
        if mask.contains(Attr::APPENDABLE) {
            self.appendable.set(biti);
        }
        if mask.contains(Attr::FINALIZE) {
            self.finals.get_or_insert_with(|| BitVector::allocate(n_bits)).set(biti);
        }
        if mask.contains(Attr::STRUCT_FINAL) {
            self.struct_finals.get_or_insert_with(|| BitVector::allocate(n_bits)).set(biti);
        }
        if mask.contains(Attr::NO_INTERIOR) && self.is_large_object {
            self.no_interior.get_or_insert_with(|| BitVector::allocate(n_bits)).set(biti);
        }
    }

    /// Clears requested bits; a bitmap with zero `n_bits` is a no-op.
    pub fn clear_bits(&mut self, biti: usize, mask: Attr) {
        if mask.contains(Attr::NO_SCAN) && self.no_scan.n_bits() > 0 {
            self.no_scan.clear(biti);
        }
        if mask.contains(Attr::APPENDABLE) && self.appendable.n_bits() > 0 {
            self.appendable.clear(biti);
        }
        if mask.contains(Attr::FINALIZE) {
            if let Some(finals) = &mut self.finals {
                if finals.n_bits() > 0 {
                    finals.clear(biti);
                }
            }
        }
        if mask.contains(Attr::STRUCT_FINAL) {
            if let Some(sf) = &mut self.struct_finals {
                if sf.n_bits() > 0 {
                    sf.clear(biti);
                }
            }
        }
        if mask.contains(Attr::NO_INTERIOR) && self.is_large_object {
            if let Some(ni) = &mut self.no_interior {
                if ni.n_bits() > 0 {
                    ni.clear(biti);
                }
            }
        }
    }

    /// Clears *all* attribute bits at `biti`, used when a large-object run
    /// is finalized and reclaimed in one step.
    pub(crate) fn clear_all_bits(&mut self, biti: usize) {
        self.clear_bits(biti, Attr::all());
    }

    /// Small pools only: for every bit set in `to_free` (a bitmap covering
    /// one page's worth of 16-byte slots), set the corresponding `free_bits`
    /// bit and clear `no_scan`/`appendable`/`finals`/`struct_finals`.
    ///
    /// Bulk, word-parallel: `to_free` and `free_bits` share the same bit
    /// stride, so whole words can be OR'd together instead of testing one
    /// bit at a time.
    pub fn free_page_bits(&mut self, page_num: usize, to_free: &BitVector) {
        assert!(!self.is_large_object, "free_page_bits is a small-pool operation");
        let bits_per_page = PAGE_SIZE >> self.shift;
        let base_bit = page_num * bits_per_page;
        let words_per_page = (bits_per_page + usize::BITS as usize - 1) / (usize::BITS as usize);
        let base_word = base_bit / usize::BITS as usize;

        for w in 0..words_per_page {
            let free_word = to_free.word(w);
            if free_word == 0 {
                continue;
            }
            let word_idx = base_word + w;
            let cur = self.free_bits.word(word_idx);
            self.free_bits.set_word(word_idx, cur | free_word);

            self.no_scan.set_word(word_idx, self.no_scan.word(word_idx) & !free_word);
            self.appendable.set_word(word_idx, self.appendable.word(word_idx) & !free_word);
            if let Some(finals) = &mut self.finals {
                if finals.n_bits() > 0 {
                    finals.set_word(word_idx, finals.word(word_idx) & !free_word);
                }
            }
            if let Some(sf) = &mut self.struct_finals {
                if sf.n_bits() > 0 {
                    sf.set_word(word_idx, sf.word(word_idx) & !free_word);
                }
            }
        }
    }

    pub(crate) fn biti_of(&self, addr: usize) -> usize {
        let base = self.base.expect("pool destroyed").as_ptr() as usize;
        self.biti_for_offset(addr - base)
    }

    pub(crate) fn ledger_record_alloc(&mut self, addr: usize) {
        if let Some(l) = &mut self.ledger {
            l.record_alloc(addr);
        }
    }

    pub(crate) fn ledger_record_free(&mut self, addr: usize) {
        if let Some(l) = &mut self.ledger {
            l.record_free(addr);
        }
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        if self.base.is_some() {
            self.destroy();
        }
    }
}
