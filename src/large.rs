//! Pool view specialized for multi-page (whole-page) allocations.
//!
//! `search_start`/`largest_free` bookkeeping generalizes a "find one free
//! page starting from a low-water mark" scan into "find a run of `n`
//! contiguous free pages", with an O(1) run-skip via `b_page_offsets` so a
//! failed fit doesn't re-walk pages already known to belong to a shorter
//! run.

use crate::attr::Segment;
use crate::pool::{PageTag, Pool, PAGE_SIZE};
use crate::runtime::Runtime;

/// Borrowed view of a `Pool` known to be configured `is_large_object = true`.
pub struct LargeObjectPool<'a> {
    pool: &'a mut Pool,
}

impl<'a> LargeObjectPool<'a> {
    /// Wrap a large `Pool`. Panics if `pool.is_large_object()` is false.
    pub fn new(pool: &'a mut Pool) -> Self {
        assert!(pool.is_large_object(), "LargeObjectPool requires a pool created with is_large_object = true");
        LargeObjectPool { pool }
    }

    pub fn pool(&self) -> &Pool {
        self.pool
    }

    /// Step `search_start` forward past whatever run it currently sits
    /// inside, so it names a `B_FREE` page or `npages` (past-the-end).
    fn normalize_search_start(&mut self) {
        let npages = self.pool.npages;
        if self.pool.search_start >= npages {
            return;
        }
        if self.pool.page_table[self.pool.search_start] == PageTag::BPagePlus {
            self.pool.search_start -= self.pool.b_page_offsets[self.pool.search_start];
        }
        while self.pool.search_start < npages && self.pool.page_table[self.pool.search_start] == PageTag::BPage {
            self.pool.search_start += self.pool.b_page_offsets[self.pool.search_start];
        }
    }

    /// Find the lowest page index `i` such that pages `[i, i+n)` are all
    /// `B_FREE`. Does not itself mark the run; the caller must do that and
    /// then call [`LargeObjectPool::update_offsets`].
    pub fn alloc_pages(&mut self, n: usize) -> Option<usize> {
        assert!(n >= 1);
        if self.pool.largest_free < n || self.pool.search_start + n > self.pool.npages {
            return None;
        }
        self.normalize_search_start();

        let npages = self.pool.npages;
        let mut largest = 0usize;
        let mut i = self.pool.search_start;
        while i < npages {
            match self.pool.page_table[i] {
                PageTag::BFree => {
                    let start = i;
                    let mut run = 0usize;
                    while i < npages && self.pool.page_table[i] == PageTag::BFree {
                        run += 1;
                        i += 1;
                        if run == n {
                            return Some(start);
                        }
                    }
                    if run > largest {
                        largest = run;
                    }
                }
                PageTag::BPage => {
                    // Skip the entire run in O(1).
                    i += self.pool.b_page_offsets[i];
                }
                _ => {
                    // BPagePlus / small-bin tags should not appear in a large
                    // pool's page table at scan entry points, but advance by
                    // one rather than loop forever if they do.
                    i += 1;
                }
            }
        }
        self.pool.largest_free = largest;
        None
    }

    /// Walk forward from a freshly marked run's start `p`, assigning each
    /// `B_PAGEPLUS` its distance back to `p`, and record the run length at
    /// `p` itself. Must be called immediately after marking
    /// `page_table[p] = B_PAGE`, `page_table[p+1..p+n] = B_PAGEPLUS`.
    pub fn update_offsets(&mut self, p: usize) {
        assert_eq!(self.pool.page_table[p], PageTag::BPage);
        let npages = self.pool.npages;
        let mut k = 1usize;
        while p + k < npages && self.pool.page_table[p + k] == PageTag::BPagePlus {
            self.pool.b_page_offsets[p + k] = k;
            k += 1;
        }
        self.pool.b_page_offsets[p] = k;
        log::debug!(target: "heapcore::pool", "large run at page {} length {}", p, k);
    }

    /// Reserve and mark a run of `n` pages in one step: finds a fit, tags
    /// the pages, and fixes up `b_page_offsets`. Returns the base address of
    /// the run, or `None` if no fit exists.
    pub fn alloc_and_mark(&mut self, n: usize) -> Option<*mut u8> {
        let p = self.alloc_pages(n)?;
        self.pool.page_table[p] = PageTag::BPage;
        for k in 1..n {
            self.pool.page_table[p + k] = PageTag::BPagePlus;
        }
        self.pool.free_pages -= n;
        if p == self.pool.search_start {
            self.pool.search_start = p + n;
        }
        self.update_offsets(p);
        let base = self.pool.base.expect("pool destroyed").as_ptr() as usize;
        Some((base + p * PAGE_SIZE) as *mut u8)
    }

    /// Restore `[page_num, page_num + count)` to `B_FREE`, updating
    /// `free_pages`, `search_start`, and invalidating `largest_free`.
    pub fn free_pages(&mut self, page_num: usize, count: usize) {
        for pn in page_num..page_num + count {
            if self.pool.page_table[pn] != PageTag::BFree {
                self.pool.free_pages += 1;
            }
            self.pool.page_table[pn] = PageTag::BFree;
        }
        if page_num < self.pool.search_start {
            self.pool.search_start = page_num;
        }
        self.pool.largest_free = self.pool.free_pages;
        log::debug!(target: "heapcore::pool", "freed pages [{}, {}) ", page_num, page_num + count);
    }

    /// Precondition: `p` lies in the pool and points to a `B_PAGE` start.
    pub fn get_size(&self, p: usize) -> usize {
        let pn = self.pool.page_of(p);
        assert_eq!(self.pool.page_table[pn], PageTag::BPage);
        self.pool.b_page_offsets[pn] * PAGE_SIZE
    }

    /// Resolve a (possibly interior) pointer to its enclosing large
    /// allocation. Returns the empty descriptor if `p`'s page is not part of
    /// a large run.
    pub fn get_info(&self, p: usize) -> crate::attr::BlkInfo {
        use crate::attr::BlkInfo;
        let mut pn = self.pool.page_of(p);
        match self.pool.page_table[pn] {
            PageTag::BPagePlus => {
                pn -= self.pool.b_page_offsets[pn];
            }
            PageTag::BPage => {}
            _ => return BlkInfo::none(),
        }
        if self.pool.page_table[pn] != PageTag::BPage {
            return BlkInfo::none();
        }
        let base = self.pool.base.expect("pool destroyed").as_ptr() as usize;
        let alloc_base = base + pn * PAGE_SIZE;
        BlkInfo {
            base: std::ptr::NonNull::new(alloc_base as *mut u8),
            size: self.pool.b_page_offsets[pn] * PAGE_SIZE,
            attr: self.pool.get_bits(pn),
        }
    }

    /// Walk every page; for each `B_PAGE` start whose `finals` bit is set,
    /// ask the runtime whether it has a finalizer in `segment`, and if so
    /// finalize and reclaim the whole run.
    pub fn run_finalizers<R: Runtime>(&mut self, segment: Segment, runtime: &mut R) {
        let npages = self.pool.npages;
        let base = self.pool.base.expect("pool destroyed").as_ptr() as usize;
        let mut pn = 0usize;
        while pn < npages {
            if self.pool.page_table[pn] == PageTag::BPage {
                let has_finals = self.pool.finals.as_ref().map_or(false, |f| f.n_bits() > 0 && f.test(pn));
                if has_finals {
                    let size = self.pool.b_page_offsets[pn] * PAGE_SIZE;
                    let addr = (base + pn * PAGE_SIZE) as *const u8;
                    let attr = self.pool.get_bits(pn);
                    if runtime.has_finalizer_in_segment(addr, size, attr, segment) {
                        runtime.finalize_from_gc(addr, size, attr);
                        self.pool.clear_all_bits(pn);
                        if pn < self.pool.search_start {
                            self.pool.search_start = pn;
                        }
                        let run_len = self.pool.b_page_offsets[pn];
                        self.free_pages(pn, run_len);
                        pn += run_len;
                        continue;
                    }
                }
            }
            pn += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::Pool;
    use crate::runtime::recording::RecordingRuntime;

    #[test]
    fn alloc_three_pages_spanning_run() {
        let mut pool = Pool::initialize(8, true).unwrap();
        let mut large = LargeObjectPool::new(&mut pool);
        let p = large.alloc_pages(3).unwrap();
        assert_eq!(p, 0);
        large.pool.page_table[0] = PageTag::BPage;
        large.pool.page_table[1] = PageTag::BPagePlus;
        large.pool.page_table[2] = PageTag::BPagePlus;
        large.update_offsets(0);
        assert_eq!(large.pool.b_page_offsets[0], 3);
        assert_eq!(large.pool.b_page_offsets[1], 1);
        assert_eq!(large.pool.b_page_offsets[2], 2);

        let base = large.pool.base().unwrap().as_ptr() as usize;
        assert_eq!(large.get_size(base), 3 * PAGE_SIZE);

        large.pool.free_pages -= 3;
        large.free_pages(0, 3);
        assert_eq!(large.pool.free_pages(), 8);
        assert!(large.pool.page_table().iter().all(|&t| t == PageTag::BFree));
    }

    #[test]
    fn alloc_and_mark_convenience_wrapper() {
        let mut pool = Pool::initialize(8, true).unwrap();
        let mut large = LargeObjectPool::new(&mut pool);
        let ptr = large.alloc_and_mark(3).unwrap();
        assert_eq!(large.get_size(ptr as usize), 3 * PAGE_SIZE);
        assert_eq!(large.pool.free_pages(), 5);
        assert_eq!(large.pool.search_start, 3);
    }

    #[test]
    fn fragmentation_finds_middle_run_before_tail() {
        let mut pool = Pool::initialize(8, true).unwrap();
        let mut large = LargeObjectPool::new(&mut pool);
        let a = large.alloc_and_mark(2).unwrap() as usize; // pages [0,2)
        let b = large.alloc_and_mark(3).unwrap() as usize; // pages [2,5)
        let _c = large.alloc_and_mark(1).unwrap() as usize; // pages [5,6)
        let base = large.pool.base().unwrap().as_ptr() as usize;
        assert_eq!(a, base);
        assert_eq!(b, base + 2 * PAGE_SIZE);

        let b_pn = large.pool.page_of(b);
        let run_len = large.pool.b_page_offsets[b_pn];
        large.free_pages(b_pn, run_len);

        let found = large.alloc_pages(2).unwrap();
        assert_eq!(found, 2, "must reuse the freed middle run, not scan past it");
    }

    #[test]
    fn largest_free_tightens_on_miss_and_shortcuts_next_alloc() {
        let mut pool = Pool::initialize(8, true).unwrap();
        let mut large = LargeObjectPool::new(&mut pool);
        // Occupy [0,3) and [3,5), then free the middle run to fragment the
        // pool into free runs of length 2 (pages 3-4) and length 1 (page 7).
        large.alloc_and_mark(3).unwrap(); // [0,3)
        let mid = large.alloc_and_mark(2).unwrap() as usize; // [3,5)
        large.alloc_and_mark(2).unwrap(); // [5,7)
        let mid_pn = large.pool.page_of(mid);
        large.free_pages(mid_pn, 2); // frees [3,5); page 7 is still free from the start

        // No run of 3 exists (longest contiguous free run is 2), so the scan
        // must exhaust the pool and tighten largest_free down to that bound.
        assert!(large.alloc_pages(3).is_none());
        assert_eq!(large.pool.largest_free, 2);

        // A request larger than the tightened bound must short-circuit
        // without scanning.
        assert!(large.alloc_pages(3).is_none());
    }

    #[test]
    fn run_finalizers_reclaims_marked_run() {
        let mut pool = Pool::initialize(8, true).unwrap();
        let mut large = LargeObjectPool::new(&mut pool);
        let ptr = large.alloc_and_mark(3).unwrap();
        let pn = large.pool.page_of(ptr as usize);
        large.pool.set_bits(pn, crate::attr::Attr::FINALIZE);

        let mut rt = RecordingRuntime::new();
        rt.mark_finalizable(ptr as usize);
        large.run_finalizers(Segment(0), &mut rt);

        assert_eq!(rt.finalized.borrow().len(), 1);
        assert_eq!(large.pool.free_pages(), 8);
    }
}
