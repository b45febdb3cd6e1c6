//! Property tests over random alloc/free sequences for `LargeObjectPool`:
//! free-page accounting, and the monotonic hint invariants on
//! `largest_free`/`search_start`.

use heapcore::large::LargeObjectPool;
use heapcore::pool::{PageTag, Pool, PAGE_SIZE};
use proptest::prelude::*;

const NPAGES: usize = 32;

#[derive(Debug, Clone, Copy)]
enum Op {
    Alloc(usize),
    FreeOldest,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1usize..=5).prop_map(Op::Alloc),
        Just(Op::FreeOldest),
    ]
}

/// Scan the page table directly (independent of `largest_free`) to get the
/// true longest run of `B_FREE` pages.
fn true_largest_free_run(pool: &Pool) -> usize {
    let mut best = 0;
    let mut run = 0;
    for tag in pool.page_table() {
        if *tag == PageTag::BFree {
            run += 1;
            best = best.max(run);
        } else {
            run = 0;
        }
    }
    best
}

fn true_lowest_free_page(pool: &Pool) -> Option<usize> {
    pool.page_table().iter().position(|&t| t == PageTag::BFree)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn invariants_hold_across_random_alloc_free_sequences(ops in proptest::collection::vec(op_strategy(), 0..60)) {
        let _ = env_logger::try_init();
        let mut pool = Pool::initialize(NPAGES, true).unwrap();
        let mut large = LargeObjectPool::new(&mut pool);
        let mut live: Vec<(usize, usize)> = Vec::new(); // (page_num, count)

        for op in ops {
            match op {
                Op::Alloc(n) => {
                    if let Some(ptr) = large.alloc_and_mark(n) {
                        let base = large.pool().base().unwrap().as_ptr() as usize;
                        let pn = (ptr as usize - base) / PAGE_SIZE;
                        live.push((pn, n));
                    }
                }
                Op::FreeOldest => {
                    if !live.is_empty() {
                        let (pn, n) = live.remove(0);
                        large.free_pages(pn, n);
                    }
                }
            }

            // free_pages == count(page_table == B_FREE)
            let counted_free = large.pool().page_table().iter().filter(|&&t| t == PageTag::BFree).count();
            prop_assert_eq!(large.pool().free_pages(), counted_free);

            // largest_free is never an under-estimate of the true largest run.
            let true_largest = true_largest_free_run(large.pool());
            prop_assert!(
                large.pool().largest_free() >= true_largest,
                "largest_free {} underestimates true largest run {}",
                large.pool().largest_free(),
                true_largest
            );

            // search_start never exceeds the index of the lowest free page.
            if let Some(lowest_free) = true_lowest_free_page(large.pool()) {
                prop_assert!(large.pool().search_start() <= lowest_free);
            }
        }
    }

    #[test]
    fn successful_alloc_reserves_a_previously_all_free_run(n in 1usize..=8) {
        let _ = env_logger::try_init();
        let mut pool = Pool::initialize(NPAGES, true).unwrap();
        let mut large = LargeObjectPool::new(&mut pool);
        // A fully free pool always has a fit for n <= NPAGES.
        let ptr = large.alloc_and_mark(n).expect("pool is empty, n <= NPAGES");
        prop_assert_eq!(large.get_size(ptr as usize), n * PAGE_SIZE);
    }
}
