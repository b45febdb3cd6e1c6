//! Property tests for `BitVector` over random sequences of set/clear/test,
//! checked against a plain `Vec<bool>` reference model.

use heapcore::BitVector;
use proptest::prelude::*;

proptest! {
    #[test]
    fn set_then_test_is_always_true(n_bits in 1usize..2048, idx in 0usize..2048) {
        prop_assume!(idx < n_bits);
        let mut bv = BitVector::allocate(n_bits);
        bv.set(idx);
        prop_assert!(bv.test(idx));
    }

    #[test]
    fn clear_then_test_is_always_false(n_bits in 1usize..2048, idx in 0usize..2048) {
        prop_assume!(idx < n_bits);
        let mut bv = BitVector::allocate(n_bits);
        bv.set(idx);
        bv.clear(idx);
        prop_assert!(!bv.test(idx));
    }

    #[test]
    fn set_is_idempotent_under_repetition(n_bits in 1usize..256, idx in 0usize..256, reps in 1usize..5) {
        prop_assume!(idx < n_bits);
        let mut bv = BitVector::allocate(n_bits);
        for _ in 0..reps {
            bv.set(idx);
        }
        prop_assert!(bv.test(idx));
    }

    #[test]
    fn random_sequence_of_set_clear_matches_a_reference_bool_vec(
        n_bits in 1usize..512,
        ops in proptest::collection::vec((0usize..512, any::<bool>()), 0..200)
    ) {
        let mut bv = BitVector::allocate(n_bits);
        let mut reference = vec![false; n_bits];
        for (idx, set_it) in ops {
            if idx >= n_bits {
                continue;
            }
            if set_it {
                bv.set(idx);
                reference[idx] = true;
            } else {
                bv.clear(idx);
                reference[idx] = false;
            }
        }
        for i in 0..n_bits {
            prop_assert_eq!(bv.test(i), reference[i], "mismatch at bit {}", i);
        }
    }
}
