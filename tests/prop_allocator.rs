//! Property tests for the spare allocator: across any sequence of reserved
//! sectors and allocations, no sector is ever handed out twice and no
//! reserved sector is ever handed out at all.

use std::collections::HashSet;

use proptest::prelude::*;

use blockremap::allocator::SpareAllocator;
use blockremap::error::AllocError;

proptest! {
    #[test]
    fn allocations_are_unique_and_avoid_reserved(
        total in 8u64..200,
        reserved_fraction in 0u64..4,
        alloc_attempts in 1usize..400,
    ) {
        let alloc = SpareAllocator::new(total);
        let reserved: HashSet<u64> = (0..total).filter(|s| reserved_fraction != 0 && s % reserved_fraction == 0).collect();
        for &sec in &reserved {
            alloc.reserve(sec);
        }

        let mut seen = HashSet::new();
        for _ in 0..alloc_attempts {
            match alloc.alloc() {
                Ok(sec) => {
                    prop_assert!(!reserved.contains(&sec), "allocator returned a reserved sector");
                    prop_assert!(seen.insert(sec), "allocator returned sector {sec} twice");
                }
                Err(AllocError::Exhausted) => break,
            }
        }
    }

    #[test]
    fn mark_allocated_sectors_are_never_reissued(
        total in 8u64..100,
        preallocated in prop::collection::hash_set(0u64..100, 0..20),
    ) {
        let preallocated: HashSet<u64> = preallocated.into_iter().filter(|&s| s < total).collect();
        let alloc = SpareAllocator::new(total);
        for &sec in &preallocated {
            alloc.mark_allocated(sec);
        }

        for _ in 0..(total as usize) {
            match alloc.alloc() {
                Ok(sec) => prop_assert!(!preallocated.contains(&sec)),
                Err(AllocError::Exhausted) => break,
            }
        }
    }
}
