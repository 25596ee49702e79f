//! Single-word Bloom filters used to skip chunks, pages, and WAL files
//! that cannot contain a queried id or flag.
//!
//! The filter is one `u64`; adding a value ORs in two hash-derived bits.
//! False positives are possible, false negatives are not, and filters
//! compose by bitwise OR (a page filter is the union of its chunks').

use std::hash::{Hash, Hasher};

/// Empty filter: matches nothing.
#[inline]
pub fn empty() -> u64 {
    0
}

/// Adds a value to the filter.
#[inline]
pub fn add<T: Hash>(filter: u64, value: &T) -> u64 {
    filter | mask_for(value)
}

/// Membership test. `true` means "possibly present".
#[inline]
pub fn check<T: Hash>(filter: u64, value: &T) -> bool {
    let m = mask_for(value);
    filter & m == m
}

/// Union of two filters.
#[inline]
pub fn union(a: u64, b: u64) -> u64 {
    a | b
}

fn mask_for<T: Hash>(value: &T) -> u64 {
    let mut h = std::collections::hash_map::DefaultHasher::new();
    value.hash(&mut h);
    let raw = h.finish();
    // Two independent 6-bit positions from one 64-bit hash.
    let bit_a = raw & 0x3f;
    let bit_b = (raw >> 6) & 0x3f;
    (1u64 << bit_a) | (1u64 << bit_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_false_negatives() {
        let mut f = empty();
        for id in 0u64..500 {
            f = add(f, &id);
        }
        for id in 0u64..500 {
            assert!(check(f, &id), "id {} missing from filter", id);
        }
    }

    #[test]
    fn empty_matches_nothing() {
        assert!(!check(empty(), &7u64));
    }

    #[test]
    fn union_covers_both_sides() {
        let a = add(empty(), &1u64);
        let b = add(empty(), &2u64);
        let u = union(a, b);
        assert!(check(u, &1u64));
        assert!(check(u, &2u64));
    }

    #[test]
    fn sparse_filter_rejects_most_strangers() {
        let f = add(add(empty(), &10u64), &11u64);
        let rejected = (1000u64..2000).filter(|id| !check(f, id)).count();
        // With 4 bits set out of 64 the miss rate must be high.
        assert!(rejected > 900, "only {} of 1000 rejected", rejected);
    }
}
