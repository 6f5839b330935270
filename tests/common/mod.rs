//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

pub mod builders;

use std::collections::BTreeMap;
use std::time::Duration;

/// Upper bound for joins that are expected to finish promptly
pub fn test_timeout() -> Duration {
    Duration::from_secs(5)
}

/// Count occurrences of each value, for order-insensitive comparisons
pub fn multiset<T: Ord + Clone>(items: &[T]) -> BTreeMap<T, usize> {
    let mut counts = BTreeMap::new();
    for item in items {
        *counts.entry(item.clone()).or_insert(0) += 1;
    }
    counts
}

/// Assert two sequences hold the same items regardless of order
pub fn assert_same_items<T: Ord + Clone + std::fmt::Debug>(actual: &[T], expected: &[T]) {
    assert_eq!(
        multiset(actual),
        multiset(expected),
        "Expected {:?} to contain the same items as {:?}",
        actual,
        expected
    );
}
