//! Result aggregation and de-duplication.
//!
//! Items are merged in the order they are offered: everything already in
//! `existing` stays ahead of anything new, and within a batch the batch's
//! own order is kept. The first item seen for a [`DedupKey`] wins; later
//! items with the same key are dropped.
//!
//! The engine offers batches in *dispatch* order, so the surviving item for a
//! shared key is deterministic regardless of which network call finished
//! first.

use std::collections::HashSet;

use crate::models::{DedupKey, EvidenceItem};

/// Merge `new_items` into `existing_items`, dropping duplicates.
pub fn merge(existing_items: Vec<EvidenceItem>, new_items: Vec<EvidenceItem>) -> Vec<EvidenceItem> {
    merge_batch(existing_items, new_items, true)
}

/// Merge one spec's batch. With `deduplicate == false` the batch is appended
/// as-is, but its keys still count as seen for later batches.
pub fn merge_batch(
    existing_items: Vec<EvidenceItem>,
    new_items: Vec<EvidenceItem>,
    deduplicate: bool,
) -> Vec<EvidenceItem> {
    let mut seen: HashSet<DedupKey> = existing_items.iter().map(|i| i.dedup_key()).collect();
    let mut merged = existing_items;
    merged.reserve(new_items.len());

    for item in new_items {
        let key = item.dedup_key();
        let fresh = seen.insert(key);
        if fresh || !deduplicate {
            merged.push(item);
        }
    }

    merged
}

/// Count of distinct keys in `items`.
pub fn distinct_count(items: &[EvidenceItem]) -> usize {
    items
        .iter()
        .map(|i| i.dedup_key())
        .collect::<HashSet<_>>()
        .len()
}
