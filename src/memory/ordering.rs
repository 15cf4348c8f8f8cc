//! Total order used for stage listings and scheduler passes

use std::cmp::Ordering;

use crate::types::MemoryEntry;

/// Descending importance, then most recent access (never-read last), then
/// earlier creation, then smaller id.
pub fn listing_order(a: &MemoryEntry, b: &MemoryEntry) -> Ordering {
    b.importance
        .total_cmp(&a.importance)
        .then_with(|| match (a.last_accessed_at, b.last_accessed_at) {
            (Some(x), Some(y)) => y.cmp(&x),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}
