//! Property-based tests for stagemem
//!
//! These tests verify invariants that must hold for all inputs:
//! - Listing order is a total order
//! - Importance always stays within [0, 1]
//! - Scheduler passes never skip a stage
//! - Entries survive a to_dict/from_dict round trip
//!
//! Run with: cargo test --test property_tests

use std::cmp::Ordering;
use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use proptest::prelude::*;
use serde_json::json;

use stagemem::config::SchedulerConfig;
use stagemem::events::NullSink;
use stagemem::memory::listing_order;
use stagemem::{MemoryEntry, MemoryStore, Stage, StageScheduler};

fn arb_entry() -> impl Strategy<Value = MemoryEntry> {
    (
        "[a-z][a-z0-9]{0,6}",
        0.0f32..=1.0,
        0u64..40,
        proptest::option::of(0i64..10_000),
        0i64..10_000,
    )
        .prop_map(|(id, importance, access_count, accessed, created)| {
            let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
            let mut entry = MemoryEntry::with_id(id, json!(null))
                .importance(importance)
                .created_at(base + Duration::seconds(created));
            entry.access_count = access_count;
            entry.last_accessed_at = accessed.map(|s| base + Duration::seconds(s));
            entry
        })
}

// ============================================================================
// LISTING ORDER
// ============================================================================

mod ordering_tests {
    use super::*;

    proptest! {
        /// Invariant: comparing in both directions gives opposite answers
        #[test]
        fn antisymmetric(a in arb_entry(), b in arb_entry()) {
            prop_assert_eq!(listing_order(&a, &b), listing_order(&b, &a).reverse());
        }

        /// Invariant: entries with distinct ids never compare equal
        #[test]
        fn total_for_distinct_ids(a in arb_entry(), b in arb_entry()) {
            if a.id != b.id {
                prop_assert_ne!(listing_order(&a, &b), Ordering::Equal);
            }
        }

        /// Invariant: ordering is transitive
        #[test]
        fn transitive(a in arb_entry(), b in arb_entry(), c in arb_entry()) {
            if listing_order(&a, &b) != Ordering::Greater
                && listing_order(&b, &c) != Ordering::Greater
            {
                prop_assert_ne!(listing_order(&a, &c), Ordering::Greater);
            }
        }

        /// Invariant: a stage listing is sorted by descending importance
        #[test]
        fn listing_sorted_by_importance(entries in prop::collection::vec(arb_entry(), 0..20)) {
            let store = MemoryStore::new();
            for entry in entries {
                let _ = store.put(entry);
            }
            let listed = store.list_by_stage(Stage::Working);
            prop_assert_eq!(listed.len(), store.len());
            for pair in listed.windows(2) {
                prop_assert!(pair[0].importance >= pair[1].importance);
            }
        }
    }
}

// ============================================================================
// IMPORTANCE BOUNDS
// ============================================================================

mod importance_tests {
    use super::*;

    proptest! {
        /// Invariant: any sequence of updates keeps importance within [0, 1]
        #[test]
        fn stays_in_unit_interval(
            initial in -2.0f32..3.0,
            deltas in prop::collection::vec(-2.0f32..2.0, 0..20),
        ) {
            let store = MemoryStore::new();
            store.put(MemoryEntry::with_id("e", json!(1)).importance(initial)).unwrap();
            prop_assert!((0.0..=1.0).contains(&store.peek("e").unwrap().importance));
            for delta in deltas {
                let value = store.update_importance("e", delta).unwrap();
                prop_assert!((0.0..=1.0).contains(&value));
            }
        }
    }
}

// ============================================================================
// STAGE TRANSITIONS
// ============================================================================

mod stage_tests {
    use super::*;

    proptest! {
        /// Invariant: one pass moves an entry by at most one stage, and
        /// forward moves always go working -> short_term -> long_term
        #[test]
        fn passes_never_skip_stages(
            reads in prop::collection::vec(0u64..25, 1..12),
            importances in prop::collection::vec(0.0f32..=1.0, 1..12),
            passes in 1usize..5,
            hours in prop::collection::vec(0i64..2000, 1..5),
        ) {
            let store = Arc::new(MemoryStore::new());
            let scheduler = StageScheduler::new(
                store.clone(),
                SchedulerConfig::default(),
                Arc::new(NullSink),
            );
            for (i, importance) in importances.iter().enumerate() {
                let id = format!("e{}", i);
                store.put(MemoryEntry::with_id(id.clone(), json!(i)).importance(*importance)).unwrap();
                for _ in 0..reads[i % reads.len()] {
                    store.get(&id).unwrap();
                }
            }

            let mut clock = Utc::now();
            for pass in 0..passes {
                let before: Vec<(String, Stage)> =
                    store.snapshot().into_iter().map(|e| (e.id, e.stage)).collect();
                clock += Duration::hours(hours[pass % hours.len()]);
                let report = scheduler.run_pass_at(clock);

                for (id, stage) in before {
                    match store.peek(&id) {
                        Ok(after) => {
                            let distance = (after.stage as i32 - stage as i32).abs();
                            prop_assert!(distance <= 1, "{} moved {:?} -> {:?}", id, stage, after.stage);
                        }
                        Err(_) => {
                            prop_assert_eq!(stage, Stage::LongTerm);
                            prop_assert!(report.evicted.contains(&id));
                        }
                    }
                }
            }
        }

        /// Invariant: evicting twice is the same as evicting once
        #[test]
        fn evict_idempotent(id in "[a-z]{1,8}") {
            let store = MemoryStore::new();
            store.put(MemoryEntry::with_id(id.clone(), json!(null))).unwrap();
            prop_assert!(store.evict(&id));
            prop_assert!(!store.evict(&id));
            prop_assert!(store.get(&id).is_err());
        }
    }
}

// ============================================================================
// PERSISTENCE
// ============================================================================

mod dict_tests {
    use super::*;

    proptest! {
        /// Invariant: from_dict(to_dict(e)) == e
        #[test]
        fn round_trip(
            entry in arb_entry(),
            stage in prop::sample::select(Stage::all().to_vec()),
            note in "\\PC{0,40}",
        ) {
            let mut entry = entry.meta("note", json!(note));
            entry.stage = stage;
            let restored = MemoryEntry::from_dict(entry.to_dict().unwrap()).unwrap();
            prop_assert_eq!(restored, entry);
        }
    }
}
