//! Stage scheduler: promotion, demotion and eviction passes
//!
//! A pass walks every entry once, in listing order, and applies at most one
//! transition per entry:
//! - working → short_term when reads or importance cross their thresholds
//! - short_term → long_term when reads cross the higher threshold, otherwise
//!   short_term → working after `short_term_ttl` of idleness
//! - long_term entries idle past `long_term_ttl` with low importance are evicted
//!
//! A TTL demotion stamps `demoted_at` into the entry metadata. The entry stays
//! in working until it is touched again after that instant.
//!
//! Decisions depend only on entry state, configuration and the pass clock.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::background::{spawn_periodic, BackgroundHandle};
use crate::config::SchedulerConfig;
use crate::error::{Result, StageMemError};
use crate::events::{CoreEvent, SharedSink};
use crate::memory::{listing_order, step, Direction, MemoryStore};
use crate::types::{EntryId, MemoryEntry, Stage};

/// Metadata key recording the last short_term → working demotion
pub const DEMOTED_AT_KEY: &str = "demoted_at";

/// What a pass decided for one entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Stay,
    Promote,
    Demote,
    Evict,
}

/// Outcome of one scheduler pass
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PassReport {
    /// Entries examined
    pub examined: usize,
    /// (id, new stage)
    pub promoted: Vec<(EntryId, Stage)>,
    /// (id, new stage)
    pub demoted: Vec<(EntryId, Stage)>,
    pub evicted: Vec<EntryId>,
    pub ran_at: Option<DateTime<Utc>>,
}

impl PassReport {
    pub fn changed(&self) -> usize {
        self.promoted.len() + self.demoted.len() + self.evicted.len()
    }
}

/// Applies stage rules to the memory store
pub struct StageScheduler {
    store: Arc<MemoryStore>,
    config: SchedulerConfig,
    sink: SharedSink,
}

impl StageScheduler {
    pub fn new(store: Arc<MemoryStore>, config: SchedulerConfig, sink: SharedSink) -> Self {
        Self {
            store,
            config,
            sink,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Decide the transition for a single entry at `now`
    pub fn evaluate(&self, entry: &MemoryEntry, now: DateTime<Utc>) -> Decision {
        let idle = now - entry.last_touched();
        match entry.stage {
            Stage::Working => {
                if untouched_since_demotion(entry) {
                    Decision::Stay
                } else if entry.access_count >= self.config.access_threshold
                    || entry.importance >= self.config.importance_threshold
                {
                    Decision::Promote
                } else {
                    Decision::Stay
                }
            }
            Stage::ShortTerm => {
                if entry.access_count >= self.config.long_term_access_threshold {
                    Decision::Promote
                } else if idle > self.config.short_term_ttl() {
                    Decision::Demote
                } else {
                    Decision::Stay
                }
            }
            Stage::LongTerm => {
                if idle > self.config.long_term_ttl()
                    && entry.importance < self.config.eviction_importance_cutoff
                {
                    Decision::Evict
                } else {
                    Decision::Stay
                }
            }
        }
    }

    /// Run one pass using the current time
    pub fn run_pass(&self) -> PassReport {
        self.run_pass_at(Utc::now())
    }

    /// Run one pass as if the clock read `now`
    pub fn run_pass_at(&self, now: DateTime<Utc>) -> PassReport {
        let (report, events) = self.store.with_entries_mut(|entries| {
            let mut ordered: Vec<&MemoryEntry> = entries.values().collect();
            ordered.sort_by(|a, b| listing_order(a, b));
            let plan: Vec<(EntryId, Stage, Decision)> = ordered
                .into_iter()
                .map(|e| (e.id.clone(), e.stage, self.evaluate(e, now)))
                .collect();

            let mut report = PassReport {
                examined: plan.len(),
                ran_at: Some(now),
                ..Default::default()
            };
            let mut events = Vec::new();

            for (id, from, decision) in plan {
                match decision {
                    Decision::Stay => {}
                    Decision::Promote => {
                        if let Ok(to) = step(entries, &id, Direction::Forward) {
                            events.push(CoreEvent::entry_promoted(&id, from, to));
                            report.promoted.push((id, to));
                        }
                    }
                    Decision::Demote => {
                        if let Ok(to) = step(entries, &id, Direction::Backward) {
                            if let Some(entry) = entries.get_mut(&id) {
                                entry.metadata.insert(
                                    DEMOTED_AT_KEY.to_string(),
                                    serde_json::Value::String(now.to_rfc3339()),
                                );
                            }
                            events.push(CoreEvent::entry_demoted(&id, from, to));
                            report.demoted.push((id, to));
                        }
                    }
                    Decision::Evict => {
                        if entries.remove(&id).is_some() {
                            events.push(CoreEvent::entry_evicted(&id, from));
                            report.evicted.push(id);
                        }
                    }
                }
            }
            (report, events)
        });

        for event in events {
            self.sink.emit(event);
        }

        if report.changed() > 0 {
            tracing::info!(
                examined = report.examined,
                promoted = report.promoted.len(),
                demoted = report.demoted.len(),
                evicted = report.evicted.len(),
                "Stage pass applied transitions"
            );
        } else {
            tracing::debug!(examined = report.examined, "Stage pass: no transitions");
        }

        report
    }

    /// Read an entry as a reinforcement event
    pub fn reinforce(&self, id: &str) -> Result<MemoryEntry> {
        self.reinforce_at(id, Utc::now())
    }

    /// Record a read of `id` at `now`. A long_term entry that had been idle
    /// beyond the staleness threshold drops back to short_term.
    pub fn reinforce_at(&self, id: &str, now: DateTime<Utc>) -> Result<MemoryEntry> {
        let staleness = self.config.staleness_threshold();
        let (entry, demoted) = self.store.with_entries_mut(|entries| {
            let entry = entries
                .get_mut(id)
                .ok_or_else(|| StageMemError::NotFound(id.to_string()))?;
            let stale = entry.stage == Stage::LongTerm && now - entry.last_touched() > staleness;
            entry.access_count = entry.access_count.saturating_add(1);
            entry.last_accessed_at = Some(now);
            if stale {
                entry.stage = Stage::ShortTerm;
            }
            Ok::<_, StageMemError>((entry.clone(), stale))
        })?;

        if demoted {
            tracing::debug!(entry_id = id, "Stale long_term entry demoted on access");
            self.sink
                .emit(CoreEvent::entry_demoted(id, Stage::LongTerm, Stage::ShortTerm));
        }
        Ok(entry)
    }

    /// Called after the orchestrator writes an entry
    pub fn on_write(&self) {
        if self.config.trigger_on_write {
            self.run_pass();
        }
    }

    /// Start the periodic pass loop. Returns `None` when no interval is configured.
    pub fn spawn(self: &Arc<Self>) -> Option<BackgroundHandle> {
        let period = self.config.interval()?;
        let scheduler = Arc::clone(self);
        Some(spawn_periodic("stage_scheduler", period, move || {
            let scheduler = Arc::clone(&scheduler);
            async move {
                scheduler.run_pass();
            }
        }))
    }
}

fn untouched_since_demotion(entry: &MemoryEntry) -> bool {
    entry
        .metadata
        .get(DEMOTED_AT_KEY)
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map_or(false, |at| entry.last_touched() <= at.with_timezone(&Utc))
}
