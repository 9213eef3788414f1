//! Invariant checking framework for correctness verification
//!
//! Each invariant replays a completed event history and reports the first
//! point where the engine's answers contradict it.

use super::events::{Event, Observed, OperationResult, OperationType};
use super::history::EventLog;
use crate::models::{GcAction, Generation, SegmentId, Tier};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// A violation of an invariant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Violation {
    pub invariant: String,
    pub description: String,
    pub violating_events: Vec<usize>, // Indices into the completed events
    pub context: HashMap<String, String>,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "INVARIANT VIOLATION: {}", self.invariant)?;
        writeln!(f, "  Description: {}", self.description)?;
        writeln!(f, "  Violating events: {:?}", self.violating_events)?;
        if !self.context.is_empty() {
            writeln!(f, "  Context:")?;
            for (key, value) in &self.context {
                writeln!(f, "    {}: {}", key, value)?;
            }
        }
        Ok(())
    }
}

/// Trait for invariant checkers
pub trait Invariant: Send + Sync {
    fn name(&self) -> &str;

    /// Check the invariant against an event log
    fn check(&self, log: &EventLog) -> Result<(), Violation>;

    fn description(&self) -> &str {
        "No description provided"
    }
}

/// Check all invariants and return violations
pub fn check_all_invariants(log: &EventLog, invariants: &[Box<dyn Invariant>]) -> Vec<Violation> {
    invariants
        .iter()
        .filter_map(|invariant| invariant.check(log).err())
        .collect()
}

type Key = (String, SegmentId);

fn key(event: &Event, id: &SegmentId) -> Key {
    (event.project.clone(), id.clone())
}

/// Every segment state reported in an answer
fn observations(result: &OperationResult) -> Vec<&Observed> {
    match result {
        OperationResult::Ingested { segment, .. } | OperationResult::Touched { segment } => {
            vec![segment]
        }
        OperationResult::Analyzed { candidates, .. } => candidates.iter().collect(),
        OperationResult::Found { segments } => segments.iter().collect(),
        OperationResult::Retrieved { found, .. } => found.iter().collect(),
        OperationResult::Got {
            segment: Some(segment),
            ..
        } => vec![segment],
        _ => Vec::new(),
    }
}

fn violation(
    invariant: &str,
    description: String,
    idx: usize,
    event: &Event,
    segment_id: &SegmentId,
) -> Violation {
    let mut context = HashMap::new();
    context.insert("project".to_string(), event.project.clone());
    context.insert("segment_id".to_string(), segment_id.to_string());
    context.insert("event".to_string(), event.to_string());
    Violation {
        invariant: invariant.to_string(),
        description,
        violating_events: vec![idx],
        context,
    }
}

/// Tracks pin state from pin/unpin answers and reported flags
#[derive(Default)]
struct PinTracker {
    pinned: HashSet<Key>,
}

impl PinTracker {
    fn apply(&mut self, event: &Event, result: &OperationResult) {
        match (&event.op_type, result) {
            (OperationType::Pin { .. }, OperationResult::Batch { updated, .. }) => {
                for id in updated {
                    self.pinned.insert(key(event, id));
                }
            }
            (OperationType::Unpin { .. }, OperationResult::Batch { updated, .. }) => {
                for id in updated {
                    self.pinned.remove(&key(event, id));
                }
            }
            (_, OperationResult::Deleted { segment_id }) => {
                self.pinned.remove(&key(event, segment_id));
            }
            _ => {
                for seen in observations(result) {
                    if seen.pinned {
                        self.pinned.insert(key(event, &seen.segment_id));
                    } else {
                        self.pinned.remove(&key(event, &seen.segment_id));
                    }
                }
            }
        }
    }

    fn is_pinned(&self, event: &Event, id: &SegmentId) -> bool {
        self.pinned.contains(&key(event, id))
    }
}

/// Invariant: pinned segments are never spilled by the LRU or moved by GC
/// execution. Explicit stash may still move them.
pub struct PinnedNeverEvicted;

impl Invariant for PinnedNeverEvicted {
    fn name(&self) -> &str {
        "PinnedNeverEvicted"
    }

    fn description(&self) -> &str {
        "Pinned segments are never chosen by LRU eviction or gc_execute"
    }

    fn check(&self, log: &EventLog) -> Result<(), Violation> {
        let mut pins = PinTracker::default();
        for (idx, event) in log.completed_events().iter().enumerate() {
            let Some(result) = &event.result else { continue };
            let moved: &[SegmentId] = match result {
                OperationResult::Ingested { spilled, .. } => spilled,
                OperationResult::Executed { affected, .. } => affected,
                _ => &[],
            };
            if let Some(id) = moved.iter().find(|id| pins.is_pinned(event, id)) {
                return Err(violation(
                    self.name(),
                    format!("pinned segment {} was evicted", id),
                    idx,
                    event,
                    id,
                ));
            }
            pins.apply(event, result);
        }
        Ok(())
    }
}

/// Invariant: pinned segments are never scored by a GC pass
pub struct PinnedNeverCandidate;

impl Invariant for PinnedNeverCandidate {
    fn name(&self) -> &str {
        "PinnedNeverCandidate"
    }

    fn description(&self) -> &str {
        "gc_analyze never lists a pinned segment as a candidate"
    }

    fn check(&self, log: &EventLog) -> Result<(), Violation> {
        let mut pins = PinTracker::default();
        for (idx, event) in log.completed_events().iter().enumerate() {
            let Some(result) = &event.result else { continue };
            if let OperationResult::Analyzed { candidates, .. } = result {
                let bad = candidates
                    .iter()
                    .find(|c| c.pinned || pins.is_pinned(event, &c.segment_id));
                if let Some(candidate) = bad {
                    return Err(violation(
                        self.name(),
                        format!("pinned segment {} was a GC candidate", candidate.segment_id),
                        idx,
                        event,
                        &candidate.segment_id,
                    ));
                }
            }
            pins.apply(event, result);
        }
        Ok(())
    }
}

/// Invariant: survival counts never decrease and generation never regresses
pub struct SurvivalMonotonic;

impl Invariant for SurvivalMonotonic {
    fn name(&self) -> &str {
        "SurvivalMonotonic"
    }

    fn description(&self) -> &str {
        "gc_survival_count never decreases; generation never goes from old to young"
    }

    fn check(&self, log: &EventLog) -> Result<(), Violation> {
        let mut last: HashMap<Key, (u32, Generation)> = HashMap::new();
        for (idx, event) in log.completed_events().iter().enumerate() {
            let Some(result) = &event.result else { continue };
            if let OperationResult::Deleted { segment_id } = result {
                last.remove(&key(event, segment_id));
                continue;
            }
            for seen in observations(result) {
                let k = key(event, &seen.segment_id);
                if let Some(&(count, generation)) = last.get(&k) {
                    let regressed = seen.gc_survival_count < count
                        || (generation == Generation::Old && seen.generation == Generation::Young);
                    if regressed {
                        return Err(violation(
                            self.name(),
                            format!(
                                "segment {} went from ({}, {:?}) to ({}, {:?})",
                                seen.segment_id,
                                count,
                                generation,
                                seen.gc_survival_count,
                                seen.generation
                            ),
                            idx,
                            event,
                            &seen.segment_id,
                        ));
                    }
                }
                last.insert(k, (seen.gc_survival_count, seen.generation));
            }
        }
        Ok(())
    }
}

/// Invariant: with working-tier indexing off, search and non-moving
/// retrieve only ever return stashed segments.
pub struct NoIndexedWorkingSegment {
    pub working_tier_indexed: bool,
}

impl Invariant for NoIndexedWorkingSegment {
    fn name(&self) -> &str {
        "NoIndexedWorkingSegment"
    }

    fn description(&self) -> &str {
        "Keyword results never contain working-tier segments unless working-tier indexing is on"
    }

    fn check(&self, log: &EventLog) -> Result<(), Violation> {
        for (idx, event) in log.completed_events().iter().enumerate() {
            let found = match &event.result {
                Some(OperationResult::Found { segments }) if !self.working_tier_indexed => {
                    segments
                }
                // Retrieve only reads the archive regardless of the setting
                Some(OperationResult::Retrieved { found, moved: None }) => found,
                _ => continue,
            };
            if let Some(seen) = found.iter().find(|s| s.tier == Tier::Working) {
                return Err(violation(
                    self.name(),
                    format!("working segment {} was returned from the index", seen.segment_id),
                    idx,
                    event,
                    &seen.segment_id,
                ));
            }
        }
        Ok(())
    }
}

/// Invariant: once deleted, a segment is never returned again
pub struct DeletedNeverReturned;

impl Invariant for DeletedNeverReturned {
    fn name(&self) -> &str {
        "DeletedNeverReturned"
    }

    fn description(&self) -> &str {
        "Deleted segments never reappear in get, search or retrieve"
    }

    fn check(&self, log: &EventLog) -> Result<(), Violation> {
        let mut deleted: HashSet<Key> = HashSet::new();
        for (idx, event) in log.completed_events().iter().enumerate() {
            let Some(result) = &event.result else { continue };
            if let Some(seen) = observations(result)
                .into_iter()
                .find(|s| deleted.contains(&key(event, &s.segment_id)))
            {
                return Err(violation(
                    self.name(),
                    format!("segment {} was returned after deletion", seen.segment_id),
                    idx,
                    event,
                    &seen.segment_id,
                ));
            }
            match (&event.op_type, result) {
                (_, OperationResult::Deleted { segment_id }) => {
                    deleted.insert(key(event, segment_id));
                }
                (
                    OperationType::GcExecute {
                        action: GcAction::Delete,
                        ..
                    },
                    OperationResult::Executed { affected, .. },
                ) => {
                    for id in affected {
                        deleted.insert(key(event, id));
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Invariants that hold for the default configuration
pub fn default_invariants() -> Vec<Box<dyn Invariant>> {
    vec![
        Box::new(PinnedNeverEvicted),
        Box::new(PinnedNeverCandidate),
        Box::new(SurvivalMonotonic),
        Box::new(NoIndexedWorkingSegment {
            working_tier_indexed: false,
        }),
        Box::new(DeletedNeverReturned),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seen(id: &str, tier: Tier, pinned: bool, survival: u32) -> Observed {
        Observed {
            segment_id: SegmentId::from(id),
            tier,
            pinned,
            generation: if survival > 0 {
                Generation::Old
            } else {
                Generation::Young
            },
            gc_survival_count: survival,
        }
    }

    fn record(log: &EventLog, op: OperationType, result: OperationResult) {
        let op_id = log.record_invoke("p", op);
        log.record_return(op_id, result);
    }

    fn pin(log: &EventLog, id: &str) {
        record(
            log,
            OperationType::Pin {
                segment_ids: vec![SegmentId::from(id)],
            },
            OperationResult::Batch {
                updated: vec![SegmentId::from(id)],
                failed: vec![],
            },
        );
    }

    fn ingest(log: &EventLog, id: &str, spilled: &[&str]) {
        record(
            log,
            OperationType::Ingest {
                task_id: None,
                text: id.to_string(),
            },
            OperationResult::Ingested {
                segment: seen(id, Tier::Working, false, 0),
                spilled: spilled.iter().map(|s| SegmentId::from(*s)).collect(),
                over_capacity: false,
            },
        );
    }

    fn analyze(log: &EventLog, candidates: Vec<Observed>) {
        record(
            log,
            OperationType::GcAnalyze {
                task_id: None,
                target_tokens: None,
            },
            OperationResult::Analyzed {
                candidates,
                planned: vec![],
            },
        );
    }

    #[test]
    fn test_pinned_never_evicted_pass() {
        let log = EventLog::new();
        ingest(&log, "a", &[]);
        pin(&log, "a");
        ingest(&log, "b", &[]);
        ingest(&log, "c", &["b"]);
        assert!(PinnedNeverEvicted.check(&log).is_ok());
    }

    #[test]
    fn test_pinned_never_evicted_fail() {
        let log = EventLog::new();
        ingest(&log, "a", &[]);
        pin(&log, "a");
        ingest(&log, "b", &["a"]);
        let violation = PinnedNeverEvicted.check(&log).unwrap_err();
        assert_eq!(violation.invariant, "PinnedNeverEvicted");
        assert_eq!(violation.violating_events, vec![2]);
    }

    #[test]
    fn test_unpinned_segment_may_be_evicted() {
        let log = EventLog::new();
        ingest(&log, "a", &[]);
        pin(&log, "a");
        record(
            &log,
            OperationType::Unpin {
                segment_ids: vec![SegmentId::from("a")],
            },
            OperationResult::Batch {
                updated: vec![SegmentId::from("a")],
                failed: vec![],
            },
        );
        ingest(&log, "b", &["a"]);
        assert!(PinnedNeverEvicted.check(&log).is_ok());
    }

    #[test]
    fn test_pinned_never_candidate() {
        let log = EventLog::new();
        ingest(&log, "a", &[]);
        pin(&log, "a");
        analyze(&log, vec![seen("b", Tier::Working, false, 0)]);
        assert!(PinnedNeverCandidate.check(&log).is_ok());

        analyze(&log, vec![seen("a", Tier::Working, false, 0)]);
        assert!(PinnedNeverCandidate.check(&log).is_err());
    }

    #[test]
    fn test_survival_monotonic() {
        let log = EventLog::new();
        analyze(&log, vec![seen("a", Tier::Working, false, 0)]);
        analyze(&log, vec![seen("a", Tier::Working, false, 1)]);
        assert!(SurvivalMonotonic.check(&log).is_ok());

        analyze(&log, vec![seen("a", Tier::Working, false, 0)]);
        let violation = SurvivalMonotonic.check(&log).unwrap_err();
        assert_eq!(violation.violating_events, vec![2]);
    }

    #[test]
    fn test_no_indexed_working_segment() {
        let log = EventLog::new();
        record(
            &log,
            OperationType::Search { query: None },
            OperationResult::Found {
                segments: vec![seen("a", Tier::Working, false, 0)],
            },
        );
        let strict = NoIndexedWorkingSegment {
            working_tier_indexed: false,
        };
        let relaxed = NoIndexedWorkingSegment {
            working_tier_indexed: true,
        };
        assert!(strict.check(&log).is_err());
        assert!(relaxed.check(&log).is_ok());
    }

    #[test]
    fn test_deleted_never_returned() {
        let log = EventLog::new();
        record(
            &log,
            OperationType::GcExecute {
                segment_ids: vec![SegmentId::from("a")],
                action: GcAction::Delete,
            },
            OperationResult::Executed {
                affected: vec![SegmentId::from("a")],
                failed: vec![],
            },
        );
        record(
            &log,
            OperationType::Get {
                segment_id: SegmentId::from("a"),
            },
            OperationResult::Got {
                segment_id: SegmentId::from("a"),
                segment: None,
            },
        );
        assert!(DeletedNeverReturned.check(&log).is_ok());

        record(
            &log,
            OperationType::Search { query: None },
            OperationResult::Found {
                segments: vec![seen("a", Tier::Stashed, false, 0)],
            },
        );
        assert!(DeletedNeverReturned.check(&log).is_err());
    }

    #[test]
    fn test_check_all_invariants() {
        let log = EventLog::new();
        ingest(&log, "a", &[]);
        pin(&log, "a");
        ingest(&log, "b", &["a"]);
        analyze(&log, vec![seen("a", Tier::Working, true, 0)]);

        let violations = check_all_invariants(&log, &default_invariants());
        let names: Vec<&str> = violations.iter().map(|v| v.invariant.as_str()).collect();
        assert_eq!(names, vec!["PinnedNeverEvicted", "PinnedNeverCandidate"]);
    }

    #[test]
    fn test_violation_display() {
        let log = EventLog::new();
        ingest(&log, "a", &[]);
        pin(&log, "a");
        ingest(&log, "b", &["a"]);
        let text = PinnedNeverEvicted.check(&log).unwrap_err().to_string();
        assert!(text.contains("INVARIANT VIOLATION: PinnedNeverEvicted"));
        assert!(text.contains("segment_id: a"));
    }
}
