//! Event types for capturing engine operations
//!
//! Events record what was asked of the engine and what it answered, with
//! timing, so invariants can be checked over a whole history afterwards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::models::{GcAction, GcCandidate, Generation, Segment, SegmentId, Tier};

/// Unique identifier for an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationId(pub u64);

impl OperationId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

/// Operation requested from the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OperationType {
    Ingest { task_id: Option<String>, text: String },
    Touch { segment_id: SegmentId },
    Pin { segment_ids: Vec<SegmentId> },
    Unpin { segment_ids: Vec<SegmentId> },
    GcAnalyze { task_id: Option<String>, target_tokens: Option<u64> },
    GcExecute { segment_ids: Vec<SegmentId>, action: GcAction },
    Stash { query: Option<String> },
    Search { query: Option<String> },
    Retrieve { query: Option<String>, move_to_active: bool },
    Delete { segment_id: SegmentId },
    Get { segment_id: SegmentId },
}

/// Segment state as seen by the caller at the time of an answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observed {
    pub segment_id: SegmentId,
    pub tier: Tier,
    pub pinned: bool,
    pub generation: Generation,
    pub gc_survival_count: u32,
}

impl From<&Segment> for Observed {
    fn from(segment: &Segment) -> Self {
        Self {
            segment_id: segment.segment_id.clone(),
            tier: segment.tier,
            pinned: segment.pinned,
            generation: segment.generation,
            gc_survival_count: segment.gc_survival_count,
        }
    }
}

/// Candidates are always unpinned working segments
impl From<&GcCandidate> for Observed {
    fn from(candidate: &GcCandidate) -> Self {
        Self {
            segment_id: candidate.segment_id.clone(),
            tier: Tier::Working,
            pinned: false,
            generation: candidate.generation,
            gc_survival_count: candidate.gc_survival_count,
        }
    }
}

/// What the engine answered
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OperationResult {
    Ingested { segment: Observed, spilled: Vec<SegmentId>, over_capacity: bool },
    Touched { segment: Observed },
    /// Pin, unpin: ids updated and ids that failed
    Batch { updated: Vec<SegmentId>, failed: Vec<SegmentId> },
    Analyzed { candidates: Vec<Observed>, planned: Vec<SegmentId> },
    Executed { affected: Vec<SegmentId>, failed: Vec<SegmentId> },
    Stashed { segment_ids: Vec<SegmentId> },
    Found { segments: Vec<Observed> },
    Retrieved { found: Vec<Observed>, moved: Option<Vec<SegmentId>> },
    Deleted { segment_id: SegmentId },
    Got { segment_id: SegmentId, segment: Option<Observed> },
    Error { message: String },
}

/// Timestamp wrapper for consistent time handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub fn now() -> Self {
        Self(Utc::now().timestamp_nanos_opt().unwrap_or(0))
    }

    pub fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    pub fn as_nanos(&self) -> i64 {
        self.0
    }

    pub fn to_datetime(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_nanos(self.0)
    }
}

/// A recorded operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub op_id: OperationId,
    pub project: String,
    pub op_type: OperationType,
    pub invoke_time: Timestamp,
    /// None while the operation is still running
    pub return_time: Option<Timestamp>,
    pub result: Option<OperationResult>,
}

impl Event {
    /// Create a new event at invocation time
    pub fn invoke(op_id: OperationId, project: impl Into<String>, op_type: OperationType) -> Self {
        Self {
            op_id,
            project: project.into(),
            op_type,
            invoke_time: Timestamp::now(),
            return_time: None,
            result: None,
        }
    }

    /// Mark event as completed
    pub fn complete(&mut self, result: OperationResult) {
        self.return_time = Some(Timestamp::now());
        self.result = Some(result);
    }

    pub fn is_complete(&self) -> bool {
        self.return_time.is_some() && self.result.is_some()
    }

    /// Duration of the operation in nanoseconds
    pub fn duration_nanos(&self) -> Option<i64> {
        self.return_time.map(|rt| rt.0 - self.invoke_time.0)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Op({:?}) [{}] {:?} @ {} -> ",
            self.op_id, self.project, self.op_type, self.invoke_time.0
        )?;
        match &self.result {
            Some(result) => write!(f, "{:?} @ {:?}", result, self.return_time),
            None => write!(f, "<pending>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_creation_and_completion() {
        let mut event = Event::invoke(
            OperationId::new(1),
            "proj",
            OperationType::Delete {
                segment_id: SegmentId::from("s1"),
            },
        );
        assert!(!event.is_complete());
        assert!(event.duration_nanos().is_none());

        event.complete(OperationResult::Deleted {
            segment_id: SegmentId::from("s1"),
        });
        assert!(event.is_complete());
        assert!(event.duration_nanos().unwrap() >= 0);
    }

    #[test]
    fn test_timestamp_ordering() {
        let t1 = Timestamp::from_nanos(100);
        let t2 = Timestamp::from_nanos(200);
        assert!(t1 < t2);
        assert_eq!(t1, Timestamp::from_nanos(100));
    }

    #[test]
    fn test_display_shows_pending() {
        let event = Event::invoke(
            OperationId::new(7),
            "proj",
            OperationType::Search { query: None },
        );
        assert!(event.to_string().ends_with("<pending>"));
    }
}
