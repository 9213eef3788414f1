use serde::{Deserialize, Serialize};

use super::segment::{Generation, Segment, SegmentId, SegmentMetadata, SegmentType, TaskId};
use crate::error::{ContextError, ErrorKind};

/// Ingestion request for a new working-tier segment
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IngestRequest {
    pub task_id: Option<TaskId>,
    pub text: String,
    pub segment_type: SegmentType,
    pub metadata: SegmentMetadata,
}

impl IngestRequest {
    pub fn new(text: impl Into<String>, segment_type: SegmentType) -> Self {
        Self {
            task_id: None,
            text: text.into(),
            segment_type,
            metadata: SegmentMetadata::default(),
        }
    }

    pub fn with_task(mut self, task: impl Into<TaskId>) -> Self {
        self.task_id = Some(task.into());
        self
    }

    pub fn with_metadata(mut self, metadata: SegmentMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Outcome of an ingest: the new segment plus any LRU side effects
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IngestResult {
    pub segment: Segment,
    /// Segments spilled from the working set to the archive by this insert
    pub spilled: Vec<SegmentId>,
    /// Scope exceeds capacity because every remaining member is pinned
    pub over_capacity: bool,
}

/// Per-id failure inside a batch operation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ItemError {
    pub segment_id: SegmentId,
    pub kind: ErrorKind,
    pub message: String,
}

impl ItemError {
    pub fn new(segment_id: SegmentId, err: &ContextError) -> Self {
        Self {
            segment_id,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Result of pin / unpin / reference batches
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BatchResult {
    pub updated: Vec<SegmentId>,
    pub errors: Vec<ItemError>,
}

/// What `gc_execute` does with each id
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GcAction {
    Stash,
    Delete,
}

/// One scored working-set member
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GcCandidate {
    pub segment_id: SegmentId,
    pub score: f64,
    pub age_hours: f64,
    pub tokens: u32,
    pub segment_type: SegmentType,
    pub generation: Generation,
    pub gc_survival_count: u32,
    pub refcount: u32,
    pub reason: String,
}

/// Token-targeted pruning plan
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GcPlan {
    pub target_tokens: u64,
    pub stash_segments: Vec<SegmentId>,
    pub delete_segments: Vec<SegmentId>,
    pub tokens_freed: u64,
    /// Tokens still missing when candidates ran out (0 when the target was met)
    pub shortfall: u64,
}

impl GcPlan {
    pub fn is_satisfied(&self) -> bool {
        self.shortfall == 0
    }

    pub fn len(&self) -> usize {
        self.stash_segments.len() + self.delete_segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Result of `gc_analyze`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GcAnalysis {
    pub candidates: Vec<GcCandidate>,
    pub plan: Option<GcPlan>,
}

/// Result of `gc_execute`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ExecuteResult {
    pub affected: Vec<SegmentId>,
    pub tokens_freed: u64,
    pub errors: Vec<ItemError>,
}

/// Result of `stash`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StashResult {
    pub stashed_ids: Vec<SegmentId>,
    pub tokens_freed: u64,
    pub matched_count: usize,
}

/// Result of `search`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SearchResponse {
    pub segments: Vec<Segment>,
    pub total_matches: usize,
    pub took_ms: u64,
}

/// Result of `retrieve`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetrieveResult {
    pub found: Vec<Segment>,
    pub moved_ids: Option<Vec<SegmentId>>,
}

/// Derived working-set view for one scope (or a whole project)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkingSetView {
    pub segment_ids: Vec<SegmentId>,
    pub total_tokens: u64,
    pub capacity: usize,
    pub over_capacity: bool,
}

/// Per-project counters
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ProjectStats {
    pub working_segments: usize,
    pub stashed_segments: usize,
    pub pinned_segments: usize,
    pub working_tokens: u64,
    pub stashed_tokens: u64,
    pub indexed_segments: usize,
    pub indexed_terms: usize,
    pub shard_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ingest_request_builder() {
        let req = IngestRequest::new("hello", SegmentType::Note)
            .with_task("t-1")
            .with_metadata(SegmentMetadata::default().with_tag("x"));
        assert_eq!(req.task_id, Some(TaskId::from("t-1")));
        assert!(req.metadata.tags.contains("x"));
    }

    #[test]
    fn test_item_error_carries_kind() {
        let err = ContextError::PinnedSegment("s1".into());
        let item = ItemError::new(SegmentId::from("s1"), &err);
        assert_eq!(item.kind, ErrorKind::PinnedSegment);
        assert!(item.message.contains("pinned"));
    }

    #[test]
    fn test_plan_accounting() {
        let plan = GcPlan {
            target_tokens: 100,
            stash_segments: vec![SegmentId::from("a")],
            delete_segments: vec![SegmentId::from("b")],
            tokens_freed: 60,
            shortfall: 40,
        };
        assert_eq!(plan.len(), 2);
        assert!(!plan.is_satisfied());
    }
}
