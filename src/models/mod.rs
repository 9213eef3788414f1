pub mod filter;
pub mod results;
pub mod segment;

pub use filter::SegmentFilter;
pub use results::{
    BatchResult, ExecuteResult, GcAction, GcAnalysis, GcCandidate, GcPlan, IngestRequest,
    IngestResult, ItemError, ProjectStats, RetrieveResult, SearchResponse, StashResult,
    WorkingSetView,
};
pub use segment::{
    compute_text_hash, Generation, LineRange, ProjectId, Scope, Segment, SegmentId,
    SegmentMetadata, SegmentType, TaskId, Tier,
};
