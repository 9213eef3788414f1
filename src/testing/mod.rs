//! Testing infrastructure for correctness verification
//!
//! This module provides:
//! - Event capture and history tracking
//! - Invariant checking over recorded histories
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use ctxheap::testing::prelude::*;
//! use ctxheap::engine::InstrumentedEngine;
//!
//! let instrumented = InstrumentedEngine::new(Arc::new(engine));
//!
//! instrumented.ingest("proj", IngestRequest::new("cargo test output", SegmentType::Log))?;
//! instrumented.gc_analyze("proj", None, None)?;
//!
//! let violations = instrumented.check_invariants(&default_invariants());
//! assert!(violations.is_empty());
//! ```
//!
//! # Invariants
//!
//! - **PinnedNeverEvicted**: pinned segments are never spilled or collected
//! - **PinnedNeverCandidate**: GC passes never propose pinned segments
//! - **SurvivalMonotonic**: a segment's survival count never decreases
//! - **NoIndexedWorkingSegment**: searches only return archived segments
//! - **DeletedNeverReturned**: deleted segments never reappear

pub mod events;
pub mod history;
pub mod invariants;

pub use events::{Event, Observed, OperationId, OperationResult, OperationType, Timestamp};
pub use history::EventLog;
pub use invariants::{
    check_all_invariants, default_invariants, DeletedNeverReturned, Invariant,
    NoIndexedWorkingSegment, PinnedNeverCandidate, PinnedNeverEvicted, SurvivalMonotonic,
    Violation,
};

/// Prelude for easy imports
pub mod prelude {
    pub use super::events::*;
    pub use super::history::EventLog;
    pub use super::invariants::{check_all_invariants, default_invariants, Invariant, Violation};
}
