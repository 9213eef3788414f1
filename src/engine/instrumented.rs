//! Instrumented engine wrapper for testing
//!
//! Wraps a [`ContextEngine`] and records every call and answer in an
//! [`EventLog`] for invariant verification.

use std::sync::Arc;

use super::ContextEngine;
use crate::error::{ContextError, Result};
use crate::models::*;
use crate::testing::prelude::*;

fn observe(segments: &[Segment]) -> Vec<Observed> {
    segments.iter().map(Observed::from).collect()
}

fn failed(errors: &[ItemError]) -> Vec<SegmentId> {
    errors.iter().map(|e| e.segment_id.clone()).collect()
}

/// Wrapper around ContextEngine that captures events for testing
pub struct InstrumentedEngine {
    inner: Arc<ContextEngine>,
    event_log: EventLog,
}

impl InstrumentedEngine {
    pub fn new(inner: Arc<ContextEngine>) -> Self {
        Self {
            inner,
            event_log: EventLog::new(),
        }
    }

    /// Continue recording into an existing log
    pub fn with_event_log(inner: Arc<ContextEngine>, event_log: EventLog) -> Self {
        Self { inner, event_log }
    }

    pub fn event_log(&self) -> &EventLog {
        &self.event_log
    }

    pub fn inner(&self) -> &Arc<ContextEngine> {
        &self.inner
    }

    fn capture<T>(
        &self,
        project: &str,
        op: OperationType,
        call: impl FnOnce(&ContextEngine) -> Result<T>,
        summarize: impl FnOnce(&T) -> OperationResult,
    ) -> Result<T> {
        let op_id = self.event_log.record_invoke(project, op);
        match call(&self.inner) {
            Ok(value) => {
                self.event_log.record_return(op_id, summarize(&value));
                Ok(value)
            }
            Err(e) => {
                self.event_log.record_return(
                    op_id,
                    OperationResult::Error {
                        message: e.to_string(),
                    },
                );
                Err(e)
            }
        }
    }

    pub fn ingest(&self, project: &str, request: IngestRequest) -> Result<IngestResult> {
        let op = OperationType::Ingest {
            task_id: request.task_id.as_ref().map(|t| t.to_string()),
            text: request.text.clone(),
        };
        self.capture(
            project,
            op,
            |engine| engine.ingest(project, request),
            |r| OperationResult::Ingested {
                segment: Observed::from(&r.segment),
                spilled: r.spilled.clone(),
                over_capacity: r.over_capacity,
            },
        )
    }

    pub fn touch(&self, project: &str, segment_id: &SegmentId) -> Result<Segment> {
        self.capture(
            project,
            OperationType::Touch {
                segment_id: segment_id.clone(),
            },
            |engine| engine.touch(project, segment_id),
            |s| OperationResult::Touched {
                segment: Observed::from(s),
            },
        )
    }

    pub fn pin(&self, project: &str, segment_ids: &[SegmentId]) -> Result<BatchResult> {
        self.capture(
            project,
            OperationType::Pin {
                segment_ids: segment_ids.to_vec(),
            },
            |engine| engine.pin(project, segment_ids),
            |r| OperationResult::Batch {
                updated: r.updated.clone(),
                failed: failed(&r.errors),
            },
        )
    }

    pub fn unpin(&self, project: &str, segment_ids: &[SegmentId]) -> Result<BatchResult> {
        self.capture(
            project,
            OperationType::Unpin {
                segment_ids: segment_ids.to_vec(),
            },
            |engine| engine.unpin(project, segment_ids),
            |r| OperationResult::Batch {
                updated: r.updated.clone(),
                failed: failed(&r.errors),
            },
        )
    }

    pub fn gc_analyze(
        &self,
        project: &str,
        task: Option<&str>,
        target_tokens: Option<u64>,
    ) -> Result<GcAnalysis> {
        self.capture(
            project,
            OperationType::GcAnalyze {
                task_id: task.map(str::to_string),
                target_tokens,
            },
            |engine| engine.gc_analyze(project, task, target_tokens),
            |a| OperationResult::Analyzed {
                candidates: a.candidates.iter().map(Observed::from).collect(),
                planned: a
                    .plan
                    .iter()
                    .flat_map(|p| p.stash_segments.iter().chain(&p.delete_segments))
                    .cloned()
                    .collect(),
            },
        )
    }

    pub fn gc_execute(
        &self,
        project: &str,
        segment_ids: &[SegmentId],
        action: GcAction,
        confirm: bool,
    ) -> Result<ExecuteResult> {
        self.capture(
            project,
            OperationType::GcExecute {
                segment_ids: segment_ids.to_vec(),
                action,
            },
            |engine| engine.gc_execute(project, segment_ids, action, confirm),
            |r| OperationResult::Executed {
                affected: r.affected.clone(),
                failed: failed(&r.errors),
            },
        )
    }

    pub fn stash(
        &self,
        project: &str,
        query: Option<&str>,
        filter: Option<&SegmentFilter>,
    ) -> Result<StashResult> {
        self.capture(
            project,
            OperationType::Stash {
                query: query.map(str::to_string),
            },
            |engine| engine.stash(project, query, filter),
            |r| OperationResult::Stashed {
                segment_ids: r.stashed_ids.clone(),
            },
        )
    }

    pub fn search(
        &self,
        project: Option<&str>,
        query: Option<&str>,
        filter: Option<&SegmentFilter>,
        limit: usize,
    ) -> Result<SearchResponse> {
        self.capture(
            project.unwrap_or("*"),
            OperationType::Search {
                query: query.map(str::to_string),
            },
            |engine| engine.search(project, query, filter, limit),
            |r| OperationResult::Found {
                segments: observe(&r.segments),
            },
        )
    }

    pub fn retrieve(
        &self,
        project: &str,
        query: Option<&str>,
        filter: Option<&SegmentFilter>,
        move_to_active: bool,
    ) -> Result<RetrieveResult> {
        self.capture(
            project,
            OperationType::Retrieve {
                query: query.map(str::to_string),
                move_to_active,
            },
            |engine| engine.retrieve(project, query, filter, move_to_active),
            |r| OperationResult::Retrieved {
                found: observe(&r.found),
                moved: r.moved_ids.clone(),
            },
        )
    }

    pub fn delete(&self, project: &str, segment_id: &SegmentId, confirm: bool) -> Result<Segment> {
        self.capture(
            project,
            OperationType::Delete {
                segment_id: segment_id.clone(),
            },
            |engine| engine.delete(project, segment_id, confirm),
            |s| OperationResult::Deleted {
                segment_id: s.segment_id.clone(),
            },
        )
    }

    /// Missing segments are recorded as an empty answer, not an error
    pub fn get(&self, project: &str, segment_id: &SegmentId) -> Result<Option<Segment>> {
        self.capture(
            project,
            OperationType::Get {
                segment_id: segment_id.clone(),
            },
            |engine| match engine.get(project, segment_id) {
                Ok(segment) => Ok(Some(segment)),
                Err(ContextError::NotFound { kind: "Segment", .. }) => Ok(None),
                Err(e) => Err(e),
            },
            |s| OperationResult::Got {
                segment_id: segment_id.clone(),
                segment: s.as_ref().map(Observed::from),
            },
        )
    }

    /// Check invariants against captured events
    pub fn check_invariants(&self, invariants: &[Box<dyn Invariant>]) -> Vec<Violation> {
        check_all_invariants(&self.event_log, invariants)
    }

    pub fn check_default_invariants(&self) -> Vec<Violation> {
        self.check_invariants(&default_invariants())
    }
}
