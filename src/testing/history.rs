//! Event history capture for testing
//!
//! Thread-safe log of operation histories that can be verified against
//! invariants after a run.

use super::events::{Event, OperationId, OperationResult, OperationType, Timestamp};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Thread-safe event log for capturing operation history
#[derive(Clone)]
pub struct EventLog {
    inner: Arc<RwLock<EventLogInner>>,
    next_op_id: Arc<AtomicU64>,
}

struct EventLogInner {
    events: Vec<Event>,
    pending: HashMap<OperationId, usize>, // op_id -> index in events
}

impl EventLog {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(EventLogInner {
                events: Vec::new(),
                pending: HashMap::new(),
            })),
            next_op_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Record a new operation invocation
    pub fn record_invoke(&self, project: &str, op_type: OperationType) -> OperationId {
        let op_id = OperationId::new(self.next_op_id.fetch_add(1, Ordering::SeqCst));
        let event = Event::invoke(op_id, project, op_type);

        let mut inner = self.inner.write();
        let index = inner.events.len();
        inner.events.push(event);
        inner.pending.insert(op_id, index);

        op_id
    }

    /// Record operation completion
    pub fn record_return(&self, op_id: OperationId, result: OperationResult) {
        let mut inner = self.inner.write();

        if let Some(index) = inner.pending.remove(&op_id) {
            if let Some(event) = inner.events.get_mut(index) {
                event.complete(result);
            }
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.inner.read().events.clone()
    }

    /// Completed events in invocation order
    pub fn completed_events(&self) -> Vec<Event> {
        self.inner
            .read()
            .events
            .iter()
            .filter(|e| e.is_complete())
            .cloned()
            .collect()
    }

    pub fn pending_events(&self) -> Vec<Event> {
        self.inner
            .read()
            .events
            .iter()
            .filter(|e| !e.is_complete())
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().events.is_empty()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.events.clear();
        inner.pending.clear();
    }

    /// Export to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.events())
    }

    /// Import from JSON
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let events: Vec<Event> = serde_json::from_str(json)?;
        let log = Self::new();

        let mut max_op_id = 0u64;
        let mut pending_entries = Vec::new();
        for (idx, event) in events.iter().enumerate() {
            max_op_id = max_op_id.max(event.op_id.0);
            if !event.is_complete() {
                pending_entries.push((event.op_id, idx));
            }
        }

        let mut inner = log.inner.write();
        inner.events = events;
        inner.pending.extend(pending_entries);
        drop(inner);

        log.next_op_id.store(max_op_id + 1, Ordering::SeqCst);
        Ok(log)
    }

    /// Events invoked within `[start, end]`
    pub fn events_in_range(&self, start: Timestamp, end: Timestamp) -> Vec<Event> {
        self.inner
            .read()
            .events
            .iter()
            .filter(|e| e.invoke_time >= start && e.invoke_time <= end)
            .cloned()
            .collect()
    }

    pub fn events_by_type(&self, filter: impl Fn(&OperationType) -> bool) -> Vec<Event> {
        self.inner
            .read()
            .events
            .iter()
            .filter(|e| filter(&e.op_type))
            .cloned()
            .collect()
    }

    pub fn events_for_project(&self, project: &str) -> Vec<Event> {
        self.inner
            .read()
            .events
            .iter()
            .filter(|e| e.project == project)
            .cloned()
            .collect()
    }

    pub fn gc_passes(&self) -> Vec<Event> {
        self.events_by_type(|op| matches!(op, OperationType::GcAnalyze { .. }))
    }

    pub fn delete_operations(&self) -> Vec<Event> {
        self.events_by_type(|op| {
            matches!(
                op,
                OperationType::Delete { .. } | OperationType::GcExecute { .. }
            )
        })
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}
