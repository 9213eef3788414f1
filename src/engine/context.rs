use std::fs;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::project::{ProjectHandle, ProjectState};
use crate::clock::{Clock, SystemClock};
use crate::config::StoreSettings;
use crate::error::ContextError;
use crate::gc;
use crate::index::{recency_order, KeywordQuery};
use crate::metrics::ContextMetrics;
use crate::models::*;
use crate::tokenizer::{ApproxTokenCounter, CachedTokenCounter, TokenCounter};
use crate::Result;

/// Entry point: owns every open project and the shared collaborators
/// (clock, token counter, metrics) injected into them.
pub struct ContextEngine {
    settings: StoreSettings,
    projects: DashMap<ProjectId, Arc<ProjectHandle>>,
    /// Serializes project loads so disk I/O never runs under a map shard lock
    opening: Mutex<()>,
    counter: CachedTokenCounter,
    clock: Arc<dyn Clock>,
    metrics: ContextMetrics,
}

/// Builder for [`ContextEngine`] with injectable clock and token counter
pub struct ContextEngineBuilder {
    settings: StoreSettings,
    clock: Option<Arc<dyn Clock>>,
    counter: Option<CachedTokenCounter>,
}

impl ContextEngineBuilder {
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_token_counter(mut self, counter: impl TokenCounter + 'static) -> Self {
        self.counter = Some(CachedTokenCounter::new(
            counter,
            self.settings.token_cache_size,
        ));
        self
    }

    pub fn build(self) -> Result<ContextEngine> {
        self.settings.validate()?;
        let data_dir = &self.settings.data_dir;
        fs::create_dir_all(data_dir).map_err(|e| ContextError::storage(data_dir, e))?;

        let counter = match self.counter {
            Some(counter) => counter,
            None => CachedTokenCounter::new(ApproxTokenCounter, self.settings.token_cache_size),
        };
        let metrics = ContextMetrics::new()?;
        info!(
            data_dir = %data_dir.display(),
            capacity = self.settings.working_set_capacity,
            shard_count = self.settings.shard_count,
            index_working_tier = self.settings.index_working_tier,
            "context engine ready"
        );

        Ok(ContextEngine {
            settings: self.settings,
            projects: DashMap::new(),
            opening: Mutex::new(()),
            counter,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            metrics,
        })
    }
}

fn require_ids(ids: &[SegmentId], op: &str) -> Result<()> {
    if ids.is_empty() {
        return Err(ContextError::InvalidParameter(format!(
            "{} requires at least one segment id",
            op
        )));
    }
    Ok(())
}

fn validate_filter(filter: Option<&SegmentFilter>) -> Result<()> {
    match filter {
        Some(filter) => filter.validate(),
        None => Ok(()),
    }
}

fn task_id(task: Option<&str>) -> Result<Option<TaskId>> {
    match task {
        Some("") => Err(ContextError::InvalidParameter(
            "task_id must not be empty".to_string(),
        )),
        Some(task) => Ok(Some(TaskId::from(task))),
        None => Ok(None),
    }
}

impl ContextEngine {
    /// Engine with the system clock and the approximate token counter
    pub fn new(settings: StoreSettings) -> Result<Self> {
        Self::builder(settings).build()
    }

    pub fn builder(settings: StoreSettings) -> ContextEngineBuilder {
        ContextEngineBuilder {
            settings,
            clock: None,
            counter: None,
        }
    }

    pub fn settings(&self) -> &StoreSettings {
        &self.settings
    }

    pub fn metrics(&self) -> &ContextMetrics {
        &self.metrics
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // ---- project registry ----

    fn load_project(&self, project: &str, create: bool) -> Result<Arc<ProjectHandle>> {
        let id = ProjectId::new(project)?;
        if let Some(handle) = self.projects.get(&id) {
            return Ok(handle.value().clone());
        }
        if !create && !self.settings.project_dir(id.as_str()).is_dir() {
            return Err(ContextError::project_not_found(id.as_str()));
        }

        let _opening = self.opening.lock();
        if let Some(handle) = self.projects.get(&id) {
            return Ok(handle.value().clone());
        }
        let handle = Arc::new(ProjectHandle::open(
            id.clone(),
            &self.settings,
            self.metrics.clone(),
        )?);
        self.projects.insert(id, handle.clone());
        self.metrics.set_open_projects(self.projects.len());
        Ok(handle)
    }

    /// Load (or create) a project directory
    pub fn open_project(&self, project: &str) -> Result<()> {
        self.load_project(project, true).map(|_| ())
    }

    /// Open every project directory found under the data directory
    pub fn open_existing(&self) -> Result<usize> {
        let data_dir = &self.settings.data_dir;
        let entries = fs::read_dir(data_dir).map_err(|e| ContextError::storage(data_dir, e))?;
        let mut opened = 0;
        for entry in entries {
            let entry = entry.map_err(|e| ContextError::storage(data_dir, e))?;
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if ProjectId::new(name.as_str()).is_err() {
                debug!(dir = %name, "skipping directory that is not a project id");
                continue;
            }
            self.load_project(&name, false)?;
            opened += 1;
        }
        Ok(opened)
    }

    /// Open projects, sorted by id
    pub fn list_projects(&self) -> Vec<ProjectId> {
        let mut ids: Vec<ProjectId> = self.projects.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Checkpoint and unload a project; false when it was not open
    pub fn close_project(&self, project: &str) -> Result<bool> {
        let id = ProjectId::new(project)?;
        let Some(handle) = self.projects.get(&id).map(|h| h.value().clone()) else {
            return Ok(false);
        };
        handle.checkpoint()?;
        self.projects.remove(&id);
        {
            let state = handle.state().read();
            let stashed = state.store.stashed_len();
            let working = state.store.len() - stashed;
            self.metrics.adjust_tier("working", -(working as f64));
            self.metrics.adjust_tier("stashed", -(stashed as f64));
        }
        self.metrics.set_open_projects(self.projects.len());
        info!(project = %id, "project closed");
        Ok(true)
    }

    /// Run a mutation under the project's op lock and state write lock, then
    /// persist dirty shards after the state lock is released.
    fn mutate<T, F>(&self, handle: &ProjectHandle, f: F) -> Result<T>
    where
        F: FnOnce(&mut ProjectState, DateTime<Utc>) -> Result<T>,
    {
        let _ops = handle.lock_ops();
        let now = self.clock.now();
        let (result, dirty) = {
            let mut state = handle.state().write();
            let before = tier_counts(&state);
            let result = f(&mut state, now);
            let after = tier_counts(&state);
            self.metrics
                .adjust_tier("working", after.0 as f64 - before.0 as f64);
            self.metrics
                .adjust_tier("stashed", after.1 as f64 - before.1 as f64);
            (result, state.store.take_dirty_shards())
        };
        handle.persist(dirty)?;
        result
    }

    // ---- core operations ----

    /// Create a working-tier segment, spilling LRU victims if the scope is full
    pub fn ingest(&self, project: &str, request: IngestRequest) -> Result<IngestResult> {
        if request.text.is_empty() {
            return Err(ContextError::InvalidParameter(
                "segment text must not be empty".to_string(),
            ));
        }
        if matches!(&request.task_id, Some(t) if t.as_str().is_empty()) {
            return Err(ContextError::InvalidParameter(
                "task_id must not be empty".to_string(),
            ));
        }
        request.metadata.validate()?;

        let handle = self.load_project(project, true)?;
        let tokens = self.counter.count(&request.text);

        let result = self.mutate(&handle, |state, now| {
            let segment = Segment::new(
                handle.id().clone(),
                request.task_id,
                request.text,
                request.segment_type,
                request.metadata,
                tokens,
                now,
            );
            let id = segment.segment_id.clone();
            let outcome = state.add_working(segment)?;
            Ok(IngestResult {
                segment: state.store.get(&id)?.clone(),
                spilled: outcome.evicted,
                over_capacity: outcome.over_capacity,
            })
        })?;

        self.metrics
            .record_ingest(result.spilled.len(), result.over_capacity);
        debug!(
            project = %handle.id(),
            segment_id = %result.segment.segment_id,
            tokens,
            spilled = result.spilled.len(),
            "ingested segment"
        );
        Ok(result)
    }

    /// Record an access: bumps `last_touched_at` and the LRU position
    pub fn touch(&self, project: &str, segment_id: &SegmentId) -> Result<Segment> {
        let handle = self.load_project(project, false)?;
        self.mutate(&handle, |state, now| {
            let segment = state.store.touch(segment_id, now)?.clone();
            if segment.is_working() {
                state.cache.touch(segment_id, segment.last_touched_at);
            }
            Ok(segment)
        })
    }

    /// Protect segments from LRU eviction and GC
    pub fn pin(&self, project: &str, segment_ids: &[SegmentId]) -> Result<BatchResult> {
        require_ids(segment_ids, "pin")?;
        let handle = self.load_project(project, false)?;
        self.mutate(&handle, |state, _now| {
            let mut result = BatchResult::default();
            for id in segment_ids {
                match state.store.set_pinned(id, true) {
                    Ok(_) => result.updated.push(id.clone()),
                    Err(e) => result.errors.push(ItemError::new(id.clone(), &e)),
                }
            }
            Ok(result)
        })
    }

    /// Clear the pin flag, then re-apply the capacity bound to every scope
    pub fn unpin(&self, project: &str, segment_ids: &[SegmentId]) -> Result<BatchResult> {
        require_ids(segment_ids, "unpin")?;
        let handle = self.load_project(project, false)?;
        let (result, spilled) = self.mutate(&handle, |state, _now| {
            let mut result = BatchResult::default();
            for id in segment_ids {
                match state.store.set_pinned(id, false) {
                    Ok(_) => result.updated.push(id.clone()),
                    Err(e) => result.errors.push(ItemError::new(id.clone(), &e)),
                }
            }
            let spilled = state.enforce_capacity()?;
            Ok((result, spilled))
        })?;
        if !spilled.is_empty() {
            info!(project = %handle.id(), spilled = spilled.len(), "spilled after unpin");
            self.metrics.record_spills(spilled.len());
        }
        Ok(result)
    }

    /// Score and rank unpinned working segments, optionally planning to free
    /// `target_tokens`. Every evaluated candidate left out of the plan records
    /// one GC survival.
    pub fn gc_analyze(
        &self,
        project: &str,
        task: Option<&str>,
        target_tokens: Option<u64>,
    ) -> Result<GcAnalysis> {
        let task = task_id(task)?;
        let handle = self.load_project(project, false)?;
        let gc_config = &self.settings.gc;

        let pass = self.mutate(&handle, |state, now| {
            let pass = match &task {
                Some(task) => {
                    let scope = Scope {
                        project_id: handle.id().clone(),
                        task_id: Some(task.clone()),
                    };
                    gc::analyze(state.store.in_scope(&scope), now, gc_config, target_tokens)
                }
                None => gc::analyze(state.store.iter(), now, gc_config, target_tokens),
            };
            for id in &pass.survivors {
                state.store.record_survival(id)?;
            }
            Ok(pass)
        })?;

        self.metrics.record_gc_pass(pass.candidates.len());
        info!(
            project = %handle.id(),
            candidates = pass.candidates.len(),
            survivors = pass.survivors.len(),
            planned = pass.plan.as_ref().map_or(0, |p| p.len()),
            "gc pass complete"
        );
        Ok(GcAnalysis {
            candidates: pass.candidates,
            plan: pass.plan,
        })
    }

    /// Stash or delete the given working segments. Per-id failures are
    /// collected; deletion without `confirm` mutates nothing.
    pub fn gc_execute(
        &self,
        project: &str,
        segment_ids: &[SegmentId],
        action: GcAction,
        confirm: bool,
    ) -> Result<ExecuteResult> {
        if action == GcAction::Delete && !confirm {
            return Err(ContextError::ConfirmationRequired);
        }
        require_ids(segment_ids, "gc_execute")?;
        let handle = self.load_project(project, false)?;

        let result = self.mutate(&handle, |state, _now| {
            let mut result = ExecuteResult::default();
            for id in segment_ids {
                match execute_one(state, id, action) {
                    Ok(tokens) => {
                        result.affected.push(id.clone());
                        result.tokens_freed += tokens;
                    }
                    Err(e) => result.errors.push(ItemError::new(id.clone(), &e)),
                }
            }
            Ok(result)
        })?;

        match action {
            GcAction::Stash => self
                .metrics
                .record_stash(result.affected.len(), result.tokens_freed),
            GcAction::Delete => self
                .metrics
                .record_delete(result.affected.len(), result.tokens_freed),
        }
        info!(
            project = %handle.id(),
            ?action,
            affected = result.affected.len(),
            errors = result.errors.len(),
            tokens_freed = result.tokens_freed,
            "gc executed"
        );
        Ok(result)
    }

    /// Move matching working segments to the archive. Pinned segments match
    /// too; an explicit stash is allowed to move them.
    pub fn stash(
        &self,
        project: &str,
        query: Option<&str>,
        filter: Option<&SegmentFilter>,
    ) -> Result<StashResult> {
        validate_filter(filter)?;
        let handle = self.load_project(project, false)?;
        let text = query.unwrap_or("");

        let result = self.mutate(&handle, |state, _now| {
            let has_terms = !state.index.tokenizer().unique_terms(text).is_empty();
            if !has_terms && filter.map_or(true, |f| f.is_empty()) {
                return Err(ContextError::InvalidParameter(
                    "stash needs a query or a non-empty filter".to_string(),
                ));
            }

            let hits = KeywordQuery::new(text)
                .with_filter(filter)
                .in_tier(Tier::Working)
                .scan(
                    state.index.tokenizer(),
                    state.store.by_tier(Tier::Working),
                    usize::MAX,
                );
            let matched_count = hits.total_matches;
            let ids: Vec<SegmentId> = hits.segments.iter().map(|s| s.segment_id.clone()).collect();

            let mut result = StashResult {
                matched_count,
                ..Default::default()
            };
            for id in ids {
                let segment = state.move_to_archive(&id)?;
                result.tokens_freed += segment.tokens as u64;
                result.stashed_ids.push(id);
            }
            Ok(result)
        })?;

        self.metrics
            .record_stash(result.stashed_ids.len(), result.tokens_freed);
        info!(
            project = %handle.id(),
            stashed = result.stashed_ids.len(),
            tokens_freed = result.tokens_freed,
            "stashed segments"
        );
        Ok(result)
    }

    /// Read-only keyword search over the archive (and the working tier when it
    /// is indexed). `project = None` searches every open project.
    pub fn search(
        &self,
        project: Option<&str>,
        query: Option<&str>,
        filter: Option<&SegmentFilter>,
        limit: usize,
    ) -> Result<SearchResponse> {
        if limit == 0 {
            return Err(ContextError::InvalidParameter(
                "limit must be at least 1".to_string(),
            ));
        }
        validate_filter(filter)?;
        let start = Instant::now();
        let handles = match project {
            Some(project) => vec![self.load_project(project, false)?],
            None => {
                // Projects on disk count even if nothing touched them yet
                self.open_existing()?;
                self.projects.iter().map(|e| e.value().clone()).collect()
            }
        };

        let text = query.unwrap_or("");
        let mut segments = Vec::new();
        let mut total_matches = 0;
        for handle in &handles {
            let state = handle.state().read();
            let mut query = KeywordQuery::new(text).with_filter(filter);
            if !state.index_working_tier {
                query = query.in_tier(Tier::Stashed);
            }
            let hits = query.execute(&state.index, &state.store, limit);
            total_matches += hits.total_matches;
            segments.extend(hits.segments.into_iter().cloned());
        }
        segments.sort_by(recency_order);
        segments.truncate(limit);

        let elapsed = start.elapsed();
        self.metrics.record_search(elapsed.as_secs_f64());
        debug!(
            projects = handles.len(),
            total_matches,
            returned = segments.len(),
            "search"
        );
        Ok(SearchResponse {
            segments,
            total_matches,
            took_ms: elapsed.as_millis() as u64,
        })
    }

    /// Find archived segments; with `move_to_active` they are promoted to the
    /// working set (touched, referenced once more, deindexed). Without it the
    /// call is a pure read.
    pub fn retrieve(
        &self,
        project: &str,
        query: Option<&str>,
        filter: Option<&SegmentFilter>,
        move_to_active: bool,
    ) -> Result<RetrieveResult> {
        validate_filter(filter)?;
        let handle = self.load_project(project, false)?;
        let start = Instant::now();
        let keyword = KeywordQuery::new(query.unwrap_or(""))
            .with_filter(filter)
            .in_tier(Tier::Stashed);

        if !move_to_active {
            let state = handle.state().read();
            let found = keyword
                .execute(&state.index, &state.store, usize::MAX)
                .segments
                .into_iter()
                .cloned()
                .collect();
            self.metrics
                .record_retrieve(0, start.elapsed().as_secs_f64());
            return Ok(RetrieveResult {
                found,
                moved_ids: None,
            });
        }

        let (result, spilled) = self.mutate(&handle, |state, now| {
            let ids: Vec<SegmentId> = keyword
                .execute(&state.index, &state.store, usize::MAX)
                .segments
                .iter()
                .map(|s| s.segment_id.clone())
                .collect();

            let mut spilled = 0;
            for id in &ids {
                state.store.touch(id, now)?;
                state.store.add_reference(id)?;
                spilled += state.move_to_working(id)?.evicted.len();
            }
            let found = ids
                .iter()
                .map(|id| state.store.get(id).cloned())
                .collect::<Result<Vec<_>>>()?;
            Ok((
                RetrieveResult {
                    found,
                    moved_ids: Some(ids),
                },
                spilled,
            ))
        })?;

        let moved = result.moved_ids.as_ref().map_or(0, |ids| ids.len());
        self.metrics
            .record_retrieve(moved, start.elapsed().as_secs_f64());
        self.metrics.record_spills(spilled);
        info!(project = %handle.id(), moved, spilled, "retrieved to working set");
        Ok(result)
    }

    // ---- supplementary operations ----

    pub fn get(&self, project: &str, segment_id: &SegmentId) -> Result<Segment> {
        let handle = self.load_project(project, false)?;
        let state = handle.state().read();
        state.store.get(segment_id).cloned()
    }

    /// Permanently remove one segment from its tier, the index and its shard
    pub fn delete(&self, project: &str, segment_id: &SegmentId, confirm: bool) -> Result<Segment> {
        if !confirm {
            return Err(ContextError::ConfirmationRequired);
        }
        let handle = self.load_project(project, false)?;
        let segment = self.mutate(&handle, |state, _now| state.delete(segment_id))?;
        let freed = if segment.is_working() {
            segment.tokens as u64
        } else {
            0
        };
        self.metrics.record_delete(1, freed);
        info!(project = %handle.id(), segment_id = %segment_id, "deleted segment");
        Ok(segment)
    }

    /// Record external citations; raises `refcount` by one per id
    pub fn reference(&self, project: &str, segment_ids: &[SegmentId]) -> Result<BatchResult> {
        require_ids(segment_ids, "reference")?;
        let handle = self.load_project(project, false)?;
        self.mutate(&handle, |state, _now| {
            let mut result = BatchResult::default();
            for id in segment_ids {
                match state.store.add_reference(id) {
                    Ok(_) => result.updated.push(id.clone()),
                    Err(e) => result.errors.push(ItemError::new(id.clone(), &e)),
                }
            }
            Ok(result)
        })
    }

    /// Working-tier membership for one task scope, or the whole project when
    /// `task` is `None`. Ids are least recently used first within each scope.
    pub fn working_set(&self, project: &str, task: Option<&str>) -> Result<WorkingSetView> {
        let handle = self.load_project(project, false)?;
        let state = handle.state().read();
        let scopes = match task_id(task)? {
            Some(task) => vec![Scope {
                project_id: handle.id().clone(),
                task_id: Some(task),
            }],
            None => state.cache.scopes(),
        };

        let mut view = WorkingSetView {
            segment_ids: Vec::new(),
            total_tokens: 0,
            capacity: state.cache.capacity(),
            over_capacity: false,
        };
        for scope in &scopes {
            view.over_capacity |= state.cache.is_over_capacity(scope);
            for id in state.cache.scope_ids(scope) {
                view.total_tokens += state.store.get(&id)?.tokens as u64;
                view.segment_ids.push(id);
            }
        }
        Ok(view)
    }

    /// Flush pending shards and persist the index snapshot
    pub fn checkpoint(&self, project: &str) -> Result<()> {
        self.load_project(project, false)?.checkpoint()
    }

    /// Checkpoint every open project
    pub fn checkpoint_all(&self) -> Result<usize> {
        let handles: Vec<Arc<ProjectHandle>> =
            self.projects.iter().map(|e| e.value().clone()).collect();
        for handle in &handles {
            handle.checkpoint()?;
        }
        Ok(handles.len())
    }

    /// Drop every posting and re-index from the canonical records
    pub fn rebuild_index(&self, project: &str) -> Result<usize> {
        let handle = self.load_project(project, false)?;
        let _ops = handle.lock_ops();
        let count = handle.state().write().rebuild_index()?;
        // The next checkpoint writes a fresh snapshot; never reload the old one
        handle.archive().discard_index()?;
        self.metrics.record_rebuild("requested");
        info!(project = %handle.id(), indexed = count, "index rebuilt on request");
        Ok(count)
    }

    pub fn stats(&self, project: &str) -> Result<ProjectStats> {
        let handle = self.load_project(project, false)?;
        let state = handle.state().read();
        let mut stats = ProjectStats {
            indexed_segments: state.index.len(),
            indexed_terms: state.index.term_count(),
            shard_count: state.store.shard_count() as usize,
            ..Default::default()
        };
        for segment in state.store.iter() {
            if segment.pinned {
                stats.pinned_segments += 1;
            }
            match segment.tier {
                Tier::Working => {
                    stats.working_segments += 1;
                    stats.working_tokens += segment.tokens as u64;
                }
                Tier::Stashed => {
                    stats.stashed_segments += 1;
                    stats.stashed_tokens += segment.tokens as u64;
                }
            }
        }
        Ok(stats)
    }
}

impl ContextEngine {
    /// Make the next `attempts` file writes in `project` abort before rename
    #[cfg(any(test, feature = "testing"))]
    pub fn inject_crash_before_rename(&self, project: &str, attempts: u32) -> Result<()> {
        let handle = self.load_project(project, false)?;
        handle.archive().writer().crash_before_rename(attempts);
        Ok(())
    }
}

impl Drop for ContextEngine {
    fn drop(&mut self) {
        for entry in self.projects.iter() {
            if let Err(e) = entry.value().checkpoint() {
                warn!(project = %entry.key(), error = %e, "checkpoint on shutdown failed");
            }
        }
    }
}

fn tier_counts(state: &ProjectState) -> (usize, usize) {
    let stashed = state.store.stashed_len();
    (state.store.len() - stashed, stashed)
}

/// Apply one gc action; returns working-tier tokens freed
fn execute_one(state: &mut ProjectState, segment_id: &SegmentId, action: GcAction) -> Result<u64> {
    let segment = state.store.get(segment_id)?;
    if segment.pinned {
        return Err(ContextError::PinnedSegment(segment_id.to_string()));
    }
    match action {
        GcAction::Stash => {
            if !segment.is_working() {
                return Err(ContextError::InvalidParameter(format!(
                    "segment {} is already stashed",
                    segment_id
                )));
            }
            Ok(state.move_to_archive(segment_id)?.tokens as u64)
        }
        GcAction::Delete => {
            let segment = state.delete(segment_id)?;
            Ok(if segment.is_working() {
                segment.tokens as u64
            } else {
                0
            })
        }
    }
}
