use std::collections::HashSet;
use std::time::Instant;

use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::{debug, info, warn};

use crate::cache::{InsertOutcome, WorkingSetCache};
use crate::config::StoreSettings;
use crate::index::InvertedIndex;
use crate::metrics::ContextMetrics;
use crate::models::{ProjectId, Segment, SegmentId, Tier};
use crate::persistence::{frame, IndexMarker, ShardedArchive};
use crate::store::{SegmentStore, ShardSnapshot};
use crate::tokenizer::{Tokenizer, TOKENIZER_VERSION};
use crate::Result;

/// Mutable in-memory state of one project
#[derive(Debug)]
pub struct ProjectState {
    pub store: SegmentStore,
    pub cache: WorkingSetCache,
    pub index: InvertedIndex,
    /// Mirrors `StoreSettings::index_working_tier`
    pub index_working_tier: bool,
}

impl ProjectState {
    fn new(settings: &StoreSettings) -> Self {
        Self {
            store: SegmentStore::new(settings.shard_count),
            cache: WorkingSetCache::new(settings.working_set_capacity),
            index: InvertedIndex::new(Tokenizer::new(&settings.tokenizer)),
            index_working_tier: settings.index_working_tier,
        }
    }

    fn should_index(&self, segment: &Segment) -> bool {
        segment.tier == Tier::Stashed || self.index_working_tier
    }

    /// Ids the index is expected to cover
    pub fn expected_indexed(&self) -> HashSet<&SegmentId> {
        self.store
            .iter()
            .filter(|s| self.should_index(s))
            .map(|s| &s.segment_id)
            .collect()
    }

    /// Rebuild postings from the canonical records
    pub fn rebuild_index(&mut self) -> Result<usize> {
        let index_working_tier = self.index_working_tier;
        let segments = self
            .store
            .iter()
            .filter(|s| s.tier == Tier::Stashed || index_working_tier);
        self.index.rebuild(segments)
    }

    /// Add a brand-new working segment
    pub fn add_working(&mut self, segment: Segment) -> Result<InsertOutcome> {
        let id = segment.segment_id.clone();
        self.store.insert(segment)?;
        self.place_in_working(&id)
    }

    /// Insert (or promote) a working-tier record into the cache, spilling victims
    fn place_in_working(&mut self, segment_id: &SegmentId) -> Result<InsertOutcome> {
        let segment = self.store.get(segment_id)?;
        if self.index_working_tier {
            self.index.index(segment)?;
        }
        let store = &self.store;
        let outcome = self
            .cache
            .insert(segment, |id| store.get(id).map(|s| s.pinned).unwrap_or(false));
        if outcome.over_capacity {
            warn!(
                segment_id = %segment_id,
                members = self.cache.scope_len(&segment.scope()),
                capacity = self.cache.capacity(),
                "working-set scope over capacity; every other member is pinned"
            );
        }
        for victim in &outcome.evicted {
            self.move_to_archive(victim)?;
            debug!(segment_id = %victim, "spilled to archive");
        }
        Ok(outcome)
    }

    /// Working -> stashed: leave the cache, join a shard, get indexed
    pub fn move_to_archive(&mut self, segment_id: &SegmentId) -> Result<&Segment> {
        self.cache.remove(segment_id);
        let segment = self.store.set_tier(segment_id, Tier::Stashed)?;
        self.index.index(segment)?;
        Ok(segment)
    }

    /// Stashed -> working; the outcome lists ids spilled to make room
    pub fn move_to_working(&mut self, segment_id: &SegmentId) -> Result<InsertOutcome> {
        self.store.set_tier(segment_id, Tier::Working)?;
        if !self.index_working_tier {
            self.index.deindex(segment_id);
        }
        self.place_in_working(segment_id)
    }

    /// Remove a record from every structure
    pub fn delete(&mut self, segment_id: &SegmentId) -> Result<Segment> {
        let segment = self.store.remove(segment_id)?;
        self.cache.remove(segment_id);
        self.index.deindex(segment_id);
        Ok(segment)
    }

    /// Re-run eviction for every scope, e.g. after unpinning
    pub fn enforce_capacity(&mut self) -> Result<Vec<SegmentId>> {
        let mut spilled = Vec::new();
        for scope in self.cache.scopes() {
            if !self.cache.is_over_capacity(&scope) {
                continue;
            }
            let store = &self.store;
            let outcome = self
                .cache
                .enforce(&scope, |id| store.get(id).map(|s| s.pinned).unwrap_or(false));
            for victim in &outcome.evicted {
                self.move_to_archive(victim)?;
            }
            spilled.extend(outcome.evicted);
        }
        Ok(spilled)
    }
}

/// Everything one project owns: per-project op serialization, in-memory
/// state and the on-disk shard set.
pub struct ProjectHandle {
    id: ProjectId,
    op_lock: Mutex<()>,
    state: RwLock<ProjectState>,
    archive: ShardedArchive,
    settings: StoreSettings,
    metrics: ContextMetrics,
}

impl ProjectHandle {
    /// Load a project directory, creating it if needed
    pub fn open(id: ProjectId, settings: &StoreSettings, metrics: ContextMetrics) -> Result<Self> {
        let dir = settings.project_dir(id.as_str());
        let (archive, load) = ShardedArchive::open(&dir, settings.shard_count)?;

        let mut state = ProjectState::new(settings);
        let reshard = load.misplaced > 0 || !load.orphan_shards.is_empty();
        let orphans = load.orphan_shards.clone();
        for (shard, path) in load.corrupt_shards.iter().zip(&load.quarantined) {
            warn!(
                project = %id,
                shard,
                quarantined = %path.display(),
                "shard unreadable at open; its segments are unavailable"
            );
        }
        state.store.load(load.segments);

        // Oldest first so the most recent land at the front of the LRU
        let mut working: Vec<&Segment> = state.store.by_tier(Tier::Working).collect();
        working.sort_by(|a, b| {
            (a.last_touched_at, a.created_at, &a.segment_id)
                .cmp(&(b.last_touched_at, b.created_at, &b.segment_id))
        });
        let working_ids: Vec<SegmentId> = working.iter().map(|s| s.segment_id.clone()).collect();

        let handle = Self {
            id,
            op_lock: Mutex::new(()),
            state: RwLock::new(state),
            archive,
            settings: settings.clone(),
            metrics,
        };

        {
            let mut state = handle.state.write();
            handle.recover_index(&mut state)?;
            let mut spilled = 0;
            for id in &working_ids {
                spilled += state.place_in_working(id)?.evicted.len();
            }
            if spilled > 0 {
                info!(project = %handle.id, spilled, "working set above capacity at open");
                handle.metrics.record_spills(spilled);
            }
            if reshard {
                info!(
                    project = %handle.id,
                    shard_count = settings.shard_count,
                    "rewriting shards for new shard count"
                );
                state.store.mark_all_dirty();
            }
            handle
                .metrics
                .adjust_tier("working", state.cache.len() as f64);
            handle
                .metrics
                .adjust_tier("stashed", state.store.stashed_len() as f64);
        }

        handle.flush_dirty()?;
        for shard in orphans {
            handle.archive.remove_shard_file(shard)?;
        }

        info!(project = %handle.id, dir = %dir.display(), "project opened");
        Ok(handle)
    }

    pub fn id(&self) -> &ProjectId {
        &self.id
    }

    pub fn archive(&self) -> &ShardedArchive {
        &self.archive
    }

    pub fn settings(&self) -> &StoreSettings {
        &self.settings
    }

    fn expected_marker(&self, tokenizer: &Tokenizer) -> IndexMarker {
        IndexMarker {
            tokenizer_version: TOKENIZER_VERSION,
            tokenizer_fingerprint: tokenizer.fingerprint(),
            format_version: frame::FORMAT_VERSION,
            shard_count: self.settings.shard_count,
            index_working_tier: self.settings.index_working_tier,
        }
    }

    /// Use the persisted index when it is trustworthy, otherwise rebuild
    fn recover_index(&self, state: &mut ProjectState) -> Result<()> {
        let expected = self.expected_marker(state.index.tokenizer());
        let cause = match self.try_restore_index(state, &expected) {
            Ok(()) => {
                debug!(project = %self.id, indexed = state.index.len(), "index restored from snapshot");
                return Ok(());
            }
            Err(cause) => cause,
        };

        let count = state.rebuild_index()?;
        if let Some(cause) = cause {
            warn!(project = %self.id, cause = %cause, indexed = count, "index rebuilt");
            self.metrics.record_rebuild(cause.label());
        }
        Ok(())
    }

    /// `Err(None)` means there was nothing to restore and nothing is wrong
    fn try_restore_index(
        &self,
        state: &mut ProjectState,
        expected: &IndexMarker,
    ) -> std::result::Result<(), Option<RebuildCause>> {
        let marker = self
            .archive
            .load_marker()
            .map_err(|e| Some(RebuildCause::Unreadable(e.to_string())))?;
        let snapshot = self
            .archive
            .load_index()
            .map_err(|e| Some(RebuildCause::Unreadable(e.to_string())))?;

        let (marker, snapshot) = match (marker, snapshot) {
            (Some(marker), Some(snapshot)) => (marker, snapshot),
            (None, None) if state.expected_indexed().is_empty() => return Err(None),
            _ => return Err(Some(RebuildCause::Missing)),
        };
        if marker != *expected {
            return Err(Some(RebuildCause::MarkerMismatch(format!(
                "{:?} != {:?}",
                marker, expected
            ))));
        }

        let tokenizer = state.index.tokenizer().clone();
        let index = InvertedIndex::restore(tokenizer, snapshot)
            .map_err(|e| Some(RebuildCause::Inconsistent(e.to_string())))?;
        index
            .verify(&state.expected_indexed())
            .map_err(|e| Some(RebuildCause::Inconsistent(e.to_string())))?;
        state.index = index;
        Ok(())
    }

    /// Serialize mutating operations on this project
    pub fn lock_ops(&self) -> MutexGuard<'_, ()> {
        self.op_lock.lock()
    }

    pub fn state(&self) -> &RwLock<ProjectState> {
        &self.state
    }

    /// Write shard snapshots outside the state lock.
    ///
    /// Failed shards are marked dirty again so the next mutation retries them.
    pub fn persist(&self, shards: Vec<ShardSnapshot>) -> Result<()> {
        if shards.is_empty() {
            return Ok(());
        }
        let start = Instant::now();
        let result = self.archive.persist(&shards);
        self.metrics
            .record_shard_write(start.elapsed().as_secs_f64(), result.is_ok());
        if result.is_err() {
            let mut state = self.state.write();
            for (shard, _) in &shards {
                state.store.mark_dirty(*shard);
            }
        }
        result
    }

    /// Drain and persist whatever is dirty
    pub fn flush_dirty(&self) -> Result<()> {
        let dirty = self.state.write().store.take_dirty_shards();
        self.persist(dirty)
    }

    /// Flush pending shards, then persist the index snapshot and its marker.
    ///
    /// Both tiers already live in the shard files; only the index is
    /// checkpoint-only.
    pub fn checkpoint(&self) -> Result<()> {
        let _ops = self.lock_ops();
        let (working, snapshot, marker, dirty) = {
            let mut state = self.state.write();
            let working = state.cache.len();
            let snapshot = state.index.snapshot()?;
            let marker = self.expected_marker(state.index.tokenizer());
            (working, snapshot, marker, state.store.take_dirty_shards())
        };

        self.persist(dirty)?;
        self.archive.save_index(&snapshot)?;
        // Marker last: a crash before this leaves the old marker, forcing a verified load
        self.archive.save_marker(&marker)?;
        info!(
            project = %self.id,
            working,
            indexed = snapshot.ids.len(),
            "checkpoint written"
        );
        Ok(())
    }
}

impl std::fmt::Debug for ProjectHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectHandle")
            .field("id", &self.id)
            .field("dir", &self.archive.dir())
            .finish()
    }
}

#[derive(Debug)]
enum RebuildCause {
    Missing,
    Unreadable(String),
    MarkerMismatch(String),
    Inconsistent(String),
}

impl RebuildCause {
    fn label(&self) -> &'static str {
        match self {
            RebuildCause::Missing => "missing",
            RebuildCause::Unreadable(_) => "unreadable",
            RebuildCause::MarkerMismatch(_) => "marker_mismatch",
            RebuildCause::Inconsistent(_) => "inconsistent",
        }
    }
}

impl std::fmt::Display for RebuildCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RebuildCause::Missing => f.write_str("no persisted index"),
            RebuildCause::Unreadable(e) => write!(f, "persisted index unreadable: {}", e),
            RebuildCause::MarkerMismatch(e) => write!(f, "index marker mismatch: {}", e),
            RebuildCause::Inconsistent(e) => write!(f, "{}", e),
        }
    }
}
