//! Per-project engine: ties the segment store, working-set cache, inverted
//! index and shard archive together behind one operation surface.
//!
//! Mutations take the project's op lock, change in-memory state under the
//! state write lock, and only write shard files once that lock is released.

mod context;
#[cfg(any(test, feature = "testing"))]
mod instrumented;
mod project;

pub use context::{ContextEngine, ContextEngineBuilder};
#[cfg(any(test, feature = "testing"))]
pub use instrumented::InstrumentedEngine;
pub use project::{ProjectHandle, ProjectState};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::StoreSettings;
    use crate::error::ContextError;
    use crate::models::*;
    use crate::persistence::{shard_file_name, shard_for};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn engine(dir: &TempDir, capacity: usize) -> (ContextEngine, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let settings = StoreSettings::new(dir.path())
            .with_capacity(capacity)
            .with_shard_count(4);
        let engine = ContextEngine::builder(settings)
            .with_clock(clock.clone())
            .with_token_counter(|text: &str| text.split_whitespace().count() as u32)
            .build()
            .unwrap();
        (engine, clock)
    }

    fn ingest(engine: &ContextEngine, text: &str) -> Segment {
        engine
            .ingest("proj", IngestRequest::new(text, SegmentType::Note))
            .unwrap()
            .segment
    }

    #[test]
    fn test_injected_counter_sets_tokens() {
        let dir = TempDir::new().unwrap();
        let (engine, _) = engine(&dir, 10);
        let seg = ingest(&engine, "one two three");
        assert_eq!(seg.tokens, 3);
        assert_eq!(seg.tokens_computed_at, seg.created_at);
    }

    #[test]
    fn test_unknown_project_is_not_found() {
        let dir = TempDir::new().unwrap();
        let (engine, _) = engine(&dir, 10);
        let err = engine.stats("nobody").unwrap_err();
        assert!(matches!(err, ContextError::NotFound { kind: "Project", .. }));
        assert!(engine.list_projects().is_empty());
    }

    #[test]
    fn test_spilled_segment_lands_in_its_shard() {
        let dir = TempDir::new().unwrap();
        let (engine, clock) = engine(&dir, 1);
        let first = ingest(&engine, "first note");
        clock.advance_hours(1);
        let result = engine
            .ingest("proj", IngestRequest::new("second note", SegmentType::Note))
            .unwrap();
        assert_eq!(result.spilled, vec![first.segment_id.clone()]);

        let shard = shard_for(&first.segment_id, 4);
        let path = dir.path().join("proj").join(shard_file_name(shard));
        assert!(path.exists());
        assert_eq!(engine.get("proj", &first.segment_id).unwrap().tier, Tier::Stashed);
    }

    #[test]
    fn test_crash_before_rename_keeps_previous_shard() {
        let dir = TempDir::new().unwrap();
        let (engine, clock) = engine(&dir, 10);
        let seg = ingest(&engine, "deploy log");
        engine.stash("proj", Some("deploy"), None).unwrap();

        // Both the write and its retry abort
        engine.inject_crash_before_rename("proj", 2).unwrap();
        clock.advance_hours(1);
        let err = engine.touch("proj", &seg.segment_id).unwrap_err();
        assert!(matches!(err, ContextError::StorageFailure { .. }));

        // Simulated process death: no shutdown checkpoint
        std::mem::forget(engine);

        let (reopened, _) = self::engine(&dir, 10);
        let loaded = reopened.get("proj", &seg.segment_id).unwrap();
        assert_eq!(loaded.tier, Tier::Stashed);
        assert_eq!(loaded.last_touched_at, seg.last_touched_at);
        assert_eq!(reopened.stats("proj").unwrap().stashed_segments, 1);
    }

    #[test]
    fn test_failed_shard_write_is_retried_by_next_mutation() {
        let dir = TempDir::new().unwrap();
        let (engine, clock) = engine(&dir, 10);
        let seg = ingest(&engine, "flaky disk");
        engine.stash("proj", Some("flaky"), None).unwrap();

        engine.inject_crash_before_rename("proj", 2).unwrap();
        clock.advance_hours(2);
        assert!(engine.touch("proj", &seg.segment_id).is_err());

        // Next mutation drains the still-dirty shard
        engine.reference("proj", &[seg.segment_id.clone()]).unwrap();
        std::mem::forget(engine);

        let (reopened, _) = self::engine(&dir, 10);
        let loaded = reopened.get("proj", &seg.segment_id).unwrap();
        assert_eq!(loaded.refcount, 1);
        assert!(loaded.last_touched_at > seg.last_touched_at);
    }

    #[test]
    fn test_working_tier_restored_after_checkpoint() {
        let dir = TempDir::new().unwrap();
        let seg = {
            let (engine, _) = engine(&dir, 10);
            let seg = ingest(&engine, "keep me around");
            engine.pin("proj", &[seg.segment_id.clone()]).unwrap();
            engine.checkpoint("proj").unwrap();
            seg
        };

        let (engine, _) = engine(&dir, 10);
        let loaded = engine.get("proj", &seg.segment_id).unwrap();
        assert_eq!(loaded.tier, Tier::Working);
        assert!(loaded.pinned);
        let view = engine.working_set("proj", None).unwrap();
        assert_eq!(view.segment_ids, vec![seg.segment_id]);
    }

    #[test]
    fn test_working_tier_survives_crash_without_checkpoint() {
        let dir = TempDir::new().unwrap();
        let (engine, clock) = engine(&dir, 10);
        let mut ids = Vec::new();
        for i in 0..5 {
            clock.advance_hours(1);
            ids.push(ingest(&engine, &format!("unsaved note {}", i)).segment_id);
        }
        engine.pin("proj", &[ids[0].clone()]).unwrap();
        std::mem::forget(engine);

        let (reopened, _) = self::engine(&dir, 10);
        for id in &ids {
            assert_eq!(reopened.get("proj", id).unwrap().tier, Tier::Working);
        }
        assert!(reopened.get("proj", &ids[0]).unwrap().pinned);
        // Recency order survives, least recent first
        let view = reopened.working_set("proj", None).unwrap();
        assert_eq!(view.segment_ids, ids);
        assert_eq!(reopened.stats("proj").unwrap().stashed_segments, 0);
    }

    #[test]
    fn test_stale_index_after_crash_is_rebuilt() {
        let dir = TempDir::new().unwrap();
        let (engine, _) = engine(&dir, 10);
        ingest(&engine, "first release notes");
        engine.stash("proj", Some("release"), None).unwrap();
        engine.checkpoint("proj").unwrap();
        ingest(&engine, "second release notes");
        engine.stash("proj", Some("second"), None).unwrap();
        std::mem::forget(engine);

        let (reopened, _) = self::engine(&dir, 10);
        let hits = reopened.search(Some("proj"), Some("release"), None, 10).unwrap();
        assert_eq!(hits.total_matches, 2);
        let rebuilds = reopened
            .metrics()
            .index_rebuilds
            .with_label_values(&["inconsistent"])
            .get();
        assert_eq!(rebuilds, 1.0);
    }

    #[test]
    fn test_stale_marker_triggers_rebuild() {
        let dir = TempDir::new().unwrap();
        {
            let (engine, _) = engine(&dir, 10);
            ingest(&engine, "archived build output");
            engine.stash("proj", Some("build"), None).unwrap();
            engine.checkpoint("proj").unwrap();
        }

        let marker = dir.path().join("proj").join("index.marker.json");
        let mut json: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&marker).unwrap()).unwrap();
        json["tokenizer_version"] = serde_json::json!(0);
        std::fs::write(&marker, serde_json::to_vec(&json).unwrap()).unwrap();

        let (engine, _) = engine(&dir, 10);
        let hits = engine.search(Some("proj"), Some("build"), None, 10).unwrap();
        assert_eq!(hits.total_matches, 1);
        let rebuilds = engine
            .metrics()
            .index_rebuilds
            .with_label_values(&["marker_mismatch"])
            .get();
        assert_eq!(rebuilds, 1.0);
    }

    #[test]
    fn test_shard_count_change_rewrites_shards() {
        let dir = TempDir::new().unwrap();
        let ids: Vec<SegmentId> = {
            let (engine, _) = engine(&dir, 10);
            let ids = (0..8)
                .map(|i| ingest(&engine, &format!("note number {}", i)).segment_id)
                .collect();
            engine.stash("proj", Some("note"), None).unwrap();
            ids
        };

        let settings = StoreSettings::new(dir.path())
            .with_capacity(10)
            .with_shard_count(2);
        let engine = ContextEngine::new(settings).unwrap();
        for id in &ids {
            assert_eq!(engine.get("proj", id).unwrap().tier, Tier::Stashed);
        }
        let project_dir = dir.path().join("proj");
        assert!(!project_dir.join(shard_file_name(3)).exists());
        assert_eq!(engine.search(Some("proj"), Some("note"), None, 20).unwrap().total_matches, 8);
    }
}
