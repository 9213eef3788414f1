//! Canonical per-project segment records for both tiers.
//!
//! Every record lives in the shard its id routes to, whatever its tier, so
//! the shard files alone are enough to rebuild the working set and the
//! archive. Any mutation marks the record's shard dirty; the engine drains
//! dirty shards as snapshots after releasing the state lock and hands them
//! to the archive for writing.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};

use crate::error::ContextError;
use crate::models::{Scope, Segment, SegmentId, Tier};
use crate::persistence::shard_for;
use crate::Result;

/// Full contents of one shard, ready to be written
pub type ShardSnapshot = (u32, Vec<Segment>);

#[derive(Debug)]
pub struct SegmentStore {
    records: HashMap<SegmentId, Segment>,
    shard_count: u32,
    /// Ids per shard, ordered by id
    by_shard: Vec<BTreeSet<SegmentId>>,
    stashed: usize,
    dirty: BTreeSet<u32>,
}

impl SegmentStore {
    pub fn new(shard_count: u32) -> Self {
        let shard_count = shard_count.max(1);
        Self {
            records: HashMap::new(),
            shard_count,
            by_shard: vec![BTreeSet::new(); shard_count as usize],
            stashed: 0,
            dirty: BTreeSet::new(),
        }
    }

    pub fn shard_count(&self) -> u32 {
        self.shard_count
    }

    pub fn shard_of(&self, segment_id: &SegmentId) -> u32 {
        shard_for(segment_id, self.shard_count)
    }

    fn attach(&mut self, segment: Segment) -> u32 {
        let shard = self.shard_of(&segment.segment_id);
        self.by_shard[shard as usize].insert(segment.segment_id.clone());
        if segment.tier == Tier::Stashed {
            self.stashed += 1;
        }
        self.records.insert(segment.segment_id.clone(), segment);
        shard
    }

    fn detach(&mut self, segment_id: &SegmentId) -> Option<(u32, Segment)> {
        let segment = self.records.remove(segment_id)?;
        let shard = self.shard_of(segment_id);
        self.by_shard[shard as usize].remove(segment_id);
        if segment.tier == Tier::Stashed {
            self.stashed -= 1;
        }
        Some((shard, segment))
    }

    /// Add a new record and dirty its shard
    pub fn insert(&mut self, segment: Segment) -> Result<()> {
        if self.records.contains_key(&segment.segment_id) {
            return Err(ContextError::InvalidParameter(format!(
                "duplicate segment id {}",
                segment.segment_id
            )));
        }
        let shard = self.attach(segment);
        self.dirty.insert(shard);
        Ok(())
    }

    /// Replace records loaded from disk without marking anything dirty.
    ///
    /// Later entries win over earlier ones with the same id.
    pub fn load(&mut self, segments: impl IntoIterator<Item = Segment>) {
        for segment in segments {
            self.detach(&segment.segment_id);
            self.attach(segment);
        }
    }

    pub fn get(&self, segment_id: &SegmentId) -> Result<&Segment> {
        self.records
            .get(segment_id)
            .ok_or_else(|| ContextError::segment_not_found(segment_id.as_str()))
    }

    /// Mutate a record in place. The tier must not change through this path;
    /// use [`SegmentStore::set_tier`].
    pub fn update<F>(&mut self, segment_id: &SegmentId, f: F) -> Result<&Segment>
    where
        F: FnOnce(&mut Segment),
    {
        let shard = self.shard_of(segment_id);
        let segment = self
            .records
            .get_mut(segment_id)
            .ok_or_else(|| ContextError::segment_not_found(segment_id.as_str()))?;
        let tier = segment.tier;
        f(segment);
        segment.tier = tier;
        self.dirty.insert(shard);
        Ok(segment)
    }

    pub fn touch(&mut self, segment_id: &SegmentId, at: DateTime<Utc>) -> Result<&Segment> {
        self.update(segment_id, |s| s.touch(at))
    }

    /// Returns whether the flag changed
    pub fn set_pinned(&mut self, segment_id: &SegmentId, pinned: bool) -> Result<bool> {
        if self.get(segment_id)?.pinned == pinned {
            return Ok(false);
        }
        self.update(segment_id, |s| s.pinned = pinned)?;
        Ok(true)
    }

    pub fn add_reference(&mut self, segment_id: &SegmentId) -> Result<&Segment> {
        self.update(segment_id, |s| s.add_reference())
    }

    pub fn record_survival(&mut self, segment_id: &SegmentId) -> Result<&Segment> {
        self.update(segment_id, |s| s.record_survival())
    }

    /// Move a record between tiers, keeping the stashed count in sync
    pub fn set_tier(&mut self, segment_id: &SegmentId, tier: Tier) -> Result<&Segment> {
        let shard = self.shard_of(segment_id);
        let segment = self
            .records
            .get_mut(segment_id)
            .ok_or_else(|| ContextError::segment_not_found(segment_id.as_str()))?;
        if segment.tier != tier {
            segment.tier = tier;
            match tier {
                Tier::Stashed => self.stashed += 1,
                Tier::Working => self.stashed -= 1,
            }
            self.dirty.insert(shard);
        }
        Ok(segment)
    }

    /// Delete a record. Pinned records are refused.
    pub fn remove(&mut self, segment_id: &SegmentId) -> Result<Segment> {
        if self.get(segment_id)?.pinned {
            return Err(ContextError::PinnedSegment(segment_id.to_string()));
        }
        let (shard, segment) = self
            .detach(segment_id)
            .ok_or_else(|| ContextError::segment_not_found(segment_id.as_str()))?;
        self.dirty.insert(shard);
        Ok(segment)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Segment> {
        self.records.values()
    }

    pub fn by_tier(&self, tier: Tier) -> impl Iterator<Item = &Segment> {
        self.records.values().filter(move |s| s.tier == tier)
    }

    /// Working-tier members of a scope
    pub fn in_scope<'a>(&'a self, scope: &'a Scope) -> impl Iterator<Item = &'a Segment> {
        self.records
            .values()
            .filter(move |s| s.tier == Tier::Working && s.scope() == *scope)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn stashed_len(&self) -> usize {
        self.stashed
    }

    /// Records of one shard, both tiers, sorted by id
    pub fn shard_contents(&self, shard: u32) -> Vec<Segment> {
        self.by_shard
            .get(shard as usize)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.records.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn mark_dirty(&mut self, shard: u32) {
        if shard < self.shard_count {
            self.dirty.insert(shard);
        }
    }

    pub fn mark_all_dirty(&mut self) {
        self.dirty.extend(0..self.shard_count);
    }

    /// Drain dirty shards as full snapshots
    pub fn take_dirty_shards(&mut self) -> Vec<ShardSnapshot> {
        let dirty = std::mem::take(&mut self.dirty);
        dirty
            .into_iter()
            .map(|shard| (shard, self.shard_contents(shard)))
            .collect()
    }
}
