//! Capacity-bounded working set with LRU spill.
//!
//! The cache only tracks ids and recency; segment records live in the
//! `SegmentStore`. Victims are handed back to the caller, which moves them to
//! the archive. Pinned membership is supplied by the caller at eviction time
//! so the cache never holds a second copy of the pin flag.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};

use crate::models::{Scope, Segment, SegmentId};

/// Eviction order key: least recently touched first, then oldest created,
/// then segment id.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct RecencyKey {
    last_touched_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    segment_id: SegmentId,
}

impl RecencyKey {
    fn of(segment: &Segment) -> Self {
        Self {
            last_touched_at: segment.last_touched_at,
            created_at: segment.created_at,
            segment_id: segment.segment_id.clone(),
        }
    }
}

/// What an insert or enforcement pass did to a scope
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InsertOutcome {
    /// Victims in eviction order; the caller must spill them
    pub evicted: Vec<SegmentId>,
    /// Scope stays above capacity because every other member is pinned
    pub over_capacity: bool,
}

/// Working-tier membership, bounded per (project, task) scope
#[derive(Debug)]
pub struct WorkingSetCache {
    capacity: usize,
    scopes: HashMap<Scope, BTreeSet<RecencyKey>>,
    members: HashMap<SegmentId, (Scope, RecencyKey)>,
}

impl WorkingSetCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            scopes: HashMap::new(),
            members: HashMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Add or promote a segment to most-recently-used, then evict unpinned
    /// least-recently-touched members until the scope fits.
    ///
    /// The inserted segment itself is never chosen as a victim.
    pub fn insert<F>(&mut self, segment: &Segment, is_pinned: F) -> InsertOutcome
    where
        F: Fn(&SegmentId) -> bool,
    {
        self.remove(&segment.segment_id);

        let scope = segment.scope();
        let key = RecencyKey::of(segment);
        self.scopes
            .entry(scope.clone())
            .or_default()
            .insert(key.clone());
        self.members
            .insert(segment.segment_id.clone(), (scope.clone(), key));

        self.evict_over_capacity(&scope, Some(&segment.segment_id), is_pinned)
    }

    /// Re-run eviction for a scope, e.g. after members were unpinned
    pub fn enforce<F>(&mut self, scope: &Scope, is_pinned: F) -> InsertOutcome
    where
        F: Fn(&SegmentId) -> bool,
    {
        self.evict_over_capacity(scope, None, is_pinned)
    }

    fn evict_over_capacity<F>(
        &mut self,
        scope: &Scope,
        protect: Option<&SegmentId>,
        is_pinned: F,
    ) -> InsertOutcome
    where
        F: Fn(&SegmentId) -> bool,
    {
        let mut outcome = InsertOutcome::default();
        loop {
            let Some(order) = self.scopes.get(scope) else {
                return outcome;
            };
            if order.len() <= self.capacity {
                return outcome;
            }
            let victim = order
                .iter()
                .find(|k| Some(&k.segment_id) != protect && !is_pinned(&k.segment_id))
                .map(|k| k.segment_id.clone());
            match victim {
                Some(id) => {
                    self.remove(&id);
                    outcome.evicted.push(id);
                }
                None => {
                    outcome.over_capacity = true;
                    return outcome;
                }
            }
        }
    }

    /// Update recency for a member; no-op for unknown ids
    pub fn touch(&mut self, segment_id: &SegmentId, at: DateTime<Utc>) -> bool {
        let Some((scope, key)) = self.members.get_mut(segment_id) else {
            return false;
        };
        if at <= key.last_touched_at {
            return true;
        }
        if let Some(order) = self.scopes.get_mut(scope) {
            order.remove(key);
            key.last_touched_at = at;
            order.insert(key.clone());
        }
        true
    }

    /// Drop a member without spilling it
    pub fn remove(&mut self, segment_id: &SegmentId) -> bool {
        let Some((scope, key)) = self.members.remove(segment_id) else {
            return false;
        };
        if let Some(order) = self.scopes.get_mut(&scope) {
            order.remove(&key);
            if order.is_empty() {
                self.scopes.remove(&scope);
            }
        }
        true
    }

    pub fn contains(&self, segment_id: &SegmentId) -> bool {
        self.members.contains_key(segment_id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn scope_len(&self, scope: &Scope) -> usize {
        self.scopes.get(scope).map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_over_capacity(&self, scope: &Scope) -> bool {
        self.scope_len(scope) > self.capacity
    }

    /// Members of a scope, least recently touched first
    pub fn scope_ids(&self, scope: &Scope) -> Vec<SegmentId> {
        self.scopes
            .get(scope)
            .map(|order| order.iter().map(|k| k.segment_id.clone()).collect())
            .unwrap_or_default()
    }

    pub fn scopes(&self) -> Vec<Scope> {
        let mut scopes: Vec<Scope> = self.scopes.keys().cloned().collect();
        scopes.sort();
        scopes
    }

    pub fn clear(&mut self) {
        self.scopes.clear();
        self.members.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ProjectId, SegmentMetadata, SegmentType, TaskId};
    use chrono::Duration;
    use std::collections::HashSet;

    fn seg(id: &str, task: Option<&str>, created: DateTime<Utc>) -> Segment {
        let mut s = Segment::new(
            ProjectId::new("p").unwrap(),
            task.map(TaskId::from),
            format!("text {}", id),
            SegmentType::Message,
            SegmentMetadata::default(),
            1,
            created,
        );
        s.segment_id = SegmentId::from(id);
        s
    }

    fn no_pins(_: &SegmentId) -> bool {
        false
    }

    #[test]
    fn test_evicts_least_recently_touched() {
        let t0 = Utc::now();
        let mut cache = WorkingSetCache::new(2);
        assert!(cache.insert(&seg("a", None, t0), no_pins).evicted.is_empty());
        assert!(cache
            .insert(&seg("b", None, t0 + Duration::seconds(1)), no_pins)
            .evicted
            .is_empty());

        // Touch "a" so "b" becomes the LRU member
        cache.touch(&SegmentId::from("a"), t0 + Duration::seconds(5));

        let outcome = cache.insert(&seg("c", None, t0 + Duration::seconds(6)), no_pins);
        assert_eq!(outcome.evicted, vec![SegmentId::from("b")]);
        assert!(!outcome.over_capacity);
        assert!(cache.contains(&SegmentId::from("a")));
        assert!(!cache.contains(&SegmentId::from("b")));
    }

    #[test]
    fn test_ties_break_by_created_then_id() {
        let t0 = Utc::now();
        let mut cache = WorkingSetCache::new(2);
        let mut older = seg("z", None, t0 - Duration::hours(1));
        older.last_touched_at = t0;
        cache.insert(&seg("b", None, t0), no_pins);
        cache.insert(&older, no_pins);

        // All touched at t0; "z" was created first
        let outcome = cache.insert(&seg("a", None, t0), no_pins);
        assert_eq!(outcome.evicted, vec![SegmentId::from("z")]);

        // Same touch and created time: lowest id goes first
        let outcome = cache.insert(&seg("c", None, t0), no_pins);
        assert_eq!(outcome.evicted, vec![SegmentId::from("a")]);
    }

    #[test]
    fn test_pinned_members_are_skipped() {
        let t0 = Utc::now();
        let mut cache = WorkingSetCache::new(2);
        cache.insert(&seg("a", None, t0), no_pins);
        cache.insert(&seg("b", None, t0 + Duration::seconds(1)), no_pins);

        let pinned: HashSet<SegmentId> = [SegmentId::from("a")].into_iter().collect();
        let outcome = cache.insert(&seg("c", None, t0 + Duration::seconds(2)), |id| {
            pinned.contains(id)
        });
        assert_eq!(outcome.evicted, vec![SegmentId::from("b")]);
    }

    #[test]
    fn test_all_pinned_scope_accepts_insert() {
        let t0 = Utc::now();
        let mut cache = WorkingSetCache::new(1);
        cache.insert(&seg("a", None, t0), no_pins);

        let outcome = cache.insert(&seg("b", None, t0 + Duration::seconds(1)), |id| {
            id.as_str() == "a"
        });
        assert!(outcome.evicted.is_empty());
        assert!(outcome.over_capacity);
        assert_eq!(cache.len(), 2);

        // Once "a" is unpinned, enforcement brings the scope back under capacity
        let scope = seg("x", None, t0).scope();
        let outcome = cache.enforce(&scope, no_pins);
        assert_eq!(outcome.evicted, vec![SegmentId::from("a")]);
        assert!(!cache.is_over_capacity(&scope));
    }

    #[test]
    fn test_scopes_are_independent() {
        let t0 = Utc::now();
        let mut cache = WorkingSetCache::new(1);
        cache.insert(&seg("a", Some("t1"), t0), no_pins);
        let outcome = cache.insert(&seg("b", Some("t2"), t0), no_pins);
        assert!(outcome.evicted.is_empty());
        assert_eq!(cache.scopes().len(), 2);

        let outcome = cache.insert(&seg("c", None, t0), no_pins);
        assert!(outcome.evicted.is_empty());
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn test_reinsert_promotes_instead_of_duplicating() {
        let t0 = Utc::now();
        let mut cache = WorkingSetCache::new(3);
        let mut a = seg("a", None, t0);
        cache.insert(&a, no_pins);
        cache.insert(&seg("b", None, t0 + Duration::seconds(1)), no_pins);
        a.last_touched_at = t0 + Duration::seconds(10);
        cache.insert(&a, no_pins);

        let scope = a.scope();
        assert_eq!(cache.scope_len(&scope), 2);
        assert_eq!(
            cache.scope_ids(&scope),
            vec![SegmentId::from("b"), SegmentId::from("a")]
        );
        assert!(cache.remove(&SegmentId::from("a")));
        assert!(!cache.remove(&SegmentId::from("a")));
    }
}
