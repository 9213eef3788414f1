use std::cmp::Ordering;

use crate::models::{Segment, SegmentFilter, Tier};
use crate::store::SegmentStore;
use crate::tokenizer::Tokenizer;

use super::InvertedIndex;

/// Keyword + filter query against one project's records
#[derive(Clone, Debug, Default)]
pub struct KeywordQuery<'a> {
    pub text: &'a str,
    pub filter: Option<&'a SegmentFilter>,
    /// Restrict to one tier; `None` returns whatever the candidate source holds
    pub tier: Option<Tier>,
}

/// Matches before truncation plus the truncated page
#[derive(Debug)]
pub struct QueryHits<'s> {
    pub segments: Vec<&'s Segment>,
    pub total_matches: usize,
}

impl<'a> KeywordQuery<'a> {
    pub fn new(text: &'a str) -> Self {
        Self {
            text,
            filter: None,
            tier: None,
        }
    }

    pub fn with_filter(mut self, filter: Option<&'a SegmentFilter>) -> Self {
        self.filter = filter;
        self
    }

    pub fn in_tier(mut self, tier: Tier) -> Self {
        self.tier = Some(tier);
        self
    }

    fn accepts(&self, segment: &Segment) -> bool {
        self.tier.map_or(true, |t| segment.tier == t)
            && self.filter.map_or(true, |f| f.matches(segment))
    }

    /// Run against the inverted index, resolving hits through the store
    pub fn execute<'s>(
        &self,
        index: &InvertedIndex,
        store: &'s SegmentStore,
        limit: usize,
    ) -> QueryHits<'s> {
        let hits = index
            .matching_ids(self.text)
            .into_iter()
            .filter_map(|id| store.get(&id).ok())
            .filter(|s| self.accepts(s))
            .collect();
        finish(hits, limit)
    }

    /// Run by scanning records directly, for segments the index does not cover
    pub fn scan<'s>(
        &self,
        tokenizer: &Tokenizer,
        segments: impl Iterator<Item = &'s Segment>,
        limit: usize,
    ) -> QueryHits<'s> {
        let terms = tokenizer.unique_terms(self.text);
        let hits = segments
            .filter(|s| self.accepts(s))
            .filter(|s| {
                terms.is_empty() || {
                    let own = tokenizer.unique_terms(&s.text);
                    terms.is_subset(&own)
                }
            })
            .collect();
        finish(hits, limit)
    }
}

/// Most recently touched first, ties by segment id
pub fn recency_order(a: &Segment, b: &Segment) -> Ordering {
    b.last_touched_at
        .cmp(&a.last_touched_at)
        .then_with(|| a.segment_id.cmp(&b.segment_id))
}

fn finish(mut hits: Vec<&Segment>, limit: usize) -> QueryHits<'_> {
    let total_matches = hits.len();
    hits.sort_by(|a, b| recency_order(a, b));
    hits.truncate(limit);
    QueryHits {
        segments: hits,
        total_matches,
    }
}
