use std::collections::{HashMap, HashSet};

use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};

use super::docno_map::DocNoMap;
use crate::error::ContextError;
use crate::models::{Segment, SegmentId};
use crate::tokenizer::Tokenizer;
use crate::Result;

/// Keyword index over segment text: term -> bitmap of docnos, plus the
/// reverse map docno -> terms so deindexing only visits a segment's own
/// vocabulary.
#[derive(Clone, Debug)]
pub struct InvertedIndex {
    tokenizer: Tokenizer,
    docnos: DocNoMap,
    postings: HashMap<String, RoaringBitmap>,
    doc_terms: HashMap<u32, Vec<String>>,
}

/// Serialized postings for fast startup.
///
/// Docnos are compacted when the snapshot is taken, so `ids[n]` is the
/// segment behind docno `n`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IndexSnapshot {
    pub tokenizer_fingerprint: String,
    pub ids: Vec<SegmentId>,
    /// term -> portable roaring bitmap bytes
    pub postings: Vec<(String, Vec<u8>)>,
}

impl InvertedIndex {
    pub fn new(tokenizer: Tokenizer) -> Self {
        Self {
            tokenizer,
            docnos: DocNoMap::new(),
            postings: HashMap::new(),
            doc_terms: HashMap::new(),
        }
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    /// Add postings for every unique token in the segment text.
    ///
    /// Re-indexing an already indexed segment replaces its postings.
    pub fn index(&mut self, segment: &Segment) -> Result<bool> {
        let was_indexed = self.deindex(&segment.segment_id);
        let docno = self.docnos.assign(&segment.segment_id)?;
        let terms: Vec<String> = self
            .tokenizer
            .unique_terms(&segment.text)
            .into_iter()
            .collect();
        for term in &terms {
            self.postings
                .entry(term.clone())
                .or_default()
                .insert(docno);
        }
        self.doc_terms.insert(docno, terms);
        Ok(!was_indexed)
    }

    /// Remove a segment from every posting list that holds it
    pub fn deindex(&mut self, segment_id: &SegmentId) -> bool {
        let Some(docno) = self.docnos.release(segment_id) else {
            return false;
        };
        for term in self.doc_terms.remove(&docno).unwrap_or_default() {
            if let Some(bitmap) = self.postings.get_mut(&term) {
                bitmap.remove(docno);
                if bitmap.is_empty() {
                    self.postings.remove(&term);
                }
            }
        }
        true
    }

    pub fn is_indexed(&self, segment_id: &SegmentId) -> bool {
        self.docnos.docno(segment_id).is_some()
    }

    /// Number of indexed segments
    pub fn len(&self) -> usize {
        self.docnos.live_count()
    }

    pub fn is_empty(&self) -> bool {
        self.docnos.is_empty()
    }

    /// Number of distinct terms
    pub fn term_count(&self) -> usize {
        self.postings.len()
    }

    pub fn indexed_ids(&self) -> impl Iterator<Item = &SegmentId> {
        self.docnos.ids()
    }

    /// Docnos matching every query token; an empty query matches everything
    pub fn matching(&self, query: &str) -> RoaringBitmap {
        let terms = self.tokenizer.unique_terms(query);
        if terms.is_empty() {
            return self.docnos.live().clone();
        }

        let mut lists = Vec::with_capacity(terms.len());
        for term in &terms {
            match self.postings.get(term) {
                Some(bitmap) => lists.push(bitmap),
                None => return RoaringBitmap::new(),
            }
        }
        // Rarest first keeps intermediate sets small
        lists.sort_by_key(|b| b.len());

        let mut result = lists[0].clone();
        for bitmap in &lists[1..] {
            result &= *bitmap;
            if result.is_empty() {
                break;
            }
        }
        result
    }

    /// Segment ids matching every query token
    pub fn matching_ids(&self, query: &str) -> Vec<SegmentId> {
        self.matching(query)
            .iter()
            .filter_map(|docno| self.docnos.segment_id(docno).cloned())
            .collect()
    }

    pub fn clear(&mut self) {
        self.docnos = DocNoMap::new();
        self.postings.clear();
        self.doc_terms.clear();
    }

    /// Drop everything and index `segments` from scratch
    pub fn rebuild<'a>(&mut self, segments: impl IntoIterator<Item = &'a Segment>) -> Result<usize> {
        self.clear();
        let mut count = 0;
        for segment in segments {
            self.index(segment)?;
            count += 1;
        }
        Ok(count)
    }

    /// Check the index covers exactly `expected`
    pub fn verify(&self, expected: &HashSet<&SegmentId>) -> Result<()> {
        if let Some(extra) = self.docnos.ids().find(|id| !expected.contains(id)) {
            return Err(ContextError::IndexInconsistency(format!(
                "index references unknown segment {}",
                extra
            )));
        }
        if let Some(missing) = expected.iter().find(|id| !self.is_indexed(id)) {
            return Err(ContextError::IndexInconsistency(format!(
                "segment {} is not indexed",
                missing
            )));
        }
        Ok(())
    }

    /// Capture a compacted snapshot
    pub fn snapshot(&self) -> Result<IndexSnapshot> {
        let mut ids = Vec::with_capacity(self.len());
        let mut remap: HashMap<u32, u32> = HashMap::with_capacity(self.len());
        for docno in self.docnos.live() {
            if let Some(id) = self.docnos.segment_id(docno) {
                remap.insert(docno, ids.len() as u32);
                ids.push(id.clone());
            }
        }

        let mut terms: Vec<&String> = self.postings.keys().collect();
        terms.sort();
        let mut postings = Vec::with_capacity(terms.len());
        for term in terms {
            let compacted: RoaringBitmap = self.postings[term]
                .iter()
                .filter_map(|docno| remap.get(&docno).copied())
                .collect();
            let mut bytes = Vec::with_capacity(compacted.serialized_size());
            compacted.serialize_into(&mut bytes)?;
            postings.push((term.clone(), bytes));
        }

        Ok(IndexSnapshot {
            tokenizer_fingerprint: self.tokenizer.fingerprint(),
            ids,
            postings,
        })
    }

    /// Load a snapshot taken by a tokenizer with the same fingerprint
    pub fn restore(tokenizer: Tokenizer, snapshot: IndexSnapshot) -> Result<Self> {
        if snapshot.tokenizer_fingerprint != tokenizer.fingerprint() {
            return Err(ContextError::IndexInconsistency(format!(
                "snapshot tokenizer {} does not match {}",
                snapshot.tokenizer_fingerprint,
                tokenizer.fingerprint()
            )));
        }

        let live = snapshot.ids.len();
        let max_doc = u32::try_from(live).map_err(|_| {
            ContextError::IndexInconsistency(format!("snapshot lists {} segments", live))
        })?;
        let docnos = DocNoMap::from_entries(snapshot.ids.into_iter().map(Some).collect())?;
        if docnos.live_count() != live {
            return Err(ContextError::IndexInconsistency(
                "snapshot lists a segment more than once".to_string(),
            ));
        }

        let mut postings = HashMap::with_capacity(snapshot.postings.len());
        let mut doc_terms: HashMap<u32, Vec<String>> = HashMap::new();
        for (term, bytes) in snapshot.postings {
            let bitmap = RoaringBitmap::deserialize_from(&bytes[..])?;
            if bitmap.max().map_or(false, |m| m >= max_doc) {
                return Err(ContextError::IndexInconsistency(format!(
                    "postings for {:?} reference docnos past {}",
                    term, max_doc
                )));
            }
            for docno in bitmap.iter() {
                doc_terms.entry(docno).or_default().push(term.clone());
            }
            postings.insert(term, bitmap);
        }

        Ok(Self {
            tokenizer,
            docnos,
            postings,
            doc_terms,
        })
    }
}
