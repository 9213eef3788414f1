//! Dense document numbers for segment ids
//!
//! Postings are roaring bitmaps, which want small dense `u32` keys rather
//! than UUID strings. Released numbers are reused lowest first, so the slot
//! table never grows past the peak number of live segments.

use std::collections::HashMap;

use roaring::RoaringBitmap;

use crate::error::ContextError;
use crate::models::SegmentId;
use crate::Result;

fn docno_for(slot: usize) -> Result<u32> {
    u32::try_from(slot).map_err(|_| {
        ContextError::IndexInconsistency(format!("docno space exhausted at slot {}", slot))
    })
}

#[derive(Clone, Debug, Default)]
pub struct DocNoMap {
    /// docno -> segment id; `None` once released
    entries: Vec<Option<SegmentId>>,
    lookup: HashMap<SegmentId, u32>,
    live: RoaringBitmap,
    /// Released slots waiting for reuse
    free: RoaringBitmap,
}

impl DocNoMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the existing docno for `id`, else the lowest released one,
    /// else a fresh slot
    pub fn assign(&mut self, id: &SegmentId) -> Result<u32> {
        if let Some(docno) = self.lookup.get(id) {
            return Ok(*docno);
        }
        let docno = match self.free.min() {
            Some(docno) => {
                self.free.remove(docno);
                self.entries[docno as usize] = Some(id.clone());
                docno
            }
            None => {
                let docno = docno_for(self.entries.len())?;
                self.entries.push(Some(id.clone()));
                docno
            }
        };
        self.lookup.insert(id.clone(), docno);
        self.live.insert(docno);
        Ok(docno)
    }

    pub fn docno(&self, id: &SegmentId) -> Option<u32> {
        self.lookup.get(id).copied()
    }

    pub fn segment_id(&self, docno: u32) -> Option<&SegmentId> {
        self.entries.get(docno as usize).and_then(|e| e.as_ref())
    }

    /// Release a docno; returns it if `id` was mapped
    pub fn release(&mut self, id: &SegmentId) -> Option<u32> {
        let docno = self.lookup.remove(id)?;
        if let Some(slot) = self.entries.get_mut(docno as usize) {
            *slot = None;
        }
        self.live.remove(docno);
        self.free.insert(docno);
        Some(docno)
    }

    /// Bitmap of every live docno
    pub fn live(&self) -> &RoaringBitmap {
        &self.live
    }

    pub fn live_count(&self) -> usize {
        self.lookup.len()
    }

    /// Allocated slots, released ones included
    pub fn allocated(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lookup.is_empty()
    }

    /// Fraction of allocated slots currently free
    pub fn release_ratio(&self) -> f64 {
        if self.entries.is_empty() {
            0.0
        } else {
            1.0 - self.lookup.len() as f64 / self.entries.len() as f64
        }
    }

    pub fn ids(&self) -> impl Iterator<Item = &SegmentId> {
        self.entries.iter().filter_map(|e| e.as_ref())
    }

    /// Rebuild from a slot list, e.g. after loading a snapshot
    pub fn from_entries(entries: Vec<Option<SegmentId>>) -> Result<Self> {
        let mut lookup = HashMap::with_capacity(entries.len());
        let mut live = RoaringBitmap::new();
        let mut free = RoaringBitmap::new();
        for (slot, entry) in entries.iter().enumerate() {
            let docno = docno_for(slot)?;
            match entry {
                Some(id) => {
                    lookup.insert(id.clone(), docno);
                    live.insert(docno);
                }
                None => {
                    free.insert(docno);
                }
            }
        }
        Ok(Self {
            entries,
            lookup,
            live,
            free,
        })
    }

    pub fn entries(&self) -> &[Option<SegmentId>] {
        &self.entries
    }
}
