//! In-memory caches: the capacity-bounded working set and a small generic LRU.

mod lru;
mod working_set;

pub use lru::LruCache;
pub use working_set::{InsertOutcome, WorkingSetCache};
