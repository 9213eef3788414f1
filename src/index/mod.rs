//! Keyword index over archived segments

mod docno_map;
mod inverted;
mod query;

pub use docno_map::DocNoMap;
pub use inverted::{IndexSnapshot, InvertedIndex};
pub use query::{recency_order, KeywordQuery, QueryHits};
