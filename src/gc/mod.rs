//! Generational pruning: score working-set segments and plan what to free

mod planner;
mod scoring;

pub use planner::{analyze, rank, GcPass};
pub use scoring::{explain, prune_score, score_segment, ScoreBreakdown};
