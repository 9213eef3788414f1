use std::cmp::Reverse;

use chrono::{DateTime, Utc};
use ordered_float::OrderedFloat;

use super::scoring::{explain, score_segment};
use crate::config::GcConfig;
use crate::models::{GcCandidate, GcPlan, Segment, SegmentId};

/// Outcome of one analysis pass, before survival bookkeeping is applied
#[derive(Clone, Debug)]
pub struct GcPass {
    /// Ranked best-to-prune first
    pub candidates: Vec<GcCandidate>,
    pub plan: Option<GcPlan>,
    /// Evaluated candidates left out of the plan; each survived this pass
    pub survivors: Vec<SegmentId>,
}

/// Score, rank and optionally plan over working-tier segments.
///
/// Pinned and stashed segments are skipped entirely. The pass is pure: the
/// caller applies `survivors` to the store.
pub fn analyze<'a>(
    segments: impl IntoIterator<Item = &'a Segment>,
    now: DateTime<Utc>,
    config: &GcConfig,
    target_tokens: Option<u64>,
) -> GcPass {
    let mut candidates: Vec<GcCandidate> = segments
        .into_iter()
        .filter(|s| s.is_working() && !s.pinned)
        .map(|s| {
            let breakdown = score_segment(s, now, config);
            GcCandidate {
                segment_id: s.segment_id.clone(),
                score: breakdown.score,
                age_hours: breakdown.age_hours,
                tokens: s.tokens,
                segment_type: s.segment_type,
                generation: s.generation,
                gc_survival_count: s.gc_survival_count,
                refcount: s.refcount,
                reason: explain(s, &breakdown, config),
            }
        })
        .collect();

    rank(&mut candidates);

    let (plan, selected) = match target_tokens {
        Some(target) => {
            let (plan, selected) = build_plan(&candidates, target, config.delete_threshold);
            (Some(plan), selected)
        }
        None => (None, 0),
    };

    let survivors = candidates[selected..]
        .iter()
        .map(|c| c.segment_id.clone())
        .collect();

    GcPass {
        candidates,
        plan,
        survivors,
    }
}

/// Score descending, then age descending, then segment id ascending
pub fn rank(candidates: &mut [GcCandidate]) {
    candidates.sort_by(|a, b| {
        (
            Reverse(OrderedFloat(a.score)),
            Reverse(OrderedFloat(a.age_hours)),
            &a.segment_id,
        )
            .cmp(&(
                Reverse(OrderedFloat(b.score)),
                Reverse(OrderedFloat(b.age_hours)),
                &b.segment_id,
            ))
    });
}

/// Walk the ranked list until `target` tokens are freed.
///
/// Returns the plan and how many leading candidates it took.
fn build_plan(ranked: &[GcCandidate], target: u64, delete_threshold: f64) -> (GcPlan, usize) {
    let mut plan = GcPlan {
        target_tokens: target,
        ..Default::default()
    };
    let mut taken = 0;
    for candidate in ranked {
        if plan.tokens_freed >= target {
            break;
        }
        if candidate.score > delete_threshold {
            plan.delete_segments.push(candidate.segment_id.clone());
        } else {
            plan.stash_segments.push(candidate.segment_id.clone());
        }
        plan.tokens_freed += candidate.tokens as u64;
        taken += 1;
    }
    plan.shortfall = target.saturating_sub(plan.tokens_freed);
    (plan, taken)
}
