//! Prune-score computation for working-set segments

use chrono::{DateTime, Utc};

use crate::config::GcConfig;
use crate::models::Segment;

/// Individual terms of a prune score, kept for explanations
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScoreBreakdown {
    pub age_hours: f64,
    pub normalized_age: f64,
    pub type_weight: f64,
    pub normalized_ref: f64,
    pub survival_damping: f64,
    pub score: f64,
}

/// Compute the prune score
///
/// # Arguments
/// * `age_hours` - Hours since the segment was last touched
/// * `type_weight` - Weight of the segment type, in [0, 1]
/// * `refcount` - Number of retrievals and explicit references
/// * `gc_survival_count` - GC passes the segment has survived
/// * `config` - Horizon, saturation and term weights
///
/// # Returns
/// Score in [0, 1]; higher means a better pruning candidate
pub fn prune_score(
    age_hours: f64,
    type_weight: f64,
    refcount: u32,
    gc_survival_count: u32,
    config: &GcConfig,
) -> ScoreBreakdown {
    let normalized_age = (age_hours.max(0.0) / config.age_horizon_hours).min(1.0);
    let normalized_ref = (refcount as f64 / config.ref_saturation).min(1.0);
    let survival_damping = (1.0 + gc_survival_count as f64).ln();

    let raw = config.w_age * normalized_age + config.w_type * type_weight
        - config.w_ref * normalized_ref
        - config.w_survival * survival_damping;

    ScoreBreakdown {
        age_hours,
        normalized_age,
        type_weight,
        normalized_ref,
        survival_damping,
        score: raw.clamp(0.0, 1.0),
    }
}

/// Score a segment as of `now`
pub fn score_segment(segment: &Segment, now: DateTime<Utc>, config: &GcConfig) -> ScoreBreakdown {
    prune_score(
        segment.age_hours(now),
        config.type_weights.weight(segment.segment_type),
        segment.refcount,
        segment.gc_survival_count,
        config,
    )
}

/// Human-readable justification built from the dominant terms
pub fn explain(segment: &Segment, breakdown: &ScoreBreakdown, config: &GcConfig) -> String {
    let age_term = config.w_age * breakdown.normalized_age;
    let type_term = config.w_type * breakdown.type_weight;
    let ref_term = config.w_ref * breakdown.normalized_ref;
    let survival_term = config.w_survival * breakdown.survival_damping;

    let mut reason = if age_term >= type_term {
        if breakdown.normalized_age >= 1.0 {
            format!(
                "untouched for {:.1}h, past the {:.0}h horizon",
                breakdown.age_hours, config.age_horizon_hours
            )
        } else {
            format!("untouched for {:.1}h", breakdown.age_hours)
        }
    } else {
        format!(
            "{} segments are cheap to drop (weight {:.2})",
            segment.segment_type, breakdown.type_weight
        )
    };

    if ref_term > 0.0 && ref_term >= survival_term {
        reason.push_str(&format!("; held by {} references", segment.refcount));
    } else if survival_term > 0.0 {
        reason.push_str(&format!(
            "; survived {} GC passes",
            segment.gc_survival_count
        ));
    }
    reason
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> GcConfig {
        GcConfig::default()
    }

    #[test]
    fn test_fresh_log_scores_type_only() {
        let b = prune_score(0.0, 1.0, 0, 0, &config());
        assert!((b.score - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_old_log_saturates() {
        let b = prune_score(10_000.0, 1.0, 0, 0, &config());
        assert_eq!(b.normalized_age, 1.0);
        assert!((b.score - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_score_is_clamped() {
        let b = prune_score(0.0, 0.1, 50, 20, &config());
        assert_eq!(b.score, 0.0);

        let mut heavy = config();
        heavy.w_age = 2.0;
        let b = prune_score(10_000.0, 1.0, 0, 0, &heavy);
        assert_eq!(b.score, 1.0);
    }

    #[test]
    fn test_monotonic_in_age() {
        let cfg = config();
        let mut last = -1.0;
        for hours in [0.0, 1.0, 10.0, 100.0, 500.0, 719.0, 720.0, 5_000.0] {
            let score = prune_score(hours, 0.6, 1, 1, &cfg).score;
            assert!(score >= last, "score dropped at {}h", hours);
            last = score;
        }
    }

    #[test]
    fn test_references_and_survival_lower_score() {
        let cfg = config();
        let base = prune_score(300.0, 0.6, 0, 0, &cfg).score;
        let referenced = prune_score(300.0, 0.6, 3, 0, &cfg).score;
        let survivor = prune_score(300.0, 0.6, 0, 3, &cfg).score;
        assert!(referenced < base);
        assert!(survivor < base);

        let type_heavy = prune_score(300.0, 1.0, 0, 0, &cfg).score;
        assert!(type_heavy > base);
    }
}
