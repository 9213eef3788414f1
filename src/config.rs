use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::ContextError;
use crate::models::SegmentType;

/// Prune-score weights and thresholds
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GcConfig {
    pub age_horizon_hours: f64,
    pub ref_saturation: f64,
    pub w_age: f64,
    pub w_type: f64,
    pub w_ref: f64,
    pub w_survival: f64,
    /// Strict lower bound a score must exceed before a plan deletes instead of stashing
    pub delete_threshold: f64,
    pub type_weights: TypeWeights,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            age_horizon_hours: 720.0,
            ref_saturation: 5.0,
            w_age: 0.5,
            w_type: 0.3,
            w_ref: 0.2,
            w_survival: 0.15,
            delete_threshold: 0.9,
            type_weights: TypeWeights::default(),
        }
    }
}

impl GcConfig {
    pub fn validate(&self) -> crate::Result<()> {
        if !(self.age_horizon_hours > 0.0) {
            return Err(ContextError::InvalidParameter(
                "age_horizon_hours must be positive".to_string(),
            ));
        }
        if !(self.ref_saturation > 0.0) {
            return Err(ContextError::InvalidParameter(
                "ref_saturation must be positive".to_string(),
            ));
        }
        for (name, w) in [
            ("w_age", self.w_age),
            ("w_type", self.w_type),
            ("w_ref", self.w_ref),
            ("w_survival", self.w_survival),
        ] {
            if !(w >= 0.0) {
                return Err(ContextError::InvalidParameter(format!(
                    "{} must be non-negative",
                    name
                )));
            }
        }
        self.type_weights.validate()
    }
}

/// Per-type prune weights in [0, 1]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TypeWeights {
    pub log: f64,
    pub message: f64,
    pub code: f64,
    pub note: f64,
    pub decision: f64,
    pub summary: f64,
}

impl Default for TypeWeights {
    fn default() -> Self {
        Self {
            log: 1.0,
            message: 0.6,
            code: 0.5,
            note: 0.4,
            decision: 0.2,
            summary: 0.1,
        }
    }
}

impl TypeWeights {
    pub fn weight(&self, segment_type: SegmentType) -> f64 {
        match segment_type {
            SegmentType::Log => self.log,
            SegmentType::Message => self.message,
            SegmentType::Code => self.code,
            SegmentType::Note => self.note,
            SegmentType::Decision => self.decision,
            SegmentType::Summary => self.summary,
        }
    }

    fn validate(&self) -> crate::Result<()> {
        for t in SegmentType::ALL {
            let w = self.weight(t);
            if !(0.0..=1.0).contains(&w) {
                return Err(ContextError::InvalidParameter(format!(
                    "type weight for {} must be in [0, 1], got {}",
                    t, w
                )));
            }
        }
        Ok(())
    }
}

/// Tokenizer configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TokenizerConfig {
    /// Keyword matching is case-insensitive, so this must stay `true`.
    /// The field is kept so the value shows up in index markers.
    pub lowercase: bool,
}

impl Default for TokenizerConfig {
    fn default() -> Self {
        Self { lowercase: true }
    }
}

impl TokenizerConfig {
    pub fn validate(&self) -> crate::Result<()> {
        if !self.lowercase {
            return Err(ContextError::InvalidParameter(
                "tokenizer.lowercase=false is unsupported; search is case-insensitive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Store-wide settings shared by every project opened by an engine
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreSettings {
    pub data_dir: PathBuf,
    /// Working-set capacity per (project, task) scope, in segments
    pub working_set_capacity: usize,
    pub shard_count: u32,
    /// Also index working-tier segments for uniform search
    pub index_working_tier: bool,
    /// Entries kept by the token-count cache
    pub token_cache_size: usize,
    pub gc: GcConfig,
    pub tokenizer: TokenizerConfig,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            working_set_capacity: 10_000,
            shard_count: 64,
            index_working_tier: false,
            token_cache_size: 4096,
            gc: GcConfig::default(),
            tokenizer: TokenizerConfig::default(),
        }
    }
}

/// Retention presets for different agent workloads
#[derive(Clone, Debug)]
pub enum RetentionProfile {
    /// Prune eagerly: short horizon, survival barely protects
    Aggressive,
    Balanced,
    /// Keep context longer and never delete from plans
    Conservative,
}

impl RetentionProfile {
    pub fn age_horizon_hours(&self) -> f64 {
        match self {
            RetentionProfile::Aggressive => 168.0,
            RetentionProfile::Balanced => 720.0,
            RetentionProfile::Conservative => 2160.0,
        }
    }

    pub fn delete_threshold(&self) -> f64 {
        match self {
            RetentionProfile::Aggressive => 0.8,
            RetentionProfile::Balanced => 0.9,
            // Scores are clamped to 1.0, so a strict threshold of 1.0 never deletes
            RetentionProfile::Conservative => 1.0,
        }
    }

    pub fn w_survival(&self) -> f64 {
        match self {
            RetentionProfile::Aggressive => 0.05,
            RetentionProfile::Balanced => 0.15,
            RetentionProfile::Conservative => 0.3,
        }
    }

    /// Apply this profile to a GcConfig
    pub fn apply_to(&self, config: &mut GcConfig) {
        config.age_horizon_hours = self.age_horizon_hours();
        config.delete_threshold = self.delete_threshold();
        config.w_survival = self.w_survival();
    }
}

impl StoreSettings {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Apply a retention profile to the GC settings
    pub fn with_profile(mut self, profile: RetentionProfile) -> Self {
        profile.apply_to(&mut self.gc);
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.working_set_capacity = capacity;
        self
    }

    pub fn with_shard_count(mut self, shard_count: u32) -> Self {
        self.shard_count = shard_count;
        self
    }

    pub fn with_gc(mut self, gc: GcConfig) -> Self {
        self.gc = gc;
        self
    }

    pub fn with_working_tier_indexing(mut self, enabled: bool) -> Self {
        self.index_working_tier = enabled;
        self
    }

    /// Directory holding one project's shard files and markers
    pub fn project_dir(&self, project: &str) -> PathBuf {
        self.data_dir.join(project)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.working_set_capacity == 0 {
            return Err(ContextError::InvalidParameter(
                "working_set_capacity must be at least 1".to_string(),
            ));
        }
        if self.shard_count == 0 {
            return Err(ContextError::InvalidParameter(
                "shard_count must be at least 1".to_string(),
            ));
        }
        self.tokenizer.validate()?;
        self.gc.validate()
    }
}
