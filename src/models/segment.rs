use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ContextError;

/// Segment identifier (UUIDv7 string, unique within a project)
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SegmentId(pub String);

impl SegmentId {
    /// Allocate a fresh, time-ordered id
    pub fn generate() -> Self {
        Self(uuid::Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SegmentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SegmentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Project scoping identifier
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProjectId(pub String);

impl ProjectId {
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        if id.is_empty()
            || !id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
            || id.starts_with('.')
        {
            return Err(ContextError::InvalidParameter(format!(
                "project id must be non-empty [A-Za-z0-9._-] and not start with '.': {:?}",
                id
            )));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Task scoping identifier
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Kind of content a segment holds
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentType {
    Message,
    Code,
    Log,
    Note,
    Decision,
    Summary,
}

impl SegmentType {
    pub const ALL: [SegmentType; 6] = [
        SegmentType::Message,
        SegmentType::Code,
        SegmentType::Log,
        SegmentType::Note,
        SegmentType::Decision,
        SegmentType::Summary,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SegmentType::Message => "message",
            SegmentType::Code => "code",
            SegmentType::Log => "log",
            SegmentType::Note => "note",
            SegmentType::Decision => "decision",
            SegmentType::Summary => "summary",
        }
    }
}

impl fmt::Display for SegmentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SegmentType {
    type Err = ContextError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "message" => Ok(SegmentType::Message),
            "code" => Ok(SegmentType::Code),
            "log" => Ok(SegmentType::Log),
            "note" => Ok(SegmentType::Note),
            "decision" => Ok(SegmentType::Decision),
            "summary" => Ok(SegmentType::Summary),
            other => Err(ContextError::InvalidParameter(format!(
                "unknown segment type: {}",
                other
            ))),
        }
    }
}

/// Storage tier; a segment is in exactly one at a time
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Working,
    Stashed,
}

/// GC generation marker
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Generation {
    Young,
    Old,
}

/// Inclusive line range locator
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineRange {
    pub start: u32,
    pub end: u32,
}

/// Optional locators supplied at ingestion
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SegmentMetadata {
    pub file_path: Option<String>,
    pub line_range: Option<LineRange>,
    pub tags: BTreeSet<String>,
    pub topic_id: Option<String>,
}

impl SegmentMetadata {
    pub fn with_file_path(mut self, path: impl Into<String>) -> Self {
        self.file_path = Some(path.into());
        self
    }

    pub fn with_line_range(mut self, start: u32, end: u32) -> Self {
        self.line_range = Some(LineRange { start, end });
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic_id = Some(topic.into());
        self
    }

    pub fn validate(&self) -> crate::Result<()> {
        if let Some(range) = self.line_range {
            if range.start > range.end {
                return Err(ContextError::InvalidParameter(format!(
                    "line range start {} is after end {}",
                    range.start, range.end
                )));
            }
        }
        if self.tags.iter().any(|t| t.is_empty()) {
            return Err(ContextError::InvalidParameter(
                "tags must be non-empty strings".to_string(),
            ));
        }
        Ok(())
    }
}

/// Working-set scope: a project plus an optional task
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Scope {
    pub project_id: ProjectId,
    pub task_id: Option<TaskId>,
}

/// The unit of stored agent context
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub segment_id: SegmentId,
    pub project_id: ProjectId,
    pub task_id: Option<TaskId>,
    pub text: String,
    pub text_hash: String,
    pub segment_type: SegmentType,
    pub tier: Tier,
    pub created_at: DateTime<Utc>,
    pub last_touched_at: DateTime<Utc>,
    pub pinned: bool,
    pub generation: Generation,
    pub gc_survival_count: u32,
    pub refcount: u32,
    pub metadata: SegmentMetadata,
    pub tokens: u32,
    pub tokens_computed_at: DateTime<Utc>,
}

impl Segment {
    /// Create a fresh working-tier segment
    pub fn new(
        project_id: ProjectId,
        task_id: Option<TaskId>,
        text: String,
        segment_type: SegmentType,
        metadata: SegmentMetadata,
        tokens: u32,
        now: DateTime<Utc>,
    ) -> Self {
        let text_hash = compute_text_hash(&text);
        Self {
            segment_id: SegmentId::generate(),
            project_id,
            task_id,
            text,
            text_hash,
            segment_type,
            tier: Tier::Working,
            created_at: now,
            last_touched_at: now,
            pinned: false,
            generation: Generation::Young,
            gc_survival_count: 0,
            refcount: 0,
            metadata,
            tokens,
            tokens_computed_at: now,
        }
    }

    pub fn scope(&self) -> Scope {
        Scope {
            project_id: self.project_id.clone(),
            task_id: self.task_id.clone(),
        }
    }

    pub fn is_working(&self) -> bool {
        self.tier == Tier::Working
    }

    /// Record an access; `last_touched_at` never moves backwards
    pub fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.last_touched_at {
            self.last_touched_at = now;
        }
    }

    /// Record surviving one GC pass
    pub fn record_survival(&mut self) {
        self.gc_survival_count = self.gc_survival_count.saturating_add(1);
        if self.gc_survival_count >= 1 {
            self.generation = Generation::Old;
        }
    }

    pub fn add_reference(&mut self) {
        self.refcount = self.refcount.saturating_add(1);
    }

    /// Hours since last access, never negative
    pub fn age_hours(&self, now: DateTime<Utc>) -> f64 {
        let millis = (now - self.last_touched_at).num_milliseconds().max(0);
        millis as f64 / 3_600_000.0
    }

    /// Verify the stored hash still matches the text
    pub fn verify_hash(&self) -> bool {
        compute_text_hash(&self.text) == self.text_hash
    }
}

/// SHA-256 hex digest of segment text
pub fn compute_text_hash(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}
