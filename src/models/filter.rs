use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::segment::{Segment, SegmentType, TaskId};
use crate::error::ContextError;

/// Metadata filter for narrowing search, stash and retrieve.
///
/// All fields are optional and combine with logical AND. `tags` is a
/// superset match: a segment passes when it carries every listed tag.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SegmentFilter {
    pub file_path: Option<String>,
    pub task_id: Option<TaskId>,
    pub segment_type: Option<SegmentType>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
}

impl SegmentFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn file_path(mut self, path: impl Into<String>) -> Self {
        self.file_path = Some(path.into());
        self
    }

    pub fn task(mut self, task: impl Into<TaskId>) -> Self {
        self.task_id = Some(task.into());
        self
    }

    pub fn segment_type(mut self, segment_type: SegmentType) -> Self {
        self.segment_type = Some(segment_type);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn created_between(
        mut self,
        after: Option<DateTime<Utc>>,
        before: Option<DateTime<Utc>>,
    ) -> Self {
        self.created_after = after;
        self.created_before = before;
        self
    }

    /// True when no field constrains anything
    pub fn is_empty(&self) -> bool {
        self.file_path.is_none()
            && self.task_id.is_none()
            && self.segment_type.is_none()
            && self.tags.is_empty()
            && self.created_after.is_none()
            && self.created_before.is_none()
    }

    /// Validate once at the boundary
    pub fn validate(&self) -> crate::Result<()> {
        if matches!(&self.file_path, Some(p) if p.is_empty()) {
            return Err(ContextError::InvalidParameter(
                "file_path filter must not be empty".to_string(),
            ));
        }
        if matches!(&self.task_id, Some(t) if t.0.is_empty()) {
            return Err(ContextError::InvalidParameter(
                "task_id filter must not be empty".to_string(),
            ));
        }
        if self.tags.iter().any(|t| t.is_empty()) {
            return Err(ContextError::InvalidParameter(
                "tag filters must not be empty".to_string(),
            ));
        }
        if let (Some(after), Some(before)) = (self.created_after, self.created_before) {
            if after > before {
                return Err(ContextError::InvalidParameter(format!(
                    "created_after ({}) is later than created_before ({})",
                    after, before
                )));
            }
        }
        Ok(())
    }

    /// Check a segment against every populated field
    pub fn matches(&self, segment: &Segment) -> bool {
        if let Some(path) = &self.file_path {
            if segment.metadata.file_path.as_deref() != Some(path.as_str()) {
                return false;
            }
        }
        if let Some(task) = &self.task_id {
            if segment.task_id.as_ref() != Some(task) {
                return false;
            }
        }
        if let Some(segment_type) = self.segment_type {
            if segment.segment_type != segment_type {
                return false;
            }
        }
        if !self.tags.is_subset(&segment.metadata.tags) {
            return false;
        }
        if let Some(after) = self.created_after {
            if segment.created_at < after {
                return false;
            }
        }
        if let Some(before) = self.created_before {
            if segment.created_at > before {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ProjectId, SegmentMetadata};
    use chrono::Duration;

    fn segment(tags: &[&str], path: Option<&str>) -> Segment {
        let mut meta = SegmentMetadata::default();
        for t in tags {
            meta = meta.with_tag(*t);
        }
        if let Some(p) = path {
            meta = meta.with_file_path(p);
        }
        Segment::new(
            ProjectId::new("p").unwrap(),
            Some(TaskId::from("t1")),
            "text".to_string(),
            SegmentType::Code,
            meta,
            1,
            Utc::now(),
        )
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        let filter = SegmentFilter::new();
        assert!(filter.is_empty());
        assert!(filter.matches(&segment(&[], None)));
    }

    #[test]
    fn test_tag_superset_semantics() {
        let seg = segment(&["build", "ci", "rust"], None);
        assert!(SegmentFilter::new().tag("build").tag("ci").matches(&seg));
        assert!(!SegmentFilter::new().tag("build").tag("deploy").matches(&seg));
    }

    #[test]
    fn test_field_filters() {
        let seg = segment(&[], Some("src/lib.rs"));
        assert!(SegmentFilter::new().file_path("src/lib.rs").matches(&seg));
        assert!(!SegmentFilter::new().file_path("src/main.rs").matches(&seg));
        assert!(SegmentFilter::new().task("t1").matches(&seg));
        assert!(!SegmentFilter::new().task("t2").matches(&seg));
        assert!(SegmentFilter::new().segment_type(SegmentType::Code).matches(&seg));
        assert!(!SegmentFilter::new().segment_type(SegmentType::Log).matches(&seg));
    }

    #[test]
    fn test_date_range() {
        let seg = segment(&[], None);
        let created = seg.created_at;
        let inside = SegmentFilter::new().created_between(
            Some(created - Duration::hours(1)),
            Some(created + Duration::hours(1)),
        );
        assert!(inside.matches(&seg));
        let later = SegmentFilter::new().created_between(Some(created + Duration::hours(1)), None);
        assert!(!later.matches(&seg));
    }

    #[test]
    fn test_validation() {
        let now = Utc::now();
        let inverted = SegmentFilter::new().created_between(Some(now), Some(now - Duration::hours(1)));
        assert!(inverted.validate().is_err());
        assert!(SegmentFilter::new().file_path("").validate().is_err());
        assert!(SegmentFilter::new().tag("x").validate().is_ok());
    }
}
