use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::atomic::{sweep_temp_files, AtomicWriter};
use super::frame::{self, INDEX_MAGIC, SHARD_MAGIC};
use crate::error::ContextError;
use crate::index::IndexSnapshot;
use crate::models::{Segment, SegmentId};
use crate::store::ShardSnapshot;
use crate::Result;

const INDEX_FILE: &str = "index.bin";
const MARKER_FILE: &str = "index.marker.json";

/// Stable shard routing: crc32 of the id bytes, modulo the shard count
pub fn shard_for(segment_id: &SegmentId, shard_count: u32) -> u32 {
    crc32fast::hash(segment_id.as_str().as_bytes()) % shard_count.max(1)
}

pub fn shard_file_name(shard: u32) -> String {
    format!("shard-{:04}.bin", shard)
}

/// Name a corrupt shard is moved to so later writes cannot replace it
fn quarantine_file_name(shard: u32, at: DateTime<Utc>) -> String {
    format!("{}.corrupt-{}", shard_file_name(shard), at.format("%Y%m%dT%H%M%S%.3fZ"))
}

fn parse_shard_file_name(name: &str) -> Option<u32> {
    name.strip_prefix("shard-")?
        .strip_suffix(".bin")?
        .parse()
        .ok()
}

/// Records what the persisted index was built with
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMarker {
    pub tokenizer_version: u32,
    pub tokenizer_fingerprint: String,
    pub format_version: u32,
    pub shard_count: u32,
    #[serde(default)]
    pub index_working_tier: bool,
}

/// Everything read from a project directory at open
#[derive(Debug, Default)]
pub struct ArchiveLoad {
    /// Records of both tiers, as stored
    pub segments: Vec<Segment>,
    /// Shards that failed to decode and were skipped
    pub corrupt_shards: Vec<u32>,
    /// Where each corrupt shard was moved to
    pub quarantined: Vec<PathBuf>,
    /// Shard files whose number is outside the current shard count
    pub orphan_shards: Vec<u32>,
    /// Segments found in a shard other than the one they route to
    pub misplaced: usize,
    pub swept_temp_files: usize,
}

/// On-disk shard set for one project. In-memory records live in the
/// `SegmentStore`; this type only reads and writes files.
#[derive(Debug)]
pub struct ShardedArchive {
    dir: PathBuf,
    shard_count: u32,
    writer: AtomicWriter,
}

impl ShardedArchive {
    /// Open (creating if needed) a project directory and load every shard
    pub fn open(dir: impl Into<PathBuf>, shard_count: u32) -> Result<(Self, ArchiveLoad)> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| ContextError::storage(&dir, e))?;

        let archive = Self {
            dir,
            shard_count: shard_count.max(1),
            writer: AtomicWriter::new(),
        };
        let load = archive.load_all()?;
        info!(
            dir = %archive.dir.display(),
            segments = load.segments.len(),
            corrupt = load.corrupt_shards.len(),
            "opened archive"
        );
        Ok((archive, load))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn shard_count(&self) -> u32 {
        self.shard_count
    }

    pub fn writer(&self) -> &AtomicWriter {
        &self.writer
    }

    pub fn shard_path(&self, shard: u32) -> PathBuf {
        self.dir.join(shard_file_name(shard))
    }

    /// Shard numbers with a file on disk, ascending
    pub fn shard_files(&self) -> Result<Vec<u32>> {
        let entries = fs::read_dir(&self.dir).map_err(|e| ContextError::storage(&self.dir, e))?;
        let mut shards = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| ContextError::storage(&self.dir, e))?;
            if let Some(shard) = parse_shard_file_name(&entry.file_name().to_string_lossy()) {
                shards.push(shard);
            }
        }
        shards.sort_unstable();
        Ok(shards)
    }

    fn load_all(&self) -> Result<ArchiveLoad> {
        let mut load = ArchiveLoad {
            swept_temp_files: sweep_temp_files(&self.dir)?,
            ..Default::default()
        };
        if load.swept_temp_files > 0 {
            warn!(
                dir = %self.dir.display(),
                count = load.swept_temp_files,
                "removed temp files left by interrupted writes"
            );
        }

        for shard in self.shard_files()? {
            if shard >= self.shard_count {
                load.orphan_shards.push(shard);
            }
            let path = self.shard_path(shard);
            let Some(bytes) = read_optional(&path)? else {
                continue;
            };
            let segments: Vec<Segment> = match frame::decode(SHARD_MAGIC, &bytes) {
                Ok(segments) => segments,
                Err(e) => {
                    let moved = self.quarantine_shard(shard)?;
                    warn!(
                        shard,
                        error = %e,
                        quarantined = %moved.display(),
                        "shard failed to decode; moved aside"
                    );
                    load.corrupt_shards.push(shard);
                    load.quarantined.push(moved);
                    continue;
                }
            };
            for segment in segments {
                if shard_for(&segment.segment_id, self.shard_count) != shard {
                    load.misplaced += 1;
                }
                load.segments.push(segment);
            }
        }
        Ok(load)
    }

    /// Rename a shard file to `shard-NNNN.bin.corrupt-<timestamp>`
    fn quarantine_shard(&self, shard: u32) -> Result<PathBuf> {
        let from = self.shard_path(shard);
        let to = self.dir.join(quarantine_file_name(shard, Utc::now()));
        fs::rename(&from, &to).map_err(|e| ContextError::storage(&from, e))?;
        Ok(to)
    }

    /// Rewrite one shard with its full contents
    pub fn write_shard(&self, shard: u32, segments: &[Segment]) -> Result<()> {
        let path = self.shard_path(shard);
        if segments.is_empty() && !path.exists() {
            return Ok(());
        }
        let bytes = frame::encode(SHARD_MAGIC, &segments).map_err(|e| ContextError::storage(&path, e))?;
        self.writer.write(&path, &bytes)?;
        debug!(shard, segments = segments.len(), bytes = bytes.len(), "wrote shard");
        Ok(())
    }

    /// Write every snapshot; all are attempted and the first error is returned
    pub fn persist(&self, shards: &[ShardSnapshot]) -> Result<()> {
        let mut first_err = None;
        for (shard, segments) in shards {
            if let Err(e) = self.write_shard(*shard, segments) {
                warn!(shard, error = %e, "shard write failed");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Delete a shard file that no longer has a routing slot
    pub fn remove_shard_file(&self, shard: u32) -> Result<()> {
        let path = self.shard_path(shard);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ContextError::storage(&path, e)),
        }
    }

    pub fn save_index(&self, snapshot: &IndexSnapshot) -> Result<()> {
        let path = self.dir.join(INDEX_FILE);
        let bytes = frame::encode(INDEX_MAGIC, snapshot).map_err(|e| ContextError::storage(&path, e))?;
        self.writer.write(&path, &bytes)
    }

    /// An unreadable snapshot is reported as an inconsistency so the caller rebuilds
    pub fn load_index(&self) -> Result<Option<IndexSnapshot>> {
        let path = self.dir.join(INDEX_FILE);
        match read_optional(&path)? {
            Some(bytes) => frame::decode(INDEX_MAGIC, &bytes)
                .map(Some)
                .map_err(|e| ContextError::IndexInconsistency(format!("{}: {}", path.display(), e))),
            None => Ok(None),
        }
    }

    /// Drop the persisted index so a stale snapshot is never trusted again
    pub fn discard_index(&self) -> Result<()> {
        for name in [INDEX_FILE, MARKER_FILE] {
            let path = self.dir.join(name);
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(ContextError::storage(&path, e)),
            }
        }
        Ok(())
    }

    pub fn save_marker(&self, marker: &IndexMarker) -> Result<()> {
        let path = self.dir.join(MARKER_FILE);
        let bytes = serde_json::to_vec_pretty(marker)?;
        self.writer.write(&path, &bytes)
    }

    pub fn load_marker(&self) -> Result<Option<IndexMarker>> {
        let path = self.dir.join(MARKER_FILE);
        match read_optional(&path)? {
            Some(bytes) => match serde_json::from_slice(&bytes) {
                Ok(marker) => Ok(Some(marker)),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "ignoring unreadable index marker");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }
}

fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(ContextError::storage(path, e)),
    }
}
