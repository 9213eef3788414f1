//! Persistence primitives: checksummed frames, atomic file replacement and
//! the per-project sharded archive.

mod archive;
mod atomic;
pub mod frame;

pub use archive::{shard_file_name, shard_for, ArchiveLoad, IndexMarker, ShardedArchive};
pub use atomic::{is_temp_file, sweep_temp_files, AtomicWriter};
