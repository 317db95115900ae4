//! The sparse index speeds up reads. It maps a segment's relative offsets to
//! byte positions in that segment's `.log` file. Reading a record is a
//! two-step process: find the nearest-floor entry in the index, then scan
//! forward in the log file from the position it names.

use crate::IndexResult;
use crate::errors::{IndexContext, IndexError};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument};

/// Each entry is two little-endian u32s: `[relative_offset, physical_position]`.
pub const INDEX_ENTRY_SIZE: u64 = 8;
pub const INDEX_FILE_SUFFIX: &str = ".index";

/// One `(relative_offset, physical_position)` pair decoded from the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub relative_offset: u32,
    pub physical_position: u32,
}

/// A flat, append-only array of [`IndexEntry`] backing one log segment.
///
/// The file is opened and closed on every operation; no handle is held
/// across calls, so multiple processes may safely read the same file while
/// a single writer appends to it.
pub struct Index {
    path: PathBuf,
}

impl Index {
    #[instrument(skip_all, fields(path = ?path.as_ref()))]
    pub fn new(path: impl AsRef<Path>) -> IndexResult<Self> {
        let path = path.as_ref().to_path_buf();
        debug!("opening index file");

        // Touch the file into existence so later opens never hit NotFound.
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_open_context(&path.to_string_lossy())?;

        Ok(Index { path })
    }

    fn path_str(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }

    /// Number of bytes currently on disk. Always a multiple of
    /// [`INDEX_ENTRY_SIZE`].
    pub fn len_bytes(&self) -> IndexResult<u64> {
        let meta = std::fs::metadata(&self.path).with_open_context(&self.path_str())?;
        Ok(meta.len())
    }

    /// Number of entries currently on disk.
    pub fn len(&self) -> IndexResult<u64> {
        Ok(self.len_bytes()? / INDEX_ENTRY_SIZE)
    }

    pub fn is_empty(&self) -> IndexResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Appends one entry. Callers must only ever pass strictly increasing
    /// `relative_offset` values; the index does not itself check this.
    #[instrument(skip(self))]
    pub fn append(&self, relative_offset: u32, physical_position: u32) -> IndexResult<u64> {
        let mut file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .with_open_context(&self.path_str())?;

        let mut buf = [0u8; INDEX_ENTRY_SIZE as usize];
        buf[0..4].copy_from_slice(&relative_offset.to_le_bytes());
        buf[4..8].copy_from_slice(&physical_position.to_le_bytes());

        file.write_all(&buf).with_write_context(relative_offset)?;

        let new_size = file.metadata().with_open_context(&self.path_str())?.len();
        debug!(
            relative_offset,
            physical_position, new_size, "appended index entry"
        );
        Ok(new_size)
    }

    /// Reads the `i`th entry, for diagnostics.
    #[instrument(skip(self))]
    pub fn read(&self, i: u64) -> IndexResult<IndexEntry> {
        let mut file = File::open(&self.path).with_open_context(&self.path_str())?;
        file.seek(SeekFrom::Start(i * INDEX_ENTRY_SIZE))
            .with_read_context(i)?;
        read_entry(&mut file, i)
    }

    /// Returns the final entry in the index.
    #[instrument(skip(self))]
    pub fn last(&self) -> IndexResult<IndexEntry> {
        let mut file = File::open(&self.path).with_open_context(&self.path_str())?;
        let size = file.metadata().with_open_context(&self.path_str())?.len();
        if size == 0 {
            return Err(IndexError::Empty);
        }
        let last_index = size / INDEX_ENTRY_SIZE - 1;
        file.seek(SeekFrom::End(-(INDEX_ENTRY_SIZE as i64)))
            .with_read_context(last_index)?;
        read_entry(&mut file, last_index)
    }

    /// Returns the entry with the greatest `relative_offset <= target`.
    ///
    /// Fails with [`IndexError::OffsetMissingInIndex`] when `target` is
    /// smaller than the first entry's `relative_offset`. When `target` is at
    /// or beyond the last entry, the last entry is returned — the segment's
    /// linear scan handles narrowing from there.
    #[instrument(skip(self))]
    pub fn search(&self, target: u32) -> IndexResult<IndexEntry> {
        let mut file = File::open(&self.path).with_open_context(&self.path_str())?;
        let size = file.metadata().with_open_context(&self.path_str())?.len();
        if size == 0 {
            return Err(IndexError::Empty);
        }

        let mut floor_index = 0u64;
        let mut floor = read_entry(&mut file, floor_index)?;
        if floor.relative_offset > target {
            return Err(IndexError::OffsetMissingInIndex {
                target,
                first: floor.relative_offset,
            });
        }

        let mut ceil_index = size / INDEX_ENTRY_SIZE - 1;

        let mut iterations = 0u32;
        loop {
            iterations += 1;
            if floor_index == ceil_index {
                info!(iterations, "index search converged to a single entry");
                return Ok(floor);
            }

            let mid_index = (floor_index + ceil_index) / 2;
            let mid = read_entry(&mut file, mid_index)?;

            if mid.relative_offset == target {
                info!(iterations, "index search found exact entry");
                return Ok(mid);
            }
            if mid.relative_offset > target && mid_index == floor_index + 1 {
                info!(iterations, "index search converged on floor");
                return Ok(floor);
            }
            if mid.relative_offset > target {
                ceil_index = mid_index;
                continue;
            }
            if mid.relative_offset < target && mid_index == ceil_index - 1 {
                info!(iterations, "index search converged on probe");
                return Ok(mid);
            }
            // mid.relative_offset < target
            floor_index = mid_index;
            floor = mid;
        }
    }
}

fn read_entry(file: &mut File, index: u64) -> IndexResult<IndexEntry> {
    file.seek(SeekFrom::Start(index * INDEX_ENTRY_SIZE))
        .with_read_context(index)?;
    let mut buf = [0u8; INDEX_ENTRY_SIZE as usize];
    file.read_exact(&mut buf).with_read_context(index)?;
    Ok(IndexEntry {
        relative_offset: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
        physical_position: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
    })
}
