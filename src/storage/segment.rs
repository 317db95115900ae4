//! A log segment pairs one `.log` data file with its `.index` file and
//! covers a contiguous, immutable-once-rolled range of offsets starting at
//! `base_offset`.

use crate::SegmentResult;
use crate::errors::{IndexError, SegmentContext, SegmentError};
use crate::storage::index::Index;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument};

/// 8-byte offset + 8-byte timestamp + 4-byte payload size.
pub const METADATA_SIZE: u64 = 20;
/// Largest payload a single record may carry.
pub const MAX_PAYLOAD_SIZE: usize = 1 << 16;
/// Default ceiling on a segment's on-disk size (~4 GiB).
pub const DEFAULT_MAX_LOG_SIZE: u64 = 1 << 32;
/// Default stride, in bytes, between sparse index entries.
pub const DEFAULT_INDEX_INTERVAL: u64 = 1 << 12;

pub const LOG_FILE_SUFFIX: &str = ".log";

/// A single decoded record, including its framing metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub offset: u64,
    pub timestamp_ns: u64,
    pub payload_size: u32,
    pub payload: Vec<u8>,
}

/// How far a `get` scan should read before stopping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadTo {
    Exact(u64),
    EndOfSegment,
}

/// Renders a base offset as a 20-character zero-padded decimal filename stem.
pub fn filename_stem(base_offset: u64) -> String {
    format!("{base_offset:020}")
}

pub struct Segment {
    log_path: PathBuf,
    index: Index,
    base_offset: u64,
    max_log_size: u64,
    index_interval: u64,
    /// Log size as of the most recent index append. `None` means no index
    /// entry has been written yet in this process's lifetime — which, as in
    /// the source, forces the very next append to write one even if the
    /// segment already has entries on disk from a previous run.
    last_indexed_size: Option<u64>,
}

impl Segment {
    #[instrument(skip_all, fields(base_offset))]
    pub fn open(
        log_store_path: impl AsRef<Path>,
        base_offset: u64,
        max_log_size: u64,
        index_interval: u64,
    ) -> SegmentResult<Self> {
        let stem = filename_stem(base_offset);
        let log_path = log_store_path.as_ref().join(format!("{stem}{LOG_FILE_SUFFIX}"));
        let index_path = log_store_path
            .as_ref()
            .join(format!("{stem}{}", crate::storage::index::INDEX_FILE_SUFFIX));

        debug!(?log_path, ?index_path, "opening segment");

        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .with_open_context(&log_path.to_string_lossy())?;

        let index = Index::new(&index_path)?;

        Ok(Segment {
            log_path,
            index,
            base_offset,
            max_log_size,
            index_interval,
            last_indexed_size: None,
        })
    }

    pub fn base_offset(&self) -> u64 {
        self.base_offset
    }

    fn log_size(&self) -> SegmentResult<u64> {
        Ok(std::fs::metadata(&self.log_path)
            .with_open_context(&self.log_path.to_string_lossy())?
            .len())
    }

    /// Appends `payload` at `absolute_offset` and returns the segment's new
    /// on-disk size. Returns `SegmentError::LogSizeExceeded` without
    /// modifying either file when the record would not fit, and
    /// `SegmentError::PayloadTooLarge` when the payload itself is oversized.
    #[instrument(skip(self, payload), fields(absolute_offset, payload_len = payload.len()))]
    pub fn append(&mut self, absolute_offset: u64, payload: &[u8]) -> SegmentResult<u64> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(SegmentError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let pre_size = self.log_size()?;
        let total_len = METADATA_SIZE + payload.len() as u64;
        if pre_size + total_len > self.max_log_size {
            return Err(SegmentError::LogSizeExceeded {
                base_offset: self.base_offset,
                current_size: pre_size,
                max_size: self.max_log_size,
            });
        }

        let timestamp_ns = now_ns();
        let mut buf = Vec::with_capacity(total_len as usize);
        buf.extend_from_slice(&absolute_offset.to_le_bytes());
        buf.extend_from_slice(&timestamp_ns.to_le_bytes());
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(payload);

        let mut file = OpenOptions::new()
            .append(true)
            .open(&self.log_path)
            .with_open_context(&self.log_path.to_string_lossy())?;
        file.write_all(&buf)?;

        let new_size = pre_size + total_len;

        let should_index = match self.last_indexed_size {
            None => true,
            Some(last) => new_size > last + self.index_interval,
        };
        if should_index {
            let relative_offset = (absolute_offset - self.base_offset) as u32;
            self.index.append(relative_offset, pre_size as u32)?;
            self.last_indexed_size = Some(new_size);
        }

        info!(
            absolute_offset,
            position = pre_size,
            new_size,
            indexed = should_index,
            "appended record to segment"
        );
        Ok(new_size)
    }

    /// Reads the record(s) covering `[offset, offset_end]` (inclusive),
    /// bounded by this segment.
    #[instrument(skip(self), fields(offset))]
    pub fn get(&self, offset: u64, offset_end: ReadTo) -> SegmentResult<Vec<Record>> {
        if offset < self.base_offset {
            let first = self.index.read(0)?.relative_offset;
            return Err(SegmentError::Index(IndexError::OffsetMissingInIndex {
                target: 0,
                first,
            }));
        }
        let relative = (offset - self.base_offset) as u32;
        let start_entry = self.index.search(relative)?;

        let stop_at = match offset_end {
            ReadTo::Exact(end) => Some(end),
            ReadTo::EndOfSegment => None,
        };

        let mut file =
            File::open(&self.log_path).with_open_context(&self.log_path.to_string_lossy())?;
        file.seek(SeekFrom::Start(start_entry.physical_position as u64))?;

        let mut results = Vec::new();
        let mut meta = [0u8; METADATA_SIZE as usize];
        loop {
            let read = read_fully_or_eof(&mut file, &mut meta)?;
            if read < meta.len() {
                // EOF, or a truncated tail too short for a full metadata
                // header: treated as end-of-data.
                break;
            }

            let record_offset = u64::from_le_bytes(meta[0..8].try_into().unwrap());
            let timestamp_ns = u64::from_le_bytes(meta[8..16].try_into().unwrap());
            let payload_size = u32::from_le_bytes(meta[16..20].try_into().unwrap());

            if record_offset >= offset {
                let mut payload = vec![0u8; payload_size as usize];
                let read = read_fully_or_eof(&mut file, &mut payload)?;
                if read < payload.len() {
                    // Truncated payload on a partially written tail record.
                    break;
                }
                results.push(Record {
                    offset: record_offset,
                    timestamp_ns,
                    payload_size,
                    payload,
                });
            } else {
                file.seek(SeekFrom::Current(payload_size as i64))?;
            }

            if let Some(end) = stop_at {
                if record_offset == end {
                    break;
                }
            }
        }

        debug!(found = results.len(), "segment scan finished");
        Ok(results)
    }

    /// Recovers the last offset written to this segment, even though the
    /// index itself is sparse.
    #[instrument(skip(self))]
    pub fn last_offset(&self) -> SegmentResult<u64> {
        let anchor = self.index.last().map_err(SegmentError::Index)?;

        let mut file =
            File::open(&self.log_path).with_open_context(&self.log_path.to_string_lossy())?;
        file.seek(SeekFrom::Start(anchor.physical_position as u64))?;

        let mut meta = [0u8; METADATA_SIZE as usize];
        let mut last_meta_position = anchor.physical_position as u64;
        loop {
            let position_before = file.stream_position()?;
            let read = read_fully_or_eof(&mut file, &mut meta)?;
            if read < meta.len() {
                // EOF (or a truncated tail): re-decode the last good
                // metadata we saw and return its offset.
                file.seek(SeekFrom::Start(last_meta_position))?;
                file.read_exact(&mut meta)?;
                let offset = u64::from_le_bytes(meta[0..8].try_into().unwrap());
                return Ok(offset);
            }
            last_meta_position = position_before;
            let payload_size = u32::from_le_bytes(meta[16..20].try_into().unwrap());
            file.seek(SeekFrom::Current(payload_size as i64))?;
        }
    }
}

/// Reads up to `buf.len()` bytes, stopping cleanly at EOF instead of
/// erroring, so a short read can be distinguished from an I/O failure.
fn read_fully_or_eof(file: &mut File, buf: &mut [u8]) -> Result<usize, std::io::Error> {
    let mut total = 0;
    while total < buf.len() {
        let n = file.read(&mut buf[total..])?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}

fn now_ns() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock is before the unix epoch")
        .as_nanos() as u64
}
