//! The coordinator presents many segments as one continuous offset space.
//!
//! It owns the active (writable) segment, a catalogue of known segment base
//! offsets, and the last offset written. Historical segments are reopened on
//! demand for reads — a [`Segment`] is a thin handle over paths, not a held
//! file descriptor, so this costs nothing beyond a directory-less `open`.

use crate::EventSourceResult;
use crate::errors::EventSourceError;
use crate::storage::segment::{
    DEFAULT_INDEX_INTERVAL, DEFAULT_MAX_LOG_SIZE, LOG_FILE_SUFFIX, ReadTo, Record, Segment,
};
use std::path::{Path, PathBuf};
use tracing::{info, instrument, warn};

/// Construction parameters, mirroring the tunables in the external
/// interface: `log_store_path`, `max_log_size`, `index_interval`.
#[derive(Debug, Clone)]
pub struct EventSourceConfig {
    pub log_store_path: PathBuf,
    pub max_log_size: u64,
    pub index_interval: u64,
}

impl Default for EventSourceConfig {
    fn default() -> Self {
        EventSourceConfig {
            log_store_path: PathBuf::from("logs"),
            max_log_size: DEFAULT_MAX_LOG_SIZE,
            index_interval: DEFAULT_INDEX_INTERVAL,
        }
    }
}

/// One decoded record returned to callers, decoupled from the on-disk
/// [`Record`] representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub offset: u64,
    pub timestamp_ns: u64,
    pub size: u32,
    pub data: Vec<u8>,
}

impl From<Record> for Event {
    fn from(r: Record) -> Self {
        Event {
            offset: r.offset,
            timestamp_ns: r.timestamp_ns,
            size: r.payload_size,
            data: r.payload,
        }
    }
}

pub struct EventSource {
    config: EventSourceConfig,
    /// Ascending base offsets of every known segment.
    segments: Vec<u64>,
    active: Segment,
    last_offset: Option<u64>,
}

impl EventSource {
    /// Opens (or bootstraps) an event source rooted at `config.log_store_path`.
    ///
    /// The directory must already exist; this engine never creates it.
    #[instrument(skip_all, fields(path = ?config.log_store_path))]
    pub fn open(config: EventSourceConfig) -> EventSourceResult<Self> {
        let mut segments = discover_segments(&config.log_store_path)?;

        let active_base = if segments.is_empty() {
            segments.push(0);
            0
        } else {
            *segments.last().unwrap()
        };

        let active = Segment::open(
            &config.log_store_path,
            active_base,
            config.max_log_size,
            config.index_interval,
        )?;

        let last_offset = if active_log_is_empty(&config.log_store_path, active_base)? {
            None
        } else {
            Some(active.last_offset()?)
        };

        info!(
            segments = segments.len(),
            active_base,
            ?last_offset,
            "event source bootstrapped"
        );

        Ok(EventSource {
            config,
            segments,
            active,
            last_offset,
        })
    }

    pub fn last_offset(&self) -> Option<u64> {
        self.last_offset
    }

    /// Appends `payload`, rolling over to a new segment transparently if the
    /// active one is full, and returns the offset assigned to the record.
    #[instrument(skip(self, payload), fields(payload_len = payload.len()))]
    pub fn write(&mut self, payload: &[u8]) -> EventSourceResult<u64> {
        let next = match self.last_offset {
            None => 0,
            Some(last) => last + 1,
        };

        loop {
            match self.active.append(next, payload) {
                Ok(_) => {
                    self.last_offset = Some(next);
                    return Ok(next);
                }
                Err(crate::errors::SegmentError::LogSizeExceeded { .. }) => {
                    warn!(rollover_base = next, "segment full, rolling over");
                    self.segments.push(next);
                    self.active = Segment::open(
                        &self.config.log_store_path,
                        next,
                        self.config.max_log_size,
                        self.config.index_interval,
                    )?;
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Returns the single record at `offset`.
    #[instrument(skip(self), fields(offset))]
    pub fn get(&self, offset: u64) -> EventSourceResult<Event> {
        let base = self.segment_covering(offset)?;
        let segment = self.open_segment(base)?;
        let mut records = segment.get(offset, ReadTo::Exact(offset))?;
        records
            .pop()
            .map(Event::from)
            .ok_or(EventSourceError::CouldNotFindOffset { offset })
    }

    /// Returns the `n` records starting at `offset`, contiguous in
    /// absolute-offset space, possibly spanning several segments.
    #[instrument(skip(self), fields(offset, n))]
    pub fn get_batch(&self, offset: u64, n: u64) -> EventSourceResult<Vec<Event>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let final_offset = offset + n - 1;
        let selected = self.select_segments(offset, final_offset)?;

        let mut events = Vec::with_capacity(n as usize);
        let last_index = selected.len() - 1;
        for (i, base) in selected.iter().enumerate() {
            let segment = self.open_segment(*base)?;
            let start = offset.max(*base);
            let end = if i == last_index {
                ReadTo::Exact(final_offset)
            } else {
                ReadTo::EndOfSegment
            };
            let records = segment.get(start, end)?;
            events.extend(records.into_iter().map(Event::from));
        }

        Ok(events)
    }

    fn open_segment(&self, base: u64) -> EventSourceResult<Segment> {
        Segment::open(
            &self.config.log_store_path,
            base,
            self.config.max_log_size,
            self.config.index_interval,
        )
        .map_err(EventSourceError::from)
    }

    /// The largest known base offset `<= offset`, i.e. the segment that owns
    /// it.
    fn segment_covering(&self, offset: u64) -> EventSourceResult<u64> {
        self.segments
            .iter()
            .rev()
            .find(|&&base| base <= offset)
            .copied()
            .ok_or(EventSourceError::CouldNotFindOffset { offset })
    }

    /// The ordered bases of every segment intersecting `[offset, final_offset]`:
    /// the unique segment owning `offset`, plus every subsequent segment whose
    /// base is `<= final_offset`.
    fn select_segments(&self, offset: u64, final_offset: u64) -> EventSourceResult<Vec<u64>> {
        let start_idx = self
            .segments
            .iter()
            .rposition(|&base| base <= offset)
            .ok_or(EventSourceError::CouldNotFindOffset { offset })?;

        let mut selected = vec![self.segments[start_idx]];
        for &base in &self.segments[start_idx + 1..] {
            if base > final_offset {
                break;
            }
            selected.push(base);
        }
        Ok(selected)
    }
}

fn discover_segments(log_store_path: &Path) -> EventSourceResult<Vec<u64>> {
    let mut bases = Vec::new();
    let entries = std::fs::read_dir(log_store_path).map_err(|source| {
        EventSourceError::DirectoryError {
            path: log_store_path.to_string_lossy().into_owned(),
            source,
        }
    })?;

    for entry in entries {
        let entry = entry.map_err(|source| EventSourceError::DirectoryError {
            path: log_store_path.to_string_lossy().into_owned(),
            source,
        })?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(stem) = name.strip_suffix(LOG_FILE_SUFFIX) {
            if let Ok(base) = stem.parse::<u64>() {
                bases.push(base);
            }
        }
    }

    bases.sort_unstable();
    Ok(bases)
}

fn active_log_is_empty(log_store_path: &Path, base_offset: u64) -> EventSourceResult<bool> {
    let path = log_store_path.join(format!(
        "{}{LOG_FILE_SUFFIX}",
        crate::storage::segment::filename_stem(base_offset)
    ));
    let size = std::fs::metadata(&path)
        .map_err(|source| EventSourceError::DirectoryError {
            path: path.to_string_lossy().into_owned(),
            source,
        })?
        .len();
    Ok(size == 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Once;
    use tempfile::TempDir;
    use tracing_subscriber::{EnvFilter, fmt};

    static INIT_TRACING: Once = Once::new();

    fn init_tracing() {
        INIT_TRACING.call_once(|| {
            let _ = fmt()
                .with_env_filter(
                    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
                )
                .with_test_writer()
                .try_init();
        });
    }

    fn config(dir: &TempDir) -> EventSourceConfig {
        EventSourceConfig {
            log_store_path: dir.path().to_path_buf(),
            max_log_size: 1024 * 1024,
            index_interval: 4096,
        }
    }

    #[test]
    fn bootstrap_on_empty_directory_starts_at_offset_zero() -> EventSourceResult<()> {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let source = EventSource::open(config(&dir))?;
        assert_eq!(source.last_offset(), None);
        Ok(())
    }

    #[test]
    fn write_assigns_monotonically_increasing_offsets() -> EventSourceResult<()> {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let mut source = EventSource::open(config(&dir))?;

        assert_eq!(source.write(b"a")?, 0);
        assert_eq!(source.write(b"b")?, 1);
        assert_eq!(source.write(b"c")?, 2);
        Ok(())
    }

    #[test]
    fn round_trip_write_then_get() -> EventSourceResult<()> {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let mut source = EventSource::open(config(&dir))?;

        let offset = source.write(b"hello world")?;
        let event = source.get(offset)?;

        assert_eq!(event.offset, offset);
        assert_eq!(event.data, b"hello world");
        assert_eq!(event.size, 11);
        Ok(())
    }

    #[test]
    fn get_batch_returns_contiguous_events() -> EventSourceResult<()> {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let mut source = EventSource::open(config(&dir))?;

        for i in 0..20u64 {
            source.write(&i.to_le_bytes())?;
        }

        let batch = source.get_batch(5, 10)?;
        assert_eq!(batch.len(), 10);
        for (i, event) in batch.iter().enumerate() {
            assert_eq!(event.offset, 5 + i as u64);
            assert_eq!(u64::from_le_bytes(event.data.clone().try_into().unwrap()), 5 + i as u64);
        }
        Ok(())
    }

    #[test]
    fn rollover_creates_a_new_segment_and_keeps_offsets_contiguous() -> EventSourceResult<()> {
        init_tracing();
        let dir = TempDir::new().unwrap();
        // Small enough that a handful of records force a rollover.
        let mut small_config = config(&dir);
        small_config.max_log_size = 200;
        let mut source = EventSource::open(small_config)?;

        let payload = vec![0u8; 50];
        let mut offsets = Vec::new();
        for _ in 0..10 {
            offsets.push(source.write(&payload)?);
        }

        assert_eq!(offsets, (0..10).collect::<Vec<_>>());
        assert!(source.segments.len() > 1);
        Ok(())
    }

    #[test]
    fn get_works_transparently_across_a_segment_boundary() -> EventSourceResult<()> {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let mut small_config = config(&dir);
        small_config.max_log_size = 200;
        let mut source = EventSource::open(small_config)?;

        let payload = vec![1u8; 50];
        for _ in 0..10 {
            source.write(&payload)?;
        }

        for offset in 0..10u64 {
            let event = source.get(offset)?;
            assert_eq!(event.offset, offset);
        }
        Ok(())
    }

    #[test]
    fn get_batch_spans_two_segments() -> EventSourceResult<()> {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let mut small_config = config(&dir);
        small_config.max_log_size = 200;
        let mut source = EventSource::open(small_config)?;

        let payload = vec![2u8; 50];
        for _ in 0..10 {
            source.write(&payload)?;
        }

        let second_base = source.segments[1];
        let batch = source.get_batch(second_base - 1, 2)?;
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].offset, second_base - 1);
        assert_eq!(batch[1].offset, second_base);
        Ok(())
    }

    #[test]
    fn get_of_unknown_offset_fails() -> EventSourceResult<()> {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let source = EventSource::open(config(&dir))?;

        let err = source.get(42).unwrap_err();
        assert!(matches!(err, EventSourceError::CouldNotFindOffset { .. }));
        Ok(())
    }

    #[test]
    fn recovery_resumes_from_the_correct_next_offset() -> EventSourceResult<()> {
        init_tracing();
        let dir = TempDir::new().unwrap();
        {
            let mut source = EventSource::open(config(&dir))?;
            for i in 0..100u64 {
                source.write(&i.to_le_bytes())?;
            }
        }

        let mut reopened = EventSource::open(config(&dir))?;
        assert_eq!(reopened.last_offset(), Some(99));
        let next = reopened.write(b"after reopen")?;
        assert_eq!(next, 100);
        Ok(())
    }
}
