use std::io;
use thiserror::Error;

/// Errors raised by the sparse index file.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("failed to open index file {path}")]
    OpenFailed {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to append entry to index at relative offset {relative_offset}")]
    WriteFailed {
        relative_offset: u32,
        #[source]
        source: io::Error,
    },

    #[error("failed to read index entry {index}")]
    ReadFailed {
        index: u64,
        #[source]
        source: io::Error,
    },

    #[error("index file is empty")]
    Empty,

    #[error("offset {target} is missing from the index (first entry is {first})")]
    OffsetMissingInIndex { target: u32, first: u32 },
}

/// Errors raised by a single log segment.
#[derive(Debug, Error)]
pub enum SegmentError {
    #[error("payload of {size} bytes exceeds the maximum of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    /// Internal rollover signal. Caught one layer up, in
    /// `EventSource::write`'s retry loop; never surfaced to a caller of the
    /// public API.
    #[error("segment base={base_offset} is full ({current_size}/{max_size} bytes)")]
    LogSizeExceeded {
        base_offset: u64,
        current_size: u64,
        max_size: u64,
    },

    #[error("failed to open log file {path}")]
    OpenFailed {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O failure reading or writing segment data")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Index(#[from] IndexError),
}

/// Errors raised by the top-level coordinator.
#[derive(Debug, Error)]
pub enum EventSourceError {
    #[error("no segment covers offset {offset}")]
    CouldNotFindOffset { offset: u64 },

    #[error("failed to list segments under {path}")]
    DirectoryError {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Segment(#[from] SegmentError),

    #[error(transparent)]
    Index(#[from] IndexError),
}

/// Extension trait that attaches index-specific context to a raw I/O result.
pub trait IndexContext<T> {
    fn with_open_context(self, path: &str) -> Result<T, IndexError>;
    fn with_write_context(self, relative_offset: u32) -> Result<T, IndexError>;
    fn with_read_context(self, index: u64) -> Result<T, IndexError>;
}

impl<T> IndexContext<T> for Result<T, io::Error> {
    fn with_open_context(self, path: &str) -> Result<T, IndexError> {
        self.map_err(|source| IndexError::OpenFailed {
            path: path.to_string(),
            source,
        })
    }

    fn with_write_context(self, relative_offset: u32) -> Result<T, IndexError> {
        self.map_err(|source| IndexError::WriteFailed {
            relative_offset,
            source,
        })
    }

    fn with_read_context(self, index: u64) -> Result<T, IndexError> {
        self.map_err(|source| IndexError::ReadFailed { index, source })
    }
}

/// Extension trait that attaches segment-specific context to a raw I/O result.
pub trait SegmentContext<T> {
    fn with_open_context(self, path: &str) -> Result<T, SegmentError>;
}

impl<T> SegmentContext<T> for Result<T, io::Error> {
    fn with_open_context(self, path: &str) -> Result<T, SegmentError> {
        self.map_err(|source| SegmentError::OpenFailed {
            path: path.to_string(),
            source,
        })
    }
}
