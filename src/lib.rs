pub mod errors;
pub mod storage;

use crate::errors::*;

/// Type alias for `Result`s returned by the index layer.
pub type IndexResult<T> = Result<T, IndexError>;
/// Type alias for `Result`s returned by the segment layer.
pub type SegmentResult<T> = Result<T, SegmentError>;
/// Type alias for `Result`s returned by the event source coordinator.
pub type EventSourceResult<T> = Result<T, EventSourceError>;

pub use storage::event_source::{Event, EventSource, EventSourceConfig};
