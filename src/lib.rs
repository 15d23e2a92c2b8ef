#![doc = include_str!("../README.md")]
// Declare modules
pub mod appender;
pub mod clock;
pub mod error;
pub mod head;
pub mod index;
pub mod labels;
pub mod series;
pub mod stripe;
pub mod telemetry;
pub mod types;
pub mod wal;

/// Batched append transaction.
pub use crate::appender::{Appender, CommitSummary, RejectedSample};
/// Ingest clock used for series liveness.
pub use crate::clock::{Clock, ManualClock, SystemClock};
/// Error type for head operations.
pub use crate::error::HeadError;
/// Main entry point: the in-memory head and its configuration.
pub use crate::head::{CheckpointStats, GcStats, Head, HeadOptions, HeadStats, ReplayStats};
/// Sharded series index.
pub use crate::index::SeriesIndex;
/// Series identity.
pub use crate::labels::{Label, Labels};
/// Read-side view of a series.
pub use crate::series::{MemChunk, SeriesSnapshot};
/// Structured event hook for observability.
pub use crate::telemetry::{HeadEvent, HeadEventListener, TracingEventListener};
/// Core value types.
pub use crate::types::{RefSample, Sample, SeriesRef, Timestamp, Value};
/// Durability hand-off and the file-backed write-ahead log.
pub use crate::wal::{DurabilityLog, LogRecord, NoopLog, WriteAheadLog};
