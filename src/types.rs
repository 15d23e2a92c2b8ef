use serde::{Deserialize, Serialize};
use std::fmt;

/// Timestamp type (milliseconds since epoch). Signed so pre-1970 samples are representable.
pub type Timestamp = i64;

/// Value type.
pub type Value = f64;

/// Opaque numeric handle of a series inside the head.
///
/// Assigned once when the series is created and never handed out again, even after the
/// series is garbage collected. Zero is never a valid reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeriesRef(pub u64);

impl fmt::Display for SeriesRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single (timestamp, value) pair of a series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: Timestamp,
    pub value: Value,
}

impl Sample {
    pub fn new(timestamp: Timestamp, value: Value) -> Self {
        Self { timestamp, value }
    }
}

/// A sample addressed to a series by reference, as stored in appender batches and the log.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RefSample {
    pub series_ref: SeriesRef,
    pub timestamp: Timestamp,
    pub value: Value,
}
