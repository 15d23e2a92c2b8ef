use thiserror::Error;

use crate::types::{SeriesRef, Timestamp};

/// Error type for head operations.
///
/// Sample-level kinds (see [`HeadError::is_sample_error`]) reject one sample and leave the
/// rest of the batch untouched. Everything else is structural and aborts the operation.
#[derive(Error, Debug)]
pub enum HeadError {
    #[error("out of order sample: series={series_ref}, timestamp={timestamp}, last={last}")]
    OutOfOrderSample {
        series_ref: SeriesRef,
        timestamp: Timestamp,
        last: Timestamp,
    },

    #[error("duplicate sample for timestamp {timestamp} with a different value: series={series_ref}")]
    DuplicateSample {
        series_ref: SeriesRef,
        timestamp: Timestamp,
    },

    #[error("sample timestamp {timestamp} is older than the minimum valid time {min_valid_time}")]
    OutOfBounds {
        timestamp: Timestamp,
        min_valid_time: Timestamp,
    },

    #[error("unknown series reference: {0}")]
    UnknownReference(SeriesRef),

    #[error("empty label set")]
    EmptyLabelSet,

    #[error("invalid label set: {0}")]
    InvalidLabels(String),

    /// A shard ran out of local sequence numbers. The head must be rotated.
    #[error("series reference space exhausted in shard {shard}")]
    ReferenceSpaceExhausted { shard: usize },

    /// The two index mappings disagree. Indicates a bug; callers should abort.
    #[error("index corruption: {0}")]
    IndexCorruption(String),

    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization Error: {0}")]
    Serialization(String),

    #[error("Corruption detected: {details}")]
    Corruption { details: String, offset: Option<u64> },

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Lock acquisition failed: {0}")]
    LockError(String),

    #[error("Background task error: {0}")]
    BackgroundTaskError(String),

    /// A failed append could not be cut off the log, so further appends are refused.
    #[error("durability log closed after an unrecoverable write failure")]
    LogClosed,
}

impl HeadError {
    /// Returns true for errors that reject a single sample without aborting its batch.
    pub fn is_sample_error(&self) -> bool {
        matches!(
            self,
            HeadError::OutOfOrderSample { .. }
                | HeadError::DuplicateSample { .. }
                | HeadError::OutOfBounds { .. }
                | HeadError::UnknownReference(_)
        )
    }

    /// Short, stable name used as the `reason` label on rejection metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            HeadError::OutOfOrderSample { .. } => "out_of_order",
            HeadError::DuplicateSample { .. } => "duplicate",
            HeadError::OutOfBounds { .. } => "out_of_bounds",
            HeadError::UnknownReference(_) => "unknown_reference",
            HeadError::EmptyLabelSet | HeadError::InvalidLabels(_) => "invalid_labels",
            _ => "internal",
        }
    }
}

// Implement conversion from lock poison errors for convenience
impl<T> From<std::sync::PoisonError<T>> for HeadError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        HeadError::LockError(format!("Mutex/RwLock poisoned: {}", err))
    }
}

impl From<bincode::Error> for HeadError {
    fn from(err: bincode::Error) -> Self {
        HeadError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_errors_are_classified() {
        assert!(HeadError::UnknownReference(SeriesRef(7)).is_sample_error());
        assert!(HeadError::DuplicateSample {
            series_ref: SeriesRef(1),
            timestamp: 3
        }
        .is_sample_error());
        assert!(!HeadError::ReferenceSpaceExhausted { shard: 0 }.is_sample_error());
        assert!(!HeadError::IndexCorruption("x".into()).is_sample_error());
    }

    #[test]
    fn poison_maps_to_lock_error() {
        let lock = std::sync::Arc::new(std::sync::Mutex::new(()));
        let l2 = lock.clone();
        let _ = std::thread::spawn(move || {
            let _g = l2.lock().unwrap();
            panic!("poison");
        })
        .join();
        let err: HeadError = lock.lock().unwrap_err().into();
        assert!(matches!(err, HeadError::LockError(_)));
    }
}
