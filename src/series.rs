//! Per-series ingestion state: last committed sample, the open head chunk and the list of
//! sealed chunks.
//!
//! A [`MemSeries`] lives inside its shard of the series index and is only mutated while that
//! shard's write lock is held. The few flags that are touched under a read lock are atomics.

use crate::error::HeadError;
use crate::labels::Labels;
use crate::types::{Sample, SeriesRef, Timestamp, Value};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

/// Limits that decide when the head chunk of a series is sealed.
#[derive(Debug, Clone, Copy)]
pub struct ChunkBounds {
    /// Width of the aligned time window a chunk may span (milliseconds).
    pub chunk_range: i64,
    /// Maximum number of samples in one chunk.
    pub samples_per_chunk: usize,
}

/// A time-ordered run of samples. Immutable once sealed.
#[derive(Debug, Clone, PartialEq)]
pub struct MemChunk {
    samples: Vec<Sample>,
}

impl MemChunk {
    fn with_capacity(cap: usize) -> Self {
        Self {
            samples: Vec::with_capacity(cap),
        }
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn min_time(&self) -> Option<Timestamp> {
        self.samples.first().map(|s| s.timestamp)
    }

    pub fn max_time(&self) -> Option<Timestamp> {
        self.samples.last().map(|s| s.timestamp)
    }
}

/// Outcome of a successful append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Appended {
    pub chunk_created: bool,
}

#[derive(Debug)]
pub struct MemSeries {
    series_ref: SeriesRef,
    /// Fingerprint the index filed this series under.
    fingerprint: u64,
    labels: Labels,
    sealed: Vec<Arc<MemChunk>>,
    head: Option<MemChunk>,
    /// Timestamp at which the head chunk gets cut.
    next_at: Timestamp,
    last: Option<Sample>,
    /// Ingest clock reading (ms) of creation or of the last committed write.
    last_write: i64,
    /// Number of open appenders holding samples for this series.
    pending: AtomicU32,
    /// Lookups that returned this series to a caller after it was created.
    observed: AtomicU32,
    /// Set once the series' identity has been handed to the durability log.
    logged: AtomicBool,
}

impl MemSeries {
    pub(crate) fn new(series_ref: SeriesRef, fingerprint: u64, labels: Labels, now: i64) -> Self {
        Self {
            series_ref,
            fingerprint,
            labels,
            sealed: Vec::new(),
            head: None,
            next_at: Timestamp::MIN,
            last: None,
            last_write: now,
            pending: AtomicU32::new(0),
            observed: AtomicU32::new(0),
            logged: AtomicBool::new(false),
        }
    }

    pub fn series_ref(&self) -> SeriesRef {
        self.series_ref
    }

    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    pub fn labels(&self) -> &Labels {
        &self.labels
    }

    pub fn last_sample(&self) -> Option<Sample> {
        self.last
    }

    pub fn last_write(&self) -> i64 {
        self.last_write
    }

    pub fn num_samples(&self) -> usize {
        self.sealed.iter().map(|c| c.len()).sum::<usize>()
            + self.head.as_ref().map_or(0, |c| c.len())
    }

    pub fn num_chunks(&self) -> usize {
        self.sealed.len() + usize::from(self.head.is_some())
    }

    /// Committed samples in time order.
    pub fn samples(&self) -> impl Iterator<Item = &Sample> {
        self.sealed
            .iter()
            .flat_map(|c| c.samples().iter())
            .chain(self.head.iter().flat_map(|c| c.samples().iter()))
    }

    pub fn is_empty(&self) -> bool {
        self.last.is_none()
    }

    /// Checks whether `(t, v)` may be appended after the committed state.
    pub fn appendable(&self, t: Timestamp, v: Value) -> Result<(), HeadError> {
        check_after(self.series_ref, self.last, t, v)
    }

    /// Appends a validated sample, sealing the head chunk first when it is full or `t`
    /// crosses its time bound.
    pub(crate) fn append(
        &mut self,
        t: Timestamp,
        v: Value,
        now: i64,
        bounds: ChunkBounds,
    ) -> Result<Appended, HeadError> {
        self.appendable(t, v)?;

        let needs_cut = match &self.head {
            None => true,
            Some(c) => t >= self.next_at || c.len() >= bounds.samples_per_chunk,
        };
        if needs_cut {
            if let Some(full) = self.head.take() {
                self.sealed.push(Arc::new(full));
            }
            self.head = Some(MemChunk::with_capacity(bounds.samples_per_chunk));
            self.next_at = range_end(t, bounds.chunk_range);
        }

        let Some(head) = self.head.as_mut() else {
            return Err(HeadError::IndexCorruption(format!(
                "series {} has no head chunk after cut",
                self.series_ref
            )));
        };
        head.samples.push(Sample::new(t, v));

        // Once a quarter full, estimate where the chunk should end so that chunks of a
        // steady series come out roughly equally sized.
        if head.len() == bounds.samples_per_chunk / 4 {
            if let (Some(min), Some(max)) = (head.min_time(), head.max_time()) {
                self.next_at = compute_chunk_end_time(min, max, self.next_at);
            }
        }

        self.last = Some(Sample::new(t, v));
        self.last_write = now;
        Ok(Appended {
            chunk_created: needs_cut,
        })
    }

    /// Drops sealed chunks that end before `mint`. Returns how many were removed.
    pub(crate) fn truncate_chunks_before(&mut self, mint: Timestamp) -> usize {
        let before = self.sealed.len();
        self.sealed
            .retain(|c| c.max_time().map_or(false, |max| max >= mint));
        before - self.sealed.len()
    }

    pub(crate) fn snapshot(&self) -> SeriesSnapshot {
        SeriesSnapshot {
            series_ref: self.series_ref,
            labels: self.labels.clone(),
            chunks: self.sealed.clone(),
            head_chunk: self.head.clone(),
            last: self.last,
        }
    }

    pub(crate) fn pending(&self) -> u32 {
        self.pending.load(Ordering::Acquire)
    }

    pub(crate) fn acquire_pending(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn release_pending(&self) {
        // Saturate: a release without a matching acquire must not wrap.
        let _ = self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |p| p.checked_sub(1));
    }

    pub(crate) fn mark_observed(&self) {
        self.observed.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn observations(&self) -> u32 {
        self.observed.load(Ordering::Acquire)
    }

    /// Marks the series as logged and returns whether it already was.
    pub(crate) fn swap_logged(&self) -> bool {
        self.logged.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn is_logged(&self) -> bool {
        self.logged.load(Ordering::Acquire)
    }

    pub(crate) fn unmark_logged(&self) {
        self.logged.store(false, Ordering::Release);
    }
}

/// Validates `(t, v)` against the latest known sample of a series.
pub(crate) fn check_after(
    series_ref: SeriesRef,
    last: Option<Sample>,
    t: Timestamp,
    v: Value,
) -> Result<(), HeadError> {
    let Some(last) = last else {
        return Ok(());
    };
    if t < last.timestamp || (t == last.timestamp && v.to_bits() == last.value.to_bits()) {
        return Err(HeadError::OutOfOrderSample {
            series_ref,
            timestamp: t,
            last: last.timestamp,
        });
    }
    if t == last.timestamp {
        return Err(HeadError::DuplicateSample {
            series_ref,
            timestamp: t,
        });
    }
    Ok(())
}

/// Point-in-time copy of a series for the read path.
///
/// Sealed chunks are shared, the head chunk is copied. Taken under the shard read lock, so
/// it never contains half of a commit.
#[derive(Debug, Clone)]
pub struct SeriesSnapshot {
    pub series_ref: SeriesRef,
    pub labels: Labels,
    pub chunks: Vec<Arc<MemChunk>>,
    pub head_chunk: Option<MemChunk>,
    pub last: Option<Sample>,
}

impl SeriesSnapshot {
    /// All committed samples in time order.
    pub fn samples(&self) -> impl Iterator<Item = &Sample> {
        self.chunks
            .iter()
            .flat_map(|c| c.samples().iter())
            .chain(self.head_chunk.iter().flat_map(|c| c.samples().iter()))
    }

    pub fn num_samples(&self) -> usize {
        self.samples().count()
    }

    pub fn num_chunks(&self) -> usize {
        self.chunks.len() + usize::from(self.head_chunk.is_some())
    }
}

/// End of the aligned window of width `width` containing `t`.
fn range_end(t: Timestamp, width: i64) -> Timestamp {
    t.div_euclid(width)
        .saturating_mul(width)
        .saturating_add(width)
}

/// Estimates the end of a chunk from how fast it filled its first quarter, capped at `max`.
fn compute_chunk_end_time(start: Timestamp, cur: Timestamp, max: Timestamp) -> Timestamp {
    let n = (max - start) as f64 / ((cur - start + 1) as f64 * 4.0);
    if n <= 1.0 {
        return max;
    }
    start + ((max - start) as f64 / n.floor()) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series() -> MemSeries {
        let l = Labels::from_strings(&["a", "1"]).unwrap();
        MemSeries::new(SeriesRef(1), l.fingerprint(), l, 0)
    }

    const BOUNDS: ChunkBounds = ChunkBounds {
        chunk_range: 1000,
        samples_per_chunk: 8,
    };

    #[test]
    fn append_enforces_monotonicity() {
        let mut s = series();
        s.append(0, 1.0, 0, BOUNDS).unwrap();
        s.append(1, 2.0, 0, BOUNDS).unwrap();

        let err = s.append(1, 3.0, 0, BOUNDS).unwrap_err();
        assert!(matches!(err, HeadError::DuplicateSample { timestamp: 1, .. }));
        let err = s.append(1, 2.0, 0, BOUNDS).unwrap_err();
        assert!(matches!(err, HeadError::OutOfOrderSample { timestamp: 1, last: 1, .. }));
        let err = s.append(0, 9.0, 0, BOUNDS).unwrap_err();
        assert!(matches!(err, HeadError::OutOfOrderSample { timestamp: 0, .. }));
        assert_eq!(s.num_samples(), 2);

        s.append(2, 3.0, 0, BOUNDS).unwrap();
        assert_eq!(s.num_samples(), 3);
        assert_eq!(s.last_sample(), Some(Sample::new(2, 3.0)));
    }

    #[test]
    fn chunk_cut_at_sample_bound() {
        let mut s = series();
        let mut created = 0;
        for t in 0..20 {
            if s.append(t, t as f64, 0, BOUNDS).unwrap().chunk_created {
                created += 1;
            }
        }
        // 20 samples with a hard bound of 8 per chunk.
        assert_eq!(created, 3);
        let snap = s.snapshot();
        assert_eq!(snap.chunks.len(), 2);
        assert!(snap.chunks.iter().all(|c| c.len() <= 8));
        assert_eq!(snap.num_samples(), 20);
        let ts: Vec<_> = snap.samples().map(|s| s.timestamp).collect();
        assert_eq!(ts, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn chunk_cut_at_time_bound() {
        let mut s = series();
        s.append(10, 1.0, 0, BOUNDS).unwrap();
        s.append(999, 1.0, 0, BOUNDS).unwrap();
        let r = s.append(1000, 1.0, 0, BOUNDS).unwrap();
        assert!(r.chunk_created);
        let snap = s.snapshot();
        assert_eq!(snap.chunks.len(), 1);
        assert_eq!(snap.chunks[0].max_time(), Some(999));
        assert_eq!(snap.head_chunk.as_ref().and_then(|c| c.min_time()), Some(1000));
    }

    #[test]
    fn negative_timestamps_align_to_window() {
        assert_eq!(range_end(-1, 1000), 0);
        assert_eq!(range_end(0, 1000), 1000);
        assert_eq!(range_end(1999, 1000), 2000);
    }

    #[test]
    fn chunk_end_estimate() {
        // A quarter of the chunk filled in 10ms of a 1000ms window: end moves up.
        assert!(compute_chunk_end_time(0, 9, 1000) < 1000);
        // Filling slower than the window allows keeps the window end.
        assert_eq!(compute_chunk_end_time(0, 600, 1000), 1000);
    }

    #[test]
    fn truncate_drops_old_sealed_chunks() {
        let mut s = series();
        for t in 0..3000 {
            if t % 100 == 0 {
                s.append(t, 0.0, 0, BOUNDS).unwrap();
            }
        }
        let before = s.num_chunks();
        let removed = s.truncate_chunks_before(2000);
        assert!(removed > 0);
        assert_eq!(s.num_chunks(), before - removed);
        assert!(s
            .snapshot()
            .chunks
            .iter()
            .all(|c| c.max_time().unwrap() >= 2000));
    }

    #[test]
    fn pending_release_saturates() {
        let s = series();
        s.release_pending();
        assert_eq!(s.pending(), 0);
        s.acquire_pending();
        s.acquire_pending();
        s.release_pending();
        assert_eq!(s.pending(), 1);
    }
}
