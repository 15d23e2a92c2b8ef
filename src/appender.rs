//! Batched append transactions.
//!
//! An [`Appender`] collects samples, validating each one as it arrives, and publishes them
//! with [`Appender::commit`]. Commit first hands the encoded batch to the durability log, then
//! applies it shard by shard under each shard's write lock. No lock spans more than one shard,
//! so commits touching unrelated series proceed in parallel.

use crate::error::HeadError;
use crate::head::HeadShared;
use crate::labels::Labels;
use crate::series::{check_after, MemSeries};
use crate::telemetry::{head_metrics, HeadEvent};
use crate::types::{RefSample, Sample, SeriesRef, Timestamp, Value};
use crate::wal::{encode_batch, LogRecord};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::time::Instant;

/// A sample that was buffered but not committed.
#[derive(Debug)]
pub struct RejectedSample {
    pub sample: RefSample,
    pub error: HeadError,
}

/// Per-sample outcome of a commit.
#[derive(Debug, Default)]
pub struct CommitSummary {
    pub appended: usize,
    pub chunks_created: usize,
    pub rejected: Vec<RejectedSample>,
}

impl CommitSummary {
    /// True when every buffered sample was applied.
    pub fn is_complete(&self) -> bool {
        self.rejected.is_empty()
    }
}

/// Single-owner append transaction. See the module docs.
///
/// Dropping an appender without committing rolls it back.
#[derive(Debug)]
pub struct Appender<'a> {
    head: &'a HeadShared,
    samples: Vec<RefSample>,
    /// Latest buffered sample per series. A key here means this appender holds a pending
    /// count on that series.
    latest: HashMap<SeriesRef, Sample>,
    /// Series created by this appender, with how often `add` found them again afterwards.
    created: HashMap<SeriesRef, u32>,
    finished: bool,
}

impl<'a> Appender<'a> {
    pub(crate) fn new(head: &'a HeadShared) -> Self {
        head.appenders.fetch_add(1, Ordering::Relaxed);
        head_metrics::appender_opened();
        Self {
            head,
            samples: Vec::new(),
            latest: HashMap::new(),
            created: HashMap::new(),
            finished: false,
        }
    }

    /// Number of buffered samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Buffers a sample for the series identified by `labels`, creating the series if it
    /// does not exist yet.
    ///
    /// Returns the series reference so that further samples for the same series can go
    /// through [`Appender::add_fast`].
    pub fn add(&mut self, labels: &Labels, t: Timestamp, v: Value) -> Result<SeriesRef, HeadError> {
        if labels.is_empty() {
            head_metrics::record_rejected(HeadError::EmptyLabelSet.reason());
            return Err(HeadError::EmptyLabelSet);
        }
        self.check_bounds(t)?;

        // Validate and pin the series while the lookup still holds the shard lock, so gc
        // cannot remove it before it counts as pending.
        let latest = &self.latest;
        let (r, created, checked) = self.head.index.get_or_create_with(
            labels.fingerprint(),
            labels,
            self.head.clock.now_ms(),
            |s| pin(s, latest.get(&s.series_ref()).copied(), t, v),
        )?;
        if created {
            self.created.insert(r, 0);
            head_metrics::record_series_created(1);
        } else if let Some(hits) = self.created.get_mut(&r) {
            *hits += 1;
        }

        if let Err(e) = checked {
            head_metrics::record_rejected(e.reason());
            return Err(e);
        }
        self.buffer(r, t, v);
        Ok(r)
    }

    /// Buffers a sample for an already known series reference.
    ///
    /// Fails with `UnknownReference` if the series is gone, with `OutOfOrderSample` or
    /// `DuplicateSample` if `t` does not come after both the committed and the buffered
    /// samples of that series. A failure leaves the appender unchanged.
    pub fn add_fast(&mut self, r: SeriesRef, t: Timestamp, v: Value) -> Result<(), HeadError> {
        self.check_bounds(t)?;

        let pending = self.latest.get(&r).copied();
        let checked = self.head.index.with_series(r, |s| pin(s, pending, t, v))?;
        let outcome = checked.unwrap_or(Err(HeadError::UnknownReference(r)));
        if let Err(e) = outcome {
            head_metrics::record_rejected(e.reason());
            return Err(e);
        }
        self.buffer(r, t, v);
        Ok(())
    }

    fn buffer(&mut self, r: SeriesRef, t: Timestamp, v: Value) {
        self.samples.push(RefSample {
            series_ref: r,
            timestamp: t,
            value: v,
        });
        self.latest.insert(r, Sample::new(t, v));
    }

    /// Logs and publishes all buffered samples.
    ///
    /// Samples that became invalid since they were added (a concurrent commit moved the
    /// series ahead, or gc removed it) are listed in [`CommitSummary::rejected`]; the rest
    /// are applied. A log failure or index corruption aborts the commit with an error and
    /// nothing is applied.
    pub fn commit(mut self) -> Result<CommitSummary, HeadError> {
        let start = Instant::now();
        let result = self.log_and_apply();
        let released = self.release_pending();
        self.finish();

        match &result {
            Ok(summary) => {
                head_metrics::record_commit(
                    start.elapsed(),
                    summary.appended as u64,
                    summary.chunks_created as u64,
                );
                for r in &summary.rejected {
                    head_metrics::record_rejected(r.error.reason());
                }
            }
            Err(e) => self.head.events.on_event(HeadEvent::CommitFailed {
                error: e.to_string(),
            }),
        }
        let summary = result?;
        released?;
        Ok(summary)
    }

    /// Discards all buffered samples and removes the series this appender created, unless
    /// somebody else has seen them in the meantime.
    pub fn rollback(mut self) -> Result<(), HeadError> {
        let result = self.rollback_inner();
        self.finish();
        result
    }

    fn check_bounds(&self, t: Timestamp) -> Result<(), HeadError> {
        let min_valid_time = self.head.min_valid_time.load(Ordering::Acquire);
        if t < min_valid_time {
            let e = HeadError::OutOfBounds {
                timestamp: t,
                min_valid_time,
            };
            head_metrics::record_rejected(e.reason());
            return Err(e);
        }
        Ok(())
    }

    fn log_and_apply(&mut self) -> Result<CommitSummary, HeadError> {
        if self.samples.is_empty() {
            return Ok(CommitSummary::default());
        }
        let head = self.head;
        // Held until the batch is applied, so a checkpoint never misses a logged batch.
        let _gate = head.log_gate.read()?;

        // Series whose identity has never been logged travel with this batch, whoever
        // created them.
        let mut records = Vec::new();
        let mut newly_logged = Vec::new();
        let mut seen = HashSet::with_capacity(self.latest.len());
        for s in &self.samples {
            if !seen.insert(s.series_ref) {
                continue;
            }
            let labels = head.index.with_series(s.series_ref, |ms| {
                if ms.swap_logged() {
                    None
                } else {
                    Some((ms.fingerprint(), ms.labels().clone()))
                }
            })?;
            if let Some(Some((fingerprint, labels))) = labels {
                newly_logged.push(s.series_ref);
                records.push(LogRecord::Series {
                    series_ref: s.series_ref,
                    fingerprint,
                    labels,
                });
            }
        }
        records.push(LogRecord::Samples(std::mem::take(&mut self.samples)));
        let encoded = encode_batch(&records);
        if let Some(LogRecord::Samples(samples)) = records.pop() {
            self.samples = samples;
        }

        if let Err(e) = encoded.and_then(|batch| head.log.append(&batch)) {
            for r in newly_logged {
                let _ = head.index.with_series(r, |ms| ms.unmark_logged());
            }
            head.events.on_event(HeadEvent::LogAppendFailed {
                error: e.to_string(),
            });
            return Err(e);
        }

        self.apply()
    }

    fn apply(&mut self) -> Result<CommitSummary, HeadError> {
        let head = self.head;
        let now = head.clock.now_ms();
        let bounds = head.bounds;

        // Stable sort keeps each series' samples in the order they were added.
        let mut order: Vec<(usize, usize)> = self
            .samples
            .iter()
            .enumerate()
            .map(|(i, s)| (head.index.shard_of(s.series_ref), i))
            .collect();
        order.sort_by_key(|(shard, _)| *shard);

        let mut summary = CommitSummary::default();
        let mut min_t = Timestamp::MAX;
        let mut max_t = Timestamp::MIN;

        for group in order.chunk_by(|a, b| a.0 == b.0) {
            let mut shard = head.index.write_shard(group[0].0)?;
            for &(_, i) in group {
                let s = self.samples[i];
                let res = match shard.series_mut(s.series_ref) {
                    Some(series) => series.append(s.timestamp, s.value, now, bounds),
                    None => Err(HeadError::UnknownReference(s.series_ref)),
                };
                match res {
                    Ok(a) => {
                        summary.appended += 1;
                        summary.chunks_created += usize::from(a.chunk_created);
                        min_t = min_t.min(s.timestamp);
                        max_t = max_t.max(s.timestamp);
                    }
                    Err(e) if e.is_sample_error() => {
                        summary.rejected.push(RejectedSample { sample: s, error: e })
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        if summary.appended > 0 {
            head.update_time_range(min_t, max_t);
        }
        self.samples.clear();
        Ok(summary)
    }

    fn rollback_inner(&mut self) -> Result<(), HeadError> {
        self.samples.clear();
        self.release_pending()?;

        if self.created.is_empty() {
            return Ok(());
        }
        let _gate = self.head.log_gate.read()?;
        let mut removed = 0;
        let mut logged = Vec::new();
        for (r, own_hits) in std::mem::take(&mut self.created) {
            if let Some(gone) = self.head.index.remove_unobserved(r, own_hits)? {
                removed += 1;
                if gone.logged {
                    logged.push(gone.series_ref);
                }
            }
        }
        self.head.log_removed(logged)?;
        if removed > 0 {
            head_metrics::record_series_removed(removed as u64);
            head_metrics::set_series(self.head.index.len());
            self.head.events.on_event(HeadEvent::RollbackRemovedSeries { removed });
        }
        Ok(())
    }

    fn release_pending(&mut self) -> Result<(), HeadError> {
        let mut result = Ok(());
        for (r, _) in self.latest.drain() {
            if let Err(e) = self.head.index.with_series(r, |s| s.release_pending()) {
                result = Err(e);
            }
        }
        result
    }

    fn finish(&mut self) {
        if !self.finished {
            self.finished = true;
            self.head.appenders.fetch_sub(1, Ordering::Relaxed);
            head_metrics::appender_closed();
        }
    }
}

/// Validates `(t, v)` against the committed and the buffered state of `s`, and takes a
/// pending count on `s` for the first buffered sample.
fn pin(s: &MemSeries, pending: Option<Sample>, t: Timestamp, v: Value) -> Result<(), HeadError> {
    let r = s.series_ref();
    check_after(r, s.last_sample(), t, v)?;
    check_after(r, pending, t, v)?;
    if pending.is_none() {
        s.acquire_pending();
    }
    Ok(())
}

impl Drop for Appender<'_> {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.rollback_inner();
            self.finish();
        }
    }
}
