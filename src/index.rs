//! Sharded series index.
//!
//! Each shard keeps two maps under one lock: fingerprint -> refs (collision list) and
//! ref -> series. A series remembers the fingerprint it was filed under, which is not
//! necessarily `Labels::fingerprint` when callers route with their own hash. A series lives
//! in shard `fingerprint & mask`, and its reference is built as
//! `local_seq << stripe_bits | shard`, so routing by reference uses the same mask and lands
//! in the same shard. Every shard counts its own `local_seq` upward from 1; references are
//! therefore never zero and never handed out twice.

use crate::error::HeadError;
use crate::labels::Labels;
use crate::series::{MemSeries, SeriesSnapshot};
use crate::stripe::StripeSet;
use crate::types::{SeriesRef, Timestamp};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug)]
pub(crate) struct Shard {
    by_hash: HashMap<u64, Vec<SeriesRef>>,
    by_ref: HashMap<SeriesRef, MemSeries>,
    next_seq: u64,
}

impl Shard {
    fn new() -> Self {
        Self {
            by_hash: HashMap::new(),
            by_ref: HashMap::new(),
            next_seq: 1,
        }
    }

    fn find(&self, fingerprint: u64, labels: &Labels) -> Result<Option<SeriesRef>, HeadError> {
        let Some(refs) = self.by_hash.get(&fingerprint) else {
            return Ok(None);
        };
        for r in refs {
            let series = self.by_ref.get(r).ok_or_else(|| {
                HeadError::IndexCorruption(format!(
                    "fingerprint {:#x} points at missing series {}",
                    fingerprint, r
                ))
            })?;
            if series.labels() == labels {
                return Ok(Some(*r));
            }
        }
        Ok(None)
    }

    fn allocate(&mut self, shard: usize, bits: u32) -> Result<SeriesRef, HeadError> {
        let seq = self.next_seq;
        if seq > (u64::MAX >> bits) {
            return Err(HeadError::ReferenceSpaceExhausted { shard });
        }
        self.next_seq += 1;
        Ok(SeriesRef((seq << bits) | shard as u64))
    }

    fn insert(&mut self, series: MemSeries) {
        let r = series.series_ref();
        self.by_hash.entry(series.fingerprint()).or_default().push(r);
        self.by_ref.insert(r, series);
    }

    /// Removes `r` from both maps. Both are checked before either is touched.
    fn unlink(&mut self, r: SeriesRef) -> Result<MemSeries, HeadError> {
        let fp = self
            .by_ref
            .get(&r)
            .map(|s| s.fingerprint())
            .ok_or_else(|| HeadError::IndexCorruption(format!("unlink of missing series {}", r)))?;
        let pos = self
            .by_hash
            .get(&fp)
            .and_then(|refs| refs.iter().position(|x| *x == r))
            .ok_or_else(|| {
                HeadError::IndexCorruption(format!("series {} missing from fingerprint map", r))
            })?;

        if let Some(refs) = self.by_hash.get_mut(&fp) {
            refs.swap_remove(pos);
            if refs.is_empty() {
                self.by_hash.remove(&fp);
            }
        }
        self.by_ref
            .remove(&r)
            .ok_or_else(|| HeadError::IndexCorruption(format!("unlink of missing series {}", r)))
    }

    pub(crate) fn series_mut(&mut self, r: SeriesRef) -> Option<&mut MemSeries> {
        self.by_ref.get_mut(&r)
    }

    pub(crate) fn series(&self) -> impl Iterator<Item = &MemSeries> {
        self.by_ref.values()
    }

    /// Next local sequence number this shard will hand out.
    pub(crate) fn next_seq(&self) -> u64 {
        self.next_seq
    }
}

/// Result of restoring a logged series record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Restored {
    Created,
    /// The record was already applied.
    Existing,
    /// The same labels are already live under another reference.
    Alias(SeriesRef),
}

/// A series unlinked by GC or rollback.
#[derive(Debug, Clone)]
pub struct RemovedSeries {
    pub series_ref: SeriesRef,
    pub labels: Labels,
    /// Whether the series record had reached the durability log.
    pub logged: bool,
}

#[derive(Debug)]
pub struct SeriesIndex {
    stripes: StripeSet<Shard>,
    len: AtomicUsize,
}

impl SeriesIndex {
    pub fn new(stripe_size: usize) -> Result<Self, HeadError> {
        Ok(Self {
            stripes: StripeSet::new(stripe_size, |_| Shard::new())?,
            len: AtomicUsize::new(0),
        })
    }

    pub fn stripe_size(&self) -> usize {
        self.stripes.len()
    }

    /// Number of live series.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub(crate) fn shard_of(&self, r: SeriesRef) -> usize {
        self.stripes.index_for(r.0)
    }

    /// Returns the series for `labels`, creating it if needed.
    ///
    /// The common case only takes the shard read lock. On a miss the write lock is taken and
    /// the lookup repeated; whoever gets the write lock first creates the series and every
    /// other racer gets that same reference back with `created == false`.
    ///
    /// The series is filed under `fingerprint`. Later lookups must pass the same value; the
    /// head always uses [`Labels::fingerprint`].
    pub fn get_or_create(
        &self,
        fingerprint: u64,
        labels: &Labels,
        now: i64,
    ) -> Result<(SeriesRef, bool), HeadError> {
        self.get_or_create_with(fingerprint, labels, now, |_| ())
            .map(|(r, created, ())| (r, created))
    }

    /// Like [`SeriesIndex::get_or_create`], and runs `f` on the series before the shard lock
    /// is released, so gc cannot unlink the series in between.
    pub(crate) fn get_or_create_with<R>(
        &self,
        fingerprint: u64,
        labels: &Labels,
        now: i64,
        f: impl FnOnce(&MemSeries) -> R,
    ) -> Result<(SeriesRef, bool, R), HeadError> {
        let idx = self.stripes.index_for(fingerprint);
        {
            let shard = self.stripes.read(idx)?;
            if let Some(r) = shard.find(fingerprint, labels)? {
                let s = found(&shard.by_ref, r)?;
                s.mark_observed();
                return Ok((r, false, f(s)));
            }
        }

        let mut shard = self.stripes.write(idx)?;
        if let Some(r) = shard.find(fingerprint, labels)? {
            let s = found(&shard.by_ref, r)?;
            s.mark_observed();
            return Ok((r, false, f(s)));
        }
        let r = shard.allocate(idx, self.stripes.bits())?;
        shard.insert(MemSeries::new(r, fingerprint, labels.clone(), now));
        self.len.fetch_add(1, Ordering::Relaxed);
        let out = f(found(&shard.by_ref, r)?);
        Ok((r, true, out))
    }

    /// Read-path lookup by reference. Counts as an observation of the series.
    pub fn get(&self, r: SeriesRef) -> Result<Option<SeriesSnapshot>, HeadError> {
        let shard = self.stripes.read(self.shard_of(r))?;
        Ok(shard.by_ref.get(&r).map(|s| {
            s.mark_observed();
            s.snapshot()
        }))
    }

    /// Read-path lookup by label set, for series filed under [`Labels::fingerprint`]. Counts
    /// as an observation of the series.
    pub fn get_by_labels(&self, labels: &Labels) -> Result<Option<SeriesSnapshot>, HeadError> {
        self.get_by_fingerprint(labels.fingerprint(), labels)
    }

    /// Read-path lookup of the series filed under `fp` with `labels`.
    pub fn get_by_fingerprint(
        &self,
        fp: u64,
        labels: &Labels,
    ) -> Result<Option<SeriesSnapshot>, HeadError> {
        let shard = self.stripes.read(self.stripes.index_for(fp))?;
        let Some(r) = shard.find(fp, labels)? else {
            return Ok(None);
        };
        Ok(shard.by_ref.get(&r).map(|s| {
            s.mark_observed();
            s.snapshot()
        }))
    }

    /// Runs `f` on the series under the shard read lock without counting an observation.
    pub(crate) fn with_series<R>(
        &self,
        r: SeriesRef,
        f: impl FnOnce(&MemSeries) -> R,
    ) -> Result<Option<R>, HeadError> {
        let shard = self.stripes.read(self.shard_of(r))?;
        Ok(shard.by_ref.get(&r).map(f))
    }

    /// Takes the read lock of shard `idx`.
    pub(crate) fn read_shard(&self, idx: usize) -> Result<RwLockReadGuard<'_, Shard>, HeadError> {
        self.stripes.read(idx)
    }

    /// Takes the write lock of shard `idx`.
    pub(crate) fn write_shard(&self, idx: usize) -> Result<RwLockWriteGuard<'_, Shard>, HeadError> {
        self.stripes.write(idx)
    }

    /// Removes a series created by an appender that is being rolled back.
    ///
    /// The series stays if it holds samples, is pending in another appender, or was looked
    /// up more often than the rolling-back appender itself did (`own_hits`).
    pub(crate) fn remove_unobserved(
        &self,
        r: SeriesRef,
        own_hits: u32,
    ) -> Result<Option<RemovedSeries>, HeadError> {
        let mut shard = self.stripes.write(self.shard_of(r))?;
        let removable = match shard.by_ref.get(&r) {
            Some(s) => s.is_empty() && s.pending() == 0 && s.observations() <= own_hits,
            None => false,
        };
        if !removable {
            return Ok(None);
        }
        let s = shard.unlink(r)?;
        self.len.fetch_sub(1, Ordering::Relaxed);
        Ok(Some(RemovedSeries {
            series_ref: r,
            logged: s.is_logged(),
            labels: s.labels().clone(),
        }))
    }

    /// Unlinks every series matching `dead`, one shard at a time.
    ///
    /// Each shard is scanned under its read lock first; the write lock is only taken for
    /// shards that have something to remove, and the predicate is re-checked under it.
    pub fn remove_where(
        &self,
        mut dead: impl FnMut(&MemSeries) -> bool,
    ) -> Result<Vec<RemovedSeries>, HeadError> {
        let mut removed = Vec::new();
        for idx in 0..self.stripes.len() {
            let candidates: Vec<SeriesRef> = {
                let shard = self.stripes.read(idx)?;
                shard
                    .by_ref
                    .values()
                    .filter(|s| dead(s))
                    .map(|s| s.series_ref())
                    .collect()
            };
            if candidates.is_empty() {
                continue;
            }

            let mut shard = self.stripes.write(idx)?;
            for r in candidates {
                let still_dead = shard.by_ref.get(&r).map_or(false, |s| dead(s));
                if still_dead {
                    let s = shard.unlink(r)?;
                    self.len.fetch_sub(1, Ordering::Relaxed);
                    removed.push(RemovedSeries {
                        series_ref: r,
                        logged: s.is_logged(),
                        labels: s.labels().clone(),
                    });
                }
            }
        }
        Ok(removed)
    }

    /// Drops sealed chunks ending before `mint` in every series. Returns chunks removed.
    pub fn truncate_chunks_before(&self, mint: Timestamp) -> Result<usize, HeadError> {
        let mut total = 0;
        for idx in 0..self.stripes.len() {
            let mut shard = self.stripes.write(idx)?;
            for s in shard.by_ref.values_mut() {
                total += s.truncate_chunks_before(mint);
            }
        }
        Ok(total)
    }

    /// Re-inserts a series under the reference and fingerprint it had when it was logged.
    pub(crate) fn restore(
        &self,
        r: SeriesRef,
        fp: u64,
        labels: &Labels,
        now: i64,
    ) -> Result<Restored, HeadError> {
        let idx = self.shard_of(r);
        if self.stripes.index_for(fp) != idx {
            return Err(HeadError::IndexCorruption(format!(
                "logged reference {} for {} does not route to its fingerprint shard",
                r, labels
            )));
        }
        let mut shard = self.stripes.write(idx)?;
        if let Some(existing) = shard.by_ref.get(&r) {
            if existing.labels() != labels {
                return Err(HeadError::IndexCorruption(format!(
                    "reference {} logged for both {} and {}",
                    r,
                    existing.labels(),
                    labels
                )));
            }
            return Ok(Restored::Existing);
        }

        let seq = r.0 >> self.stripes.bits();
        if seq == 0 {
            return Err(HeadError::IndexCorruption(format!("invalid logged reference {}", r)));
        }
        shard.next_seq = shard.next_seq.max(seq.saturating_add(1));

        if let Some(live) = shard.find(fp, labels)? {
            return Ok(Restored::Alias(live));
        }
        let series = MemSeries::new(r, fp, labels.clone(), now);
        series.swap_logged();
        shard.insert(series);
        self.len.fetch_add(1, Ordering::Relaxed);
        Ok(Restored::Created)
    }

    /// Unlinks `r` if it is live, regardless of its state. Used when replaying removals.
    pub(crate) fn forget(&self, r: SeriesRef) -> Result<bool, HeadError> {
        let mut shard = self.stripes.write(self.shard_of(r))?;
        if !shard.by_ref.contains_key(&r) {
            return Ok(false);
        }
        shard.unlink(r)?;
        self.len.fetch_sub(1, Ordering::Relaxed);
        Ok(true)
    }

    /// Moves the sequence counter of shard `idx` to at least `next_seq`.
    pub(crate) fn raise_next_seq(&self, idx: usize, next_seq: u64) -> Result<(), HeadError> {
        if idx >= self.stripes.len() {
            return Err(HeadError::IndexCorruption(format!(
                "counter for shard {} of {}",
                idx,
                self.stripes.len()
            )));
        }
        let mut shard = self.stripes.write(idx)?;
        shard.next_seq = shard.next_seq.max(next_seq);
        Ok(())
    }

    /// References of all live series, shard by shard.
    pub fn refs(&self) -> Result<Vec<SeriesRef>, HeadError> {
        let mut out = Vec::with_capacity(self.len());
        for idx in 0..self.stripes.len() {
            let shard = self.stripes.read(idx)?;
            out.extend(shard.by_ref.keys().copied());
        }
        Ok(out)
    }

    /// Verifies that both maps of every shard agree with each other.
    pub fn check_consistency(&self) -> Result<(), HeadError> {
        let mut total = 0;
        for idx in 0..self.stripes.len() {
            let shard = self.stripes.read(idx)?;
            let hashed: usize = shard.by_hash.values().map(|v| v.len()).sum();
            if hashed != shard.by_ref.len() {
                return Err(HeadError::IndexCorruption(format!(
                    "shard {}: {} fingerprint entries vs {} series",
                    idx,
                    hashed,
                    shard.by_ref.len()
                )));
            }
            for (r, s) in &shard.by_ref {
                if self.shard_of(*r) != idx {
                    return Err(HeadError::IndexCorruption(format!(
                        "series {} stored in shard {}",
                        r, idx
                    )));
                }
                if self.stripes.index_for(s.fingerprint()) != idx
                    || shard.find(s.fingerprint(), s.labels())? != Some(*r)
                {
                    return Err(HeadError::IndexCorruption(format!(
                        "series {} not reachable by fingerprint",
                        r
                    )));
                }
            }
            total += shard.by_ref.len();
        }
        if total != self.len() {
            return Err(HeadError::IndexCorruption(format!(
                "series counter {} vs {} stored",
                self.len(),
                total
            )));
        }
        Ok(())
    }
}

fn found(by_ref: &HashMap<SeriesRef, MemSeries>, r: SeriesRef) -> Result<&MemSeries, HeadError> {
    by_ref
        .get(&r)
        .ok_or_else(|| HeadError::IndexCorruption(format!("series {} vanished under lock", r)))
}
