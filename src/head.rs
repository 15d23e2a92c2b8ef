//! The head: series index, append pipeline, replay, and background housekeeping.

use crate::appender::Appender;
use crate::clock::{Clock, SystemClock};
use crate::error::HeadError;
use crate::index::{Restored, SeriesIndex};
use crate::labels::Labels;
use crate::series::{ChunkBounds, SeriesSnapshot};
use crate::stripe::DEFAULT_STRIPE_SIZE;
use crate::telemetry::{head_metrics, noop_event_listener, HeadEvent, HeadEventListener};
use crate::types::{RefSample, SeriesRef, Timestamp};
use crate::wal::{encode_batch, DurabilityLog, LogRecord, NoopLog, WalContents, WriteAheadLog};

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Default width of a chunk's time window: two hours in milliseconds.
pub const DEFAULT_CHUNK_RANGE: i64 = 2 * 60 * 60 * 1000;
/// Default maximum number of samples per chunk.
pub const DEFAULT_SAMPLES_PER_CHUNK: usize = 120;
/// Default gc cutoff.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(60 * 60);

/// Commands sent to the housekeeping thread.
enum HousekeepingCommand {
    Gc { ack: Option<mpsc::Sender<Result<GcStats, HeadError>>> },
    Shutdown,
}

/// Configuration options for the [`Head`].
#[derive(Debug, Clone)]
pub struct HeadOptions {
    /// Number of index shards. Must be a power of two.
    pub stripe_size: usize,
    /// Width of a chunk's time window, in milliseconds of sample time.
    pub chunk_range: i64,
    /// Maximum number of samples per chunk.
    pub samples_per_chunk: usize,
    /// Series not written for this long (ingest clock) are removed by gc.
    pub retention: Duration,
    /// Run gc in a background thread on this interval.
    pub gc_interval: Option<Duration>,
    /// Samples older than this are rejected with `OutOfBounds`.
    pub min_valid_time: Timestamp,
    /// `sync_data` after every log append. Only used by [`Head::open`].
    pub wal_sync_on_append: bool,
    /// Checkpoint the log after every timed gc pass of the housekeeping thread.
    pub checkpoint_on_gc: bool,
    /// Structured event hook for observability (no-op by default).
    pub event_listener: Arc<dyn HeadEventListener>,
    pub clock: Arc<dyn Clock>,
    /// Where committed batches go before they are applied.
    pub log: Arc<dyn DurabilityLog>,
}

impl Default for HeadOptions {
    fn default() -> Self {
        HeadOptions {
            stripe_size: DEFAULT_STRIPE_SIZE,
            chunk_range: DEFAULT_CHUNK_RANGE,
            samples_per_chunk: DEFAULT_SAMPLES_PER_CHUNK,
            retention: DEFAULT_RETENTION,
            gc_interval: None,
            min_valid_time: Timestamp::MIN,
            wal_sync_on_append: false,
            checkpoint_on_gc: false,
            event_listener: noop_event_listener(),
            clock: Arc::new(SystemClock),
            log: Arc::new(NoopLog),
        }
    }
}

impl HeadOptions {
    pub fn validate(&self) -> Result<(), HeadError> {
        if self.stripe_size == 0 || !self.stripe_size.is_power_of_two() {
            return Err(HeadError::Config(format!(
                "stripe_size must be a non-zero power of two, got {}",
                self.stripe_size
            )));
        }
        if self.chunk_range <= 0 {
            return Err(HeadError::Config(format!(
                "chunk_range must be positive, got {}",
                self.chunk_range
            )));
        }
        if self.samples_per_chunk == 0 {
            return Err(HeadError::Config("samples_per_chunk must be positive".to_string()));
        }
        if self.gc_interval == Some(Duration::ZERO) {
            return Err(HeadError::Config("gc_interval must be positive".to_string()));
        }
        Ok(())
    }
}

/// Result of one gc pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcStats {
    pub removed_series: usize,
    pub live_series: usize,
    /// Ingest time before which series counted as dead.
    pub cutoff: i64,
}

/// Point-in-time counters of the head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadStats {
    pub num_series: usize,
    /// Smallest committed sample timestamp, if any sample was committed.
    pub min_time: Option<Timestamp>,
    pub max_time: Option<Timestamp>,
    pub active_appenders: usize,
    pub min_valid_time: Timestamp,
}

/// What [`Head::open`] found in the log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub batches: usize,
    /// Series records restored.
    pub series: usize,
    /// Restored series that a logged gc pass or rollback removed again.
    pub removed_series: usize,
    pub samples: usize,
    /// Samples that referenced an unknown or removed series, or failed validation.
    pub skipped_samples: usize,
    pub torn_tail: bool,
}

/// Result of [`Head::checkpoint`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckpointStats {
    pub series: usize,
    pub samples: usize,
}

/// State shared between the head, its appenders, and the housekeeping thread.
#[derive(Debug)]
pub(crate) struct HeadShared {
    pub(crate) index: SeriesIndex,
    pub(crate) bounds: ChunkBounds,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) log: Arc<dyn DurabilityLog>,
    pub(crate) events: Arc<dyn HeadEventListener>,
    pub(crate) min_valid_time: AtomicI64,
    pub(crate) appenders: AtomicUsize,
    /// Shared by everything that mutates the index and logs the mutation; exclusive for
    /// checkpoints.
    pub(crate) log_gate: RwLock<()>,
    retention_ms: i64,
    min_time: AtomicI64,
    max_time: AtomicI64,
}

impl HeadShared {
    fn new(options: &HeadOptions) -> Result<Self, HeadError> {
        options.validate()?;
        Ok(Self {
            index: SeriesIndex::new(options.stripe_size)?,
            bounds: ChunkBounds {
                chunk_range: options.chunk_range,
                samples_per_chunk: options.samples_per_chunk,
            },
            clock: options.clock.clone(),
            log: options.log.clone(),
            events: options.event_listener.clone(),
            min_valid_time: AtomicI64::new(options.min_valid_time),
            appenders: AtomicUsize::new(0),
            log_gate: RwLock::new(()),
            retention_ms: i64::try_from(options.retention.as_millis()).unwrap_or(i64::MAX),
            min_time: AtomicI64::new(Timestamp::MAX),
            max_time: AtomicI64::new(Timestamp::MIN),
        })
    }

    pub(crate) fn update_time_range(&self, mint: Timestamp, maxt: Timestamp) {
        self.min_time.fetch_min(mint, Ordering::AcqRel);
        self.max_time.fetch_max(maxt, Ordering::AcqRel);
    }

    /// Logs the removal of series whose records reached the log.
    pub(crate) fn log_removed(&self, refs: Vec<SeriesRef>) -> Result<(), HeadError> {
        if refs.is_empty() {
            return Ok(());
        }
        let batch = encode_batch(&[LogRecord::Removed(refs)])?;
        self.log.append(&batch).map_err(|e| {
            self.events.on_event(HeadEvent::LogAppendFailed {
                error: e.to_string(),
            });
            e
        })
    }

    fn gc(&self) -> Result<GcStats, HeadError> {
        let start = Instant::now();
        let cutoff = self.clock.now_ms().saturating_sub(self.retention_ms);
        let _gate = self.log_gate.read()?;
        let removed = self
            .index
            .remove_where(|s| s.pending() == 0 && s.last_write() < cutoff)?;
        self.log_removed(
            removed
                .iter()
                .filter(|r| r.logged)
                .map(|r| r.series_ref)
                .collect(),
        )?;

        let stats = GcStats {
            removed_series: removed.len(),
            live_series: self.index.len(),
            cutoff,
        };
        head_metrics::record_gc(start.elapsed());
        head_metrics::record_series_removed(stats.removed_series as u64);
        head_metrics::set_series(stats.live_series);
        self.events.on_event(HeadEvent::GcCompleted {
            removed_series: stats.removed_series,
            live_series: stats.live_series,
            cutoff,
        });
        Ok(stats)
    }

    fn gc_reporting(&self) -> Result<GcStats, HeadError> {
        let res = self.gc();
        if let Err(e) = &res {
            self.events.on_event(HeadEvent::GcFailed { error: e.to_string() });
        }
        res
    }

    /// Truncates sealed chunks and raises `min_valid_time`, logging the new bound.
    fn truncate_chunks_before(&self, mint: Timestamp) -> Result<usize, HeadError> {
        let _gate = self.log_gate.read()?;
        self.min_valid_time.fetch_max(mint, Ordering::AcqRel);
        let removed = self.index.truncate_chunks_before(mint)?;
        let batch = encode_batch(&[LogRecord::MinValidTime(mint)])?;
        self.log.append(&batch)?;
        Ok(removed)
    }

    /// Rewrites the log as one batch holding every live series and its samples.
    fn checkpoint(&self) -> Result<CheckpointStats, HeadError> {
        let _gate = self.log_gate.write()?;
        let mut stats = CheckpointStats::default();
        let mut next_seq = Vec::with_capacity(self.index.stripe_size());
        let mut records = vec![LogRecord::MinValidTime(
            self.min_valid_time.load(Ordering::Acquire),
        )];
        let mut samples = Vec::new();
        for idx in 0..self.index.stripe_size() {
            let shard = self.index.read_shard(idx)?;
            next_seq.push(shard.next_seq());
            for s in shard.series() {
                s.swap_logged();
                stats.series += 1;
                records.push(LogRecord::Series {
                    series_ref: s.series_ref(),
                    fingerprint: s.fingerprint(),
                    labels: s.labels().clone(),
                });
                samples.extend(s.samples().map(|x| RefSample {
                    series_ref: s.series_ref(),
                    timestamp: x.timestamp,
                    value: x.value,
                }));
            }
        }
        stats.samples = samples.len();
        records.push(LogRecord::NextSeq(next_seq));
        records.push(LogRecord::Samples(samples));

        self.log.checkpoint(&encode_batch(&records)?)?;
        self.events.on_event(HeadEvent::CheckpointCompleted {
            series: stats.series,
            samples: stats.samples,
        });
        Ok(stats)
    }

    /// Applies logged batches to an empty head.
    fn replay(&self, contents: WalContents) -> Result<ReplayStats, HeadError> {
        let mut stats = ReplayStats {
            batches: contents.batches.len(),
            torn_tail: contents.torn_tail,
            ..ReplayStats::default()
        };
        let now = self.clock.now_ms();

        // Pass 1: series identities and removals in log order, so that samples logged
        // ahead of their series record by a concurrent commit still find their series.
        let mut aliases: HashMap<SeriesRef, SeriesRef> = HashMap::new();
        for record in contents.batches.iter().flatten() {
            match record {
                LogRecord::Series {
                    series_ref,
                    fingerprint,
                    labels,
                } => match self.index.restore(*series_ref, *fingerprint, labels, now)? {
                    Restored::Created => stats.series += 1,
                    Restored::Existing => {}
                    Restored::Alias(live) => {
                        aliases.insert(*series_ref, live);
                    }
                },
                LogRecord::Removed(refs) => {
                    for r in refs {
                        if self.index.forget(*r)? {
                            stats.removed_series += 1;
                        }
                    }
                }
                LogRecord::NextSeq(counters) => {
                    for (idx, next) in counters.iter().enumerate() {
                        self.index.raise_next_seq(idx, *next)?;
                    }
                }
                LogRecord::Samples(_) | LogRecord::MinValidTime(_) => {}
            }
        }

        // Pass 2: samples and truncations in log order.
        let mut mint = Timestamp::MAX;
        let mut maxt = Timestamp::MIN;
        for record in contents.batches.iter().flatten() {
            let samples = match record {
                LogRecord::Samples(samples) => samples,
                LogRecord::MinValidTime(bound) => {
                    self.min_valid_time.fetch_max(*bound, Ordering::AcqRel);
                    self.index.truncate_chunks_before(*bound)?;
                    continue;
                }
                _ => continue,
            };
            for s in samples {
                let r = aliases.get(&s.series_ref).copied().unwrap_or(s.series_ref);
                let mut shard = self.index.write_shard(self.index.shard_of(r))?;
                let applied = match shard.series_mut(r) {
                    Some(series) => series.append(s.timestamp, s.value, now, self.bounds),
                    None => Err(HeadError::UnknownReference(r)),
                };
                match applied {
                    Ok(_) => {
                        stats.samples += 1;
                        mint = mint.min(s.timestamp);
                        maxt = maxt.max(s.timestamp);
                    }
                    Err(e) if e.is_sample_error() => stats.skipped_samples += 1,
                    Err(e) => return Err(e),
                }
            }
        }
        if stats.samples > 0 {
            self.update_time_range(mint, maxt);
        }

        head_metrics::record_series_created(stats.series as u64);
        head_metrics::set_series(self.index.len());
        self.events.on_event(HeadEvent::ReplayCompleted {
            series: self.index.len(),
            samples: stats.samples,
            skipped_samples: stats.skipped_samples,
            torn_tail: stats.torn_tail,
        });
        Ok(stats)
    }
}

/// In-memory head of a time-series database.
///
/// Owns the sharded series index. Writers obtain an [`Appender`] per batch; readers take
/// [`SeriesSnapshot`]s. A `Head` is `Send + Sync` and is meant to be shared by reference
/// (or `Arc`) between ingestion threads.
#[derive(Debug)]
pub struct Head {
    shared: Arc<HeadShared>,
    housekeeping_tx: Option<mpsc::Sender<HousekeepingCommand>>,
    housekeeping_handle: Option<JoinHandle<()>>,
    options: HeadOptions,
}

impl Head {
    /// Creates an empty head with default options and no durability.
    pub fn new() -> Result<Self, HeadError> {
        Self::with_options(HeadOptions::default())
    }

    /// Creates an empty head. Spawns the housekeeping thread if `gc_interval` is set.
    pub fn with_options(options: HeadOptions) -> Result<Self, HeadError> {
        let shared = Arc::new(HeadShared::new(&options)?);
        Self::start(shared, options)
    }

    /// Opens the write-ahead log in `wal_dir`, replays it into a new head, and keeps
    /// logging committed batches to it. Replaces `options.log`. A torn last frame is
    /// dropped from the file.
    ///
    /// # Errors
    /// `Config` if the log was written with a different stripe size, `Corruption` if a
    /// frame other than the last one fails its checksum, `IndexCorruption` if a logged
    /// reference does not fit the shard layout.
    pub fn open<P: AsRef<Path>>(
        mut options: HeadOptions,
        wal_dir: P,
    ) -> Result<(Self, ReplayStats), HeadError> {
        options.validate()?;
        let (wal, contents) =
            WriteAheadLog::open_and_read(wal_dir, options.stripe_size, options.wal_sync_on_append)?;
        options.log = Arc::new(wal);
        let shared = Arc::new(HeadShared::new(&options)?);
        let stats = shared.replay(contents)?;
        let head = Self::start(shared, options)?;
        Ok((head, stats))
    }

    fn start(shared: Arc<HeadShared>, options: HeadOptions) -> Result<Self, HeadError> {
        let Some(interval) = options.gc_interval else {
            return Ok(Head {
                shared,
                housekeeping_tx: None,
                housekeeping_handle: None,
                options,
            });
        };

        let (tx, rx) = mpsc::channel::<HousekeepingCommand>();
        let shared_clone = Arc::clone(&shared);
        let checkpoint_on_gc = options.checkpoint_on_gc;
        let handle = thread::Builder::new()
            .name("tshead-housekeeping".to_string())
            .spawn(move || {
                let events = shared_clone.events.clone();
                events.on_event(HeadEvent::HousekeepingStarted);
                loop {
                    match rx.recv_timeout(interval) {
                        Ok(HousekeepingCommand::Gc { ack }) => {
                            let res = shared_clone.gc_reporting();
                            if let Some(ack) = ack {
                                let _ = ack.send(res);
                            }
                        }
                        Err(mpsc::RecvTimeoutError::Timeout) => {
                            if shared_clone.gc_reporting().is_ok() && checkpoint_on_gc {
                                if let Err(e) = shared_clone.checkpoint() {
                                    events.on_event(HeadEvent::CheckpointFailed {
                                        error: e.to_string(),
                                    });
                                }
                            }
                        }
                        Ok(HousekeepingCommand::Shutdown)
                        | Err(mpsc::RecvTimeoutError::Disconnected) => {
                            events.on_event(HeadEvent::HousekeepingStopping);
                            break;
                        }
                    }
                }
            })
            .map_err(|e| {
                HeadError::BackgroundTaskError(format!("failed to spawn housekeeping thread: {}", e))
            })?;

        Ok(Head {
            shared,
            housekeeping_tx: Some(tx),
            housekeeping_handle: Some(handle),
            options,
        })
    }

    /// Starts a new append transaction.
    pub fn appender(&self) -> Appender<'_> {
        Appender::new(&self.shared)
    }

    /// Returns the reference of the series for `labels`, creating it if needed.
    ///
    /// The boolean is true iff this call created the series. A hit counts as an observation,
    /// so a concurrent rollback of the creating appender will not remove the series.
    pub fn get_or_create(&self, labels: &Labels) -> Result<(SeriesRef, bool), HeadError> {
        if labels.is_empty() {
            return Err(HeadError::EmptyLabelSet);
        }
        let (r, created) =
            self.shared
                .index
                .get_or_create(labels.fingerprint(), labels, self.shared.clock.now_ms())?;
        if created {
            head_metrics::record_series_created(1);
        }
        Ok((r, created))
    }

    pub fn series(&self, r: SeriesRef) -> Result<Option<SeriesSnapshot>, HeadError> {
        self.shared.index.get(r)
    }

    pub fn series_by_labels(&self, labels: &Labels) -> Result<Option<SeriesSnapshot>, HeadError> {
        self.shared.index.get_by_labels(labels)
    }

    /// Removes series not written since `now - retention` and not pending in any appender.
    /// Removals of series that reached the log are logged, so replay does not bring them
    /// back.
    pub fn gc(&self) -> Result<GcStats, HeadError> {
        self.shared.gc_reporting()
    }

    /// Runs gc on the housekeeping thread and waits for it. Runs inline if no thread is
    /// configured.
    pub fn request_gc(&self) -> Result<GcStats, HeadError> {
        let Some(tx) = &self.housekeeping_tx else {
            return self.gc();
        };
        let (ack_tx, ack_rx) = mpsc::channel();
        tx.send(HousekeepingCommand::Gc { ack: Some(ack_tx) })
            .map_err(|e| HeadError::BackgroundTaskError(format!("failed to send gc command: {}", e)))?;
        ack_rx
            .recv()
            .map_err(|e| HeadError::BackgroundTaskError(format!("failed to receive gc ack: {}", e)))?
    }

    /// Drops sealed chunks that end before `mint` and rejects samples older than `mint`
    /// from now on. Returns the number of chunks removed.
    ///
    /// The new bound is logged, so replay truncates at the same point.
    pub fn truncate_chunks_before(&self, mint: Timestamp) -> Result<usize, HeadError> {
        let removed = self.shared.truncate_chunks_before(mint)?;
        head_metrics::record_chunks_removed(removed as u64);
        self.shared.events.on_event(HeadEvent::ChunksTruncated {
            mint,
            removed_chunks: removed,
        });
        Ok(removed)
    }

    /// Replaces the durability log with a single batch holding the current head: every
    /// live series with its samples, `min_valid_time`, and the reference counters.
    ///
    /// Commits, gc and truncation wait while it runs. Logs that cannot be rewritten, such
    /// as [`NoopLog`], ignore the state.
    pub fn checkpoint(&self) -> Result<CheckpointStats, HeadError> {
        self.shared.checkpoint().map_err(|e| {
            self.shared.events.on_event(HeadEvent::CheckpointFailed {
                error: e.to_string(),
            });
            e
        })
    }

    /// Lowest timestamp still accepted by appenders.
    pub fn min_valid_time(&self) -> Timestamp {
        self.shared.min_valid_time.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> HeadStats {
        let min = self.shared.min_time.load(Ordering::Acquire);
        let max = self.shared.max_time.load(Ordering::Acquire);
        HeadStats {
            num_series: self.shared.index.len(),
            min_time: (min != Timestamp::MAX).then_some(min),
            max_time: (max != Timestamp::MIN).then_some(max),
            active_appenders: self.shared.appenders.load(Ordering::Relaxed),
            min_valid_time: self.min_valid_time(),
        }
    }

    /// The series index, for read-side iteration and consistency checks.
    pub fn index(&self) -> &SeriesIndex {
        &self.shared.index
    }

    pub fn options(&self) -> &HeadOptions {
        &self.options
    }

    /// Stops the housekeeping thread and waits for it.
    pub fn close(mut self) -> Result<(), HeadError> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<(), HeadError> {
        if let Some(tx) = self.housekeeping_tx.take() {
            let _ = tx.send(HousekeepingCommand::Shutdown);
        }
        if let Some(handle) = self.housekeeping_handle.take() {
            if handle.join().is_err() {
                self.shared.events.on_event(HeadEvent::HousekeepingPanicked);
                return Err(HeadError::BackgroundTaskError(
                    "housekeeping thread panicked".to_string(),
                ));
            }
        }
        Ok(())
    }
}

impl Drop for Head {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}
