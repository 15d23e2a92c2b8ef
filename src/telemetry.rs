use std::sync::Arc;
use std::time::Duration;

#[cfg(feature = "prometheus")]
use std::sync::atomic::{AtomicBool, Ordering};
#[cfg(feature = "prometheus")]
use std::sync::Mutex;
#[cfg(feature = "prometheus")]
use std::thread::JoinHandle;

/// Structured, in-process event hook for observability.
///
/// The head never prints. Callers plug in an implementation that forwards these events to
/// `tracing` ([`TracingEventListener`]), metrics, or their own sinks.
pub trait HeadEventListener: std::fmt::Debug + Send + Sync + 'static {
    fn on_event(&self, event: HeadEvent);
}

/// Structured events emitted by the head.
#[derive(Debug, Clone, PartialEq)]
pub enum HeadEvent {
    HousekeepingStarted,
    HousekeepingStopping,
    HousekeepingPanicked,

    GcCompleted { removed_series: usize, live_series: usize, cutoff: i64 },
    GcFailed { error: String },

    ChunksTruncated { mint: i64, removed_chunks: usize },

    LogAppendFailed { error: String },
    CommitFailed { error: String },
    RollbackRemovedSeries { removed: usize },

    ReplayCompleted { series: usize, samples: usize, skipped_samples: usize, torn_tail: bool },
    CheckpointCompleted { series: usize, samples: usize },
    CheckpointFailed { error: String },
}

#[derive(Debug)]
pub struct NoopEventListener;

impl HeadEventListener for NoopEventListener {
    #[inline]
    fn on_event(&self, _event: HeadEvent) {}
}

pub fn noop_event_listener() -> Arc<dyn HeadEventListener> {
    Arc::new(NoopEventListener)
}

/// Forwards head events to `tracing`.
#[derive(Debug, Default)]
pub struct TracingEventListener;

impl HeadEventListener for TracingEventListener {
    fn on_event(&self, event: HeadEvent) {
        match event {
            HeadEvent::HousekeepingStarted => tracing::debug!("head housekeeping started"),
            HeadEvent::HousekeepingStopping => tracing::debug!("head housekeeping stopping"),
            HeadEvent::HousekeepingPanicked => tracing::error!("head housekeeping thread panicked"),
            HeadEvent::GcCompleted { removed_series, live_series, cutoff } => {
                tracing::info!(removed_series, live_series, cutoff, "head gc completed")
            }
            HeadEvent::GcFailed { error } => tracing::error!(%error, "head gc failed"),
            HeadEvent::ChunksTruncated { mint, removed_chunks } => {
                tracing::info!(mint, removed_chunks, "head chunks truncated")
            }
            HeadEvent::LogAppendFailed { error } => {
                tracing::error!(%error, "durability log append failed")
            }
            HeadEvent::CommitFailed { error } => tracing::warn!(%error, "commit failed"),
            HeadEvent::RollbackRemovedSeries { removed } => {
                tracing::debug!(removed, "rollback removed series")
            }
            HeadEvent::ReplayCompleted { series, samples, skipped_samples, torn_tail } => {
                tracing::info!(series, samples, skipped_samples, torn_tail, "log replay completed")
            }
            HeadEvent::CheckpointCompleted { series, samples } => {
                tracing::info!(series, samples, "log checkpoint completed")
            }
            HeadEvent::CheckpointFailed { error } => tracing::error!(%error, "log checkpoint failed"),
        }
    }
}

/// Metrics instrumentation and in-process scraping.
///
/// Emitting metrics is a no-op until a recorder is installed. With the `prometheus` feature,
/// [`head_metrics::InProcessPrometheus`] installs one and renders the exposition text.
pub mod head_metrics {
    use super::*;

    use ::metrics::{describe_counter, describe_gauge, describe_histogram, Unit};

    #[cfg(feature = "prometheus")]
    use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

    // Counters are exposed as `<name>_total` by the Prometheus exporter.
    pub const SERIES_CREATED: &str = "tshead_series_created";
    pub const SERIES_REMOVED: &str = "tshead_series_removed";
    pub const SAMPLES_APPENDED: &str = "tshead_samples_appended";
    pub const SAMPLES_REJECTED: &str = "tshead_samples_rejected";
    pub const CHUNKS_CREATED: &str = "tshead_chunks_created";
    pub const CHUNKS_REMOVED: &str = "tshead_chunks_removed";
    pub const LOG_BYTES_WRITTEN: &str = "tshead_log_bytes_written";

    pub const COMMIT_DURATION_SECONDS: &str = "tshead_commit_duration_seconds";
    pub const GC_DURATION_SECONDS: &str = "tshead_gc_duration_seconds";
    pub const LOG_FSYNC_DURATION_SECONDS: &str = "tshead_log_fsync_duration_seconds";

    pub const SERIES: &str = "tshead_series";
    pub const ACTIVE_APPENDERS: &str = "tshead_active_appenders";

    /// Handle to the in-process Prometheus recorder/scrape renderer.
    ///
    /// This does **not** start an HTTP server. Call [`InProcessPrometheus::render`] to scrape.
    #[cfg(feature = "prometheus")]
    pub struct InProcessPrometheus {
        handle: PrometheusHandle,
        stop: Arc<AtomicBool>,
        upkeep_thread: Mutex<Option<JoinHandle<()>>>,
    }

    #[cfg(feature = "prometheus")]
    impl InProcessPrometheus {
        /// Installs a global Prometheus recorder (once per process) and starts an upkeep thread.
        pub fn install(upkeep_interval: Duration) -> Result<Self, MetricsInitError> {
            describe_all();

            let handle = PrometheusBuilder::new()
                .install_recorder()
                .map_err(MetricsInitError::from_build_error)?;

            let stop = Arc::new(AtomicBool::new(false));
            let stop_clone = stop.clone();
            let handle_clone = handle.clone();
            let upkeep_thread = std::thread::Builder::new()
                .name("tshead-metrics-upkeep".to_string())
                .spawn(move || {
                    while !stop_clone.load(Ordering::Relaxed) {
                        std::thread::sleep(upkeep_interval);
                        handle_clone.run_upkeep();
                    }
                })
                .map_err(|e| MetricsInitError::ThreadSpawn(e.to_string()))?;

            Ok(Self {
                handle,
                stop,
                upkeep_thread: Mutex::new(Some(upkeep_thread)),
            })
        }

        /// Renders the current metrics in the Prometheus text exposition format.
        pub fn render(&self) -> String {
            self.handle.render()
        }
    }

    #[cfg(feature = "prometheus")]
    impl std::fmt::Debug for InProcessPrometheus {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("InProcessPrometheus")
                .field("stop", &self.stop)
                .field("upkeep_thread", &self.upkeep_thread)
                .finish_non_exhaustive()
        }
    }

    #[cfg(feature = "prometheus")]
    impl Drop for InProcessPrometheus {
        fn drop(&mut self) {
            self.stop.store(true, Ordering::Relaxed);
            if let Ok(mut guard) = self.upkeep_thread.lock() {
                if let Some(t) = guard.take() {
                    let _ = t.join();
                }
            }
        }
    }

    #[cfg(feature = "prometheus")]
    #[derive(Debug, thiserror::Error)]
    pub enum MetricsInitError {
        #[error("metrics recorder already installed")]
        AlreadyInstalled,
        #[error("failed to install prometheus recorder: {0}")]
        Install(String),
        #[error("failed to spawn upkeep thread: {0}")]
        ThreadSpawn(String),
    }

    #[cfg(feature = "prometheus")]
    impl MetricsInitError {
        fn from_build_error(e: BuildError) -> Self {
            match e {
                BuildError::FailedToSetGlobalRecorder(_) => MetricsInitError::AlreadyInstalled,
                other => MetricsInitError::Install(other.to_string()),
            }
        }
    }

    #[inline]
    pub fn record_series_created(n: u64) {
        if n > 0 {
            ::metrics::counter!(SERIES_CREATED).increment(n);
        }
    }

    #[inline]
    pub fn record_series_removed(n: u64) {
        if n > 0 {
            ::metrics::counter!(SERIES_REMOVED).increment(n);
        }
    }

    #[inline]
    pub fn set_series(n: usize) {
        ::metrics::gauge!(SERIES).set(n as f64);
    }

    #[inline]
    pub fn record_commit(duration: Duration, appended: u64, chunks_created: u64) {
        ::metrics::histogram!(COMMIT_DURATION_SECONDS).record(duration.as_secs_f64());
        if appended > 0 {
            ::metrics::counter!(SAMPLES_APPENDED).increment(appended);
        }
        if chunks_created > 0 {
            ::metrics::counter!(CHUNKS_CREATED).increment(chunks_created);
        }
    }

    #[inline]
    pub fn record_rejected(reason: &'static str) {
        ::metrics::counter!(SAMPLES_REJECTED, "reason" => reason).increment(1);
    }

    #[inline]
    pub fn record_chunks_removed(n: u64) {
        if n > 0 {
            ::metrics::counter!(CHUNKS_REMOVED).increment(n);
        }
    }

    #[inline]
    pub fn record_gc(duration: Duration) {
        ::metrics::histogram!(GC_DURATION_SECONDS).record(duration.as_secs_f64());
    }

    #[inline]
    pub fn record_log_bytes_written(bytes: u64) {
        if bytes > 0 {
            ::metrics::counter!(LOG_BYTES_WRITTEN).increment(bytes);
        }
    }

    #[inline]
    pub fn record_log_fsync(duration: Duration) {
        ::metrics::histogram!(LOG_FSYNC_DURATION_SECONDS).record(duration.as_secs_f64());
    }

    #[inline]
    pub fn appender_opened() {
        ::metrics::gauge!(ACTIVE_APPENDERS).increment(1.0);
    }

    #[inline]
    pub fn appender_closed() {
        ::metrics::gauge!(ACTIVE_APPENDERS).decrement(1.0);
    }

    pub fn describe_all() {
        describe_counter!(SERIES_CREATED, Unit::Count, "Total number of series created in the head.");
        describe_counter!(SERIES_REMOVED, Unit::Count, "Total number of series removed by gc or rollback.");
        describe_counter!(SAMPLES_APPENDED, Unit::Count, "Total number of samples committed.");
        describe_counter!(
            SAMPLES_REJECTED,
            Unit::Count,
            "Total number of samples rejected, by reason."
        );
        describe_counter!(CHUNKS_CREATED, Unit::Count, "Total number of head chunks cut.");
        describe_counter!(CHUNKS_REMOVED, Unit::Count, "Total number of sealed chunks truncated.");
        describe_counter!(
            LOG_BYTES_WRITTEN,
            Unit::Bytes,
            "Total number of bytes written to the durability log, frame headers included."
        );

        describe_histogram!(
            COMMIT_DURATION_SECONDS,
            Unit::Seconds,
            "Time to log and apply one appender batch."
        );
        describe_histogram!(GC_DURATION_SECONDS, Unit::Seconds, "Duration of one gc pass.");
        describe_histogram!(
            LOG_FSYNC_DURATION_SECONDS,
            Unit::Seconds,
            "Duration of durability log sync_data calls."
        );

        describe_gauge!(SERIES, Unit::Count, "Number of live series in the head.");
        describe_gauge!(ACTIVE_APPENDERS, Unit::Count, "Number of appenders not yet committed or rolled back.");
    }
}
