//! Load driver for the tshead write path.
//!
//! Loads settings from (in precedence order): defaults, config file, environment variables
//! (`TSHEAD_*`), and CLI flags. Builds a head, runs one ingestion workload against it and
//! prints the throughput.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, ValueEnum};
use config::{Config, Environment, File};
use rayon::prelude::*;
use tshead::{Head, HeadError, HeadOptions, Labels, TracingEventListener};

// ---------- CLI ----------

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Workload {
    /// Sequential get-or-create of `{a="<i>"}` series.
    SeriesCreate,
    /// The same, spread over the rayon pool.
    SeriesCreateParallel,
    /// Appenders of `batch_size` samples for 3-label series, each committed.
    AppenderCommit,
}

/// Drives ingestion workloads against an in-memory head.
#[derive(Parser, Debug)]
#[command(name = "headload", version, about)]
pub struct Cli {
    /// Path to config file (TOML). If omitted, `headload.toml` is loaded when present.
    #[arg(long, env = "TSHEAD_CONFIG")]
    pub config: Option<PathBuf>,

    /// Do not load any config file; use defaults + env + CLI only.
    #[arg(long, default_value_t = false)]
    pub no_config: bool,

    /// Load and validate config (file + env + CLI), print the effective settings, then exit.
    #[arg(long, default_value_t = false)]
    pub validate_config: bool,

    #[arg(long, value_enum, default_value_t = Workload::AppenderCommit)]
    pub workload: Workload,

    /// Number of series created by series-create*.
    #[arg(long)]
    pub series: Option<u64>,

    /// Number of committed appenders for appender-commit.
    #[arg(long)]
    pub batches: Option<u64>,

    /// Samples per appender for appender-commit.
    #[arg(long)]
    pub batch_size: Option<u64>,

    /// Number of index shards (power of two).
    #[arg(long)]
    pub stripe_size: Option<usize>,

    /// Log committed batches to a write-ahead log in this directory.
    #[arg(long)]
    pub wal_dir: Option<PathBuf>,

    /// Print the Prometheus rendering of the head metrics after the run.
    #[arg(long, default_value_t = false)]
    pub metrics: bool,
}

// ---------- File/env config (all optional for partial config) ----------

/// Settings as read from file + env. Every field optional for layering.
#[derive(Debug, Default, serde::Deserialize)]
pub struct LoadFileConfig {
    pub stripe_size: Option<usize>,
    pub chunk_range_ms: Option<i64>,
    pub samples_per_chunk: Option<usize>,
    pub retention_secs: Option<u64>,
    pub gc_interval_secs: Option<u64>,
    pub min_valid_time: Option<i64>,
    pub wal_dir: Option<String>,
    pub wal_sync_on_append: Option<bool>,
    pub series: Option<u64>,
    pub batches: Option<u64>,
    pub batch_size: Option<u64>,
}

/// Workload sizing derived from config + env + CLI.
#[derive(Debug, Clone)]
pub struct LoadOptions {
    pub series: u64,
    pub batches: u64,
    pub batch_size: u64,
    pub wal_dir: Option<PathBuf>,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            series: 100_000,
            batches: 10,
            batch_size: 10_000,
            wal_dir: None,
        }
    }
}

/// Load merged head options and workload sizing. CLI overrides file/env for both.
fn load_config(cli: &Cli) -> Result<(HeadOptions, LoadOptions), String> {
    let mut builder = Config::builder();

    if !cli.no_config {
        if let Some(ref path) = cli.config {
            if !path.exists() {
                return Err(format!("config file not found: {}", path.display()));
            }
            builder = builder.add_source(File::from(path.as_path()).required(false));
        } else {
            let default_path = PathBuf::from("headload.toml");
            if default_path.exists() {
                builder = builder.add_source(File::from(default_path.as_path()).required(false));
            }
        }
    }

    builder = builder.add_source(
        Environment::with_prefix("TSHEAD")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
            .ignore_empty(true),
    );

    let merged = builder.build().map_err(|e| e.to_string())?;
    let partial: LoadFileConfig = merged.try_deserialize().map_err(|e| e.to_string())?;

    let mut head_options = HeadOptions {
        event_listener: Arc::new(TracingEventListener),
        ..HeadOptions::default()
    };
    let mut load = LoadOptions::default();
    merge_into_options(&mut head_options, &mut load, &partial);

    if let Some(n) = cli.stripe_size {
        head_options.stripe_size = n;
    }
    if let Some(n) = cli.series {
        load.series = n;
    }
    if let Some(n) = cli.batches {
        load.batches = n;
    }
    if let Some(n) = cli.batch_size {
        load.batch_size = n;
    }
    if let Some(ref d) = cli.wal_dir {
        load.wal_dir = Some(d.clone());
    }

    head_options.validate().map_err(|e| e.to_string())?;
    if load.batch_size == 0 {
        return Err("batch_size must be positive".to_string());
    }
    Ok((head_options, load))
}

/// Merge file/env partial config. Only overwrites fields that are `Some`.
fn merge_into_options(base: &mut HeadOptions, load: &mut LoadOptions, partial: &LoadFileConfig) {
    if let Some(n) = partial.stripe_size {
        base.stripe_size = n;
    }
    if let Some(ms) = partial.chunk_range_ms {
        base.chunk_range = ms;
    }
    if let Some(n) = partial.samples_per_chunk {
        base.samples_per_chunk = n;
    }
    if let Some(secs) = partial.retention_secs {
        base.retention = Duration::from_secs(secs);
    }
    if let Some(secs) = partial.gc_interval_secs {
        base.gc_interval = Some(Duration::from_secs(secs));
    }
    if let Some(t) = partial.min_valid_time {
        base.min_valid_time = t;
    }
    if let Some(b) = partial.wal_sync_on_append {
        base.wal_sync_on_append = b;
    }
    if let Some(s) = &partial.wal_dir {
        load.wal_dir = Some(PathBuf::from(s));
    }
    if let Some(n) = partial.series {
        load.series = n;
    }
    if let Some(n) = partial.batches {
        load.batches = n;
    }
    if let Some(n) = partial.batch_size {
        load.batch_size = n;
    }
}

// ---------- Workloads ----------

fn series_create(head: &Head, n: u64) -> Result<u64, HeadError> {
    for i in 0..n {
        let v = i.to_string();
        head.get_or_create(&Labels::from_strings(&["a", v.as_str()])?)?;
    }
    Ok(n)
}

fn series_create_parallel(head: &Head, n: u64) -> Result<u64, HeadError> {
    let next = AtomicU64::new(0);
    (0..n).into_par_iter().try_for_each(|_| {
        let v = next.fetch_add(1, Ordering::Relaxed).to_string();
        head.get_or_create(&Labels::from_strings(&["a", v.as_str()])?)
            .map(|_| ())
    })?;
    Ok(n)
}

fn appender_commit(head: &Head, batches: u64, batch_size: u64) -> Result<u64, HeadError> {
    let mut appended = 0;
    for i in 0..batches {
        let num1 = i.to_string();
        let mut app = head.appender();
        for j in 0..batch_size {
            let num2 = j.to_string();
            let labels = Labels::from_strings(&[
                "test",
                "test",
                "num1",
                num1.as_str(),
                "num2",
                num2.as_str(),
            ])?;
            app.add(&labels, j as i64, 0.0)?;
        }
        let summary = app.commit()?;
        appended += summary.appended as u64;
        if !summary.is_complete() {
            tracing::warn!(batch = i, rejected = summary.rejected.len(), "samples rejected");
        }
    }
    Ok(appended)
}

fn run(head: &Head, workload: Workload, load: &LoadOptions) -> Result<u64, HeadError> {
    match workload {
        Workload::SeriesCreate => series_create(head, load.series),
        Workload::SeriesCreateParallel => series_create_parallel(head, load.series),
        Workload::AppenderCommit => appender_commit(head, load.batches, load.batch_size),
    }
}

// ---------- Main ----------

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(true)
        .init();

    let cli = Cli::parse();
    let (head_options, load) = load_config(&cli).map_err(|e| {
        eprintln!("config error: {}", e);
        e
    })?;

    if cli.validate_config {
        println!("stripe_size={}", head_options.stripe_size);
        println!("chunk_range_ms={}", head_options.chunk_range);
        println!("samples_per_chunk={}", head_options.samples_per_chunk);
        println!("retention_secs={}", head_options.retention.as_secs());
        println!(
            "gc_interval_secs={}",
            head_options
                .gc_interval
                .map_or_else(|| "none".to_string(), |d| d.as_secs().to_string())
        );
        println!("series={}", load.series);
        println!("batches={}", load.batches);
        println!("batch_size={}", load.batch_size);
        println!(
            "wal_dir={}",
            load.wal_dir
                .as_ref()
                .map_or_else(|| "none".to_string(), |d| d.display().to_string())
        );
        return Ok(());
    }

    #[cfg(feature = "prometheus")]
    let prometheus = if cli.metrics {
        Some(tshead::telemetry::head_metrics::InProcessPrometheus::install(
            Duration::from_secs(5),
        )?)
    } else {
        None
    };
    #[cfg(not(feature = "prometheus"))]
    if cli.metrics {
        return Err("--metrics requires the `prometheus` feature".into());
    }

    let head = match &load.wal_dir {
        Some(dir) => {
            let (head, replay) = Head::open(head_options, dir)?;
            tracing::info!(
                series = replay.series,
                samples = replay.samples,
                "replayed write-ahead log"
            );
            head
        }
        None => Head::with_options(head_options)?,
    };

    let start = Instant::now();
    let ops = run(&head, cli.workload, &load)?;
    let elapsed = start.elapsed();

    let stats = head.stats();
    println!("workload={:?}", cli.workload);
    println!("ops={}", ops);
    println!("elapsed_ms={}", elapsed.as_millis());
    println!(
        "ops_per_sec={:.0}",
        ops as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );
    println!("series={}", stats.num_series);

    #[cfg(feature = "prometheus")]
    if let Some(p) = prometheus {
        println!("{}", p.render());
    }

    head.close()?;
    Ok(())
}
