//! Batch scheduling and the conversion entry point.
//!
//! Files are converted in fixed-size batches. Every file of a batch runs as its
//! own unit on the worker pool and the batch is joined before the next one
//! starts, so a batch caps the work in flight. A failing or panicking unit is
//! reported and counted as completed; its siblings keep going.

use anyhow::{anyhow, ensure, Context, Result};
use rayon::prelude::*;
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::candles::TimeBucketCandles;
use super::config::ConverterConfig;
use super::decoder::ReaderFactory;
use super::dispatch::{AggregateDispatcher, CandleBuilderFactory, DispatchStats, TradeStorage};
use super::progress::{ConvertObserver, ProgressTracker, TracingObserver};
use super::storage::SqliteStorage;
use super::transform::{transform_file, ReconstructorFactory};
use super::types::DataKind;

/// Extension of vendor history files.
pub const QSH_EXTENSION: &str = "qsh";

// =============================================================================
// Discovery and batching
// =============================================================================

/// Whether the file stem carries the marker of `kind`.
pub fn matches_kind(path: &Path, kind: DataKind) -> bool {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map_or(false, |stem| stem.contains(kind.file_marker()))
}

/// Keep the files of `kind`, preserving order.
pub fn filter_kind(files: &[PathBuf], kind: DataKind) -> Vec<PathBuf> {
    files
        .iter()
        .filter(|p| matches_kind(p, kind))
        .cloned()
        .collect()
}

/// Recursively find `.qsh` files of `kind` under `root`, sorted by path.
pub fn discover_files(root: &Path, kind: DataKind) -> Result<Vec<PathBuf>> {
    ensure!(root.is_dir(), "Input root is not a directory: {}", root.display());

    let files: Vec<PathBuf> = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(e) => Some(e),
            Err(e) => {
                warn!(error = %e, "Skipping unreadable entry");
                None
            }
        })
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| {
            p.extension()
                .and_then(|ext| ext.to_str())
                .map_or(false, |ext| ext.eq_ignore_ascii_case(QSH_EXTENSION))
        })
        .filter(|p| matches_kind(p, kind))
        .collect();

    debug!(root = %root.display(), %kind, files = files.len(), "Discovery complete");
    Ok(files)
}

/// Split `files` into consecutive batches of at most `batch_size`.
///
/// Never yields an empty batch; no files means no batches.
pub fn make_batches(files: &[PathBuf], batch_size: usize) -> Vec<Vec<PathBuf>> {
    files
        .chunks(batch_size.max(1))
        .map(<[PathBuf]>::to_vec)
        .collect()
}

// =============================================================================
// Summary
// =============================================================================

/// Outcome of a conversion run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversionSummary {
    pub files_total: usize,
    pub files_converted: usize,
    pub files_failed: usize,
    pub batches: usize,
    pub days_saved: usize,
    pub trades_saved: usize,
    pub candle_series_saved: usize,
    pub elapsed: Duration,
}

impl fmt::Display for ConversionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Converted {}/{} files ({} failed) in {} batches: {} days, {} trades, {} candle series in {:.1}s",
            self.files_converted,
            self.files_total,
            self.files_failed,
            self.batches,
            self.days_saved,
            self.trades_saved,
            self.candle_series_saved,
            self.elapsed.as_secs_f64()
        )
    }
}

#[derive(Debug, Default)]
struct RunCounters {
    converted: AtomicUsize,
    failed: AtomicUsize,
    days: AtomicUsize,
    trades: AtomicUsize,
    candle_series: AtomicUsize,
}

// =============================================================================
// Converter
// =============================================================================

/// Converts qsh files into stored day-partitioned trades and candles.
pub struct Converter<F, B, S = SqliteStorage, C = TimeBucketCandles> {
    config: ConverterConfig,
    readers: F,
    reconstructors: B,
    storage: S,
    candles: C,
    timeframes: Vec<Duration>,
    progress: Arc<ProgressTracker>,
    observer: Arc<dyn ConvertObserver>,
    pool: rayon::ThreadPool,
}

impl<F, B> Converter<F, B>
where
    F: ReaderFactory,
    B: ReconstructorFactory,
{
    /// Converter writing to SQLite under `config.storage_root` (created if missing).
    pub fn new(config: ConverterConfig, readers: F, reconstructors: B) -> Result<Self> {
        config.validate()?;
        let storage = SqliteStorage::open(&config.storage_root)?;
        Self::with_components(config, readers, reconstructors, storage, TimeBucketCandles)
    }
}

impl<F, B, S, C> Converter<F, B, S, C>
where
    F: ReaderFactory,
    B: ReconstructorFactory,
    S: TradeStorage,
    C: CandleBuilderFactory,
{
    pub fn with_components(
        config: ConverterConfig,
        readers: F,
        reconstructors: B,
        storage: S,
        candles: C,
    ) -> Result<Self> {
        config.validate()?;
        let timeframes = config.timeframes();
        check_timeframes(&candles, &timeframes)?;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.worker_threads.unwrap_or(0))
            .thread_name(|i| format!("qsh-convert-{}", i))
            .build()
            .context("Failed to build worker pool")?;

        Ok(Self {
            timeframes,
            config,
            readers,
            reconstructors,
            storage,
            candles,
            progress: Arc::new(ProgressTracker::new()),
            observer: Arc::new(TracingObserver),
            pool,
        })
    }

    /// Replace the progress/error observer.
    pub fn with_observer(mut self, observer: Arc<dyn ConvertObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Replace the candle timeframes for subsequent runs.
    ///
    /// Rejected timeframes leave the current ones in place.
    pub fn set_timeframes(&mut self, timeframes: &[Duration]) -> Result<()> {
        check_timeframes(&self.candles, timeframes)?;
        self.config.set_timeframes(timeframes)?;
        self.timeframes = timeframes.to_vec();
        Ok(())
    }

    pub fn config(&self) -> &ConverterConfig {
        &self.config
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn progress(&self) -> &Arc<ProgressTracker> {
        &self.progress
    }

    /// Discover files of the configured kind under `root` and convert them.
    pub fn convert_dir(&self, root: impl AsRef<Path>) -> Result<ConversionSummary> {
        let files = discover_files(root.as_ref(), self.config.data_kind)?;
        self.convert_files(&files)
    }

    /// Convert a pre-enumerated file list. Files of the other kind are skipped.
    pub fn convert_files(&self, files: &[PathBuf]) -> Result<ConversionSummary> {
        let started = Instant::now();
        let files = filter_kind(files, self.config.data_kind);
        let batches = make_batches(&files, self.config.batch_size);

        self.progress.start(files.len());
        info!(
            kind = %self.config.data_kind,
            files = files.len(),
            batches = batches.len(),
            batch_size = self.config.batch_size,
            timeframes = self.timeframes.len(),
            "Starting conversion"
        );

        let counters = RunCounters::default();
        for (i, batch) in batches.iter().enumerate() {
            debug!(batch = i + 1, files = batch.len(), "Converting batch");
            self.pool.install(|| {
                batch.par_iter().for_each(|path| self.run_unit(path, &counters));
            });
        }

        let summary = ConversionSummary {
            files_total: files.len(),
            files_converted: counters.converted.load(Ordering::Relaxed),
            files_failed: counters.failed.load(Ordering::Relaxed),
            batches: batches.len(),
            days_saved: counters.days.load(Ordering::Relaxed),
            trades_saved: counters.trades.load(Ordering::Relaxed),
            candle_series_saved: counters.candle_series.load(Ordering::Relaxed),
            elapsed: started.elapsed(),
        };
        info!("{}", summary);
        Ok(summary)
    }

    /// One file: transform, dispatch, then count it as completed either way.
    fn run_unit(&self, path: &Path, counters: &RunCounters) {
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.convert_one(path)))
            .unwrap_or_else(|payload| {
                Err(anyhow!("worker panicked: {}", panic_message(&payload)))
            });

        match result {
            Ok(stats) => {
                counters.converted.fetch_add(1, Ordering::Relaxed);
                counters.days.fetch_add(stats.days_saved, Ordering::Relaxed);
                counters.trades.fetch_add(stats.trades_saved, Ordering::Relaxed);
                counters
                    .candle_series
                    .fetch_add(stats.candle_series_saved, Ordering::Relaxed);
            }
            Err(e) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                self.observer
                    .on_error(&format!("Failed to convert {}: {:#}", path.display(), e));
            }
        }

        self.progress.record_completion(self.observer.as_ref());
    }

    fn convert_one(&self, path: &Path) -> Result<DispatchStats> {
        let mut partitions = transform_file(
            path,
            self.config.data_kind,
            &self.readers,
            &self.reconstructors,
        )?;

        AggregateDispatcher::new(&self.storage, &self.candles, &self.timeframes)
            .dispatch(&mut partitions)
            .with_context(|| format!("Failed to persist {}", path.display()))
    }
}

/// Fails on the first timeframe the factory cannot build a builder for.
fn check_timeframes<C>(candles: &C, timeframes: &[Duration]) -> Result<()>
where
    C: CandleBuilderFactory,
{
    for &timeframe in timeframes {
        candles
            .create(timeframe)
            .with_context(|| format!("Unsupported candle timeframe {:?}", timeframe))?;
    }
    Ok(())
}

fn panic_message(payload: &Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(n: usize) -> Vec<PathBuf> {
        (0..n)
            .map(|i| PathBuf::from(format!("SiZ4.2024-01-{:02}.OrdLog.qsh", i)))
            .collect()
    }

    #[test]
    fn test_batching_sizes() {
        for (n, expected) in [
            (0usize, vec![]),
            (5, vec![5]),
            (700, vec![700]),
            (701, vec![700, 1]),
            (1400, vec![700, 700]),
            (1401, vec![700, 700, 1]),
        ] {
            let files = paths(n);
            let batches = make_batches(&files, 700);
            let sizes: Vec<usize> = batches.iter().map(Vec::len).collect();
            assert_eq!(sizes, expected, "n = {}", n);
            assert!(batches.iter().all(|b| !b.is_empty()));
            assert_eq!(batches.concat(), files);
        }
    }

    #[test]
    fn test_kind_filter() {
        let files = vec![
            PathBuf::from("/data/2024-01-10/SiH4.2024-01-10.OrdLog.qsh"),
            PathBuf::from("/data/2024-01-10/SiH4.2024-01-10.Deals.qsh"),
            PathBuf::from("/data/2024-01-10/SiH4.2024-01-10.Quotes.qsh"),
            PathBuf::from("/data/2024-01-11/RIH4.2024-01-11.OrdLog.qsh"),
        ];

        assert_eq!(
            filter_kind(&files, DataKind::OrderLog),
            vec![files[0].clone(), files[3].clone()]
        );
        assert_eq!(filter_kind(&files, DataKind::Deals), vec![files[1].clone()]);
    }

    #[test]
    fn test_marker_must_be_in_file_name() {
        assert!(!matches_kind(
            Path::new("/Deals/SiH4.2024-01-10.OrdLog.qsh"),
            DataKind::Deals
        ));
    }

    #[test]
    fn test_discover_recursive_and_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        for rel in [
            "2024-01-11/SiH4.2024-01-11.OrdLog.qsh",
            "2024-01-10/SiH4.2024-01-10.OrdLog.qsh",
            "2024-01-10/SiH4.2024-01-10.Deals.qsh",
            "2024-01-10/nested/RIH4.2024-01-10.OrdLog.QSH",
            "2024-01-10/SiH4.2024-01-10.OrdLog.txt",
            "SiH4.2024-01-09.OrdLog.qsh",
        ] {
            let path = root.join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, b"").unwrap();
        }

        let found = discover_files(root, DataKind::OrderLog).unwrap();
        let rel: Vec<String> = found
            .iter()
            .map(|p| p.strip_prefix(root).unwrap().to_string_lossy().replace('\\', "/"))
            .collect();

        assert_eq!(
            rel,
            vec![
                "2024-01-10/SiH4.2024-01-10.OrdLog.qsh",
                "2024-01-10/nested/RIH4.2024-01-10.OrdLog.QSH",
                "2024-01-11/SiH4.2024-01-11.OrdLog.qsh",
                "SiH4.2024-01-09.OrdLog.qsh",
            ]
        );
        assert_eq!(discover_files(root, DataKind::Deals).unwrap().len(), 1);
    }

    #[test]
    fn test_discover_missing_root_is_setup_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(discover_files(&dir.path().join("missing"), DataKind::Deals).is_err());
    }

    #[test]
    fn test_summary_display() {
        let summary = ConversionSummary {
            files_total: 10,
            files_converted: 9,
            files_failed: 1,
            batches: 1,
            days_saved: 9,
            trades_saved: 1200,
            candle_series_saved: 18,
            elapsed: Duration::from_millis(2500),
        };
        assert_eq!(
            summary.to_string(),
            "Converted 9/10 files (1 failed) in 1 batches: 9 days, 1200 trades, 18 candle series in 2.5s"
        );
    }
}
