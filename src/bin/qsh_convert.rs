//! qsh Conversion CLI
//!
//! Plans conversion runs and inspects converted storage. Decoding itself needs
//! a reader implementation and runs through the library API
//! (`Converter::new(config, readers, reconstructors)`).
//!
//! Usage:
//!   qsh_convert plan --input /data/qsh --kind order-log
//!   qsh_convert init-config --output qsh_converter.toml --timeframes 60,3600
//!   qsh_convert inspect --storage-root /data/converted

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use qsh_converter::{discover_files, make_batches, ConverterConfig, DataKind, SqliteStorage};

#[derive(Parser, Debug)]
#[command(name = "qsh_convert")]
#[command(about = "Plan and inspect qsh history conversion")]
struct Args {
    /// Converter config (TOML)
    #[arg(long, env = "QSH_CONVERTER_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Discover input files and print the batch plan
    Plan {
        /// Root directory of the qsh history
        #[arg(long, env = "QSH_INPUT_ROOT")]
        input: PathBuf,

        /// Override the configured data kind
        #[arg(long, value_enum)]
        kind: Option<KindArg>,

        /// Override the configured batch size
        #[arg(long)]
        batch_size: Option<usize>,
    },

    /// Write a config file
    InitConfig {
        #[arg(long, default_value = "qsh_converter.toml")]
        output: PathBuf,

        #[arg(long, default_value = "storage")]
        storage_root: PathBuf,

        #[arg(long, value_enum, default_value = "order-log")]
        kind: KindArg,

        /// Candle timeframes in seconds (comma-separated)
        #[arg(long, value_delimiter = ',')]
        timeframes: Vec<u64>,
    },

    /// Show instruments and trade counts in converted storage
    Inspect {
        /// Override the configured storage root
        #[arg(long)]
        storage_root: Option<PathBuf>,

        /// Candle timeframes to count, in seconds (default: configured)
        #[arg(long, value_delimiter = ',')]
        timeframes: Vec<u64>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum KindArg {
    OrderLog,
    Deals,
}

impl From<KindArg> for DataKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::OrderLog => DataKind::OrderLog,
            KindArg::Deals => DataKind::Deals,
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,qsh_converter=debug")),
        )
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => ConverterConfig::load(path)?,
        None => ConverterConfig::from_env(),
    };

    match args.command {
        Commands::Plan {
            input,
            kind,
            batch_size,
        } => plan(config, input, kind, batch_size),
        Commands::InitConfig {
            output,
            storage_root,
            kind,
            timeframes,
        } => init_config(output, storage_root, kind, timeframes),
        Commands::Inspect {
            storage_root,
            timeframes,
        } => inspect(config, storage_root, timeframes),
    }
}

fn plan(
    mut config: ConverterConfig,
    input: PathBuf,
    kind: Option<KindArg>,
    batch_size: Option<usize>,
) -> Result<()> {
    if let Some(kind) = kind {
        config.data_kind = kind.into();
    }
    if let Some(size) = batch_size {
        config.batch_size = size;
    }
    config.validate()?;

    let files = discover_files(&input, config.data_kind)?;
    let batches = make_batches(&files, config.batch_size);

    info!(input = %input.display(), kind = %config.data_kind, "Conversion plan");
    println!("Input:      {}", input.display());
    println!("Kind:       {}", config.data_kind);
    println!("Storage:    {}", config.storage_root.display());
    println!("Timeframes: {:?}", config.timeframes());
    println!("Files:      {}", files.len());
    println!("Batches:    {} (size {})", batches.len(), config.batch_size);
    for (i, batch) in batches.iter().enumerate() {
        let first = batch.first().map(|p| p.display().to_string()).unwrap_or_default();
        let last = batch.last().map(|p| p.display().to_string()).unwrap_or_default();
        println!("  #{:<4} {:>5} files  {} .. {}", i + 1, batch.len(), first, last);
    }

    Ok(())
}

fn init_config(
    output: PathBuf,
    storage_root: PathBuf,
    kind: KindArg,
    timeframes: Vec<u64>,
) -> Result<()> {
    let mut config = ConverterConfig::new(storage_root, kind.into());
    config.timeframe_secs = timeframes;
    config.validate()?;
    config
        .save(&output)
        .with_context(|| format!("Failed to write {}", output.display()))?;

    println!("Wrote {}", output.display());
    Ok(())
}

fn inspect(
    config: ConverterConfig,
    storage_root: Option<PathBuf>,
    timeframes: Vec<u64>,
) -> Result<()> {
    let root = storage_root.unwrap_or(config.storage_root.clone());
    let timeframes: Vec<Duration> = if timeframes.is_empty() {
        config.timeframes()
    } else {
        timeframes.into_iter().map(Duration::from_secs).collect()
    };

    let storage = SqliteStorage::open(&root)?;
    let symbols = storage.symbols()?;

    println!("Storage: {}", root.display());
    println!("Instruments: {}", symbols.len());
    for symbol in &symbols {
        let trades = storage.count_trades(symbol)?;
        print!("  {:<16} {:>10} trades", symbol, trades);
        for tf in &timeframes {
            let candles = storage.load_candles(symbol, *tf)?;
            print!("  {}s: {} candles", tf.as_secs(), candles.len());
        }
        println!();
    }

    Ok(())
}
