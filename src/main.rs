//! orderflow-engine CLI
//!
//! Commands:
//!   run       Poll a bar source and trade signals live (paper)
//!   backtest  Replay bars from a file or the sample generator
//!   sweep     Grid-search signal parameters and save the best set
//!   sample    Write synthetic order-flow bars to CSV
//!   status    Print the persisted state

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use orderflow_engine::backtest::{self, Backtester};
use orderflow_engine::live::LiveRunner;
use orderflow_engine::notify::{FanoutSink, JournalSink, LogSink};
use orderflow_engine::sample;
use orderflow_engine::sources::csv_file;
use orderflow_engine::sources::{interval_duration, AnySource, BinanceBarSource, CsvBarSource, YahooBarSource};
use orderflow_engine::sweep::{self, BestParams, SweepGrid, SweepOptions};
use orderflow_engine::trading_core::bars::Bar;
use orderflow_engine::trading_core::state_store;
use orderflow_engine::{EngineConfig, StateStore};

#[derive(Parser, Debug)]
#[command(name = "orderflow-engine")]
#[command(about = "Order-flow signal, risk and trade-lifecycle engine")]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Base config (JSON mapping)
    #[arg(short, long, global = true, env = "ORDERFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// Best-params snapshot or mapping laid over the base config
    #[arg(short, long, global = true)]
    params: Option<PathBuf>,

    /// Persisted state file
    #[arg(long, global = true, env = "ORDERFLOW_STATE", default_value = "data/state.json")]
    state: PathBuf,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum SourceKind {
    Csv,
    Binance,
    Yahoo,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Poll a bar source and run the engine until Ctrl-C
    Run {
        /// Where bars come from
        #[arg(long, value_enum, default_value = "yahoo")]
        source: SourceKind,

        /// Bar file for the csv source
        #[arg(long)]
        file: Option<PathBuf>,

        /// Override the configured symbol
        #[arg(long)]
        symbol: Option<String>,

        /// Append events to this JSONL journal
        #[arg(long, default_value = "data/journal.jsonl")]
        journal: PathBuf,
    },

    /// Replay bars through the engine and report performance
    Backtest {
        /// Bar file (.csv or .csv.zst); generated sample bars when omitted
        #[arg(short, long)]
        data: Option<PathBuf>,

        /// Sample bars to generate without --data
        #[arg(long, default_value = "5000")]
        bars: usize,

        /// Sample generator seed
        #[arg(long, default_value = "42")]
        seed: u64,

        /// Export closed trades to CSV
        #[arg(long)]
        trades_csv: Option<PathBuf>,
    },

    /// Backtest a parameter grid in parallel
    Sweep {
        /// Bar file (.csv or .csv.zst); generated sample bars when omitted
        #[arg(short, long)]
        data: Option<PathBuf>,

        /// Sample bars to generate without --data
        #[arg(long, default_value = "5000")]
        bars: usize,

        /// Sample generator seed
        #[arg(long, default_value = "42")]
        seed: u64,

        /// Random subset of the grid to run (0 = all)
        #[arg(long, default_value = "0")]
        max_combinations: usize,

        /// Seed for the grid subset
        #[arg(long, default_value = "123")]
        grid_seed: u64,

        /// Win rate (percent) the score aims for
        #[arg(long, default_value = "80")]
        target_win_rate: f64,

        /// Fewer trades than this disqualifies a combination
        #[arg(long, default_value = "25")]
        min_trades: u32,

        /// Best-params snapshot to write
        #[arg(short, long, default_value = "data/best_params.json")]
        output: PathBuf,

        /// Also write every result to CSV
        #[arg(long)]
        results_csv: Option<PathBuf>,

        /// Results to print
        #[arg(long, default_value = "10")]
        top: usize,
    },

    /// Generate synthetic order-flow bars
    Sample {
        /// Output file (.csv or .csv.zst)
        #[arg(short, long, default_value = "data/sample_bars.csv")]
        output: PathBuf,

        #[arg(long, default_value = "5000")]
        bars: usize,

        #[arg(long, default_value = "42")]
        seed: u64,

        /// First bar time (RFC 3339)
        #[arg(long, default_value = "2025-01-06T14:30:00Z")]
        start: String,

        /// Bar interval ("15s", "1m", ...)
        #[arg(long, default_value = "1m")]
        interval: String,
    },

    /// Print the persisted state and the last cycle's decision
    Status {
        /// Print the raw state record instead
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let level = if args.verbose { "orderflow_engine=debug" } else { "orderflow_engine=info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.parse()?))
        .init();

    let config = EngineConfig::load(args.config.as_deref(), args.params.as_deref())
        .context("Invalid configuration")?;

    match args.command {
        Commands::Run { source, file, symbol, journal } => {
            run_live(config, &args.state, source, file, symbol, journal).await?;
        }
        Commands::Backtest { data, bars, seed, trades_csv } => {
            run_backtest(config, data, bars, seed, trades_csv)?;
        }
        Commands::Sweep {
            data,
            bars,
            seed,
            max_combinations,
            grid_seed,
            target_win_rate,
            min_trades,
            output,
            results_csv,
            top,
        } => {
            let options = SweepOptions {
                target_win_rate,
                min_trades,
            };
            run_sweep(
                config,
                data,
                bars,
                seed,
                max_combinations,
                grid_seed,
                options,
                output,
                results_csv,
                top,
            )?;
        }
        Commands::Sample { output, bars, seed, start, interval } => {
            run_sample(output, bars, seed, &start, &interval)?;
        }
        Commands::Status { json } => {
            let store = StateStore::new(&args.state);
            let state = store.load(config.account_balance);
            if json {
                println!("{}", state_store::to_json(&state)?);
            } else {
                println!("{}", state_store::format_status(&state));
            }
        }
    }

    Ok(())
}

async fn run_live(
    mut config: EngineConfig,
    state_path: &Path,
    kind: SourceKind,
    file: Option<PathBuf>,
    symbol: Option<String>,
    journal: PathBuf,
) -> Result<()> {
    if let Some(symbol) = symbol {
        config.symbol = symbol;
    }
    let timeout = Duration::from_secs(config.fetch_timeout_secs);
    let source = match kind {
        SourceKind::Csv => {
            let path = file.context("--file is required with --source csv")?;
            AnySource::Csv(CsvBarSource::new(path))
        }
        SourceKind::Binance => AnySource::Binance(BinanceBarSource::new(timeout)?),
        SourceKind::Yahoo => AnySource::Yahoo(YahooBarSource::new(timeout)?),
    };

    info!("=== ORDERFLOW ENGINE ===");
    info!("Source: {} | Symbol: {} | Interval: {}", source.name(), config.symbol, config.interval);
    info!("State: {}", state_path.display());

    let sink = FanoutSink::new().with(LogSink).with(JournalSink::open(journal)?);
    let runner = LiveRunner::new(config, source, sink, StateStore::new(state_path))?;
    runner
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl-C: {}", e);
            }
        })
        .await
}

fn load_or_generate(data: Option<PathBuf>, bars: usize, seed: u64, interval: &str) -> Result<Vec<Bar>> {
    match data {
        Some(path) => csv_file::read_bars(&path),
        None => {
            let step = interval_duration(interval)
                .with_context(|| format!("Unsupported interval: {}", interval))?;
            let start = parse_start("2025-01-06T14:30:00Z")?;
            info!("Generating {} sample bars (seed {})", bars, seed);
            Ok(sample::generate_bars(bars, seed, start, step))
        }
    }
}

fn parse_start(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("Invalid start time: {}", raw))?
        .with_timezone(&Utc))
}

fn run_backtest(
    config: EngineConfig,
    data: Option<PathBuf>,
    bars: usize,
    seed: u64,
    trades_csv: Option<PathBuf>,
) -> Result<()> {
    let bars = load_or_generate(data, bars, seed, &config.interval)?;
    info!("Backtesting {} bars", bars.len());

    let report = Backtester::new(config)?.run(&bars)?;
    backtest::print_report(&report);

    if let Some(path) = trades_csv {
        backtest::write_trades_csv(&path, &report.trades)?;
        info!("Wrote {} trades to {}", report.trades.len(), path.display());
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn run_sweep(
    config: EngineConfig,
    data: Option<PathBuf>,
    bars: usize,
    seed: u64,
    max_combinations: usize,
    grid_seed: u64,
    options: SweepOptions,
    output: PathBuf,
    results_csv: Option<PathBuf>,
    top: usize,
) -> Result<()> {
    let bars = load_or_generate(data, bars, seed, &config.interval)?;

    let mut combinations = SweepGrid::default().combinations();
    if max_combinations > 0 {
        combinations = sweep::sample_combinations(combinations, max_combinations, grid_seed);
    }

    let results = sweep::run_sweep(&bars, &config, &combinations, &options);
    sweep::print_summary(&results, top);

    if let Some(path) = results_csv {
        sweep::write_results_csv(&path, &results)?;
        info!("Wrote {} results to {}", results.len(), path.display());
    }

    let best = results.first().context("No valid parameter combinations")?;
    BestParams::from_result(best).save(&output)?;
    info!("Best params (score {:.1}) saved to {}", best.score, output.display());
    Ok(())
}

fn run_sample(output: PathBuf, bars: usize, seed: u64, start: &str, interval: &str) -> Result<()> {
    let start = parse_start(start)?;
    let step = interval_duration(interval)
        .with_context(|| format!("Unsupported interval: {}", interval))?;
    let generated = sample::generate_bars(bars, seed, start, step);
    csv_file::write_bars(&output, &generated)?;
    info!("Wrote {} bars to {}", generated.len(), output.display());
    Ok(())
}
