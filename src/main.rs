//! kline-sim - Main Entry Point
//!
//! Fetches historical candles, runs backtests and reports stored runs.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use kline_sim::backtest::{
    BacktestResult, BacktestRunner, BinanceKlineClient, CandleSource, CsvCandleLoader,
    CsvCandleWriter, SeriesSpec,
};
use kline_sim::config::Config;
use kline_sim::market::base_asset;
use kline_sim::persistence::RunStore;
use kline_sim::strategy::{SmaCross, SmaCrossMode};
use rust_decimal_macros::dec;
use std::path::{Path, PathBuf};
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Candle-replay backtesting CLI
#[derive(Parser)]
#[command(name = "kline-sim")]
#[command(version, about = "Deterministic candle-replay backtesting for spot and futures strategies")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download klines from Binance into the CSV cache
    Fetch {
        /// Series as INSTRUMENT:interval, e.g. BTCUSDT:1h (repeatable)
        #[arg(short = 'S', long = "series", required = true)]
        series: Vec<SeriesSpec>,

        /// Start date (YYYY-MM-DD)
        #[arg(short, long)]
        start: String,

        /// End date (YYYY-MM-DD)
        #[arg(short, long)]
        end: String,

        /// Cache directory (defaults to data.cache_dir)
        #[arg(long)]
        cache_dir: Option<PathBuf>,
    },

    /// Run the moving-average crossover strategy over historical candles
    Backtest {
        /// Series as INSTRUMENT:interval; the first one is traded (repeatable)
        #[arg(short = 'S', long = "series", required = true)]
        series: Vec<SeriesSpec>,

        /// Start date (YYYY-MM-DD)
        #[arg(short, long)]
        start: String,

        /// End date (YYYY-MM-DD)
        #[arg(short, long)]
        end: String,

        /// Where candles come from
        #[arg(long, value_enum, default_value = "cache")]
        source: DataSource,

        /// Fast moving-average length
        #[arg(long, default_value = "10")]
        fast: usize,

        /// Slow moving-average length
        #[arg(long, default_value = "30")]
        slow: usize,

        /// Trade futures at this leverage instead of spot
        #[arg(long)]
        leverage: Option<u8>,

        /// Output directory for CSV results
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Do not store the run in the database
        #[arg(long)]
        no_save: bool,
    },

    /// Show stored backtest runs
    Report {
        /// Path to SQLite database (defaults to backtest.db_path)
        #[arg(short, long)]
        db: Option<PathBuf>,

        /// Show one run in detail
        #[arg(short, long)]
        run: Option<i64>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DataSource {
    /// CSV files under data.cache_dir
    Cache,
    /// Binance public klines endpoint
    Binance,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging()?;

    let config = Config::load()?;
    config.validate()?;

    match cli.command {
        Commands::Fetch {
            series,
            start,
            end,
            cache_dir,
        } => run_fetch(&config, &series, &start, &end, cache_dir).await,
        Commands::Backtest {
            series,
            start,
            end,
            source,
            fast,
            slow,
            leverage,
            output,
            no_save,
        } => {
            let (start, end) = parse_range(&start, &end)?;
            log_config(&config);

            let mode = match leverage {
                Some(leverage) => SmaCrossMode::Futures { leverage },
                None => SmaCrossMode::Spot,
            };
            let request = BacktestRequest {
                series,
                start,
                end,
                fast,
                slow,
                mode,
            };

            let result = match source {
                DataSource::Cache => {
                    let loader = CsvCandleLoader::new(&config.data.cache_dir);
                    run_backtest(loader, &config, &request).await?
                }
                DataSource::Binance => {
                    let client = BinanceKlineClient::new(&config.data)?;
                    run_backtest(client, &config, &request).await?
                }
            };

            println!("\n{}", result.summary());

            if let Some(dir) = output {
                write_outputs(&result, &dir)?;
            }
            if !no_save {
                let store = open_store(&config.backtest.db_path)?;
                let run_id = store.save_run(&result)?;
                info!(run_id, db = %config.backtest.db_path.display(), "Run stored");
            }
            Ok(())
        }
        Commands::Report { db, run } => {
            let db = db.unwrap_or_else(|| config.backtest.db_path.clone());
            show_report(&db, run)
        }
    }
}

/// Initialize logging with file output.
fn init_logging() -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    // Create logs directory
    std::fs::create_dir_all("logs")?;

    // File appender for detailed logs
    let file_appender = tracing_appender::rolling::hourly("logs", "kline-sim.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    // Leak the guard to keep it alive for the program duration
    Box::leak(Box::new(guard));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("kline_sim=debug".parse()?)
                .add_directive(Level::INFO.into()),
        )
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .init();

    Ok(())
}

/// Log configuration on startup.
fn log_config(config: &Config) {
    info!("📋 Configuration:");
    info!("   Quote Asset: {}", config.simulation.quote_asset);
    info!("   Initial Balance: {}", config.backtest.initial_quote_balance);
    info!("   Warm-up Fraction: {}", config.backtest.train_fraction);
    info!("   Memory Length: {}", config.simulation.memory_length);
    info!("   Min Notional: {}", config.simulation.min_notional);
    info!("   Fee Rate: {}", config.simulation.fee_rate);
    info!("   Limit Fills: {:?}", config.simulation.limit_fill_policy);
}

/// Parse an inclusive YYYY-MM-DD date range.
fn parse_range(start: &str, end: &str) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
    let start_date = NaiveDate::parse_from_str(start, "%Y-%m-%d")
        .map_err(|e| anyhow::anyhow!("Invalid start date '{}': {}", start, e))?;
    let end_date = NaiveDate::parse_from_str(end, "%Y-%m-%d")
        .map_err(|e| anyhow::anyhow!("Invalid end date '{}': {}", end, e))?;
    anyhow::ensure!(start_date <= end_date, "Start date {} is after end date {}", start, end);

    let start = start_date.and_time(NaiveTime::MIN).and_utc();
    let end = end_date
        .succ_opt()
        .context("End date out of range")?
        .and_time(NaiveTime::MIN)
        .and_utc();
    Ok((start, end))
}

/// Download every series and write it to the CSV cache.
async fn run_fetch(
    config: &Config,
    series: &[SeriesSpec],
    start: &str,
    end: &str,
    cache_dir: Option<PathBuf>,
) -> Result<()> {
    let (start, end) = parse_range(start, end)?;
    let cache_dir = cache_dir.unwrap_or_else(|| config.data.cache_dir.clone());
    let client = BinanceKlineClient::new(&config.data)?;
    let writer = CsvCandleWriter::new(&cache_dir);

    info!(
        series = series.len(),
        %start,
        %end,
        cache = %cache_dir.display(),
        "📥 Fetching klines"
    );

    for spec in series {
        let candles = client
            .fetch_candles(&spec.instrument, spec.interval, start, end)
            .await
            .with_context(|| format!("Failed to fetch {}", spec))?;
        if candles.is_empty() {
            warn!(series = %spec, "No klines returned");
            continue;
        }
        let path = writer.write_series(&spec.instrument, spec.interval, &candles)?;
        println!("{:<16} {:>7} candles -> {}", spec.to_string(), candles.len(), path.display());
    }

    Ok(())
}

struct BacktestRequest {
    series: Vec<SeriesSpec>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    fast: usize,
    slow: usize,
    mode: SmaCrossMode,
}

/// Run the crossover strategy on the first requested series.
async fn run_backtest<D: CandleSource>(
    source: D,
    config: &Config,
    request: &BacktestRequest,
) -> Result<BacktestResult> {
    info!("╔════════════════════════════════════════════════════════════╗");
    info!("║              BACKTEST MODE                                 ║");
    info!("╚════════════════════════════════════════════════════════════╝");

    let traded = request.series.first().context("At least one series is required")?;
    let quote = &config.simulation.quote_asset;
    let base = base_asset(&traded.instrument, quote);
    anyhow::ensure!(
        base != traded.instrument,
        "{} is not quoted in {}",
        traded.instrument,
        quote
    );

    let mut strategy = SmaCross::new(
        base,
        quote,
        traded.interval,
        request.fast,
        request.slow,
        request.mode,
    );

    info!("📈 Trading {} on {} ({:?})", traded.instrument, traded.interval, request.mode);
    info!("📅 Period: {} to {}", request.start, request.end);

    let runner = BacktestRunner::new(source, config.clone());
    runner
        .run(&mut strategy, &request.series, request.start, request.end)
        .await
}

/// Write the equity curve and the order books as CSV.
fn write_outputs(result: &BacktestResult, dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;

    let equity_path = dir.join("equity_curve.csv");
    result.equity_to_csv(&equity_path)?;
    info!("📁 Equity curve saved to: {}", equity_path.display());

    let fills_path = dir.join("fills.csv");
    result.fills_to_csv(&fills_path)?;
    info!("📁 Fills saved to: {}", fills_path.display());

    Ok(())
}

fn open_store(db_path: &Path) -> Result<RunStore> {
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    RunStore::new(db_path)
}

/// Print stored runs, or one run in detail.
fn show_report(db_path: &Path, run: Option<i64>) -> Result<()> {
    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║              BACKTEST RUNS                                 ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    if !db_path.exists() {
        println!("\n❌ Database not found: {}", db_path.display());
        println!("   No backtest has been stored yet, or the database path is incorrect.");
        return Ok(());
    }

    let store = RunStore::new(db_path)?;

    let Some(run_id) = run else {
        let runs = store.list_runs()?;
        if runs.is_empty() {
            println!("\n❌ No runs stored.");
            return Ok(());
        }
        println!(
            "\n{:>5}  {:<12} {:<17} {:<17} {:>9} {:>9} {:>8} {:>6} {:>5}",
            "ID", "STRATEGY", "START", "END", "RETURN%", "B&H%", "MDD%", "FILLS", "LIQ"
        );
        for r in &runs {
            println!(
                "{:>5}  {:<12} {:<17} {:<17} {:>9.2} {:>9.2} {:>8.2} {:>6} {:>5}",
                r.id,
                r.strategy,
                r.start_time.format("%Y-%m-%d %H:%M"),
                r.end_time.format("%Y-%m-%d %H:%M"),
                r.total_return_pct,
                r.benchmark_return_pct,
                r.max_drawdown * dec!(100),
                r.fills,
                r.liquidations,
            );
        }
        println!();
        return Ok(());
    };

    let Some(summary) = store.get_run(run_id)? else {
        println!("\n❌ Run {} not found.", run_id);
        return Ok(());
    };

    println!("\n📊 Run {} ({})", summary.id, summary.strategy);
    println!(
        "   ├─ Period:        {} to {}",
        summary.start_time.format("%Y-%m-%d %H:%M"),
        summary.end_time.format("%Y-%m-%d %H:%M")
    );
    println!("   ├─ Return:        {:+.2}%", summary.total_return_pct);
    println!("   ├─ Buy & Hold:    {:+.2}%", summary.benchmark_return_pct);
    println!("   ├─ Sharpe:        {:.3}", summary.sharpe_ratio);
    println!("   └─ Stored:        {}", summary.created_at.format("%Y-%m-%d %H:%M:%S UTC"));

    let fills = store.load_fills(run_id)?;
    if !fills.is_empty() {
        println!("\n🧾 Fills ({})", fills.len());
        for fill in fills.iter().take(20) {
            println!(
                "   ├─ {} {:<10} {:<10} {} @ {}",
                fill.time.format("%Y-%m-%d %H:%M"),
                fill.instrument,
                fill.side,
                fill.filled,
                fill.price
            );
        }
        if fills.len() > 20 {
            println!("   └─ ... {} more", fills.len() - 20);
        }
    }

    let equity = store.load_equity(run_id)?;
    if let (Some(first), Some(last)) = (equity.first(), equity.last()) {
        println!("\n📉 Equity");
        println!("   ├─ {}: {:.2}", first.0.format("%Y-%m-%d %H:%M"), first.1);
        println!("   └─ {}: {:.2}", last.0.format("%Y-%m-%d %H:%M"), last.1);
    }

    println!();
    Ok(())
}
