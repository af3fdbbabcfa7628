/// main.rs — Backtest runner
///
/// Wires the engine to the filesystem: .env-driven configuration, bar files
/// per stream, Binance metadata JSON, one bundled strategy, and the run
/// artifacts. Expected data layout under DATA_DIR:
///
///   trading/<SYMBOL>.(csv|parquet)        — trading stream
///   magnifier/<SYMBOL>.(csv|parquet)      — optional finer stream
///   mark_price/<SYMBOL>.(csv|parquet)     — liquidation-check stream
///   reference_<tf>/<SYMBOL>.(csv|parquet) — zero or more indicator streams
///   exchange_info.json, leverage_brackets.json, funding/<SYMBOL>.json

mod data;
mod exchange;
mod report;
mod strategies;

use std::env;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use perp_engine::bars::{BarSeries, BarStore};
use perp_engine::config::BacktestConfig;
use perp_engine::engine::{Engine, RunStatus};
use perp_engine::indicator::IndicatorSet;
use perp_engine::slippage::Slippage;
use perp_engine::timeutil::parse_timeframe;

use strategies::SmaCross;

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let data_dir = PathBuf::from(env::var("DATA_DIR").unwrap_or_else(|_| "./data".to_string()));
    let symbols: Vec<String> = env::var("SYMBOLS")
        .unwrap_or_else(|_| "BTCUSDT".to_string())
        .split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect();
    if symbols.is_empty() {
        return Err(anyhow!("SYMBOLS resolved to an empty list"));
    }

    let config = config_from_env()?;
    info!(symbols = ?symbols, magnifier = config.use_bar_magnifier, "configuration loaded");

    // ── Bar streams ───────────────────────────────────────────────────
    let trading_tf = parse_timeframe(&env::var("TRADING_TIMEFRAME").unwrap_or_else(|_| "1h".into()))
        .map_err(|error| anyhow!("TRADING_TIMEFRAME: {error}"))?;
    let trading = load_stream(&data_dir.join("trading"), &symbols, trading_tf)?;

    let magnifier = if config.use_bar_magnifier {
        let magnifier_tf =
            parse_timeframe(&env::var("MAGNIFIER_TIMEFRAME").unwrap_or_else(|_| "1m".into()))
                .map_err(|error| anyhow!("MAGNIFIER_TIMEFRAME: {error}"))?;
        Some(load_stream(
            &data_dir.join("magnifier"),
            &symbols,
            magnifier_tf,
        )?)
    } else {
        None
    };

    let mark_tf = magnifier
        .as_ref()
        .map(|series| series.timeframe_ms)
        .unwrap_or(trading_tf);
    let mark_price = load_stream(&data_dir.join("mark_price"), &symbols, mark_tf)?;

    let references = load_reference_streams(&data_dir, &symbols)?;

    let store = BarStore::new(
        symbols.clone(),
        trading,
        magnifier,
        references,
        mark_price,
    );

    // ── Symbol metadata ───────────────────────────────────────────────
    let specs = exchange::load_symbol_specs(
        &data_dir.join("exchange_info.json"),
        &data_dir.join("leverage_brackets.json"),
        &data_dir.join("funding"),
        &symbols,
    )?;

    // ── Strategy ──────────────────────────────────────────────────────
    let strategy = SmaCross::new(
        parse_env("SMA_FAST", 10usize)?,
        parse_env("SMA_SLOW", 20usize)?,
        parse_env("SMA_TRAIL_FRACTION", 0.02f64)?,
        parse_env("SMA_ORDER_SIZE", 0.01f64)?,
    );

    // ── Run ───────────────────────────────────────────────────────────
    let project_directory = config.project_directory.clone();
    let mut engine = Engine::new(
        config,
        store,
        specs,
        IndicatorSet::new(),
        Box::new(strategy),
    );

    let status = engine.run().map_err(|error| anyhow!("backtest failed: {error}"))?;
    if status == RunStatus::Bankrupt {
        warn!("the account went bankrupt; reporting the trades up to that point");
    }

    // ── Artifacts ─────────────────────────────────────────────────────
    let run_dir = report::create_run_directory(&project_directory)?;
    report::save_trade_list(&engine, &run_dir)?;
    report::save_config_snapshot(&engine, &run_dir)?;
    report::save_indicator_series(&engine, &run_dir)?;

    let perf = report::performance_report(&engine);
    info!("\n{perf}");

    Ok(())
}

fn config_from_env() -> Result<BacktestConfig> {
    let slippage = match env::var("SLIPPAGE_MODEL")
        .unwrap_or_else(|_| "percentage".into())
        .to_lowercase()
        .as_str()
    {
        "percentage" => Slippage::percentage(
            parse_env("SLIPPAGE_TAKER_PCT", 0.0f64)?,
            parse_env("SLIPPAGE_MAKER_PCT", 0.0f64)?,
        ),
        "market_impact" => Slippage::market_impact(parse_env("STRESS_MULTIPLIER", 1.0f64)?),
        other => return Err(anyhow!("unknown SLIPPAGE_MODEL [{other}]")),
    };

    let mut config = BacktestConfig {
        project_directory: env::var("PROJECT_DIR").unwrap_or_else(|_| ".".to_string()),
        use_bar_magnifier: parse_env("USE_BAR_MAGNIFIER", false)?,
        initial_balance: parse_env("INITIAL_BALANCE", 10_000.0f64)?,
        taker_fee_percentage: parse_env("TAKER_FEE_PCT", 0.045f64)?,
        maker_fee_percentage: parse_env("MAKER_FEE_PCT", 0.018f64)?,
        slippage,
        ..BacktestConfig::default()
    };
    config.backtest_period.start = env::var("BACKTEST_START").ok();
    config.backtest_period.end = env::var("BACKTEST_END").ok();

    Ok(config)
}

/// Resolve `<dir>/<symbol>.(csv|parquet)` for every symbol and load them.
fn load_stream(dir: &Path, symbols: &[String], timeframe_ms: i64) -> Result<BarSeries> {
    let mut paths = Vec::with_capacity(symbols.len());
    for symbol in symbols {
        paths.push(find_bar_file(dir, symbol)?);
    }
    data::load_series(&paths, timeframe_ms)
        .with_context(|| format!("loading bar stream from {}", dir.display()))
}

fn find_bar_file(dir: &Path, symbol: &str) -> Result<PathBuf> {
    for extension in ["csv", "parquet"] {
        let candidate = dir.join(format!("{symbol}.{extension}"));
        if candidate.exists() {
            return Ok(candidate);
        }
    }
    Err(anyhow!(
        "no bar file for [{symbol}] under {} (tried .csv and .parquet)",
        dir.display()
    ))
}

/// Discover `reference_<tf>` directories and load each as one stream.
fn load_reference_streams(data_dir: &Path, symbols: &[String]) -> Result<Vec<BarSeries>> {
    let pattern = data_dir.join("reference_*");
    let mut directories: Vec<PathBuf> = glob::glob(&pattern.to_string_lossy())
        .context("globbing reference directories")?
        .filter_map(|entry| entry.ok())
        .filter(|path| path.is_dir())
        .collect();
    directories.sort();

    let mut streams = Vec::with_capacity(directories.len());
    for dir in directories {
        let name = dir
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default()
            .to_string();
        let timeframe = name
            .strip_prefix("reference_")
            .ok_or_else(|| anyhow!("bad reference directory name [{name}]"))?;
        let timeframe_ms = parse_timeframe(timeframe)
            .map_err(|error| anyhow!("reference directory [{name}]: {error}"))?;
        streams.push(load_stream(&dir, symbols, timeframe_ms)?);
    }
    Ok(streams)
}

fn parse_env<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr + Copy,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(value) => value
            .parse::<T>()
            .map_err(|error| anyhow!("config key {key}: {error}")),
        Err(_) => Ok(default),
    }
}
