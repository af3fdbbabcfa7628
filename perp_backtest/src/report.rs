/// report.rs — Run artifacts
///
/// Writes everything a finished run leaves behind under the project
/// directory: the closed-trade list as CSV, the configuration snapshot as
/// JSON, and the performance summary to the log.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::info;

use perp_engine::engine::Engine;
use perp_engine::metrics::{compute_metrics, PerfReport};
use perp_engine::timeutil::MS_DAY;

/// Create the run's artifact directory: `<project>/runs/<utc timestamp>/`.
pub fn create_run_directory(project_directory: &str) -> Result<PathBuf> {
    let stamp = Utc::now().format("%Y%m%d_%H%M%S");
    let path = Path::new(project_directory).join("runs").join(stamp.to_string());
    fs::create_dir_all(&path).with_context(|| format!("creating {}", path.display()))?;
    Ok(path)
}

/// Trade list CSV, one row per exit fill.
pub fn save_trade_list(engine: &Engine, run_dir: &Path) -> Result<PathBuf> {
    let path = run_dir.join("trade_list.csv");
    let mut writer = csv::Writer::from_path(&path)?;
    for trade in engine.trades().trades() {
        writer.serialize(trade)?;
    }
    writer.flush()?;
    info!(trades = engine.trades().len(), path = %path.display(), "trade list saved");
    Ok(path)
}

/// Exact configuration the run executed with.
pub fn save_config_snapshot(engine: &Engine, run_dir: &Path) -> Result<PathBuf> {
    let path = run_dir.join("config.json");
    let json = serde_json::to_string_pretty(engine.config())?;
    fs::write(&path, json).with_context(|| format!("writing {}", path.display()))?;
    info!(path = %path.display(), "config snapshot saved");
    Ok(path)
}

/// One CSV per indicator and symbol, aligned with the owning stream's bars.
pub fn save_indicator_series(engine: &Engine, run_dir: &Path) -> Result<()> {
    if engine.indicators().is_empty() {
        return Ok(());
    }
    let dir = run_dir.join("indicators");
    fs::create_dir_all(&dir)?;

    for series in engine.indicators().series() {
        for (symbol_idx, values) in series.values.iter().enumerate() {
            let symbol = &engine.symbols()[symbol_idx].name;
            let path = dir.join(format!("{}_{symbol}.csv", series.name));
            let mut writer = csv::Writer::from_path(&path)?;
            writer.write_record([series.name.as_str()])?;
            for value in values {
                writer.write_record([value.to_string()])?;
            }
            writer.flush()?;
        }
    }
    info!(indicators = engine.indicators().series().len(), "indicator series saved");
    Ok(())
}

/// Compute the performance report, annualised from the simulated span.
pub fn performance_report(engine: &Engine) -> PerfReport {
    let span_ms = (engine.end_close_time() - engine.begin_open_time()).max(1);
    let span_days = span_ms as f64 / MS_DAY as f64;
    let trades_per_year = if span_days > 0.0 {
        engine.trades().len() as f64 * 365.0 / span_days
    } else {
        0.0
    };

    compute_metrics(
        engine.trades().trades(),
        engine.equity_curve(),
        engine.ledger().initial_balance(),
        engine.ledger().wallet_balance(),
        trades_per_year,
    )
}
