/// data.rs — Bar file loading
///
/// Reads per-symbol OHLCV history from CSV or Parquet into the engine's
/// columnar `BarSeries`. Symbols decode in parallel (rayon); everything
/// after loading is single-threaded inside the engine.
///
/// Expected columns (CSV header or Parquet schema):
///   open_time, open, high, low, close, volume, close_time
/// with times in UTC milliseconds.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use polars::prelude::*;
use rayon::prelude::*;
use serde::Deserialize;
use tracing::info;

use perp_engine::bars::{Bar, BarSeries};
use perp_engine::timeutil::format_timeframe;

#[derive(Debug, Deserialize)]
struct CsvBar {
    open_time: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
    close_time: i64,
}

impl From<CsvBar> for Bar {
    fn from(row: CsvBar) -> Self {
        Bar {
            open_time: row.open_time,
            open: row.open,
            high: row.high,
            low: row.low,
            close: row.close,
            volume: row.volume,
            close_time: row.close_time,
        }
    }
}

/// Load one stream for every symbol, in symbol order.
pub fn load_series(paths: &[PathBuf], timeframe_ms: i64) -> Result<BarSeries> {
    let per_symbol: Vec<Result<Vec<Bar>>> = paths
        .par_iter()
        .map(|path| load_symbol_bars(path, timeframe_ms))
        .collect();

    let mut bars = Vec::with_capacity(per_symbol.len());
    for (path, loaded) in paths.iter().zip(per_symbol) {
        bars.push(loaded.with_context(|| format!("loading {}", path.display()))?);
    }

    info!(
        files = paths.len(),
        timeframe = %format_timeframe(timeframe_ms),
        bars = bars.iter().map(Vec::len).sum::<usize>(),
        "bar stream loaded"
    );
    Ok(BarSeries::new(timeframe_ms, bars))
}

/// Load a single symbol's bars, dispatching on the file extension.
pub fn load_symbol_bars(path: &Path, timeframe_ms: i64) -> Result<Vec<Bar>> {
    let bars = match path.extension().and_then(|ext| ext.to_str()) {
        Some("csv") => read_csv(path)?,
        Some("parquet") => read_parquet(path)?,
        other => bail!(
            "unsupported bar file extension {:?} for {}",
            other,
            path.display()
        ),
    };
    check_bars(&bars, timeframe_ms, path)?;
    Ok(bars)
}

fn read_csv(path: &Path) -> Result<Vec<Bar>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)?;

    let mut bars = Vec::new();
    for row in reader.deserialize::<CsvBar>() {
        bars.push(Bar::from(row?));
    }
    Ok(bars)
}

fn read_parquet(path: &Path) -> Result<Vec<Bar>> {
    let df = LazyFrame::scan_parquet(path, Default::default())?.collect()?;

    let open_times = df.column("open_time")?.i64()?;
    let opens = df.column("open")?.f64()?;
    let highs = df.column("high")?.f64()?;
    let lows = df.column("low")?.f64()?;
    let closes = df.column("close")?.f64()?;
    let volumes = df.column("volume")?.f64()?;
    let close_times = df.column("close_time")?.i64()?;

    let mut bars = Vec::with_capacity(df.height());
    for idx in 0..df.height() {
        let cell = |name: &str, value: Option<f64>| {
            value.ok_or_else(|| anyhow!("null {name} at row {idx} in {}", path.display()))
        };
        let time_cell = |name: &str, value: Option<i64>| {
            value.ok_or_else(|| anyhow!("null {name} at row {idx} in {}", path.display()))
        };

        bars.push(Bar {
            open_time: time_cell("open_time", open_times.get(idx))?,
            open: cell("open", opens.get(idx))?,
            high: cell("high", highs.get(idx))?,
            low: cell("low", lows.get(idx))?,
            close: cell("close", closes.get(idx))?,
            volume: cell("volume", volumes.get(idx))?,
            close_time: time_cell("close_time", close_times.get(idx))?,
        });
    }
    Ok(bars)
}

/// Structural checks the engine relies on: non-empty, strictly ascending
/// open times, and close times consistent with the declared timeframe.
/// Gaps between bars are allowed; the scheduler detects and skips them.
fn check_bars(bars: &[Bar], timeframe_ms: i64, path: &Path) -> Result<()> {
    if bars.is_empty() {
        bail!("{} contains no bars", path.display());
    }

    for (idx, bar) in bars.iter().enumerate() {
        if bar.close_time != bar.open_time + timeframe_ms - 1 {
            bail!(
                "{} row {idx}: close_time {} does not match open_time {} + {} − 1; \
                 is the file really {} data?",
                path.display(),
                bar.close_time,
                bar.open_time,
                timeframe_ms,
                format_timeframe(timeframe_ms)
            );
        }
    }

    for (idx, pair) in bars.windows(2).enumerate() {
        if pair[1].open_time <= pair[0].open_time {
            bail!(
                "{} rows {idx}-{}: open times are not strictly ascending",
                path.display(),
                idx + 1
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use perp_engine::timeutil::MS_MINUTE;

    fn write_csv(rows: &str) -> temppath::TempCsv {
        temppath::TempCsv::new(rows)
    }

    // Minimal self-cleaning temp file helper for the loader tests.
    mod temppath {
        use std::io::Write;
        use std::path::PathBuf;
        use std::sync::atomic::{AtomicUsize, Ordering};

        static COUNTER: AtomicUsize = AtomicUsize::new(0);

        pub struct TempCsv {
            pub path: PathBuf,
        }

        impl TempCsv {
            pub fn new(rows: &str) -> Self {
                let unique = COUNTER.fetch_add(1, Ordering::Relaxed);
                let mut path = std::env::temp_dir();
                path.push(format!(
                    "perp_backtest_test_{}_{unique}.csv",
                    std::process::id()
                ));
                let mut file = std::fs::File::create(&path).unwrap();
                write!(file, "{rows}").unwrap();
                Self { path }
            }
        }

        impl Drop for TempCsv {
            fn drop(&mut self) {
                let _ = std::fs::remove_file(&self.path);
            }
        }
    }

    #[test]
    fn csv_round_trip() {
        let tf = MS_MINUTE;
        let csv = format!(
            "open_time,open,high,low,close,volume,close_time\n\
             0,100.0,101.0,99.0,100.5,10.0,{}\n\
             {tf},100.5,102.0,100.0,101.5,12.0,{}\n",
            tf - 1,
            2 * tf - 1
        );
        let file = write_csv(&csv);
        let bars = load_symbol_bars(&file.path, tf).unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].open_time, 0);
        assert_eq!(bars[1].close, 101.5);
    }

    #[test]
    fn wrong_timeframe_is_rejected() {
        let tf = MS_MINUTE;
        let csv = format!(
            "open_time,open,high,low,close,volume,close_time\n\
             0,100.0,101.0,99.0,100.5,10.0,{}\n",
            tf - 1
        );
        let file = write_csv(&csv);
        // Declared as 5m but the file is 1m.
        assert!(load_symbol_bars(&file.path, 5 * tf).is_err());
    }

    #[test]
    fn unsorted_bars_are_rejected() {
        let tf = MS_MINUTE;
        let csv = format!(
            "open_time,open,high,low,close,volume,close_time\n\
             {tf},100.0,101.0,99.0,100.5,10.0,{}\n\
             0,100.0,101.0,99.0,100.5,10.0,{}\n",
            2 * tf - 1,
            tf - 1
        );
        let file = write_csv(&csv);
        assert!(load_symbol_bars(&file.path, tf).is_err());
    }
}
