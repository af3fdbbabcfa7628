/// bars.rs — Immutable bar storage and per-symbol cursors
///
/// Four parallel stream kinds feed one backtest:
///
///   Trading    — the strategy's own timeframe; drives the tick loop
///   Magnifier  — finer bars for intra-bar fills (optional)
///   Reference  — coarser bars feeding indicators (zero or more timeframes)
///   MarkPrice  — the stream liquidation checks run against
///
/// Bars are loaded once and never mutated; the only mutable state here is
/// one forward-only cursor per (stream, symbol). Cursors advance by close
/// time and never move backwards, which is what keeps the data-gap handling
/// in the scheduler deterministic.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// One OHLCV bar. `close_time == open_time + timeframe − 1`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub close_time: i64,
}

/// Which of the parallel bar streams is addressed.
/// `Reference(i)` indexes the store's reference list (sorted by timeframe).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Trading,
    Magnifier,
    Reference(usize),
    MarkPrice,
}

impl StreamKind {
    pub fn label(&self) -> &'static str {
        match self {
            StreamKind::Trading => "trading",
            StreamKind::Magnifier => "magnifier",
            StreamKind::Reference(_) => "reference",
            StreamKind::MarkPrice => "mark price",
        }
    }
}

/// All symbols of one stream: a bar vector and a cursor per symbol.
#[derive(Debug, Clone)]
pub struct BarSeries {
    pub timeframe_ms: i64,
    bars: Vec<Vec<Bar>>,
    cursors: Vec<usize>,
}

impl BarSeries {
    pub fn new(timeframe_ms: i64, bars: Vec<Vec<Bar>>) -> Self {
        let cursors = vec![0; bars.len()];
        Self {
            timeframe_ms,
            bars,
            cursors,
        }
    }

    pub fn num_symbols(&self) -> usize {
        self.bars.len()
    }

    pub fn num_bars(&self, symbol_idx: usize) -> usize {
        self.bars[symbol_idx].len()
    }

    pub fn get(&self, symbol_idx: usize, bar_idx: usize) -> Result<&Bar> {
        self.bars[symbol_idx].get(bar_idx).ok_or_else(|| {
            EngineError::IndexOutOfRange(format!(
                "bar index {bar_idx} >= {} for symbol index {symbol_idx}",
                self.bars[symbol_idx].len()
            ))
        })
    }

    pub fn cursor(&self, symbol_idx: usize) -> usize {
        self.cursors[symbol_idx]
    }

    pub fn set_cursor(&mut self, symbol_idx: usize, bar_idx: usize) {
        self.cursors[symbol_idx] = bar_idx;
    }

    /// Unconditional cursor step; may leave the cursor at `num_bars`
    /// (one past the end), which the scheduler reads as end-of-data.
    pub fn increase_cursor(&mut self, symbol_idx: usize) {
        self.cursors[symbol_idx] += 1;
    }

    /// Move the cursor forward while the bar under it closes before
    /// `target_close_time`; stop at the first bar with
    /// `close_time >= target` or at the last bar. Never moves backward.
    /// Returns the post-move index; the caller compares the bar's
    /// `close_time` against the target to detect gaps or exhaustion.
    pub fn advance(&mut self, symbol_idx: usize, target_close_time: i64) -> usize {
        let bars = &self.bars[symbol_idx];
        let cursor = &mut self.cursors[symbol_idx];
        while *cursor + 1 < bars.len() && bars[*cursor].close_time < target_close_time {
            *cursor += 1;
        }
        *cursor
    }
}

/// The full bar universe of one run.
#[derive(Debug, Clone)]
pub struct BarStore {
    symbols: Vec<String>,
    trading: BarSeries,
    magnifier: Option<BarSeries>,
    mark_price: BarSeries,
    /// Sorted ascending by timeframe.
    references: Vec<BarSeries>,
}

impl BarStore {
    pub fn new(
        symbols: Vec<String>,
        trading: BarSeries,
        magnifier: Option<BarSeries>,
        mut references: Vec<BarSeries>,
        mark_price: BarSeries,
    ) -> Self {
        references.sort_by_key(|series| series.timeframe_ms);
        Self {
            symbols,
            trading,
            magnifier,
            mark_price,
            references,
        }
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    pub fn num_symbols(&self) -> usize {
        self.symbols.len()
    }

    pub fn num_references(&self) -> usize {
        self.references.len()
    }

    pub fn has_magnifier(&self) -> bool {
        self.magnifier.is_some()
    }

    pub fn series(&self, stream: StreamKind) -> &BarSeries {
        match stream {
            StreamKind::Trading => &self.trading,
            StreamKind::Magnifier => self
                .magnifier
                .as_ref()
                .expect("magnifier stream addressed but not loaded"),
            StreamKind::Reference(idx) => &self.references[idx],
            StreamKind::MarkPrice => &self.mark_price,
        }
    }

    pub fn series_mut(&mut self, stream: StreamKind) -> &mut BarSeries {
        match stream {
            StreamKind::Trading => &mut self.trading,
            StreamKind::Magnifier => self
                .magnifier
                .as_mut()
                .expect("magnifier stream addressed but not loaded"),
            StreamKind::Reference(idx) => &mut self.references[idx],
            StreamKind::MarkPrice => &mut self.mark_price,
        }
    }

    pub fn timeframe_ms(&self, stream: StreamKind) -> i64 {
        self.series(stream).timeframe_ms
    }

    pub fn get(&self, stream: StreamKind, symbol_idx: usize, bar_idx: usize) -> Result<&Bar> {
        self.series(stream).get(symbol_idx, bar_idx)
    }

    pub fn num_bars(&self, stream: StreamKind, symbol_idx: usize) -> usize {
        self.series(stream).num_bars(symbol_idx)
    }

    pub fn cursor(&self, stream: StreamKind, symbol_idx: usize) -> usize {
        self.series(stream).cursor(symbol_idx)
    }

    /// Bar currently under the cursor.
    pub fn current(&self, stream: StreamKind, symbol_idx: usize) -> Result<&Bar> {
        let series = self.series(stream);
        series.get(symbol_idx, series.cursor(symbol_idx))
    }

    pub fn advance(
        &mut self,
        stream: StreamKind,
        symbol_idx: usize,
        target_close_time: i64,
    ) -> usize {
        self.series_mut(stream).advance(symbol_idx, target_close_time)
    }

    pub fn advance_all(&mut self, stream: StreamKind, target_close_time: i64) {
        let series = self.series_mut(stream);
        for symbol_idx in 0..series.num_symbols() {
            series.advance(symbol_idx, target_close_time);
        }
    }
}

#[cfg(test)]
pub(crate) fn bar(open_time: i64, o: f64, h: f64, l: f64, c: f64, tf: i64) -> Bar {
    Bar {
        open_time,
        open: o,
        high: h,
        low: l,
        close: c,
        volume: 1.0,
        close_time: open_time + tf - 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeutil::MS_MINUTE;

    fn series() -> BarSeries {
        let bars = (0..5)
            .map(|i| bar(i * MS_MINUTE, 100.0, 101.0, 99.0, 100.5, MS_MINUTE))
            .collect();
        BarSeries::new(MS_MINUTE, vec![bars])
    }

    #[test]
    fn advance_stops_at_target_close_time() {
        let mut s = series();
        let idx = s.advance(0, 3 * MS_MINUTE - 1);
        assert_eq!(idx, 2);
        assert_eq!(s.get(0, idx).unwrap().close_time, 3 * MS_MINUTE - 1);
    }

    #[test]
    fn advance_never_moves_backward() {
        let mut s = series();
        s.advance(0, 4 * MS_MINUTE - 1);
        let idx = s.advance(0, MS_MINUTE - 1);
        assert_eq!(idx, 3);
    }

    #[test]
    fn advance_clamps_to_last_bar() {
        let mut s = series();
        let idx = s.advance(0, i64::MAX - 1);
        assert_eq!(idx, 4);
        // The caller detects exhaustion by comparing close_time.
        assert!(s.get(0, idx).unwrap().close_time < i64::MAX - 1);
    }

    #[test]
    fn gap_detected_by_close_time_mismatch() {
        // Bars at minute 0, 1, 3 (minute 2 missing).
        let bars = vec![
            bar(0, 1.0, 1.0, 1.0, 1.0, MS_MINUTE),
            bar(MS_MINUTE, 1.0, 1.0, 1.0, 1.0, MS_MINUTE),
            bar(3 * MS_MINUTE, 1.0, 1.0, 1.0, 1.0, MS_MINUTE),
        ];
        let mut s = BarSeries::new(MS_MINUTE, vec![bars]);
        let idx = s.advance(0, 3 * MS_MINUTE - 1);
        // Cursor sits on the bar that closes after the target.
        assert_eq!(idx, 2);
        assert_ne!(s.get(0, idx).unwrap().close_time, 3 * MS_MINUTE - 1);
    }

    #[test]
    fn out_of_range_read_errors() {
        let s = series();
        assert!(s.get(0, 5).is_err());
    }
}
