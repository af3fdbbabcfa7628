/// strategy.rs — The strategy trait and its market context
///
/// Strategies are plain structs implementing three callbacks; every
/// interaction with the engine flows through the `MarketCtx` parameter, so
/// a strategy can never hold a stale reference into engine state.
///
/// Phase rules: during `on_close` the current (just-closed) bar is offset 0.
/// `after_entry`/`after_exit` run mid-bar, between fills, where offset 0
/// would leak prices that are not final yet, so reads there must use
/// offset >= 1; the context enforces this with a warning and NaN.
///
/// Order methods return `true` when the order was accepted (market orders:
/// filled). Parameter problems log a warning and return `false`; they never
/// unwind the run.

use tracing::warn;

use crate::bars::StreamKind;
use crate::error::{EngineError, Result};
use crate::fill::{ExecCtx, FULL_SIZE};
use crate::indicator::IndicatorSet;
use crate::order::{CancelKind, Direction};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyPhase {
    OnClose,
    AfterEntry,
    AfterExit,
}

/// User-supplied trading logic. `after_entry`/`after_exit` default to
/// no-ops; `initialize` runs once before the first tick.
pub trait Strategy {
    fn initialize(&mut self, _num_symbols: usize) {}

    /// Called at each trading bar close for every active symbol.
    fn on_close(&mut self, ctx: &mut MarketCtx<'_, '_>);

    /// Called after any entry fill, chained until quiescence.
    fn after_entry(&mut self, _ctx: &mut MarketCtx<'_, '_>) {}

    /// Called after any exit fill (liquidations included), chained until
    /// quiescence.
    fn after_exit(&mut self, _ctx: &mut MarketCtx<'_, '_>) {}
}

/// Everything a strategy may see and do during one callback.
pub struct MarketCtx<'a, 'b> {
    pub(crate) exec: &'a mut ExecCtx<'b>,
    pub(crate) indicators: &'a IndicatorSet,
    pub(crate) phase: StrategyPhase,
    pub(crate) symbol_idx: usize,
    /// Engine-fatal error raised inside a callback (bankruptcy during an
    /// immediate market fill); picked up by the scheduler afterwards.
    pub(crate) fatal: Option<EngineError>,
}

impl<'a, 'b> MarketCtx<'a, 'b> {
    pub(crate) fn new(
        exec: &'a mut ExecCtx<'b>,
        indicators: &'a IndicatorSet,
        phase: StrategyPhase,
        symbol_idx: usize,
    ) -> Self {
        Self {
            exec,
            indicators,
            phase,
            symbol_idx,
            fatal: None,
        }
    }

    // ── Identity and clock ────────────────────────────────────────────

    pub fn phase(&self) -> StrategyPhase {
        self.phase
    }

    pub fn symbol_index(&self) -> usize {
        self.symbol_idx
    }

    pub fn symbol_name(&self) -> &str {
        &self.exec.specs[self.symbol_idx].name
    }

    pub fn num_symbols(&self) -> usize {
        self.exec.specs.len()
    }

    pub fn current_open_time(&self) -> i64 {
        self.exec.current_open_time
    }

    pub fn current_close_time(&self) -> i64 {
        self.exec.current_close_time
    }

    // ── Price and indicator series ────────────────────────────────────

    pub fn open(&self, offset: usize) -> f64 {
        self.price_at(offset, |bar| bar.open)
    }

    pub fn high(&self, offset: usize) -> f64 {
        self.price_at(offset, |bar| bar.high)
    }

    pub fn low(&self, offset: usize) -> f64 {
        self.price_at(offset, |bar| bar.low)
    }

    pub fn close(&self, offset: usize) -> f64 {
        self.price_at(offset, |bar| bar.close)
    }

    pub fn volume(&self, offset: usize) -> f64 {
        self.price_at(offset, |bar| bar.volume)
    }

    /// Precomputed indicator value `offset` bars back on its own timeframe.
    pub fn indicator(&self, name: &str, offset: usize) -> f64 {
        if !self.offset_allowed(offset) {
            return f64::NAN;
        }
        match self
            .indicators
            .value(name, self.symbol_idx, offset, self.exec.bars)
        {
            Ok(value) => value,
            Err(error) => {
                warn!(%error, "indicator read refused");
                f64::NAN
            }
        }
    }

    fn price_at(&self, offset: usize, select: impl Fn(&crate::bars::Bar) -> f64) -> f64 {
        if !self.offset_allowed(offset) {
            return f64::NAN;
        }
        let cursor = self.exec.bars.cursor(StreamKind::Trading, self.symbol_idx);
        if offset > cursor {
            warn!(
                offset,
                cursor, "price read refused: offset reaches before the first bar"
            );
            return f64::NAN;
        }
        match self
            .exec
            .bars
            .get(StreamKind::Trading, self.symbol_idx, cursor - offset)
        {
            Ok(bar) => select(bar),
            Err(error) => {
                warn!(%error, "price read refused");
                f64::NAN
            }
        }
    }

    /// Offset 0 is only final at bar close; after-phases must look back.
    fn offset_allowed(&self, offset: usize) -> bool {
        if offset == 0 && self.phase != StrategyPhase::OnClose {
            warn!(
                phase = ?self.phase,
                "offset 0 is only readable at on_close; use an offset >= 1"
            );
            return false;
        }
        true
    }

    // ── Account and position queries ──────────────────────────────────

    pub fn wallet_balance(&self) -> f64 {
        self.exec.ledger.wallet_balance()
    }

    pub fn available_balance(&self) -> f64 {
        self.exec.ledger.available_balance()
    }

    pub fn max_drawdown(&self) -> f64 {
        self.exec.ledger.max_drawdown()
    }

    /// Net position of the current symbol (long positive, short negative).
    pub fn position_size(&self) -> f64 {
        self.exec.book.position_size(self.symbol_idx)
    }

    pub fn leverage(&self) -> u32 {
        self.exec.book.leverage[self.symbol_idx]
    }

    pub fn has_filled_entry(&self, entry_name: &str) -> bool {
        self.exec.book.has_filled_entry(self.symbol_idx, entry_name)
    }

    pub fn last_entry_price(&self) -> f64 {
        self.exec.book.last_entry_price[self.symbol_idx]
    }

    pub fn last_exit_price(&self) -> f64 {
        self.exec.book.last_exit_price[self.symbol_idx]
    }

    /// Trading bars since the last entry fill; NaN before the first entry.
    pub fn bars_since_entry(&self) -> f64 {
        self.bars_since(self.exec.book.last_entry_bar_index[self.symbol_idx])
    }

    /// Trading bars since the last exit fill; NaN before the first exit.
    pub fn bars_since_exit(&self) -> f64 {
        self.bars_since(self.exec.book.last_exit_bar_index[self.symbol_idx])
    }

    fn bars_since(&self, event_bar_idx: usize) -> f64 {
        if event_bar_idx == usize::MAX {
            return f64::NAN;
        }
        let cursor = self.exec.bars.cursor(StreamKind::Trading, self.symbol_idx);
        cursor.saturating_sub(event_bar_idx) as f64
    }

    /// Sentinel order size meaning "everything still open".
    pub fn full_size(&self) -> f64 {
        FULL_SIZE
    }

    // ── Order API ─────────────────────────────────────────────────────

    pub fn market_entry(&mut self, entry_name: &str, direction: Direction, size: f64) -> bool {
        let symbol_idx = self.symbol_idx;
        let result = self
            .exec
            .place_market_entry(symbol_idx, entry_name, direction, size);
        self.guard(result)
    }

    pub fn limit_entry(
        &mut self,
        entry_name: &str,
        direction: Direction,
        order_price: f64,
        size: f64,
    ) -> bool {
        let symbol_idx = self.symbol_idx;
        let result =
            self.exec
                .place_limit_entry(symbol_idx, entry_name, direction, order_price, size);
        self.guard(result)
    }

    pub fn mit_entry(
        &mut self,
        entry_name: &str,
        direction: Direction,
        touch_price: f64,
        size: f64,
    ) -> bool {
        let symbol_idx = self.symbol_idx;
        let result = self
            .exec
            .place_mit_entry(symbol_idx, entry_name, direction, touch_price, size);
        self.guard(result)
    }

    pub fn lit_entry(
        &mut self,
        entry_name: &str,
        direction: Direction,
        touch_price: f64,
        order_price: f64,
        size: f64,
    ) -> bool {
        let symbol_idx = self.symbol_idx;
        let result = self.exec.place_lit_entry(
            symbol_idx,
            entry_name,
            direction,
            touch_price,
            order_price,
            size,
        );
        self.guard(result)
    }

    pub fn trailing_entry(
        &mut self,
        entry_name: &str,
        direction: Direction,
        touch_price: f64,
        trail_point: f64,
        size: f64,
    ) -> bool {
        let symbol_idx = self.symbol_idx;
        let result = self.exec.place_trailing_entry(
            symbol_idx,
            entry_name,
            direction,
            touch_price,
            trail_point,
            size,
        );
        self.guard(result)
    }

    pub fn market_exit(&mut self, exit_name: &str, target_entry: &str, size: f64) -> bool {
        let symbol_idx = self.symbol_idx;
        let result = self
            .exec
            .place_market_exit(symbol_idx, exit_name, target_entry, size);
        self.guard(result)
    }

    pub fn limit_exit(
        &mut self,
        exit_name: &str,
        target_entry: &str,
        order_price: f64,
        size: f64,
    ) -> bool {
        let symbol_idx = self.symbol_idx;
        let result =
            self.exec
                .place_limit_exit(symbol_idx, exit_name, target_entry, order_price, size);
        self.guard(result)
    }

    pub fn mit_exit(
        &mut self,
        exit_name: &str,
        target_entry: &str,
        touch_price: f64,
        size: f64,
    ) -> bool {
        let symbol_idx = self.symbol_idx;
        let result = self
            .exec
            .place_mit_exit(symbol_idx, exit_name, target_entry, touch_price, size);
        self.guard(result)
    }

    pub fn lit_exit(
        &mut self,
        exit_name: &str,
        target_entry: &str,
        touch_price: f64,
        order_price: f64,
        size: f64,
    ) -> bool {
        let symbol_idx = self.symbol_idx;
        let result = self.exec.place_lit_exit(
            symbol_idx,
            exit_name,
            target_entry,
            touch_price,
            order_price,
            size,
        );
        self.guard(result)
    }

    pub fn trailing_exit(
        &mut self,
        exit_name: &str,
        target_entry: &str,
        touch_price: f64,
        trail_point: f64,
        size: f64,
    ) -> bool {
        let symbol_idx = self.symbol_idx;
        let result = self.exec.place_trailing_exit(
            symbol_idx,
            exit_name,
            target_entry,
            touch_price,
            trail_point,
            size,
        );
        self.guard(result)
    }

    pub fn cancel(&mut self, name: &str, kind: CancelKind) -> bool {
        let symbol_idx = self.symbol_idx;
        self.exec
            .cancel(symbol_idx, name, kind, "cancelled by strategy");
        true
    }

    pub fn cancel_all(&mut self) -> bool {
        let symbol_idx = self.symbol_idx;
        self.exec.cancel_all(symbol_idx, "cancelled by strategy");
        true
    }

    /// Market-exit every open position of the current symbol at the next
    /// trading bar's open.
    pub fn close_all(&mut self) -> bool {
        let symbol_idx = self.symbol_idx;
        let result = self.exec.close_all(symbol_idx);
        self.guard(result)
    }

    /// Change the symbol's leverage; refused while a position is open.
    pub fn adjust_leverage(&mut self, leverage: u32) -> bool {
        if leverage < 1 {
            warn!(leverage, "leverage must be at least 1x");
            return false;
        }
        let symbol_idx = self.symbol_idx;
        let unrealized_loss = self
            .exec
            .unrealized_loss(symbol_idx, crate::order::PriceKind::Open);
        let spec = &self.exec.specs[symbol_idx];
        self.exec
            .book
            .adjust_leverage(leverage, symbol_idx, spec, self.exec.ledger, unrealized_loss)
    }

    // ── Internals ─────────────────────────────────────────────────────

    fn guard(&mut self, result: Result<bool>) -> bool {
        match result {
            Ok(accepted) => accepted,
            Err(error) => {
                if self.fatal.is_none() {
                    self.fatal = Some(error);
                }
                false
            }
        }
    }

    pub(crate) fn take_fatal(&mut self) -> Option<EngineError> {
        self.fatal.take()
    }
}
