/// engine.rs — Time scheduler and intra-bar matching loop
///
/// One `Engine` value owns the whole run: bars, specs, ledger, book,
/// slippage, trade log and the strategy. `run()` is a closed deterministic
/// computation: identical inputs produce byte-identical trade logs (no map
/// iteration order touches the hot path, every tie-break is explicit).
///
/// Per tick:
///   activate symbols → (magnifier sub-loop) → funding → OHLC walk with
///   fill ordering → on_close → after-chain → advance cursors.
///
/// The OHLC walk visits price index 0 of every active symbol before index 1
/// of any symbol: advancing one symbol's intra-bar state ahead of another
/// would mean stepping backwards in time when the next symbol is processed.

use tracing::{debug, info, warn};

use crate::bars::{BarStore, StreamKind};
use crate::book::OrderBook;
use crate::config::BacktestConfig;
use crate::error::{EngineError, Result};
use crate::fill::ExecCtx;
use crate::indicator::IndicatorSet;
use crate::ledger::AccountLedger;
use crate::numeric::{is_equal, is_greater, is_greater_or_equal, is_less};
use crate::order::{FillInfo, PriceKind};
use crate::slippage::Slippage;
use crate::strategy::{MarketCtx, Strategy, StrategyPhase};
use crate::symbol::SymbolSpec;
use crate::timeutil::{next_month_boundary, parse_timeframe, timestamp_to_datetime, MS_HOUR};
use crate::trade::TradeLog;

/// Guard against a strategy that re-enters forever from its own callbacks.
const AFTER_CHAIN_CAP: usize = 1024;

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// End of data or the configured end time.
    Completed,
    /// Wallet went negative; the trade log up to that point is preserved.
    Bankrupt,
}

/// Direction the price moved to reach the current event; `Neutral` (open
/// equal to previous close, or no previous bar) sorts like a rise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventDirection {
    Long,
    Short,
    Neutral,
}

pub struct Engine {
    config: BacktestConfig,
    bars: BarStore,
    specs: Vec<SymbolSpec>,
    indicators: IndicatorSet,
    strategy: Box<dyn Strategy>,

    ledger: AccountLedger,
    book: OrderBook,
    slippage: Slippage,
    trades: TradeLog,

    // Scheduler state
    begin_open_time: i64,
    end_close_time: i64,
    current_open_time: i64,
    current_close_time: i64,
    next_month_boundary: i64,
    trading_began: Vec<bool>,
    trading_ended: Vec<bool>,
    active_symbols: Vec<usize>,
    market_kind: StreamKind,
    all_trading_ended: bool,

    /// Funding cursor per symbol; `usize::MAX` = no more events.
    funding_cursors: Vec<usize>,

    /// Last High/Low price seen per symbol within the current bar, for
    /// inferring the Close event's direction.
    price_cache: Vec<f64>,
    price_kind_cache: Vec<Option<PriceKind>>,

    /// Wallet balance after each tick.
    equity_curve: Vec<f64>,
}

impl Engine {
    pub fn new(
        config: BacktestConfig,
        bars: BarStore,
        specs: Vec<SymbolSpec>,
        indicators: IndicatorSet,
        strategy: Box<dyn Strategy>,
    ) -> Self {
        let num_symbols = bars.num_symbols();
        let initial_balance = config.initial_balance;
        Self {
            config,
            bars,
            specs,
            indicators,
            strategy,
            ledger: AccountLedger::new(initial_balance),
            book: OrderBook::new(num_symbols),
            slippage: Slippage::percentage(0.0, 0.0),
            trades: TradeLog::new(initial_balance),
            begin_open_time: i64::MAX,
            end_close_time: 0,
            current_open_time: 0,
            current_close_time: 0,
            next_month_boundary: 0,
            trading_began: vec![false; num_symbols],
            trading_ended: vec![false; num_symbols],
            active_symbols: Vec::new(),
            market_kind: StreamKind::Trading,
            all_trading_ended: false,
            funding_cursors: vec![usize::MAX; num_symbols],
            price_cache: vec![f64::NAN; num_symbols],
            price_kind_cache: vec![None; num_symbols],
            equity_curve: Vec::new(),
        }
    }

    pub fn trades(&self) -> &TradeLog {
        &self.trades
    }

    pub fn ledger(&self) -> &AccountLedger {
        &self.ledger
    }

    pub fn equity_curve(&self) -> &[f64] {
        &self.equity_curve
    }

    pub fn config(&self) -> &BacktestConfig {
        &self.config
    }

    pub fn symbols(&self) -> &[SymbolSpec] {
        &self.specs
    }

    pub fn indicators(&self) -> &IndicatorSet {
        &self.indicators
    }

    pub fn begin_open_time(&self) -> i64 {
        self.begin_open_time
    }

    pub fn end_close_time(&self) -> i64 {
        self.end_close_time
    }

    pub fn all_trading_ended(&self) -> bool {
        self.all_trading_ended
    }

    /// Validate, initialise, and replay the whole data range.
    pub fn run(&mut self) -> Result<RunStatus> {
        self.validate()?;
        self.initialize()?;

        info!(
            begin = %timestamp_to_datetime(self.begin_open_time),
            end = %timestamp_to_datetime(self.end_close_time),
            symbols = self.bars.num_symbols(),
            "backtest started"
        );

        match self.run_main() {
            Ok(()) => {
                info!(trades = self.trades.len(), "backtest completed");
                Ok(RunStatus::Completed)
            }
            Err(EngineError::Bankruptcy(message)) => {
                self.ledger.set_bankrupt();
                warn!(%message, "backtest terminated by bankruptcy; partial results kept");
                Ok(RunStatus::Bankrupt)
            }
            Err(other) => Err(other),
        }
    }

    // ── Validation ────────────────────────────────────────────────────

    fn validate(&self) -> Result<()> {
        self.config.validate()?;

        let num_symbols = self.bars.num_symbols();
        if num_symbols == 0 {
            return Err(EngineError::invalid("no trading bar data was added"));
        }
        if self.specs.len() != num_symbols {
            return Err(EngineError::invalid(format!(
                "symbol spec count [{}] does not match the symbol count [{num_symbols}]",
                self.specs.len()
            )));
        }
        for (symbol_idx, spec) in self.specs.iter().enumerate() {
            spec.validate()?;
            if spec.name != self.bars.symbols()[symbol_idx] {
                return Err(EngineError::invalid(format!(
                    "symbol spec [{}] does not match bar symbol [{}] at index {symbol_idx}",
                    spec.name,
                    self.bars.symbols()[symbol_idx]
                )));
            }
        }

        if self.config.use_bar_magnifier != self.bars.has_magnifier() {
            return Err(EngineError::invalid(if self.config.use_bar_magnifier {
                "bar magnifier is enabled but no magnifier stream was added"
            } else {
                "a magnifier stream was added but the bar magnifier is disabled"
            }));
        }

        self.validate_timeframes()?;
        self.validate_same_bar_data()?;
        self.validate_funding_precision()?;
        Ok(())
    }

    fn validate_timeframes(&self) -> Result<()> {
        let trading_tf = self.bars.timeframe_ms(StreamKind::Trading);

        if self.bars.has_magnifier() {
            let magnifier_tf = self.bars.timeframe_ms(StreamKind::Magnifier);
            if magnifier_tf >= trading_tf || trading_tf % magnifier_tf != 0 {
                return Err(EngineError::invalid(format!(
                    "magnifier timeframe [{magnifier_tf}ms] must be a proper divisor of the \
                     trading timeframe [{trading_tf}ms]"
                )));
            }
        }

        for reference_idx in 0..self.bars.num_references() {
            let reference_tf = self.bars.timeframe_ms(StreamKind::Reference(reference_idx));
            if reference_tf < trading_tf || reference_tf % trading_tf != 0 {
                return Err(EngineError::invalid(format!(
                    "reference timeframe [{reference_tf}ms] must be a multiple of the trading \
                     timeframe [{trading_tf}ms]"
                )));
            }
        }

        let mark_tf = self.bars.timeframe_ms(StreamKind::MarkPrice);
        let target_tf = if self.bars.has_magnifier() {
            self.bars.timeframe_ms(StreamKind::Magnifier)
        } else {
            trading_tf
        };
        if mark_tf != target_tf {
            return Err(EngineError::invalid(format!(
                "mark-price timeframe [{mark_tf}ms] must equal the fill stream's timeframe \
                 [{target_tf}ms]"
            )));
        }

        Ok(())
    }

    /// First-bar open uniqueness per stream: identical first opens across
    /// symbols usually mean the same file was loaded twice.
    fn validate_same_bar_data(&self) -> Result<()> {
        let streams: [(StreamKind, bool); 4] = [
            (StreamKind::Trading, self.config.check_same_bar_data[0]),
            (StreamKind::Magnifier, self.config.check_same_bar_data[1]),
            (StreamKind::Reference(0), self.config.check_same_bar_data[2]),
            (StreamKind::MarkPrice, self.config.check_same_bar_data[3]),
        ];

        for (stream, enabled) in streams {
            if !enabled {
                continue;
            }
            if matches!(stream, StreamKind::Magnifier) && !self.bars.has_magnifier() {
                continue;
            }
            let reference_count = self.bars.num_references();
            let checked: Vec<StreamKind> = match stream {
                StreamKind::Reference(_) => {
                    (0..reference_count).map(StreamKind::Reference).collect()
                }
                other => vec![other],
            };

            for stream in checked {
                let mut first_opens: Vec<f64> = Vec::new();
                for symbol_idx in 0..self.bars.num_symbols() {
                    if self.bars.num_bars(stream, symbol_idx) == 0 {
                        return Err(EngineError::invalid(format!(
                            "{} bar data for symbol [{}] is empty",
                            stream.label(),
                            self.bars.symbols()[symbol_idx]
                        )));
                    }
                    let open = self.bars.get(stream, symbol_idx, 0)?.open;
                    if first_opens.iter().any(|&seen| is_equal(seen, open)) {
                        return Err(EngineError::invalid(format!(
                            "{} bar data looks duplicated across symbols (identical first-bar \
                             open [{open}]); disable the same-bar-data check to override",
                            stream.label()
                        )));
                    }
                    first_opens.push(open);
                }
            }
        }

        // Mark-price stream vs its target: identical last-bar OHLC means the
        // market data was probably wired in as the mark price.
        if self.config.check_same_bar_data_with_target {
            let target = if self.bars.has_magnifier() {
                StreamKind::Magnifier
            } else {
                StreamKind::Trading
            };
            for mark_idx in 0..self.bars.num_symbols() {
                let mark_last = self.bars.num_bars(StreamKind::MarkPrice, mark_idx) - 1;
                let mark_bar = self.bars.get(StreamKind::MarkPrice, mark_idx, mark_last)?;
                for target_idx in 0..self.bars.num_symbols() {
                    let target_last = self.bars.num_bars(target, target_idx) - 1;
                    let target_bar = self.bars.get(target, target_idx, target_last)?;
                    if is_equal(target_bar.open, mark_bar.open)
                        && is_equal(target_bar.high, mark_bar.high)
                        && is_equal(target_bar.low, mark_bar.low)
                        && is_equal(target_bar.close, mark_bar.close)
                    {
                        return Err(EngineError::invalid(format!(
                            "mark-price data for [{}] may duplicate the {} data for [{}]; \
                             disable the mark-target duplicate check to override",
                            self.bars.symbols()[mark_idx],
                            target.label(),
                            self.bars.symbols()[target_idx]
                        )));
                    }
                }
            }
        }

        Ok(())
    }

    /// Funding settles on the fill stream, whose bars must be at most one
    /// hour so settlements land on their exact hour. Only enforced when
    /// funding events exist at all.
    fn validate_funding_precision(&self) -> Result<()> {
        if self.specs.iter().all(|spec| spec.funding_events.is_empty()) {
            return Ok(());
        }
        let fill_tf = if self.bars.has_magnifier() {
            self.bars.timeframe_ms(StreamKind::Magnifier)
        } else {
            self.bars.timeframe_ms(StreamKind::Trading)
        };
        if fill_tf > parse_timeframe("1h").unwrap_or(MS_HOUR) {
            return Err(EngineError::invalid(
                "funding settlement requires the fill stream (trading, or magnifier when \
                 enabled) to use a timeframe of 1h or less",
            ));
        }
        Ok(())
    }

    // ── Initialisation ────────────────────────────────────────────────

    fn initialize(&mut self) -> Result<()> {
        let num_symbols = self.bars.num_symbols();

        // Full data range, then clamp to the configured period.
        for symbol_idx in 0..num_symbols {
            let first = self.bars.get(StreamKind::Trading, symbol_idx, 0)?;
            let last_idx = self.bars.num_bars(StreamKind::Trading, symbol_idx) - 1;
            let last = self.bars.get(StreamKind::Trading, symbol_idx, last_idx)?;
            self.begin_open_time = self.begin_open_time.min(first.open_time);
            self.end_close_time = self.end_close_time.max(last.close_time);
        }

        let format = self.config.backtest_period.format.clone();
        if let Some(start) = self.config.backtest_period.start.clone() {
            let start_ts = crate::timeutil::datetime_to_timestamp(&start, &format)?;
            if start_ts < self.begin_open_time {
                return Err(EngineError::invalid(format!(
                    "backtest start [{start}] is before the first bar \
                     [{}]",
                    timestamp_to_datetime(self.begin_open_time)
                )));
            }
            self.begin_open_time = start_ts;
        }
        if let Some(end) = self.config.backtest_period.end.clone() {
            let end_ts = crate::timeutil::datetime_to_timestamp(&end, &format)?;
            if end_ts > self.end_close_time {
                return Err(EngineError::invalid(format!(
                    "backtest end [{end}] is after the last bar [{}]",
                    timestamp_to_datetime(self.end_close_time)
                )));
            }
            self.end_close_time = end_ts;
        }

        self.ledger = AccountLedger::new(self.config.initial_balance);
        self.trades = TradeLog::new(self.config.initial_balance);
        self.book = OrderBook::new(num_symbols);
        self.slippage = self.config.slippage.clone();
        self.slippage.initialize(num_symbols);
        self.indicators.bind_streams(&self.bars)?;

        let trading_tf = self.bars.timeframe_ms(StreamKind::Trading);
        self.current_open_time = self.begin_open_time;
        self.current_close_time = self.begin_open_time + trading_tf - 1;
        self.next_month_boundary = next_month_boundary(self.current_open_time);

        self.bars
            .advance_all(StreamKind::Trading, self.current_close_time);
        if !self.bars.has_magnifier() {
            self.bars
                .advance_all(StreamKind::MarkPrice, self.current_close_time);
        }

        for symbol_idx in 0..num_symbols {
            let bar = self.bars.current(StreamKind::Trading, symbol_idx)?;
            self.trading_began[symbol_idx] = bar.open_time == self.begin_open_time;
            self.trading_ended[symbol_idx] = false;
        }

        // First funding event inside the simulated range, per symbol.
        for symbol_idx in 0..num_symbols {
            let events = &self.specs[symbol_idx].funding_events;
            self.funding_cursors[symbol_idx] = events
                .iter()
                .position(|event| {
                    event.time >= self.begin_open_time && event.time <= self.end_close_time
                })
                .unwrap_or_else(|| {
                    if !events.is_empty() {
                        warn!(
                            symbol = %self.specs[symbol_idx].name,
                            "no funding events inside the backtest range; funding will not settle"
                        );
                    }
                    usize::MAX
                });
        }

        self.strategy.initialize(num_symbols);
        Ok(())
    }

    // ── Main loop ─────────────────────────────────────────────────────

    fn run_main(&mut self) -> Result<()> {
        loop {
            if self.current_open_time >= self.next_month_boundary {
                info!(
                    progress = %timestamp_to_datetime(self.current_open_time),
                    wallet = self.ledger.wallet_balance(),
                    "backtest progress"
                );
                self.next_month_boundary = next_month_boundary(self.current_open_time);
            }

            self.update_trading_status()?;

            if self.current_close_time > self.end_close_time {
                self.execute_all_trading_end()?;
            }

            if self.trading_ended.iter().all(|&ended| ended) {
                self.all_trading_ended = true;
                return Ok(());
            }

            if self.bars.has_magnifier() {
                self.run_magnifier_subloop()?;
            } else {
                let active = self.active_symbols.clone();
                for &symbol_idx in &active {
                    self.bars
                        .advance(StreamKind::MarkPrice, symbol_idx, self.current_close_time);
                }
                self.check_funding(&active)?;
                self.process_ohlc(StreamKind::Trading, &active)?;
            }

            // Strategy at the close, then the after-chain to quiescence.
            let active = self.active_symbols.clone();
            for &symbol_idx in &active {
                if self.trading_ended[symbol_idx] {
                    continue;
                }
                self.run_strategy(StrategyPhase::OnClose, symbol_idx)?;
                self.run_after_chain(symbol_idx)?;
            }

            for &symbol_idx in &active {
                if !self.trading_ended[symbol_idx] {
                    self.bars
                        .series_mut(StreamKind::Trading)
                        .increase_cursor(symbol_idx);
                }
            }

            let trading_tf = self.bars.timeframe_ms(StreamKind::Trading);
            self.current_open_time += trading_tf;
            self.current_close_time += trading_tf;

            self.equity_curve.push(self.ledger.wallet_balance());
        }
    }

    /// Decide which symbols trade this tick, aligning reference and
    /// magnifier cursors on the way.
    fn update_trading_status(&mut self) -> Result<()> {
        self.active_symbols.clear();
        let trading_tf = self.bars.timeframe_ms(StreamKind::Trading);

        'symbols: for symbol_idx in 0..self.bars.num_symbols() {
            let cursor = self.bars.cursor(StreamKind::Trading, symbol_idx);

            if self.trading_began[symbol_idx] {
                if self.trading_ended[symbol_idx] {
                    continue;
                }

                // Ran past the final bar during the previous tick.
                if cursor >= self.bars.num_bars(StreamKind::Trading, symbol_idx) {
                    self.execute_trading_end(symbol_idx, "trading")?;
                    continue;
                }

                let bar_open_time = self
                    .bars
                    .get(StreamKind::Trading, symbol_idx, cursor)?
                    .open_time;
                if bar_open_time != self.current_open_time {
                    warn!(
                        symbol = %self.specs[symbol_idx].name,
                        missing = %timestamp_to_datetime(self.current_open_time),
                        next = %timestamp_to_datetime(bar_open_time),
                        "trading bar missing; skipping this time slot"
                    );
                    // Cursor already points past the gap; leave it.
                    continue;
                }
            } else {
                let bar_open_time = self
                    .bars
                    .get(StreamKind::Trading, symbol_idx, cursor)?
                    .open_time;
                if bar_open_time == self.current_open_time {
                    self.trading_began[symbol_idx] = true;
                } else {
                    continue;
                }
            }

            // References must have started and not run out.
            for reference_idx in 0..self.bars.num_references() {
                let stream = StreamKind::Reference(reference_idx);
                let reference_tf = self.bars.timeframe_ms(stream);
                self.bars
                    .advance(stream, symbol_idx, self.current_close_time);

                if reference_tf == trading_tf {
                    // Same timeframe, same data; nothing further to check.
                    continue;
                }

                let moved_idx = self.bars.cursor(stream, symbol_idx);
                let moved_close = self.bars.get(stream, symbol_idx, moved_idx)?.close_time;

                if moved_close > self.current_close_time {
                    warn!(
                        symbol = %self.specs[symbol_idx].name,
                        reference_start = %timestamp_to_datetime(moved_close),
                        "reference bars have not started; symbol skipped this tick"
                    );
                    // The trading cursor still has to track the timeline.
                    self.bars
                        .series_mut(StreamKind::Trading)
                        .increase_cursor(symbol_idx);
                    continue 'symbols;
                }

                if moved_idx == self.bars.num_bars(stream, symbol_idx) - 1
                    && self.current_close_time == moved_close + reference_tf
                {
                    self.execute_trading_end(symbol_idx, "reference")?;
                    continue 'symbols;
                }
            }

            if self.bars.has_magnifier() {
                self.bars
                    .advance(StreamKind::Magnifier, symbol_idx, self.current_open_time - 1);
                let moved_idx = self.bars.cursor(StreamKind::Magnifier, symbol_idx);
                let moved_close = self
                    .bars
                    .get(StreamKind::Magnifier, symbol_idx, moved_idx)?
                    .close_time;

                if moved_close >= self.current_close_time {
                    warn!(
                        symbol = %self.specs[symbol_idx].name,
                        magnifier_start = %timestamp_to_datetime(moved_close),
                        "magnifier bars have not started; symbol skipped this tick"
                    );
                    self.bars
                        .series_mut(StreamKind::Trading)
                        .increase_cursor(symbol_idx);
                    continue;
                }

                if moved_idx == self.bars.num_bars(StreamKind::Magnifier, symbol_idx) - 1 {
                    self.execute_trading_end(symbol_idx, "magnifier")?;
                    continue;
                }
            }

            self.active_symbols.push(symbol_idx);
        }

        Ok(())
    }

    /// Walk magnifier bars across the current trading bar, funding and
    /// matching on every sub-tick.
    fn run_magnifier_subloop(&mut self) -> Result<()> {
        let original_open_time = self.current_open_time;
        let original_close_time = self.current_close_time;
        let magnifier_tf = self.bars.timeframe_ms(StreamKind::Magnifier);

        self.market_kind = StreamKind::Magnifier;
        self.current_open_time = original_open_time - magnifier_tf;
        self.current_close_time = original_open_time - 1;

        let mut active = self.active_symbols.clone();

        loop {
            self.current_open_time += magnifier_tf;
            self.current_close_time += magnifier_tf;

            let mut eligible: Vec<usize> = Vec::with_capacity(active.len());
            let mut exhausted: Vec<usize> = Vec::new();

            for &symbol_idx in &active {
                self.bars
                    .advance(StreamKind::Magnifier, symbol_idx, self.current_close_time);
                let moved_idx = self.bars.cursor(StreamKind::Magnifier, symbol_idx);
                let moved_close = self
                    .bars
                    .get(StreamKind::Magnifier, symbol_idx, moved_idx)?
                    .close_time;

                if moved_close == self.current_close_time {
                    eligible.push(symbol_idx);
                    self.bars
                        .advance(StreamKind::MarkPrice, symbol_idx, self.current_close_time);
                } else if moved_idx
                    < self.bars.num_bars(StreamKind::Magnifier, symbol_idx) - 1
                {
                    debug!(
                        symbol = %self.specs[symbol_idx].name,
                        missing = %timestamp_to_datetime(self.current_open_time),
                        "magnifier bar missing; fills skipped this sub-tick"
                    );
                    // Keep the mark cursor aligned for funding fallbacks.
                    self.bars
                        .advance(StreamKind::MarkPrice, symbol_idx, self.current_close_time);
                } else {
                    self.execute_trading_end(symbol_idx, "magnifier")?;
                    exhausted.push(symbol_idx);
                }
            }

            if !exhausted.is_empty() {
                active.retain(|symbol_idx| !exhausted.contains(symbol_idx));
                self.active_symbols
                    .retain(|symbol_idx| !exhausted.contains(symbol_idx));
            }

            self.check_funding(&active)?;
            self.process_ohlc(StreamKind::Magnifier, &eligible)?;

            if self.current_close_time == original_close_time {
                break;
            }
        }

        self.current_open_time = original_open_time;
        self.current_close_time = original_close_time;
        self.market_kind = StreamKind::Trading;
        Ok(())
    }

    /// Settle due funding for each symbol, resolving the settlement price
    /// from the event, the mark bar, then the market bar.
    fn check_funding(&mut self, symbols: &[usize]) -> Result<()> {
        for &symbol_idx in symbols {
            let cursor = self.funding_cursors[symbol_idx];
            if cursor == usize::MAX {
                continue;
            }
            let event = self.specs[symbol_idx].funding_events[cursor];
            if self.current_open_time < event.time {
                continue;
            }

            let funding_price = if let Some(mark_price) = event.mark_price {
                Some(mark_price)
            } else if let Ok(mark_bar) = self.bars.current(StreamKind::MarkPrice, symbol_idx) {
                if mark_bar.close_time == self.current_close_time {
                    Some(mark_bar.open)
                } else if let Ok(market_bar) = self.bars.current(self.market_kind, symbol_idx) {
                    (market_bar.close_time == self.current_close_time).then_some(market_bar.open)
                } else {
                    None
                }
            } else {
                None
            };

            match funding_price {
                Some(price) => {
                    let mut exec = exec_ctx(self);
                    exec.execute_funding(symbol_idx, event.rate, event.time, price)?;
                }
                None => {
                    warn!(
                        symbol = %self.specs[symbol_idx].name,
                        funding_time = %timestamp_to_datetime(event.time),
                        "no mark or market price aligns with the funding time; settlement skipped"
                    );
                }
            }

            // Advance to the next event regardless.
            let events = &self.specs[symbol_idx].funding_events;
            self.funding_cursors[symbol_idx] = if cursor + 1 < events.len() {
                cursor + 1
            } else {
                debug!(
                    symbol = %self.specs[symbol_idx].name,
                    "funding events exhausted; no further settlements"
                );
                usize::MAX
            };
        }
        Ok(())
    }

    /// Expand each symbol's bar into the 4-price queue and walk all queues
    /// in lockstep, matching orders at every price event.
    fn process_ohlc(&mut self, market_stream: StreamKind, symbols: &[usize]) -> Result<()> {
        if symbols.is_empty() {
            return Ok(());
        }

        let num_symbols = symbols.len();
        let total = num_symbols * 4;
        let mut mark_queue: Vec<(f64, PriceKind, usize)> =
            vec![(f64::NAN, PriceKind::Open, 0); total];
        let mut market_queue: Vec<(f64, PriceKind, usize)> =
            vec![(f64::NAN, PriceKind::Open, 0); total];

        for (symbol_order, &symbol_idx) in symbols.iter().enumerate() {
            let market_bar = *self.bars.current(market_stream, symbol_idx)?;
            let mark_bar = {
                let candidate = *self.bars.current(StreamKind::MarkPrice, symbol_idx)?;
                // A mark bar from another time slot cannot drive liquidation
                // checks; fall back to the market bar.
                if candidate.open_time != market_bar.open_time {
                    market_bar
                } else {
                    candidate
                }
            };

            let mark_events = expand_bar(&mark_bar);
            let market_events = expand_bar(&market_bar);
            for (event_idx, (mark_event, market_event)) in
                mark_events.iter().zip(market_events.iter()).enumerate()
            {
                mark_queue[event_idx * num_symbols + symbol_order] =
                    (mark_event.0, mark_event.1, symbol_idx);
                market_queue[event_idx * num_symbols + symbol_order] =
                    (market_event.0, market_event.1, symbol_idx);
            }

            self.price_cache[symbol_idx] = f64::NAN;
            self.price_kind_cache[symbol_idx] = None;
        }

        let mut fills: Vec<FillInfo> = Vec::with_capacity(32);

        for queue_idx in 0..total {
            let (mark_price, _, symbol_idx) = mark_queue[queue_idx];
            let (market_price, market_price_kind, _) = market_queue[queue_idx];

            if matches!(market_price_kind, PriceKind::High | PriceKind::Low) {
                self.price_cache[symbol_idx] = market_price;
                self.price_kind_cache[symbol_idx] = Some(market_price_kind);
            }

            {
                let mut exec = exec_ctx(self);
                exec.check_liquidation(symbol_idx, mark_price, market_price, &mut fills);
                exec.check_pending_entries(symbol_idx, market_price, market_price_kind, &mut fills);
                exec.check_pending_exits(symbol_idx, market_price, market_price_kind, &mut fills);
            }

            if fills.is_empty() {
                continue;
            }

            let direction = self.event_direction(
                market_stream,
                symbol_idx,
                market_price,
                market_price_kind,
            )?;
            sort_fills(&mut fills, direction);

            for fill in fills.drain(..) {
                {
                    let mut exec = exec_ctx(self);
                    exec.fill_order(&fill, symbol_idx, market_price_kind)?;
                }
                self.run_after_chain(symbol_idx)?;
            }
        }

        Ok(())
    }

    /// Direction the price took into the current event, for fill ordering.
    fn event_direction(
        &self,
        market_stream: StreamKind,
        symbol_idx: usize,
        price: f64,
        price_kind: PriceKind,
    ) -> Result<EventDirection> {
        match price_kind {
            PriceKind::Open => {
                let cursor = self.bars.cursor(market_stream, symbol_idx);
                if cursor == 0 {
                    return Ok(EventDirection::Neutral);
                }
                let previous_close = self.bars.get(market_stream, symbol_idx, cursor - 1)?.close;
                if is_greater(price, previous_close) {
                    Ok(EventDirection::Long)
                } else if is_less(price, previous_close) {
                    Ok(EventDirection::Short)
                } else {
                    Ok(EventDirection::Neutral)
                }
            }
            PriceKind::High => Ok(EventDirection::Long),
            PriceKind::Low => Ok(EventDirection::Short),
            PriceKind::Close => {
                let cached_price = self.price_cache[symbol_idx];
                let Some(cached_kind) = self.price_kind_cache[symbol_idx] else {
                    return Err(EngineError::OrderFailed(
                        "close-event direction requested before any high/low was cached"
                            .to_string(),
                    ));
                };
                if cached_price.is_nan() {
                    return Err(EngineError::OrderFailed(
                        "close-event direction requested with an empty price cache".to_string(),
                    ));
                }
                if is_equal(cached_price, price) {
                    return Ok(match cached_kind {
                        PriceKind::High => EventDirection::Long,
                        _ => EventDirection::Short,
                    });
                }
                Ok(match cached_kind {
                    PriceKind::High => EventDirection::Short,
                    _ => EventDirection::Long,
                })
            }
        }
    }

    /// Run `after_exit`/`after_entry` until both single-shot flags stay
    /// clear, bounded against strategies that re-enter forever.
    fn run_after_chain(&mut self, symbol_idx: usize) -> Result<()> {
        let mut iterations = 0usize;
        loop {
            let just_exited = self.book.just_exited;
            let just_entered = self.book.just_entered;
            if !just_exited && !just_entered {
                return Ok(());
            }

            iterations += 1;
            if iterations > AFTER_CHAIN_CAP {
                return Err(EngineError::OrderFailed(format!(
                    "after-strategy chain exceeded {AFTER_CHAIN_CAP} iterations for symbol [{}]",
                    self.specs[symbol_idx].name
                )));
            }

            if just_exited {
                self.book.just_exited = false;
                self.run_strategy(StrategyPhase::AfterExit, symbol_idx)?;
            }
            if just_entered {
                self.book.just_entered = false;
                self.run_strategy(StrategyPhase::AfterEntry, symbol_idx)?;
            }
        }
    }

    fn run_strategy(&mut self, phase: StrategyPhase, symbol_idx: usize) -> Result<()> {
        let mut exec = ExecCtx {
            bars: &self.bars,
            specs: &self.specs,
            config: &self.config,
            ledger: &mut self.ledger,
            book: &mut self.book,
            slippage: &mut self.slippage,
            trades: &mut self.trades,
            market_kind: self.market_kind,
            current_open_time: self.current_open_time,
            current_close_time: self.current_close_time,
        };
        let mut ctx = MarketCtx::new(&mut exec, &self.indicators, phase, symbol_idx);

        match phase {
            StrategyPhase::OnClose => self.strategy.on_close(&mut ctx),
            StrategyPhase::AfterEntry => self.strategy.after_entry(&mut ctx),
            StrategyPhase::AfterExit => self.strategy.after_exit(&mut ctx),
        }

        if let Some(error) = ctx.take_fatal() {
            return Err(error);
        }
        Ok(())
    }

    /// End one symbol's trading: cancel everything pending and close every
    /// open position at the previous trading-bar close.
    fn execute_trading_end(&mut self, symbol_idx: usize, which_data: &str) -> Result<()> {
        self.trading_ended[symbol_idx] = true;

        let cursor = self.bars.cursor(StreamKind::Trading, symbol_idx);
        let last_idx = self.bars.num_bars(StreamKind::Trading, symbol_idx) - 1;
        let prev_idx = cursor.saturating_sub(1).min(last_idx);
        let prev_bar = *self.bars.get(StreamKind::Trading, symbol_idx, prev_idx)?;

        {
            let mut exec = exec_ctx(self);
            exec.cancel_all(symbol_idx, "bar data ended");
            exec.close_all_at(symbol_idx, prev_bar.close, prev_bar.close_time)?;
        }

        // A forced end-of-data close is not a strategy-visible exit.
        self.book.just_exited = false;
        self.book.just_entered = false;

        info!(
            symbol = %self.specs[symbol_idx].name,
            data = which_data,
            close = prev_bar.close,
            "bar data ended; symbol closed out"
        );
        Ok(())
    }

    fn execute_all_trading_end(&mut self) -> Result<()> {
        self.all_trading_ended = true;
        for symbol_idx in 0..self.bars.num_symbols() {
            if !self.trading_ended[symbol_idx] {
                self.execute_trading_end(symbol_idx, "backtest period")?;
            }
        }
        Ok(())
    }
}

/// Assemble the execution context from the engine's disjoint fields.
fn exec_ctx(engine: &mut Engine) -> ExecCtx<'_> {
    ExecCtx {
        bars: &engine.bars,
        specs: &engine.specs,
        config: &engine.config,
        ledger: &mut engine.ledger,
        book: &mut engine.book,
        slippage: &mut engine.slippage,
        trades: &mut engine.trades,
        market_kind: engine.market_kind,
        current_open_time: engine.current_open_time,
        current_close_time: engine.current_close_time,
    }
}

/// Expand one bar into its four-event price walk. The mid pair is ordered
/// by wedge width from the open: the high comes first iff
/// `high − open >= open − low` (the wider wedge is visited first).
fn expand_bar(bar: &crate::bars::Bar) -> [(f64, PriceKind); 4] {
    let high_first = is_greater_or_equal(bar.high - bar.open, bar.open - bar.low);
    if high_first {
        [
            (bar.open, PriceKind::Open),
            (bar.high, PriceKind::High),
            (bar.low, PriceKind::Low),
            (bar.close, PriceKind::Close),
        ]
    } else {
        [
            (bar.open, PriceKind::Open),
            (bar.low, PriceKind::Low),
            (bar.high, PriceKind::High),
            (bar.close, PriceKind::Close),
        ]
    }
}

/// Order simultaneous fills: by fill price along the event direction, then
/// liquidation before exits before entries, then insertion order (the sort
/// is stable).
fn sort_fills(fills: &mut [FillInfo], direction: EventDirection) {
    fills.sort_by(|a, b| {
        if crate::numeric::is_diff(a.fill_price, b.fill_price) {
            let ascending = a.fill_price.total_cmp(&b.fill_price);
            return match direction {
                EventDirection::Short => ascending.reverse(),
                _ => ascending,
            };
        }
        a.signal.priority().cmp(&b.signal.priority())
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bars::{Bar, BarSeries};
    use crate::config::BacktestConfig;
    use crate::order::{Direction, OrderSignal};
    use crate::slippage::Slippage;
    use crate::symbol::{test_spec, FundingEvent, SymbolSpec};
    use crate::timeutil::MS_MINUTE;

    const TF: i64 = MS_MINUTE;

    fn ohlc_bar(index: i64, o: f64, h: f64, l: f64, c: f64) -> Bar {
        Bar {
            open_time: index * TF,
            open: o,
            high: h,
            low: l,
            close: c,
            volume: 10.0,
            close_time: (index + 1) * TF - 1,
        }
    }

    fn flat_bar(index: i64, price: f64) -> Bar {
        ohlc_bar(index, price, price, price, price)
    }

    fn test_config() -> BacktestConfig {
        BacktestConfig {
            project_directory: "/tmp/test-run".to_string(),
            initial_balance: 10_000.0,
            taker_fee_percentage: 0.1,
            maker_fee_percentage: 0.0,
            slippage: Slippage::percentage(0.0, 0.0),
            check_same_bar_data: [false; 4],
            check_same_bar_data_with_target: false,
            ..BacktestConfig::default()
        }
    }

    fn single_symbol_engine(
        bars: Vec<Bar>,
        config: BacktestConfig,
        spec: SymbolSpec,
        strategy: Box<dyn Strategy>,
    ) -> Engine {
        let store = BarStore::new(
            vec![spec.name.clone()],
            BarSeries::new(TF, vec![bars.clone()]),
            None,
            Vec::new(),
            BarSeries::new(TF, vec![bars]),
        );
        Engine::new(config, store, vec![spec], IndicatorSet::new(), strategy)
    }

    /// Runs a closure at each bar close.
    struct Scripted {
        action: Box<dyn FnMut(&mut MarketCtx<'_, '_>)>,
    }

    impl Scripted {
        fn boxed(action: impl FnMut(&mut MarketCtx<'_, '_>) + 'static) -> Box<dyn Strategy> {
            Box::new(Self {
                action: Box::new(action),
            })
        }
    }

    impl Strategy for Scripted {
        fn on_close(&mut self, ctx: &mut MarketCtx<'_, '_>) {
            (self.action)(ctx);
        }
    }

    struct DoNothing;
    impl Strategy for DoNothing {
        fn on_close(&mut self, _ctx: &mut MarketCtx<'_, '_>) {}
    }

    // ── S1: market entry then market exit at a profit ────────────────

    #[test]
    fn market_round_trip_books_pnl_and_fees() {
        let bars = vec![
            ohlc_bar(0, 100.0, 110.0, 95.0, 108.0),
            ohlc_bar(1, 108.0, 115.0, 107.0, 112.0),
            ohlc_bar(2, 112.0, 113.0, 111.0, 112.5),
        ];
        let strategy = Scripted::boxed(|ctx| {
            if ctx.current_open_time() == 0 {
                assert!(ctx.market_entry("L", Direction::Long, 1.0));
            } else if ctx.current_open_time() == TF {
                assert!(ctx.market_exit("X", "L", 1.0));
            }
        });

        let mut engine = single_symbol_engine(bars, test_config(), test_spec("BTCUSDT"), strategy);
        assert_eq!(engine.run().unwrap(), RunStatus::Completed);

        let trades = engine.trades().trades();
        assert_eq!(trades.len(), 1);
        let trade = &trades[0];
        assert!(is_equal(trade.entry_price, 108.0));
        assert!(is_equal(trade.exit_price, 112.0));
        assert!(is_equal(trade.pnl, 4.0));
        assert!(is_equal(trade.entry_fee, 0.108));
        assert!(is_equal(trade.exit_fee, 0.112));
        assert!(is_equal(trade.net_pnl, 4.0 - 0.108 - 0.112));
        assert!(is_equal(
            engine.ledger().wallet_balance(),
            10_000.0 + 4.0 - 0.108 - 0.112
        ));
        assert!(is_equal(engine.ledger().used_margin(), 0.0));
    }

    // ── S2: limit entry fills at the favorable open gap ──────────────

    #[test]
    fn limit_entry_fills_at_gapped_open() {
        let bars = vec![
            ohlc_bar(0, 100.0, 100.5, 99.5, 100.0),
            ohlc_bar(1, 95.0, 95.0, 94.0, 97.0),
            ohlc_bar(2, 97.0, 98.0, 96.0, 97.5),
        ];
        let strategy = Scripted::boxed(|ctx| {
            if ctx.current_open_time() == 0 {
                assert!(ctx.limit_entry("L", Direction::Long, 98.0, 1.0));
            }
        });

        let mut engine = single_symbol_engine(bars, test_config(), test_spec("BTCUSDT"), strategy);
        engine.run().unwrap();

        // Position still open at the end, closed out at the last close.
        let trades = engine.trades().trades();
        assert_eq!(trades.len(), 1);
        assert!(is_equal(trades[0].entry_price, 95.0));
    }

    // ── S3: long liquidated under the mark-price low ─────────────────

    #[test]
    fn long_liquidates_when_mark_crosses_liquidation_price() {
        let mut spec = test_spec("BTCUSDT");
        spec.liquidation_fee_rate = 0.000_2;

        let bars = vec![
            flat_bar(0, 1_000.0),
            ohlc_bar(1, 1_000.0, 1_001.0, 999.0, 1_000.0),
            ohlc_bar(2, 999.0, 999.5, 990.0, 995.0),
            flat_bar(3, 995.0),
        ];
        let strategy = Scripted::boxed(|ctx| {
            if ctx.current_open_time() == 0 {
                assert!(ctx.adjust_leverage(100));
                assert!(ctx.market_entry("L", Direction::Long, 1.0));
            }
        });

        let mut engine = single_symbol_engine(bars, test_config(), spec, strategy);
        engine.run().unwrap();

        let trades = engine.trades().trades();
        assert_eq!(trades.len(), 1);
        let trade = &trades[0];
        assert_eq!(trade.exit_name, "Liquidation");
        // liq = (10 − 1000) / (0.005 − 1) ≈ 994.97, rounded to the step.
        assert!(is_equal(trade.liquidation_price, 994.97));
        // Fill at the market low of the liquidating event.
        assert!(is_equal(trade.exit_price, 990.0));
        assert!(is_equal(trade.liquidation_fee, 990.0 * 0.000_2));
        assert!(engine.ledger().used_margin() == 0.0);
        // Margin is gone but the account survives the fees.
        assert!(engine.ledger().wallet_balance() > 0.0);
        assert!(!engine.ledger().is_bankrupt());
    }

    // ── S4: trailing order armed at touch, fired on the reversal ─────

    #[test]
    fn trailing_sell_fires_after_trail_point_reversal() {
        // Prices walk 98 → 99 → 101 (touch) → 103 (extreme) → 102 → 100.99.
        let bars = vec![
            flat_bar(0, 98.0),
            flat_bar(1, 99.0),
            flat_bar(2, 101.0),
            flat_bar(3, 103.0),
            flat_bar(4, 102.0),
            flat_bar(5, 100.99),
            flat_bar(6, 101.5),
        ];
        let strategy = Scripted::boxed(|ctx| {
            if ctx.current_open_time() == 0 {
                assert!(ctx.trailing_entry("S", Direction::Short, 100.0, 2.0, 1.0));
            }
        });

        let mut engine = single_symbol_engine(bars, test_config(), test_spec("BTCUSDT"), strategy);
        engine.run().unwrap();

        let trades = engine.trades().trades();
        assert_eq!(trades.len(), 1);
        // Fired at 100.99 = first price at or under extreme 103 − trail 2.
        assert!(is_equal(trades[0].entry_price, 100.99));
        assert_eq!(trades[0].entry_direction, Direction::Short);
    }

    // ── S5: funding debit on a held long ─────────────────────────────

    #[test]
    fn funding_debits_long_positions() {
        let mut spec = test_spec("BTCUSDT");
        spec.funding_events = vec![FundingEvent {
            time: 2 * TF,
            rate: 0.000_1,
            mark_price: Some(30_000.0),
        }];

        let bars = vec![
            flat_bar(0, 30_000.0),
            flat_bar(1, 30_000.0),
            flat_bar(2, 30_000.0),
            flat_bar(3, 30_000.0),
        ];
        let mut config = test_config();
        config.taker_fee_percentage = 0.0;
        let strategy = Scripted::boxed(|ctx| {
            if ctx.current_open_time() == 0 {
                assert!(ctx.adjust_leverage(10));
                assert!(ctx.market_entry("L", Direction::Long, 1.0));
            }
        });

        let mut engine = single_symbol_engine(bars, config, spec, strategy);
        engine.run().unwrap();

        let trades = engine.trades().trades();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].paid_funding_count, 1);
        assert!(is_equal(trades[0].paid_funding_amount, 3.0));
        // Flat prices, zero fees: the only wallet move is the funding.
        assert!(is_equal(engine.ledger().wallet_balance(), 10_000.0 - 3.0));
    }

    // ── Price-walk expansion ─────────────────────────────────────────

    #[test]
    fn price_queue_is_a_permutation_with_wedge_ordering() {
        // High wedge wider: high precedes low.
        let wide_high = ohlc_bar(0, 100.0, 110.0, 95.0, 108.0);
        let events = expand_bar(&wide_high);
        let kinds: Vec<PriceKind> = events.iter().map(|event| event.1).collect();
        assert_eq!(
            kinds,
            vec![PriceKind::Open, PriceKind::High, PriceKind::Low, PriceKind::Close]
        );
        assert_eq!(events[1].0, 110.0);
        assert_eq!(events[2].0, 95.0);

        // Low wedge wider: low precedes high.
        let wide_low = ohlc_bar(0, 100.0, 102.0, 90.0, 95.0);
        let kinds: Vec<PriceKind> = expand_bar(&wide_low).iter().map(|event| event.1).collect();
        assert_eq!(
            kinds,
            vec![PriceKind::Open, PriceKind::Low, PriceKind::High, PriceKind::Close]
        );

        // Equal wedges resolve to high first.
        let balanced = ohlc_bar(0, 100.0, 105.0, 95.0, 100.0);
        let kinds: Vec<PriceKind> = expand_bar(&balanced).iter().map(|event| event.1).collect();
        assert_eq!(kinds[1], PriceKind::High);
    }

    // ── S6: deterministic ordering of simultaneous fills ─────────────

    #[test]
    fn simultaneous_fills_sort_by_price_then_signal() {
        let mut fills = vec![
            FillInfo {
                order_id: 1,
                signal: OrderSignal::Entry,
                fill_price: 101.0,
            },
            FillInfo {
                order_id: 2,
                signal: OrderSignal::Exit,
                fill_price: 100.0,
            },
            FillInfo {
                order_id: 3,
                signal: OrderSignal::Liquidation,
                fill_price: 100.0,
            },
        ];
        sort_fills(&mut fills, EventDirection::Long);
        let order: Vec<u64> = fills.iter().map(|fill| fill.order_id).collect();
        assert_eq!(order, vec![3, 2, 1]);

        // Falling into the event reverses the price order, not the
        // signal tie-break.
        sort_fills(&mut fills, EventDirection::Short);
        let order: Vec<u64> = fills.iter().map(|fill| fill.order_id).collect();
        assert_eq!(order, vec![1, 3, 2]);
    }

    // ── Determinism and ledger invariants ────────────────────────────

    fn run_scripted_once() -> (String, f64) {
        let bars = vec![
            ohlc_bar(0, 100.0, 101.0, 99.0, 100.5),
            ohlc_bar(1, 100.5, 103.0, 100.0, 102.0),
            ohlc_bar(2, 102.0, 104.0, 101.0, 103.0),
            ohlc_bar(3, 103.0, 103.5, 100.5, 101.0),
            ohlc_bar(4, 101.0, 102.0, 99.5, 100.0),
        ];
        let strategy = Scripted::boxed(|ctx| {
            let t = ctx.current_open_time() / TF;
            match t {
                0 => {
                    ctx.market_entry("A", Direction::Long, 0.5);
                }
                1 => {
                    ctx.limit_exit("TP", "A", 103.5, 0.25);
                    ctx.trailing_exit("TRAIL", "A", 0.0, 1.5, 0.25);
                }
                _ => {}
            }
        });
        let mut engine = single_symbol_engine(bars, test_config(), test_spec("BTCUSDT"), strategy);
        engine.run().unwrap();

        let serialized = serde_json::to_string(engine.trades().trades()).unwrap();
        (serialized, engine.ledger().wallet_balance())
    }

    #[test]
    fn identical_inputs_produce_identical_trade_logs() {
        let (first_log, first_wallet) = run_scripted_once();
        let (second_log, second_wallet) = run_scripted_once();
        assert_eq!(first_log, second_log);
        assert_eq!(first_wallet.to_bits(), second_wallet.to_bits());
    }

    #[test]
    fn idle_bars_leave_the_ledger_untouched() {
        let bars = (0..5).map(|i| flat_bar(i, 100.0)).collect();
        let mut engine = single_symbol_engine(
            bars,
            test_config(),
            test_spec("BTCUSDT"),
            Box::new(DoNothing),
        );
        engine.run().unwrap();

        assert!(is_equal(engine.ledger().wallet_balance(), 10_000.0));
        assert!(is_equal(engine.ledger().used_margin(), 0.0));
        assert!(engine.trades().is_empty());
        assert!(engine
            .equity_curve()
            .iter()
            .all(|&equity| is_equal(equity, 10_000.0)));
    }

    #[test]
    fn partial_exits_share_a_trade_number_and_sum_to_entry() {
        let bars = vec![
            flat_bar(0, 100.0),
            flat_bar(1, 100.0),
            flat_bar(2, 101.0),
            flat_bar(3, 102.0),
            flat_bar(4, 103.0),
        ];
        let strategy = Scripted::boxed(|ctx| {
            let t = ctx.current_open_time() / TF;
            match t {
                0 => {
                    ctx.market_entry("A", Direction::Long, 1.0);
                }
                1 => {
                    ctx.market_exit("X1", "A", 0.4);
                }
                2 => {
                    ctx.market_exit("X2", "A", 0.6);
                }
                _ => {}
            }
        });
        let mut engine = single_symbol_engine(bars, test_config(), test_spec("BTCUSDT"), strategy);
        engine.run().unwrap();

        let trades = engine.trades().trades();
        assert_eq!(trades.len(), 2);
        assert_eq!(trades[0].trade_number, trades[1].trade_number);
        assert!(is_equal(
            trades.iter().map(|t| t.exit_size).sum::<f64>(),
            1.0
        ));
        assert!(is_equal(engine.ledger().used_margin(), 0.0));
    }

    #[test]
    fn end_of_data_closes_open_positions_at_previous_close() {
        let bars = vec![flat_bar(0, 100.0), flat_bar(1, 100.0), flat_bar(2, 105.0)];
        let strategy = Scripted::boxed(|ctx| {
            if ctx.current_open_time() == 0 {
                ctx.market_entry("A", Direction::Long, 1.0);
            }
        });
        let mut engine = single_symbol_engine(bars, test_config(), test_spec("BTCUSDT"), strategy);
        engine.run().unwrap();

        let trades = engine.trades().trades();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].exit_name, "Trading End");
        assert!(is_equal(trades[0].exit_price, 105.0));
        assert!(is_equal(engine.ledger().used_margin(), 0.0));
    }

    #[test]
    fn reverse_entry_closes_opposite_position_first() {
        let bars = vec![
            flat_bar(0, 100.0),
            flat_bar(1, 100.0),
            flat_bar(2, 100.0),
            flat_bar(3, 100.0),
        ];
        let strategy = Scripted::boxed(|ctx| {
            let t = ctx.current_open_time() / TF;
            if t == 0 {
                ctx.market_entry("LONG", Direction::Long, 1.0);
            } else if t == 1 {
                ctx.market_entry("SHORT", Direction::Short, 1.0);
            }
        });
        let mut engine = single_symbol_engine(bars, test_config(), test_spec("BTCUSDT"), strategy);
        engine.run().unwrap();

        let trades = engine.trades().trades();
        // The long was reverse-exited before the short was accepted, and
        // the short itself closes at end of data.
        assert_eq!(trades.len(), 2);
        assert_eq!(trades[0].exit_name, "Reverse");
        assert_eq!(trades[0].entry_name, "LONG");
        assert_eq!(trades[1].entry_name, "SHORT");
    }

    #[test]
    fn magnifier_fills_intrabar_at_finer_prices() {
        // Trading: one 4-minute-wide bar pattern via 4x 1m magnifier bars.
        let trading_tf = 4 * TF;
        let trading_bars = vec![
            Bar {
                open_time: 0,
                open: 100.0,
                high: 100.0,
                low: 100.0,
                close: 100.0,
                volume: 10.0,
                close_time: trading_tf - 1,
            },
            Bar {
                open_time: trading_tf,
                open: 100.0,
                high: 106.0,
                low: 99.0,
                close: 104.0,
                volume: 10.0,
                close_time: 2 * trading_tf - 1,
            },
            Bar {
                open_time: 2 * trading_tf,
                open: 104.0,
                high: 104.0,
                low: 104.0,
                close: 104.0,
                volume: 10.0,
                close_time: 3 * trading_tf - 1,
            },
        ];
        let magnifier_bars: Vec<Bar> = (0..12)
            .map(|i| {
                let price = match i {
                    0..=3 => 100.0,
                    4 => 100.0,
                    5 => 99.0,
                    6 => 106.0,
                    7 => 104.0,
                    _ => 104.0,
                };
                flat_bar(i, price)
            })
            .collect();

        let strategy = Scripted::boxed(|ctx| {
            if ctx.current_open_time() == 0 {
                // Resting buy below: the 1m dip to 99 must fill it even
                // though the 4m close never goes there.
                assert!(ctx.limit_entry("DIP", Direction::Long, 99.5, 1.0));
            }
        });

        let spec = test_spec("BTCUSDT");
        let mut config = test_config();
        config.use_bar_magnifier = true;

        let store = BarStore::new(
            vec![spec.name.clone()],
            BarSeries::new(trading_tf, vec![trading_bars]),
            Some(BarSeries::new(TF, vec![magnifier_bars.clone()])),
            Vec::new(),
            BarSeries::new(TF, vec![magnifier_bars]),
        );
        let mut engine = Engine::new(config, store, vec![spec], IndicatorSet::new(), strategy);
        engine.run().unwrap();

        let trades = engine.trades().trades();
        assert_eq!(trades.len(), 1);
        // The 1m bar gaps through the resting 99.5 level at its open, so
        // the favorable-gap rule fills at the finer bar's open.
        assert!(is_equal(trades[0].entry_price, 99.0));
    }

    #[test]
    fn gapped_trading_bar_skips_the_tick() {
        // Bars at minutes 0, 1, 3 (minute 2 missing).
        let bars = vec![flat_bar(0, 100.0), flat_bar(1, 100.0), flat_bar(3, 100.0)];
        let mut engine = single_symbol_engine(
            bars,
            test_config(),
            test_spec("BTCUSDT"),
            Box::new(DoNothing),
        );
        assert_eq!(engine.run().unwrap(), RunStatus::Completed);
    }

    #[test]
    fn bankruptcy_preserves_partial_results() {
        let mut spec = test_spec("BTCUSDT");
        // Huge funding rate to drain the wallet while a position is held.
        spec.funding_events = vec![
            FundingEvent {
                time: 2 * TF,
                rate: 2.0,
                mark_price: Some(30_000.0),
            },
            FundingEvent {
                time: 3 * TF,
                rate: 2.0,
                mark_price: Some(30_000.0),
            },
        ];
        let bars = (0..6).map(|i| flat_bar(i, 30_000.0)).collect();
        let mut config = test_config();
        config.taker_fee_percentage = 0.0;
        let strategy = Scripted::boxed(|ctx| {
            if ctx.current_open_time() == 0 {
                ctx.adjust_leverage(10);
                ctx.market_entry("L", Direction::Long, 1.0);
            }
        });

        let mut engine = single_symbol_engine(bars, config, spec, strategy);
        assert_eq!(engine.run().unwrap(), RunStatus::Bankrupt);
        assert!(engine.ledger().is_bankrupt());
    }

    #[test]
    fn available_balance_always_wallet_minus_margin() {
        let bars = vec![
            flat_bar(0, 100.0),
            flat_bar(1, 100.0),
            flat_bar(2, 101.0),
            flat_bar(3, 102.0),
        ];
        let strategy = Scripted::boxed(|ctx| {
            if ctx.current_open_time() == 0 {
                ctx.market_entry("A", Direction::Long, 1.0);
            }
            let wallet = ctx.wallet_balance();
            let available = ctx.available_balance();
            assert!(available <= wallet);
        });
        let mut engine = single_symbol_engine(bars, test_config(), test_spec("BTCUSDT"), strategy);
        engine.run().unwrap();
        assert!(is_equal(
            engine.ledger().available_balance(),
            engine.ledger().wallet_balance() - engine.ledger().used_margin()
        ));
    }

    #[test]
    fn magnifier_without_stream_fails_validation() {
        let bars = vec![flat_bar(0, 100.0), flat_bar(1, 100.0)];
        let mut config = test_config();
        config.use_bar_magnifier = true;
        let mut engine = single_symbol_engine(
            bars,
            config,
            test_spec("BTCUSDT"),
            Box::new(DoNothing),
        );
        assert!(matches!(
            engine.run(),
            Err(EngineError::InvalidValue(_))
        ));
    }
}
