/// fill.rs — Order triggering and fill execution
///
/// Everything that moves money lives here: trigger predicates evaluated per
/// intra-bar price event, entry fills (margin, fee, liquidation price),
/// exit fills (partial close accounting, sibling-exit cancellation),
/// forced liquidations, reverse exits and funding settlement.
///
/// `ExecCtx` is the run-scoped view the scheduler assembles from the engine
/// fields before each call; nothing here owns state beyond one call.
///
/// Money-moving paths return `Result` because a losing exit, a fee or a
/// funding payment can push the wallet negative (`Bankruptcy`), which must
/// unwind to the scheduler. Strategy-facing placement methods return plain
/// `bool`: parameter problems warn and refuse, they never abort the run.

use tracing::{debug, warn};

use crate::bars::{BarStore, StreamKind};
use crate::book::OrderBook;
use crate::config::BacktestConfig;
use crate::error::{EngineError, Result};
use crate::ledger::AccountLedger;
use crate::numeric::{
    is_diff, is_greater, is_greater_or_equal, is_less, is_less_or_equal, round_to_step,
};
use crate::order::{
    CancelKind, Direction, FillInfo, Order, OrderSignal, OrderType, PriceKind,
};
use crate::slippage::Slippage;
use crate::symbol::SymbolSpec;
use crate::trade::{TradeEvent, TradeLog};

/// Exit-name used for forced liquidation fills.
const LIQUIDATION_EXIT_NAME: &str = "Liquidation";
/// Exit-name used when an opposite-direction entry force-closes positions.
const REVERSE_EXIT_NAME: &str = "Reverse";
/// Exit-name for the end-of-data / end-of-period close-out.
const TRADING_END_EXIT_NAME: &str = "Trading End";

/// Sentinel order size meaning "the entry's full remaining quantity".
pub const FULL_SIZE: f64 = f64::MAX;

/// Run-scoped execution context borrowed from the engine for one call.
pub struct ExecCtx<'a> {
    pub bars: &'a BarStore,
    pub specs: &'a [SymbolSpec],
    pub config: &'a BacktestConfig,
    pub ledger: &'a mut AccountLedger,
    pub book: &'a mut OrderBook,
    pub slippage: &'a mut Slippage,
    pub trades: &'a mut TradeLog,
    /// Stream fills are being checked against (trading, or magnifier when
    /// the magnifier sub-loop is running).
    pub market_kind: StreamKind,
    pub current_open_time: i64,
    pub current_close_time: i64,
}

// ── Trigger predicates ────────────────────────────────────────────────

/// Has the touch level been reached, approaching from the stored side?
pub(crate) fn touch_triggered(touch_direction: Direction, price: f64, touch_price: f64) -> bool {
    match touch_direction {
        Direction::Long => is_greater_or_equal(price, touch_price),
        Direction::Short => is_less_or_equal(price, touch_price),
    }
}

/// Does this price event fill a resting limit order executing on `side`?
pub(crate) fn limit_triggered(side: Direction, price: f64, limit_price: f64) -> bool {
    match side {
        Direction::Long => is_less_or_equal(price, limit_price),
        Direction::Short => is_greater_or_equal(price, limit_price),
    }
}

/// Fill price for a triggered limit order. On the Open event a favorable
/// gap fills at the open (better than the limit); everywhere else the
/// limit price itself fills.
pub(crate) fn limit_fill_price(
    side: Direction,
    event_price: f64,
    price_kind: PriceKind,
    limit_price: f64,
) -> f64 {
    if price_kind == PriceKind::Open {
        match side {
            Direction::Long if is_less(event_price, limit_price) => return event_price,
            Direction::Short if is_greater(event_price, limit_price) => return event_price,
            _ => {}
        }
    }
    limit_price
}

/// Trailing fire test: `side` is the executing direction. A long tracks the
/// running low and fires on a `trail_point` bounce; a short tracks the
/// running high and fires on a `trail_point` drop.
pub(crate) fn trailing_fired(side: Direction, price: f64, extreme: f64, trail_point: f64) -> bool {
    match side {
        Direction::Long => is_greater_or_equal(price, extreme + trail_point),
        Direction::Short => is_less_or_equal(price, extreme - trail_point),
    }
}

/// New running extreme for a trailing order executing on `side`.
pub(crate) fn updated_extreme(side: Direction, extreme: f64, price: f64) -> f64 {
    if extreme.is_nan() {
        return price;
    }
    match side {
        Direction::Long => extreme.min(price),
        Direction::Short => extreme.max(price),
    }
}

/// Touch approach side by order type: MIT/LIT reach for the touch in the
/// order's own direction, trailing waits on the opposite side first.
pub(crate) fn touch_direction_for(order_type: OrderType, direction: Direction) -> Direction {
    match order_type {
        OrderType::Trailing => direction.flipped(),
        _ => direction,
    }
}

impl<'a> ExecCtx<'a> {
    fn spec(&self, symbol_idx: usize) -> &SymbolSpec {
        &self.specs[symbol_idx]
    }

    fn trading_fee(&self, order_type: OrderType, price: f64, size: f64) -> f64 {
        let percentage = if order_type.is_taker() {
            self.config.taker_fee_percentage
        } else {
            self.config.maker_fee_percentage
        };
        price * size * (percentage / 100.0)
    }

    /// Slippage-adjusted fill price using the given stream for the
    /// market-impact estimators.
    fn slip_price(
        &mut self,
        stream: StreamKind,
        order_type: OrderType,
        direction: Direction,
        price: f64,
        size: f64,
        symbol_idx: usize,
    ) -> f64 {
        let series = self.bars.series(stream);
        let bar_idx = series.cursor(symbol_idx);
        self.slippage.fill_price(
            order_type,
            direction,
            price,
            size,
            symbol_idx,
            &self.specs[symbol_idx],
            series,
            bar_idx,
        )
    }

    /// Sum of open losses of a symbol's positions, as a positive reserve.
    /// Priced off the mark bar when it is aligned to the current close
    /// time, else off the current market bar.
    pub fn unrealized_loss(&self, symbol_idx: usize, price_kind: PriceKind) -> f64 {
        if self.book.filled_entries[symbol_idx].is_empty() {
            return 0.0;
        }

        let base_bar = match self.bars.current(StreamKind::MarkPrice, symbol_idx) {
            Ok(mark_bar) if mark_bar.close_time == self.current_close_time => *mark_bar,
            _ => match self.bars.current(self.market_kind, symbol_idx) {
                Ok(market_bar) => *market_bar,
                Err(_) => return 0.0,
            },
        };

        let base_price = match price_kind {
            PriceKind::Open => base_bar.open,
            PriceKind::High => base_bar.high,
            PriceKind::Low => base_bar.low,
            PriceKind::Close => base_bar.close,
        };

        self.book.filled_entries[symbol_idx]
            .iter()
            .map(|entry| {
                let pnl = entry.pnl_at(base_price, entry.remaining_size());
                if is_less(pnl, 0.0) {
                    pnl.abs()
                } else {
                    0.0
                }
            })
            .sum()
    }

    /// Margin backing an entry: notional over leverage plus the symbol's
    /// open-loss reserve.
    pub fn entry_margin(
        &self,
        price: f64,
        size: f64,
        symbol_idx: usize,
        price_kind: PriceKind,
    ) -> f64 {
        price * size / self.book.leverage[symbol_idx] as f64
            + self.unrealized_loss(symbol_idx, price_kind)
    }

    /// Bracket-based forced-liquidation price, rounded to the price step.
    /// A non-positive result means the position cannot be liquidated.
    pub fn liquidation_price(
        &self,
        direction: Direction,
        entry_price: f64,
        size: f64,
        margin: f64,
        symbol_idx: usize,
    ) -> Result<f64> {
        let spec = self.spec(symbol_idx);
        let abs_size = size.abs();
        let signed_size = abs_size * direction.sign();
        let bracket = spec.leverage_bracket(entry_price * abs_size)?;

        let numerator = margin + bracket.maintenance_amount - entry_price * signed_size;
        let denominator = abs_size * bracket.maintenance_margin_rate - signed_size;
        let result = numerator / denominator;

        if is_less_or_equal(result, 0.0) {
            Ok(0.0)
        } else {
            Ok(round_to_step(result, spec.price_step))
        }
    }

    // ── Per-event checks ──────────────────────────────────────────────

    /// Compare each open position's liquidation price against the reached
    /// mark price; hits fill at the same event's market price.
    pub fn check_liquidation(
        &mut self,
        symbol_idx: usize,
        mark_price: f64,
        market_price: f64,
        out: &mut Vec<FillInfo>,
    ) {
        for entry in &self.book.filled_entries[symbol_idx] {
            let liquidation_price = entry.liquidation_price;
            if liquidation_price.is_nan() {
                continue;
            }
            let hit = match entry.entry_direction {
                Direction::Long => {
                    is_greater(liquidation_price, 0.0)
                        && is_less_or_equal(mark_price, liquidation_price)
                }
                Direction::Short => is_greater_or_equal(mark_price, liquidation_price),
            };
            if hit {
                out.push(FillInfo {
                    order_id: entry.id,
                    signal: OrderSignal::Liquidation,
                    fill_price: market_price,
                });
            }
        }
    }

    /// Evaluate every pending entry of a symbol against one price event.
    /// LIT touches convert to resting limits here (reserving margin, which
    /// can cancel the order); trailing orders update their extremes.
    pub fn check_pending_entries(
        &mut self,
        symbol_idx: usize,
        price: f64,
        price_kind: PriceKind,
        out: &mut Vec<FillInfo>,
    ) {
        let mut order_idx = 0;
        while order_idx < self.book.pending_entries[symbol_idx].len() {
            let order = &self.book.pending_entries[symbol_idx][order_idx];
            let id = order.id;
            let order_type = order.entry_order_type;
            let direction = order.entry_direction;

            match order_type {
                OrderType::Limit => {
                    if limit_triggered(direction, price, order.entry_order_price) {
                        out.push(FillInfo {
                            order_id: id,
                            signal: OrderSignal::Entry,
                            fill_price: limit_fill_price(
                                direction,
                                price,
                                price_kind,
                                order.entry_order_price,
                            ),
                        });
                    }
                }

                OrderType::Mit => {
                    if touch_triggered(order.entry_touch_direction, price, order.entry_touch_price)
                    {
                        out.push(FillInfo {
                            order_id: id,
                            signal: OrderSignal::Entry,
                            fill_price: price,
                        });
                    }
                }

                OrderType::Lit => {
                    if !order.entry_touched {
                        if touch_triggered(
                            order.entry_touch_direction,
                            price,
                            order.entry_touch_price,
                        ) {
                            // Touch converts to a resting limit: reserve now.
                            if !self.reserve_lit_entry_margin(symbol_idx, order_idx) {
                                // Order cancelled; do not advance the index.
                                continue;
                            }
                        } else {
                            order_idx += 1;
                            continue;
                        }
                    }

                    let order = &self.book.pending_entries[symbol_idx][order_idx];
                    if limit_triggered(direction, price, order.entry_order_price) {
                        out.push(FillInfo {
                            order_id: id,
                            signal: OrderSignal::Entry,
                            fill_price: limit_fill_price(
                                direction,
                                price,
                                price_kind,
                                order.entry_order_price,
                            ),
                        });
                    }
                }

                OrderType::Trailing => {
                    let order = &mut self.book.pending_entries[symbol_idx][order_idx];
                    if !order.entry_touched {
                        if touch_triggered(
                            order.entry_touch_direction,
                            price,
                            order.entry_touch_price,
                        ) {
                            order.entry_touched = true;
                            order.entry_extreme_price = price;
                        } else {
                            order_idx += 1;
                            continue;
                        }
                    }

                    order.entry_extreme_price =
                        updated_extreme(direction, order.entry_extreme_price, price);
                    if trailing_fired(
                        direction,
                        price,
                        order.entry_extreme_price,
                        order.entry_trail_point,
                    ) {
                        out.push(FillInfo {
                            order_id: id,
                            signal: OrderSignal::Entry,
                            fill_price: price,
                        });
                    }
                }

                OrderType::Market => {
                    // Market entries are created already-filled; a pending
                    // market entry is an engine bug.
                    warn!(symbol = %self.spec(symbol_idx).name, "pending market entry ignored");
                }
            }

            order_idx += 1;
        }
    }

    /// Symmetric check for pending exits; the executing side is the exit
    /// direction (a long position's exit is a short-direction order).
    pub fn check_pending_exits(
        &mut self,
        symbol_idx: usize,
        price: f64,
        price_kind: PriceKind,
        out: &mut Vec<FillInfo>,
    ) {
        let symbol_name = &self.specs[symbol_idx].name;
        let current_open_time = self.current_open_time;
        for order in self.book.pending_exits[symbol_idx].iter_mut() {
            let id = order.id;
            let side = order.exit_direction;

            match order.exit_order_type {
                OrderType::Limit => {
                    if limit_triggered(side, price, order.exit_order_price) {
                        out.push(FillInfo {
                            order_id: id,
                            signal: OrderSignal::Exit,
                            fill_price: limit_fill_price(
                                side,
                                price,
                                price_kind,
                                order.exit_order_price,
                            ),
                        });
                    }
                }

                OrderType::Mit => {
                    if touch_triggered(order.exit_touch_direction, price, order.exit_touch_price) {
                        out.push(FillInfo {
                            order_id: id,
                            signal: OrderSignal::Exit,
                            fill_price: price,
                        });
                    }
                }

                OrderType::Lit => {
                    if !order.exit_touched {
                        if touch_triggered(
                            order.exit_touch_direction,
                            price,
                            order.exit_touch_price,
                        ) {
                            // Exits reserve no margin; the touch just arms
                            // the resting limit.
                            order.exit_touched = true;
                            order.exit_order_time = current_open_time;
                        } else {
                            continue;
                        }
                    }
                    if limit_triggered(side, price, order.exit_order_price) {
                        out.push(FillInfo {
                            order_id: id,
                            signal: OrderSignal::Exit,
                            fill_price: limit_fill_price(
                                side,
                                price,
                                price_kind,
                                order.exit_order_price,
                            ),
                        });
                    }
                }

                OrderType::Trailing => {
                    if !order.exit_touched {
                        if touch_triggered(
                            order.exit_touch_direction,
                            price,
                            order.exit_touch_price,
                        ) {
                            order.exit_touched = true;
                            order.exit_extreme_price = price;
                        } else {
                            continue;
                        }
                    }

                    order.exit_extreme_price =
                        updated_extreme(side, order.exit_extreme_price, price);
                    if trailing_fired(
                        side,
                        price,
                        order.exit_extreme_price,
                        order.exit_trail_point,
                    ) {
                        out.push(FillInfo {
                            order_id: id,
                            signal: OrderSignal::Exit,
                            fill_price: price,
                        });
                    }
                }

                OrderType::Market => {
                    warn!(symbol = %symbol_name, "pending market exit ignored");
                }
            }
        }
    }

    /// Reserve margin for a LIT entry at its touch. Returns false when the
    /// order had to be cancelled for insufficient balance.
    fn reserve_lit_entry_margin(&mut self, symbol_idx: usize, order_idx: usize) -> bool {
        let (name, order_price, order_size) = {
            let order = &self.book.pending_entries[symbol_idx][order_idx];
            (
                order.entry_name.clone(),
                order.entry_order_price,
                order.entry_order_size,
            )
        };

        let margin = self.entry_margin(order_price, order_size, symbol_idx, PriceKind::Open);
        if is_greater(margin, self.ledger.available_balance())
            || self.ledger.increase_used_margin(margin).is_err()
        {
            warn!(
                symbol = %self.spec(symbol_idx).name,
                name = %name,
                margin,
                available = self.ledger.available_balance(),
                "LIT entry touched but its margin cannot be funded"
            );
            self.book.cancel(
                symbol_idx,
                &name,
                CancelKind::Entry,
                "available balance cannot fund the LIT entry margin at touch",
                self.ledger,
            );
            return false;
        }

        let order = &mut self.book.pending_entries[symbol_idx][order_idx];
        order.entry_touched = true;
        order.entry_order_time = self.current_open_time;
        order.entry_margin = margin;
        order.left_margin = margin;
        true
    }

    // ── Fill dispatch ─────────────────────────────────────────────────

    /// Execute one queued fill. Orders are looked up by id: a fill whose
    /// order was cancelled by an earlier fill's after-chain is skipped.
    pub fn fill_order(
        &mut self,
        fill: &FillInfo,
        symbol_idx: usize,
        price_kind: PriceKind,
    ) -> Result<()> {
        match fill.signal {
            OrderSignal::Liquidation => {
                let Some(target_idx) = self.book.filled_entries[symbol_idx]
                    .iter()
                    .position(|order| order.id == fill.order_id)
                else {
                    return Ok(());
                };
                self.fill_liquidation(symbol_idx, target_idx, fill.fill_price)
            }

            OrderSignal::Entry => {
                let Some(order_idx) = self.book.pending_entries[symbol_idx]
                    .iter()
                    .position(|order| order.id == fill.order_id)
                else {
                    return Ok(());
                };
                let order = self.book.pending_entries[symbol_idx].remove(order_idx);
                match order.entry_order_type {
                    OrderType::Limit | OrderType::Lit => {
                        self.fill_limit_entry(order, fill.fill_price, symbol_idx)
                    }
                    OrderType::Mit | OrderType::Trailing => self.fill_market_entry(
                        order,
                        fill.fill_price,
                        price_kind,
                        symbol_idx,
                        self.market_kind,
                    ),
                    OrderType::Market => Ok(()),
                }
            }

            OrderSignal::Exit => {
                let Some(order_idx) = self.book.pending_exits[symbol_idx]
                    .iter()
                    .position(|order| order.id == fill.order_id)
                else {
                    return Ok(());
                };
                let order = self.book.pending_exits[symbol_idx].remove(order_idx);
                self.fill_pending_exit(order, fill.fill_price, symbol_idx)
            }
        }
    }

    /// Market-style entry execution: MIT/trailing fires and strategy market
    /// entries share this path. Opposite positions are reverse-exited first
    /// to free their margin; the entry itself may still be refused for
    /// insufficient balance afterwards.
    fn fill_market_entry(
        &mut self,
        mut order: Order,
        price: f64,
        price_kind: PriceKind,
        symbol_idx: usize,
        slip_stream: StreamKind,
    ) -> Result<()> {
        // Strategy-placed market orders carry their (next-bar-open) fill
        // time from placement; intra-bar fires stamp the current slot.
        let fill_time = if order.entry_order_time >= 0 {
            order.entry_order_time
        } else {
            self.current_open_time
        };

        self.exit_opposite_entries(symbol_idx, order.entry_direction, price, fill_time)?;

        if self.book.has_filled_entry(symbol_idx, &order.entry_name) {
            warn!(
                symbol = %self.spec(symbol_idx).name,
                name = %order.entry_name,
                "entry rejected: an open position already uses this entry name"
            );
            return Ok(());
        }

        let size = order.entry_order_size;
        let filled_price = self.slip_price(
            slip_stream,
            order.entry_order_type,
            order.entry_direction,
            price,
            size,
            symbol_idx,
        );
        let fee = self.trading_fee(order.entry_order_type, filled_price, size);
        let margin = self.entry_margin(filled_price, size, symbol_idx, price_kind);

        if is_greater(margin + fee, self.ledger.available_balance()) {
            warn!(
                symbol = %self.spec(symbol_idx).name,
                name = %order.entry_name,
                needed = margin + fee,
                available = self.ledger.available_balance(),
                "entry rejected: insufficient available balance"
            );
            return Ok(());
        }

        self.ledger.decrease_wallet(fee)?;
        self.ledger.increase_used_margin(margin).map_err(|_| {
            EngineError::InsufficientBalance(format!(
                "[{}] entry margin exceeds wallet balance",
                self.spec(symbol_idx).name
            ))
        })?;

        order.liquidation_price = self.liquidation_price(
            order.entry_direction,
            filled_price,
            size,
            margin,
            symbol_idx,
        )?;

        if order.entry_order_time < 0 {
            order.entry_order_time = fill_time;
            order.entry_order_price = price;
        }
        if order.wallet_balance_at_order.is_nan() {
            order.wallet_balance_at_order = self.ledger.wallet_balance();
        }
        order.entry_filled_time = fill_time;
        order.entry_filled_size = size;
        order.entry_filled_price = filled_price;
        order.entry_margin = margin;
        order.left_margin = margin;
        order.entry_fee = fee;

        debug!(
            symbol = %self.spec(symbol_idx).name,
            name = %order.entry_name,
            direction = order.entry_direction.label(),
            order_type = order.entry_order_type.label(),
            filled_price,
            size,
            margin,
            "entry filled"
        );

        self.ledger.update_statistics();
        self.book.filled_entries[symbol_idx].push(order);
        let trading_bar_idx = self.bars.cursor(StreamKind::Trading, symbol_idx);
        self.book.record_entry(symbol_idx, trading_bar_idx, filled_price);
        Ok(())
    }

    /// Limit/LIT entry fill: margin was reserved at placement (or touch),
    /// so only the fee and liquidation price are computed here.
    fn fill_limit_entry(&mut self, mut order: Order, price: f64, symbol_idx: usize) -> Result<()> {
        self.exit_opposite_entries(
            symbol_idx,
            order.entry_direction,
            price,
            self.current_open_time,
        )?;

        if self.book.has_filled_entry(symbol_idx, &order.entry_name) {
            warn!(
                symbol = %self.spec(symbol_idx).name,
                name = %order.entry_name,
                "limit entry rejected: an open position already uses this entry name"
            );
            self.ledger.decrease_used_margin(order.entry_margin);
            return Ok(());
        }

        let size = order.entry_order_size;
        let filled_price = self.slip_price(
            self.market_kind,
            order.entry_order_type,
            order.entry_direction,
            price,
            size,
            symbol_idx,
        );
        let fee = self.trading_fee(order.entry_order_type, filled_price, size);

        self.ledger.decrease_wallet(fee)?;

        order.liquidation_price = self.liquidation_price(
            order.entry_direction,
            filled_price,
            size,
            order.entry_margin,
            symbol_idx,
        )?;

        order.entry_filled_time = self.current_open_time;
        order.entry_filled_size = size;
        order.entry_filled_price = filled_price;
        order.entry_fee = fee;

        debug!(
            symbol = %self.spec(symbol_idx).name,
            name = %order.entry_name,
            direction = order.entry_direction.label(),
            order_type = order.entry_order_type.label(),
            filled_price,
            size,
            "limit entry filled"
        );

        self.ledger.update_statistics();
        self.book.filled_entries[symbol_idx].push(order);
        let trading_bar_idx = self.bars.cursor(StreamKind::Trading, symbol_idx);
        self.book.record_entry(symbol_idx, trading_bar_idx, filled_price);
        Ok(())
    }

    /// Close every open position running opposite to a new entry, at the
    /// new entry's price. Frees margin so the entry has the best chance of
    /// being funded; runs even if the entry is then refused.
    fn exit_opposite_entries(
        &mut self,
        symbol_idx: usize,
        entry_direction: Direction,
        price: f64,
        fill_time: i64,
    ) -> Result<()> {
        let opposite_names: Vec<String> = self.book.filled_entries[symbol_idx]
            .iter()
            .filter(|entry| entry.entry_direction != entry_direction)
            .map(|entry| entry.entry_name.clone())
            .collect();

        for target_name in opposite_names {
            let Some(target_idx) = self.book.find_filled_entry(symbol_idx, &target_name) else {
                continue;
            };
            let remaining = self.book.filled_entries[symbol_idx][target_idx].remaining_size();
            let side = entry_direction;
            let filled_price = self.slip_price(
                self.market_kind,
                OrderType::Market,
                side,
                price,
                remaining,
                symbol_idx,
            );
            self.execute_exit(
                symbol_idx,
                target_idx,
                REVERSE_EXIT_NAME,
                OrderType::Market,
                filled_price,
                remaining,
                fill_time,
                false,
            )?;
        }
        Ok(())
    }

    /// Pending exit fill: clip to the entry's remaining quantity and settle.
    fn fill_pending_exit(&mut self, order: Order, price: f64, symbol_idx: usize) -> Result<()> {
        let Some(target_idx) = self.book.find_filled_entry(symbol_idx, &order.entry_name) else {
            warn!(
                symbol = %self.spec(symbol_idx).name,
                exit_name = %order.exit_name,
                target = %order.entry_name,
                "exit fill skipped: target entry no longer open"
            );
            return Ok(());
        };

        let remaining = self.book.filled_entries[symbol_idx][target_idx].remaining_size();
        if is_less_or_equal(remaining, 0.0) {
            return Ok(());
        }

        let mut size = order.exit_order_size;
        if is_greater(size, remaining) {
            if size < FULL_SIZE {
                warn!(
                    symbol = %self.spec(symbol_idx).name,
                    exit_name = %order.exit_name,
                    requested = size,
                    remaining,
                    "exit size clipped to the entry's remaining quantity"
                );
            }
            size = remaining;
        }

        let filled_price = self.slip_price(
            self.market_kind,
            order.exit_order_type,
            order.exit_direction,
            price,
            size,
            symbol_idx,
        );

        self.execute_exit(
            symbol_idx,
            target_idx,
            &order.exit_name,
            order.exit_order_type,
            filled_price,
            size,
            self.current_open_time,
            false,
        )
    }

    /// Forced close of the full remainder at the event's market price, with
    /// the liquidation fee on top of the normal taker fee.
    fn fill_liquidation(
        &mut self,
        symbol_idx: usize,
        target_idx: usize,
        market_price: f64,
    ) -> Result<()> {
        let fill_price = round_to_step(market_price, self.spec(symbol_idx).price_step);
        let remaining = self.book.filled_entries[symbol_idx][target_idx].remaining_size();

        warn!(
            symbol = %self.spec(symbol_idx).name,
            name = %self.book.filled_entries[symbol_idx][target_idx].entry_name,
            liquidation_price = self.book.filled_entries[symbol_idx][target_idx].liquidation_price,
            fill_price,
            "position liquidated"
        );

        self.execute_exit(
            symbol_idx,
            target_idx,
            LIQUIDATION_EXIT_NAME,
            OrderType::Market,
            fill_price,
            remaining,
            self.current_open_time,
            true,
        )
    }

    /// Core exit settlement shared by every close path: proportional margin
    /// release, pnl and fee application, trade recording, and removal of
    /// fully-closed entries together with their sibling pending exits.
    #[allow(clippy::too_many_arguments)]
    fn execute_exit(
        &mut self,
        symbol_idx: usize,
        target_idx: usize,
        exit_name: &str,
        exit_order_type: OrderType,
        fill_price: f64,
        size: f64,
        fill_time: i64,
        is_liquidation: bool,
    ) -> Result<()> {
        let fee = self.trading_fee(exit_order_type, fill_price, size);
        let liquidation_fee = if is_liquidation {
            fill_price * size * self.spec(symbol_idx).liquidation_fee_rate
        } else {
            0.0
        };

        let (pnl, margin_release, trade_number, entry_name) = {
            let target = &mut self.book.filled_entries[symbol_idx][target_idx];
            let pnl = target.pnl_at(fill_price, size);
            let release = (target.entry_margin * size / target.entry_filled_size)
                .min(target.left_margin)
                .max(0.0);
            target.left_margin -= release;
            target.exit_filled_size += size;
            target.exit_count += 1;
            target.exit_fee += fee;
            if is_liquidation {
                target.liquidation_fee += liquidation_fee;
            }
            let entry_name = target.entry_name.clone();
            (pnl, release, target.trade_number, entry_name)
        };

        let trade_number = match trade_number {
            Some(number) => number,
            None => {
                let number = self.trades.alloc_trade_number();
                self.book.filled_entries[symbol_idx][target_idx].trade_number = Some(number);
                number
            }
        };

        self.ledger.decrease_used_margin(margin_release);
        if is_greater(pnl, 0.0) {
            self.ledger.increase_wallet(pnl)?;
        } else if is_less(pnl, 0.0) {
            self.ledger.decrease_wallet(pnl.abs())?;
        }
        self.ledger.decrease_wallet(fee + liquidation_fee)?;
        self.ledger.update_statistics();

        let fully_closed = {
            let target = &self.book.filled_entries[symbol_idx][target_idx];
            is_greater_or_equal(target.exit_filled_size, target.entry_filled_size)
        };

        if fully_closed {
            // Release floating-point dust left from proportional releases.
            let left = self.book.filled_entries[symbol_idx][target_idx].left_margin;
            if is_greater(left, 0.0) {
                self.ledger.decrease_used_margin(left);
                self.book.filled_entries[symbol_idx][target_idx].left_margin = 0.0;
            }
        }

        let event = {
            let target = &self.book.filled_entries[symbol_idx][target_idx];
            TradeEvent {
                trade_number,
                symbol_name: self.spec(symbol_idx).name.clone(),
                entry_name: entry_name.clone(),
                exit_name: exit_name.to_string(),
                entry_direction: target.entry_direction,
                entry_filled_time: target.entry_filled_time,
                exit_filled_time: fill_time,
                leverage: target.leverage,
                entry_price: target.entry_filled_price,
                entry_size: target.entry_filled_size,
                exit_price: fill_price,
                exit_size: size,
                liquidation_price: if is_liquidation {
                    target.liquidation_price
                } else {
                    f64::NAN
                },
                received_funding_count: target.received_funding_count,
                received_funding_amount: target.received_funding_amount,
                paid_funding_count: target.paid_funding_count,
                paid_funding_amount: target.paid_funding_amount,
                entry_fee: target.entry_fee * size / target.entry_filled_size,
                exit_fee: fee,
                liquidation_fee,
                pnl,
                entry_margin_share: margin_release,
                wallet_balance_at_order: target.wallet_balance_at_order,
                open_symbol_count: 0,
            }
        };

        if fully_closed {
            self.book.filled_entries[symbol_idx].remove(target_idx);
            self.book.cancel_sibling_exits(symbol_idx, &entry_name);
        }

        let mut event = event;
        event.open_symbol_count = self.book.open_symbol_count();
        self.trades.add(event, self.ledger);

        debug!(
            symbol = %self.spec(symbol_idx).name,
            exit_name,
            fill_price,
            size,
            pnl,
            fully_closed,
            "exit filled"
        );

        let trading_bar_idx = self.bars.cursor(StreamKind::Trading, symbol_idx);
        self.book.record_exit(symbol_idx, trading_bar_idx, fill_price);
        Ok(())
    }

    // ── Funding ───────────────────────────────────────────────────────

    /// Settle one funding event against every open position of a symbol.
    /// Positive rates debit longs and credit shorts; funding only ever
    /// moves the wallet, never margin.
    pub fn execute_funding(
        &mut self,
        symbol_idx: usize,
        funding_rate: f64,
        funding_time: i64,
        funding_price: f64,
    ) -> Result<()> {
        for order_idx in 0..self.book.filled_entries[symbol_idx].len() {
            let (payment, name) = {
                let entry = &self.book.filled_entries[symbol_idx][order_idx];
                let notional = entry.remaining_size() * funding_price;
                let amount = funding_rate * notional;
                let payment = match entry.entry_direction {
                    Direction::Long => amount,
                    Direction::Short => -amount,
                };
                (payment, entry.entry_name.clone())
            };

            if is_greater(payment, 0.0) {
                self.ledger.decrease_wallet(payment)?;
                let entry = &mut self.book.filled_entries[symbol_idx][order_idx];
                entry.paid_funding_amount += payment;
                entry.paid_funding_count += 1;
            } else if is_less(payment, 0.0) {
                self.ledger.increase_wallet(-payment)?;
                let entry = &mut self.book.filled_entries[symbol_idx][order_idx];
                entry.received_funding_amount += -payment;
                entry.received_funding_count += 1;
            } else {
                continue;
            }

            debug!(
                symbol = %self.spec(symbol_idx).name,
                name = %name,
                funding_rate,
                funding_price,
                payment,
                time = %crate::timeutil::timestamp_to_datetime(funding_time),
                "funding settled"
            );
        }

        self.ledger.update_statistics();
        Ok(())
    }

    // ── End-of-trading close-out ──────────────────────────────────────

    /// Close every open position of a symbol at the given price (the
    /// previous trading-bar close). Taker fees apply; no slippage.
    pub fn close_all_at(&mut self, symbol_idx: usize, price: f64, time: i64) -> Result<()> {
        let fill_price = round_to_step(price, self.spec(symbol_idx).price_step);
        while let Some(target_idx) = (!self.book.filled_entries[symbol_idx].is_empty()).then_some(0)
        {
            let remaining = self.book.filled_entries[symbol_idx][target_idx].remaining_size();
            self.execute_exit(
                symbol_idx,
                target_idx,
                TRADING_END_EXIT_NAME,
                OrderType::Market,
                fill_price,
                remaining,
                time,
                false,
            )?;
        }
        Ok(())
    }

    // ── Strategy order API ────────────────────────────────────────────

    /// Market entry: created already-filled at the next trading bar's open.
    pub fn place_market_entry(
        &mut self,
        symbol_idx: usize,
        entry_name: &str,
        direction: Direction,
        order_size: f64,
    ) -> Result<bool> {
        let Some((next_open_time, next_open)) = self.next_trading_open(symbol_idx) else {
            warn!(
                symbol = %self.spec(symbol_idx).name,
                name = entry_name,
                "market entry refused: no next bar to fill at"
            );
            return Ok(false);
        };

        if self.book.has_filled_entry(symbol_idx, entry_name) {
            warn!(
                symbol = %self.spec(symbol_idx).name,
                name = entry_name,
                "market entry refused: an open position already uses this entry name"
            );
            return Ok(false);
        }

        if let Err(message) = self.validate_entry_order(
            symbol_idx,
            OrderType::Market,
            order_size,
            next_open,
            None,
        ) {
            warn!(symbol = %self.spec(symbol_idx).name, name = entry_name, %message, "market entry refused");
            return Ok(false);
        }

        self.cancel_and_reorder_entry(symbol_idx, entry_name);

        let order = Order {
            id: self.book.alloc_order_id(),
            leverage: self.book.leverage[symbol_idx],
            entry_name: entry_name.to_string(),
            entry_order_type: OrderType::Market,
            entry_direction: direction,
            entry_order_time: next_open_time,
            entry_order_size: order_size,
            entry_order_price: next_open,
            wallet_balance_at_order: self.ledger.wallet_balance(),
            ..Order::default()
        };

        self.fill_market_entry(order, next_open, PriceKind::Open, symbol_idx, StreamKind::Trading)?;
        Ok(self.book.has_filled_entry(symbol_idx, entry_name))
    }

    /// Limit entry: reserves its margin eagerly at the order price.
    pub fn place_limit_entry(
        &mut self,
        symbol_idx: usize,
        entry_name: &str,
        direction: Direction,
        order_price: f64,
        order_size: f64,
    ) -> Result<bool> {
        let Some((next_open_time, _)) = self.next_trading_open(symbol_idx) else {
            warn!(
                symbol = %self.spec(symbol_idx).name,
                name = entry_name,
                "limit entry refused: no next bar to rest into"
            );
            return Ok(false);
        };

        // The limit side is judged against the decision-time price (the
        // current close); a gap through the level before the next open is
        // what the favorable-gap fill handles.
        let base_price = self
            .bars
            .current(StreamKind::Trading, symbol_idx)
            .map(|bar| bar.close)
            .unwrap_or(f64::NAN);

        if let Err(message) = self.validate_entry_order(
            symbol_idx,
            OrderType::Limit,
            order_size,
            order_price,
            Some((order_price, base_price, direction)),
        ) {
            warn!(symbol = %self.spec(symbol_idx).name, name = entry_name, %message, "limit entry refused");
            return Ok(false);
        }

        self.cancel_and_reorder_entry(symbol_idx, entry_name);

        let margin = self.entry_margin(order_price, order_size, symbol_idx, PriceKind::Open);
        if is_greater(margin, self.ledger.available_balance())
            || self.ledger.increase_used_margin(margin).is_err()
        {
            warn!(
                symbol = %self.spec(symbol_idx).name,
                name = entry_name,
                margin,
                available = self.ledger.available_balance(),
                "limit entry refused: margin cannot be funded"
            );
            return Ok(false);
        }

        let order = Order {
            id: self.book.alloc_order_id(),
            leverage: self.book.leverage[symbol_idx],
            entry_name: entry_name.to_string(),
            entry_order_type: OrderType::Limit,
            entry_direction: direction,
            entry_order_time: next_open_time,
            entry_order_size: order_size,
            entry_order_price: order_price,
            entry_margin: margin,
            left_margin: margin,
            wallet_balance_at_order: self.ledger.wallet_balance(),
            ..Order::default()
        };
        self.book.pending_entries[symbol_idx].push(order);

        debug!(
            symbol = %self.spec(symbol_idx).name,
            name = entry_name,
            order_price,
            order_size,
            margin,
            "limit entry resting"
        );
        Ok(true)
    }

    /// MIT entry: no reservation while waiting; fires as a market order.
    pub fn place_mit_entry(
        &mut self,
        symbol_idx: usize,
        entry_name: &str,
        direction: Direction,
        touch_price: f64,
        order_size: f64,
    ) -> Result<bool> {
        if let Err(message) = self.validate_entry_order(
            symbol_idx,
            OrderType::Mit,
            order_size,
            touch_price,
            None,
        ) {
            warn!(symbol = %self.spec(symbol_idx).name, name = entry_name, %message, "MIT entry refused");
            return Ok(false);
        }
        if !price_is_valid(touch_price) {
            warn!(
                symbol = %self.spec(symbol_idx).name,
                name = entry_name,
                touch_price,
                "MIT entry refused: invalid touch price"
            );
            return Ok(false);
        }

        self.cancel_and_reorder_entry(symbol_idx, entry_name);

        let order = Order {
            id: self.book.alloc_order_id(),
            leverage: self.book.leverage[symbol_idx],
            entry_name: entry_name.to_string(),
            entry_order_type: OrderType::Mit,
            entry_direction: direction,
            entry_touch_price: touch_price,
            entry_touch_direction: touch_direction_for(OrderType::Mit, direction),
            entry_order_size: order_size,
            wallet_balance_at_order: self.ledger.wallet_balance(),
            ..Order::default()
        };
        self.book.pending_entries[symbol_idx].push(order);
        Ok(true)
    }

    /// LIT entry: converts to a resting limit (reserving margin) at touch.
    pub fn place_lit_entry(
        &mut self,
        symbol_idx: usize,
        entry_name: &str,
        direction: Direction,
        touch_price: f64,
        order_price: f64,
        order_size: f64,
    ) -> Result<bool> {
        if let Err(message) = self.validate_entry_order(
            symbol_idx,
            OrderType::Lit,
            order_size,
            order_price,
            Some((order_price, touch_price, direction)),
        ) {
            warn!(symbol = %self.spec(symbol_idx).name, name = entry_name, %message, "LIT entry refused");
            return Ok(false);
        }
        if !price_is_valid(touch_price) {
            warn!(
                symbol = %self.spec(symbol_idx).name,
                name = entry_name,
                touch_price,
                "LIT entry refused: invalid touch price"
            );
            return Ok(false);
        }

        self.cancel_and_reorder_entry(symbol_idx, entry_name);

        let order = Order {
            id: self.book.alloc_order_id(),
            leverage: self.book.leverage[symbol_idx],
            entry_name: entry_name.to_string(),
            entry_order_type: OrderType::Lit,
            entry_direction: direction,
            entry_touch_price: touch_price,
            entry_touch_direction: touch_direction_for(OrderType::Lit, direction),
            entry_order_size: order_size,
            entry_order_price: order_price,
            wallet_balance_at_order: self.ledger.wallet_balance(),
            ..Order::default()
        };
        self.book.pending_entries[symbol_idx].push(order);
        Ok(true)
    }

    /// Trailing entry. A zero touch price starts tracking immediately from
    /// the next trading bar's open.
    pub fn place_trailing_entry(
        &mut self,
        symbol_idx: usize,
        entry_name: &str,
        direction: Direction,
        touch_price: f64,
        trail_point: f64,
        order_size: f64,
    ) -> Result<bool> {
        let anchor = if touch_price == 0.0 {
            match self.next_trading_open(symbol_idx) {
                Some((_, next_open)) => next_open,
                None => {
                    warn!(
                        symbol = %self.spec(symbol_idx).name,
                        name = entry_name,
                        "trailing entry refused: no next bar to anchor tracking at"
                    );
                    return Ok(false);
                }
            }
        } else {
            touch_price
        };

        if !price_is_valid(anchor) || is_less(touch_price, 0.0) {
            warn!(
                symbol = %self.spec(symbol_idx).name,
                name = entry_name,
                touch_price,
                "trailing entry refused: invalid touch price"
            );
            return Ok(false);
        }
        if !price_is_valid(trail_point) {
            warn!(
                symbol = %self.spec(symbol_idx).name,
                name = entry_name,
                trail_point,
                "trailing entry refused: trail point must be positive"
            );
            return Ok(false);
        }
        if let Err(message) = self.validate_entry_order(
            symbol_idx,
            OrderType::Trailing,
            order_size,
            anchor,
            None,
        ) {
            warn!(symbol = %self.spec(symbol_idx).name, name = entry_name, %message, "trailing entry refused");
            return Ok(false);
        }

        self.cancel_and_reorder_entry(symbol_idx, entry_name);

        let mut order = Order {
            id: self.book.alloc_order_id(),
            leverage: self.book.leverage[symbol_idx],
            entry_name: entry_name.to_string(),
            entry_order_type: OrderType::Trailing,
            entry_direction: direction,
            entry_touch_price: touch_price,
            entry_touch_direction: touch_direction_for(OrderType::Trailing, direction),
            entry_trail_point: trail_point,
            entry_order_size: order_size,
            wallet_balance_at_order: self.ledger.wallet_balance(),
            ..Order::default()
        };
        if touch_price == 0.0 {
            order.entry_touched = true;
            order.entry_extreme_price = anchor;
        }
        self.book.pending_entries[symbol_idx].push(order);
        Ok(true)
    }

    /// Market exit: fills immediately at the next trading bar's open.
    pub fn place_market_exit(
        &mut self,
        symbol_idx: usize,
        exit_name: &str,
        target_entry: &str,
        order_size: f64,
    ) -> Result<bool> {
        let Some(target_idx) = self.book.find_filled_entry(symbol_idx, target_entry) else {
            warn!(
                symbol = %self.spec(symbol_idx).name,
                exit_name,
                target_entry,
                "market exit refused: no open position under the target entry name"
            );
            return Ok(false);
        };

        let Some((next_open_time, next_open)) = self.next_trading_open(symbol_idx) else {
            warn!(
                symbol = %self.spec(symbol_idx).name,
                exit_name,
                "market exit refused: no next bar to fill at"
            );
            return Ok(false);
        };

        if let Err(message) = validate_exit_size(order_size, self.spec(symbol_idx)) {
            warn!(symbol = %self.spec(symbol_idx).name, exit_name, %message, "market exit refused");
            return Ok(false);
        }

        self.cancel_and_reorder_exit(symbol_idx, exit_name);

        let remaining = self.book.filled_entries[symbol_idx][target_idx].remaining_size();
        let size = order_size.min(remaining);
        let side = self.book.filled_entries[symbol_idx][target_idx]
            .entry_direction
            .flipped();
        let filled_price = self.slip_price(
            StreamKind::Trading,
            OrderType::Market,
            side,
            next_open,
            size,
            symbol_idx,
        );

        self.execute_exit(
            symbol_idx,
            target_idx,
            exit_name,
            OrderType::Market,
            filled_price,
            size,
            next_open_time,
            false,
        )?;
        Ok(true)
    }

    /// Limit exit resting at `order_price`.
    pub fn place_limit_exit(
        &mut self,
        symbol_idx: usize,
        exit_name: &str,
        target_entry: &str,
        order_price: f64,
        order_size: f64,
    ) -> Result<bool> {
        let Some(target_idx) = self.book.find_filled_entry(symbol_idx, target_entry) else {
            warn!(
                symbol = %self.spec(symbol_idx).name,
                exit_name,
                target_entry,
                "limit exit refused: no open position under the target entry name"
            );
            return Ok(false);
        };
        let Some((next_open_time, _)) = self.next_trading_open(symbol_idx) else {
            warn!(
                symbol = %self.spec(symbol_idx).name,
                exit_name,
                "limit exit refused: no next bar to rest into"
            );
            return Ok(false);
        };

        let side = self.book.filled_entries[symbol_idx][target_idx]
            .entry_direction
            .flipped();
        let base_price = self
            .bars
            .current(StreamKind::Trading, symbol_idx)
            .map(|bar| bar.close)
            .unwrap_or(f64::NAN);
        if let Err(message) = validate_exit_size(order_size, self.spec(symbol_idx)) {
            warn!(symbol = %self.spec(symbol_idx).name, exit_name, %message, "limit exit refused");
            return Ok(false);
        }
        if let Err(message) = validate_limit_price(order_price, base_price, side) {
            warn!(symbol = %self.spec(symbol_idx).name, exit_name, %message, "limit exit refused");
            return Ok(false);
        }

        self.cancel_and_reorder_exit(symbol_idx, exit_name);

        let order = self.build_pending_exit(
            symbol_idx,
            target_idx,
            exit_name,
            OrderType::Limit,
            order_size,
        );
        let order = Order {
            exit_order_time: next_open_time,
            exit_order_price: order_price,
            ..order
        };
        self.book.pending_exits[symbol_idx].push(order);
        Ok(true)
    }

    /// MIT exit: touch then market.
    pub fn place_mit_exit(
        &mut self,
        symbol_idx: usize,
        exit_name: &str,
        target_entry: &str,
        touch_price: f64,
        order_size: f64,
    ) -> Result<bool> {
        let Some(target_idx) = self.book.find_filled_entry(symbol_idx, target_entry) else {
            warn!(
                symbol = %self.spec(symbol_idx).name,
                exit_name,
                target_entry,
                "MIT exit refused: no open position under the target entry name"
            );
            return Ok(false);
        };
        if !price_is_valid(touch_price) {
            warn!(
                symbol = %self.spec(symbol_idx).name,
                exit_name,
                touch_price,
                "MIT exit refused: invalid touch price"
            );
            return Ok(false);
        }
        if let Err(message) = validate_exit_size(order_size, self.spec(symbol_idx)) {
            warn!(symbol = %self.spec(symbol_idx).name, exit_name, %message, "MIT exit refused");
            return Ok(false);
        }

        self.cancel_and_reorder_exit(symbol_idx, exit_name);

        let side = self.book.filled_entries[symbol_idx][target_idx]
            .entry_direction
            .flipped();
        let order = self.build_pending_exit(
            symbol_idx,
            target_idx,
            exit_name,
            OrderType::Mit,
            order_size,
        );
        let order = Order {
            exit_touch_price: touch_price,
            exit_touch_direction: touch_direction_for(OrderType::Mit, side),
            ..order
        };
        self.book.pending_exits[symbol_idx].push(order);
        Ok(true)
    }

    /// LIT exit: touch then resting limit.
    pub fn place_lit_exit(
        &mut self,
        symbol_idx: usize,
        exit_name: &str,
        target_entry: &str,
        touch_price: f64,
        order_price: f64,
        order_size: f64,
    ) -> Result<bool> {
        let Some(target_idx) = self.book.find_filled_entry(symbol_idx, target_entry) else {
            warn!(
                symbol = %self.spec(symbol_idx).name,
                exit_name,
                target_entry,
                "LIT exit refused: no open position under the target entry name"
            );
            return Ok(false);
        };
        let side = self.book.filled_entries[symbol_idx][target_idx]
            .entry_direction
            .flipped();
        if !price_is_valid(touch_price) {
            warn!(
                symbol = %self.spec(symbol_idx).name,
                exit_name,
                touch_price,
                "LIT exit refused: invalid touch price"
            );
            return Ok(false);
        }
        if let Err(message) = validate_exit_size(order_size, self.spec(symbol_idx)) {
            warn!(symbol = %self.spec(symbol_idx).name, exit_name, %message, "LIT exit refused");
            return Ok(false);
        }
        if let Err(message) = validate_limit_price(order_price, touch_price, side) {
            warn!(symbol = %self.spec(symbol_idx).name, exit_name, %message, "LIT exit refused");
            return Ok(false);
        }

        self.cancel_and_reorder_exit(symbol_idx, exit_name);

        let order = self.build_pending_exit(
            symbol_idx,
            target_idx,
            exit_name,
            OrderType::Lit,
            order_size,
        );
        let order = Order {
            exit_touch_price: touch_price,
            exit_touch_direction: touch_direction_for(OrderType::Lit, side),
            exit_order_price: order_price,
            ..order
        };
        self.book.pending_exits[symbol_idx].push(order);
        Ok(true)
    }

    /// Trailing exit. A zero touch price starts tracking immediately from
    /// the next trading bar's open.
    pub fn place_trailing_exit(
        &mut self,
        symbol_idx: usize,
        exit_name: &str,
        target_entry: &str,
        touch_price: f64,
        trail_point: f64,
        order_size: f64,
    ) -> Result<bool> {
        let Some(target_idx) = self.book.find_filled_entry(symbol_idx, target_entry) else {
            warn!(
                symbol = %self.spec(symbol_idx).name,
                exit_name,
                target_entry,
                "trailing exit refused: no open position under the target entry name"
            );
            return Ok(false);
        };
        if is_less(touch_price, 0.0) || touch_price.is_nan() {
            warn!(
                symbol = %self.spec(symbol_idx).name,
                exit_name,
                touch_price,
                "trailing exit refused: invalid touch price"
            );
            return Ok(false);
        }
        if !price_is_valid(trail_point) {
            warn!(
                symbol = %self.spec(symbol_idx).name,
                exit_name,
                trail_point,
                "trailing exit refused: trail point must be positive"
            );
            return Ok(false);
        }
        if let Err(message) = validate_exit_size(order_size, self.spec(symbol_idx)) {
            warn!(symbol = %self.spec(symbol_idx).name, exit_name, %message, "trailing exit refused");
            return Ok(false);
        }

        let anchor = if touch_price == 0.0 {
            match self.next_trading_open(symbol_idx) {
                Some((_, next_open)) => Some(next_open),
                None => {
                    warn!(
                        symbol = %self.spec(symbol_idx).name,
                        exit_name,
                        "trailing exit refused: no next bar to anchor tracking at"
                    );
                    return Ok(false);
                }
            }
        } else {
            None
        };

        self.cancel_and_reorder_exit(symbol_idx, exit_name);

        let side = self.book.filled_entries[symbol_idx][target_idx]
            .entry_direction
            .flipped();
        let order = self.build_pending_exit(
            symbol_idx,
            target_idx,
            exit_name,
            OrderType::Trailing,
            order_size,
        );
        let mut order = Order {
            exit_touch_price: touch_price,
            exit_touch_direction: touch_direction_for(OrderType::Trailing, side),
            exit_trail_point: trail_point,
            ..order
        };
        if let Some(anchor) = anchor {
            order.exit_touched = true;
            order.exit_extreme_price = anchor;
        }
        self.book.pending_exits[symbol_idx].push(order);
        Ok(true)
    }

    /// Cancel a pending order by name across the requested scope.
    pub fn cancel(&mut self, symbol_idx: usize, name: &str, kind: CancelKind, reason: &str) {
        self.book.cancel(symbol_idx, name, kind, reason, self.ledger);
    }

    /// Cancel every pending order of the symbol.
    pub fn cancel_all(&mut self, symbol_idx: usize, reason: &str) {
        self.book.cancel_all(symbol_idx, reason, self.ledger);
    }

    /// Market-exit every open position of the symbol at the next trading
    /// bar's open.
    pub fn close_all(&mut self, symbol_idx: usize) -> Result<bool> {
        let targets: Vec<String> = self.book.filled_entries[symbol_idx]
            .iter()
            .map(|entry| entry.entry_name.clone())
            .collect();
        let mut all_ok = true;
        for (ordinal, target) in targets.iter().enumerate() {
            let exit_name = format!("Close All {}", ordinal + 1);
            all_ok &= self.place_market_exit(symbol_idx, &exit_name, target, FULL_SIZE)?;
        }
        Ok(all_ok)
    }

    // ── Internals ─────────────────────────────────────────────────────

    /// Next trading bar's (open_time, open); `None` on the last bar.
    fn next_trading_open(&self, symbol_idx: usize) -> Option<(i64, f64)> {
        let cursor = self.bars.cursor(StreamKind::Trading, symbol_idx);
        self.bars
            .get(StreamKind::Trading, symbol_idx, cursor + 1)
            .ok()
            .map(|bar| (bar.open_time, bar.open))
    }

    fn cancel_and_reorder_entry(&mut self, symbol_idx: usize, entry_name: &str) {
        if self.book.find_pending_entry(symbol_idx, entry_name).is_some() {
            debug!(name = entry_name, "same-name pending entry cancelled for reorder");
            self.book.cancel(
                symbol_idx,
                entry_name,
                CancelKind::Entry,
                "re-ordered under the same entry name",
                self.ledger,
            );
        }
    }

    fn cancel_and_reorder_exit(&mut self, symbol_idx: usize, exit_name: &str) {
        if self.book.find_pending_exit(symbol_idx, exit_name).is_some() {
            debug!(name = exit_name, "same-name pending exit cancelled for reorder");
            self.book.cancel(
                symbol_idx,
                exit_name,
                CancelKind::Exit,
                "re-ordered under the same exit name",
                self.ledger,
            );
        }
    }

    /// Pending exit skeleton copying the target entry's identity.
    fn build_pending_exit(
        &mut self,
        symbol_idx: usize,
        target_idx: usize,
        exit_name: &str,
        exit_order_type: OrderType,
        order_size: f64,
    ) -> Order {
        let id = self.book.alloc_order_id();
        let target = &self.book.filled_entries[symbol_idx][target_idx];
        let exit_direction = target.entry_direction.flipped();
        Order {
            id,
            leverage: target.leverage,
            entry_name: target.entry_name.clone(),
            entry_direction: target.entry_direction,
            exit_name: exit_name.to_string(),
            exit_order_type,
            exit_direction,
            exit_order_size: order_size,
            ..Order::default()
        }
    }

    /// Shared entry-placement validation: size domain, step multiple,
    /// type-specific quantity limits, leverage bracket and min notional at
    /// the anchor price, optional limit-price side check.
    fn validate_entry_order(
        &self,
        symbol_idx: usize,
        order_type: OrderType,
        order_size: f64,
        anchor_price: f64,
        limit_check: Option<(f64, f64, Direction)>,
    ) -> std::result::Result<(), String> {
        let spec = self.spec(symbol_idx);

        if !price_is_valid(anchor_price) {
            return Err(format!("order price [{anchor_price}] must be positive"));
        }

        validate_size_domain(order_size, spec)?;

        match order_type {
            OrderType::Market | OrderType::Mit | OrderType::Trailing => {
                if self.config.check_market_max_qty
                    && is_greater(order_size, spec.market_max_qty)
                {
                    return Err(format!(
                        "order size [{order_size}] exceeds the market max qty [{}]",
                        spec.market_max_qty
                    ));
                }
                if self.config.check_market_min_qty && is_less(order_size, spec.market_min_qty) {
                    return Err(format!(
                        "order size [{order_size}] is under the market min qty [{}]",
                        spec.market_min_qty
                    ));
                }
            }
            OrderType::Limit | OrderType::Lit => {
                if self.config.check_limit_max_qty && is_greater(order_size, spec.limit_max_qty) {
                    return Err(format!(
                        "order size [{order_size}] exceeds the limit max qty [{}]",
                        spec.limit_max_qty
                    ));
                }
                if self.config.check_limit_min_qty && is_less(order_size, spec.limit_min_qty) {
                    return Err(format!(
                        "order size [{order_size}] is under the limit min qty [{}]",
                        spec.limit_min_qty
                    ));
                }
            }
        }

        let notional = anchor_price * order_size;
        if self.config.check_min_notional_value && is_less(notional, spec.min_notional_value) {
            return Err(format!(
                "notional value [{notional}] is under the min notional [{}]",
                spec.min_notional_value
            ));
        }

        let leverage = self.book.leverage[symbol_idx];
        let bracket = spec
            .leverage_bracket(notional)
            .map_err(|e| e.to_string())?;
        if leverage > bracket.max_leverage {
            return Err(format!(
                "leverage [{leverage}x] exceeds the bracket max [{}x] for notional [{notional}]",
                bracket.max_leverage
            ));
        }

        if let Some((limit_price, base_price, direction)) = limit_check {
            validate_limit_price(limit_price, base_price, direction)?;
        }

        Ok(())
    }
}

fn price_is_valid(price: f64) -> bool {
    price.is_finite() && is_greater(price, 0.0)
}

fn validate_size_domain(order_size: f64, spec: &SymbolSpec) -> std::result::Result<(), String> {
    if !order_size.is_finite() || is_less_or_equal(order_size, 0.0) {
        return Err(format!("order size [{order_size}] must be positive"));
    }
    if is_diff(round_to_step(order_size, spec.qty_step), order_size) {
        return Err(format!(
            "order size [{order_size}] must be a multiple of the qty step [{}]",
            spec.qty_step
        ));
    }
    Ok(())
}

/// Exit sizes: the FULL_SIZE sentinel always passes; explicit sizes must be
/// positive step multiples (limits are clipped at fill, not rejected).
fn validate_exit_size(order_size: f64, spec: &SymbolSpec) -> std::result::Result<(), String> {
    if order_size >= FULL_SIZE {
        return Ok(());
    }
    validate_size_domain(order_size, spec)
}

/// A resting buy must sit below its base price, a resting sell above it.
fn validate_limit_price(
    limit_price: f64,
    base_price: f64,
    side: Direction,
) -> std::result::Result<(), String> {
    if !price_is_valid(limit_price) {
        return Err(format!("limit price [{limit_price}] must be positive"));
    }
    match side {
        Direction::Long if is_greater_or_equal(limit_price, base_price) => Err(format!(
            "buy limit [{limit_price}] must be below the base price [{base_price}]"
        )),
        Direction::Short if is_less_or_equal(limit_price, base_price) => Err(format!(
            "sell limit [{limit_price}] must be above the base price [{base_price}]"
        )),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn touch_reached_from_either_side() {
        assert!(touch_triggered(Direction::Long, 101.0, 100.0));
        assert!(!touch_triggered(Direction::Long, 99.0, 100.0));
        assert!(touch_triggered(Direction::Short, 99.0, 100.0));
        assert!(!touch_triggered(Direction::Short, 101.0, 100.0));
        assert!(touch_triggered(Direction::Long, 100.0, 100.0));
    }

    #[test]
    fn limit_trigger_sides() {
        assert!(limit_triggered(Direction::Long, 97.9, 98.0));
        assert!(limit_triggered(Direction::Long, 98.0, 98.0));
        assert!(!limit_triggered(Direction::Long, 98.1, 98.0));
        assert!(limit_triggered(Direction::Short, 102.1, 102.0));
        assert!(!limit_triggered(Direction::Short, 101.9, 102.0));
    }

    #[test]
    fn favorable_gap_fills_at_open() {
        // Long limit at 98, bar opens at 95: fill at 95, not 98.
        assert_eq!(
            limit_fill_price(Direction::Long, 95.0, PriceKind::Open, 98.0),
            95.0
        );
        // Same gap on a non-open event fills at the limit.
        assert_eq!(
            limit_fill_price(Direction::Long, 95.0, PriceKind::Low, 98.0),
            98.0
        );
        // Unfavorable side fills at the limit.
        assert_eq!(
            limit_fill_price(Direction::Long, 98.0, PriceKind::Open, 98.0),
            98.0
        );
        // Short mirror.
        assert_eq!(
            limit_fill_price(Direction::Short, 105.0, PriceKind::Open, 102.0),
            105.0
        );
    }

    #[test]
    fn trailing_sell_side_follows_s4_sequence() {
        // touch 100, trail 2; prices 98 -> 99 -> 101 -> 103 -> 102 -> 100.99.
        // Sell side: touch on a rise to 100, track the high, fire on a
        // 2-point drop from it.
        let side = Direction::Short;
        let touch_direction = Direction::Long;
        let mut touched = false;
        let mut extreme = f64::NAN;
        let mut fired_at = None;

        for price in [98.0, 99.0, 101.0, 103.0, 102.0, 100.99] {
            if !touched {
                if touch_triggered(touch_direction, price, 100.0) {
                    touched = true;
                    extreme = price;
                } else {
                    continue;
                }
            }
            extreme = updated_extreme(side, extreme, price);
            if trailing_fired(side, price, extreme, 2.0) {
                fired_at = Some(price);
                break;
            }
        }

        assert_eq!(fired_at, Some(100.99));
        assert_eq!(extreme, 103.0);
    }

    #[test]
    fn trailing_buy_side_mirrors() {
        // Buy side: touch on a fall to 100, track the low, fire on a
        // 2-point bounce from it.
        let side = Direction::Long;
        let touch_direction = Direction::Short;
        let mut touched = false;
        let mut extreme = f64::NAN;
        let mut fired_at = None;

        for price in [102.0, 101.0, 99.0, 97.0, 98.0, 99.01] {
            if !touched {
                if touch_triggered(touch_direction, price, 100.0) {
                    touched = true;
                    extreme = price;
                } else {
                    continue;
                }
            }
            extreme = updated_extreme(side, extreme, price);
            if trailing_fired(side, price, extreme, 2.0) {
                fired_at = Some(price);
                break;
            }
        }

        assert_eq!(fired_at, Some(99.01));
        assert_eq!(extreme, 97.0);
    }

    #[test]
    fn touch_direction_by_order_type() {
        assert_eq!(
            touch_direction_for(OrderType::Mit, Direction::Long),
            Direction::Long
        );
        assert_eq!(
            touch_direction_for(OrderType::Lit, Direction::Short),
            Direction::Short
        );
        assert_eq!(
            touch_direction_for(OrderType::Trailing, Direction::Long),
            Direction::Short
        );
    }

    #[test]
    fn limit_price_side_validation() {
        assert!(validate_limit_price(98.0, 100.0, Direction::Long).is_ok());
        assert!(validate_limit_price(100.0, 100.0, Direction::Long).is_err());
        assert!(validate_limit_price(102.0, 100.0, Direction::Short).is_ok());
        assert!(validate_limit_price(99.0, 100.0, Direction::Short).is_err());
        assert!(validate_limit_price(f64::NAN, 100.0, Direction::Long).is_err());
    }
}
