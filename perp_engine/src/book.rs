/// book.rs — Per-symbol order queues and position bookkeeping
///
/// Pending and filled orders live in plain vectors scanned linearly (queue
/// lengths are tens at most) in FIFO insertion order, which is also the
/// final tie-break for simultaneous fills. Rules enforced here:
///
/// 1. One open position per (symbol, entry name); a second fill under the
///    same name is rejected upstream.
/// 2. Re-ordering a pending name cancels the old order first.
/// 3. A cancelled limit (or touched LIT) entry returns its reserved margin.
/// 4. Fully-closed entries drop out of the filled set together with every
///    sibling pending exit that targeted them.

use tracing::{info, warn};

use crate::ledger::AccountLedger;
use crate::numeric::is_greater;
use crate::order::{CancelKind, Direction, Order, OrderType};
use crate::symbol::SymbolSpec;

#[derive(Debug)]
pub struct OrderBook {
    pub pending_entries: Vec<Vec<Order>>,
    pub filled_entries: Vec<Vec<Order>>,
    pub pending_exits: Vec<Vec<Order>>,

    pub last_entry_bar_index: Vec<usize>,
    pub last_exit_bar_index: Vec<usize>,
    pub last_entry_price: Vec<f64>,
    pub last_exit_price: Vec<f64>,

    /// Current desired leverage per symbol; initial 1x.
    pub leverage: Vec<u32>,

    /// Single-shot flags feeding the after-chain.
    pub just_entered: bool,
    pub just_exited: bool,

    next_order_id: u64,
}

impl OrderBook {
    pub fn new(num_symbols: usize) -> Self {
        Self {
            pending_entries: vec![Vec::new(); num_symbols],
            filled_entries: vec![Vec::new(); num_symbols],
            pending_exits: vec![Vec::new(); num_symbols],
            last_entry_bar_index: vec![usize::MAX; num_symbols],
            last_exit_bar_index: vec![usize::MAX; num_symbols],
            last_entry_price: vec![f64::NAN; num_symbols],
            last_exit_price: vec![f64::NAN; num_symbols],
            leverage: vec![1; num_symbols],
            just_entered: false,
            just_exited: false,
            next_order_id: 1,
        }
    }

    pub fn alloc_order_id(&mut self) -> u64 {
        let id = self.next_order_id;
        self.next_order_id += 1;
        id
    }

    // ── Lookups ───────────────────────────────────────────────────────

    pub fn find_pending_entry(&self, symbol_idx: usize, entry_name: &str) -> Option<usize> {
        self.pending_entries[symbol_idx]
            .iter()
            .position(|order| order.entry_name == entry_name)
    }

    pub fn find_pending_exit(&self, symbol_idx: usize, exit_name: &str) -> Option<usize> {
        self.pending_exits[symbol_idx]
            .iter()
            .position(|order| order.exit_name == exit_name)
    }

    pub fn find_filled_entry(&self, symbol_idx: usize, entry_name: &str) -> Option<usize> {
        self.filled_entries[symbol_idx]
            .iter()
            .position(|order| order.entry_name == entry_name)
    }

    pub fn has_filled_entry(&self, symbol_idx: usize, entry_name: &str) -> bool {
        self.find_filled_entry(symbol_idx, entry_name).is_some()
    }

    /// Net position size of a symbol: remaining entry quantity summed with
    /// long positive, short negative.
    pub fn position_size(&self, symbol_idx: usize) -> f64 {
        self.filled_entries[symbol_idx]
            .iter()
            .map(|entry| entry.remaining_size().abs() * entry.entry_direction.sign())
            .sum()
    }

    /// Number of symbols holding at least one open position.
    pub fn open_symbol_count(&self) -> usize {
        self.filled_entries
            .iter()
            .filter(|entries| !entries.is_empty())
            .count()
    }

    // ── Cancellation ──────────────────────────────────────────────────

    /// Remove the first pending order matching `name` within the requested
    /// scope. Cancelling a reserved entry returns its margin first.
    pub fn cancel(
        &mut self,
        symbol_idx: usize,
        name: &str,
        kind: CancelKind,
        reason: &str,
        ledger: &mut AccountLedger,
    ) {
        if matches!(kind, CancelKind::Total | CancelKind::Entry) {
            if let Some(order_idx) = self.find_pending_entry(symbol_idx, name) {
                let order = self.pending_entries[symbol_idx].remove(order_idx);
                release_reserved_margin(&order, ledger);
                info!(
                    order_type = order.entry_order_type.label(),
                    name, reason, "pending entry cancelled"
                );
            }
        }

        if matches!(kind, CancelKind::Total | CancelKind::Exit) {
            if let Some(order_idx) = self.find_pending_exit(symbol_idx, name) {
                let order = self.pending_exits[symbol_idx].remove(order_idx);
                // Pending exits never reserve margin.
                info!(
                    order_type = order.exit_order_type.label(),
                    name, reason, "pending exit cancelled"
                );
            }
        }
    }

    /// Cancel every pending entry and exit of a symbol.
    pub fn cancel_all(&mut self, symbol_idx: usize, reason: &str, ledger: &mut AccountLedger) {
        for order in self.pending_entries[symbol_idx].drain(..) {
            release_reserved_margin(&order, ledger);
            info!(
                order_type = order.entry_order_type.label(),
                name = %order.entry_name,
                reason,
                "pending entry cancelled"
            );
        }
        for order in self.pending_exits[symbol_idx].drain(..) {
            info!(
                order_type = order.exit_order_type.label(),
                name = %order.exit_name,
                reason,
                "pending exit cancelled"
            );
        }
    }

    /// Drop every pending exit targeting a fully-closed entry.
    pub fn cancel_sibling_exits(&mut self, symbol_idx: usize, target_entry: &str) {
        self.pending_exits[symbol_idx].retain(|pending| {
            if pending.entry_name == target_entry {
                info!(
                    name = %pending.exit_name,
                    target_entry,
                    "pending exit cancelled (target entry fully closed)"
                );
                false
            } else {
                true
            }
        });
    }

    // ── Leverage ──────────────────────────────────────────────────────

    /// Change a symbol's leverage. Rejected while a position is open.
    /// Every pending entry is re-validated: orders whose notional no longer
    /// fits the new leverage's bracket are cancelled, and reserved margins
    /// are recomputed (cancelling again if the new margin cannot be funded).
    /// `unrealized_loss` is the current open-loss reserve of the symbol,
    /// included in recomputed margins.
    pub fn adjust_leverage(
        &mut self,
        new_leverage: u32,
        symbol_idx: usize,
        spec: &SymbolSpec,
        ledger: &mut AccountLedger,
        unrealized_loss: f64,
    ) -> bool {
        let current = self.leverage[symbol_idx];
        if current == new_leverage {
            return true;
        }

        if !self.filled_entries[symbol_idx].is_empty() {
            warn!(
                symbol = %spec.name,
                current, new_leverage, "leverage change rejected while a position is open"
            );
            return false;
        }

        self.leverage[symbol_idx] = new_leverage;
        info!(symbol = %spec.name, from = current, to = new_leverage, "leverage changed");

        // Reverse iteration: re-validation may cancel the current order.
        for order_idx in (0..self.pending_entries[symbol_idx].len()).rev() {
            let order = &self.pending_entries[symbol_idx][order_idx];
            let anchor_price = pending_entry_anchor_price(order);
            let order_size = order.entry_order_size;
            let name = order.entry_name.clone();

            let notional = anchor_price * order_size;
            let bracket_leverage = match spec.leverage_bracket(notional) {
                Ok(bracket) => bracket.max_leverage,
                Err(_) => {
                    self.cancel(
                        symbol_idx,
                        &name,
                        CancelKind::Entry,
                        "no leverage bracket covers the order's notional value",
                        ledger,
                    );
                    continue;
                }
            };

            if new_leverage > bracket_leverage {
                warn!(
                    symbol = %spec.name,
                    name = %name,
                    new_leverage,
                    bracket_leverage,
                    "pending entry no longer valid at the new leverage"
                );
                self.cancel(
                    symbol_idx,
                    &name,
                    CancelKind::Entry,
                    "notional value exceeds the new leverage's bracket",
                    ledger,
                );
                continue;
            }

            // Reserved margin (limit / touched LIT) resizes with leverage.
            let old_margin = self.pending_entries[symbol_idx][order_idx].entry_margin;
            if is_greater(old_margin, 0.0) {
                let order_price = self.pending_entries[symbol_idx][order_idx].entry_order_price;
                let updated_margin =
                    order_price * order_size / new_leverage as f64 + unrealized_loss;

                ledger.decrease_used_margin(old_margin);

                if is_greater(updated_margin, ledger.available_balance()) {
                    warn!(
                        symbol = %spec.name,
                        name = %name,
                        updated_margin,
                        available = ledger.available_balance(),
                        "recomputed entry margin cannot be funded"
                    );
                    // Margin already released above; zero it so cancel does
                    // not release it twice.
                    self.pending_entries[symbol_idx][order_idx].entry_margin = 0.0;
                    self.cancel(
                        symbol_idx,
                        &name,
                        CancelKind::Entry,
                        "available balance cannot fund the recomputed entry margin",
                        ledger,
                    );
                    continue;
                }

                if ledger.increase_used_margin(updated_margin).is_err() {
                    self.pending_entries[symbol_idx][order_idx].entry_margin = 0.0;
                    self.cancel(
                        symbol_idx,
                        &name,
                        CancelKind::Entry,
                        "wallet balance cannot hold the recomputed entry margin",
                        ledger,
                    );
                    continue;
                }

                let order = &mut self.pending_entries[symbol_idx][order_idx];
                order.entry_margin = updated_margin;
                order.left_margin = updated_margin;
            }

            self.pending_entries[symbol_idx][order_idx].leverage = new_leverage;
        }

        true
    }

    // ── Event recording ───────────────────────────────────────────────

    pub fn record_entry(&mut self, symbol_idx: usize, trading_bar_idx: usize, price: f64) {
        self.last_entry_bar_index[symbol_idx] = trading_bar_idx;
        self.last_entry_price[symbol_idx] = price;
        self.just_entered = true;
    }

    pub fn record_exit(&mut self, symbol_idx: usize, trading_bar_idx: usize, price: f64) {
        self.last_exit_bar_index[symbol_idx] = trading_bar_idx;
        self.last_exit_price[symbol_idx] = price;
        self.just_exited = true;
    }
}

/// Margin reserved by a pending entry, if any: limit orders reserve at
/// placement, LIT orders reserve at touch, market-style orders never wait.
fn release_reserved_margin(order: &Order, ledger: &mut AccountLedger) {
    let reserved = match order.entry_order_type {
        OrderType::Limit => is_greater(order.entry_margin, 0.0),
        OrderType::Lit => order.entry_touched && is_greater(order.entry_margin, 0.0),
        OrderType::Market | OrderType::Mit | OrderType::Trailing => false,
    };
    if reserved {
        ledger.decrease_used_margin(order.entry_margin);
    }
}

/// Price at which a pending entry's notional is evaluated, by type.
/// Trailing uses its worst-case fire price.
fn pending_entry_anchor_price(order: &Order) -> f64 {
    match order.entry_order_type {
        OrderType::Market | OrderType::Limit | OrderType::Lit => order.entry_order_price,
        OrderType::Mit => order.entry_touch_price,
        OrderType::Trailing => {
            let start = if order.entry_extreme_price.is_nan() {
                order.entry_touch_price
            } else {
                order.entry_extreme_price
            };
            match order.entry_direction {
                Direction::Long => start + order.entry_trail_point,
                Direction::Short => start - order.entry_trail_point,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::numeric::is_equal;
    use crate::symbol::test_spec;

    fn limit_entry(book: &mut OrderBook, name: &str, price: f64, size: f64, margin: f64) -> Order {
        Order {
            id: book.alloc_order_id(),
            entry_name: name.to_string(),
            entry_order_type: OrderType::Limit,
            entry_direction: Direction::Long,
            entry_order_price: price,
            entry_order_size: size,
            entry_margin: margin,
            left_margin: margin,
            ..Order::default()
        }
    }

    #[test]
    fn cancel_limit_entry_releases_margin() {
        let mut book = OrderBook::new(1);
        let mut ledger = AccountLedger::new(1_000.0);
        ledger.increase_used_margin(100.0).unwrap();

        let order = limit_entry(&mut book, "L", 100.0, 1.0, 100.0);
        book.pending_entries[0].push(order);

        book.cancel(0, "L", CancelKind::Entry, "test", &mut ledger);
        assert!(book.pending_entries[0].is_empty());
        assert!(is_equal(ledger.used_margin(), 0.0));
    }

    #[test]
    fn cancel_untouched_lit_releases_nothing() {
        let mut book = OrderBook::new(1);
        let mut ledger = AccountLedger::new(1_000.0);
        ledger.increase_used_margin(50.0).unwrap();

        let order = Order {
            id: book.alloc_order_id(),
            entry_name: "L".to_string(),
            entry_order_type: OrderType::Lit,
            entry_touched: false,
            entry_margin: 0.0,
            ..Order::default()
        };
        book.pending_entries[0].push(order);

        book.cancel(0, "L", CancelKind::Entry, "test", &mut ledger);
        assert!(is_equal(ledger.used_margin(), 50.0));
    }

    #[test]
    fn position_size_signs_by_direction() {
        let mut book = OrderBook::new(1);
        book.filled_entries[0].push(Order {
            entry_direction: Direction::Long,
            entry_filled_size: 2.0,
            exit_filled_size: 0.5,
            ..Order::default()
        });
        book.filled_entries[0].push(Order {
            entry_name: "S".to_string(),
            entry_direction: Direction::Short,
            entry_filled_size: 1.0,
            exit_filled_size: 0.0,
            ..Order::default()
        });
        assert!(is_equal(book.position_size(0), 0.5));
    }

    #[test]
    fn adjust_leverage_rejected_with_open_position() {
        let mut book = OrderBook::new(1);
        let mut ledger = AccountLedger::new(1_000.0);
        book.filled_entries[0].push(Order {
            entry_filled_size: 1.0,
            ..Order::default()
        });

        let spec = test_spec("BTCUSDT");
        assert!(!book.adjust_leverage(5, 0, &spec, &mut ledger, 0.0));
        assert_eq!(book.leverage[0], 1);
    }

    #[test]
    fn adjust_leverage_cancels_over_bracket_orders() {
        let mut book = OrderBook::new(1);
        let mut ledger = AccountLedger::new(10_000_000.0);

        // Notional 2M sits in the 20x bracket of the test spec.
        let order = limit_entry(&mut book, "BIG", 2_000.0, 1_000.0, 0.0);
        book.pending_entries[0].push(order);

        let spec = test_spec("BTCUSDT");
        assert!(book.adjust_leverage(50, 0, &spec, &mut ledger, 0.0));
        assert!(book.pending_entries[0].is_empty());
    }

    #[test]
    fn adjust_leverage_rescales_reserved_margin() {
        let mut book = OrderBook::new(1);
        let mut ledger = AccountLedger::new(1_000.0);
        ledger.increase_used_margin(100.0).unwrap();

        let order = limit_entry(&mut book, "L", 100.0, 1.0, 100.0);
        book.pending_entries[0].push(order);

        let spec = test_spec("BTCUSDT");
        assert!(book.adjust_leverage(4, 0, &spec, &mut ledger, 0.0));
        let order = &book.pending_entries[0][0];
        assert_eq!(order.leverage, 4);
        assert!(is_equal(order.entry_margin, 25.0));
        assert!(is_equal(ledger.used_margin(), 25.0));
    }

    #[test]
    fn sibling_exits_cancelled_on_full_close() {
        let mut book = OrderBook::new(1);
        book.pending_exits[0].push(Order {
            entry_name: "L".to_string(),
            exit_name: "X1".to_string(),
            ..Order::default()
        });
        book.pending_exits[0].push(Order {
            entry_name: "OTHER".to_string(),
            exit_name: "X2".to_string(),
            ..Order::default()
        });

        book.cancel_sibling_exits(0, "L");
        assert_eq!(book.pending_exits[0].len(), 1);
        assert_eq!(book.pending_exits[0][0].exit_name, "X2");
    }
}
