/// trade.rs — Closed-trade records
///
/// One record per exit fill. Partial exits of the same entry share a trade
/// number (assigned at the entry's first exit) and carry their own ordinal
/// in `exit_count`. Wallet and drawdown fields snapshot the ledger right
/// after the fill, so the trade list doubles as an equity timeline.

use serde::Serialize;

use crate::ledger::AccountLedger;
use crate::order::Direction;
use crate::timeutil::{format_time_diff, timestamp_to_datetime};

#[derive(Debug, Clone, Serialize)]
pub struct ClosedTrade {
    pub trade_number: u32,
    pub symbol_name: String,
    pub entry_name: String,
    pub exit_name: String,
    pub entry_direction: Direction,

    pub entry_time: String,
    pub exit_time: String,
    pub holding_time: String,

    pub leverage: u32,
    pub entry_price: f64,
    pub entry_size: f64,
    pub exit_price: f64,
    pub exit_size: f64,
    /// NaN unless the position was force-closed.
    pub liquidation_price: f64,

    pub received_funding_count: u32,
    pub received_funding_amount: f64,
    pub paid_funding_count: u32,
    pub paid_funding_amount: f64,

    pub entry_fee: f64,
    pub exit_fee: f64,
    pub liquidation_fee: f64,

    pub pnl: f64,
    pub net_pnl: f64,
    /// Net pnl over the margin backing this exit's share of the entry.
    pub individual_pnl_pct: f64,
    /// Net pnl over the wallet balance at entry-order time.
    pub total_pnl_pct: f64,

    pub wallet_balance: f64,
    pub max_wallet_balance: f64,
    pub drawdown: f64,
    pub max_drawdown: f64,
    pub cumulative_pnl: f64,
    pub cumulative_pnl_pct: f64,

    /// Symbols holding an open position right after this exit.
    pub open_symbol_count: usize,
}

/// Inputs `TradeLog::add` needs beyond what it can derive itself.
#[derive(Debug, Clone)]
pub struct TradeEvent {
    pub trade_number: u32,
    pub symbol_name: String,
    pub entry_name: String,
    pub exit_name: String,
    pub entry_direction: Direction,
    pub entry_filled_time: i64,
    pub exit_filled_time: i64,
    pub leverage: u32,
    pub entry_price: f64,
    pub entry_size: f64,
    pub exit_price: f64,
    pub exit_size: f64,
    pub liquidation_price: f64,
    pub received_funding_count: u32,
    pub received_funding_amount: f64,
    pub paid_funding_count: u32,
    pub paid_funding_amount: f64,
    pub entry_fee: f64,
    pub exit_fee: f64,
    pub liquidation_fee: f64,
    pub pnl: f64,
    pub entry_margin_share: f64,
    pub wallet_balance_at_order: f64,
    pub open_symbol_count: usize,
}

#[derive(Debug, Default)]
pub struct TradeLog {
    trades: Vec<ClosedTrade>,
    next_trade_number: u32,
    initial_balance: f64,
}

impl TradeLog {
    pub fn new(initial_balance: f64) -> Self {
        Self {
            trades: Vec::new(),
            next_trade_number: 1,
            initial_balance,
        }
    }

    pub fn trades(&self) -> &[ClosedTrade] {
        &self.trades
    }

    pub fn len(&self) -> usize {
        self.trades.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trades.is_empty()
    }

    /// Allocate the next trade number (first exit of an entry).
    pub fn alloc_trade_number(&mut self) -> u32 {
        let number = self.next_trade_number;
        self.next_trade_number += 1;
        number
    }

    /// Append the record for one exit fill, snapshotting the ledger.
    pub fn add(&mut self, event: TradeEvent, ledger: &AccountLedger) {
        let net_pnl = event.pnl - event.entry_fee - event.exit_fee - event.liquidation_fee
            + event.received_funding_amount
            - event.paid_funding_amount;

        let individual_pnl_pct = if event.entry_margin_share > 0.0 {
            net_pnl / event.entry_margin_share * 100.0
        } else {
            f64::NAN
        };
        let total_pnl_pct = if event.wallet_balance_at_order > 0.0 {
            net_pnl / event.wallet_balance_at_order * 100.0
        } else {
            f64::NAN
        };

        let cumulative_pnl = ledger.wallet_balance() - self.initial_balance;

        self.trades.push(ClosedTrade {
            trade_number: event.trade_number,
            symbol_name: event.symbol_name,
            entry_name: event.entry_name,
            exit_name: event.exit_name,
            entry_direction: event.entry_direction,
            entry_time: timestamp_to_datetime(event.entry_filled_time),
            exit_time: timestamp_to_datetime(event.exit_filled_time),
            holding_time: format_time_diff(
                (event.exit_filled_time - event.entry_filled_time).max(0),
            ),
            leverage: event.leverage,
            entry_price: event.entry_price,
            entry_size: event.entry_size,
            exit_price: event.exit_price,
            exit_size: event.exit_size,
            liquidation_price: event.liquidation_price,
            received_funding_count: event.received_funding_count,
            received_funding_amount: event.received_funding_amount,
            paid_funding_count: event.paid_funding_count,
            paid_funding_amount: event.paid_funding_amount,
            entry_fee: event.entry_fee,
            exit_fee: event.exit_fee,
            liquidation_fee: event.liquidation_fee,
            pnl: event.pnl,
            net_pnl,
            individual_pnl_pct,
            total_pnl_pct,
            wallet_balance: ledger.wallet_balance(),
            max_wallet_balance: ledger.max_wallet_balance(),
            drawdown: ledger.drawdown(),
            max_drawdown: ledger.max_drawdown(),
            cumulative_pnl,
            cumulative_pnl_pct: cumulative_pnl / self.initial_balance * 100.0,
            open_symbol_count: event.open_symbol_count,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::numeric::is_equal;

    fn event(number: u32, pnl: f64) -> TradeEvent {
        TradeEvent {
            trade_number: number,
            symbol_name: "BTCUSDT".to_string(),
            entry_name: "L".to_string(),
            exit_name: "X".to_string(),
            entry_direction: Direction::Long,
            entry_filled_time: 0,
            exit_filled_time: 60_000,
            leverage: 1,
            entry_price: 100.0,
            entry_size: 1.0,
            exit_price: 104.0,
            exit_size: 1.0,
            liquidation_price: f64::NAN,
            received_funding_count: 0,
            received_funding_amount: 0.0,
            paid_funding_count: 1,
            paid_funding_amount: 0.5,
            entry_fee: 0.1,
            exit_fee: 0.1,
            liquidation_fee: 0.0,
            pnl,
            entry_margin_share: 100.0,
            wallet_balance_at_order: 1_000.0,
            open_symbol_count: 0,
        }
    }

    #[test]
    fn net_pnl_subtracts_fees_and_funding() {
        let mut log = TradeLog::new(1_000.0);
        let mut ledger = AccountLedger::new(1_000.0);
        ledger.increase_wallet(3.3).unwrap();
        ledger.update_statistics();

        let number = log.alloc_trade_number();
        log.add(event(number, 4.0), &ledger);

        let trade = &log.trades()[0];
        // 4.0 − 0.1 − 0.1 − 0.5 funding
        assert!(is_equal(trade.net_pnl, 3.3));
        assert!(is_equal(trade.cumulative_pnl, 3.3));
        assert!(is_equal(trade.individual_pnl_pct, 3.3));
        assert_eq!(trade.trade_number, 1);
    }

    #[test]
    fn trade_numbers_increment() {
        let mut log = TradeLog::new(1_000.0);
        assert_eq!(log.alloc_trade_number(), 1);
        assert_eq!(log.alloc_trade_number(), 2);
    }

    #[test]
    fn holding_time_is_formatted() {
        let mut log = TradeLog::new(1_000.0);
        let ledger = AccountLedger::new(1_000.0);
        let number = log.alloc_trade_number();
        log.add(event(number, 0.0), &ledger);
        assert_eq!(log.trades()[0].holding_time, "1m 0s");
    }
}
