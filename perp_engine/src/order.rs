/// order.rs — The unified order record
///
/// One `Order` carries both the entry and the exit half of a trade: a closed
/// trade is one record whose two sides were filled at different times.
/// Pending exits are separate records cloned from their target entry with
/// the exit side populated; partial exit fills accumulate on the target
/// entry's `exit_filled_size`.
///
/// Unset numeric fields are NaN (prices/sizes) or -1 (times), matching how
/// the trigger predicates treat "not yet touched" state.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    pub fn flipped(self) -> Self {
        match self {
            Direction::Long => Direction::Short,
            Direction::Short => Direction::Long,
        }
    }

    pub fn sign(self) -> f64 {
        match self {
            Direction::Long => 1.0,
            Direction::Short => -1.0,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Direction::Long => "long",
            Direction::Short => "short",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
    /// Market-if-touched: waits for the touch price, then fills as market.
    Mit,
    /// Limit-if-touched: waits for the touch price, then rests as a limit.
    Lit,
    /// Tracks a running extreme after touch; fires as market on a
    /// trail-point reversal.
    Trailing,
}

impl OrderType {
    /// Taker orders cross the book; makers rest on it. Decides which fee and
    /// slippage rate applies.
    pub fn is_taker(self) -> bool {
        matches!(self, OrderType::Market | OrderType::Mit | OrderType::Trailing)
    }

    pub fn label(self) -> &'static str {
        match self {
            OrderType::Market => "market",
            OrderType::Limit => "limit",
            OrderType::Mit => "MIT",
            OrderType::Lit => "LIT",
            OrderType::Trailing => "trailing",
        }
    }
}

/// What kind of fill is being executed; also the tie-break priority for
/// simultaneous fills (liquidation first, then exits, then entries).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderSignal {
    Liquidation,
    Exit,
    Entry,
}

impl OrderSignal {
    pub fn priority(self) -> u8 {
        match self {
            OrderSignal::Liquidation => 1,
            OrderSignal::Exit => 2,
            OrderSignal::Entry => 3,
        }
    }
}

/// Scope of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelKind {
    Total,
    Entry,
    Exit,
}

/// The four intra-bar price events, visited in queue order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriceKind {
    Open,
    High,
    Low,
    Close,
}

/// A fill detected at one price event, queued for ordered execution.
/// Orders are referenced by id, not index: the after-chain may cancel or
/// replace pending orders between fills of the same event.
#[derive(Debug, Clone, Copy)]
pub struct FillInfo {
    pub order_id: u64,
    pub signal: OrderSignal,
    /// Trigger price before slippage.
    pub fill_price: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: u64,
    pub leverage: u32,
    pub liquidation_price: f64,

    // ── Entry side ────────────────────────────────────────────────────
    pub entry_name: String,
    pub entry_order_type: OrderType,
    pub entry_direction: Direction,

    // Waiting state for MIT / LIT / Trailing entries
    pub entry_touch_price: f64,
    pub entry_touch_direction: Direction,
    pub entry_touched: bool,
    pub entry_extreme_price: f64,
    pub entry_trail_point: f64,

    pub entry_order_time: i64,
    pub entry_order_size: f64,
    pub entry_order_price: f64,

    pub entry_filled_time: i64,
    pub entry_filled_size: f64,
    pub entry_filled_price: f64,

    /// Margin locked against this entry; `left_margin` shrinks with
    /// partial exits.
    pub entry_margin: f64,
    pub left_margin: f64,
    pub entry_fee: f64,
    /// Wallet balance at entry-order time, for the per-trade pnl%.
    pub wallet_balance_at_order: f64,

    // ── Exit side ─────────────────────────────────────────────────────
    pub exit_name: String,
    pub exit_order_type: OrderType,
    pub exit_direction: Direction,

    pub exit_touch_price: f64,
    pub exit_touch_direction: Direction,
    pub exit_touched: bool,
    pub exit_extreme_price: f64,
    pub exit_trail_point: f64,

    pub exit_order_time: i64,
    pub exit_order_size: f64,
    pub exit_order_price: f64,

    pub exit_filled_time: i64,
    /// Cumulative across partial exits when carried on a filled entry.
    pub exit_filled_size: f64,
    pub exit_filled_price: f64,

    pub exit_fee: f64,
    pub liquidation_fee: f64,
    /// Number of exit fills so far; partial exits of one entry share one
    /// trade number but keep their own ordinal.
    pub exit_count: u32,

    // ── Funding accrual (on filled entries) ───────────────────────────
    pub received_funding_count: u32,
    pub received_funding_amount: f64,
    pub paid_funding_count: u32,
    pub paid_funding_amount: f64,

    /// Trade number assigned at the first exit fill; partial exits share it.
    pub trade_number: Option<u32>,
}

impl Default for Order {
    fn default() -> Self {
        Self {
            id: 0,
            leverage: 1,
            liquidation_price: f64::NAN,

            entry_name: String::new(),
            entry_order_type: OrderType::Market,
            entry_direction: Direction::Long,
            entry_touch_price: f64::NAN,
            entry_touch_direction: Direction::Long,
            entry_touched: false,
            entry_extreme_price: f64::NAN,
            entry_trail_point: f64::NAN,
            entry_order_time: -1,
            entry_order_size: f64::NAN,
            entry_order_price: f64::NAN,
            entry_filled_time: -1,
            entry_filled_size: f64::NAN,
            entry_filled_price: f64::NAN,
            entry_margin: 0.0,
            left_margin: 0.0,
            entry_fee: 0.0,
            wallet_balance_at_order: f64::NAN,

            exit_name: String::new(),
            exit_order_type: OrderType::Market,
            exit_direction: Direction::Short,
            exit_touch_price: f64::NAN,
            exit_touch_direction: Direction::Long,
            exit_touched: false,
            exit_extreme_price: f64::NAN,
            exit_trail_point: f64::NAN,
            exit_order_time: -1,
            exit_order_size: f64::NAN,
            exit_order_price: f64::NAN,
            exit_filled_time: -1,
            exit_filled_size: 0.0,
            exit_filled_price: f64::NAN,
            exit_fee: 0.0,
            liquidation_fee: 0.0,
            exit_count: 0,

            received_funding_count: 0,
            received_funding_amount: 0.0,
            paid_funding_count: 0,
            paid_funding_amount: 0.0,

            trade_number: None,
        }
    }
}

impl Order {
    /// Entry quantity still open (entry fill minus cumulative exit fills).
    pub fn remaining_size(&self) -> f64 {
        self.entry_filled_size - self.exit_filled_size
    }

    /// Signed pnl of closing `size` at `base_price` against the entry fill.
    pub fn pnl_at(&self, base_price: f64, size: f64) -> f64 {
        match self.entry_direction {
            Direction::Long => (base_price - self.entry_filled_price) * size,
            Direction::Short => (self.entry_filled_price - base_price) * size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remaining_size_tracks_partial_exits() {
        let order = Order {
            entry_filled_size: 2.0,
            exit_filled_size: 0.5,
            ..Order::default()
        };
        assert_eq!(order.remaining_size(), 1.5);
    }

    #[test]
    fn pnl_sign_follows_direction() {
        let long = Order {
            entry_direction: Direction::Long,
            entry_filled_price: 100.0,
            ..Order::default()
        };
        assert_eq!(long.pnl_at(110.0, 2.0), 20.0);
        assert_eq!(long.pnl_at(90.0, 2.0), -20.0);

        let short = Order {
            entry_direction: Direction::Short,
            entry_filled_price: 100.0,
            ..Order::default()
        };
        assert_eq!(short.pnl_at(110.0, 2.0), -20.0);
        assert_eq!(short.pnl_at(90.0, 2.0), 20.0);
    }

    #[test]
    fn taker_maker_split() {
        assert!(OrderType::Market.is_taker());
        assert!(OrderType::Mit.is_taker());
        assert!(OrderType::Trailing.is_taker());
        assert!(!OrderType::Limit.is_taker());
        assert!(!OrderType::Lit.is_taker());
    }

    #[test]
    fn signal_priority_order() {
        assert!(OrderSignal::Liquidation.priority() < OrderSignal::Exit.priority());
        assert!(OrderSignal::Exit.priority() < OrderSignal::Entry.priority());
    }
}
