/// strategies.rs — Bundled example strategies
///
/// `SmaCross` is the reference implementation of the strategy API: a long
/// entry on the fast/slow SMA bullish cross, a trailing stop armed right
/// after the fill, and a full close on the bearish cross.

use perp_engine::strategy::{MarketCtx, Strategy};
use perp_engine::Direction;

pub struct SmaCross {
    fast_period: usize,
    slow_period: usize,
    /// Trailing distance as a fraction of the entry price.
    trail_fraction: f64,
    order_size: f64,
}

impl SmaCross {
    pub fn new(fast_period: usize, slow_period: usize, trail_fraction: f64, order_size: f64) -> Self {
        Self {
            fast_period,
            slow_period,
            trail_fraction,
            order_size,
        }
    }

    fn sma(ctx: &MarketCtx<'_, '_>, period: usize, offset: usize) -> f64 {
        let mut sum = 0.0;
        for lag in 0..period {
            let close = ctx.close(offset + lag);
            if close.is_nan() {
                return f64::NAN;
            }
            sum += close;
        }
        sum / period as f64
    }
}

impl Default for SmaCross {
    fn default() -> Self {
        Self::new(10, 20, 0.02, 0.01)
    }
}

impl Strategy for SmaCross {
    fn on_close(&mut self, ctx: &mut MarketCtx<'_, '_>) {
        let fast = Self::sma(ctx, self.fast_period, 0);
        let slow = Self::sma(ctx, self.slow_period, 0);
        let fast_prev = Self::sma(ctx, self.fast_period, 1);
        let slow_prev = Self::sma(ctx, self.slow_period, 1);
        if fast.is_nan() || slow.is_nan() || fast_prev.is_nan() || slow_prev.is_nan() {
            return;
        }

        let crossed_up = fast_prev <= slow_prev && fast > slow;
        let crossed_down = fast_prev >= slow_prev && fast < slow;

        if crossed_up && ctx.position_size() == 0.0 {
            ctx.market_entry("SMA Long", Direction::Long, self.order_size);
        } else if crossed_down && ctx.position_size() > 0.0 {
            ctx.close_all();
        }
    }

    fn after_entry(&mut self, ctx: &mut MarketCtx<'_, '_>) {
        if !ctx.has_filled_entry("SMA Long") {
            return;
        }
        let entry_price = ctx.last_entry_price();
        if entry_price.is_nan() {
            return;
        }
        // Arm the protective trail immediately; tracking starts right away.
        ctx.trailing_exit(
            "SMA Trail",
            "SMA Long",
            0.0,
            entry_price * self.trail_fraction,
            ctx.full_size(),
        );
    }
}
