/// metrics.rs — Performance metrics over a finished run
///
/// ─────────────────────────────────────────────────────────────────────────
/// MATHEMATICAL SPECIFICATION
/// ─────────────────────────────────────────────────────────────────────────
///
/// SHARPE RATIO (annualised)
///   r̄  = mean(per-trade net returns)
///   σ_r = std(per-trade net returns)
///   SR  = r̄ / σ_r × √(trades per year)
///
/// SORTINO RATIO (annualised)
///   σ_d = √(mean(min(r_t, 0)²))   (downside deviation)
///   SoR = r̄ / σ_d × √(trades per year)
///
/// MAXIMUM DRAWDOWN
///   Equity curve: E_t; running peak: peak_t = max_{s ≤ t}(E_s)
///   MaxDD = min_t{(E_t − peak_t) / peak_t}   (most negative)
///
/// CALMAR RATIO
///   Calmar = total return / |MaxDD|
///
/// WIN RATE & PROFIT FACTOR
///   P_win = winners / trades
///   Profit Factor = Σ(positive net pnl) / |Σ(negative net pnl)|
/// ─────────────────────────────────────────────────────────────────────────

use crate::trade::ClosedTrade;

/// Complete backtest performance report.
#[derive(Debug, Clone)]
pub struct PerfReport {
    pub n_trades:       usize,
    pub n_liquidations: usize,
    pub win_rate:       f64,
    pub avg_win:        f64,
    pub avg_loss:       f64,
    pub profit_factor:  f64,
    pub total_return:   f64,
    pub sharpe:         f64,
    pub sortino:        f64,
    pub max_drawdown:   f64,
    pub calmar:         f64,
    pub total_fees:     f64,
    pub total_funding:  f64,
    pub initial_equity: f64,
    pub final_equity:   f64,
}

impl std::fmt::Display for PerfReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "════════════════════════════════════════════")?;
        writeln!(f, "  BACKTEST PERFORMANCE REPORT")?;
        writeln!(f, "════════════════════════════════════════════")?;
        writeln!(f, "  Trades         : {}", self.n_trades)?;
        writeln!(f, "  Liquidations   : {}", self.n_liquidations)?;
        writeln!(f, "  Win Rate       : {:.2}%", self.win_rate * 100.0)?;
        writeln!(f, "  Avg Win        : ${:.2}", self.avg_win)?;
        writeln!(f, "  Avg Loss       : ${:.2}", self.avg_loss)?;
        writeln!(f, "  Profit Factor  : {:.3}", self.profit_factor)?;
        writeln!(f, "  Total Return   : {:.2}%", self.total_return * 100.0)?;
        writeln!(f, "  Sharpe Ratio   : {:.3}", self.sharpe)?;
        writeln!(f, "  Sortino Ratio  : {:.3}", self.sortino)?;
        writeln!(f, "  Max Drawdown   : {:.2}%", self.max_drawdown * 100.0)?;
        writeln!(f, "  Calmar Ratio   : {:.3}", self.calmar)?;
        writeln!(f, "  Total Fees     : ${:.2}", self.total_fees)?;
        writeln!(f, "  Net Funding    : ${:.2}", self.total_funding)?;
        writeln!(f, "  Initial Equity : ${:.2}", self.initial_equity)?;
        writeln!(f, "  Final Equity   : ${:.2}", self.final_equity)?;
        writeln!(f, "════════════════════════════════════════════")
    }
}

/// Compute all performance metrics from the closed trades and the per-tick
/// equity curve.
pub fn compute_metrics(
    trades:         &[ClosedTrade],
    equity_curve:   &[f64],
    initial_equity: f64,
    final_equity:   f64,
    bars_per_year:  f64,
) -> PerfReport {
    let n = trades.len();
    if n == 0 {
        return PerfReport {
            n_trades: 0, n_liquidations: 0, win_rate: 0.0, avg_win: 0.0,
            avg_loss: 0.0, profit_factor: 0.0, total_return: 0.0,
            sharpe: 0.0, sortino: 0.0, max_drawdown: 0.0, calmar: 0.0,
            total_fees: 0.0, total_funding: 0.0, initial_equity, final_equity,
        };
    }

    // ── Per-trade statistics ──────────────────────────────────────────────
    let net_pnls: Vec<f64> = trades.iter().map(|t| t.net_pnl).collect();
    let returns: Vec<f64> = trades
        .iter()
        .map(|t| {
            if t.wallet_balance_at_order() > 0.0 {
                t.net_pnl / t.wallet_balance_at_order()
            } else {
                0.0
            }
        })
        .collect();

    let winners: Vec<f64> = net_pnls.iter().copied().filter(|&p| p > 0.0).collect();
    let losers: Vec<f64> = net_pnls.iter().copied().filter(|&p| p <= 0.0).collect();

    let win_rate = winners.len() as f64 / n as f64;
    let avg_win = mean(&winners).unwrap_or(0.0);
    let avg_loss = mean(&losers.iter().map(|p| p.abs()).collect::<Vec<_>>()).unwrap_or(0.0);

    let gross_profit: f64 = winners.iter().sum();
    let gross_loss: f64 = losers.iter().map(|p| p.abs()).sum();
    let profit_factor = if gross_loss < 1e-10 {
        f64::INFINITY
    } else {
        gross_profit / gross_loss
    };

    let total_return = (final_equity - initial_equity) / initial_equity;

    // ── Sharpe / Sortino ──────────────────────────────────────────────────
    let r_mean = mean(&returns).unwrap_or(0.0);
    let r_std = std_dev(&returns);
    let annualisation = (bars_per_year / n as f64).max(0.0).sqrt();
    let sharpe = if r_std < 1e-12 {
        0.0
    } else {
        (r_mean / r_std) * annualisation
    };

    let downside_sq: Vec<f64> = returns
        .iter()
        .map(|&r| if r < 0.0 { r * r } else { 0.0 })
        .collect();
    let sigma_d = mean(&downside_sq).unwrap_or(0.0).sqrt();
    let sortino = if sigma_d < 1e-12 {
        f64::INFINITY
    } else {
        (r_mean / sigma_d) * annualisation
    };

    // ── Drawdown / Calmar ─────────────────────────────────────────────────
    let max_drawdown = max_drawdown(equity_curve);
    let calmar = if max_drawdown.abs() < 1e-10 {
        f64::INFINITY
    } else {
        total_return / max_drawdown.abs()
    };

    let total_fees = trades
        .iter()
        .map(|t| t.entry_fee + t.exit_fee + t.liquidation_fee)
        .sum();
    let total_funding = trades
        .iter()
        .map(|t| t.received_funding_amount - t.paid_funding_amount)
        .sum();
    let n_liquidations = trades
        .iter()
        .filter(|t| !t.liquidation_price.is_nan())
        .count();

    PerfReport {
        n_trades: n,
        n_liquidations,
        win_rate,
        avg_win,
        avg_loss,
        profit_factor,
        total_return,
        sharpe,
        sortino,
        max_drawdown,
        calmar,
        total_fees,
        total_funding,
        initial_equity,
        final_equity,
    }
}

/// Maximum drawdown from an equity curve.
/// Returns a negative value (e.g. −0.15 = −15% drawdown).
pub fn max_drawdown(equity_curve: &[f64]) -> f64 {
    if equity_curve.is_empty() {
        return 0.0;
    }
    let mut peak = equity_curve[0];
    let mut max_dd = 0.0f64;

    for &equity in equity_curve {
        if equity > peak {
            peak = equity;
        }
        let dd = (equity - peak) / peak;
        if dd < max_dd {
            max_dd = dd;
        }
    }
    max_dd
}

impl ClosedTrade {
    fn wallet_balance_at_order(&self) -> f64 {
        // The per-trade return base: wallet just before entry, approximated
        // by unwinding this trade's contribution from the snapshot.
        self.wallet_balance - self.net_pnl
    }
}

// ── Statistical helpers ───────────────────────────────────────────────────

fn mean(data: &[f64]) -> Option<f64> {
    if data.is_empty() {
        return None;
    }
    Some(data.iter().sum::<f64>() / data.len() as f64)
}

fn std_dev(data: &[f64]) -> f64 {
    if data.len() < 2 {
        return 0.0;
    }
    let m = data.iter().sum::<f64>() / data.len() as f64;
    let var = data.iter().map(|x| (x - m).powi(2)).sum::<f64>() / (data.len() - 1) as f64;
    var.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_drawdown_flat() {
        let curve = vec![100.0, 100.0, 100.0];
        assert_eq!(max_drawdown(&curve), 0.0);
    }

    #[test]
    fn max_drawdown_50_pct() {
        let curve = vec![100.0, 120.0, 60.0, 80.0];
        // peak=120, low=60 → DD = (60−120)/120 = −0.5
        let dd = max_drawdown(&curve);
        assert!((dd + 0.5).abs() < 1e-9, "dd = {dd}");
    }

    #[test]
    fn empty_trades_yield_zeroed_report() {
        let report = compute_metrics(&[], &[1_000.0], 1_000.0, 1_000.0, 525_600.0);
        assert_eq!(report.n_trades, 0);
        assert_eq!(report.total_return, 0.0);
    }
}
