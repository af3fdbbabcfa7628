/// config.rs — Backtest configuration
///
/// A plain struct with an explicit `validate()` step: construction never
/// fails, running an invalid config does. Serialisable so the run can
/// snapshot its exact configuration next to the trade list.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::numeric::{is_greater, is_less, is_less_or_equal};
use crate::slippage::Slippage;

/// Optional UTC clamp on the simulated range. Unset bounds fall back to the
/// full data range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestPeriod {
    pub start: Option<String>,
    pub end: Option<String>,
    /// chrono format string the bounds are written in.
    pub format: String,
}

impl Default for BacktestPeriod {
    fn default() -> Self {
        Self {
            start: None,
            end: None,
            format: "%Y-%m-%d %H:%M:%S".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestConfig {
    /// Artifact root for the run's outputs.
    pub project_directory: String,

    pub backtest_period: BacktestPeriod,

    /// Requires a magnifier stream when set.
    pub use_bar_magnifier: bool,

    pub initial_balance: f64,

    /// Percent, i.e. 0.04 means 0.04%.
    pub taker_fee_percentage: f64,
    pub maker_fee_percentage: f64,

    pub slippage: Slippage,

    // Reject-on-violation guards for order quantities and notional value.
    pub check_limit_max_qty: bool,
    pub check_limit_min_qty: bool,
    pub check_market_max_qty: bool,
    pub check_market_min_qty: bool,
    pub check_min_notional_value: bool,

    /// First-bar open uniqueness across symbols, per stream, in the order
    /// trading / magnifier / reference / mark-price. Catches the same file
    /// accidentally loaded under two symbols.
    pub check_same_bar_data: [bool; 4],
    /// Last-bar OHLC identity between the mark-price stream and its target
    /// (magnifier when enabled, trading otherwise).
    pub check_same_bar_data_with_target: bool,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            project_directory: String::new(),
            backtest_period: BacktestPeriod::default(),
            use_bar_magnifier: false,
            initial_balance: f64::NAN,
            taker_fee_percentage: f64::NAN,
            maker_fee_percentage: f64::NAN,
            slippage: Slippage::percentage(0.0, 0.0),
            check_limit_max_qty: true,
            check_limit_min_qty: true,
            check_market_max_qty: true,
            check_market_min_qty: true,
            check_min_notional_value: true,
            check_same_bar_data: [true; 4],
            check_same_bar_data_with_target: true,
        }
    }
}

impl BacktestConfig {
    pub fn validate(&self) -> Result<()> {
        if self.project_directory.is_empty() {
            return Err(EngineError::invalid("project directory is not set"));
        }

        if self.initial_balance.is_nan() {
            return Err(EngineError::invalid("initial balance is not set"));
        }
        if is_less_or_equal(self.initial_balance, 0.0) {
            return Err(EngineError::invalid(format!(
                "initial balance [{}] must be greater than 0",
                self.initial_balance
            )));
        }

        for (value, which) in [
            (self.taker_fee_percentage, "taker"),
            (self.maker_fee_percentage, "maker"),
        ] {
            if value.is_nan() {
                return Err(EngineError::invalid(format!(
                    "{which} fee percentage is not set"
                )));
            }
            if is_less(value, 0.0) || is_greater(value, 100.0) {
                return Err(EngineError::invalid(format!(
                    "{which} fee percentage [{value}%] must be within [0%, 100%]"
                )));
            }
        }

        self.slippage.validate()?;

        if let (Some(start), Some(end)) = (
            self.backtest_period.start.as_ref(),
            self.backtest_period.end.as_ref(),
        ) {
            let format = &self.backtest_period.format;
            let start_ts = crate::timeutil::datetime_to_timestamp(start, format)?;
            let end_ts = crate::timeutil::datetime_to_timestamp(end, format)?;
            if start_ts > end_ts {
                return Err(EngineError::invalid(format!(
                    "backtest start [{start}] is after backtest end [{end}]"
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn valid_config() -> BacktestConfig {
        BacktestConfig {
            project_directory: "/tmp/run".to_string(),
            initial_balance: 10_000.0,
            taker_fee_percentage: 0.04,
            maker_fee_percentage: 0.02,
            ..BacktestConfig::default()
        }
    }

    #[test]
    fn defaults_do_not_validate() {
        assert!(BacktestConfig::default().validate().is_err());
    }

    #[test]
    fn filled_in_config_validates() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn rejects_nonpositive_balance_and_bad_fees() {
        let mut config = valid_config();
        config.initial_balance = 0.0;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.taker_fee_percentage = 101.0;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.maker_fee_percentage = -0.01;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_inverted_period() {
        let mut config = valid_config();
        config.backtest_period.start = Some("2024-02-01 00:00:00".to_string());
        config.backtest_period.end = Some("2024-01-01 00:00:00".to_string());
        assert!(config.validate().is_err());
    }
}
