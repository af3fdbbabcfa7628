/// symbol.rs — Per-symbol exchange rules
///
/// Trading rules, leverage brackets and the funding schedule for one
/// perpetual contract. Values map 1:1 onto Binance USDT-M exchange metadata
/// (PRICE_FILTER / LOT_SIZE / MARKET_LOT_SIZE / MIN_NOTIONAL filters and the
/// leverageBracket endpoint); the engine itself only sees this struct.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::numeric::{is_diff, is_less, is_less_or_equal};

/// One notional-value range with its leverage and maintenance parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LeverageBracket {
    pub min_notional_value: f64,
    pub max_notional_value: f64,
    pub max_leverage: u32,
    pub maintenance_margin_rate: f64,
    pub maintenance_amount: f64,
}

/// A scheduled funding settlement. `mark_price` is the exchange-posted
/// settlement price; `None` falls back to the mark-price (then market) bar
/// open at settlement time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FundingEvent {
    pub time: i64,
    pub rate: f64,
    pub mark_price: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolSpec {
    pub name: String,
    pub price_step: f64,
    pub price_precision: usize,
    pub qty_step: f64,
    pub qty_precision: usize,
    pub limit_min_qty: f64,
    pub limit_max_qty: f64,
    pub market_min_qty: f64,
    pub market_max_qty: f64,
    pub min_notional_value: f64,
    pub liquidation_fee_rate: f64,
    /// Sorted by `min_notional_value`, covering [0, inf) without gaps.
    pub leverage_brackets: Vec<LeverageBracket>,
    /// Sorted ascending by `time`.
    pub funding_events: Vec<FundingEvent>,
}

impl SymbolSpec {
    /// Bracket containing the given notional value
    /// (`min_notional <= notional < max_notional`).
    pub fn leverage_bracket(&self, notional_value: f64) -> Result<&LeverageBracket> {
        self.leverage_brackets
            .iter()
            .find(|bracket| {
                is_less_or_equal(bracket.min_notional_value, notional_value)
                    && is_less(notional_value, bracket.max_notional_value)
            })
            .ok_or_else(|| {
                EngineError::OrderFailed(format!(
                    "[{}] no leverage bracket covers notional value [{notional_value}]",
                    self.name
                ))
            })
    }

    /// Brackets must be sorted and cover [0, inf) without gaps; funding
    /// events must be time-sorted. Checked once before the run.
    pub fn validate(&self) -> Result<()> {
        if self.leverage_brackets.is_empty() {
            return Err(EngineError::invalid(format!(
                "[{}] has no leverage brackets",
                self.name
            )));
        }

        let mut expected_floor = 0.0;
        for bracket in &self.leverage_brackets {
            if is_diff(bracket.min_notional_value, expected_floor) {
                return Err(EngineError::invalid(format!(
                    "[{}] leverage brackets have a gap at notional [{expected_floor}]",
                    self.name
                )));
            }
            if bracket.max_leverage < 1 {
                return Err(EngineError::invalid(format!(
                    "[{}] bracket max leverage must be >= 1",
                    self.name
                )));
            }
            expected_floor = bracket.max_notional_value;
        }

        if self
            .funding_events
            .windows(2)
            .any(|pair| pair[0].time > pair[1].time)
        {
            return Err(EngineError::invalid(format!(
                "[{}] funding events are not sorted by time",
                self.name
            )));
        }

        if self.price_step <= 0.0 || self.qty_step <= 0.0 {
            return Err(EngineError::invalid(format!(
                "[{}] price step and qty step must be positive",
                self.name
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn test_spec(name: &str) -> SymbolSpec {
    SymbolSpec {
        name: name.to_string(),
        price_step: 0.01,
        price_precision: 2,
        qty_step: 0.001,
        qty_precision: 3,
        limit_min_qty: 0.001,
        limit_max_qty: 10_000.0,
        market_min_qty: 0.001,
        market_max_qty: 1_000.0,
        min_notional_value: 5.0,
        liquidation_fee_rate: 0.000_2,
        leverage_brackets: vec![
            LeverageBracket {
                min_notional_value: 0.0,
                max_notional_value: 1_000_000.0,
                max_leverage: 125,
                maintenance_margin_rate: 0.005,
                maintenance_amount: 0.0,
            },
            LeverageBracket {
                min_notional_value: 1_000_000.0,
                max_notional_value: f64::MAX,
                max_leverage: 20,
                maintenance_margin_rate: 0.01,
                maintenance_amount: 5_000.0,
            },
        ],
        funding_events: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bracket_lookup_by_notional() {
        let spec = test_spec("BTCUSDT");
        assert_eq!(spec.leverage_bracket(10.0).unwrap().max_leverage, 125);
        assert_eq!(
            spec.leverage_bracket(2_000_000.0).unwrap().max_leverage,
            20
        );
    }

    #[test]
    fn bracket_boundary_belongs_to_upper_range() {
        let spec = test_spec("BTCUSDT");
        assert_eq!(
            spec.leverage_bracket(1_000_000.0).unwrap().max_leverage,
            20
        );
    }

    #[test]
    fn validate_rejects_bracket_gap() {
        let mut spec = test_spec("BTCUSDT");
        spec.leverage_brackets[1].min_notional_value = 2_000_000.0;
        assert!(spec.validate().is_err());
    }

    #[test]
    fn validate_rejects_unsorted_funding() {
        let mut spec = test_spec("BTCUSDT");
        spec.funding_events = vec![
            FundingEvent {
                time: 100,
                rate: 0.0001,
                mark_price: None,
            },
            FundingEvent {
                time: 50,
                rate: 0.0001,
                mark_price: None,
            },
        ];
        assert!(spec.validate().is_err());
    }
}
