/// exchange.rs — Binance USDT-M metadata parsing
///
/// Builds `SymbolSpec`s out of the three JSON documents the exchange
/// publishes: `exchangeInfo` (filters and the liquidation fee),
/// `leverageBracket` (notional tiers) and the funding-rate history.
/// Numeric fields arrive as strings; empty mark prices mean "no settlement
/// price posted".

use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use serde_json::Value;
use tracing::info;

use perp_engine::numeric::count_decimal_places;
use perp_engine::symbol::{FundingEvent, LeverageBracket, SymbolSpec};

/// Assemble full specs for `symbols`, in the given order.
pub fn load_symbol_specs(
    exchange_info_path: &Path,
    leverage_bracket_path: &Path,
    funding_dir: &Path,
    symbols: &[String],
) -> Result<Vec<SymbolSpec>> {
    let exchange_info: Value = read_json(exchange_info_path)?;
    let leverage_brackets: Value = read_json(leverage_bracket_path)?;

    let mut specs = Vec::with_capacity(symbols.len());
    for symbol in symbols {
        let mut spec = parse_exchange_info(&exchange_info, symbol)
            .with_context(|| format!("exchange info for [{symbol}]"))?;
        spec.leverage_brackets = parse_leverage_brackets(&leverage_brackets, symbol)
            .with_context(|| format!("leverage brackets for [{symbol}]"))?;

        let funding_path = funding_dir.join(format!("{symbol}.json"));
        spec.funding_events = if funding_path.exists() {
            parse_funding_events(&read_json(&funding_path)?)
                .with_context(|| format!("funding rates for [{symbol}]"))?
        } else {
            Vec::new()
        };

        spec.validate()
            .map_err(|error| anyhow!("symbol spec for [{symbol}] invalid: {error}"))?;
        specs.push(spec);
    }

    info!(symbols = specs.len(), "symbol metadata loaded");
    Ok(specs)
}

fn read_json(path: &Path) -> Result<Value> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Find the PERPETUAL contract for `symbol` and read its filters.
fn parse_exchange_info(exchange_info: &Value, symbol: &str) -> Result<SymbolSpec> {
    let symbols = exchange_info["symbols"]
        .as_array()
        .ok_or_else(|| anyhow!("exchange info has no symbols array"))?;

    let entry = symbols
        .iter()
        .find(|entry| {
            entry["symbol"].as_str() == Some(symbol)
                && entry["contractType"].as_str() == Some("PERPETUAL")
        })
        .ok_or_else(|| anyhow!("no PERPETUAL contract named [{symbol}] in exchange info"))?;

    let filters = entry["filters"]
        .as_array()
        .ok_or_else(|| anyhow!("[{symbol}] has no filters array"))?;

    let mut price_step = None;
    let mut limit_min_qty = None;
    let mut limit_max_qty = None;
    let mut market_min_qty = None;
    let mut market_max_qty = None;
    let mut qty_step = None;
    let mut min_notional = None;

    for filter in filters {
        match filter["filterType"].as_str() {
            Some("PRICE_FILTER") => {
                price_step = Some(json_f64(filter, "tickSize")?);
            }
            Some("LOT_SIZE") => {
                limit_max_qty = Some(json_f64(filter, "maxQty")?);
                limit_min_qty = Some(json_f64(filter, "minQty")?);
            }
            Some("MARKET_LOT_SIZE") => {
                market_max_qty = Some(json_f64(filter, "maxQty")?);
                market_min_qty = Some(json_f64(filter, "minQty")?);
                qty_step = Some(json_f64(filter, "stepSize")?);
            }
            Some("MIN_NOTIONAL") => {
                min_notional = Some(json_f64(filter, "notional")?);
            }
            _ => {}
        }
    }

    let price_step = price_step.ok_or_else(|| anyhow!("[{symbol}] is missing PRICE_FILTER"))?;
    let qty_step = qty_step.ok_or_else(|| anyhow!("[{symbol}] is missing MARKET_LOT_SIZE"))?;

    Ok(SymbolSpec {
        name: symbol.to_string(),
        price_step,
        price_precision: count_decimal_places(price_step),
        qty_step,
        qty_precision: count_decimal_places(qty_step),
        limit_min_qty: limit_min_qty
            .ok_or_else(|| anyhow!("[{symbol}] is missing LOT_SIZE minQty"))?,
        limit_max_qty: limit_max_qty
            .ok_or_else(|| anyhow!("[{symbol}] is missing LOT_SIZE maxQty"))?,
        market_min_qty: market_min_qty
            .ok_or_else(|| anyhow!("[{symbol}] is missing MARKET_LOT_SIZE minQty"))?,
        market_max_qty: market_max_qty
            .ok_or_else(|| anyhow!("[{symbol}] is missing MARKET_LOT_SIZE maxQty"))?,
        min_notional_value: min_notional
            .ok_or_else(|| anyhow!("[{symbol}] is missing MIN_NOTIONAL"))?,
        liquidation_fee_rate: json_f64(entry, "liquidationFee")?,
        leverage_brackets: Vec::new(),
        funding_events: Vec::new(),
    })
}

fn parse_leverage_brackets(document: &Value, symbol: &str) -> Result<Vec<LeverageBracket>> {
    let entries = document
        .as_array()
        .ok_or_else(|| anyhow!("leverage bracket document is not an array"))?;

    let entry = entries
        .iter()
        .find(|entry| entry["symbol"].as_str() == Some(symbol))
        .ok_or_else(|| anyhow!("no leverage brackets for [{symbol}]"))?;

    let brackets = entry["brackets"]
        .as_array()
        .ok_or_else(|| anyhow!("[{symbol}] has no brackets array"))?;

    let mut parsed = Vec::with_capacity(brackets.len());
    for bracket in brackets {
        parsed.push(LeverageBracket {
            min_notional_value: json_number(bracket, "notionalFloor")?,
            max_notional_value: json_number(bracket, "notionalCap")?,
            max_leverage: json_number(bracket, "initialLeverage")? as u32,
            maintenance_margin_rate: json_number(bracket, "maintMarginRatio")?,
            maintenance_amount: json_number(bracket, "cum")?,
        });
    }
    if parsed.is_empty() {
        bail!("[{symbol}] bracket list is empty");
    }
    parsed.sort_by(|a, b| a.min_notional_value.total_cmp(&b.min_notional_value));
    Ok(parsed)
}

fn parse_funding_events(document: &Value) -> Result<Vec<FundingEvent>> {
    let entries = document
        .as_array()
        .ok_or_else(|| anyhow!("funding rate document is not an array"))?;

    let mut events = Vec::with_capacity(entries.len());
    for entry in entries {
        let mark_price = match entry["markPrice"].as_str() {
            Some("") | None => None,
            Some(text) => Some(
                text.parse::<f64>()
                    .with_context(|| format!("bad markPrice [{text}]"))?,
            ),
        };
        events.push(FundingEvent {
            time: entry["fundingTime"]
                .as_i64()
                .ok_or_else(|| anyhow!("fundingTime is not an integer"))?,
            rate: json_number(entry, "fundingRate")?,
            mark_price,
        });
    }
    events.sort_by_key(|event| event.time);
    Ok(events)
}

/// Binance writes most numerics as strings; accept both forms.
fn json_f64(value: &Value, key: &str) -> Result<f64> {
    match &value[key] {
        Value::String(text) => text
            .parse::<f64>()
            .with_context(|| format!("bad numeric string for [{key}]: {text}")),
        Value::Number(number) => number
            .as_f64()
            .ok_or_else(|| anyhow!("[{key}] is not representable as f64")),
        other => bail!("[{key}] is missing or not numeric: {other}"),
    }
}

fn json_number(value: &Value, key: &str) -> Result<f64> {
    json_f64(value, key)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exchange_info() -> Value {
        serde_json::json!({
            "symbols": [{
                "symbol": "BTCUSDT",
                "contractType": "PERPETUAL",
                "liquidationFee": "0.012500",
                "filters": [
                    { "filterType": "PRICE_FILTER", "tickSize": "0.10" },
                    { "filterType": "LOT_SIZE", "maxQty": "1000", "minQty": "0.001" },
                    { "filterType": "MARKET_LOT_SIZE", "maxQty": "120", "minQty": "0.001",
                      "stepSize": "0.001" },
                    { "filterType": "MIN_NOTIONAL", "notional": "100" }
                ]
            }]
        })
    }

    #[test]
    fn parses_exchange_filters() {
        let spec = parse_exchange_info(&exchange_info(), "BTCUSDT").unwrap();
        assert_eq!(spec.price_step, 0.10);
        assert_eq!(spec.price_precision, 1);
        assert_eq!(spec.qty_step, 0.001);
        assert_eq!(spec.qty_precision, 3);
        assert_eq!(spec.market_max_qty, 120.0);
        assert_eq!(spec.min_notional_value, 100.0);
        assert_eq!(spec.liquidation_fee_rate, 0.0125);
    }

    #[test]
    fn missing_symbol_is_an_error() {
        assert!(parse_exchange_info(&exchange_info(), "ETHUSDT").is_err());
    }

    #[test]
    fn parses_and_sorts_brackets() {
        let doc = serde_json::json!([{
            "symbol": "BTCUSDT",
            "brackets": [
                { "notionalFloor": 50000, "notionalCap": 250000, "initialLeverage": 50,
                  "maintMarginRatio": 0.01, "cum": 250.0 },
                { "notionalFloor": 0, "notionalCap": 50000, "initialLeverage": 125,
                  "maintMarginRatio": 0.004, "cum": 0.0 }
            ]
        }]);
        let brackets = parse_leverage_brackets(&doc, "BTCUSDT").unwrap();
        assert_eq!(brackets.len(), 2);
        assert_eq!(brackets[0].min_notional_value, 0.0);
        assert_eq!(brackets[0].max_leverage, 125);
        assert_eq!(brackets[1].maintenance_amount, 250.0);
    }

    #[test]
    fn empty_mark_price_becomes_none() {
        let doc = serde_json::json!([
            { "fundingTime": 1000, "fundingRate": "0.0001", "markPrice": "" },
            { "fundingTime": 500, "fundingRate": "-0.0002", "markPrice": "30000.5" }
        ]);
        let events = parse_funding_events(&doc).unwrap();
        assert_eq!(events[0].time, 500);
        assert_eq!(events[0].mark_price, Some(30_000.5));
        assert_eq!(events[1].mark_price, None);
        assert_eq!(events[1].rate, 0.0001);
    }
}
