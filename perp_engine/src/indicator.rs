/// indicator.rs — Precomputed indicator series
///
/// The core never computes indicator values; it is handed value arrays
/// aligned 1:1 with the bars of a timeframe (the trading timeframe or one
/// of the reference timeframes) and simply reads them under that stream's
/// cursor. NaN is a legal value (warm-up periods).

use ahash::AHashMap;

use crate::bars::{BarStore, StreamKind};
use crate::error::{EngineError, Result};
use crate::timeutil::format_timeframe;

#[derive(Debug, Clone)]
pub struct IndicatorSeries {
    pub name: String,
    pub timeframe_ms: i64,
    /// One value vector per symbol, index-aligned with the owning stream.
    pub values: Vec<Vec<f64>>,
    /// Stream the series follows; resolved at engine initialisation.
    pub(crate) stream: Option<StreamKind>,
}

impl IndicatorSeries {
    pub fn new(name: impl Into<String>, timeframe_ms: i64, values: Vec<Vec<f64>>) -> Self {
        Self {
            name: name.into(),
            timeframe_ms,
            values,
            stream: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct IndicatorSet {
    series: Vec<IndicatorSeries>,
    by_name: AHashMap<String, usize>,
}

impl IndicatorSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, series: IndicatorSeries) -> Result<()> {
        if self.by_name.contains_key(&series.name) {
            return Err(EngineError::invalid(format!(
                "indicator [{}] is registered twice; names must be unique",
                series.name
            )));
        }
        self.by_name.insert(series.name.clone(), self.series.len());
        self.series.push(series);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    pub fn series(&self) -> &[IndicatorSeries] {
        &self.series
    }

    /// Bind every series to the stream whose timeframe it follows.
    /// A timeframe matching neither the trading stream nor any reference
    /// stream is a configuration error.
    pub fn bind_streams(&mut self, bars: &BarStore) -> Result<()> {
        for series in &mut self.series {
            if series.timeframe_ms == bars.timeframe_ms(StreamKind::Trading) {
                series.stream = Some(StreamKind::Trading);
                continue;
            }
            let reference = (0..bars.num_references())
                .map(StreamKind::Reference)
                .find(|stream| bars.timeframe_ms(*stream) == series.timeframe_ms);
            match reference {
                Some(stream) => series.stream = Some(stream),
                None => {
                    return Err(EngineError::invalid(format!(
                        "indicator [{}] timeframe [{}] matches no trading or reference stream",
                        series.name,
                        format_timeframe(series.timeframe_ms)
                    )))
                }
            }
        }
        Ok(())
    }

    /// Value at `offset` bars back from the owning stream's cursor.
    /// Errors on unknown names and reads past the cursor (lookahead).
    pub fn value(
        &self,
        name: &str,
        symbol_idx: usize,
        offset: usize,
        bars: &BarStore,
    ) -> Result<f64> {
        let Some(&series_idx) = self.by_name.get(name) else {
            return Err(EngineError::invalid(format!(
                "indicator [{name}] is not registered"
            )));
        };
        let series = &self.series[series_idx];
        let stream = series.stream.ok_or_else(|| {
            EngineError::OrderFailed(format!("indicator [{name}] read before stream binding"))
        })?;

        let cursor = bars.cursor(stream, symbol_idx);
        if offset > cursor {
            return Err(EngineError::IndexOutOfRange(format!(
                "indicator [{name}] offset [{offset}] reaches before the first bar"
            )));
        }
        let idx = cursor - offset;
        series.values[symbol_idx].get(idx).copied().ok_or_else(|| {
            EngineError::IndexOutOfRange(format!(
                "indicator [{name}] has no value at index [{idx}] for symbol [{symbol_idx}]"
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bars::{bar, BarSeries};
    use crate::timeutil::MS_MINUTE;

    fn store() -> BarStore {
        let bars = (0..4)
            .map(|i| bar(i * MS_MINUTE, 100.0, 101.0, 99.0, 100.0, MS_MINUTE))
            .collect();
        BarStore::new(
            vec!["BTCUSDT".to_string()],
            BarSeries::new(MS_MINUTE, vec![bars]),
            None,
            Vec::new(),
            BarSeries::new(MS_MINUTE, vec![vec![]]),
        )
    }

    #[test]
    fn reads_under_the_cursor() {
        let mut bars = store();
        bars.advance(StreamKind::Trading, 0, 3 * MS_MINUTE - 1);

        let mut set = IndicatorSet::new();
        set.add(IndicatorSeries::new(
            "sma",
            MS_MINUTE,
            vec![vec![1.0, 2.0, 3.0, 4.0]],
        ))
        .unwrap();
        set.bind_streams(&bars).unwrap();

        assert_eq!(set.value("sma", 0, 0, &bars).unwrap(), 3.0);
        assert_eq!(set.value("sma", 0, 2, &bars).unwrap(), 1.0);
        assert!(set.value("sma", 0, 3, &bars).is_err());
    }

    #[test]
    fn duplicate_names_rejected() {
        let mut set = IndicatorSet::new();
        set.add(IndicatorSeries::new("x", MS_MINUTE, vec![vec![]]))
            .unwrap();
        assert!(set
            .add(IndicatorSeries::new("x", MS_MINUTE, vec![vec![]]))
            .is_err());
    }

    #[test]
    fn unmatched_timeframe_rejected_at_binding() {
        let bars = store();
        let mut set = IndicatorSet::new();
        set.add(IndicatorSeries::new("h1", 60 * MS_MINUTE, vec![vec![]]))
            .unwrap();
        assert!(set.bind_streams(&bars).is_err());
    }
}
