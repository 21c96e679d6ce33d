// =============================================================================
// RSI mean reversion — counter-trend reference strategy
// =============================================================================
//
// BUY when RSI dips below the oversold threshold, CLOSE when it pushes above
// the overbought threshold while a long exists. The complement to the EMA
// crossover: it earns its keep in choppy tape and gets hurt in strong trends,
// so it is disabled entirely under a strong-trend regime (RSI can pin
// oversold for weeks in a real downtrend).
// =============================================================================

use tracing::{debug, info};

use crate::config::RsiReversionConfig;
use crate::indicators::rsi;
use crate::regime::{MarketRegime, TrendRegime};
use crate::storage::CachedPosition;
use crate::types::Bar;

use super::{has_long, Signal, SignalType, Strategy};

const STRATEGY_ID: &str = "rsi_mean_reversion";

pub struct RsiReversion {
    period: usize,
    oversold: f64,
    overbought: f64,
}

impl RsiReversion {
    pub fn new(config: &RsiReversionConfig) -> Self {
        info!(
            period = config.period,
            oversold = config.oversold,
            overbought = config.overbought,
            "rsi mean reversion strategy initialised"
        );
        Self {
            period: config.period,
            oversold: config.oversold,
            overbought: config.overbought,
        }
    }
}

impl Default for RsiReversion {
    fn default() -> Self {
        Self::new(&RsiReversionConfig::default())
    }
}

impl Strategy for RsiReversion {
    fn id(&self) -> &str {
        STRATEGY_ID
    }

    fn generate(
        &self,
        symbol: &str,
        bars: &[Bar],
        regime: Option<&MarketRegime>,
        position: Option<&CachedPosition>,
    ) -> Vec<Signal> {
        let mut signals = Vec::new();

        // Mean reversion fights trends; stand down when one is confirmed.
        if let Some(regime) = regime {
            if regime.trend == TrendRegime::StrongTrend {
                debug!(symbol, "rsi reversion disabled in strong trend");
                return signals;
            }
        }

        if bars.len() < self.period + 1 {
            debug!(
                symbol,
                bars = bars.len(),
                required = self.period + 1,
                "insufficient data for rsi"
            );
            return signals;
        }

        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        let value = match rsi::latest_rsi(&closes, self.period) {
            Some(value) => value,
            None => return signals,
        };

        let last_close = closes[closes.len() - 1];

        if value < self.oversold {
            let confidence = if self.oversold > 0.0 {
                (self.oversold - value) / self.oversold
            } else {
                0.0
            };
            info!(symbol, rsi = value, confidence, "oversold");
            signals.push(
                Signal::new(symbol, SignalType::Buy, STRATEGY_ID, confidence)
                    .with_entry_price(last_close)
                    .with_meta("rsi", serde_json::json!(value)),
            );
        } else if value > self.overbought && has_long(position) {
            let confidence = if self.overbought < 100.0 {
                (value - self.overbought) / (100.0 - self.overbought)
            } else {
                0.0
            };
            info!(symbol, rsi = value, confidence, "overbought with open long");
            signals.push(
                Signal::new(symbol, SignalType::Close, STRATEGY_ID, confidence)
                    .with_meta("rsi", serde_json::json!(value)),
            );
        }

        signals
    }
}
