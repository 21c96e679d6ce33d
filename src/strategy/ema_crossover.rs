// =============================================================================
// EMA crossover — trend-following reference strategy
// =============================================================================
//
// BUY on a golden cross (fast EMA crossing above slow), CLOSE on a death
// cross when a long exists. Confidence is proportional to the normalised
// distance between the EMAs, capped at 1.
//
// Works in any regime but is a momentum strategy at heart: under a choppy
// regime the confidence is halved rather than the strategy silenced, so the
// audit trail still shows what it wanted to do.
// =============================================================================

use tracing::{debug, info};

use crate::config::EmaCrossoverConfig;
use crate::indicators::ema;
use crate::regime::MarketRegime;
use crate::storage::CachedPosition;
use crate::types::Bar;

use super::{has_long, Signal, SignalType, Strategy};

const STRATEGY_ID: &str = "ema_crossover";

/// Confidence multiplier applied when the regime says momentum is off.
const CHOPPY_CONFIDENCE_SCALE: f64 = 0.5;

pub struct EmaCrossover {
    fast_period: usize,
    slow_period: usize,
    #[allow(dead_code)]
    signal_period: usize,
}

impl EmaCrossover {
    pub fn new(config: &EmaCrossoverConfig) -> Self {
        info!(
            fast = config.fast_period,
            slow = config.slow_period,
            "ema crossover strategy initialised"
        );
        Self {
            fast_period: config.fast_period,
            slow_period: config.slow_period,
            signal_period: config.signal_period,
        }
    }
}

impl Default for EmaCrossover {
    fn default() -> Self {
        Self::new(&EmaCrossoverConfig::default())
    }
}

impl Strategy for EmaCrossover {
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

        if bars.len() < self.slow_period + 1 {
            debug!(
                symbol,
                bars = bars.len(),
                required = self.slow_period + 1,
                "insufficient data for ema crossover"
            );
            return signals;
        }

        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();

        let (fast_prev, fast_cur) = match ema::last_two(&closes, self.fast_period) {
            Some(pair) => pair,
            None => return signals,
        };
        let (slow_prev, slow_cur) = match ema::last_two(&closes, self.slow_period) {
            Some(pair) => pair,
            None => return signals,
        };

        let golden_cross = fast_prev <= slow_prev && fast_cur > slow_cur;
        let death_cross = fast_prev >= slow_prev && fast_cur < slow_cur;

        if !golden_cross && !death_cross {
            return signals;
        }

        if slow_cur == 0.0 {
            return signals;
        }

        // Distance between the EMAs, normalised and scaled to [0, 1].
        let mut confidence = ((fast_cur - slow_cur).abs() / slow_cur * 10.0).min(1.0);

        if let Some(regime) = regime {
            if !regime.momentum_enabled {
                confidence *= CHOPPY_CONFIDENCE_SCALE;
            }
        }

        let last_close = closes[closes.len() - 1];

        if golden_cross {
            info!(
                symbol,
                confidence,
                fast = fast_cur,
                slow = slow_cur,
                "golden cross"
            );
            signals.push(
                Signal::new(symbol, SignalType::Buy, STRATEGY_ID, confidence)
                    .with_entry_price(last_close)
                    .with_meta("ema_fast", serde_json::json!(fast_cur))
                    .with_meta("ema_slow", serde_json::json!(slow_cur))
                    .with_meta("crossover", serde_json::json!("golden_cross")),
            );
        } else if death_cross && has_long(position) {
            info!(symbol, confidence, "death cross with open long");
            signals.push(
                Signal::new(symbol, SignalType::Close, STRATEGY_ID, confidence)
                    .with_meta("ema_fast", serde_json::json!(fast_cur))
                    .with_meta("ema_slow", serde_json::json!(slow_cur))
                    .with_meta("crossover", serde_json::json!("death_cross")),
            );
        }

        signals
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::regime::{TrendRegime, VolRegime};
    use crate::types::{BarQuality, DataTier};
    use chrono::{Duration, Utc};

    fn bars_from_closes(closes: &[f64]) -> Vec<Bar> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &close)| Bar {
                symbol: "SPY".into(),
                timestamp: Utc::now() - Duration::days((closes.len() - i) as i64),
                timeframe: "1Day".into(),
                open: close,
                high: close + 0.5,
                low: close - 0.5,
                close,
                volume: 1000.0,
                tier: DataTier::Tier1Validation,
                estimated_spread_bps: None,
                quality: BarQuality::Delayed,
            })
            .collect()
    }

    /// Long decline then a sharp rally: the fast EMA crosses up through the
    /// slow EMA near the end.
    fn golden_cross_closes() -> Vec<f64> {
        let mut closes: Vec<f64> = (0..40).map(|i| 120.0 - i as f64).collect();
        closes.extend((0..12).map(|i| 81.0 + i as f64 * 4.0));
        closes
    }

    /// Long rally then a sharp decline: death cross near the end.
    fn death_cross_closes() -> Vec<f64> {
        let mut closes: Vec<f64> = (0..40).map(|i| 80.0 + i as f64).collect();
        closes.extend((0..12).map(|i| 119.0 - i as f64 * 4.0));
        closes
    }

    fn long_position() -> CachedPosition {
        CachedPosition {
            symbol: "SPY".into(),
            qty: 10.0,
            avg_price: 100.0,
            market_value: 1000.0,
            unrealized_pnl: 0.0,
            side: "long".into(),
            updated_at: Utc::now(),
        }
    }

    fn trending_regime(momentum: bool) -> MarketRegime {
        MarketRegime {
            timestamp: Utc::now(),
            symbol: Some("SPY".into()),
            trend: if momentum {
                TrendRegime::StrongTrend
            } else {
                TrendRegime::Choppy
            },
            volatility: VolRegime::Normal,
            adx: Some(if momentum { 40.0 } else { 10.0 }),
            fast_vol: None,
            slow_vol: None,
            vol_ratio: None,
            momentum_enabled: momentum,
            position_scale: 1.0,
        }
    }

    /// Walk growing prefixes of `closes` until the strategy emits; the cross
    /// lands on whichever bar it lands on, the scan finds it.
    fn scan_for_signal(
        strategy: &EmaCrossover,
        closes: &[f64],
        regime: &MarketRegime,
        position: Option<&CachedPosition>,
    ) -> Option<Signal> {
        for k in 28..=closes.len() {
            let bars = bars_from_closes(&closes[..k]);
            let signals = strategy.generate("SPY", &bars, Some(regime), position);
            if let Some(signal) = signals.into_iter().next() {
                return Some(signal);
            }
        }
        None
    }

    #[test]
    fn golden_cross_emits_buy() {
        let strategy = EmaCrossover::default();
        let signal = scan_for_signal(
            &strategy,
            &golden_cross_closes(),
            &trending_regime(true),
            None,
        )
        .expect("a golden cross must appear somewhere in the rally");

        assert_eq!(signal.signal_type, SignalType::Buy);
        assert!(signal.confidence > 0.0);
        assert!(signal.entry_price.is_some());
        assert_eq!(signal.metadata["crossover"], "golden_cross");
    }

    #[test]
    fn death_cross_without_position_is_silent() {
        let strategy = EmaCrossover::default();
        let signal = scan_for_signal(
            &strategy,
            &death_cross_closes(),
            &trending_regime(true),
            None,
        );
        assert!(signal.is_none());
    }

    #[test]
    fn death_cross_with_long_emits_close() {
        let strategy = EmaCrossover::default();
        let position = long_position();
        let signal = scan_for_signal(
            &strategy,
            &death_cross_closes(),
            &trending_regime(true),
            Some(&position),
        )
        .expect("a death cross must appear somewhere in the decline");

        assert_eq!(signal.signal_type, SignalType::Close);
        assert_eq!(signal.metadata["crossover"], "death_cross");
    }

    #[test]
    fn choppy_regime_halves_confidence() {
        let strategy = EmaCrossover::default();
        let closes = golden_cross_closes();

        let trending =
            scan_for_signal(&strategy, &closes, &trending_regime(true), None).unwrap();
        let choppy = scan_for_signal(&strategy, &closes, &trending_regime(false), None).unwrap();

        assert!((choppy.confidence - trending.confidence * 0.5).abs() < 1e-12);
    }

    #[test]
    fn no_cross_no_signal() {
        let strategy = EmaCrossover::default();
        // Monotone rise: fast stays above slow throughout, no crossing.
        let closes: Vec<f64> = (0..60).map(|i| 100.0 + i as f64).collect();
        let bars = bars_from_closes(&closes);

        let signals = strategy.generate("SPY", &bars, None, None);
        assert!(signals.is_empty());
    }

    #[test]
    fn insufficient_data_is_silent() {
        let strategy = EmaCrossover::default();
        let bars = bars_from_closes(&[100.0, 101.0, 102.0]);
        assert!(strategy.generate("SPY", &bars, None, None).is_empty());
    }

    #[test]
    fn confidence_capped_at_one() {
        let strategy = EmaCrossover::default();
        // An extreme reversal produces a wide EMA spread.
        let mut closes: Vec<f64> = (0..40).map(|i| 500.0 - i as f64 * 10.0).collect();
        closes.extend((0..12).map(|i| 110.0 + i as f64 * 100.0));
        let bars = bars_from_closes(&closes);

        let signals = strategy.generate("SPY", &bars, Some(&trending_regime(true)), None);
        if let Some(signal) = signals.first() {
            assert!(signal.confidence <= 1.0);
        }
    }
}
