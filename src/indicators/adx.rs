// =============================================================================
// Average Directional Index (ADX)
// =============================================================================
//
// ADX quantifies trend STRENGTH regardless of direction, 0-100.
//
//   1. +DM / -DM per bar from consecutive highs and lows.
//   2. True Range per bar.
//   3. Wilder-smooth +DM, -DM, TR over `period`.
//   4. +DI = smoothed(+DM)/smoothed(TR) * 100, likewise -DI.
//   5. DX = |+DI - -DI| / (+DI + -DI) * 100.
//   6. ADX = Wilder-smoothed average of DX over `period`.
//
// The regime detector classifies trend off this value: below ~20 is choppy,
// above ~25 is trending.
// =============================================================================

use crate::types::Bar;

/// Most recent ADX value, or `None` when:
/// - `period` is zero,
/// - fewer than `2 * period + 1` bars are available (Wilder seeding needs
///   `period` transitions plus `period` DX values, plus the first bar that
///   has no predecessor),
/// - any intermediate computation goes non-finite.
pub fn adx(bars: &[Bar], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < 2 * period + 1 {
        return None;
    }

    let period_f = period as f64;
    let transitions = bars.len() - 1;

    let mut plus_dm = Vec::with_capacity(transitions);
    let mut minus_dm = Vec::with_capacity(transitions);
    let mut tr = Vec::with_capacity(transitions);

    for w in bars.windows(2) {
        let (prev, cur) = (&w[0], &w[1]);

        tr.push(
            (cur.high - cur.low)
                .max((cur.high - prev.close).abs())
                .max((cur.low - prev.close).abs()),
        );

        let up_move = cur.high - prev.high;
        let down_move = prev.low - cur.low;

        plus_dm.push(if up_move > down_move && up_move > 0.0 {
            up_move
        } else {
            0.0
        });
        minus_dm.push(if down_move > up_move && down_move > 0.0 {
            down_move
        } else {
            0.0
        });
    }

    // Initial Wilder sums over the first `period` transitions.
    let mut smooth_plus: f64 = plus_dm[..period].iter().sum();
    let mut smooth_minus: f64 = minus_dm[..period].iter().sum();
    let mut smooth_tr: f64 = tr[..period].iter().sum();

    let mut dx_values = Vec::with_capacity(transitions - period + 1);
    dx_values.push(dx(smooth_plus, smooth_minus, smooth_tr)?);

    for i in period..transitions {
        smooth_plus = smooth_plus - smooth_plus / period_f + plus_dm[i];
        smooth_minus = smooth_minus - smooth_minus / period_f + minus_dm[i];
        smooth_tr = smooth_tr - smooth_tr / period_f + tr[i];
        dx_values.push(dx(smooth_plus, smooth_minus, smooth_tr)?);
    }

    if dx_values.len() < period {
        return None;
    }

    // Seed with the SMA of the first `period` DX values, then Wilder-smooth.
    let mut value: f64 = dx_values[..period].iter().sum::<f64>() / period_f;
    for &d in &dx_values[period..] {
        value = (value * (period_f - 1.0) + d) / period_f;
    }

    value.is_finite().then_some(value)
}

/// DX from smoothed +DM/-DM/TR. `None` on a zero TR; 0 when there is no
/// directional movement at all.
fn dx(smooth_plus: f64, smooth_minus: f64, smooth_tr: f64) -> Option<f64> {
    if smooth_tr == 0.0 {
        return None;
    }

    let plus_di = (smooth_plus / smooth_tr) * 100.0;
    let minus_di = (smooth_minus / smooth_tr) * 100.0;

    let di_sum = plus_di + minus_di;
    if di_sum == 0.0 {
        return Some(0.0);
    }

    let value = ((plus_di - minus_di).abs() / di_sum) * 100.0;
    value.is_finite().then_some(value)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BarQuality, DataTier};
    use chrono::Utc;

    fn bar(open: f64, high: f64, low: f64, close: f64) -> Bar {
        Bar {
            symbol: "TEST".into(),
            timestamp: Utc::now(),
            timeframe: "1Day".into(),
            open,
            high,
            low,
            close,
            volume: 1.0,
            tier: DataTier::Tier1Validation,
            estimated_spread_bps: None,
            quality: BarQuality::Delayed,
        }
    }

    #[test]
    fn period_zero_is_none() {
        let bars = vec![bar(1.0, 2.0, 0.5, 1.5); 50];
        assert!(adx(&bars, 0).is_none());
    }

    #[test]
    fn insufficient_data_is_none() {
        let bars = vec![bar(1.0, 2.0, 0.5, 1.5); 10];
        assert!(adx(&bars, 14).is_none());
    }

    #[test]
    fn strong_uptrend_reads_high() {
        let bars: Vec<Bar> = (0..60)
            .map(|i| {
                let base = 100.0 + i as f64 * 2.0;
                bar(base, base + 1.5, base - 0.5, base + 1.0)
            })
            .collect();

        let value = adx(&bars, 14).unwrap();
        assert!(value > 25.0, "expected ADX > 25 in a strong trend, got {value}");
    }

    #[test]
    fn flat_market_reads_near_zero() {
        let bars = vec![bar(100.0, 101.0, 99.0, 100.0); 60];
        let value = adx(&bars, 14).unwrap();
        assert!(value < 1.0, "expected ADX near 0 for flat market, got {value}");
    }

    #[test]
    fn value_stays_in_range() {
        let bars: Vec<Bar> = (0..100)
            .map(|i| {
                let base = 50.0 + (i as f64 * 0.3).sin() * 10.0;
                bar(base - 0.5, base + 1.0, base - 1.0, base + 0.5)
            })
            .collect();
        if let Some(value) = adx(&bars, 14) {
            assert!((0.0..=100.0).contains(&value), "ADX {value} out of range");
        }
    }

    #[test]
    fn exact_minimum_bar_count() {
        let period = 5;
        let min = 2 * period + 1;
        let bars: Vec<Bar> = (0..min)
            .map(|i| {
                let base = 100.0 + i as f64;
                bar(base, base + 1.0, base - 0.5, base + 0.5)
            })
            .collect();
        assert!(adx(&bars, period).is_some());
        assert!(adx(&bars[..min - 1], period).is_none());
    }
}
