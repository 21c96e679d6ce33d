// =============================================================================
// Average True Range (ATR) — Wilder's Smoothing Method
// =============================================================================
//
// True Range per bar:
//   TR = max(H - L, |H - prevClose|, |L - prevClose|)
//
// ATR seeds with the SMA of the first `period` TR values and then applies
// Wilder's smoothing:
//   ATR_t = (ATR_{t-1} * (period - 1) + TR_t) / period
//
// The regime detector uses a short-window ATR (default 3) as its fast
// volatility measure.
// =============================================================================

use crate::types::Bar;

/// True Range series for consecutive bar pairs (length = bars.len() - 1).
fn true_ranges(bars: &[Bar]) -> Vec<f64> {
    bars.windows(2)
        .map(|w| {
            let prev_close = w[0].close;
            let hl = w[1].high - w[1].low;
            let hc = (w[1].high - prev_close).abs();
            let lc = (w[1].low - prev_close).abs();
            hl.max(hc).max(lc)
        })
        .collect()
}

/// Most recent ATR value over `period`, or `None` when:
/// - `period` is zero,
/// - fewer than `period + 1` bars are available,
/// - any intermediate value is non-finite.
pub fn atr(bars: &[Bar], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < period + 1 {
        return None;
    }

    let tr = true_ranges(bars);
    let period_f = period as f64;

    let seed: f64 = tr[..period].iter().sum::<f64>() / period_f;
    if !seed.is_finite() {
        return None;
    }

    let mut value = seed;
    for &t in &tr[period..] {
        value = (value * (period_f - 1.0) + t) / period_f;
        if !value.is_finite() {
            return None;
        }
    }

    Some(value)
}

/// ATR expressed as a fraction of the latest close. Lets volatility be
/// compared across assets with different price scales.
pub fn atr_pct(bars: &[Bar], period: usize) -> Option<f64> {
    let value = atr(bars, period)?;
    let last_close = bars.last()?.close;
    if last_close <= 0.0 {
        return None;
    }
    Some(value / last_close)
}
