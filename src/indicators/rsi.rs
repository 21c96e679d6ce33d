// =============================================================================
// Relative Strength Index (RSI) — Wilder's Smoothing
// =============================================================================
//
//   1. Deltas from consecutive closes.
//   2. Seed avg gain / avg loss with the SMA of the first `period` deltas.
//   3. Wilder smoothing:
//        avg_gain = (prev_avg_gain * (period - 1) + gain) / period
//        avg_loss = (prev_avg_loss * (period - 1) + loss) / period
//   4. RS = avg_gain / avg_loss; RSI = 100 - 100 / (1 + RS)
//
// Mean-reversion reads RSI < 30 as oversold and RSI > 70 as overbought.
// =============================================================================

/// RSI series for `closes` over `period`, one value per close starting at
/// index `period`. Empty on zero period or insufficient data; truncated at
/// the first non-finite value.
pub fn rsi_series(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() < period + 1 {
        return Vec::new();
    }

    let deltas: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();

    let (sum_gain, sum_loss) = deltas[..period]
        .iter()
        .fold((0.0_f64, 0.0_f64), |(g, l), &d| {
            if d > 0.0 {
                (g + d, l)
            } else {
                (g, l + d.abs())
            }
        });

    let period_f = period as f64;
    let mut avg_gain = sum_gain / period_f;
    let mut avg_loss = sum_loss / period_f;

    let mut series = Vec::with_capacity(deltas.len() - period + 1);
    match from_averages(avg_gain, avg_loss) {
        Some(value) => series.push(value),
        None => return Vec::new(),
    }

    for &delta in &deltas[period..] {
        let gain = if delta > 0.0 { delta } else { 0.0 };
        let loss = if delta < 0.0 { delta.abs() } else { 0.0 };

        avg_gain = (avg_gain * (period_f - 1.0) + gain) / period_f;
        avg_loss = (avg_loss * (period_f - 1.0) + loss) / period_f;

        match from_averages(avg_gain, avg_loss) {
            Some(value) => series.push(value),
            None => break,
        }
    }

    series
}

/// Most recent RSI value.
pub fn latest_rsi(closes: &[f64], period: usize) -> Option<f64> {
    rsi_series(closes, period).last().copied()
}

/// Averages to RSI in [0, 100]. 50 when nothing moved, 100 when there were
/// no losses at all.
fn from_averages(avg_gain: f64, avg_loss: f64) -> Option<f64> {
    let value = if avg_loss == 0.0 && avg_gain == 0.0 {
        50.0
    } else if avg_loss == 0.0 {
        100.0
    } else {
        let rs = avg_gain / avg_loss;
        100.0 - 100.0 / (1.0 + rs)
    };

    value.is_finite().then_some(value)
}
