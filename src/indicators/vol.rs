// =============================================================================
// Realized volatility
// =============================================================================
//
// The regime detector's SLOW measure: the standard deviation of simple
// returns over a window, annualized with sqrt(252). Slow to react by design;
// the fast ATR catches what this misses.
// =============================================================================

const TRADING_DAYS_PER_YEAR: f64 = 252.0;

/// Simple returns from consecutive closes (length = closes.len() - 1).
pub fn simple_returns(closes: &[f64]) -> Vec<f64> {
    closes
        .windows(2)
        .filter(|w| w[0] != 0.0)
        .map(|w| (w[1] - w[0]) / w[0])
        .collect()
}

/// Annualized realized volatility of the last `window` returns, or `None`
/// when there are not enough returns or the result is non-finite.
pub fn realized_vol(closes: &[f64], window: usize) -> Option<f64> {
    if window < 2 {
        return None;
    }

    let returns = simple_returns(closes);
    if returns.len() < window {
        return None;
    }

    let tail = &returns[returns.len() - window..];
    let vol = std_dev(tail)? * TRADING_DAYS_PER_YEAR.sqrt();
    vol.is_finite().then_some(vol)
}

/// Rolling annualized realized vol series over `window`, oldest first.
/// Feeds the percentile classification of the current volatility level.
pub fn rolling_realized_vol(closes: &[f64], window: usize) -> Vec<f64> {
    if window < 2 {
        return Vec::new();
    }

    let returns = simple_returns(closes);
    if returns.len() < window {
        return Vec::new();
    }

    returns
        .windows(window)
        .filter_map(|w| std_dev(w).map(|s| s * TRADING_DAYS_PER_YEAR.sqrt()))
        .collect()
}

/// Percentile rank (0-100) of `value` within `history`: the share of
/// historical values strictly below it.
pub fn percentile_rank(history: &[f64], value: f64) -> f64 {
    if history.is_empty() {
        return 50.0;
    }
    let below = history.iter().filter(|&&v| v < value).count();
    (below as f64 / history.len() as f64) * 100.0
}

/// Sample standard deviation.
fn std_dev(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    let sd = variance.sqrt();
    sd.is_finite().then_some(sd)
}
