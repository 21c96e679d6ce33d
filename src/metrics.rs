// =============================================================================
// Performance metrics — daily snapshot for the performance table
// =============================================================================

use crate::risk::DrawdownMetrics;
use crate::storage::column_store::PerformanceRow;

/// Build the daily performance row from the account and drawdown state.
pub fn performance_row(
    date: &str,
    equity: f64,
    cash: f64,
    positions_value: f64,
    prev_equity: Option<f64>,
    drawdown: &DrawdownMetrics,
) -> PerformanceRow {
    let daily_return = prev_equity
        .filter(|&prev| prev > 0.0)
        .map(|prev| (equity - prev) / prev);

    let cumulative_return = if drawdown.initial_equity > 0.0 {
        Some((equity - drawdown.initial_equity) / drawdown.initial_equity)
    } else {
        None
    };

    PerformanceRow {
        date: date.to_string(),
        equity,
        cash,
        positions_value,
        daily_return,
        cumulative_return,
        max_drawdown: Some(drawdown.max_drawdown_pct / 100.0),
        current_drawdown: Some(drawdown.current_drawdown_pct / 100.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drawdown() -> DrawdownMetrics {
        DrawdownMetrics {
            current_equity: 102_000.0,
            peak_equity: 105_000.0,
            initial_equity: 100_000.0,
            current_drawdown_pct: -2.857,
            total_drawdown_pct: 2.0,
            days_since_peak: 3,
            max_drawdown_pct: -4.0,
        }
    }

    #[test]
    fn returns_are_computed() {
        let row = performance_row(
            "2025-06-06",
            102_000.0,
            40_000.0,
            62_000.0,
            Some(100_000.0),
            &drawdown(),
        );
        assert!((row.daily_return.unwrap() - 0.02).abs() < 1e-12);
        assert!((row.cumulative_return.unwrap() - 0.02).abs() < 1e-12);
        assert!((row.current_drawdown.unwrap() - (-0.02857)).abs() < 1e-9);
        assert!((row.max_drawdown.unwrap() - (-0.04)).abs() < 1e-12);
    }

    #[test]
    fn missing_prev_equity_leaves_daily_return_null() {
        let row = performance_row("2025-06-06", 102_000.0, 40_000.0, 62_000.0, None, &drawdown());
        assert!(row.daily_return.is_none());
        assert!(row.cumulative_return.is_some());
    }

    #[test]
    fn zero_prev_equity_guarded() {
        let row = performance_row(
            "2025-06-06",
            102_000.0,
            40_000.0,
            62_000.0,
            Some(0.0),
            &drawdown(),
        );
        assert!(row.daily_return.is_none());
    }
}
