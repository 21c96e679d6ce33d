// =============================================================================
// Drawdown monitor — peak tracking and exposure policy
// =============================================================================
//
// Tracks peak equity and derives two policies:
//
//   reduce exposure  — current drawdown from peak beyond the daily limit
//   halt trading     — total drawdown from initial equity beyond the total
//                      limit; the loop stops executing signals entirely
//
// The monitor only advises; the watchdog enforces its own (stricter) limits
// out-of-process.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Snapshot of drawdown state after an update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrawdownMetrics {
    pub current_equity: f64,
    pub peak_equity: f64,
    pub initial_equity: f64,
    /// Percent from peak; negative when under water.
    pub current_drawdown_pct: f64,
    /// Percent from initial equity.
    pub total_drawdown_pct: f64,
    pub days_since_peak: i64,
    /// Deepest drawdown from peak ever observed (signed).
    pub max_drawdown_pct: f64,
}

pub struct DrawdownMonitor {
    max_daily_drawdown_pct: f64,
    max_total_drawdown_pct: f64,
    initial_equity: f64,
    peak_equity: Option<f64>,
    peak_date: Option<DateTime<Utc>>,
    max_drawdown_pct: f64,
}

impl DrawdownMonitor {
    pub fn new(max_daily_drawdown_pct: f64, max_total_drawdown_pct: f64, initial_equity: f64) -> Self {
        info!(
            max_daily = max_daily_drawdown_pct,
            max_total = max_total_drawdown_pct,
            initial_equity,
            "drawdown monitor initialised"
        );
        Self {
            max_daily_drawdown_pct,
            max_total_drawdown_pct,
            initial_equity,
            peak_equity: None,
            peak_date: None,
            max_drawdown_pct: 0.0,
        }
    }

    /// Fold a fresh equity sample into the peak state and return metrics.
    ///
    /// `last_equity` (previous session close) is used only for the daily
    /// drawdown warning log.
    pub fn update(&mut self, current_equity: f64, last_equity: Option<f64>) -> DrawdownMetrics {
        let peak = match self.peak_equity {
            Some(peak) if current_equity <= peak => peak,
            _ => {
                self.peak_equity = Some(current_equity);
                self.peak_date = Some(Utc::now());
                current_equity
            }
        };

        let current_drawdown_pct = if peak > 0.0 {
            ((current_equity - peak) / peak) * 100.0
        } else {
            0.0
        };

        let total_drawdown_pct = if self.initial_equity > 0.0 {
            ((current_equity - self.initial_equity) / self.initial_equity) * 100.0
        } else {
            0.0
        };

        if current_drawdown_pct.abs() > self.max_drawdown_pct.abs() {
            self.max_drawdown_pct = current_drawdown_pct;
        }

        let days_since_peak = self
            .peak_date
            .map(|d| Utc::now().signed_duration_since(d).num_days())
            .unwrap_or(0);

        let metrics = DrawdownMetrics {
            current_equity,
            peak_equity: peak,
            initial_equity: self.initial_equity,
            current_drawdown_pct,
            total_drawdown_pct,
            days_since_peak,
            max_drawdown_pct: self.max_drawdown_pct,
        };

        if let Some(last) = last_equity {
            if last > 0.0 {
                let daily_pct = ((current_equity - last) / last) * 100.0;
                if daily_pct < -self.max_daily_drawdown_pct {
                    warn!(
                        daily_pct,
                        limit = -self.max_daily_drawdown_pct,
                        "daily drawdown limit breached, reducing exposure"
                    );
                }
            }
        }

        if self.should_halt_trading(&metrics) {
            warn!(
                total_drawdown_pct = metrics.total_drawdown_pct,
                limit = self.max_total_drawdown_pct,
                "total drawdown limit breached, trading halt advised"
            );
        }

        metrics
    }

    /// Exposure should shrink when the drawdown from peak passes the daily
    /// limit.
    pub fn should_reduce_exposure(&self, metrics: &DrawdownMetrics) -> bool {
        metrics.current_drawdown_pct.abs() > self.max_daily_drawdown_pct
    }

    /// Trading halts when the total drawdown passes the hard limit.
    pub fn should_halt_trading(&self, metrics: &DrawdownMetrics) -> bool {
        metrics.total_drawdown_pct.abs() > self.max_total_drawdown_pct
    }

    /// Position scale under drawdown policy:
    ///   0 when halted, at least 0.25 when reducing, else 1.
    pub fn position_scale(&self, metrics: &DrawdownMetrics) -> f64 {
        if self.should_halt_trading(metrics) {
            return 0.0;
        }
        if self.should_reduce_exposure(metrics) {
            let reduction = metrics.current_drawdown_pct.abs() / self.max_daily_drawdown_pct;
            return (1.0 - reduction).max(0.25);
        }
        1.0
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> DrawdownMonitor {
        DrawdownMonitor::new(3.0, 10.0, 100_000.0)
    }

    #[test]
    fn first_update_sets_peak() {
        let mut m = monitor();
        let metrics = m.update(100_000.0, None);
        assert!((metrics.peak_equity - 100_000.0).abs() < 1e-9);
        assert!(metrics.current_drawdown_pct.abs() < 1e-9);
        assert!(metrics.total_drawdown_pct.abs() < 1e-9);
    }

    #[test]
    fn new_high_moves_peak() {
        let mut m = monitor();
        m.update(100_000.0, None);
        let metrics = m.update(110_000.0, None);
        assert!((metrics.peak_equity - 110_000.0).abs() < 1e-9);
        assert!((metrics.total_drawdown_pct - 10.0).abs() < 1e-9);
    }

    #[test]
    fn drawdown_measured_from_peak() {
        let mut m = monitor();
        m.update(100_000.0, None);
        m.update(110_000.0, None);
        let metrics = m.update(104_500.0, None);
        // 5% off the 110k peak, but +4.5% on initial.
        assert!((metrics.current_drawdown_pct - (-5.0)).abs() < 1e-9);
        assert!((metrics.total_drawdown_pct - 4.5).abs() < 1e-9);
    }

    #[test]
    fn reduce_exposure_beyond_daily_limit() {
        let mut m = monitor();
        m.update(100_000.0, None);
        let shallow = m.update(97_500.0, None); // -2.5% from peak
        assert!(!m.should_reduce_exposure(&shallow));

        let deep = m.update(96_000.0, None); // -4% from peak
        assert!(m.should_reduce_exposure(&deep));
        assert!(!m.should_halt_trading(&deep));
    }

    #[test]
    fn halt_beyond_total_limit_and_scale_zero() {
        let mut m = monitor();
        m.update(100_000.0, None);
        let metrics = m.update(89_000.0, None); // -11% total
        assert!(m.should_halt_trading(&metrics));
        assert!(m.position_scale(&metrics).abs() < 1e-12);
    }

    #[test]
    fn halt_iff_total_exceeds_limit() {
        let mut m = monitor();
        m.update(100_000.0, None);

        // Exactly at the limit: |total| == limit is NOT beyond it.
        let at_limit = m.update(90_000.0, None);
        assert!(!m.should_halt_trading(&at_limit));

        let beyond = m.update(89_999.0, None);
        assert!(m.should_halt_trading(&beyond));
    }

    #[test]
    fn scale_when_reducing_is_bounded() {
        let mut m = monitor();
        m.update(100_000.0, None);

        // -4% from peak: reduction = 4/3, scale = max(0.25, 1 - 1.333) = 0.25.
        let deep = m.update(96_000.0, None);
        let scale = m.position_scale(&deep);
        assert!((scale - 0.25).abs() < 1e-9);

        // -3.3% from a fresh peak: reduction = 1.1, still floored at 0.25.
        let mut m2 = monitor();
        m2.update(100_000.0, None);
        let mild = m2.update(96_700.0, None);
        let scale2 = m2.position_scale(&mild);
        assert!((0.25..=1.0).contains(&scale2));
    }

    #[test]
    fn normal_conditions_scale_one() {
        let mut m = monitor();
        m.update(100_000.0, None);
        let metrics = m.update(99_500.0, None);
        assert!((m.position_scale(&metrics) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn max_drawdown_is_sticky() {
        let mut m = monitor();
        m.update(100_000.0, None);
        m.update(92_000.0, None); // -8%
        let recovered = m.update(99_000.0, None);
        assert!((recovered.max_drawdown_pct - (-8.0)).abs() < 1e-9);
    }
}
