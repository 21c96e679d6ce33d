// =============================================================================
// Kill rules — hardcoded safety limits
// =============================================================================
//
// These are FROZEN at build time, not tunable parameters. Every rule is a
// failure mode that requires immediate protective action; warnings fire
// earlier on the same signals to give a human a head start.
//
// WARNING: loosening these values increases the risk of catastrophic loss.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Violation severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Critical,
}

/// What the watchdog does about a violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KillAction {
    Alert,
    EmergencyShutdown,
    /// The nuclear option: sticky halt, human intervention required.
    PermanentShutdown,
}

/// A breached rule.
#[derive(Debug, Clone, Serialize)]
pub struct KillViolation {
    pub rule: &'static str,
    pub severity: Severity,
    pub action: KillAction,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

impl KillViolation {
    fn critical(rule: &'static str, action: KillAction, reason: String) -> Self {
        Self {
            rule,
            severity: Severity::Critical,
            action,
            reason,
            timestamp: Utc::now(),
        }
    }

    fn warning(rule: &'static str, reason: String) -> Self {
        Self {
            rule,
            severity: Severity::Warning,
            action: KillAction::Alert,
            reason,
            timestamp: Utc::now(),
        }
    }
}

/// Early-warning thresholds: alert, never shut down.
#[derive(Debug, Clone, Copy)]
pub struct WarningThresholds {
    pub daily_loss_pct: f64,
    pub concentration_pct: f64,
    pub open_orders: usize,
    pub heartbeat_secs: u64,
}

impl Default for WarningThresholds {
    fn default() -> Self {
        Self {
            daily_loss_pct: -3.0,
            concentration_pct: 20.0,
            open_orders: 30,
            heartbeat_secs: 90,
        }
    }
}

/// The frozen rule set. Thresholds are INCLUSIVE: a rule fires exactly at
/// its limit and beyond, never below.
#[derive(Debug, Clone, Copy)]
pub struct KillRules {
    /// Daily PnL at or below this percentage: emergency shutdown.
    pub max_daily_loss_pct: f64,
    /// Equity at or below this fraction of initial equity: PERMANENT
    /// shutdown.
    pub permanent_equity_floor: f64,
    /// Any single position at or above this share of equity.
    pub max_position_concentration_pct: f64,
    /// Open order count at or above this: runaway detection.
    pub max_open_orders: usize,
    /// Order submissions per minute at or above this: runaway detection.
    pub max_orders_per_minute: usize,
    /// Any order open at or beyond this age: zombie detection. Orders fill,
    /// cancel, or fail; they never hang.
    pub max_order_age_secs: u64,
    /// Heartbeat silence at or beyond this: the engine is presumed dead.
    pub heartbeat_timeout_secs: u64,
    /// SIGTERM grace before SIGKILL.
    pub graceful_shutdown_timeout_secs: u64,
    /// Restart attempt cap before a human must intervene.
    pub max_restart_attempts: u32,
    /// Cooldown between automated kill/restart cycles.
    pub restart_cooldown_secs: u64,
    /// Broker latency above this defers kill decisions (network partition
    /// defence).
    pub max_api_latency_secs: f64,
}

impl Default for KillRules {
    fn default() -> Self {
        Self {
            max_daily_loss_pct: -5.0,
            permanent_equity_floor: 0.85,
            max_position_concentration_pct: 25.0,
            max_open_orders: 50,
            max_orders_per_minute: 20,
            max_order_age_secs: 300,
            heartbeat_timeout_secs: 120,
            graceful_shutdown_timeout_secs: 30,
            max_restart_attempts: 3,
            restart_cooldown_secs: 300,
            max_api_latency_secs: 5.0,
        }
    }
}

impl KillRules {
    pub fn check_daily_loss(
        &self,
        daily_pnl_pct: f64,
        warnings: &WarningThresholds,
    ) -> Option<KillViolation> {
        if daily_pnl_pct <= self.max_daily_loss_pct {
            return Some(KillViolation::critical(
                "daily_loss",
                KillAction::EmergencyShutdown,
                format!(
                    "daily loss limit breached: {daily_pnl_pct:.2}% <= {:.2}%",
                    self.max_daily_loss_pct
                ),
            ));
        }
        if daily_pnl_pct <= warnings.daily_loss_pct {
            return Some(KillViolation::warning(
                "daily_loss",
                format!("daily loss warning: {daily_pnl_pct:.2}%"),
            ));
        }
        None
    }

    pub fn check_permanent_drawdown(
        &self,
        equity: f64,
        initial_equity: f64,
    ) -> Option<KillViolation> {
        if initial_equity <= 0.0 {
            return None;
        }
        if equity <= initial_equity * self.permanent_equity_floor {
            let drawdown_pct = ((equity - initial_equity) / initial_equity) * 100.0;
            return Some(KillViolation::critical(
                "permanent_drawdown",
                KillAction::PermanentShutdown,
                format!(
                    "PERMANENT drawdown limit breached: {drawdown_pct:.2}% \
                     (equity {equity:.0} vs floor {:.0}); human intervention required",
                    initial_equity * self.permanent_equity_floor
                ),
            ));
        }
        None
    }

    pub fn check_position_concentration(
        &self,
        symbol: &str,
        position_value: f64,
        equity: f64,
        warnings: &WarningThresholds,
    ) -> Option<KillViolation> {
        if equity <= 0.0 {
            return None;
        }
        let concentration = (position_value.abs() / equity) * 100.0;
        if concentration >= self.max_position_concentration_pct {
            return Some(KillViolation::critical(
                "position_concentration",
                KillAction::EmergencyShutdown,
                format!(
                    "position concentration breached: {symbol} at {concentration:.1}% >= {:.1}%",
                    self.max_position_concentration_pct
                ),
            ));
        }
        if concentration >= warnings.concentration_pct {
            return Some(KillViolation::warning(
                "position_concentration",
                format!("concentration warning: {symbol} at {concentration:.1}%"),
            ));
        }
        None
    }

    pub fn check_open_orders(
        &self,
        order_count: usize,
        warnings: &WarningThresholds,
    ) -> Option<KillViolation> {
        if order_count >= self.max_open_orders {
            return Some(KillViolation::critical(
                "open_order_count",
                KillAction::EmergencyShutdown,
                format!(
                    "too many open orders: {order_count} >= {}",
                    self.max_open_orders
                ),
            ));
        }
        if order_count >= warnings.open_orders {
            return Some(KillViolation::warning(
                "open_order_count",
                format!("open order warning: {order_count}"),
            ));
        }
        None
    }

    pub fn check_order_rate(&self, orders_per_minute: usize) -> Option<KillViolation> {
        if orders_per_minute >= self.max_orders_per_minute {
            return Some(KillViolation::critical(
                "order_rate",
                KillAction::EmergencyShutdown,
                format!(
                    "order rate too high: {orders_per_minute}/min >= {}/min",
                    self.max_orders_per_minute
                ),
            ));
        }
        None
    }

    pub fn check_zombie_orders(&self, oldest_order_age_secs: u64) -> Option<KillViolation> {
        if oldest_order_age_secs >= self.max_order_age_secs {
            return Some(KillViolation::critical(
                "zombie_order",
                KillAction::EmergencyShutdown,
                format!(
                    "zombie order: open for {oldest_order_age_secs}s >= {}s",
                    self.max_order_age_secs
                ),
            ));
        }
        None
    }

    pub fn check_heartbeat(
        &self,
        seconds_since_heartbeat: u64,
        warnings: &WarningThresholds,
    ) -> Option<KillViolation> {
        if seconds_since_heartbeat >= self.heartbeat_timeout_secs {
            return Some(KillViolation::critical(
                "heartbeat",
                KillAction::EmergencyShutdown,
                format!(
                    "heartbeat timeout: {seconds_since_heartbeat}s >= {}s",
                    self.heartbeat_timeout_secs
                ),
            ));
        }
        if seconds_since_heartbeat >= warnings.heartbeat_secs {
            return Some(KillViolation::warning(
                "heartbeat",
                format!("heartbeat warning: {seconds_since_heartbeat}s silent"),
            ));
        }
        None
    }
}

// =============================================================================
// Tests — every rule fires exactly at or past its threshold, never below
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> (KillRules, WarningThresholds) {
        (KillRules::default(), WarningThresholds::default())
    }

    fn is_critical(v: &Option<KillViolation>) -> bool {
        matches!(
            v,
            Some(KillViolation {
                severity: Severity::Critical,
                ..
            })
        )
    }

    fn is_warning(v: &Option<KillViolation>) -> bool {
        matches!(
            v,
            Some(KillViolation {
                severity: Severity::Warning,
                ..
            })
        )
    }

    #[test]
    fn daily_loss_boundaries() {
        let (r, w) = rules();
        assert!(is_critical(&r.check_daily_loss(-5.0, &w)));
        assert!(is_critical(&r.check_daily_loss(-5.5, &w)));
        assert!(is_warning(&r.check_daily_loss(-4.99, &w)));
        assert!(is_warning(&r.check_daily_loss(-3.0, &w)));
        assert!(r.check_daily_loss(-2.99, &w).is_none());
        assert!(r.check_daily_loss(1.0, &w).is_none());
    }

    #[test]
    fn daily_loss_action_is_emergency() {
        let (r, w) = rules();
        let violation = r.check_daily_loss(-5.5, &w).unwrap();
        assert_eq!(violation.action, KillAction::EmergencyShutdown);
    }

    #[test]
    fn permanent_drawdown_boundaries() {
        let r = KillRules::default();
        // Floor is 85% of 100k = 85k.
        assert!(is_critical(&r.check_permanent_drawdown(85_000.0, 100_000.0)));
        assert!(is_critical(&r.check_permanent_drawdown(80_000.0, 100_000.0)));
        assert!(r.check_permanent_drawdown(85_001.0, 100_000.0).is_none());
        // Unknown initial equity: no decision.
        assert!(r.check_permanent_drawdown(50_000.0, 0.0).is_none());
    }

    #[test]
    fn permanent_drawdown_action_is_permanent() {
        let r = KillRules::default();
        let violation = r.check_permanent_drawdown(80_000.0, 100_000.0).unwrap();
        assert_eq!(violation.action, KillAction::PermanentShutdown);
    }

    #[test]
    fn concentration_boundaries() {
        let (r, w) = rules();
        // 25% of 100k = 25k.
        assert!(is_critical(&r.check_position_concentration(
            "AAPL", 25_000.0, 100_000.0, &w
        )));
        assert!(is_critical(&r.check_position_concentration(
            "AAPL", -30_000.0, 100_000.0, &w
        )));
        assert!(is_warning(&r.check_position_concentration(
            "AAPL", 20_000.0, 100_000.0, &w
        )));
        assert!(r
            .check_position_concentration("AAPL", 19_999.0, 100_000.0, &w)
            .is_none());
        assert!(r
            .check_position_concentration("AAPL", 10_000.0, 0.0, &w)
            .is_none());
    }

    #[test]
    fn open_order_boundaries() {
        let (r, w) = rules();
        assert!(is_critical(&r.check_open_orders(50, &w)));
        assert!(is_critical(&r.check_open_orders(51, &w)));
        assert!(is_warning(&r.check_open_orders(30, &w)));
        assert!(is_warning(&r.check_open_orders(49, &w)));
        assert!(r.check_open_orders(29, &w).is_none());
    }

    #[test]
    fn order_rate_boundaries() {
        let r = KillRules::default();
        assert!(is_critical(&r.check_order_rate(20)));
        assert!(is_critical(&r.check_order_rate(100)));
        assert!(r.check_order_rate(19).is_none());
    }

    #[test]
    fn zombie_boundaries() {
        let r = KillRules::default();
        assert!(is_critical(&r.check_zombie_orders(300)));
        assert!(is_critical(&r.check_zombie_orders(10_000)));
        assert!(r.check_zombie_orders(299).is_none());
    }

    #[test]
    fn heartbeat_boundaries() {
        let (r, w) = rules();
        assert!(is_critical(&r.check_heartbeat(120, &w)));
        assert!(is_critical(&r.check_heartbeat(600, &w)));
        assert!(is_warning(&r.check_heartbeat(90, &w)));
        assert!(is_warning(&r.check_heartbeat(119, &w)));
        assert!(r.check_heartbeat(89, &w).is_none());
    }

    #[test]
    fn warnings_never_shut_down() {
        let (r, w) = rules();
        for violation in [
            r.check_daily_loss(-3.5, &w),
            r.check_position_concentration("AAPL", 21_000.0, 100_000.0, &w),
            r.check_open_orders(35, &w),
            r.check_heartbeat(100, &w),
        ] {
            let violation = violation.unwrap();
            assert_eq!(violation.severity, Severity::Warning);
            assert_eq!(violation.action, KillAction::Alert);
        }
    }
}
