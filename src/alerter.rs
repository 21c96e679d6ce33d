// =============================================================================
// Alert dispatcher with deduplication
// =============================================================================
//
// Same alert within the dedup window = suppressed, and alerts over the hourly
// cap are suppressed too. Critical alerts are NEVER suppressed.
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

/// Alert severity levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warning => write!(f, "warning"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Thread-safe alert dispatcher.
pub struct Alerter {
    dedup_window: Duration,
    max_per_hour: usize,
    sent: Mutex<HashMap<String, Vec<Instant>>>,
}

impl Alerter {
    pub fn new(dedup_window_secs: u64, max_per_hour: usize) -> Self {
        Self {
            dedup_window: Duration::from_secs(dedup_window_secs),
            max_per_hour,
            sent: Mutex::new(HashMap::new()),
        }
    }

    /// Dispatch an alert. Returns `true` if the alert was emitted, `false`
    /// if deduplication suppressed it.
    pub fn send(&self, severity: Severity, message: &str) -> bool {
        if severity != Severity::Critical && !self.should_send(message) {
            debug!(message, "alert deduplicated");
            return false;
        }

        match severity {
            Severity::Info => info!(severity = %severity, message, "alert"),
            Severity::Warning => warn!(severity = %severity, message, "alert"),
            // Critical stays on `warn` level plumbing but is tagged; tracing
            // has no `critical`, and error! is reserved for code failures.
            Severity::Critical => warn!(severity = %severity, message, "ALERT"),
        }

        self.record(message);
        true
    }

    pub fn info(&self, message: &str) -> bool {
        self.send(Severity::Info, message)
    }

    pub fn warning(&self, message: &str) -> bool {
        self.send(Severity::Warning, message)
    }

    /// Critical alerts bypass all suppression.
    pub fn critical(&self, message: &str) -> bool {
        self.send(Severity::Critical, message)
    }

    fn should_send(&self, message: &str) -> bool {
        let now = Instant::now();
        let mut sent = self.sent.lock();
        let times = sent.entry(message.to_string()).or_default();

        // Drop entries older than an hour; they no longer count for anything.
        times.retain(|t| now.duration_since(*t) < Duration::from_secs(3600));

        // Suppress repeats inside the dedup window.
        if times
            .iter()
            .any(|t| now.duration_since(*t) < self.dedup_window)
        {
            return false;
        }

        // Hourly cap.
        times.len() < self.max_per_hour
    }

    fn record(&self, message: &str) {
        self.sent
            .lock()
            .entry(message.to_string())
            .or_default()
            .push(Instant::now());
    }
}

impl Default for Alerter {
    fn default() -> Self {
        // 5-minute dedup window, 10 identical alerts per hour.
        Self::new(300, 10)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_warning_suppressed_in_window() {
        let alerter = Alerter::new(300, 10);
        assert!(alerter.warning("drawdown at 2%"));
        assert!(!alerter.warning("drawdown at 2%"));
    }

    #[test]
    fn different_messages_not_suppressed() {
        let alerter = Alerter::new(300, 10);
        assert!(alerter.warning("drawdown at 2%"));
        assert!(alerter.warning("drawdown at 3%"));
    }

    #[test]
    fn critical_never_suppressed() {
        let alerter = Alerter::new(300, 10);
        for _ in 0..50 {
            assert!(alerter.critical("EMERGENCY SHUTDOWN"));
        }
    }

    #[test]
    fn zero_window_still_enforces_hourly_cap() {
        let alerter = Alerter::new(0, 3);
        assert!(alerter.warning("x"));
        assert!(alerter.warning("x"));
        assert!(alerter.warning("x"));
        assert!(!alerter.warning("x"));
    }
}
