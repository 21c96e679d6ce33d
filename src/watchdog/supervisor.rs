// =============================================================================
// Watchdog daemon — polling loop, kill protocol, restart discipline
// =============================================================================
//
// A single polling loop with blocking sleeps between checks. Rule priority
// per poll: daily loss, permanent drawdown, position concentration, open
// order count, order rate, zombie orders, heartbeat.
//
// Emergency shutdown sequence (each step completes before the next):
//   1. Cancel all open orders (direct broker call).
//   2. Close all positions (direct broker call).
//   3. Kill the engine: SIGTERM, wait the graceful timeout, then SIGKILL.
//   4. Clean up the PID file.
//   5. Enforce the restart cooldown and attempt cap.
//
// Permanent shutdown additionally engages the sticky halt marker; the
// watchdog then refuses to monitor until a human removes it.
// =============================================================================

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

use crate::alerter::Alerter;
use crate::broker::{BrokerGateway, OrderStatusFilter};
use crate::engine::ENGINE_PROCESS;
use crate::storage::StateStore;

use super::halt_marker::HaltMarker;
use super::rules::{KillAction, KillRules, KillViolation, Severity, WarningThresholds};

/// Seam for signal delivery so the kill protocol is testable without
/// shooting real processes.
pub trait ProcessController: Send + Sync {
    /// Graceful stop (SIGTERM).
    fn terminate(&self, pid: i32) -> Result<()>;
    /// Hard kill (SIGKILL).
    fn force_kill(&self, pid: i32) -> Result<()>;
    /// Liveness probe (signal 0).
    fn is_alive(&self, pid: i32) -> bool;
}

/// The real thing.
pub struct UnixProcessController;

impl ProcessController for UnixProcessController {
    fn terminate(&self, pid: i32) -> Result<()> {
        let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
        if rc != 0 {
            anyhow::bail!("SIGTERM to {pid} failed: {}", std::io::Error::last_os_error());
        }
        Ok(())
    }

    fn force_kill(&self, pid: i32) -> Result<()> {
        let rc = unsafe { libc::kill(pid, libc::SIGKILL) };
        if rc != 0 {
            anyhow::bail!("SIGKILL to {pid} failed: {}", std::io::Error::last_os_error());
        }
        Ok(())
    }

    fn is_alive(&self, pid: i32) -> bool {
        unsafe { libc::kill(pid, 0) == 0 }
    }
}

pub struct Watchdog {
    rules: KillRules,
    warnings: WarningThresholds,
    broker: Arc<dyn BrokerGateway>,
    cache: Arc<dyn StateStore>,
    controller: Arc<dyn ProcessController>,
    alerter: Alerter,
    pid_file: PathBuf,
    halt_marker: HaltMarker,
    check_interval: Duration,

    initial_equity: Option<f64>,
    started: Instant,
    last_heartbeat_seen: Option<Instant>,
    seen_orders: HashSet<String>,
    order_arrivals: VecDeque<Instant>,
    restart_attempts: u32,
    last_kill: Option<Instant>,
    permanent: bool,
}

impl Watchdog {
    pub fn new(
        rules: KillRules,
        broker: Arc<dyn BrokerGateway>,
        cache: Arc<dyn StateStore>,
        controller: Arc<dyn ProcessController>,
        pid_file: impl AsRef<Path>,
        halt_marker_path: impl AsRef<Path>,
        check_interval: Duration,
    ) -> Self {
        let halt_marker = HaltMarker::new(halt_marker_path);
        let permanent = halt_marker.engaged();
        if permanent {
            warn!("halt marker already engaged at startup; refusing to monitor");
        }

        info!(
            pid_file = %pid_file.as_ref().display(),
            check_interval_secs = check_interval.as_secs(),
            "watchdog initialised"
        );

        Self {
            rules,
            warnings: WarningThresholds::default(),
            broker,
            cache,
            controller,
            alerter: Alerter::default(),
            pid_file: pid_file.as_ref().to_path_buf(),
            halt_marker,
            check_interval,
            initial_equity: None,
            started: Instant::now(),
            last_heartbeat_seen: None,
            seen_orders: HashSet::new(),
            order_arrivals: VecDeque::new(),
            restart_attempts: 0,
            last_kill: None,
            permanent: false,
        }
        .with_permanent(permanent)
    }

    fn with_permanent(mut self, permanent: bool) -> Self {
        self.permanent = permanent;
        self
    }

    pub fn is_permanently_halted(&self) -> bool {
        self.permanent
    }

    /// Main loop; runs forever.
    pub async fn run(&mut self) {
        info!("watchdog running");
        self.record_initial_equity().await;

        loop {
            if self.permanent {
                error!("permanent shutdown active; human intervention required");
                tokio::time::sleep(Duration::from_secs(60)).await;
                continue;
            }

            match self.poll_once().await {
                Ok(()) => {}
                Err(e) => {
                    error!(error = %e, "watchdog poll error");
                    self.alerter.warning(&format!("watchdog internal error: {e:#}"));
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    continue;
                }
            }

            tokio::time::sleep(self.check_interval).await;
        }
    }

    async fn record_initial_equity(&mut self) {
        // The cache may carry the engine's recorded figure; otherwise the
        // broker account at watchdog start is the baseline.
        if let Ok(Some(equity)) = self.cache.get_initial_equity() {
            self.initial_equity = Some(equity);
            info!(equity, "initial equity taken from cache");
            return;
        }
        match self.broker.get_account().await {
            Ok(account) => {
                self.initial_equity = Some(account.equity);
                info!(equity = account.equity, "initial equity recorded");
            }
            Err(e) => {
                warn!(error = %e, "failed to record initial equity; retrying next poll");
            }
        }
    }

    /// One full rule evaluation. Violations are acted upon inline.
    pub async fn poll_once(&mut self) -> Result<()> {
        if self.initial_equity.is_none() {
            self.record_initial_equity().await;
        }

        match self.check_all_rules().await {
            Ok(Some(violation)) => self.act(violation).await,
            Ok(None) => {
                debug!("watchdog check passed");
                Ok(())
            }
            Err(e) => {
                // Broker queries failed: is it them or the network?
                if !self.broker_api_healthy().await {
                    warn!("broker API unhealthy; deferring kill decisions");
                    return Ok(());
                }
                Err(e)
            }
        }
    }

    async fn check_all_rules(&mut self) -> Result<Option<KillViolation>> {
        let account = self.broker.get_account().await.context("account query")?;
        let positions = self
            .broker
            .list_positions()
            .await
            .context("positions query")?;
        let open_orders = self
            .broker
            .list_orders(OrderStatusFilter::Open, 500)
            .await
            .context("orders query")?;

        self.track_order_rate(&open_orders);

        // 1. Daily loss.
        let daily_pnl_pct = if account.last_equity > 0.0 {
            ((account.equity - account.last_equity) / account.last_equity) * 100.0
        } else {
            0.0
        };
        if let Some(v) = self.rules.check_daily_loss(daily_pnl_pct, &self.warnings) {
            if v.severity == Severity::Critical {
                return Ok(Some(v));
            }
            self.alert(&v);
        }

        // 2. Permanent drawdown.
        if let Some(initial) = self.initial_equity {
            if let Some(v) = self.rules.check_permanent_drawdown(account.equity, initial) {
                return Ok(Some(v));
            }
        }

        // 3. Position concentration.
        for position in &positions {
            if let Some(v) = self.rules.check_position_concentration(
                &position.symbol,
                position.market_value,
                account.equity,
                &self.warnings,
            ) {
                if v.severity == Severity::Critical {
                    return Ok(Some(v));
                }
                self.alert(&v);
            }
        }

        // 4. Open order count.
        if let Some(v) = self
            .rules
            .check_open_orders(open_orders.len(), &self.warnings)
        {
            if v.severity == Severity::Critical {
                return Ok(Some(v));
            }
            self.alert(&v);
        }

        // 5. Order rate.
        let per_minute = self.orders_in_last_minute();
        if let Some(v) = self.rules.check_order_rate(per_minute) {
            return Ok(Some(v));
        }

        // 6. Zombie orders.
        if let Some(oldest) = open_orders
            .iter()
            .map(|o| Utc::now().signed_duration_since(o.created_at).num_seconds())
            .max()
        {
            if oldest >= 0 {
                if let Some(v) = self.rules.check_zombie_orders(oldest as u64) {
                    return Ok(Some(v));
                }
            }
        }

        // 7. Heartbeat, with the API-health defence: a silent engine behind
        // a slow broker link is indistinguishable from a network partition,
        // so a slow probe defers the decision.
        match self.cache.check_heartbeat(ENGINE_PROCESS) {
            Ok(Some(_)) => {
                self.last_heartbeat_seen = Some(Instant::now());
            }
            Ok(None) | Err(_) => {
                let silent_for = self
                    .last_heartbeat_seen
                    .map(|t| t.elapsed().as_secs())
                    .unwrap_or_else(|| self.started.elapsed().as_secs());

                if let Some(v) = self.rules.check_heartbeat(silent_for, &self.warnings) {
                    if v.severity == Severity::Critical {
                        if !self.broker_api_healthy().await {
                            warn!("heartbeat miss with unhealthy API; deferring");
                            return Ok(None);
                        }
                        return Ok(Some(v));
                    }
                    self.alert(&v);
                }
            }
        }

        Ok(None)
    }

    fn track_order_rate(&mut self, open_orders: &[crate::broker::BrokerOrder]) {
        let now = Instant::now();
        for order in open_orders {
            if self.seen_orders.insert(order.id.clone()) {
                self.order_arrivals.push_back(now);
            }
        }
        while let Some(front) = self.order_arrivals.front() {
            if now.duration_since(*front).as_secs() > 60 {
                self.order_arrivals.pop_front();
            } else {
                break;
            }
        }
    }

    fn orders_in_last_minute(&self) -> usize {
        self.order_arrivals.len()
    }

    async fn broker_api_healthy(&self) -> bool {
        let start = Instant::now();
        match self.broker.get_clock().await {
            Ok(_) => {
                let latency = start.elapsed().as_secs_f64();
                if latency > self.rules.max_api_latency_secs {
                    warn!(latency, "broker API slow");
                    false
                } else {
                    true
                }
            }
            Err(e) => {
                warn!(error = %e, "broker API probe failed");
                false
            }
        }
    }

    fn alert(&self, violation: &KillViolation) {
        self.alerter.warning(&violation.reason);
    }

    async fn act(&mut self, violation: KillViolation) -> Result<()> {
        match violation.action {
            KillAction::Alert => {
                self.alert(&violation);
                Ok(())
            }
            KillAction::EmergencyShutdown => self.emergency_shutdown(&violation.reason).await,
            KillAction::PermanentShutdown => self.permanent_shutdown(&violation.reason).await,
        }
    }

    /// Liquidate everything, then kill the engine.
    pub async fn emergency_shutdown(&mut self, reason: &str) -> Result<()> {
        error!(reason, "EMERGENCY SHUTDOWN");
        self.alerter.critical(&format!("EMERGENCY SHUTDOWN: {reason}"));

        // Step 1: cancel every open order.
        let cancelled = self
            .broker
            .cancel_all_orders()
            .await
            .context("emergency cancel-all failed")?;
        info!(cancelled, "open orders cancelled");

        // Step 2: flatten every position.
        let closed = self
            .broker
            .close_all_positions()
            .await
            .context("emergency close-all failed")?;
        info!(closed, "positions closed");

        // Steps 3-5: kill the engine under the restart discipline.
        self.kill_engine().await;

        Ok(())
    }

    /// Emergency shutdown plus the sticky flag. The system stays down until
    /// a human removes the marker.
    pub async fn permanent_shutdown(&mut self, reason: &str) -> Result<()> {
        error!(reason, "PERMANENT SHUTDOWN");
        self.alerter.critical(&format!("PERMANENT SHUTDOWN: {reason}"));

        let result = self.emergency_shutdown(reason).await;

        self.halt_marker.engage(reason)?;
        self.permanent = true;

        error!("system halted; human intervention required to restart");
        result
    }

    /// Graceful-stop first, force-kill only after the grace period.
    async fn kill_engine(&mut self) {
        let Some(pid) = self.read_pid() else {
            warn!("engine PID file missing; nothing to kill");
            return;
        };

        // Restart discipline: cooldown and attempt cap gate the kill, not
        // the liquidation that already happened.
        if let Some(last) = self.last_kill {
            let cooldown = Duration::from_secs(self.rules.restart_cooldown_secs);
            if last.elapsed() < cooldown {
                warn!(
                    remaining_secs = (cooldown - last.elapsed()).as_secs(),
                    "restart cooldown active; skipping kill"
                );
                return;
            }
        }
        if self.restart_attempts >= self.rules.max_restart_attempts {
            error!(
                attempts = self.restart_attempts,
                "max restart attempts exceeded; human intervention required"
            );
            self.alerter
                .critical("max restart attempts exceeded; human intervention required");
            return;
        }

        info!(pid, "sending graceful stop");
        match self.controller.terminate(pid) {
            Ok(()) => {}
            Err(e) => {
                warn!(pid, error = %e, "graceful stop failed (process already gone?)");
                self.cleanup_pid_file();
                return;
            }
        }

        let deadline = Duration::from_secs(self.rules.graceful_shutdown_timeout_secs);
        if self.wait_for_exit(pid, deadline).await {
            info!(pid, "engine exited gracefully");
        } else {
            warn!(pid, "graceful stop timed out; force-killing");
            if let Err(e) = self.controller.force_kill(pid) {
                warn!(pid, error = %e, "force kill failed");
            }
            self.alerter
                .warning("engine required SIGKILL; check for state corruption");
        }

        self.cleanup_pid_file();
        self.restart_attempts += 1;
        self.last_kill = Some(Instant::now());
    }

    async fn wait_for_exit(&self, pid: i32, timeout: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if !self.controller.is_alive(pid) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        !self.controller.is_alive(pid)
    }

    fn read_pid(&self) -> Option<i32> {
        let content = std::fs::read_to_string(&self.pid_file).ok()?;
        content.trim().parse().ok()
    }

    fn cleanup_pid_file(&self) {
        if self.pid_file.exists() {
            if let Err(e) = std::fs::remove_file(&self.pid_file) {
                warn!(error = %e, "pid file cleanup failed");
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Account, BrokerOrder, BrokerPosition, Clock};
    use crate::storage::MemoryStateStore;
    use crate::types::{OrderType, Side};
    use async_trait::async_trait;
    use parking_lot::{Mutex, RwLock};

    /// Broker double that records the ORDER of protective calls.
    struct ScriptedBroker {
        equity: RwLock<f64>,
        last_equity: RwLock<f64>,
        positions: RwLock<Vec<BrokerPosition>>,
        open_orders: RwLock<Vec<BrokerOrder>>,
        calls: Mutex<Vec<&'static str>>,
    }

    impl ScriptedBroker {
        fn new(equity: f64, last_equity: f64) -> Self {
            Self {
                equity: RwLock::new(equity),
                last_equity: RwLock::new(last_equity),
                positions: RwLock::new(Vec::new()),
                open_orders: RwLock::new(Vec::new()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl BrokerGateway for ScriptedBroker {
        async fn get_account(&self) -> Result<Account> {
            Ok(Account {
                equity: *self.equity.read(),
                last_equity: *self.last_equity.read(),
                cash: *self.equity.read(),
            })
        }

        async fn get_clock(&self) -> Result<Clock> {
            Ok(Clock {
                is_open: true,
                timestamp: Utc::now(),
            })
        }

        async fn list_positions(&self) -> Result<Vec<BrokerPosition>> {
            Ok(self.positions.read().clone())
        }

        async fn list_orders(
            &self,
            _status: OrderStatusFilter,
            _limit: usize,
        ) -> Result<Vec<BrokerOrder>> {
            Ok(self.open_orders.read().clone())
        }

        async fn submit_limit_order(
            &self,
            _s: &str,
            _q: f64,
            _side: Side,
            _p: f64,
            _c: &str,
        ) -> Result<BrokerOrder> {
            anyhow::bail!("watchdog never submits")
        }

        async fn submit_market_order(
            &self,
            _s: &str,
            _q: f64,
            _side: Side,
            _c: &str,
        ) -> Result<BrokerOrder> {
            anyhow::bail!("watchdog never submits")
        }

        async fn cancel_order(&self, _order_id: &str) -> Result<()> {
            Ok(())
        }

        async fn cancel_all_orders(&self) -> Result<usize> {
            self.calls.lock().push("cancel_all_orders");
            let count = self.open_orders.read().len();
            self.open_orders.write().clear();
            Ok(count)
        }

        async fn close_position(&self, _symbol: &str) -> Result<()> {
            Ok(())
        }

        async fn close_all_positions(&self) -> Result<usize> {
            self.calls.lock().push("close_all_positions");
            let count = self.positions.read().len();
            self.positions.write().clear();
            Ok(count)
        }

        async fn get_order_by_client_id(&self, _client_id: &str) -> Result<Option<BrokerOrder>> {
            Ok(None)
        }
    }

    /// Controller double: terminate marks the process dead; everything is
    /// recorded.
    #[derive(Default)]
    struct FakeController {
        alive: RwLock<bool>,
        calls: Mutex<Vec<&'static str>>,
        ignore_sigterm: bool,
    }

    impl FakeController {
        fn live() -> Self {
            Self {
                alive: RwLock::new(true),
                calls: Mutex::new(Vec::new()),
                ignore_sigterm: false,
            }
        }

        fn stubborn() -> Self {
            Self {
                alive: RwLock::new(true),
                calls: Mutex::new(Vec::new()),
                ignore_sigterm: true,
            }
        }

        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().clone()
        }
    }

    impl ProcessController for FakeController {
        fn terminate(&self, _pid: i32) -> Result<()> {
            self.calls.lock().push("sigterm");
            if !self.ignore_sigterm {
                *self.alive.write() = false;
            }
            Ok(())
        }

        fn force_kill(&self, _pid: i32) -> Result<()> {
            self.calls.lock().push("sigkill");
            *self.alive.write() = false;
            Ok(())
        }

        fn is_alive(&self, _pid: i32) -> bool {
            *self.alive.read()
        }
    }

    struct Fixture {
        dir: tempfile::TempDir,
        broker: Arc<ScriptedBroker>,
        controller: Arc<FakeController>,
        watchdog: Watchdog,
    }

    fn fixture(broker: ScriptedBroker, controller: FakeController) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("engine.pid");
        std::fs::write(&pid_file, "12345\n").unwrap();

        let broker = Arc::new(broker);
        let controller = Arc::new(controller);
        let cache = Arc::new(MemoryStateStore::new());
        cache.set_initial_equity(100_000.0).unwrap();
        cache.send_heartbeat(ENGINE_PROCESS, 300).unwrap();

        let watchdog = Watchdog::new(
            KillRules::default(),
            broker.clone(),
            cache,
            controller.clone(),
            &pid_file,
            dir.path().join("HALTED"),
            Duration::from_secs(30),
        );

        Fixture {
            dir,
            broker,
            controller,
            watchdog,
        }
    }

    fn open_order(id: &str, age_secs: i64) -> BrokerOrder {
        BrokerOrder {
            id: id.into(),
            client_order_id: format!("c_{id}"),
            symbol: "AAPL".into(),
            side: Side::Buy,
            order_type: OrderType::Limit,
            qty: 10.0,
            limit_price: Some(150.0),
            status: "accepted".into(),
            filled_qty: 0.0,
            filled_avg_price: None,
            created_at: Utc::now() - chrono::Duration::seconds(age_secs),
        }
    }

    #[tokio::test]
    async fn daily_loss_triggers_full_shutdown_sequence() {
        // Equity 94,500 vs last 100,000: -5.5%, past the -5% kill line.
        let mut f = fixture(
            ScriptedBroker::new(94_500.0, 100_000.0),
            FakeController::live(),
        );
        f.broker.positions.write().push(BrokerPosition {
            symbol: "AAPL".into(),
            qty: 10.0,
            avg_entry_price: 150.0,
            market_value: 1_500.0,
            unrealized_pl: 0.0,
        });

        f.watchdog.poll_once().await.unwrap();

        // Cancel before close before kill, in that order.
        assert_eq!(
            f.broker.calls(),
            vec!["cancel_all_orders", "close_all_positions"]
        );
        assert_eq!(f.controller.calls(), vec!["sigterm"]);
        // PID file cleaned up.
        assert!(!f.dir.path().join("engine.pid").exists());
        // Not permanent: the marker is untouched.
        assert!(!f.watchdog.is_permanently_halted());
    }

    #[tokio::test]
    async fn stubborn_engine_gets_sigkill_after_grace() {
        let broker = ScriptedBroker::new(94_000.0, 100_000.0);
        let mut f = fixture(broker, FakeController::stubborn());
        // Shrink the grace period so the test does not sleep 30 s.
        f.watchdog.rules.graceful_shutdown_timeout_secs = 1;

        f.watchdog.poll_once().await.unwrap();

        assert_eq!(f.controller.calls(), vec!["sigterm", "sigkill"]);
    }

    #[tokio::test]
    async fn permanent_drawdown_engages_sticky_marker() {
        // Equity 80k vs initial 100k: below the 85% floor.
        let mut f = fixture(
            ScriptedBroker::new(80_000.0, 81_000.0),
            FakeController::live(),
        );

        f.watchdog.poll_once().await.unwrap();

        assert!(f.watchdog.is_permanently_halted());
        assert!(f.dir.path().join("HALTED").exists());

        // A restarted watchdog sees the marker and stays halted.
        let restarted = Watchdog::new(
            KillRules::default(),
            f.broker.clone(),
            Arc::new(MemoryStateStore::new()),
            f.controller.clone(),
            f.dir.path().join("engine.pid"),
            f.dir.path().join("HALTED"),
            Duration::from_secs(30),
        );
        assert!(restarted.is_permanently_halted());
    }

    #[tokio::test]
    async fn healthy_account_passes_without_action() {
        let mut f = fixture(
            ScriptedBroker::new(100_500.0, 100_000.0),
            FakeController::live(),
        );

        f.watchdog.poll_once().await.unwrap();

        assert!(f.broker.calls().is_empty());
        assert!(f.controller.calls().is_empty());
    }

    #[tokio::test]
    async fn concentration_breach_shuts_down() {
        let mut f = fixture(
            ScriptedBroker::new(100_000.0, 100_000.0),
            FakeController::live(),
        );
        // 26% of equity in one name.
        f.broker.positions.write().push(BrokerPosition {
            symbol: "TSLA".into(),
            qty: 100.0,
            avg_entry_price: 260.0,
            market_value: 26_000.0,
            unrealized_pl: 0.0,
        });

        f.watchdog.poll_once().await.unwrap();
        assert_eq!(
            f.broker.calls(),
            vec!["cancel_all_orders", "close_all_positions"]
        );
    }

    #[tokio::test]
    async fn zombie_order_shuts_down() {
        let mut f = fixture(
            ScriptedBroker::new(100_000.0, 100_000.0),
            FakeController::live(),
        );
        f.broker.open_orders.write().push(open_order("b1", 400));

        f.watchdog.poll_once().await.unwrap();
        assert!(f.broker.calls().contains(&"cancel_all_orders"));
    }

    #[tokio::test]
    async fn fresh_orders_do_not_trip_zombie_rule() {
        let mut f = fixture(
            ScriptedBroker::new(100_000.0, 100_000.0),
            FakeController::live(),
        );
        f.broker.open_orders.write().push(open_order("b1", 30));

        f.watchdog.poll_once().await.unwrap();
        assert!(f.broker.calls().is_empty());
    }

    #[tokio::test]
    async fn open_order_flood_shuts_down() {
        let mut f = fixture(
            ScriptedBroker::new(100_000.0, 100_000.0),
            FakeController::live(),
        );
        {
            let mut orders = f.broker.open_orders.write();
            for i in 0..50 {
                orders.push(open_order(&format!("b{i}"), 10));
            }
        }

        f.watchdog.poll_once().await.unwrap();
        assert!(f.broker.calls().contains(&"cancel_all_orders"));
    }

    #[tokio::test]
    async fn cooldown_blocks_repeat_kills() {
        let mut f = fixture(
            ScriptedBroker::new(94_000.0, 100_000.0),
            FakeController::live(),
        );

        f.watchdog.poll_once().await.unwrap();
        assert_eq!(f.controller.calls(), vec!["sigterm"]);

        // Re-arm the scenario: pid file back, process "restarted".
        std::fs::write(f.dir.path().join("engine.pid"), "12345\n").unwrap();
        *f.controller.alive.write() = true;

        // Within the cooldown the liquidation still runs, the kill does not.
        f.watchdog.poll_once().await.unwrap();
        assert_eq!(f.controller.calls(), vec!["sigterm"]);
    }

    #[tokio::test]
    async fn missing_pid_file_skips_kill_but_liquidates() {
        let mut f = fixture(
            ScriptedBroker::new(94_000.0, 100_000.0),
            FakeController::live(),
        );
        std::fs::remove_file(f.dir.path().join("engine.pid")).unwrap();

        f.watchdog.poll_once().await.unwrap();

        assert_eq!(
            f.broker.calls(),
            vec!["cancel_all_orders", "close_all_positions"]
        );
        assert!(f.controller.calls().is_empty());
    }
}
