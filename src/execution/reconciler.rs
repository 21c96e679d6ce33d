// =============================================================================
// Reconciler — the idempotency core
// =============================================================================
//
// NEVER retry an order without broker evidence. The protocol for a single
// timed-out order:
//
//   1. The caller observed a submit timeout; the order is marked UNKNOWN.
//   2. Query the broker by client_order_id (the idempotency key).
//   3. Broker returns the order in ANY state -> sync local state from it and
//      report should_retry = false. Under no circumstance resubmit.
//   4. Broker definitively returns not-found -> mark FAILED, report
//      should_retry = true.
//   5. The query itself failed -> propagate the error; the caller treats an
//      unreconciled order as NOT retryable. Duplication is the one mistake
//      this module exists to prevent.
//
// `reconcile_positions` treats the broker as the sole source of truth and
// overwrites the cache wholesale.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerGateway, BrokerOrder};
use crate::storage::{CachedPosition, StateStore};

use super::order_manager::{Order, OrderManager, OrderStatus, TransitionUpdate};

/// Result of reconciling one order.
#[derive(Debug, Clone)]
pub struct ReconcileOutcome {
    /// True only when the broker positively confirmed it never saw the
    /// order. Anything else means do not resubmit.
    pub should_retry: bool,
    pub order: Option<Order>,
}

/// Summary of a reconcile-all sweep.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileSummary {
    pub total: usize,
    pub reconciled: usize,
    pub needs_retry: usize,
    pub errors: usize,
}

/// Map a broker status string onto the internal state machine.
pub fn map_broker_status(broker_status: &str) -> OrderStatus {
    match broker_status.to_ascii_lowercase().as_str() {
        "new" | "accepted" => OrderStatus::Submitted,
        // pending_* means the broker holds the order; from our side that is
        // a submitted order in flight.
        "pending_new" | "pending_replace" | "pending_cancel" => OrderStatus::Submitted,
        "filled" => OrderStatus::Filled,
        "partially_filled" => OrderStatus::PartialFill,
        "canceled" => OrderStatus::Cancelled,
        "rejected" | "expired" => OrderStatus::Failed,
        _ => OrderStatus::Unknown,
    }
}

pub struct Reconciler {
    orders: Arc<OrderManager>,
    broker: Arc<dyn BrokerGateway>,
    cache: Arc<dyn StateStore>,
}

impl Reconciler {
    pub fn new(
        orders: Arc<OrderManager>,
        broker: Arc<dyn BrokerGateway>,
        cache: Arc<dyn StateStore>,
    ) -> Self {
        info!("reconciler initialised");
        Self {
            orders,
            broker,
            cache,
        }
    }

    /// Handle a submit timeout: mark UNKNOWN, then reconcile immediately.
    pub async fn handle_timeout(&self, client_order_id: &str) -> Result<ReconcileOutcome> {
        warn!(client_order_id, "order submit timeout, reconciling");

        if let Err(e) = self.orders.mark_unknown(client_order_id) {
            // Terminal orders have nothing to reconcile; everything else is
            // repaired by the broker query below.
            debug!(client_order_id, error = %e, "mark-unknown skipped");
        }

        self.reconcile_order(client_order_id).await
    }

    /// Reconcile a single order against broker truth.
    pub async fn reconcile_order(&self, client_order_id: &str) -> Result<ReconcileOutcome> {
        let Some(order) = self.orders.get(client_order_id) else {
            warn!(client_order_id, "order not found for reconciliation");
            return Ok(ReconcileOutcome {
                should_retry: false,
                order: None,
            });
        };

        if order.status.is_terminal() {
            return Ok(ReconcileOutcome {
                should_retry: false,
                order: Some(order),
            });
        }

        // Step 2: ask the broker. An RPC failure propagates upward; no
        // retry decision is made without fresh evidence.
        let broker_order = self
            .broker
            .get_order_by_client_id(client_order_id)
            .await
            .with_context(|| format!("broker lookup failed for {client_order_id}"))?;

        match broker_order {
            Some(broker_order) => {
                // Step 3: the order reached the broker. Sync and never retry.
                info!(
                    client_order_id,
                    broker_status = %broker_order.status,
                    "order found on broker, syncing state"
                );
                self.apply_broker_state(client_order_id, &broker_order);
                self.sync_order_to_cache(client_order_id);

                Ok(ReconcileOutcome {
                    should_retry: false,
                    order: self.orders.get(client_order_id),
                })
            }
            None => {
                // Step 4: positively never reached the broker.
                info!(client_order_id, "order not found on broker, safe to retry");
                if let Err(e) = self.orders.mark_failed(client_order_id) {
                    warn!(client_order_id, error = %e, "mark-failed rejected");
                }
                Ok(ReconcileOutcome {
                    should_retry: true,
                    order: None,
                })
            }
        }
    }

    /// Sweep every open order. Errors reduce to "try again next interval".
    pub async fn reconcile_all(&self) -> ReconcileSummary {
        let open = self.orders.open_orders();
        let mut summary = ReconcileSummary {
            total: open.len(),
            ..Default::default()
        };

        for order in open {
            match self.reconcile_order(&order.client_order_id).await {
                Ok(outcome) => {
                    if outcome.order.is_some() {
                        summary.reconciled += 1;
                    } else if outcome.should_retry {
                        summary.needs_retry += 1;
                    }
                }
                Err(e) => {
                    error!(
                        client_order_id = %order.client_order_id,
                        error = %e,
                        "reconciliation error"
                    );
                    summary.errors += 1;
                }
            }
        }

        info!(
            total = summary.total,
            reconciled = summary.reconciled,
            needs_retry = summary.needs_retry,
            errors = summary.errors,
            "reconciliation sweep complete"
        );
        summary
    }

    /// Replace cached positions with broker truth.
    pub async fn reconcile_positions(&self) -> Result<usize> {
        let positions = self
            .broker
            .list_positions()
            .await
            .context("position fetch failed")?;

        let cached: Vec<CachedPosition> = positions
            .iter()
            .map(|p| CachedPosition {
                symbol: p.symbol.clone(),
                qty: p.qty,
                avg_price: p.avg_entry_price,
                market_value: p.market_value,
                unrealized_pnl: p.unrealized_pl,
                side: p.side().to_string(),
                updated_at: Utc::now(),
            })
            .collect();

        self.cache
            .sync_positions(&cached)
            .context("position cache sync failed")?;

        info!(count = cached.len(), "positions reconciled");
        Ok(cached.len())
    }

    fn apply_broker_state(&self, client_order_id: &str, broker_order: &BrokerOrder) {
        let mapped = map_broker_status(&broker_order.status);

        let update = TransitionUpdate {
            broker_order_id: Some(broker_order.id.clone()),
            filled_qty: Some(broker_order.filled_qty),
            filled_price: broker_order.filled_avg_price,
        };

        if mapped == OrderStatus::Unknown {
            // The broker reported something unrecognised; leave the order
            // as-is for the next sweep.
            warn!(
                client_order_id,
                broker_status = %broker_order.status,
                "unmapped broker status, leaving order untouched"
            );
            return;
        }

        // An order sitting in UNKNOWN hops through SUBMITTED first: that is
        // where the broker id legally attaches, and it makes PARTIAL_FILL
        // and CANCELLED reachable.
        if mapped != OrderStatus::Submitted {
            let current = self.orders.get(client_order_id).map(|o| o.status);
            if current == Some(OrderStatus::Unknown) {
                let _ = self.orders.transition(
                    client_order_id,
                    OrderStatus::Submitted,
                    TransitionUpdate {
                        broker_order_id: Some(broker_order.id.clone()),
                        ..Default::default()
                    },
                );
            }
        }

        let result = self.orders.transition(client_order_id, mapped, update);

        if let Err(e) = result {
            warn!(client_order_id, error = %e, "broker state application rejected");
        }
    }

    fn sync_order_to_cache(&self, client_order_id: &str) {
        if let Some(order) = self.orders.get(client_order_id) {
            if let Err(e) = self.cache.set_order(&order.to_cached()) {
                error!(client_order_id, error = %e, "order cache sync failed");
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
    use crate::broker::{Account, BrokerPosition, Clock, OrderStatusFilter};
    use crate::storage::MemoryStateStore;
    use crate::types::{OrderType, Side};
    use async_trait::async_trait;
    use parking_lot::RwLock;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted broker double: orders it "knows" are returned by client id;
    /// `fail_lookups` simulates an API outage; submits are counted so tests
    /// can prove nothing was resubmitted.
    #[derive(Default)]
    struct ScriptedBroker {
        known: RwLock<HashMap<String, BrokerOrder>>,
        fail_lookups: RwLock<bool>,
        positions: RwLock<Vec<BrokerPosition>>,
        submit_calls: AtomicUsize,
    }

    impl ScriptedBroker {
        fn know(&self, order: BrokerOrder) {
            self.known
                .write()
                .insert(order.client_order_id.clone(), order);
        }

        fn broker_order(client_id: &str, status: &str, filled_qty: f64) -> BrokerOrder {
            BrokerOrder {
                id: "b1".into(),
                client_order_id: client_id.into(),
                symbol: "AAPL".into(),
                side: Side::Buy,
                order_type: OrderType::Limit,
                qty: 100.0,
                limit_price: Some(150.0),
                status: status.into(),
                filled_qty,
                filled_avg_price: if filled_qty > 0.0 { Some(150.0) } else { None },
                created_at: Utc::now(),
            }
        }
    }

    #[async_trait]
    impl BrokerGateway for ScriptedBroker {
        async fn get_account(&self) -> Result<Account> {
            Ok(Account {
                equity: 100_000.0,
                last_equity: 100_000.0,
                cash: 100_000.0,
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
            Ok(self.known.read().values().cloned().collect())
        }

        async fn submit_limit_order(
            &self,
            _symbol: &str,
            _qty: f64,
            _side: Side,
            _limit_price: f64,
            client_id: &str,
        ) -> Result<BrokerOrder> {
            self.submit_calls.fetch_add(1, Ordering::SeqCst);
            Ok(Self::broker_order(client_id, "accepted", 0.0))
        }

        async fn submit_market_order(
            &self,
            _symbol: &str,
            _qty: f64,
            _side: Side,
            client_id: &str,
        ) -> Result<BrokerOrder> {
            self.submit_calls.fetch_add(1, Ordering::SeqCst);
            Ok(Self::broker_order(client_id, "filled", 100.0))
        }

        async fn cancel_order(&self, _order_id: &str) -> Result<()> {
            Ok(())
        }

        async fn cancel_all_orders(&self) -> Result<usize> {
            Ok(0)
        }

        async fn close_position(&self, _symbol: &str) -> Result<()> {
            Ok(())
        }

        async fn close_all_positions(&self) -> Result<usize> {
            Ok(0)
        }

        async fn get_order_by_client_id(&self, client_id: &str) -> Result<Option<BrokerOrder>> {
            if *self.fail_lookups.read() {
                anyhow::bail!("broker API unavailable");
            }
            Ok(self.known.read().get(client_id).cloned())
        }
    }

    struct Fixture {
        orders: Arc<OrderManager>,
        broker: Arc<ScriptedBroker>,
        cache: Arc<MemoryStateStore>,
        reconciler: Reconciler,
    }

    fn fixture() -> Fixture {
        let orders = Arc::new(OrderManager::new());
        let broker = Arc::new(ScriptedBroker::default());
        let cache = Arc::new(MemoryStateStore::new());
        let reconciler = Reconciler::new(
            orders.clone(),
            broker.clone() as Arc<dyn BrokerGateway>,
            cache.clone() as Arc<dyn StateStore>,
        );
        Fixture {
            orders,
            broker,
            cache,
            reconciler,
        }
    }

    fn mint_submitted(f: &Fixture) -> String {
        let order = f
            .orders
            .mint(
                "AAPL",
                Side::Buy,
                100.0,
                OrderType::Limit,
                Some(150.0),
                None,
                None,
            )
            .unwrap();
        f.orders
            .mark_submitted(&order.client_order_id, "b1")
            .unwrap();
        order.client_order_id
    }

    #[tokio::test]
    async fn timeout_with_filled_broker_order_never_retries() {
        let f = fixture();
        let id = mint_submitted(&f);

        // Broker says: filled, 100 @ 150.
        f.broker
            .know(ScriptedBroker::broker_order(&id, "filled", 100.0));

        let outcome = f.reconciler.handle_timeout(&id).await.unwrap();

        assert!(!outcome.should_retry);
        let order = outcome.order.unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert!((order.filled_qty - 100.0).abs() < 1e-9);
        assert!((order.filled_avg_price.unwrap() - 150.0).abs() < 1e-9);
        // The whole point: nothing was resubmitted.
        assert_eq!(f.broker.submit_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn timeout_with_unknown_broker_order_fails_and_retries() {
        let f = fixture();
        let id = mint_submitted(&f);
        // Broker definitively never saw it.

        let outcome = f.reconciler.handle_timeout(&id).await.unwrap();

        assert!(outcome.should_retry);
        assert!(outcome.order.is_none());
        assert_eq!(f.orders.get(&id).unwrap().status, OrderStatus::Failed);
    }

    #[tokio::test]
    async fn broker_rpc_error_propagates_without_retry_verdict() {
        let f = fixture();
        let id = mint_submitted(&f);
        *f.broker.fail_lookups.write() = true;

        let result = f.reconciler.handle_timeout(&id).await;
        assert!(result.is_err());
        // Order stays UNKNOWN for the next sweep; no FAILED, no retry.
        assert_eq!(f.orders.get(&id).unwrap().status, OrderStatus::Unknown);
    }

    #[tokio::test]
    async fn reconciling_twice_equals_once() {
        let f = fixture();
        let id = mint_submitted(&f);
        f.broker
            .know(ScriptedBroker::broker_order(&id, "filled", 100.0));

        let first = f.reconciler.handle_timeout(&id).await.unwrap();
        let second = f.reconciler.reconcile_order(&id).await.unwrap();

        assert!(!first.should_retry);
        assert!(!second.should_retry);
        let order = second.order.unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert!((order.filled_qty - 100.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn partial_fill_maps_and_accumulates() {
        let f = fixture();
        let id = mint_submitted(&f);
        f.orders.mark_unknown(&id).unwrap();
        f.broker
            .know(ScriptedBroker::broker_order(&id, "partially_filled", 40.0));

        let outcome = f.reconciler.reconcile_order(&id).await.unwrap();
        assert!(!outcome.should_retry);
        let order = outcome.order.unwrap();
        assert_eq!(order.status, OrderStatus::PartialFill);
        assert!((order.filled_qty - 40.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn rejected_maps_to_failed_without_retry() {
        let f = fixture();
        let id = mint_submitted(&f);
        f.broker
            .know(ScriptedBroker::broker_order(&id, "rejected", 0.0));

        let outcome = f.reconciler.handle_timeout(&id).await.unwrap();
        // The broker SAW the order; a rejection is final, not retryable.
        assert!(!outcome.should_retry);
        assert_eq!(f.orders.get(&id).unwrap().status, OrderStatus::Failed);
    }

    #[tokio::test]
    async fn reconcile_all_sweeps_open_orders() {
        let f = fixture();
        let known = mint_submitted(&f);
        let lost = mint_submitted(&f);
        f.broker
            .know(ScriptedBroker::broker_order(&known, "accepted", 0.0));

        let summary = f.reconciler.reconcile_all().await;
        assert_eq!(summary.total, 2);
        assert_eq!(summary.reconciled, 1);
        assert_eq!(summary.needs_retry, 1);
        assert_eq!(summary.errors, 0);
        assert_eq!(f.orders.get(&lost).unwrap().status, OrderStatus::Failed);
    }

    #[tokio::test]
    async fn reconcile_positions_overwrites_cache() {
        let f = fixture();

        // A stale cached position the broker no longer reports.
        f.cache
            .sync_positions(&[CachedPosition {
                symbol: "TSLA".into(),
                qty: 5.0,
                avg_price: 200.0,
                market_value: 1000.0,
                unrealized_pnl: 0.0,
                side: "long".into(),
                updated_at: Utc::now(),
            }])
            .unwrap();

        *f.broker.positions.write() = vec![BrokerPosition {
            symbol: "AAPL".into(),
            qty: 10.0,
            avg_entry_price: 150.0,
            market_value: 1500.0,
            unrealized_pl: 0.0,
        }];

        let count = f.reconciler.reconcile_positions().await.unwrap();
        assert_eq!(count, 1);
        assert!(f.cache.get_position("TSLA").unwrap().is_none());
        let aapl = f.cache.get_position("AAPL").unwrap().unwrap();
        assert!((aapl.qty - 10.0).abs() < 1e-9);
        assert_eq!(aapl.side, "long");
    }

    #[test]
    fn broker_status_mapping_table() {
        assert_eq!(map_broker_status("new"), OrderStatus::Submitted);
        assert_eq!(map_broker_status("accepted"), OrderStatus::Submitted);
        assert_eq!(map_broker_status("pending_new"), OrderStatus::Submitted);
        assert_eq!(map_broker_status("pending_cancel"), OrderStatus::Submitted);
        assert_eq!(map_broker_status("filled"), OrderStatus::Filled);
        assert_eq!(map_broker_status("FILLED"), OrderStatus::Filled);
        assert_eq!(
            map_broker_status("partially_filled"),
            OrderStatus::PartialFill
        );
        assert_eq!(map_broker_status("canceled"), OrderStatus::Cancelled);
        assert_eq!(map_broker_status("rejected"), OrderStatus::Failed);
        assert_eq!(map_broker_status("expired"), OrderStatus::Failed);
        assert_eq!(map_broker_status("held_for_review"), OrderStatus::Unknown);
    }

    #[tokio::test]
    async fn cache_receives_reconciled_order() {
        let f = fixture();
        let id = mint_submitted(&f);
        f.broker
            .know(ScriptedBroker::broker_order(&id, "filled", 100.0));

        f.reconciler.handle_timeout(&id).await.unwrap();

        let cached = f.cache.get_order_by_client_id(&id).unwrap().unwrap();
        assert_eq!(cached.status, "filled");
        assert!((cached.filled_qty.unwrap() - 100.0).abs() < 1e-9);
    }
}
