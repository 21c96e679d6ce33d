// =============================================================================
// Paper brokerage — simulated execution with no real money at risk
// =============================================================================
//
// The simulated account's books live in [`PaperBook`]: cash, positions, the
// order ledger keyed by client id (the idempotency key), mark prices, and
// the market clock. All fill arithmetic lives on the book, so the in-process
// broker below and the shared-state broker (`shared.rs`) execute identical
// semantics against different backings.
//
// Fills are immediate: limit orders at the limit price, market orders at a
// spread + slippage adjusted mark. Rejections mirror what a real brokerage
// rejects (insufficient cash, selling what is not held).
// =============================================================================

use std::collections::HashMap;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::types::{OrderType, Side};

use super::{
    Account, BrokerGateway, BrokerOrder, BrokerPosition, Clock, OrderStatusFilter,
};

fn default_market_open() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperPosition {
    pub qty: f64,
    pub avg_price: f64,
    pub mark_price: f64,
}

/// One simulated account's complete books. Serializable so the shared
/// brokerage backend can persist it where both processes see it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperBook {
    pub cash: f64,
    /// Equity at the previous session roll; feeds daily PnL.
    pub last_equity: f64,
    pub positions: HashMap<String, PaperPosition>,
    /// Order ledger keyed by client id (the idempotency key).
    pub orders: HashMap<String, BrokerOrder>,
    /// Insertion order of client ids, for stable listing.
    pub order_seq: Vec<String>,
    /// Mark prices for symbols without a position yet.
    pub marks: HashMap<String, f64>,
    #[serde(default = "default_market_open")]
    pub market_open: bool,
}

impl PaperBook {
    pub fn new(initial_cash: f64) -> Self {
        Self {
            cash: initial_cash,
            last_equity: initial_cash,
            positions: HashMap::new(),
            orders: HashMap::new(),
            order_seq: Vec::new(),
            marks: HashMap::new(),
            market_open: true,
        }
    }

    pub fn equity(&self) -> f64 {
        let positions_value: f64 = self.positions.values().map(|p| p.qty * p.mark_price).sum();
        self.cash + positions_value
    }

    pub fn account(&self) -> Account {
        Account {
            equity: self.equity(),
            last_equity: self.last_equity,
            cash: self.cash,
        }
    }

    pub fn clock(&self) -> Clock {
        Clock {
            is_open: self.market_open,
            timestamp: Utc::now(),
        }
    }

    /// Roll the session: today's equity becomes `last_equity`.
    pub fn roll_session(&mut self) {
        self.last_equity = self.equity();
    }

    pub fn set_mark(&mut self, symbol: &str, price: f64) {
        self.marks.insert(symbol.to_string(), price);
        if let Some(pos) = self.positions.get_mut(symbol) {
            pos.mark_price = price;
        }
    }

    fn mark_for(&self, symbol: &str) -> Option<f64> {
        self.marks
            .get(symbol)
            .copied()
            .or_else(|| self.positions.get(symbol).map(|p| p.mark_price))
    }

    /// Market fill price at the current mark, adjusted by `adjustment_bps`
    /// (spread + slippage) against the taker.
    pub fn market_fill_price(&self, symbol: &str, side: Side, adjustment_bps: f64) -> Result<f64> {
        let mark = match self.mark_for(symbol) {
            Some(p) if p > 0.0 => p,
            _ => bail!("no mark price for {symbol}: cannot fill market order"),
        };
        let adjustment = adjustment_bps / 10_000.0;
        Ok(match side {
            Side::Buy => mark * (1.0 + adjustment),
            Side::Sell => mark * (1.0 - adjustment),
        })
    }

    /// Execute a fill against cash and positions, rejecting what a real
    /// broker would reject. A duplicate client id returns the existing
    /// order instead of filling twice: the idempotency contract.
    #[allow(clippy::too_many_arguments)]
    pub fn fill(
        &mut self,
        symbol: &str,
        side: Side,
        qty: f64,
        fill_price: f64,
        order_type: OrderType,
        limit_price: Option<f64>,
        client_id: &str,
    ) -> Result<BrokerOrder> {
        if qty <= 0.0 {
            bail!("order quantity must be positive, got {qty}");
        }

        if let Some(existing) = self.orders.get(client_id) {
            warn!(client_id, "duplicate client order id: returning existing order");
            return Ok(existing.clone());
        }

        let cost = fill_price * qty;
        let status;

        match side {
            Side::Buy => {
                if cost > self.cash {
                    status = "rejected";
                    debug!(symbol, cost, cash = self.cash, "paper order rejected: insufficient cash");
                } else {
                    self.cash -= cost;
                    let pos = self.positions.entry(symbol.to_string()).or_insert(
                        PaperPosition {
                            qty: 0.0,
                            avg_price: fill_price,
                            mark_price: fill_price,
                        },
                    );
                    let total_cost = pos.avg_price * pos.qty + cost;
                    pos.qty += qty;
                    pos.avg_price = total_cost / pos.qty;
                    pos.mark_price = fill_price;
                    status = "filled";
                }
            }
            Side::Sell => {
                let held = self.positions.get(symbol).map(|p| p.qty).unwrap_or(0.0);
                if qty > held {
                    status = "rejected";
                    debug!(symbol, qty, held, "paper order rejected: insufficient position");
                } else {
                    self.cash += cost;
                    let emptied = {
                        let pos = self.positions.get_mut(symbol).unwrap();
                        pos.qty -= qty;
                        pos.mark_price = fill_price;
                        pos.qty <= f64::EPSILON
                    };
                    if emptied {
                        self.positions.remove(symbol);
                    }
                    status = "filled";
                }
            }
        }

        let filled = status == "filled";
        let order = BrokerOrder {
            id: format!("paper_{}", Uuid::new_v4().simple()),
            client_order_id: client_id.to_string(),
            symbol: symbol.to_string(),
            side,
            order_type,
            qty,
            limit_price,
            status: status.to_string(),
            filled_qty: if filled { qty } else { 0.0 },
            filled_avg_price: if filled { Some(fill_price) } else { None },
            created_at: Utc::now(),
        };

        self.orders.insert(client_id.to_string(), order.clone());
        self.order_seq.push(client_id.to_string());

        info!(
            symbol,
            side = %side,
            qty,
            fill_price,
            status,
            client_id,
            "paper order processed"
        );

        Ok(order)
    }

    pub fn list_positions(&self) -> Vec<BrokerPosition> {
        self.positions
            .iter()
            .map(|(symbol, p)| BrokerPosition {
                symbol: symbol.clone(),
                qty: p.qty,
                avg_entry_price: p.avg_price,
                market_value: p.qty * p.mark_price,
                unrealized_pl: (p.mark_price - p.avg_price) * p.qty,
            })
            .collect()
    }

    pub fn list_orders(&self, status: OrderStatusFilter, limit: usize) -> Vec<BrokerOrder> {
        self.order_seq
            .iter()
            .rev()
            .filter_map(|cid| self.orders.get(cid))
            .filter(|o| match status {
                OrderStatusFilter::All => true,
                OrderStatusFilter::Open => {
                    matches!(o.status.as_str(), "new" | "accepted" | "partially_filled")
                }
                OrderStatusFilter::Closed => {
                    matches!(o.status.as_str(), "filled" | "canceled" | "rejected" | "expired")
                }
            })
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn cancel_order(&mut self, order_id: &str) -> Result<()> {
        for order in self.orders.values_mut() {
            if order.id == order_id {
                if matches!(order.status.as_str(), "new" | "accepted" | "partially_filled") {
                    order.status = "canceled".to_string();
                }
                return Ok(());
            }
        }
        bail!("order {order_id} not found")
    }

    pub fn cancel_all(&mut self) -> usize {
        let mut cancelled = 0;
        for order in self.orders.values_mut() {
            if matches!(order.status.as_str(), "new" | "accepted" | "partially_filled") {
                order.status = "canceled".to_string();
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Flatten one position with a market sell. Returns whether a fill
    /// happened.
    pub fn close_position(&mut self, symbol: &str, adjustment_bps: f64) -> Result<bool> {
        let qty = match self.positions.get(symbol) {
            Some(pos) if pos.qty > 0.0 => pos.qty,
            _ => return Ok(false),
        };
        let fill_price = self.market_fill_price(symbol, Side::Sell, adjustment_bps)?;
        let client_id = format!("close_{}", Uuid::new_v4().simple());
        self.fill(
            symbol,
            Side::Sell,
            qty,
            fill_price,
            OrderType::Market,
            None,
            &client_id,
        )?;
        Ok(true)
    }

    /// Flatten everything. Returns how many positions were closed.
    pub fn close_all(&mut self, adjustment_bps: f64) -> Result<usize> {
        let symbols: Vec<String> = self.positions.keys().cloned().collect();
        let mut closed = 0;
        for symbol in &symbols {
            if self.close_position(symbol, adjustment_bps)? {
                closed += 1;
            }
        }
        Ok(closed)
    }
}

/// In-process paper broker: a [`PaperBook`] behind a lock. Used by tests and
/// as the degraded single-process fallback; production uses the shared
/// backing so the watchdog sees the same account.
pub struct PaperBroker {
    book: RwLock<PaperBook>,
    spread_bps: f64,
    slippage_bps: f64,
}

impl PaperBroker {
    /// # Arguments
    /// * `initial_cash`  — starting cash balance.
    /// * `spread_bps`    — half-spread cost applied to market orders.
    /// * `slippage_bps`  — additional slippage applied to market orders.
    pub fn new(initial_cash: f64, spread_bps: f64, slippage_bps: f64) -> Self {
        info!(initial_cash, spread_bps, slippage_bps, "paper broker initialised");
        Self {
            book: RwLock::new(PaperBook::new(initial_cash)),
            spread_bps,
            slippage_bps,
        }
    }

    /// Set the current mark price for a symbol. Market orders and equity
    /// valuation use the latest mark.
    pub fn set_mark_price(&self, symbol: &str, price: f64) {
        self.book.write().set_mark(symbol, price);
    }

    /// Roll the session: today's equity becomes `last_equity`.
    pub fn roll_session(&self) {
        self.book.write().roll_session();
    }

    /// Toggle the simulated market clock (tests and after-hours behaviour).
    pub fn set_market_open(&self, open: bool) {
        self.book.write().market_open = open;
    }

    fn adjustment_bps(&self) -> f64 {
        self.spread_bps + self.slippage_bps
    }
}

#[async_trait]
impl BrokerGateway for PaperBroker {
    async fn get_account(&self) -> Result<Account> {
        Ok(self.book.read().account())
    }

    async fn get_clock(&self) -> Result<Clock> {
        Ok(self.book.read().clock())
    }

    async fn list_positions(&self) -> Result<Vec<BrokerPosition>> {
        Ok(self.book.read().list_positions())
    }

    async fn list_orders(
        &self,
        status: OrderStatusFilter,
        limit: usize,
    ) -> Result<Vec<BrokerOrder>> {
        Ok(self.book.read().list_orders(status, limit))
    }

    async fn submit_limit_order(
        &self,
        symbol: &str,
        qty: f64,
        side: Side,
        limit_price: f64,
        client_id: &str,
    ) -> Result<BrokerOrder> {
        if limit_price <= 0.0 {
            bail!("limit price must be positive, got {limit_price}");
        }
        // Immediate fill at the limit price.
        self.book.write().fill(
            symbol,
            side,
            qty,
            limit_price,
            OrderType::Limit,
            Some(limit_price),
            client_id,
        )
    }

    async fn submit_market_order(
        &self,
        symbol: &str,
        qty: f64,
        side: Side,
        client_id: &str,
    ) -> Result<BrokerOrder> {
        let mut book = self.book.write();
        let fill_price = book.market_fill_price(symbol, side, self.adjustment_bps())?;
        book.fill(
            symbol,
            side,
            qty,
            fill_price,
            OrderType::Market,
            None,
            client_id,
        )
    }

    async fn cancel_order(&self, order_id: &str) -> Result<()> {
        self.book.write().cancel_order(order_id)
    }

    async fn cancel_all_orders(&self) -> Result<usize> {
        let cancelled = self.book.write().cancel_all();
        info!(cancelled, "all open paper orders cancelled");
        Ok(cancelled)
    }

    async fn close_position(&self, symbol: &str) -> Result<()> {
        self.book.write().close_position(symbol, self.adjustment_bps())?;
        Ok(())
    }

    async fn close_all_positions(&self) -> Result<usize> {
        let closed = self.book.write().close_all(self.adjustment_bps())?;
        info!(closed, "all paper positions closed");
        Ok(closed)
    }

    async fn get_order_by_client_id(&self, client_id: &str) -> Result<Option<BrokerOrder>> {
        Ok(self.book.read().orders.get(client_id).cloned())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn broker() -> PaperBroker {
        PaperBroker::new(100_000.0, 10.0, 5.0)
    }

    #[tokio::test]
    async fn limit_buy_fills_at_limit_price() {
        let b = broker();
        let order = b
            .submit_limit_order("AAPL", 100.0, Side::Buy, 150.0, "c1")
            .await
            .unwrap();

        assert_eq!(order.status, "filled");
        assert!((order.filled_avg_price.unwrap() - 150.0).abs() < 1e-9);

        let account = b.get_account().await.unwrap();
        assert!((account.cash - (100_000.0 - 15_000.0)).abs() < 1e-6);

        let positions = b.list_positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert!((positions[0].qty - 100.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn market_order_pays_spread_and_slippage() {
        let b = broker();
        b.set_mark_price("AAPL", 100.0);

        let order = b
            .submit_market_order("AAPL", 10.0, Side::Buy, "c1")
            .await
            .unwrap();

        // 10 + 5 bps on top of the mark.
        let expected = 100.0 * (1.0 + 15.0 / 10_000.0);
        assert!((order.filled_avg_price.unwrap() - expected).abs() < 1e-9);
    }

    #[tokio::test]
    async fn insufficient_cash_rejects() {
        let b = PaperBroker::new(1_000.0, 0.0, 0.0);
        let order = b
            .submit_limit_order("AAPL", 100.0, Side::Buy, 150.0, "c1")
            .await
            .unwrap();
        assert_eq!(order.status, "rejected");
        assert!((order.filled_qty).abs() < 1e-9);
    }

    #[tokio::test]
    async fn selling_unheld_position_rejects() {
        let b = broker();
        b.set_mark_price("AAPL", 100.0);
        let order = b
            .submit_market_order("AAPL", 10.0, Side::Sell, "c1")
            .await
            .unwrap();
        assert_eq!(order.status, "rejected");
    }

    #[tokio::test]
    async fn duplicate_client_id_does_not_double_fill() {
        let b = broker();
        let first = b
            .submit_limit_order("AAPL", 10.0, Side::Buy, 100.0, "c1")
            .await
            .unwrap();
        let second = b
            .submit_limit_order("AAPL", 10.0, Side::Buy, 100.0, "c1")
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        let positions = b.list_positions().await.unwrap();
        assert!((positions[0].qty - 10.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn round_trip_closes_position() {
        let b = broker();
        b.submit_limit_order("AAPL", 10.0, Side::Buy, 100.0, "c1")
            .await
            .unwrap();
        b.submit_limit_order("AAPL", 10.0, Side::Sell, 110.0, "c2")
            .await
            .unwrap();

        assert!(b.list_positions().await.unwrap().is_empty());
        let account = b.get_account().await.unwrap();
        assert!((account.cash - 100_100.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn averaging_into_a_position() {
        let b = broker();
        b.submit_limit_order("AAPL", 10.0, Side::Buy, 100.0, "c1")
            .await
            .unwrap();
        b.submit_limit_order("AAPL", 10.0, Side::Buy, 110.0, "c2")
            .await
            .unwrap();

        let positions = b.list_positions().await.unwrap();
        assert!((positions[0].qty - 20.0).abs() < 1e-9);
        assert!((positions[0].avg_entry_price - 105.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn lookup_by_client_id() {
        let b = broker();
        b.submit_limit_order("AAPL", 10.0, Side::Buy, 100.0, "c1")
            .await
            .unwrap();

        let found = b.get_order_by_client_id("c1").await.unwrap();
        assert!(found.is_some());
        assert_eq!(found.unwrap().symbol, "AAPL");
        assert!(b.get_order_by_client_id("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn close_all_positions_flattens() {
        let b = broker();
        b.submit_limit_order("AAPL", 10.0, Side::Buy, 100.0, "c1")
            .await
            .unwrap();
        b.submit_limit_order("MSFT", 5.0, Side::Buy, 200.0, "c2")
            .await
            .unwrap();

        let closed = b.close_all_positions().await.unwrap();
        assert_eq!(closed, 2);
        assert!(b.list_positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn equity_tracks_mark_prices() {
        let b = broker();
        b.submit_limit_order("AAPL", 100.0, Side::Buy, 100.0, "c1")
            .await
            .unwrap();

        b.set_mark_price("AAPL", 110.0);
        let account = b.get_account().await.unwrap();
        // 90k cash + 100 * 110 marks.
        assert!((account.equity - 101_000.0).abs() < 1e-6);

        let positions = b.list_positions().await.unwrap();
        assert!((positions[0].unrealized_pl - 1_000.0).abs() < 1e-6);
    }

    #[test]
    fn book_serde_roundtrip_preserves_ledger() {
        // The shared backend persists the book as JSON; the books must
        // survive the trip bit-for-bit in meaning.
        let mut book = PaperBook::new(50_000.0);
        book.fill("AAPL", Side::Buy, 10.0, 100.0, OrderType::Limit, Some(100.0), "c1")
            .unwrap();
        book.set_mark("AAPL", 105.0);
        book.market_open = false;

        let json = serde_json::to_string(&book).unwrap();
        let back: PaperBook = serde_json::from_str(&json).unwrap();

        assert!((back.cash - 49_000.0).abs() < 1e-9);
        assert!((back.equity() - book.equity()).abs() < 1e-9);
        assert_eq!(back.order_seq, vec!["c1"]);
        assert_eq!(back.orders["c1"].status, "filled");
        assert!(!back.market_open);

        // Replaying the same client id against the restored book still
        // returns the original order instead of double-filling.
        let mut restored = back;
        let echoed = restored
            .fill("AAPL", Side::Buy, 10.0, 100.0, OrderType::Limit, Some(100.0), "c1")
            .unwrap();
        assert_eq!(echoed.id, book.orders["c1"].id);
        assert!((restored.positions["AAPL"].qty - 10.0).abs() < 1e-9);
    }
}
