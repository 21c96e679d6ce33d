// =============================================================================
// Shared paper brokerage — one simulated account, two credentialed clients
// =============================================================================
//
// The engine and the watchdog run as separate OS processes, so a purely
// in-process paper book would leave the watchdog staring at its own empty
// account. This backend keeps the whole [`PaperBook`] on an external store
// (the brokerage's "servers"): each process opens its OWN authenticated
// connection with its OWN credentials and both observe the same cash,
// positions, orders, and equity, the way two API clients of a real
// brokerage do.
//
// Write discipline: the engine is the only order submitter; the watchdog
// writes only while liquidating (cancel-all / close-all). Every mutation is
// a load-modify-store of the single book key.
// =============================================================================

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use redis::Commands;
use tracing::{debug, info};

use crate::types::Side;

use super::paper::PaperBook;
use super::{Account, BrokerGateway, BrokerOrder, BrokerPosition, Clock, OrderStatusFilter};

/// The one key holding the account's books. `pb:` is the brokerage
/// namespace, deliberately disjoint from the live-state cache's `mm:`.
const BOOK_KEY: &str = "pb:book";

/// Paper brokerage backed by shared state.
pub struct SharedPaperBroker {
    client: redis::Client,
    socket_timeout: Duration,
    spread_bps: f64,
    slippage_bps: f64,
}

impl SharedPaperBroker {
    /// Connect to the brokerage endpoint and verify liveness. The URL
    /// carries this process's own credentials; an endpoint refusing them
    /// fails here, before any trading decision is made.
    pub fn connect(
        url: &str,
        socket_timeout: Duration,
        spread_bps: f64,
        slippage_bps: f64,
    ) -> Result<Self> {
        let client =
            redis::Client::open(url).context("invalid paper brokerage endpoint url")?;

        let broker = Self {
            client,
            socket_timeout,
            spread_bps,
            slippage_bps,
        };

        // An authentication failure or dead endpoint surfaces right here.
        let mut conn = broker.conn()?;
        redis::cmd("PING")
            .query::<String>(&mut conn)
            .context("paper brokerage endpoint unreachable")?;

        info!(spread_bps, slippage_bps, "paper brokerage endpoint connected");
        Ok(broker)
    }

    /// Seed the account books if — and only if — none exist yet. A restart
    /// or a second client must never reset a live book.
    pub fn ensure_account(&self, initial_cash: f64) -> Result<()> {
        let book = PaperBook::new(initial_cash);
        let json = serde_json::to_string(&book)?;

        let mut conn = self.conn()?;
        let created: bool = redis::cmd("SETNX")
            .arg(BOOK_KEY)
            .arg(json)
            .query(&mut conn)
            .context("account seed failed")?;

        if created {
            info!(initial_cash, "paper brokerage account created");
        } else {
            debug!("paper brokerage account already exists");
        }
        Ok(())
    }

    fn conn(&self) -> Result<redis::Connection> {
        let conn = self
            .client
            .get_connection_with_timeout(self.socket_timeout)
            .context("brokerage connection failed")?;
        conn.set_read_timeout(Some(self.socket_timeout))?;
        conn.set_write_timeout(Some(self.socket_timeout))?;
        Ok(conn)
    }

    fn load(&self) -> Result<PaperBook> {
        let mut conn = self.conn()?;
        let raw: Option<String> = conn.get(BOOK_KEY)?;
        match raw {
            Some(json) => serde_json::from_str(&json).context("corrupt brokerage book"),
            None => bail!("paper brokerage account not initialised"),
        }
    }

    fn store(&self, book: &PaperBook) -> Result<()> {
        let mut conn = self.conn()?;
        conn.set::<_, _, ()>(BOOK_KEY, serde_json::to_string(book)?)?;
        Ok(())
    }

    /// Load-modify-store one mutation of the books.
    fn with_book<T>(&self, mutate: impl FnOnce(&mut PaperBook) -> Result<T>) -> Result<T> {
        let mut book = self.load()?;
        let out = mutate(&mut book)?;
        self.store(&book)?;
        Ok(out)
    }

    fn adjustment_bps(&self) -> f64 {
        self.spread_bps + self.slippage_bps
    }
}

#[async_trait]
impl BrokerGateway for SharedPaperBroker {
    async fn get_account(&self) -> Result<Account> {
        Ok(self.load()?.account())
    }

    async fn get_clock(&self) -> Result<Clock> {
        Ok(self.load()?.clock())
    }

    async fn list_positions(&self) -> Result<Vec<BrokerPosition>> {
        Ok(self.load()?.list_positions())
    }

    async fn list_orders(
        &self,
        status: OrderStatusFilter,
        limit: usize,
    ) -> Result<Vec<BrokerOrder>> {
        Ok(self.load()?.list_orders(status, limit))
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
        self.with_book(|book| {
            book.fill(
                symbol,
                side,
                qty,
                limit_price,
                crate::types::OrderType::Limit,
                Some(limit_price),
                client_id,
            )
        })
    }

    async fn submit_market_order(
        &self,
        symbol: &str,
        qty: f64,
        side: Side,
        client_id: &str,
    ) -> Result<BrokerOrder> {
        let adjustment = self.adjustment_bps();
        self.with_book(|book| {
            let fill_price = book.market_fill_price(symbol, side, adjustment)?;
            book.fill(
                symbol,
                side,
                qty,
                fill_price,
                crate::types::OrderType::Market,
                None,
                client_id,
            )
        })
    }

    async fn cancel_order(&self, order_id: &str) -> Result<()> {
        self.with_book(|book| book.cancel_order(order_id))
    }

    async fn cancel_all_orders(&self) -> Result<usize> {
        let cancelled = self.with_book(|book| Ok(book.cancel_all()))?;
        info!(cancelled, "all open paper orders cancelled");
        Ok(cancelled)
    }

    async fn close_position(&self, symbol: &str) -> Result<()> {
        let adjustment = self.adjustment_bps();
        self.with_book(|book| book.close_position(symbol, adjustment))?;
        Ok(())
    }

    async fn close_all_positions(&self) -> Result<usize> {
        let adjustment = self.adjustment_bps();
        let closed = self.with_book(|book| book.close_all(adjustment))?;
        info!(closed, "all paper positions closed");
        Ok(closed)
    }

    async fn get_order_by_client_id(&self, client_id: &str) -> Result<Option<BrokerOrder>> {
        Ok(self.load()?.orders.get(client_id).cloned())
    }
}
