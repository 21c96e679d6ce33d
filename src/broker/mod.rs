// =============================================================================
// Broker gateway — uniform interface over live and simulated brokers
// =============================================================================
//
// Every order submission carries the caller-assigned `client_order_id` as the
// broker-side idempotency key. That single rule is what makes the submit
// timeout -> UNKNOWN -> reconcile protocol safe: the broker can always be
// asked "did you ever see this order?" by client id.
// =============================================================================

pub mod data;
pub mod paper;
pub mod shared;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{OrderType, Side};

pub use data::{FreeDataClient, SimulationBroker};
pub use paper::{PaperBook, PaperBroker};
pub use shared::SharedPaperBroker;

/// Account snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub equity: f64,
    /// Equity at the previous session close; used for daily PnL.
    pub last_equity: f64,
    pub cash: f64,
}

/// Market clock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Clock {
    pub is_open: bool,
    pub timestamp: DateTime<Utc>,
}

/// A position as the broker reports it. This is TRUTH; local state is cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub symbol: String,
    /// Signed quantity: negative for shorts.
    pub qty: f64,
    pub avg_entry_price: f64,
    pub market_value: f64,
    pub unrealized_pl: f64,
}

impl BrokerPosition {
    pub fn side(&self) -> &'static str {
        if self.qty >= 0.0 {
            "long"
        } else {
            "short"
        }
    }
}

/// An order as the broker reports it. `status` stays a raw broker string;
/// the reconciler owns the mapping to internal states.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerOrder {
    pub id: String,
    pub client_order_id: String,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub qty: f64,
    pub limit_price: Option<f64>,
    pub status: String,
    pub filled_qty: f64,
    pub filled_avg_price: Option<f64>,
    pub created_at: DateTime<Utc>,
}

/// Filter for `list_orders`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatusFilter {
    Open,
    Closed,
    All,
}

/// Uniform broker interface. Implementations: the in-process paper
/// simulator, the shared-state paper brokerage (one account, separately
/// credentialed clients), the historical-data simulation variant, and
/// (elsewhere, never here) live.
#[async_trait]
pub trait BrokerGateway: Send + Sync {
    async fn get_account(&self) -> Result<Account>;

    async fn get_clock(&self) -> Result<Clock>;

    async fn list_positions(&self) -> Result<Vec<BrokerPosition>>;

    async fn list_orders(
        &self,
        status: OrderStatusFilter,
        limit: usize,
    ) -> Result<Vec<BrokerOrder>>;

    /// Submit a limit order. `client_id` is the idempotency key and MUST be
    /// attached to the submission.
    async fn submit_limit_order(
        &self,
        symbol: &str,
        qty: f64,
        side: Side,
        limit_price: f64,
        client_id: &str,
    ) -> Result<BrokerOrder>;

    /// Submit a market order, same idempotency contract.
    async fn submit_market_order(
        &self,
        symbol: &str,
        qty: f64,
        side: Side,
        client_id: &str,
    ) -> Result<BrokerOrder>;

    async fn cancel_order(&self, order_id: &str) -> Result<()>;

    async fn cancel_all_orders(&self) -> Result<usize>;

    async fn close_position(&self, symbol: &str) -> Result<()>;

    async fn close_all_positions(&self) -> Result<usize>;

    /// Look up an order by the idempotency key. `Ok(None)` means the broker
    /// definitively never saw the order; an RPC failure is `Err`.
    async fn get_order_by_client_id(&self, client_id: &str) -> Result<Option<BrokerOrder>>;
}
