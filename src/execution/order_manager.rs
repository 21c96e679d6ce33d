// =============================================================================
// Order Manager — the order state machine
// =============================================================================
//
// Exhaustive transition set; everything else is a programming error that is
// rejected WITHOUT mutation:
//
//   PENDING      -> SUBMITTED, FAILED
//   SUBMITTED    -> FILLED, PARTIAL_FILL, CANCELLED, UNKNOWN, FAILED
//   PARTIAL_FILL -> FILLED, CANCELLED, FAILED
//   UNKNOWN      -> SUBMITTED, FILLED, FAILED     (reconciler only)
//   FILLED, CANCELLED, FAILED                     (terminal, never leave)
//
// Invariants:
//   - terminal states never transition
//   - FAILED is reachable from every non-terminal state
//   - every successful mutation bumps updated_at
//   - client_order_id is immutable and unique per process lifetime
//   - broker_order_id is set at most once (PENDING->SUBMITTED or
//     UNKNOWN->SUBMITTED)
//   - filled_qty accumulates: it never decreases
// =============================================================================

use std::collections::HashMap;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::storage::CachedOrder;
use crate::types::{OrderType, Side};

/// Order status within the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Submitted,
    PartialFill,
    Filled,
    Cancelled,
    Failed,
    /// Submit timeout; truth unknown until the reconciler resolves it.
    Unknown,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Filled | Self::Cancelled | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Submitted => "submitted",
            Self::PartialFill => "partial_fill",
            Self::Filled => "filled",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
            Self::Unknown => "unknown",
        }
    }

    /// The transition whitelist. FAILED is special-cased: any non-terminal
    /// state may fail.
    fn can_transition_to(&self, to: OrderStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        if to == OrderStatus::Failed {
            return true;
        }
        match self {
            Self::Pending => matches!(to, OrderStatus::Submitted),
            Self::Submitted => matches!(
                to,
                OrderStatus::Filled
                    | OrderStatus::PartialFill
                    | OrderStatus::Cancelled
                    | OrderStatus::Unknown
            ),
            Self::PartialFill => matches!(to, OrderStatus::Filled | OrderStatus::Cancelled),
            Self::Unknown => matches!(to, OrderStatus::Submitted | OrderStatus::Filled),
            _ => false,
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tracked order, owned exclusively by the manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub client_order_id: String,
    pub broker_order_id: Option<String>,
    pub symbol: String,
    pub side: Side,
    pub qty: f64,
    pub order_type: OrderType,
    pub limit_price: Option<f64>,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub filled_qty: f64,
    pub filled_avg_price: Option<f64>,
    pub strategy_id: Option<String>,
    pub signal_id: Option<String>,
}

impl Order {
    pub fn is_open(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Cache record for the `mm:orders:` namespace.
    pub fn to_cached(&self) -> CachedOrder {
        CachedOrder {
            order_id: self.broker_order_id.clone().unwrap_or_default(),
            client_order_id: self.client_order_id.clone(),
            symbol: self.symbol.clone(),
            side: self.side.to_string(),
            qty: self.qty,
            order_type: self.order_type.to_string(),
            status: self.status.as_str().to_string(),
            limit_price: self.limit_price,
            filled_qty: Some(self.filled_qty),
            filled_price: self.filled_avg_price,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Why a transition was rejected. The order is untouched in every case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    UnknownOrder(String),
    InvalidTransition {
        client_order_id: String,
        from: OrderStatus,
        to: OrderStatus,
    },
    BrokerIdConflict {
        client_order_id: String,
        existing: String,
        attempted: String,
    },
}

impl std::fmt::Display for TransitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownOrder(id) => write!(f, "order {id} not found"),
            Self::InvalidTransition {
                client_order_id,
                from,
                to,
            } => write!(f, "invalid transition {from} -> {to} for {client_order_id}"),
            Self::BrokerIdConflict {
                client_order_id,
                existing,
                attempted,
            } => write!(
                f,
                "broker id already {existing}, refusing {attempted} for {client_order_id}"
            ),
        }
    }
}

impl std::error::Error for TransitionError {}

/// Optional fields applied atomically with a transition.
#[derive(Debug, Clone, Default)]
pub struct TransitionUpdate {
    pub broker_order_id: Option<String>,
    pub filled_qty: Option<f64>,
    pub filled_price: Option<f64>,
}

/// Owns every order minted this process lifetime, keyed by client id with a
/// secondary index by broker id.
pub struct OrderManager {
    orders: RwLock<HashMap<String, Order>>,
    broker_index: RwLock<HashMap<String, String>>,
}

impl OrderManager {
    pub fn new() -> Self {
        info!("order manager initialised");
        Self {
            orders: RwLock::new(HashMap::new()),
            broker_index: RwLock::new(HashMap::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Minting
    // -------------------------------------------------------------------------

    /// Mint a new PENDING order with a fresh client id.
    #[allow(clippy::too_many_arguments)]
    pub fn mint(
        &self,
        symbol: &str,
        side: Side,
        qty: f64,
        order_type: OrderType,
        limit_price: Option<f64>,
        strategy_id: Option<&str>,
        signal_id: Option<&str>,
    ) -> Result<Order> {
        if qty <= 0.0 {
            bail!("order quantity must be positive, got {qty}");
        }
        if order_type == OrderType::Limit && limit_price.map(|p| p <= 0.0).unwrap_or(true) {
            bail!("limit order requires a positive limit price");
        }

        let now = Utc::now();
        let order = Order {
            client_order_id: format!("ord_{}", &Uuid::new_v4().simple().to_string()[..12]),
            broker_order_id: None,
            symbol: symbol.to_string(),
            side,
            qty,
            order_type,
            limit_price,
            status: OrderStatus::Pending,
            created_at: now,
            updated_at: now,
            filled_qty: 0.0,
            filled_avg_price: None,
            strategy_id: strategy_id.map(String::from),
            signal_id: signal_id.map(String::from),
        };

        info!(
            client_order_id = %order.client_order_id,
            symbol,
            side = %side,
            qty,
            order_type = %order_type,
            "order minted"
        );

        self.orders
            .write()
            .insert(order.client_order_id.clone(), order.clone());
        Ok(order)
    }

    // -------------------------------------------------------------------------
    // Transitions
    // -------------------------------------------------------------------------

    /// Attempt a transition. Rejections leave the order unchanged and are
    /// returned as values, never panics; the loop must survive them.
    pub fn transition(
        &self,
        client_order_id: &str,
        to: OrderStatus,
        update: TransitionUpdate,
    ) -> Result<Order, TransitionError> {
        let mut orders = self.orders.write();

        let order = orders
            .get_mut(client_order_id)
            .ok_or_else(|| TransitionError::UnknownOrder(client_order_id.to_string()))?;

        let from = order.status;
        if !from.can_transition_to(to) {
            warn!(
                client_order_id,
                from = %from,
                to = %to,
                "invalid order transition rejected"
            );
            return Err(TransitionError::InvalidTransition {
                client_order_id: client_order_id.to_string(),
                from,
                to,
            });
        }

        // Broker id may be attached exactly once, and only while entering
        // SUBMITTED. A second attempt with the same id is a harmless echo.
        if let Some(broker_id) = &update.broker_order_id {
            match &order.broker_order_id {
                None => {
                    if to == OrderStatus::Submitted {
                        order.broker_order_id = Some(broker_id.clone());
                        self.broker_index
                            .write()
                            .insert(broker_id.clone(), client_order_id.to_string());
                    }
                }
                Some(existing) if existing != broker_id => {
                    warn!(
                        client_order_id,
                        existing = %existing,
                        attempted = %broker_id,
                        "conflicting broker order id rejected"
                    );
                    return Err(TransitionError::BrokerIdConflict {
                        client_order_id: client_order_id.to_string(),
                        existing: existing.clone(),
                        attempted: broker_id.clone(),
                    });
                }
                Some(_) => {}
            }
        }

        order.status = to;
        order.updated_at = Utc::now();

        // Fill quantities accumulate; a stale report never shrinks them.
        if let Some(qty) = update.filled_qty {
            order.filled_qty = order.filled_qty.max(qty);
        }
        if let Some(price) = update.filled_price {
            order.filled_avg_price = Some(price);
        }

        info!(
            client_order_id,
            from = %from,
            to = %to,
            filled_qty = order.filled_qty,
            "order transitioned"
        );

        Ok(order.clone())
    }

    // ── Convenience wrappers ────────────────────────────────────────────

    pub fn mark_submitted(
        &self,
        client_order_id: &str,
        broker_order_id: &str,
    ) -> Result<Order, TransitionError> {
        self.transition(
            client_order_id,
            OrderStatus::Submitted,
            TransitionUpdate {
                broker_order_id: Some(broker_order_id.to_string()),
                ..Default::default()
            },
        )
    }

    pub fn mark_filled(
        &self,
        client_order_id: &str,
        filled_qty: f64,
        filled_price: f64,
    ) -> Result<Order, TransitionError> {
        self.transition(
            client_order_id,
            OrderStatus::Filled,
            TransitionUpdate {
                filled_qty: Some(filled_qty),
                filled_price: Some(filled_price),
                ..Default::default()
            },
        )
    }

    pub fn mark_partial_fill(
        &self,
        client_order_id: &str,
        filled_qty: f64,
        filled_price: f64,
    ) -> Result<Order, TransitionError> {
        self.transition(
            client_order_id,
            OrderStatus::PartialFill,
            TransitionUpdate {
                filled_qty: Some(filled_qty),
                filled_price: Some(filled_price),
                ..Default::default()
            },
        )
    }

    pub fn mark_cancelled(&self, client_order_id: &str) -> Result<Order, TransitionError> {
        self.transition(
            client_order_id,
            OrderStatus::Cancelled,
            TransitionUpdate::default(),
        )
    }

    pub fn mark_failed(&self, client_order_id: &str) -> Result<Order, TransitionError> {
        self.transition(
            client_order_id,
            OrderStatus::Failed,
            TransitionUpdate::default(),
        )
    }

    /// Mark an order UNKNOWN after a submit timeout. An order that never got
    /// its submit acknowledged is still PENDING; the attempt itself moves it
    /// through SUBMITTED (legally, without a broker id) before UNKNOWN.
    pub fn mark_unknown(&self, client_order_id: &str) -> Result<Order, TransitionError> {
        let status = self
            .get(client_order_id)
            .ok_or_else(|| TransitionError::UnknownOrder(client_order_id.to_string()))?
            .status;

        if status == OrderStatus::Pending {
            self.transition(
                client_order_id,
                OrderStatus::Submitted,
                TransitionUpdate::default(),
            )?;
        }
        self.transition(
            client_order_id,
            OrderStatus::Unknown,
            TransitionUpdate::default(),
        )
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn get(&self, client_order_id: &str) -> Option<Order> {
        self.orders.read().get(client_order_id).cloned()
    }

    pub fn get_by_broker_id(&self, broker_order_id: &str) -> Option<Order> {
        let client_id = self.broker_index.read().get(broker_order_id).cloned()?;
        self.get(&client_id)
    }

    /// All non-terminal orders.
    pub fn open_orders(&self) -> Vec<Order> {
        self.orders
            .read()
            .values()
            .filter(|o| o.is_open())
            .cloned()
            .collect()
    }

    pub fn orders_by_symbol(&self, symbol: &str) -> Vec<Order> {
        self.orders
            .read()
            .values()
            .filter(|o| o.symbol == symbol)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.orders.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.read().is_empty()
    }

    /// Drop terminal orders (explicit housekeeping; retention is otherwise
    /// process-lifetime). Returns how many were removed.
    pub fn purge_terminal(&self) -> usize {
        let mut orders = self.orders.write();
        let mut index = self.broker_index.write();
        let before = orders.len();
        orders.retain(|_, o| {
            let keep = o.is_open();
            if !keep {
                if let Some(bid) = &o.broker_order_id {
                    index.remove(bid);
                }
            }
            keep
        });
        before - orders.len()
    }
}

impl Default for OrderManager {
    fn default() -> Self {
        Self::new()
    }
}
