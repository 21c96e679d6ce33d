// =============================================================================
// Live state cache — positions, orders, heartbeats, general KV with TTL
// =============================================================================
//
// The only mutable-state store in the system, and it is everywhere treated as
// a CACHE: the broker is truth for positions and orders, the append log is
// the audit trail. Losing the cache loses nothing that cannot be rebuilt.
//
// Key naming convention (flat, namespaced):
//   mm:positions:<symbol>        - position state (JSON)
//   mm:orders:<broker_id>        - order state (JSON)
//   mm:orders:client:<client_id> - client-id -> broker-id index
//   mm:heartbeat:<process>       - process heartbeat (JSON, TTL)
//   mm:state:<key>               - general state
//
// Two implementations behind one trait: an in-memory store for tests and
// degraded operation, and a Redis-backed store for production where the
// watchdog (a separate process) reads the same keys.
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use redis::Commands;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

const PREFIX: &str = "mm";
const EQUITY_HISTORY_CAP: usize = 1000;

/// A cached position. Borrowed view of broker truth; replaced wholesale on
/// every sync and deleted when the broker reports zero quantity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedPosition {
    pub symbol: String,
    pub qty: f64,
    pub avg_price: f64,
    pub market_value: f64,
    pub unrealized_pnl: f64,
    pub side: String,
    pub updated_at: DateTime<Utc>,
}

/// A cached order record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedOrder {
    pub order_id: String,
    pub client_order_id: String,
    pub symbol: String,
    pub side: String,
    pub qty: f64,
    pub order_type: String,
    pub status: String,
    pub limit_price: Option<f64>,
    pub filled_qty: Option<f64>,
    pub filled_price: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CachedOrder {
    /// Whether this order counts as open for zombie detection.
    pub fn is_open(&self) -> bool {
        matches!(
            self.status.as_str(),
            "pending" | "submitted" | "partial_fill" | "new" | "accepted"
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HeartbeatRecord {
    process: String,
    timestamp: DateTime<Utc>,
}

// =============================================================================
// StateStore trait
// =============================================================================

/// Typed accessors over the flat `mm:` keyspace. All writes are atomic at
/// the key level.
pub trait StateStore: Send + Sync {
    /// Liveness probe.
    fn ping(&self) -> bool;

    // ── Positions ───────────────────────────────────────────────────────
    fn set_position(&self, position: &CachedPosition) -> Result<()>;
    fn get_position(&self, symbol: &str) -> Result<Option<CachedPosition>>;
    fn all_positions(&self) -> Result<Vec<CachedPosition>>;
    fn delete_position(&self, symbol: &str) -> Result<()>;

    /// Atomically replace the entire positions namespace with broker truth.
    fn sync_positions(&self, positions: &[CachedPosition]) -> Result<()>;

    // ── Orders ──────────────────────────────────────────────────────────
    fn set_order(&self, order: &CachedOrder) -> Result<()>;
    fn get_order(&self, broker_id: &str) -> Result<Option<CachedOrder>>;
    fn get_order_by_client_id(&self, client_id: &str) -> Result<Option<CachedOrder>>;
    fn open_orders(&self) -> Result<Vec<CachedOrder>>;

    /// Orders still open past the staleness threshold.
    fn zombie_orders(&self, max_age: Duration) -> Result<Vec<CachedOrder>>;

    // ── Heartbeats (always TTL'd) ───────────────────────────────────────
    fn send_heartbeat(&self, process: &str, ttl_secs: u64) -> Result<()>;
    fn check_heartbeat(&self, process: &str) -> Result<Option<DateTime<Utc>>>;

    // ── General state ───────────────────────────────────────────────────
    fn set_state(&self, key: &str, value: &serde_json::Value) -> Result<()>;
    fn get_state(&self, key: &str) -> Result<Option<serde_json::Value>>;
    fn delete_state(&self, key: &str) -> Result<()>;

    fn close(&self) -> Result<()>;

    // ── Derived helpers with default implementations ────────────────────

    fn is_process_alive(&self, process: &str, max_age: Duration) -> Result<bool> {
        match self.check_heartbeat(process)? {
            Some(ts) => {
                let age = Utc::now().signed_duration_since(ts);
                Ok(age.num_seconds() >= 0 && (age.num_seconds() as u64) < max_age.as_secs())
            }
            None => Ok(false),
        }
    }

    fn set_initial_equity(&self, equity: f64) -> Result<()> {
        self.set_state("initial_equity", &serde_json::json!(equity))
    }

    fn get_initial_equity(&self) -> Result<Option<f64>> {
        Ok(self.get_state("initial_equity")?.and_then(|v| v.as_f64()))
    }

    /// Append an equity sample, capping the history length.
    fn push_equity(&self, equity: f64) -> Result<()> {
        let mut history = self.equity_history()?;
        history.push(equity);
        if history.len() > EQUITY_HISTORY_CAP {
            let excess = history.len() - EQUITY_HISTORY_CAP;
            history.drain(..excess);
        }
        self.set_state("equity_history", &serde_json::json!(history))
    }

    fn equity_history(&self) -> Result<Vec<f64>> {
        Ok(self
            .get_state("equity_history")?
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default())
    }
}

fn position_key(symbol: &str) -> String {
    format!("{PREFIX}:positions:{symbol}")
}

fn order_key(broker_id: &str) -> String {
    format!("{PREFIX}:orders:{broker_id}")
}

fn order_client_key(client_id: &str) -> String {
    format!("{PREFIX}:orders:client:{client_id}")
}

fn heartbeat_key(process: &str) -> String {
    format!("{PREFIX}:heartbeat:{process}")
}

fn state_key(key: &str) -> String {
    format!("{PREFIX}:state:{key}")
}

// =============================================================================
// In-memory implementation
// =============================================================================

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

/// In-process state store with the same keyspace and TTL semantics as the
/// Redis store. Used in tests and as a degraded-mode fallback; it cannot
/// serve the watchdog, which lives in another process.
#[derive(Default)]
pub struct MemoryStateStore {
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn get_raw(&self, key: &str) -> Option<String> {
        let entries = self.entries.read();
        let entry = entries.get(key)?;
        if let Some(expiry) = entry.expires_at {
            if Instant::now() >= expiry {
                return None;
            }
        }
        Some(entry.value.clone())
    }

    fn set_raw(&self, key: String, value: String, ttl: Option<Duration>) {
        self.entries.write().insert(
            key,
            Entry {
                value,
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
    }

    fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let now = Instant::now();
        self.entries
            .read()
            .iter()
            .filter(|(k, e)| {
                k.starts_with(prefix) && e.expires_at.map(|exp| now < exp).unwrap_or(true)
            })
            .map(|(k, _)| k.clone())
            .collect()
    }
}

impl StateStore for MemoryStateStore {
    fn ping(&self) -> bool {
        true
    }

    fn set_position(&self, position: &CachedPosition) -> Result<()> {
        let json = serde_json::to_string(position)?;
        self.set_raw(position_key(&position.symbol), json, None);
        Ok(())
    }

    fn get_position(&self, symbol: &str) -> Result<Option<CachedPosition>> {
        Ok(self
            .get_raw(&position_key(symbol))
            .and_then(|s| serde_json::from_str(&s).ok()))
    }

    fn all_positions(&self) -> Result<Vec<CachedPosition>> {
        let keys = self.keys_with_prefix(&format!("{PREFIX}:positions:"));
        Ok(keys
            .iter()
            .filter_map(|k| self.get_raw(k))
            .filter_map(|s| serde_json::from_str(&s).ok())
            .collect())
    }

    fn delete_position(&self, symbol: &str) -> Result<()> {
        self.entries.write().remove(&position_key(symbol));
        Ok(())
    }

    fn sync_positions(&self, positions: &[CachedPosition]) -> Result<()> {
        let mut entries = self.entries.write();
        entries.retain(|k, _| !k.starts_with(&format!("{PREFIX}:positions:")));
        for pos in positions {
            entries.insert(
                position_key(&pos.symbol),
                Entry {
                    value: serde_json::to_string(pos)?,
                    expires_at: None,
                },
            );
        }
        debug!(count = positions.len(), "positions synced");
        Ok(())
    }

    fn set_order(&self, order: &CachedOrder) -> Result<()> {
        let json = serde_json::to_string(order)?;
        self.set_raw(order_key(&order.order_id), json, None);
        self.set_raw(
            order_client_key(&order.client_order_id),
            order.order_id.clone(),
            None,
        );
        Ok(())
    }

    fn get_order(&self, broker_id: &str) -> Result<Option<CachedOrder>> {
        Ok(self
            .get_raw(&order_key(broker_id))
            .and_then(|s| serde_json::from_str(&s).ok()))
    }

    fn get_order_by_client_id(&self, client_id: &str) -> Result<Option<CachedOrder>> {
        match self.get_raw(&order_client_key(client_id)) {
            Some(broker_id) => self.get_order(&broker_id),
            None => Ok(None),
        }
    }

    fn open_orders(&self) -> Result<Vec<CachedOrder>> {
        let prefix = format!("{PREFIX}:orders:");
        let client_prefix = format!("{PREFIX}:orders:client:");
        let keys = self.keys_with_prefix(&prefix);
        Ok(keys
            .iter()
            .filter(|k| !k.starts_with(&client_prefix))
            .filter_map(|k| self.get_raw(k))
            .filter_map(|s| serde_json::from_str::<CachedOrder>(&s).ok())
            .filter(|o| o.is_open())
            .collect())
    }

    fn zombie_orders(&self, max_age: Duration) -> Result<Vec<CachedOrder>> {
        let threshold = Utc::now() - chrono::Duration::seconds(max_age.as_secs() as i64);
        let zombies: Vec<CachedOrder> = self
            .open_orders()?
            .into_iter()
            .filter(|o| o.created_at < threshold)
            .collect();
        if !zombies.is_empty() {
            warn!(count = zombies.len(), "zombie orders detected");
        }
        Ok(zombies)
    }

    fn send_heartbeat(&self, process: &str, ttl_secs: u64) -> Result<()> {
        let record = HeartbeatRecord {
            process: process.to_string(),
            timestamp: Utc::now(),
        };
        self.set_raw(
            heartbeat_key(process),
            serde_json::to_string(&record)?,
            Some(Duration::from_secs(ttl_secs)),
        );
        Ok(())
    }

    fn check_heartbeat(&self, process: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .get_raw(&heartbeat_key(process))
            .and_then(|s| serde_json::from_str::<HeartbeatRecord>(&s).ok())
            .map(|r| r.timestamp))
    }

    fn set_state(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        self.set_raw(state_key(key), serde_json::to_string(value)?, None);
        Ok(())
    }

    fn get_state(&self, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self
            .get_raw(&state_key(key))
            .and_then(|s| serde_json::from_str(&s).ok()))
    }

    fn delete_state(&self, key: &str) -> Result<()> {
        self.entries.write().remove(&state_key(key));
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Redis implementation
// =============================================================================

/// Redis-backed state store. The watchdog opens its own connection to the
/// same instance; the two processes share keys, never memory.
pub struct RedisStateStore {
    client: redis::Client,
    socket_timeout: Duration,
}

impl RedisStateStore {
    /// Connect and verify liveness. A dead cache at startup is a hard error
    /// (exit code 1 at the binary boundary).
    pub fn connect(url: &str, socket_timeout: Duration) -> Result<Self> {
        let client =
            redis::Client::open(url).with_context(|| format!("invalid cache url {url}"))?;

        let store = Self {
            client,
            socket_timeout,
        };

        if !store.ping() {
            anyhow::bail!("live state cache unreachable at {url}");
        }

        info!(url, "state cache connected");
        Ok(store)
    }

    fn conn(&self) -> Result<redis::Connection> {
        let conn = self
            .client
            .get_connection_with_timeout(self.socket_timeout)
            .context("cache connection failed")?;
        conn.set_read_timeout(Some(self.socket_timeout))?;
        conn.set_write_timeout(Some(self.socket_timeout))?;
        Ok(conn)
    }

    fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.conn()?;
        Ok(conn.keys(pattern)?)
    }
}

impl StateStore for RedisStateStore {
    fn ping(&self) -> bool {
        match self.conn() {
            Ok(mut conn) => redis::cmd("PING").query::<String>(&mut conn).is_ok(),
            Err(_) => false,
        }
    }

    fn set_position(&self, position: &CachedPosition) -> Result<()> {
        let mut conn = self.conn()?;
        conn.set::<_, _, ()>(
            position_key(&position.symbol),
            serde_json::to_string(position)?,
        )?;
        Ok(())
    }

    fn get_position(&self, symbol: &str) -> Result<Option<CachedPosition>> {
        let mut conn = self.conn()?;
        let raw: Option<String> = conn.get(position_key(symbol))?;
        Ok(raw.and_then(|s| serde_json::from_str(&s).ok()))
    }

    fn all_positions(&self) -> Result<Vec<CachedPosition>> {
        let keys = self.keys(&format!("{PREFIX}:positions:*"))?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn()?;
        let mut positions = Vec::new();
        for key in keys {
            let raw: Option<String> = conn.get(&key)?;
            if let Some(pos) = raw.and_then(|s| serde_json::from_str(&s).ok()) {
                positions.push(pos);
            }
        }
        Ok(positions)
    }

    fn delete_position(&self, symbol: &str) -> Result<()> {
        let mut conn = self.conn()?;
        conn.del::<_, ()>(position_key(symbol))?;
        Ok(())
    }

    fn sync_positions(&self, positions: &[CachedPosition]) -> Result<()> {
        // Clear the namespace and rewrite it in one atomic pipeline.
        let keys = self.keys(&format!("{PREFIX}:positions:*"))?;
        let mut conn = self.conn()?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        for key in &keys {
            pipe.del(key).ignore();
        }
        for pos in positions {
            pipe.set(position_key(&pos.symbol), serde_json::to_string(pos)?)
                .ignore();
        }
        pipe.query::<()>(&mut conn)?;

        debug!(count = positions.len(), "positions synced");
        Ok(())
    }

    fn set_order(&self, order: &CachedOrder) -> Result<()> {
        let mut conn = self.conn()?;
        let mut pipe = redis::pipe();
        pipe.atomic()
            .set(order_key(&order.order_id), serde_json::to_string(order)?)
            .ignore()
            .set(
                order_client_key(&order.client_order_id),
                order.order_id.clone(),
            )
            .ignore();
        pipe.query::<()>(&mut conn)?;
        Ok(())
    }

    fn get_order(&self, broker_id: &str) -> Result<Option<CachedOrder>> {
        let mut conn = self.conn()?;
        let raw: Option<String> = conn.get(order_key(broker_id))?;
        Ok(raw.and_then(|s| serde_json::from_str(&s).ok()))
    }

    fn get_order_by_client_id(&self, client_id: &str) -> Result<Option<CachedOrder>> {
        let mut conn = self.conn()?;
        let broker_id: Option<String> = conn.get(order_client_key(client_id))?;
        match broker_id {
            Some(id) => self.get_order(&id),
            None => Ok(None),
        }
    }

    fn open_orders(&self) -> Result<Vec<CachedOrder>> {
        let client_prefix = format!("{PREFIX}:orders:client:");
        let keys = self.keys(&format!("{PREFIX}:orders:*"))?;
        let mut conn = self.conn()?;
        let mut orders = Vec::new();
        for key in keys {
            if key.starts_with(&client_prefix) {
                continue;
            }
            let raw: Option<String> = conn.get(&key)?;
            if let Some(order) = raw.and_then(|s| serde_json::from_str::<CachedOrder>(&s).ok()) {
                if order.is_open() {
                    orders.push(order);
                }
            }
        }
        Ok(orders)
    }

    fn zombie_orders(&self, max_age: Duration) -> Result<Vec<CachedOrder>> {
        let threshold = Utc::now() - chrono::Duration::seconds(max_age.as_secs() as i64);
        let zombies: Vec<CachedOrder> = self
            .open_orders()?
            .into_iter()
            .filter(|o| o.created_at < threshold)
            .collect();
        if !zombies.is_empty() {
            warn!(count = zombies.len(), "zombie orders detected");
        }
        Ok(zombies)
    }

    fn send_heartbeat(&self, process: &str, ttl_secs: u64) -> Result<()> {
        let record = HeartbeatRecord {
            process: process.to_string(),
            timestamp: Utc::now(),
        };
        let mut conn = self.conn()?;
        conn.set_ex::<_, _, ()>(
            heartbeat_key(process),
            serde_json::to_string(&record)?,
            ttl_secs,
        )?;
        Ok(())
    }

    fn check_heartbeat(&self, process: &str) -> Result<Option<DateTime<Utc>>> {
        let mut conn = self.conn()?;
        let raw: Option<String> = conn.get(heartbeat_key(process))?;
        Ok(raw
            .and_then(|s| serde_json::from_str::<HeartbeatRecord>(&s).ok())
            .map(|r| r.timestamp))
    }

    fn set_state(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        let mut conn = self.conn()?;
        conn.set::<_, _, ()>(state_key(key), serde_json::to_string(value)?)?;
        Ok(())
    }

    fn get_state(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let mut conn = self.conn()?;
        let raw: Option<String> = conn.get(state_key(key))?;
        Ok(raw.and_then(|s| serde_json::from_str(&s).ok()))
    }

    fn delete_state(&self, key: &str) -> Result<()> {
        let mut conn = self.conn()?;
        conn.del::<_, ()>(state_key(key))?;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        info!("state cache connection closed");
        Ok(())
    }
}
