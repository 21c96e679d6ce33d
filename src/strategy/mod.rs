// =============================================================================
// Strategies — regime-gated signal generators
// =============================================================================
//
// A strategy is a pure signal source: bars and regime in, signals out. It
// never sizes, never submits, never touches the broker. The trading loop owns
// the registry and fans each symbol out to every enabled strategy.
// =============================================================================

pub mod ema_crossover;
pub mod rsi_reversion;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::regime::MarketRegime;
use crate::storage::CachedPosition;
use crate::types::Bar;

pub use ema_crossover::EmaCrossover;
pub use rsi_reversion::RsiReversion;

/// Signal direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalType {
    Buy,
    Sell,
    Close,
    Hold,
}

impl std::fmt::Display for SignalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
            Self::Close => write!(f, "CLOSE"),
            Self::Hold => write!(f, "HOLD"),
        }
    }
}

/// A trading signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    pub signal_type: SignalType,
    pub timestamp: DateTime<Utc>,
    pub strategy_id: String,
    pub signal_id: String,
    /// Conviction in [0, 1].
    pub confidence: f64,
    pub entry_price: Option<f64>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Signal {
    pub fn new(
        symbol: &str,
        signal_type: SignalType,
        strategy_id: &str,
        confidence: f64,
    ) -> Self {
        Self {
            symbol: symbol.to_string(),
            signal_type,
            timestamp: Utc::now(),
            strategy_id: strategy_id.to_string(),
            signal_id: format!(
                "{}_{}_{}",
                strategy_id,
                symbol,
                Uuid::new_v4().simple()
            ),
            confidence: confidence.clamp(0.0, 1.0),
            entry_price: None,
            metadata: serde_json::Map::new(),
        }
    }

    pub fn with_entry_price(mut self, price: f64) -> Self {
        self.entry_price = Some(price);
        self
    }

    pub fn with_meta(mut self, key: &str, value: serde_json::Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }
}

/// Signal generator interface.
pub trait Strategy: Send + Sync {
    /// Stable identifier, used for attribution on orders and trades.
    fn id(&self) -> &str;

    /// Produce signals for one symbol. `bars` are oldest-first; `position`
    /// is the currently held position if any.
    fn generate(
        &self,
        symbol: &str,
        bars: &[Bar],
        regime: Option<&MarketRegime>,
        position: Option<&CachedPosition>,
    ) -> Vec<Signal>;
}

/// Whether a held long position exists.
pub(crate) fn has_long(position: Option<&CachedPosition>) -> bool {
    position.map(|p| p.qty > 0.0).unwrap_or(false)
}
