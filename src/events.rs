// =============================================================================
// Event model — immutable records on the append-only log
// =============================================================================
//
// Events are the audit trail. Every significant decision the engine makes is
// written as one JSONL line and later drained into the column store by the
// ETL. Events are never mutated after construction.
//
// Wire format (one line per event):
//   {"event_id":"<ts>_<type>_<rand8>","event_type":"bar","timestamp":"...",
//    "symbol":"SPY","source":"engine","correlation_id":null,"data":{...}}
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::types::{Bar, Side};

/// The closed set of event kinds. Anything else on the log is a bug.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Quote,
    Bar,
    Trade,
    Sentiment,
    OrderSubmitted,
    OrderFilled,
    OrderCancelled,
    OrderRejected,
    PartialFill,
    Signal,
    PositionOpened,
    PositionClosed,
    RegimeChange,
    RiskAlert,
    Heartbeat,
    Error,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Quote => "quote",
            Self::Bar => "bar",
            Self::Trade => "trade",
            Self::Sentiment => "sentiment",
            Self::OrderSubmitted => "order_submitted",
            Self::OrderFilled => "order_filled",
            Self::OrderCancelled => "order_cancelled",
            Self::OrderRejected => "order_rejected",
            Self::PartialFill => "partial_fill",
            Self::Signal => "signal",
            Self::PositionOpened => "position_opened",
            Self::PositionClosed => "position_closed",
            Self::RegimeChange => "regime_change",
            Self::RiskAlert => "risk_alert",
            Self::Heartbeat => "heartbeat",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single immutable event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    pub event_type: EventKind,
    pub timestamp: DateTime<Utc>,
    pub symbol: Option<String>,
    pub source: String,
    pub correlation_id: Option<String>,
    pub data: serde_json::Value,
}

impl Event {
    /// Build a new event stamped with the current wall clock and a fresh id.
    ///
    /// Event ids sort chronologically by construction: timestamp prefix,
    /// then kind, then an 8-char random suffix for uniqueness.
    pub fn new(kind: EventKind, source: &str, data: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            event_id: Self::make_id(kind, now),
            event_type: kind,
            timestamp: now,
            symbol: None,
            source: source.to_string(),
            correlation_id: None,
            data,
        }
    }

    pub fn with_symbol(mut self, symbol: &str) -> Self {
        self.symbol = Some(symbol.to_string());
        self
    }

    pub fn with_correlation(mut self, correlation_id: &str) -> Self {
        self.correlation_id = Some(correlation_id.to_string());
        self
    }

    fn make_id(kind: EventKind, ts: DateTime<Utc>) -> String {
        let suffix = Uuid::new_v4().simple().to_string();
        format!(
            "{}_{}_{}",
            ts.format("%Y%m%d%H%M%S%6f"),
            kind.as_str(),
            &suffix[..8]
        )
    }

    pub fn to_json_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json_line(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line)
    }
}

// =============================================================================
// Typed payload constructors
// =============================================================================
//
// Payloads are built through these helpers only, keeping the shape of each
// kind's `data` object in one place.

/// Bar event (market data capture, drained into the bars table).
pub fn bar_event(bar: &Bar, source: &str) -> Event {
    Event::new(
        EventKind::Bar,
        source,
        json!({
            "timeframe": bar.timeframe,
            "tier": bar.tier.as_str(),
            "open": bar.open,
            "high": bar.high,
            "low": bar.low,
            "close": bar.close,
            "volume": bar.volume,
            "estimated_spread_bps": bar.estimated_spread_bps,
        }),
    )
    .with_symbol(&bar.symbol)
}

/// Quote event with derived spread fields.
pub fn quote_event(symbol: &str, bid: f64, ask: f64, bid_size: f64, ask_size: f64) -> Event {
    let mid = (bid + ask) / 2.0;
    let spread_bps = if mid > 0.0 {
        ((ask - bid) / mid) * 10_000.0
    } else {
        0.0
    };
    Event::new(
        EventKind::Quote,
        "market_data",
        json!({
            "bid": bid,
            "ask": ask,
            "bid_size": bid_size,
            "ask_size": ask_size,
            "spread": ask - bid,
            "spread_bps": spread_bps,
        }),
    )
    .with_symbol(symbol)
}

/// Sentiment score event (the table survives even though scraping is external).
pub fn sentiment_event(symbol: &str, score: f64, volume: i64, source: &str) -> Event {
    Event::new(
        EventKind::Sentiment,
        source,
        json!({ "score": score, "volume": volume }),
    )
    .with_symbol(symbol)
}

/// Order lifecycle event. `kind` must be one of the order_* kinds.
#[allow(clippy::too_many_arguments)]
pub fn order_event(
    kind: EventKind,
    symbol: &str,
    client_order_id: &str,
    broker_order_id: Option<&str>,
    side: Side,
    qty: f64,
    price: Option<f64>,
    filled_qty: Option<f64>,
    filled_price: Option<f64>,
) -> Event {
    Event::new(
        kind,
        "execution",
        json!({
            "order_id": broker_order_id,
            "client_order_id": client_order_id,
            "side": side.to_string(),
            "qty": qty,
            "price": price,
            "filled_qty": filled_qty,
            "filled_price": filled_price,
        }),
    )
    .with_symbol(symbol)
    .with_correlation(client_order_id)
}

/// Trading signal event.
pub fn signal_event(
    symbol: &str,
    signal_id: &str,
    strategy_id: &str,
    signal_type: &str,
    confidence: f64,
) -> Event {
    Event::new(
        EventKind::Signal,
        strategy_id,
        json!({
            "signal_id": signal_id,
            "signal_type": signal_type,
            "confidence": confidence,
        }),
    )
    .with_symbol(symbol)
    .with_correlation(signal_id)
}

/// Regime change event.
pub fn regime_event(symbol: Option<&str>, regime: serde_json::Value) -> Event {
    let mut ev = Event::new(EventKind::RegimeChange, "regime_detector", regime);
    if let Some(s) = symbol {
        ev = ev.with_symbol(s);
    }
    ev
}

/// Risk alert event (Friday cutoff, drawdown halts, breaker trips).
pub fn risk_alert_event(alert_type: &str, detail: serde_json::Value) -> Event {
    Event::new(
        EventKind::RiskAlert,
        "risk",
        json!({ "type": alert_type, "detail": detail }),
    )
}

/// Heartbeat event from a named process.
pub fn heartbeat_event(process: &str) -> Event {
    Event::new(
        EventKind::Heartbeat,
        process,
        json!({ "process": process }),
    )
}

/// Error event captured at the per-tick boundary.
pub fn error_event(phase: &str, error: &str) -> Event {
    Event::new(
        EventKind::Error,
        "engine",
        json!({ "phase": phase, "error": error }),
    )
}
