// =============================================================================
// Shared types used across the Meridian trading engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

/// Supported order types. Nothing fancier than limit and market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Limit,
    Market,
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Limit => write!(f, "limit"),
            Self::Market => write!(f, "market"),
        }
    }
}

/// Execution environment. `Live` is recognised so that a config asking for it
/// can be rejected loudly at startup instead of being silently coerced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Paper,
    Live,
}

impl Default for Environment {
    fn default() -> Self {
        Self::Paper
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Paper => write!(f, "paper"),
            Self::Live => write!(f, "live"),
        }
    }
}

/// Data provenance tier for bars. Tier-0 rows are survey data only: they are
/// never admissible to backtests or signal generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataTier {
    #[serde(rename = "TIER_0_UNIVERSE")]
    Tier0Universe,
    #[serde(rename = "TIER_1_VALIDATION")]
    Tier1Validation,
    #[serde(rename = "TIER_2_SPREAD_MODEL")]
    Tier2SpreadModel,
    #[serde(rename = "TIER_3_LIVE")]
    Tier3Live,
}

impl DataTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tier0Universe => "TIER_0_UNIVERSE",
            Self::Tier1Validation => "TIER_1_VALIDATION",
            Self::Tier2SpreadModel => "TIER_2_SPREAD_MODEL",
            Self::Tier3Live => "TIER_3_LIVE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "TIER_0_UNIVERSE" => Some(Self::Tier0Universe),
            "TIER_1_VALIDATION" => Some(Self::Tier1Validation),
            "TIER_2_SPREAD_MODEL" => Some(Self::Tier2SpreadModel),
            "TIER_3_LIVE" => Some(Self::Tier3Live),
            _ => None,
        }
    }
}

impl std::fmt::Display for DataTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Quality descriptor attached to stored bars.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BarQuality {
    /// Survivorship-biased, adjusted, delayed data (free sources).
    #[default]
    Delayed,
    /// Realtime feed quality.
    Realtime,
}

/// A single OHLCV bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub symbol: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub timeframe: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub tier: DataTier,
    #[serde(default)]
    pub estimated_spread_bps: Option<f64>,
    #[serde(default)]
    pub quality: BarQuality,
}

impl Bar {
    /// Sanity-check the OHLCV invariants: high is the ceiling, low is the
    /// floor, prices are positive and volume is non-negative.
    pub fn is_valid(&self) -> bool {
        self.open > 0.0
            && self.high > 0.0
            && self.low > 0.0
            && self.close > 0.0
            && self.volume >= 0.0
            && self.high >= self.open.max(self.close).max(self.low)
            && self.low <= self.open.min(self.close).min(self.high)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn bar(open: f64, high: f64, low: f64, close: f64, volume: f64) -> Bar {
        Bar {
            symbol: "SPY".into(),
            timestamp: Utc::now(),
            timeframe: "1Day".into(),
            open,
            high,
            low,
            close,
            volume,
            tier: DataTier::Tier1Validation,
            estimated_spread_bps: None,
            quality: BarQuality::Delayed,
        }
    }

    #[test]
    fn valid_bar_passes() {
        assert!(bar(100.0, 101.0, 99.0, 100.5, 1000.0).is_valid());
    }

    #[test]
    fn high_below_close_fails() {
        assert!(!bar(100.0, 100.2, 99.0, 100.5, 1000.0).is_valid());
    }

    #[test]
    fn low_above_open_fails() {
        assert!(!bar(100.0, 101.0, 100.4, 100.5, 1000.0).is_valid());
    }

    #[test]
    fn negative_volume_fails() {
        assert!(!bar(100.0, 101.0, 99.0, 100.5, -1.0).is_valid());
    }

    #[test]
    fn zero_price_fails() {
        assert!(!bar(0.0, 101.0, 99.0, 100.5, 1.0).is_valid());
    }

    #[test]
    fn side_display() {
        assert_eq!(Side::Buy.to_string(), "buy");
        assert_eq!(Side::Sell.to_string(), "sell");
    }

    #[test]
    fn tier_roundtrip() {
        for tier in [
            DataTier::Tier0Universe,
            DataTier::Tier1Validation,
            DataTier::Tier2SpreadModel,
            DataTier::Tier3Live,
        ] {
            assert_eq!(DataTier::parse(tier.as_str()), Some(tier));
        }
        assert_eq!(DataTier::parse("TIER_9"), None);
    }
}
