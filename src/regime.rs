// =============================================================================
// Market Regime Detector — dual-speed volatility + trend classification
// =============================================================================
//
// Two volatility measures at different speeds:
//
//   FAST — short-window ATR (default 3 days), annualized. Catches a crash
//          within days.
//   SLOW — realized return volatility (default 20 days), annualized. Provides
//          the stable context the fast measure is compared against.
//
// CRISIS OVERRIDE: when fast exceeds slow by the crisis multiplier (default
// 2x), the regime is forced to (choppy, crisis) with momentum disabled and
// position scale 0.25, regardless of what ADX says. This preempts the lag
// mismatch where a flash crash blows through positions before the slow
// detector responds.
//
// Otherwise trend is classified off ADX (choppy < 20 <= weak < 25 <= strong)
// and volatility off the percentile of current slow-vol within its own
// rolling history (low < 20th, normal, high > 80th).
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::RegimeConfig;
use crate::indicators::{adx, atr, vol};
use crate::storage::column_store::RegimeRow;
use crate::types::Bar;

const TRADING_DAYS_PER_YEAR: f64 = 252.0;

/// Trend strength classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendRegime {
    /// Momentum strategies off.
    Choppy,
    WeakTrend,
    StrongTrend,
}

impl std::fmt::Display for TrendRegime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Choppy => write!(f, "choppy"),
            Self::WeakTrend => write!(f, "weak_trend"),
            Self::StrongTrend => write!(f, "strong_trend"),
        }
    }
}

/// Volatility regime classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolRegime {
    LowVol,
    Normal,
    HighVol,
    /// Forced when fast vol blows past slow vol. Preempts everything.
    Crisis,
}

impl std::fmt::Display for VolRegime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LowVol => write!(f, "low_vol"),
            Self::Normal => write!(f, "normal"),
            Self::HighVol => write!(f, "high_vol"),
            Self::Crisis => write!(f, "crisis"),
        }
    }
}

/// Complete market regime classification plus the derived trading switches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketRegime {
    pub timestamp: DateTime<Utc>,
    pub symbol: Option<String>,
    pub trend: TrendRegime,
    pub volatility: VolRegime,
    pub adx: Option<f64>,
    pub fast_vol: Option<f64>,
    pub slow_vol: Option<f64>,
    pub vol_ratio: Option<f64>,
    pub momentum_enabled: bool,
    /// Multiplier in [0, 1] applied to position sizes downstream.
    pub position_scale: f64,
}

impl MarketRegime {
    pub fn combined(&self) -> String {
        format!("{}_{}", self.trend, self.volatility)
    }

    /// Column-store row for the regimes table.
    pub fn to_row(&self) -> RegimeRow {
        RegimeRow {
            timestamp: self.timestamp,
            symbol: self.symbol.clone(),
            trend_regime: self.trend.to_string(),
            vol_regime: self.volatility.to_string(),
            adx: self.adx,
            fast_vol: self.fast_vol,
            slow_vol: self.slow_vol,
            vol_ratio: self.vol_ratio,
            momentum_enabled: self.momentum_enabled,
            position_scale: self.position_scale,
        }
    }
}

/// The detector. Stateless between calls; all context comes from the bars.
pub struct RegimeDetector {
    fast_window: usize,
    slow_window: usize,
    crisis_multiplier: f64,
    adx_period: usize,
    adx_choppy: f64,
    adx_trending: f64,
    low_vol_percentile: f64,
    high_vol_percentile: f64,
    /// Absolute annualized slow-vol floor that reads high regardless of the
    /// percentile. A short history cannot dilute a 50%-vol tape to "normal".
    high_vol_absolute: f64,
}

impl RegimeDetector {
    pub fn new(config: &RegimeConfig) -> Self {
        Self {
            fast_window: config.fast_window_days,
            slow_window: config.slow_window_days,
            crisis_multiplier: config.crisis_multiplier,
            adx_period: 14,
            adx_choppy: 20.0,
            adx_trending: 25.0,
            low_vol_percentile: 20.0,
            high_vol_percentile: 80.0,
            high_vol_absolute: 0.50,
        }
    }

    /// Classify the current regime from daily bars (oldest first).
    pub fn detect(&self, bars: &[Bar], symbol: Option<&str>) -> MarketRegime {
        let required = self.slow_window.max(2 * self.adx_period);
        if bars.len() < required {
            warn!(
                bars = bars.len(),
                required,
                symbol = symbol.unwrap_or("<market>"),
                "insufficient data for regime detection, conservative default"
            );
            // Conservative, explicitly not zero: half-size, momentum off.
            return MarketRegime {
                timestamp: Utc::now(),
                symbol: symbol.map(String::from),
                trend: TrendRegime::Choppy,
                volatility: VolRegime::Normal,
                adx: None,
                fast_vol: None,
                slow_vol: None,
                vol_ratio: None,
                momentum_enabled: false,
                position_scale: 0.5,
            };
        }

        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();

        // Both measures annualized so the ratio is unit-free.
        let fast_vol = atr::atr_pct(bars, self.fast_window)
            .map(|pct| pct * TRADING_DAYS_PER_YEAR.sqrt());
        let slow_vol = vol::realized_vol(&closes, self.slow_window);
        let adx_value = adx::adx(bars, self.adx_period);

        let vol_ratio = match (fast_vol, slow_vol) {
            (Some(fast), Some(slow)) if slow > 0.0 => Some(fast / slow),
            _ => None,
        };

        // Crisis override preempts every other signal.
        if let Some(ratio) = vol_ratio {
            if ratio > self.crisis_multiplier {
                warn!(
                    symbol = symbol.unwrap_or("<market>"),
                    fast_vol = fast_vol.unwrap_or(0.0),
                    slow_vol = slow_vol.unwrap_or(0.0),
                    ratio,
                    "crisis regime detected"
                );
                return MarketRegime {
                    timestamp: Utc::now(),
                    symbol: symbol.map(String::from),
                    trend: TrendRegime::Choppy,
                    volatility: VolRegime::Crisis,
                    adx: adx_value,
                    fast_vol,
                    slow_vol,
                    vol_ratio,
                    momentum_enabled: false,
                    position_scale: Self::scale_for(VolRegime::Crisis),
                };
            }
        }

        let percentile = match slow_vol {
            Some(current) => {
                let history = vol::rolling_realized_vol(&closes, self.slow_window);
                if history.len() < 5 {
                    50.0
                } else {
                    vol::percentile_rank(&history, current)
                }
            }
            None => 50.0,
        };

        let trend = self.classify_trend(adx_value.unwrap_or(0.0));
        let volatility = self.classify_volatility(percentile, slow_vol);
        let momentum_enabled = trend != TrendRegime::Choppy;
        let position_scale = Self::scale_for(volatility);

        debug!(
            symbol = symbol.unwrap_or("<market>"),
            trend = %trend,
            volatility = %volatility,
            adx = adx_value.unwrap_or(0.0),
            vol_percentile = percentile,
            momentum_enabled,
            position_scale,
            "regime detected"
        );

        MarketRegime {
            timestamp: Utc::now(),
            symbol: symbol.map(String::from),
            trend,
            volatility,
            adx: adx_value,
            fast_vol,
            slow_vol,
            vol_ratio,
            momentum_enabled,
            position_scale,
        }
    }

    fn classify_trend(&self, adx: f64) -> TrendRegime {
        if adx < self.adx_choppy {
            TrendRegime::Choppy
        } else if adx < self.adx_trending {
            TrendRegime::WeakTrend
        } else {
            TrendRegime::StrongTrend
        }
    }

    fn classify_volatility(&self, percentile: f64, slow_vol: Option<f64>) -> VolRegime {
        if slow_vol.map(|v| v > self.high_vol_absolute).unwrap_or(false) {
            return VolRegime::HighVol;
        }
        if percentile < self.low_vol_percentile {
            VolRegime::LowVol
        } else if percentile > self.high_vol_percentile {
            VolRegime::HighVol
        } else {
            VolRegime::Normal
        }
    }

    /// Position scale by volatility regime. Non-increasing in volatility.
    fn scale_for(volatility: VolRegime) -> f64 {
        match volatility {
            VolRegime::LowVol | VolRegime::Normal => 1.0,
            VolRegime::HighVol => 0.5,
            VolRegime::Crisis => 0.25,
        }
    }
}

impl Default for RegimeDetector {
    fn default() -> Self {
        Self::new(&RegimeConfig::default())
    }
}
