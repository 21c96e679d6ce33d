// =============================================================================
// Position sizing — fixed, volatility-adjusted, and fractional Kelly
// =============================================================================
//
// Sizing mistakes turn a mediocre strategy into a blown account faster than
// bad signals ever will. Every result carries a textual rationale so the
// audit trail explains why a position was the size it was.
//
// All methods clamp to [0.5%, max_position_pct] of portfolio value and apply
// the regime scale multiplicatively.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::RiskConfig;

/// Minimum meaningful position, percent of portfolio.
const MIN_POSITION_PCT: f64 = 0.5;

/// Fraction of full Kelly actually deployed.
const KELLY_FRACTION: f64 = 0.25;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizingMethod {
    Fixed,
    VolatilityAdjusted,
    Kelly,
}

impl SizingMethod {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "fixed" => Some(Self::Fixed),
            "volatility_adjusted" => Some(Self::VolatilityAdjusted),
            "kelly" => Some(Self::Kelly),
            _ => None,
        }
    }
}

impl std::fmt::Display for SizingMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fixed => write!(f, "fixed"),
            Self::VolatilityAdjusted => write!(f, "volatility_adjusted"),
            Self::Kelly => write!(f, "kelly"),
        }
    }
}

/// Outcome of a sizing calculation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizeResult {
    /// Percent of portfolio value.
    pub pct: f64,
    pub dollars: f64,
    pub shares: f64,
    pub price: f64,
    pub method: SizingMethod,
    /// Human-readable audit trail for this size.
    pub rationale: String,
}

/// Inputs beyond price that particular methods need.
#[derive(Debug, Clone, Copy, Default)]
pub struct SizingInputs {
    /// Annualized asset volatility (volatility-adjusted method).
    pub volatility: Option<f64>,
    /// Historical win rate in (0, 1) (Kelly).
    pub win_rate: Option<f64>,
    /// Average win / average loss ratio, > 0 (Kelly).
    pub win_loss_ratio: Option<f64>,
}

pub struct PositionSizer {
    method: SizingMethod,
    max_position_pct: f64,
    /// Target annualized volatility as a fraction (e.g. 0.15).
    volatility_target: f64,
    base_position_pct: f64,
}

impl PositionSizer {
    pub fn new(config: &RiskConfig) -> Self {
        let method = SizingMethod::parse(&config.sizing_method).unwrap_or_else(|| {
            warn!(
                method = %config.sizing_method,
                "unknown sizing method, falling back to volatility_adjusted"
            );
            SizingMethod::VolatilityAdjusted
        });

        info!(
            method = %method,
            max_position_pct = config.max_position_pct,
            volatility_target_pct = config.volatility_target_pct,
            "position sizer initialised"
        );

        Self {
            method,
            max_position_pct: config.max_position_pct,
            volatility_target: config.volatility_target_pct / 100.0,
            base_position_pct: config.base_position_pct,
        }
    }

    /// Size a position.
    ///
    /// `regime_scale` multiplies in the regime and drawdown scaling the loop
    /// computed; a scale of zero sizes everything to the floor, which the
    /// loop never reaches because a halt skips sizing entirely.
    pub fn size(
        &self,
        portfolio_value: f64,
        symbol: &str,
        price: f64,
        inputs: SizingInputs,
        regime_scale: f64,
    ) -> SizeResult {
        match self.method {
            SizingMethod::Fixed => self.size_fixed(portfolio_value, price, regime_scale),
            SizingMethod::VolatilityAdjusted => match inputs.volatility {
                Some(vol) if vol > 0.0 => {
                    self.size_vol_adjusted(portfolio_value, price, vol, regime_scale)
                }
                _ => {
                    warn!(symbol, "volatility missing or invalid, using fixed sizing");
                    self.size_fixed(portfolio_value, price, regime_scale)
                }
            },
            SizingMethod::Kelly => match (inputs.win_rate, inputs.win_loss_ratio) {
                (Some(p), Some(b)) if p > 0.0 && p < 1.0 && b > 0.0 => {
                    self.size_kelly(portfolio_value, price, p, b, regime_scale)
                }
                _ => {
                    warn!(symbol, "kelly inputs missing or invalid, using fixed sizing");
                    self.size_fixed(portfolio_value, price, regime_scale)
                }
            },
        }
    }

    fn size_fixed(&self, portfolio_value: f64, price: f64, regime_scale: f64) -> SizeResult {
        let pct = self.clamp(self.base_position_pct * regime_scale);
        self.result(
            portfolio_value,
            price,
            pct,
            SizingMethod::Fixed,
            format!(
                "fixed {:.1}% scaled by regime {:.2}",
                self.base_position_pct, regime_scale
            ),
        )
    }

    fn size_vol_adjusted(
        &self,
        portfolio_value: f64,
        price: f64,
        volatility: f64,
        regime_scale: f64,
    ) -> SizeResult {
        let vol_ratio = self.volatility_target / volatility;
        let pct = self.clamp(self.base_position_pct * vol_ratio * regime_scale);
        self.result(
            portfolio_value,
            price,
            pct,
            SizingMethod::VolatilityAdjusted,
            format!(
                "vol-adjusted: target={:.1}% asset={:.1}% ratio={:.2} regime={:.2}",
                self.volatility_target * 100.0,
                volatility * 100.0,
                vol_ratio,
                regime_scale
            ),
        )
    }

    fn size_kelly(
        &self,
        portfolio_value: f64,
        price: f64,
        win_rate: f64,
        win_loss_ratio: f64,
        regime_scale: f64,
    ) -> SizeResult {
        // f* = (b*p - q) / b
        let q = 1.0 - win_rate;
        let kelly = (win_loss_ratio * win_rate - q) / win_loss_ratio;
        let fractional = kelly * KELLY_FRACTION;
        let pct = self.clamp(fractional * 100.0 * regime_scale);
        self.result(
            portfolio_value,
            price,
            pct,
            SizingMethod::Kelly,
            format!(
                "kelly: p={:.2} b={:.2} f*={:.3} fractional={:.3} regime={:.2}",
                win_rate, win_loss_ratio, kelly, fractional, regime_scale
            ),
        )
    }

    fn clamp(&self, pct: f64) -> f64 {
        pct.clamp(MIN_POSITION_PCT, self.max_position_pct)
    }

    fn result(
        &self,
        portfolio_value: f64,
        price: f64,
        pct: f64,
        method: SizingMethod,
        rationale: String,
    ) -> SizeResult {
        let dollars = portfolio_value * (pct / 100.0);
        let shares = if price > 0.0 { dollars / price } else { 0.0 };
        SizeResult {
            pct,
            dollars,
            shares,
            price,
            method,
            rationale,
        }
    }
}
