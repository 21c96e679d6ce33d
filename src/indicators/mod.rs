// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Pure, side-effect-free implementations of the indicators the regime
// detector and strategies consume. Every public function returns `Option<T>`
// or an empty series so callers are forced to handle insufficient-data and
// numerical-edge-case scenarios.

pub mod adx;
pub mod atr;
pub mod ema;
pub mod rsi;
pub mod vol;
