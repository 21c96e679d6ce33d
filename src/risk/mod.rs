// =============================================================================
// Risk management — position sizing and drawdown control
// =============================================================================
//
// Two layers with different jobs: the sizer decides how BIG a trade may be,
// the drawdown monitor decides whether trading happens AT ALL. Both feed the
// scale the trading loop applies before minting an order.
// =============================================================================

pub mod drawdown;
pub mod sizer;

pub use drawdown::{DrawdownMetrics, DrawdownMonitor};
pub use sizer::{PositionSizer, SizeResult, SizingMethod};
