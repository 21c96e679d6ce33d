// =============================================================================
// Execution — order lifecycle and broker reconciliation
// =============================================================================
//
//   order_manager — the client-id-keyed order state machine
//   reconciler    — idempotent repair of local state against broker truth
//
// The two never hold references into each other: the reconciler mutates
// orders only through the manager's public transitions.
// =============================================================================

pub mod order_manager;
pub mod reconciler;

pub use order_manager::{Order, OrderManager, OrderStatus, TransitionError};
pub use reconciler::{map_broker_status, ReconcileOutcome, ReconcileSummary, Reconciler};
