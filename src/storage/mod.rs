// =============================================================================
// Storage substrate
// =============================================================================
//
// Three tiers with sharply different write/read profiles:
//
//   append_log    — durable, lock-free event capture (the primary write path)
//   column_store  — read-optimised analytics over bars/sentiment/trades/regimes
//   state_cache   — live mutable state (positions, orders, heartbeats) with TTL
//   etl           — batch drain of the append log into the column store
//
// The broker is always the source of truth for positions and orders; the
// cache is derivable state and the log is the audit trail.
// =============================================================================

pub mod append_log;
pub mod column_store;
pub mod etl;
pub mod state_cache;

pub use append_log::AppendLog;
pub use column_store::{BarReadMode, ColumnStore};
pub use etl::{EtlPipeline, EtlSummary};
pub use state_cache::{CachedOrder, CachedPosition, MemoryStateStore, RedisStateStore, StateStore};
