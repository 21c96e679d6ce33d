// =============================================================================
// Watchdog — the independent supervisor
// =============================================================================
//
// Runs as a SEPARATE OS process with SEPARATE broker credentials and no
// shared memory with the engine. It talks to the engine only through:
//
//   (a) the broker (its own connection),
//   (b) the live state cache heartbeat key,
//   (c) OS signals plus the engine's PID file.
//
// The watchdog never mutates engine state. It reads, decides, and acts via
// the broker and signals. When it kills, it liquidates first.
// =============================================================================

pub mod halt_marker;
pub mod rules;
pub mod supervisor;

pub use halt_marker::HaltMarker;
pub use rules::{KillAction, KillRules, KillViolation, Severity, WarningThresholds};
pub use supervisor::{ProcessController, UnixProcessController, Watchdog};
