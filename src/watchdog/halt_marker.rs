// =============================================================================
// Sticky permanent-shutdown marker
// =============================================================================
//
// Persisted to a small file owned by the watchdog so that a crashed watchdog
// restarts in the "halted" state rather than quietly re-enabling trading.
// The engine checks the same path at startup and refuses to run (exit code 2)
// while the marker exists. Only a human deletes it.
// =============================================================================

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{info, warn};

pub struct HaltMarker {
    path: PathBuf,
}

impl HaltMarker {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Whether the permanent-shutdown flag is set.
    pub fn engaged(&self) -> bool {
        self.path.exists()
    }

    /// Set the flag. Idempotent; the first reason wins.
    pub fn engage(&self, reason: &str) -> Result<()> {
        if self.engaged() {
            warn!(path = %self.path.display(), "halt marker already engaged");
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let content = format!("{}\n{}\n", Utc::now().to_rfc3339(), reason);
        std::fs::write(&self.path, content)
            .with_context(|| format!("failed to write halt marker {}", self.path.display()))?;

        info!(path = %self.path.display(), reason, "permanent halt marker engaged");
        Ok(())
    }

    /// The recorded reason, if any.
    pub fn reason(&self) -> Option<String> {
        std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|content| content.lines().nth(1).map(String::from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engage_is_sticky_and_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let marker = HaltMarker::new(dir.path().join("HALTED"));

        assert!(!marker.engaged());
        marker.engage("equity floor breached").unwrap();
        assert!(marker.engaged());
        assert_eq!(marker.reason().as_deref(), Some("equity floor breached"));

        // A second engage does not clobber the original reason.
        marker.engage("something else").unwrap();
        assert_eq!(marker.reason().as_deref(), Some("equity floor breached"));

        // A fresh instance (crashed watchdog restarting) still sees it.
        let restarted = HaltMarker::new(dir.path().join("HALTED"));
        assert!(restarted.engaged());
    }
}
