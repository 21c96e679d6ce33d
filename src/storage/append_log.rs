// =============================================================================
// Append-only log — durable event capture
// =============================================================================
//
// The primary write path for all events. Writers open the file in append mode
// and emit one complete JSONL line per event with a single write_all call, so
// concurrent writers never interleave partial records and no process-wide
// lock is taken on the hot path.
//
// Rotation is size-triggered and holds an internal mutex; writers keep
// appending to the active path and pick up the fresh file on their next
// write. Rotated files are gzip-compressed: events.jsonl.1.gz is the newest,
// higher suffixes are older, entries beyond the retention count are deleted.
// =============================================================================

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::events::Event;

/// Durable append-only event log.
pub struct AppendLog {
    path: PathBuf,
    max_size_bytes: u64,
    rotation_count: usize,
    // Rotation only; writes never take this.
    rotation_lock: Mutex<()>,
}

impl AppendLog {
    /// Open (or create) an append log at `path`.
    ///
    /// # Arguments
    /// * `max_file_size_mb` — size bound that triggers rotation.
    /// * `rotation_count`   — number of compressed rotations to retain.
    pub fn open(
        path: impl AsRef<Path>,
        max_file_size_mb: f64,
        rotation_count: usize,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create log dir {}", parent.display()))?;
        }

        info!(
            path = %path.display(),
            max_size_mb = max_file_size_mb,
            rotation_count,
            "append log opened"
        );

        Ok(Self {
            path,
            max_size_bytes: (max_file_size_mb * 1024.0 * 1024.0) as u64,
            rotation_count,
            rotation_lock: Mutex::new(()),
        })
    }

    /// Append a single event. This is the hot path.
    pub fn write(&self, event: &Event) -> Result<()> {
        if self.should_rotate() {
            self.rotate()?;
        }

        let mut line = event.to_json_line().context("event serialisation failed")?;
        line.push('\n');

        let mut file = self.open_append()?;
        file.write_all(line.as_bytes())
            .context("append log write failed")?;

        Ok(())
    }

    /// Append multiple events in a single write call.
    pub fn write_batch(&self, events: &[Event]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }

        if self.should_rotate() {
            self.rotate()?;
        }

        let mut buf = String::new();
        for event in events {
            buf.push_str(&event.to_json_line().context("event serialisation failed")?);
            buf.push('\n');
        }

        let mut file = self.open_append()?;
        file.write_all(buf.as_bytes())
            .context("append log batch write failed")?;

        debug!(count = events.len(), "batch written");
        Ok(())
    }

    /// Read every event in the active file, in file order.
    ///
    /// Corrupted lines are skipped with a warning; a partial write at the
    /// tail must never fail the whole scan. Debug and ETL use only.
    pub fn read_all(&self) -> Result<Vec<Event>> {
        Ok(self.read_from(0, usize::MAX)?.0)
    }

    /// Read up to `limit` events starting at byte `offset` in the active file.
    ///
    /// Returns the parsed events and the byte offset just past the last
    /// complete line consumed, which the ETL persists as its cursor. If the
    /// active file is smaller than `offset` the file has rotated since the
    /// last read and the caller should restart from zero.
    pub fn read_from(&self, offset: u64, limit: usize) -> Result<(Vec<Event>, u64)> {
        let mut events = Vec::new();

        if !self.path.exists() {
            return Ok((events, 0));
        }

        let mut file =
            File::open(&self.path).with_context(|| format!("open {}", self.path.display()))?;

        let len = file.metadata()?.len();
        let start = if offset > len { 0 } else { offset };
        file.seek(SeekFrom::Start(start))?;

        let mut reader = BufReader::new(file);
        let mut consumed = start;
        let mut line = String::new();

        loop {
            if events.len() >= limit {
                break;
            }
            line.clear();
            let n = reader.read_line(&mut line)?;
            if n == 0 {
                break;
            }
            // A line without a trailing newline is an in-flight write; leave
            // it for the next scan.
            if !line.ends_with('\n') {
                break;
            }
            consumed += n as u64;

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match Event::from_json_line(trimmed) {
                Ok(event) => events.push(event),
                Err(e) => {
                    warn!(error = %e, "skipping invalid log line");
                }
            }
        }

        Ok((events, consumed))
    }

    /// Force a rotation regardless of size (used at shutdown boundaries and
    /// in tests). No-op when the active file does not exist.
    pub fn rotate(&self) -> Result<()> {
        let _guard = self.rotation_lock.lock();

        // Double-check under the lock: another caller may have just rotated.
        if !self.path.exists() {
            return Ok(());
        }

        info!(path = %self.path.display(), "rotating log");

        // Shift existing rotations: .i.gz -> .(i+1).gz, oldest deleted.
        for i in (1..self.rotation_count).rev() {
            let old = self.rotated_path(i);
            if old.exists() {
                if i + 1 >= self.rotation_count {
                    std::fs::remove_file(&old)
                        .with_context(|| format!("delete {}", old.display()))?;
                } else {
                    let new = self.rotated_path(i + 1);
                    std::fs::rename(&old, &new)
                        .with_context(|| format!("rename {} -> {}", old.display(), new.display()))?;
                }
            }
        }

        // Compress the active file into .1.gz and clear it.
        let rotated = self.rotated_path(1);
        let mut input =
            File::open(&self.path).with_context(|| format!("open {}", self.path.display()))?;
        let output =
            File::create(&rotated).with_context(|| format!("create {}", rotated.display()))?;
        let mut encoder = GzEncoder::new(output, Compression::default());

        let mut buf = Vec::new();
        input.read_to_end(&mut buf)?;
        encoder.write_all(&buf)?;
        encoder.finish().context("gzip finish failed")?;

        std::fs::remove_file(&self.path)
            .with_context(|| format!("remove {}", self.path.display()))?;

        info!(rotated = %rotated.display(), "log rotated");
        Ok(())
    }

    /// Current size of the active file in bytes (0 when absent).
    pub fn size_bytes(&self) -> u64 {
        std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
    }

    /// Flush buffered writes. Append-mode writes go straight to the kernel,
    /// so this only exists for the shutdown protocol's benefit.
    pub fn flush(&self) -> Result<()> {
        Ok(())
    }

    /// Close the log (graceful shutdown).
    pub fn close(&self) -> Result<()> {
        self.flush()?;
        info!(path = %self.path.display(), "append log closed");
        Ok(())
    }

    fn open_append(&self) -> Result<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open append {}", self.path.display()))
    }

    fn should_rotate(&self) -> bool {
        self.size_bytes() >= self.max_size_bytes
    }

    fn rotated_path(&self, index: usize) -> PathBuf {
        PathBuf::from(format!("{}.{}.gz", self.path.display(), index))
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{heartbeat_event, EventKind};
    use std::sync::Arc;

    fn temp_log(max_mb: f64) -> (tempfile::TempDir, AppendLog) {
        let dir = tempfile::tempdir().unwrap();
        let log = AppendLog::open(dir.path().join("events.jsonl"), max_mb, 3).unwrap();
        (dir, log)
    }

    #[test]
    fn write_then_read_roundtrip() {
        let (_dir, log) = temp_log(100.0);

        log.write(&heartbeat_event("engine")).unwrap();
        log.write(&heartbeat_event("watchdog")).unwrap();

        let events = log.read_all().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, EventKind::Heartbeat);
        assert_eq!(events[0].source, "engine");
        assert_eq!(events[1].source, "watchdog");
    }

    #[test]
    fn batch_write() {
        let (_dir, log) = temp_log(100.0);

        let batch: Vec<_> = (0..10).map(|_| heartbeat_event("engine")).collect();
        log.write_batch(&batch).unwrap();

        assert_eq!(log.read_all().unwrap().len(), 10);
    }

    #[test]
    fn corrupt_lines_are_skipped() {
        let (dir, log) = temp_log(100.0);

        log.write(&heartbeat_event("engine")).unwrap();
        {
            let mut f = OpenOptions::new()
                .append(true)
                .open(dir.path().join("events.jsonl"))
                .unwrap();
            f.write_all(b"{ this is not json\n").unwrap();
        }
        log.write(&heartbeat_event("engine")).unwrap();

        let events = log.read_all().unwrap();
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn concurrent_writers_never_interleave() {
        let (_dir, log) = temp_log(100.0);
        let log = Arc::new(log);

        let mut handles = Vec::new();
        for w in 0..8 {
            let log = log.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..50 {
                    let ev = heartbeat_event(&format!("writer_{w}"));
                    log.write(&ev).unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        // Every successfully-returned write must be present, and every line
        // must parse, i.e. no line carries interleaved bytes of two events.
        let events = log.read_all().unwrap();
        assert_eq!(events.len(), 8 * 50);
        for w in 0..8 {
            let count = events
                .iter()
                .filter(|e| e.source == format!("writer_{w}"))
                .count();
            assert_eq!(count, 50);
        }
    }

    #[test]
    fn rotation_compresses_and_clears() {
        // Tiny size bound so the second write triggers rotation.
        let (dir, log) = temp_log(0.0001); // ~104 bytes

        log.write(&heartbeat_event("engine")).unwrap();
        assert!(log.size_bytes() > 0);

        // Next write rotates first, so the active file holds only the new event.
        log.write(&heartbeat_event("engine")).unwrap();

        assert!(dir.path().join("events.jsonl.1.gz").exists());
        assert_eq!(log.read_all().unwrap().len(), 1);
    }

    #[test]
    fn rotation_shifts_and_deletes_beyond_retention() {
        let (dir, log) = temp_log(100.0);

        for _ in 0..5 {
            log.write(&heartbeat_event("engine")).unwrap();
            log.rotate().unwrap();
        }

        // rotation_count = 3 keeps .1.gz and .2.gz only.
        assert!(dir.path().join("events.jsonl.1.gz").exists());
        assert!(dir.path().join("events.jsonl.2.gz").exists());
        assert!(!dir.path().join("events.jsonl.3.gz").exists());
    }

    #[test]
    fn read_from_tracks_offset() {
        let (_dir, log) = temp_log(100.0);

        log.write(&heartbeat_event("a")).unwrap();
        let (first, cursor) = log.read_from(0, usize::MAX).unwrap();
        assert_eq!(first.len(), 1);

        log.write(&heartbeat_event("b")).unwrap();
        let (second, cursor2) = log.read_from(cursor, usize::MAX).unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].source, "b");
        assert!(cursor2 > cursor);

        // No new data: empty batch, cursor stable.
        let (third, cursor3) = log.read_from(cursor2, usize::MAX).unwrap();
        assert!(third.is_empty());
        assert_eq!(cursor3, cursor2);
    }

    #[test]
    fn read_from_detects_rotation() {
        let (_dir, log) = temp_log(100.0);

        log.write(&heartbeat_event("a")).unwrap();
        log.write(&heartbeat_event("a")).unwrap();
        let (_, cursor) = log.read_from(0, usize::MAX).unwrap();

        log.rotate().unwrap();
        log.write(&heartbeat_event("b")).unwrap();

        // Offset beyond the new (smaller) file restarts from zero.
        let (events, _) = log.read_from(cursor, usize::MAX).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].source, "b");
    }
}
