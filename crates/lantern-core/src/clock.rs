//! Logical clock — the pausable millisecond timeline shared between the
//! application and the controller network.
//!
//! The clock is a single reference point plus a paused flag. While running,
//! `millis()` is wall time minus the reference; while paused, the reference
//! itself IS the frozen value. Every mutation re-derives the reference so the
//! reading stays continuous across pause-state transitions.

use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::wire::SyncRecord;

/// Drift below this threshold is ignored when applying a remote sync record.
/// Correcting on every millisecond of jitter would make the timeline oscillate.
pub const DRIFT_TOLERANCE_MS: i64 = 10;

fn wall_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// A pausable monotonic millisecond counter.
#[derive(Debug, Clone)]
pub struct LogicalClock {
    /// While running: the wall-clock anchor (`millis = wall - reference`).
    /// While paused: the frozen millis value itself.
    reference: i64,
    paused: bool,
}

impl LogicalClock {
    /// A fresh running clock reading zero.
    pub fn new() -> Self {
        Self {
            reference: wall_ms(),
            paused: false,
        }
    }

    /// Current timeline position in milliseconds.
    pub fn millis(&self) -> i64 {
        if self.paused {
            self.reference
        } else {
            wall_ms() - self.reference
        }
    }

    /// Re-anchor the timeline to `millis`. Always takes effect, paused or not.
    pub fn set_millis(&mut self, millis: i64) {
        if self.paused {
            self.reference = millis;
        } else {
            self.reference = wall_ms() - millis;
        }
    }

    /// Freeze the timeline at its current position. No-op if already paused.
    pub fn pause(&mut self) {
        if !self.paused {
            self.reference = self.millis();
            self.paused = true;
        }
    }

    /// Resume the timeline from its frozen position. No-op if running.
    pub fn unpause(&mut self) {
        if self.paused {
            self.reference = wall_ms() - self.reference;
            self.paused = false;
        }
    }

    pub fn paused(&self) -> bool {
        self.paused
    }

    /// Reconcile against a remote sync record.
    ///
    /// The clock is corrected only when the drift exceeds
    /// [`DRIFT_TOLERANCE_MS`]; returns true if a correction was applied.
    pub fn apply_sync(&mut self, record: &SyncRecord) -> bool {
        let remote = { record.clock_timestamp } as i64;
        let drift = self.millis() - remote;
        if drift.abs() > DRIFT_TOLERANCE_MS {
            tracing::debug!(drift_ms = drift, remote_ms = remote, "clock corrected");
            self.set_millis(remote);
            true
        } else {
            false
        }
    }
}

impl Default for LogicalClock {
    fn default() -> Self {
        Self::new()
    }
}

/// The clock handle shared between the runtime and incoming sync records.
/// Writes are last-writer-wins.
#[derive(Debug, Clone, Default)]
pub struct SharedClock {
    inner: Arc<Mutex<LogicalClock>>,
}

impl SharedClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn millis(&self) -> i64 {
        self.lock().millis()
    }

    pub fn set_millis(&self, millis: i64) {
        self.lock().set_millis(millis);
    }

    pub fn pause(&self) {
        self.lock().pause();
    }

    pub fn unpause(&self) {
        self.lock().unpause();
    }

    pub fn paused(&self) -> bool {
        self.lock().paused()
    }

    pub fn apply_sync(&self, record: &SyncRecord) -> bool {
        self.lock().apply_sync(record)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LogicalClock> {
        // A panic while holding this lock is a bug; recover the guard anyway
        // so one poisoned reading cannot take down the drain loop.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
