//! Progress reporting and cooperative cancellation for pack and extract.
//!
//! Long-running operations push a [`ProgressState`] snapshot to a
//! [`ProgressSink`] after every block and after every finished file.  They
//! poll a [`CancelToken`] before each block; once it is raised nothing more
//! is written and no further snapshot is reported.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;

/// Running totals of one pack or extract operation.  Every field only grows
/// except the `current_*` pair, which restarts for each file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProgressState {
    pub files:                   u64,
    pub processed_files:         u64,
    pub bytes:                   u64,
    pub processed_bytes:         u64,
    pub current_bytes:           u64,
    pub current_processed_bytes: u64,
}

impl ProgressState {
    pub fn new(files: u64, bytes: u64) -> Self {
        Self { files, bytes, ..Self::default() }
    }

    pub(crate) fn begin_file(&mut self, size: u64) {
        self.current_bytes = size;
        self.current_processed_bytes = 0;
    }

    pub(crate) fn advance(&mut self, n: u64) {
        self.processed_bytes += n;
        self.current_processed_bytes += n;
    }

    pub(crate) fn finish_file(&mut self) {
        self.processed_files += 1;
    }

    /// Fraction of bytes done, in `0.0..=1.0`.
    pub fn ratio(&self) -> f64 {
        if self.bytes == 0 {
            return if self.processed_files >= self.files { 1.0 } else { 0.0 };
        }
        (self.processed_bytes as f64 / self.bytes as f64).min(1.0)
    }
}

/// Receiver of progress snapshots.  Makes no assumption about threads.
pub trait ProgressSink {
    fn report(&mut self, state: &ProgressState);
}

impl<F: FnMut(&ProgressState)> ProgressSink for F {
    fn report(&mut self, state: &ProgressState) {
        self(state)
    }
}

// ── CancelToken ─────────────────────────────────────────────────────────────

/// Shared cancellation flag.  Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

pub(crate) fn is_cancelled(token: Option<&CancelToken>) -> bool {
    token.is_some_and(CancelToken::is_cancelled)
}
