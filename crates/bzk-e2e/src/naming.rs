//! Run-unique identifiers for harness resources.

use chrono::Utc;
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

static LAST_RUN_ID: AtomicI64 = AtomicI64::new(0);

/// Timestamp-derived suffix that makes resource names unique per environment.
///
/// Values are nanoseconds since the epoch, bumped when two environments are
/// created within the same clock tick, so they strictly increase within a
/// process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RunId(i64);

impl RunId {
    pub fn next() -> Self {
        let now = Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_else(|| Utc::now().timestamp_micros().saturating_mul(1_000));

        let mut last = LAST_RUN_ID.load(Ordering::Relaxed);
        loop {
            let candidate = now.max(last.saturating_add(1));
            match LAST_RUN_ID.compare_exchange_weak(
                last,
                candidate,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return RunId(candidate),
                Err(current) => last = current,
            }
        }
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hands out fixture repository indices.
///
/// Indices start at 0 and are never reused by the same allocator, even when
/// repositories are created concurrently.
#[derive(Debug, Default)]
pub struct RepoIndexAllocator {
    next: AtomicUsize,
}

impl RepoIndexAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&self) -> usize {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}
