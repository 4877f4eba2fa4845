//! Rate limiting for repetitive warnings.
//!
//! A file that cannot be opened is retried every tick, and a full open-file
//! budget is hit every tick; both would flood the log without a limit.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Lets one warning through per interval and counts the ones it swallows.
#[derive(Debug)]
pub struct WarnThrottle {
    interval: Duration,
    last: Mutex<Option<Instant>>,
    suppressed: AtomicU64,
}

impl WarnThrottle {
    #[must_use]
    pub const fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(None),
            suppressed: AtomicU64::new(0),
        }
    }

    /// `Some(suppressed_since_last)` when a warning may be emitted now.
    pub fn allow(&self) -> Option<u64> {
        let now = Instant::now();
        let mut last = self.last.lock();
        match *last {
            Some(at) if now.duration_since(at) < self.interval => {
                self.suppressed.fetch_add(1, Ordering::Relaxed);
                None
            }
            _ => {
                *last = Some(now);
                Some(self.suppressed.swap(0, Ordering::Relaxed))
            }
        }
    }
}

/// Per-path variant of [`WarnThrottle`].
#[derive(Debug)]
pub struct PathThrottle {
    interval: Duration,
    last: HashMap<PathBuf, Instant>,
}

impl PathThrottle {
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: HashMap::new(),
        }
    }

    /// True when a warning about `path` may be emitted now.
    pub fn allow(&mut self, path: &Path) -> bool {
        let now = Instant::now();
        match self.last.get(path) {
            Some(at) if now.duration_since(*at) <= self.interval => false,
            _ => {
                self.last.insert(path.to_path_buf(), now);
                true
            }
        }
    }

    /// Drop state for a path that is no longer tracked.
    pub fn forget(&mut self, path: &Path) {
        self.last.remove(path);
    }
}
