use std::time::Duration;

use log::{debug, warn};

use crate::error::{MetaError, Result};

/// Bounded exponential backoff for transient store errors.
///
/// Permanent errors pass through on the first occurrence; transient ones are
/// retried up to `max_attempts` with doubling sleeps capped at `cap`.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            base: Duration::from_millis(50),
            cap: Duration::from_secs(5),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.base.saturating_mul(1u32 << attempt.min(16));
        exp.min(self.cap)
    }

    /// Run `op`, retrying transient failures.
    pub fn run<T>(&self, what: &str, mut op: impl FnMut() -> Result<T>) -> Result<T> {
        let mut attempt = 0;
        loop {
            match op() {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() && attempt + 1 < self.max_attempts => {
                    let wait = self.backoff(attempt);
                    debug!("{what}: transient failure (attempt {attempt}), retrying in {wait:?}: {e}");
                    std::thread::sleep(wait);
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_transient() {
                        warn!("{what}: giving up after {} attempts: {e}", attempt + 1);
                    }
                    return Err(e);
                }
            }
        }
    }
}

/// Floor below which bulk chunks stop shrinking on buffer-style errors.
pub const MIN_CHUNK: usize = 50;

/// Halve a failing bulk chunk size, bottoming out at [`MIN_CHUNK`].
pub fn shrink_chunk(current: usize) -> usize {
    (current / 2).max(MIN_CHUNK)
}

/// Decide the next chunk size after an error, or `None` for permanent
/// failures that shrinking cannot fix.
pub fn shrink_on(err: &MetaError, current: usize) -> Option<usize> {
    if err.is_transient() && current > MIN_CHUNK {
        Some(shrink_chunk(current))
    } else if err.is_transient() {
        // At the floor already: retry at the same size.
        Some(current)
    } else {
        None
    }
}
