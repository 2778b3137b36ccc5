//! Polling helpers: wait for a condition, retry a fallible call.

use std::thread;
use std::time::{Duration, Instant};

use crate::errors::{Result, WinspectError};

/// Poll `f` until it returns `Some`, at most `timeout` long, sleeping
/// `delay` between attempts.  Returns `None` on timeout.
pub fn wait_until<T>(
    mut f: impl FnMut() -> Option<T>,
    timeout: Duration,
    delay: Duration,
) -> Result<Option<T>> {
    if timeout.is_zero() {
        return Err(WinspectError::InvalidArgument(
            "timeout must be greater than zero".into(),
        ));
    }
    let start = Instant::now();
    loop {
        if let Some(v) = f() {
            return Ok(Some(v));
        }
        if start.elapsed() >= timeout {
            return Ok(None);
        }
        if !delay.is_zero() {
            thread::sleep(delay);
        }
    }
}

/// Run `f`, retrying up to `max_retries` extra times on error with `delay`
/// between attempts.  The last error is returned when every attempt fails.
pub fn retry<T>(
    mut f: impl FnMut() -> Result<T>,
    max_retries: u32,
    delay: Duration,
) -> Result<T> {
    if max_retries == 0 {
        return Err(WinspectError::InvalidArgument(
            "max_retries must be greater than zero".into(),
        ));
    }
    let mut last = None;
    for attempt in 0..=max_retries {
        match f() {
            Ok(v) => return Ok(v),
            Err(e) => {
                if attempt < max_retries {
                    log::warn!("attempt {} failed, retrying: {e}", attempt + 1);
                    if !delay.is_zero() {
                        thread::sleep(delay);
                    }
                }
                last = Some(e);
            }
        }
    }
    Err(last.expect("at least one attempt ran"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
