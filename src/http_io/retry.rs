//! Exponential backoff with jitter for transient HTTP failures (§4.4).

use crate::error::{ErrorKind, Result, StoreError};
use crate::logger::Logger;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

/// Computes the backoff delay before retry attempt `attempt` (1-based: the delay before
/// the *second* request), capped by `max_pause`, with full jitter (uniformly distributed
/// between zero and the capped exponential value) to avoid synchronized retries.
pub fn backoff_delay(attempt: u32, max_pause: Duration) -> Duration {
    let base_ms = 100u64.saturating_mul(1u64 << attempt.min(20));
    let capped_ms = base_ms.min(max_pause.as_millis() as u64);
    let jittered_ms = rand::thread_rng().gen_range(0..=capped_ms.max(1));
    Duration::from_millis(jittered_ms)
}

/// Retries `op` while it returns a [`ErrorKind::Transient`] error, sleeping with
/// exponential backoff between attempts, up to `max_attempts` total tries. After the
/// bound is hit, the last error is downgraded to [`ErrorKind::Io`] per §7: "non-retriable
/// transport failure after exhaustion."
pub fn with_retries<T>(
    max_attempts: u32,
    max_pause: Duration,
    logger: &Arc<dyn Logger>,
    mut op: impl FnMut(u32) -> Result<T>,
) -> Result<T> {
    let mut attempt = 0u32;
    loop {
        match op(attempt) {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt + 1 < max_attempts => {
                let delay = backoff_delay(attempt, max_pause);
                logger.warn(&format!(
                    "transient error on attempt {}: {} (retrying in {:?})",
                    attempt + 1,
                    err.message(),
                    delay
                ));
                std::thread::sleep(delay);
                attempt += 1;
            }
            Err(err) if err.is_transient() => {
                return Err(StoreError::io(format!(
                    "exhausted {max_attempts} attempts; last error: {}",
                    err.message()
                )));
            }
            Err(err) => return Err(err),
        }
    }
}

/// Whether `status` is worth retrying: request timeout, rate limiting, or any 5xx.
pub fn is_retriable_status(status: u16) -> bool {
    matches!(status, 408 | 429) || (500..600).contains(&status)
}

pub fn classify_status(status: u16, body_hint: &str) -> Option<ErrorKind> {
    match status {
        200 => None,
        304 => Some(ErrorKind::NotModified),
        404 => Some(ErrorKind::NotFound),
        401 | 403 => Some(ErrorKind::Auth),
        s if is_retriable_status(s) => Some(ErrorKind::Transient),
        _ => {
            let _ = body_hint;
            Some(ErrorKind::Io)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::GlobalLogger;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn retries_until_success() {
        let logger = GlobalLogger::shared();
        let attempts = AtomicU32::new(0);
        let result: Result<()> = with_retries(5, Duration::from_millis(50), &logger, |_attempt| {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(StoreError::transient("simulated 503"))
            } else {
                Ok(())
            }
        });
        assert!(result.is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn exhaustion_becomes_io_error() {
        let logger = GlobalLogger::shared();
        let result: Result<()> = with_retries(2, Duration::from_millis(10), &logger, |_| {
            Err(StoreError::transient("always fails"))
        });
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Io);
    }

    #[test]
    fn non_transient_errors_are_not_retried() {
        let logger = GlobalLogger::shared();
        let attempts = AtomicU32::new(0);
        let result: Result<()> = with_retries(5, Duration::from_millis(10), &logger, |_| {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::integrity("bad digest"))
        });
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Integrity);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
