//! Bounded exponential backoff with jitter, shared by the LLM and ontology
//! HTTP clients.

use std::thread;
use std::time::Duration;

use rand::Rng;

/// Retry `f` up to `max_retries` additional times (so `max_retries + 1`
/// attempts total) with exponential backoff and random jitter between
/// attempts. Returns the last error if every attempt fails.
pub fn with_backoff<T, E>(max_retries: u32, mut f: impl FnMut(u32) -> Result<T, E>) -> Result<T, E> {
    let mut attempt = 0;
    loop {
        match f(attempt) {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= max_retries {
                    return Err(err);
                }
                let base_ms = 100u64 * 2u64.pow(attempt);
                let jitter_ms = rand::thread_rng().gen_range(0..=base_ms / 2 + 1);
                thread::sleep(Duration::from_millis(base_ms + jitter_ms));
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn succeeds_without_retry() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, &str> = with_backoff(2, |_attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(42)
        });
        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, &str> = with_backoff(3, |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            if attempt < 2 { Err("transient") } else { Ok(7) }
        });
        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn gives_up_after_max_retries() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, &str> = with_backoff(2, |_attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("still failing")
        });
        assert_eq!(result, Err("still failing"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
