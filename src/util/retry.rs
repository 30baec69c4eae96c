use rand::{rngs::StdRng, Rng, SeedableRng};
use std::thread::sleep;
use std::time::Duration;

/// Retry a blocking operation with exponential backoff and jitter.
///
/// Used by the `--join` path while it waits for a recorder/player to
/// create the rendezvous socket.
pub fn retry<F, T, E>(mut op: F, max_retries: usize, base_delay_ms: u64) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
{
    let mut rng = StdRng::from_entropy();
    let mut attempt = 0usize;
    loop {
        match op() {
            Ok(v) => return Ok(v),
            Err(e) => {
                if attempt >= max_retries {
                    return Err(e);
                }
                let expo = base_delay_ms.saturating_mul(1u64 << attempt.min(10));
                let jitter: u64 = rng.gen_range(0..(expo / 2 + 1));
                sleep(Duration::from_millis(expo + jitter));
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn succeeds_immediately_without_sleeping() {
        let result: Result<i32, &str> = retry(|| Ok(42), 3, 1);
        assert_eq!(result.unwrap(), 42);
    }

    #[test]
    fn retries_until_success() {
        let attempts = Cell::new(0);
        let result: Result<i32, &str> = retry(
            || {
                let n = attempts.get() + 1;
                attempts.set(n);
                if n < 3 { Err("not yet") } else { Ok(n) }
            },
            5,
            1,
        );
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn gives_up_after_max_retries() {
        let result: Result<i32, &str> = retry(|| Err("nope"), 2, 1);
        assert_eq!(result.unwrap_err(), "nope");
    }
}
