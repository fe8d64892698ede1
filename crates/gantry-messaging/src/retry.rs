use std::fmt::Display;
use std::time::Duration;
use tracing::warn;

/// Exponential backoff with a ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(5),
        }
    }
}

impl Backoff {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.initial.saturating_mul(1 << shift).min(self.max)
    }
}

/// Run `op` up to `attempts` times, sleeping between failures.
pub fn retry<T, E: Display>(
    what: &str,
    attempts: u32,
    backoff: Backoff,
    mut op: impl FnMut() -> Result<T, E>,
) -> Result<T, E> {
    let mut attempt = 1;
    loop {
        match op() {
            Ok(v) => return Ok(v),
            Err(e) if attempt < attempts => {
                let delay = backoff.delay(attempt);
                warn!("{what} failed (attempt {attempt}/{attempts}): {e}, retrying in {delay:?}");
                std::thread::sleep(delay);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast() -> Backoff {
        Backoff {
            initial: Duration::from_millis(1),
            max: Duration::from_millis(4),
        }
    }

    #[test]
    fn delay_doubles_up_to_max() {
        let b = fast();
        assert_eq!(b.delay(1), Duration::from_millis(1));
        assert_eq!(b.delay(2), Duration::from_millis(2));
        assert_eq!(b.delay(3), Duration::from_millis(4));
        assert_eq!(b.delay(30), Duration::from_millis(4));
    }

    #[test]
    fn retry_succeeds_after_failures() {
        let mut calls = 0;
        let result: Result<u32, String> = retry("op", 5, fast(), || {
            calls += 1;
            if calls < 3 {
                Err("not yet".to_owned())
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result, Ok(3));
    }

    #[test]
    fn retry_gives_up() {
        let mut calls = 0;
        let result: Result<(), String> = retry("op", 2, fast(), || {
            calls += 1;
            Err("never".to_owned())
        });
        assert!(result.is_err());
        assert_eq!(calls, 2);
    }
}
