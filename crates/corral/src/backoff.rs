//! Retry-delay generation for reconnect loops
//!
//! A [`Backoff`] is consulted by a connection holder every time a connect
//! attempt fails. `next()` yields the delay before the next attempt, or
//! `None` for [`BackoffKind::Stop`], in which case the holder terminates
//! instead of retrying.

use std::time::Duration;

/// Strategy used to space out reconnect attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffKind {
    /// Double the delay on every attempt, clamped to the maximum
    Exp,
    /// Pick uniformly between the minimum and maximum on every attempt
    Rand,
    /// Randomized exponential: uniform within a doubling window
    RandExp,
    /// Do not retry; the holder terminates on the first failure
    Stop,
}

/// Reconnect delay generator
///
/// The first delay of every non-stop kind is exactly `min`; subsequent
/// delays follow the kind's growth rule, clamped to `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    kind: BackoffKind,
    min: Duration,
    max: Duration,
    /// Doubling base for `Exp`/`RandExp`; `None` until the first delay is taken
    base: Option<Duration>,
}

impl Backoff {
    /// Default minimum delay (1s)
    pub const DEFAULT_MIN: Duration = Duration::from_millis(1_000);
    /// Default maximum delay (30s)
    pub const DEFAULT_MAX: Duration = Duration::from_millis(30_000);

    /// Create a backoff generator
    pub fn new(kind: BackoffKind, min: Duration, max: Duration) -> Self {
        Self {
            kind,
            min,
            max: max.max(min),
            base: None,
        }
    }

    /// Next delay before a reconnect attempt; `None` means terminate
    pub fn next(&mut self) -> Option<Duration> {
        match self.kind {
            BackoffKind::Stop => None,
            BackoffKind::Exp => {
                let delay = match self.base {
                    None => self.min,
                    Some(base) => (base * 2).min(self.max),
                };
                self.base = Some(delay);
                Some(delay)
            }
            BackoffKind::Rand => {
                let delay = match self.base {
                    None => self.min,
                    Some(_) => uniform(self.min, self.max),
                };
                self.base = Some(delay);
                Some(delay)
            }
            BackoffKind::RandExp => {
                let (delay, next_base) = match self.base {
                    None => (self.min, self.min),
                    Some(base) => {
                        let upper = (base * 3).min(self.max);
                        (uniform(base, upper), (base * 2).min(self.max))
                    }
                };
                self.base = Some(next_base);
                Some(delay)
            }
        }
    }

    /// Forget accumulated growth after a successful connect
    pub fn reset(&mut self) {
        self.base = None;
    }
}

/// Uniform draw in `[lo, hi]`
fn uniform(lo: Duration, hi: Duration) -> Duration {
    if hi <= lo {
        return lo;
    }
    let span = (hi - lo).as_millis() as f64;
    lo + Duration::from_millis((rand::random::<f64>() * span) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_never_yields() {
        let mut b = Backoff::new(BackoffKind::Stop, Backoff::DEFAULT_MIN, Backoff::DEFAULT_MAX);
        assert_eq!(b.next(), None);
        assert_eq!(b.next(), None);
    }

    #[test]
    fn test_exp_doubles_and_clamps() {
        let mut b = Backoff::new(
            BackoffKind::Exp,
            Duration::from_millis(100),
            Duration::from_millis(350),
        );
        assert_eq!(b.next(), Some(Duration::from_millis(100)));
        assert_eq!(b.next(), Some(Duration::from_millis(200)));
        assert_eq!(b.next(), Some(Duration::from_millis(350)));
        assert_eq!(b.next(), Some(Duration::from_millis(350)));
    }

    #[test]
    fn test_first_delay_is_min() {
        for kind in [BackoffKind::Exp, BackoffKind::Rand, BackoffKind::RandExp] {
            let mut b = Backoff::new(kind, Duration::from_millis(250), Duration::from_secs(30));
            assert_eq!(b.next(), Some(Duration::from_millis(250)));
        }
    }

    #[test]
    fn test_rand_stays_in_bounds() {
        let min = Duration::from_millis(100);
        let max = Duration::from_millis(500);
        let mut b = Backoff::new(BackoffKind::Rand, min, max);
        b.next();
        for _ in 0..100 {
            let d = b.next().unwrap();
            assert!(d >= min && d <= max, "{d:?} out of [{min:?}, {max:?}]");
        }
    }

    #[test]
    fn test_rand_exp_window_grows_and_clamps() {
        let min = Duration::from_millis(100);
        let max = Duration::from_millis(1_000);
        let mut b = Backoff::new(BackoffKind::RandExp, min, max);
        assert_eq!(b.next(), Some(min));
        // Second draw is uniform in [100ms, 300ms]
        let d = b.next().unwrap();
        assert!(d >= min && d <= Duration::from_millis(300));
        // All draws respect the maximum
        for _ in 0..100 {
            assert!(b.next().unwrap() <= max);
        }
    }

    #[test]
    fn test_reset_restarts_from_min() {
        let mut b = Backoff::new(
            BackoffKind::Exp,
            Duration::from_millis(100),
            Duration::from_secs(30),
        );
        b.next();
        b.next();
        b.reset();
        assert_eq!(b.next(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn test_max_clamped_to_min() {
        let mut b = Backoff::new(
            BackoffKind::Rand,
            Duration::from_millis(500),
            Duration::from_millis(100),
        );
        assert_eq!(b.next(), Some(Duration::from_millis(500)));
        assert_eq!(b.next(), Some(Duration::from_millis(500)));
    }
}
