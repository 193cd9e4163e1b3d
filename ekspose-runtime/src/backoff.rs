//! Per-key exponential retry policy
use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use std::time::Duration;

/// Exponential backoff applied to a key that keeps failing to reconcile
///
/// The n-th consecutive failure of a key is retried after
/// `min(base_delay * factor^(n-1), max_delay)`. Once `max_retries` retries have been
/// handed out the key is dropped.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Multiplier applied to the delay after every consecutive failure, must be above 1
    pub factor: f32,
    /// Upper bound for a single delay
    pub max_delay: Duration,
    /// Number of retries before a key is dropped
    pub max_retries: usize,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(5),
            factor: 2.0,
            max_delay: Duration::from_secs(1000),
            max_retries: 15,
        }
    }
}

impl BackoffPolicy {
    fn builder(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.base_delay)
            .with_factor(self.factor)
            .with_max_delay(self.max_delay)
            .with_max_times(self.max_retries)
    }
}

/// Retry state of a single key
///
/// Rebuilds the backing [`ExponentialBackoff`] from its policy when reset, so a key that
/// recovered starts again from `base_delay`.
#[derive(Debug)]
pub struct KeyBackoff {
    policy: BackoffPolicy,
    current: Option<ExponentialBackoff>,
    retries: usize,
}

impl KeyBackoff {
    /// A fresh backoff that has not handed out any delay yet
    #[must_use]
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            current: None,
            retries: 0,
        }
    }

    /// How many delays have been handed out since the last reset
    #[must_use]
    pub fn retries(&self) -> usize {
        self.retries
    }

    /// Forget all previous failures
    pub fn reset(&mut self) {
        self.current = None;
        self.retries = 0;
    }
}

impl Iterator for KeyBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        let policy = self.policy;
        let delay = self
            .current
            .get_or_insert_with(|| policy.builder().build())
            .next()?;
        self.retries += 1;
        Some(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::{BackoffPolicy, KeyBackoff};
    use std::time::Duration;

    fn policy(max_retries: usize) -> BackoffPolicy {
        BackoffPolicy {
            base_delay: Duration::from_millis(10),
            factor: 2.0,
            max_delay: Duration::from_secs(60),
            max_retries,
        }
    }

    #[test]
    fn delays_should_grow_until_retries_run_out() {
        let delays = KeyBackoff::new(policy(4)).collect::<Vec<_>>();
        assert_eq!(delays.len(), 4);
        assert_eq!(delays[0], Duration::from_millis(10));
        assert!(delays.windows(2).all(|w| w[0] < w[1]), "{delays:?}");
    }

    #[test]
    fn delays_should_be_capped() {
        let mut backoff = KeyBackoff::new(BackoffPolicy {
            max_delay: Duration::from_millis(25),
            ..policy(10)
        });
        assert!(backoff.all(|delay| delay <= Duration::from_millis(25)));
    }

    #[test]
    fn reset_should_start_over() {
        let mut backoff = KeyBackoff::new(policy(2));
        let first = backoff.next();
        assert!(backoff.next().is_some());
        assert_eq!(backoff.next(), None);
        assert_eq!(backoff.retries(), 2);

        backoff.reset();
        assert_eq!(backoff.retries(), 0);
        assert_eq!(backoff.next(), first);
    }
}
