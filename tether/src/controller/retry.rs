use std::time::Duration;

use dashmap::DashMap;

use crate::binding::BindingKey;

/// Exponential per-object retry delays.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,

    pub max: Duration,
}

impl Backoff {
    /// Delay before retry number `failures + 1`.
    pub fn delay(&self, failures: u32) -> Duration {
        let factor = 2_u32.checked_pow(failures).unwrap_or(u32::MAX);
        self.base.checked_mul(factor).map_or(self.max, |delay| delay.min(self.max))
    }
}

/// Consecutive reconciliation failures per object, keyed by kind and key.
#[derive(Debug)]
pub struct Retries {
    backoff: Backoff,
    failures: DashMap<(&'static str, BindingKey), u32>,
}

impl Retries {
    pub fn new(backoff: Backoff) -> Self { Self { backoff, failures: DashMap::new() } }

    /// Records a failure and returns the delay before the next attempt.
    pub fn failed(&self, kind: &'static str, key: BindingKey) -> Duration {
        let mut failures = self.failures.entry((kind, key)).or_insert(0);
        let delay = self.backoff.delay(*failures);
        *failures = failures.saturating_add(1);
        delay
    }

    pub fn forget(&self, kind: &'static str, key: &BindingKey) {
        let _unused = self.failures.remove(&(kind, key.clone()));
    }
}
