//! Retry scheduling for failed pushes.
//!
//! The policy is a fixed delay table: the k-th consecutive failure of a
//! record waits `delays[k - 1]` before the next attempt, until `max_retries`
//! failures have been recorded. After that the record stays `SyncFailed`
//! until a batch pass or a manual trigger resets its counter.

use crate::RecordId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Delay table and retry cap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    pub delays: Vec<Duration>,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            delays: vec![
                Duration::from_secs(1),
                Duration::from_secs(3),
                Duration::from_secs(10),
            ],
            max_retries: 3,
        }
    }
}

impl RetryPolicy {
    pub fn new(delays: Vec<Duration>, max_retries: u32) -> Self {
        Self {
            delays,
            max_retries,
        }
    }

    /// Delay before the retry that follows failure number `failures`
    /// (1-based). Past the end of the table the last delay repeats.
    pub fn delay_for(&self, failures: u32) -> Option<Duration> {
        if failures == 0 || failures > self.max_retries {
            return None;
        }
        let index = usize::try_from(failures - 1).unwrap_or(usize::MAX);
        self.delays
            .get(index)
            .or_else(|| self.delays.last())
            .copied()
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Schedule another attempt after the delay
    RetryAfter(Duration),
    /// Give up; the record stays failed
    Exhausted { attempts: u32 },
}

/// Per-record consecutive failure counters.
#[derive(Debug, Clone, Default)]
pub struct RetryTracker {
    policy: RetryPolicy,
    failures: HashMap<RecordId, u32>,
}

impl RetryTracker {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            failures: HashMap::new(),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Count a transient failure and decide on the next step.
    pub fn record_failure(&mut self, id: &str) -> RetryDecision {
        let failures = self.failures.entry(id.to_string()).or_insert(0);
        *failures += 1;

        match self.policy.delay_for(*failures) {
            Some(delay) => RetryDecision::RetryAfter(delay),
            None => RetryDecision::Exhausted {
                attempts: *failures,
            },
        }
    }

    /// Consecutive failures recorded for `id`.
    pub fn failures(&self, id: &str) -> u32 {
        self.failures.get(id).copied().unwrap_or(0)
    }

    /// Forget the failures of one record (after a success, or before a
    /// fresh batch pass).
    pub fn reset(&mut self, id: &str) {
        self.failures.remove(id);
    }

    pub fn clear(&mut self) {
        self.failures.clear();
    }
}
