//! Reason-code specific waits for "not ready yet" conditions.
//!
//! Some failures mean a dependency of the step is simply not available yet:
//! the owner's profile hasn't been scraped, a related record is being
//! refreshed, media is still downloading. Those wait much longer than a
//! transient retry, and give up after a per-reason attempt count. Attempt
//! counters are kept in the key-value store per step of a run and reason, so
//! parallel steps and later runs of the same subject each get a full budget.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

use crate::kv::{namespaced_key, KeyValueStore};

/// Wait parameters for one reason code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReasonWait {
    /// Fixed part of the wait.
    pub base_wait_seconds: u64,
    /// Upper bound of the random part added to the wait.
    #[serde(default)]
    pub jitter_seconds: u64,
    /// Waits allowed before the step fails permanently.
    pub max_attempts: u32,
}

impl ReasonWait {
    /// Creates a wait rule.
    #[must_use]
    pub const fn new(base_wait_seconds: u64, jitter_seconds: u64, max_attempts: u32) -> Self {
        Self {
            base_wait_seconds,
            jitter_seconds,
            max_attempts,
        }
    }

    fn delay(&self) -> Duration {
        let jitter = if self.jitter_seconds == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.jitter_seconds)
        };
        Duration::from_secs(self.base_wait_seconds + jitter)
    }

    /// Counter lifetime; long enough to span every wait.
    fn counter_ttl(&self) -> Duration {
        let span = (self.base_wait_seconds + self.jitter_seconds).max(1);
        Duration::from_secs(span.saturating_mul(u64::from(self.max_attempts) + 1) * 2)
    }
}

/// Whose wait budget is being spent: one step of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitScope<'a> {
    /// Subject the run analyses.
    pub subject_id: &'a str,
    /// Run the step belongs to.
    pub run_id: &'a str,
    /// Step key.
    pub step: &'a str,
}

impl<'a> WaitScope<'a> {
    /// Creates a scope.
    #[must_use]
    pub const fn new(subject_id: &'a str, run_id: &'a str, step: &'a str) -> Self {
        Self {
            subject_id,
            run_id,
            step,
        }
    }
}

/// Result of asking for another reason wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasonWaitOutcome {
    /// Re-enqueue after `delay`; this is wait number `attempt`.
    Wait {
        /// Delay before the next delivery.
        delay: Duration,
        /// 1-based wait count.
        attempt: u32,
    },
    /// The reason's attempt budget is spent.
    Exhausted {
        /// Waits already taken.
        attempts: u32,
    },
}

fn default_waits() -> BTreeMap<String, ReasonWait> {
    BTreeMap::from([
        ("profile_data_incomplete".to_string(), ReasonWait::new(300, 60, 6)),
        ("awaiting_dependent_refresh".to_string(), ReasonWait::new(120, 30, 10)),
        ("media_not_ready".to_string(), ReasonWait::new(60, 15, 5)),
    ])
}

fn default_fallback() -> ReasonWait {
    ReasonWait::new(60, 15, 3)
}

/// Maps reason codes to wait rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReasonWaitPolicy {
    /// Per-reason rules.
    #[serde(default = "default_waits")]
    pub waits: BTreeMap<String, ReasonWait>,
    /// Rule for reasons without an entry.
    #[serde(default = "default_fallback")]
    pub fallback: ReasonWait,
}

impl Default for ReasonWaitPolicy {
    fn default() -> Self {
        Self {
            waits: default_waits(),
            fallback: default_fallback(),
        }
    }
}

impl ReasonWaitPolicy {
    /// Overrides the rule for one reason.
    #[must_use]
    pub fn with_wait(mut self, reason: impl Into<String>, wait: ReasonWait) -> Self {
        self.waits.insert(reason.into(), wait);
        self
    }

    /// Returns the rule applying to `reason`.
    #[must_use]
    pub fn rule(&self, reason: &str) -> ReasonWait {
        self.waits.get(reason).copied().unwrap_or(self.fallback)
    }

    /// Counter key: `retry:{subject}:{run}:{step}:{reason}`.
    #[must_use]
    pub fn counter_key(scope: WaitScope<'_>, reason: &str) -> String {
        let owner = format!("{}:{}:{}", scope.subject_id, scope.run_id, scope.step);
        namespaced_key("retry", &owner, reason)
    }

    /// Takes one wait from the reason's budget.
    pub async fn next_wait(
        &self,
        kv: &dyn KeyValueStore,
        scope: WaitScope<'_>,
        reason: &str,
    ) -> ReasonWaitOutcome {
        let rule = self.rule(reason);
        let key = Self::counter_key(scope, reason);
        let count = kv.increment(&key, 1, Some(rule.counter_ttl())).await;
        let attempt = u32::try_from(count.max(0)).unwrap_or(u32::MAX);

        if attempt > rule.max_attempts {
            debug!(
                subject_id = %scope.subject_id,
                run_id = %scope.run_id,
                step = %scope.step,
                reason = %reason,
                attempts = rule.max_attempts,
                "Reason wait budget exhausted"
            );
            return ReasonWaitOutcome::Exhausted {
                attempts: rule.max_attempts,
            };
        }

        ReasonWaitOutcome::Wait {
            delay: rule.delay(),
            attempt,
        }
    }

    /// Forgets the wait counter, e.g. once the step gets past the condition.
    pub async fn reset(&self, kv: &dyn KeyValueStore, scope: WaitScope<'_>, reason: &str) {
        kv.delete(&Self::counter_key(scope, reason)).await;
    }

    /// The largest wait budget of any rule, fallback included.
    #[must_use]
    pub fn max_waits(&self) -> u32 {
        self.waits
            .values()
            .map(|wait| wait.max_attempts)
            .chain(std::iter::once(self.fallback.max_attempts))
            .max()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKeyValueStore;

    #[test]
    fn test_known_and_fallback_rules() {
        let policy = ReasonWaitPolicy::default();
        assert_eq!(policy.rule("media_not_ready").max_attempts, 5);
        assert_eq!(policy.rule("something_else"), default_fallback());
    }

    const FACE: WaitScope<'static> = WaitScope::new("post-1", "run-1", "face");

    #[test]
    fn test_max_waits_covers_fallback() {
        let policy = ReasonWaitPolicy::default();
        assert_eq!(policy.max_waits(), 10);
        let policy = policy.with_wait("media_not_ready", ReasonWait::new(1, 0, 40));
        assert_eq!(policy.max_waits(), 40);
    }

    #[tokio::test]
    async fn test_waits_until_budget_spent() {
        let kv = InMemoryKeyValueStore::new();
        let policy = ReasonWaitPolicy::default().with_wait("media_not_ready", ReasonWait::new(10, 5, 2));

        for expected in 1..=2 {
            match policy.next_wait(&kv, FACE, "media_not_ready").await {
                ReasonWaitOutcome::Wait { delay, attempt } => {
                    assert_eq!(attempt, expected);
                    assert!(delay >= Duration::from_secs(10));
                    assert!(delay <= Duration::from_secs(15));
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(
            policy.next_wait(&kv, FACE, "media_not_ready").await,
            ReasonWaitOutcome::Exhausted { attempts: 2 }
        );
    }

    #[tokio::test]
    async fn test_counters_are_per_step_and_run() {
        let kv = InMemoryKeyValueStore::new();
        let policy = ReasonWaitPolicy::default().with_wait("media_not_ready", ReasonWait::new(1, 0, 1));

        policy.next_wait(&kv, FACE, "media_not_ready").await;
        assert!(kv.get("retry:post-1:run-1:face:media_not_ready").await.is_some());

        for scope in [
            WaitScope::new("post-2", "run-1", "face"),
            WaitScope::new("post-1", "run-1", "ocr"),
            WaitScope::new("post-1", "run-2", "face"),
        ] {
            let other = policy.next_wait(&kv, scope, "media_not_ready").await;
            assert!(matches!(other, ReasonWaitOutcome::Wait { attempt: 1, .. }), "{scope:?}");
        }
        assert_eq!(
            policy.next_wait(&kv, FACE, "media_not_ready").await,
            ReasonWaitOutcome::Exhausted { attempts: 1 }
        );
    }

    #[tokio::test]
    async fn test_reset_restores_budget() {
        let kv = InMemoryKeyValueStore::new();
        let policy = ReasonWaitPolicy::default().with_wait("media_not_ready", ReasonWait::new(1, 0, 1));
        let ocr = WaitScope::new("post-1", "run-1", "ocr");

        policy.next_wait(&kv, FACE, "media_not_ready").await;
        policy.next_wait(&kv, ocr, "media_not_ready").await;
        policy.reset(&kv, FACE, "media_not_ready").await;

        let again = policy.next_wait(&kv, FACE, "media_not_ready").await;
        assert!(matches!(again, ReasonWaitOutcome::Wait { attempt: 1, .. }));
        assert_eq!(
            policy.next_wait(&kv, ocr, "media_not_ready").await,
            ReasonWaitOutcome::Exhausted { attempts: 1 }
        );
    }
}
