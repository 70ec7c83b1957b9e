//! Threshold-based resource guard.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::probe::LoadProbe;
use super::{ResourceGuard, ResourceGuardDecision};
use crate::errors::{EngageflowError, GuardError};
use crate::kv::{namespaced_key, KeyValueStore};

fn default_hard_cpu_load() -> f64 {
    0.95
}

fn default_hard_memory_ratio() -> f64 {
    0.95
}

fn default_soft_cpu_load() -> f64 {
    0.80
}

fn default_soft_memory_ratio() -> f64 {
    0.85
}

fn default_concurrency_caps() -> BTreeMap<String, i64> {
    BTreeMap::from([
        ("face_recognition".to_string(), 2),
        ("ocr".to_string(), 2),
        ("llm_inference".to_string(), 1),
    ])
}

fn default_slot_window_seconds() -> u64 {
    600
}

fn default_retry_in_seconds() -> u64 {
    20
}

/// Limits applied by [`ThresholdResourceGuard`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardConfig {
    /// Normalized CPU load above which nothing runs.
    #[serde(default = "default_hard_cpu_load")]
    pub hard_cpu_load: f64,
    /// Memory ratio above which nothing runs.
    #[serde(default = "default_hard_memory_ratio")]
    pub hard_memory_ratio: f64,
    /// Normalized CPU load above which non-critical work waits.
    #[serde(default = "default_soft_cpu_load")]
    pub soft_cpu_load: f64,
    /// Memory ratio above which non-critical work waits.
    #[serde(default = "default_soft_memory_ratio")]
    pub soft_memory_ratio: f64,
    /// Max concurrently admitted tasks per resource task name.
    #[serde(default = "default_concurrency_caps")]
    pub concurrency_caps: BTreeMap<String, i64>,
    /// Lifetime of a slot counter; bounds leaks from crashed workers.
    #[serde(default = "default_slot_window_seconds")]
    pub slot_window_seconds: u64,
    /// Backoff hint attached to denials.
    #[serde(default = "default_retry_in_seconds")]
    pub retry_in_seconds: u64,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            hard_cpu_load: default_hard_cpu_load(),
            hard_memory_ratio: default_hard_memory_ratio(),
            soft_cpu_load: default_soft_cpu_load(),
            soft_memory_ratio: default_soft_memory_ratio(),
            concurrency_caps: default_concurrency_caps(),
            slot_window_seconds: default_slot_window_seconds(),
            retry_in_seconds: default_retry_in_seconds(),
        }
    }
}

impl GuardConfig {
    /// Sets a concurrency cap for a resource task name.
    #[must_use]
    pub fn with_cap(mut self, task_name: impl Into<String>, cap: i64) -> Self {
        self.concurrency_caps.insert(task_name.into(), cap);
        self
    }

    /// Sets the denial backoff hint.
    #[must_use]
    pub fn with_retry_in_seconds(mut self, seconds: u64) -> Self {
        self.retry_in_seconds = seconds;
        self
    }

    /// Checks that soft limits sit below hard limits.
    pub fn validate(&self) -> Result<(), EngageflowError> {
        if self.soft_cpu_load > self.hard_cpu_load {
            return Err(EngageflowError::Config(
                "guard.soft_cpu_load must not exceed guard.hard_cpu_load".into(),
            ));
        }
        if self.soft_memory_ratio > self.hard_memory_ratio {
            return Err(EngageflowError::Config(
                "guard.soft_memory_ratio must not exceed guard.hard_memory_ratio".into(),
            ));
        }
        if let Some((name, _)) = self.concurrency_caps.iter().find(|(_, cap)| **cap < 1) {
            return Err(EngageflowError::Config(format!(
                "guard.concurrency_caps.{name} must be >= 1"
            )));
        }
        Ok(())
    }
}

/// Guard combining host load thresholds with per-task concurrency slots.
///
/// Hard limits deny every task. Soft limits and concurrency caps deny only
/// non-critical tasks. Slots are counted in the key-value store so every
/// worker sharing the store sees the same counts.
pub struct ThresholdResourceGuard {
    probe: Arc<dyn LoadProbe>,
    kv: Arc<dyn KeyValueStore>,
    config: GuardConfig,
}

impl std::fmt::Debug for ThresholdResourceGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThresholdResourceGuard")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ThresholdResourceGuard {
    /// Creates a guard.
    #[must_use]
    pub fn new(probe: Arc<dyn LoadProbe>, kv: Arc<dyn KeyValueStore>, config: GuardConfig) -> Self {
        Self { probe, kv, config }
    }

    fn slot_key(task_name: &str) -> String {
        namespaced_key("guard", "slots", task_name)
    }

    fn window(&self) -> Duration {
        Duration::from_secs(self.config.slot_window_seconds)
    }
}

#[async_trait]
impl ResourceGuard for ThresholdResourceGuard {
    async fn allow_task(
        &self,
        task_name: &str,
        queue_name: &str,
        critical: bool,
    ) -> Result<ResourceGuardDecision, GuardError> {
        let mut snapshot = self.probe.snapshot().await?;
        let retry_in = self.config.retry_in_seconds;

        if snapshot.cpu_load >= self.config.hard_cpu_load
            || snapshot.memory_used_ratio >= self.config.hard_memory_ratio
        {
            return Ok(ResourceGuardDecision::deny("hard_limit", retry_in).with_snapshot(snapshot));
        }

        if !critical
            && (snapshot.cpu_load >= self.config.soft_cpu_load
                || snapshot.memory_used_ratio >= self.config.soft_memory_ratio)
        {
            return Ok(ResourceGuardDecision::deny("soft_limit", retry_in).with_snapshot(snapshot));
        }

        if let Some(&cap) = self.config.concurrency_caps.get(task_name) {
            let key = Self::slot_key(task_name);
            let taken = self.kv.increment(&key, 1, Some(self.window())).await;
            snapshot.in_flight = Some(taken);
            if taken > cap && !critical {
                self.kv.increment(&key, -1, None).await;
                debug!(
                    task_name = %task_name,
                    queue_name = %queue_name,
                    in_flight = taken - 1,
                    cap,
                    "Concurrency cap reached"
                );
                return Ok(
                    ResourceGuardDecision::deny("concurrency_limit", retry_in).with_snapshot(snapshot)
                );
            }
        }

        Ok(ResourceGuardDecision::allow("ok").with_snapshot(snapshot))
    }

    async fn release(&self, task_name: &str) {
        if !self.config.concurrency_caps.contains_key(task_name) {
            return;
        }
        let key = Self::slot_key(task_name);
        if self.kv.increment(&key, -1, None).await <= 0 {
            self.kv.delete(&key).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::{LoadSnapshot, MockLoadProbe, StaticLoadProbe};
    use crate::kv::InMemoryKeyValueStore;

    fn guard_with(snapshot: LoadSnapshot, config: GuardConfig) -> ThresholdResourceGuard {
        ThresholdResourceGuard::new(
            Arc::new(StaticLoadProbe::new(snapshot)),
            Arc::new(InMemoryKeyValueStore::new()),
            config,
        )
    }

    #[tokio::test]
    async fn test_idle_host_allows() {
        let guard = guard_with(LoadSnapshot::default(), GuardConfig::default());
        let decision = guard.allow_task("ocr", "ai_ocr", false).await.unwrap();
        assert!(decision.allow);
        assert_eq!(decision.snapshot.unwrap().in_flight, Some(1));
    }

    #[tokio::test]
    async fn test_soft_limit_bypassed_by_critical() {
        let guard = guard_with(LoadSnapshot::new(0.85, 0.2), GuardConfig::default());

        let normal = guard.allow_task("ocr", "ai_ocr", false).await.unwrap();
        assert!(!normal.allow);
        assert_eq!(normal.reason, "soft_limit");
        assert_eq!(normal.retry_in_seconds, Some(20));

        let critical = guard.allow_task("ocr", "ai_ocr", true).await.unwrap();
        assert!(critical.allow);
    }

    #[tokio::test]
    async fn test_hard_limit_applies_to_critical() {
        let guard = guard_with(LoadSnapshot::new(0.1, 0.97), GuardConfig::default());
        let decision = guard.allow_task("ocr", "ai_ocr", true).await.unwrap();
        assert!(!decision.allow);
        assert_eq!(decision.reason, "hard_limit");
    }

    #[tokio::test]
    async fn test_concurrency_cap_and_release() {
        let guard = guard_with(LoadSnapshot::default(), GuardConfig::default());

        let first = guard.allow_task("llm_inference", "ai_llm", false).await.unwrap();
        let second = guard.allow_task("llm_inference", "ai_llm", false).await.unwrap();
        assert!(first.allow);
        assert!(!second.allow);
        assert_eq!(second.reason, "concurrency_limit");

        guard.release("llm_inference").await;
        let third = guard.allow_task("llm_inference", "ai_llm", false).await.unwrap();
        assert!(third.allow);
    }

    #[tokio::test]
    async fn test_uncapped_task_has_no_slots() {
        let guard = guard_with(LoadSnapshot::default(), GuardConfig::default());
        for _ in 0..5 {
            let decision = guard.allow_task("metadata", "ai_light", false).await.unwrap();
            assert!(decision.allow);
            assert_eq!(decision.snapshot.unwrap().in_flight, None);
        }
    }

    #[tokio::test]
    async fn test_load_snapshot_errors_surface_to_caller() {
        let mut probe = MockLoadProbe::new();
        probe
            .expect_snapshot()
            .times(1)
            .returning(|| Err(GuardError("no procfs".into())));

        let guard = ThresholdResourceGuard::new(
            Arc::new(probe),
            Arc::new(InMemoryKeyValueStore::new()),
            GuardConfig::default(),
        );
        let decision = crate::guard::check_admission(&guard, "ocr", "ai_ocr", false).await;
        assert!(decision.allow);
        assert_eq!(decision.reason, "guard_error");
    }

    #[test]
    fn test_config_validation() {
        assert!(GuardConfig::default().validate().is_ok());
        let bad = GuardConfig {
            soft_cpu_load: 0.99,
            ..GuardConfig::default()
        };
        assert!(bad.validate().is_err());
        assert!(GuardConfig::default().with_cap("ocr", 0).validate().is_err());
    }

    #[test]
    fn test_config_serde_defaults() {
        let config: GuardConfig = serde_json::from_str(r#"{"retry_in_seconds": 5}"#).unwrap();
        assert_eq!(config.retry_in_seconds, 5);
        assert_eq!(config.concurrency_caps.get("llm_inference"), Some(&1));
    }
}
