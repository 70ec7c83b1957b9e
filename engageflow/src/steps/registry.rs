//! Step registry built once at startup.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::builtin::{
    AudioTranscriptionStep, CommentGenerationStep, FaceRecognitionStep, MetadataTaggingStep,
    OcrStep, VideoAnalysisStep, VisualAnalysisStep,
};
use super::capabilities::StepCapabilities;
use super::handler::StepHandler;
use super::kind::StepKind;
use super::ports::AnalysisPorts;
use crate::errors::EngageflowError;

/// A registered step: its handler and declared capabilities.
#[derive(Clone)]
pub struct RegisteredStep {
    /// The handler doing the work.
    pub handler: Arc<dyn StepHandler>,
    /// Execution properties.
    pub capabilities: StepCapabilities,
}

impl std::fmt::Debug for RegisteredStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredStep")
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

/// Maps step kinds to their handlers.
#[derive(Debug, Clone, Default)]
pub struct StepRegistry {
    steps: BTreeMap<StepKind, RegisteredStep>,
}

impl StepRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers every built-in step over the given backends.
    pub fn builtin(ports: &AnalysisPorts) -> Result<Self, EngageflowError> {
        let mut registry = Self::new();
        registry.register(Arc::new(FaceRecognitionStep::new(Arc::clone(&ports.faces))));
        registry.register(Arc::new(OcrStep::new(Arc::clone(&ports.ocr))));
        registry.register(Arc::new(VisualAnalysisStep::new(Arc::clone(&ports.vision))));
        registry.register(Arc::new(VideoAnalysisStep::new(Arc::clone(&ports.video))));
        registry.register(Arc::new(AudioTranscriptionStep::new(Arc::clone(&ports.audio))));
        registry.register(Arc::new(MetadataTaggingStep::new()?));
        registry.register(Arc::new(CommentGenerationStep::new(Arc::clone(&ports.comments))));
        Ok(registry)
    }

    /// Registers a handler with its kind's default capabilities.
    pub fn register(&mut self, handler: Arc<dyn StepHandler>) {
        let capabilities = StepCapabilities::for_kind(handler.kind());
        self.register_with(handler, capabilities);
    }

    /// Registers a handler with explicit capabilities, replacing any
    /// previous registration of the same kind.
    pub fn register_with(&mut self, handler: Arc<dyn StepHandler>, capabilities: StepCapabilities) {
        let kind = handler.kind();
        self.steps.insert(
            kind,
            RegisteredStep {
                handler,
                capabilities: StepCapabilities { kind, ..capabilities },
            },
        );
    }

    /// Adjusts the capabilities of a registered step.
    pub fn configure(
        &mut self,
        kind: StepKind,
        update: impl FnOnce(StepCapabilities) -> StepCapabilities,
    ) -> Result<(), EngageflowError> {
        let entry = self
            .steps
            .get_mut(&kind)
            .ok_or_else(|| EngageflowError::UnknownStep(kind.to_string()))?;
        entry.capabilities = StepCapabilities {
            kind,
            ..update(entry.capabilities.clone())
        };
        Ok(())
    }

    /// Checks that every step's delivery budget leaves room for a real
    /// attempt after its last allowed guard deferral.
    pub fn validate_budgets(&self, default_total: u32) -> Result<(), EngageflowError> {
        for (kind, step) in &self.steps {
            let caps = &step.capabilities;
            let total = caps.max_total_attempts.unwrap_or(default_total);
            if total <= caps.max_defer_attempts {
                return Err(EngageflowError::Config(format!(
                    "step '{kind}' allows {} guard deferrals but only {total} deliveries",
                    caps.max_defer_attempts
                )));
            }
        }
        Ok(())
    }

    /// Looks up a step by kind.
    #[must_use]
    pub fn get(&self, kind: StepKind) -> Option<&RegisteredStep> {
        self.steps.get(&kind)
    }

    /// Looks up a step by its key.
    pub fn resolve(&self, name: &str) -> Result<&RegisteredStep, EngageflowError> {
        let kind: StepKind = name.parse()?;
        self.get(kind)
            .ok_or_else(|| EngageflowError::UnknownStep(name.to_string()))
    }

    /// Returns true if the kind is registered.
    #[must_use]
    pub fn contains(&self, kind: StepKind) -> bool {
        self.steps.contains_key(&kind)
    }

    /// Registered kinds.
    pub fn kinds(&self) -> impl Iterator<Item = StepKind> + '_ {
        self.steps.keys().copied()
    }

    /// Number of registered steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedBackend;

    #[test]
    fn test_builtin_registers_everything() {
        let registry = StepRegistry::builtin(&ScriptedBackend::new().ports()).unwrap();
        assert_eq!(registry.len(), StepKind::ALL.len());
        assert!(registry.resolve("comments").is_ok());
        assert!(registry.resolve("video").is_ok());
        assert!(matches!(
            registry.resolve("sentiment"),
            Err(EngageflowError::UnknownStep(_))
        ));
    }

    #[test]
    fn test_configure_keeps_kind() {
        let mut registry = StepRegistry::builtin(&ScriptedBackend::new().ports()).unwrap();
        registry
            .configure(StepKind::Ocr, |caps| caps.with_queue("gpu").with_max_defer_attempts(1))
            .unwrap();
        let ocr = registry.get(StepKind::Ocr).unwrap();
        assert_eq!(ocr.capabilities.queue_name, "gpu");
        assert_eq!(ocr.capabilities.kind, StepKind::Ocr);
    }

    #[test]
    fn test_budget_must_exceed_deferrals() {
        let mut registry = StepRegistry::builtin(&ScriptedBackend::new().ports()).unwrap();
        assert!(registry.validate_budgets(24).is_ok());
        assert!(registry.validate_budgets(8).is_err());

        registry
            .configure(StepKind::Ocr, |caps| caps.with_max_total_attempts(6))
            .unwrap();
        assert!(matches!(
            registry.validate_budgets(24),
            Err(EngageflowError::Config(message)) if message.contains("'ocr'")
        ));
    }

    #[test]
    fn test_configure_unknown() {
        let mut registry = StepRegistry::new();
        assert!(registry.configure(StepKind::Ocr, |caps| caps).is_err());
    }
}
