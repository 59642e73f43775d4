//! Verification pipeline
//!
//! Runs the layers strictly in order. Syntax and safety failures halt the
//! loop; the advisory layers record failures and keep going.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use super::{
    timed_verify, BehavioralVerifier, IntentVerifier, SafetyVerifier, SemanticVerifier,
    SyntaxVerifier, Verifier, VerificationContext,
};
use crate::error::AtomicOpsError;
use crate::models::{Operation, OperationStatus, VerificationLayer, VerificationResult};
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationMode {
    /// Syntax and safety only.
    Fast,
    /// Everything except the oracle-backed intent layer.
    #[default]
    Standard,
    /// All five layers; intent only when an oracle is present.
    Full,
}

impl VerificationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationMode::Fast => "fast",
            VerificationMode::Standard => "standard",
            VerificationMode::Full => "full",
        }
    }

    fn includes(&self, layer: VerificationLayer, context: &VerificationContext) -> bool {
        match layer {
            VerificationLayer::Syntax | VerificationLayer::Safety => true,
            VerificationLayer::Semantic | VerificationLayer::Behavioral => {
                *self != VerificationMode::Fast
            }
            VerificationLayer::Intent => *self == VerificationMode::Full && context.has_oracle(),
        }
    }
}

impl FromStr for VerificationMode {
    type Err = AtomicOpsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "fast" => Ok(VerificationMode::Fast),
            "standard" => Ok(VerificationMode::Standard),
            "full" => Ok(VerificationMode::Full),
            other => Err(AtomicOpsError::ConfigError(format!(
                "unknown verification mode '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for VerificationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    pub passed: bool,
    pub status: OperationStatus,
    pub results: BTreeMap<VerificationLayer, VerificationResult>,
    pub blocking_layer: Option<VerificationLayer>,
    /// True only when a blocking layer stopped the loop early.
    pub halted: bool,
    pub overall_confidence: f64,
    pub total_time_ms: u64,
    /// Every issue from every layer run, as `[layer] issue`.
    pub warnings: Vec<String>,
}

impl PipelineResult {
    pub fn layers_run(&self) -> Vec<VerificationLayer> {
        self.results.keys().copied().collect()
    }
}

pub struct VerificationPipeline {
    mode: VerificationMode,
    safety: Arc<SafetyVerifier>,
    layers: Vec<(VerificationLayer, Arc<dyn Verifier>)>,
}

impl VerificationPipeline {
    pub fn new(mode: VerificationMode) -> Self {
        let safety = Arc::new(SafetyVerifier::new());
        let layers = vec![
            (VerificationLayer::Syntax, Arc::new(SyntaxVerifier) as Arc<dyn Verifier>),
            (VerificationLayer::Safety, safety.clone() as Arc<dyn Verifier>),
            (VerificationLayer::Semantic, Arc::new(SemanticVerifier) as Arc<dyn Verifier>),
            (VerificationLayer::Behavioral, Arc::new(BehavioralVerifier) as Arc<dyn Verifier>),
            (VerificationLayer::Intent, Arc::new(IntentVerifier) as Arc<dyn Verifier>),
        ];
        Self {
            mode,
            safety,
            layers,
        }
    }

    pub fn mode(&self) -> VerificationMode {
        self.mode
    }

    pub async fn verify(&self, operation: &Operation, context: &VerificationContext) -> PipelineResult {
        self.verify_in_mode(operation, context, self.mode).await
    }

    pub async fn verify_in_mode(
        &self,
        operation: &Operation,
        context: &VerificationContext,
        mode: VerificationMode,
    ) -> PipelineResult {
        let started = Instant::now();
        let mut results = BTreeMap::new();
        let mut warnings = Vec::new();
        let mut blocking_layer = None;
        let mut first_failure = None;
        let mut halted = false;

        for (layer, verifier) in &self.layers {
            if !mode.includes(*layer, context) {
                continue;
            }

            let result = timed_verify(*layer, verifier.as_ref(), operation, context).await;
            debug!(
                operation_id = %operation.id,
                layer = %layer,
                passed = result.passed,
                confidence = result.confidence,
                elapsed_ms = result.execution_time_ms,
                "Verification layer finished"
            );

            warnings.extend(result.issues.iter().map(|issue| format!("[{}] {}", layer, issue)));
            let passed = result.passed;
            results.insert(*layer, result);

            if !passed {
                if layer.is_blocking() {
                    blocking_layer = Some(*layer);
                    halted = true;
                    break;
                }
                first_failure.get_or_insert(*layer);
            }
        }

        if blocking_layer.is_none() {
            blocking_layer = first_failure;
        }
        let passed = blocking_layer.is_none();

        let status = if !passed {
            OperationStatus::Failed
        } else if warnings.is_empty() {
            OperationStatus::Executing
        } else {
            OperationStatus::AwaitingApproval
        };

        let overall_confidence = overall_confidence(&results);
        let total_time_ms = started.elapsed().as_millis() as u64;

        info!(
            operation_id = %operation.id,
            mode = %mode,
            passed,
            status = %status,
            blocking_layer = ?blocking_layer,
            overall_confidence,
            "Verification complete"
        );

        PipelineResult {
            passed,
            status,
            results,
            blocking_layer,
            halted,
            overall_confidence,
            total_time_ms,
            warnings,
        }
    }

    /// Verify each operation in turn with a shared context.
    pub async fn verify_batch(
        &self,
        operations: &[Operation],
        context: &VerificationContext,
    ) -> Vec<PipelineResult> {
        let mut results = Vec::with_capacity(operations.len());
        for operation in operations {
            results.push(self.verify(operation, context).await);
        }
        results
    }

    /// Clear session counters held by the safety layer.
    pub fn reset(&self) {
        self.safety.reset();
    }

    pub fn safety(&self) -> &SafetyVerifier {
        &self.safety
    }
}

impl Default for VerificationPipeline {
    fn default() -> Self {
        Self::new(VerificationMode::default())
    }
}

/// Weighted mean over the layers that ran; failed layers count as zero.
pub fn overall_confidence(results: &BTreeMap<VerificationLayer, VerificationResult>) -> f64 {
    let total_weight: f64 = results.keys().map(|layer| layer.weight()).sum();
    if total_weight == 0.0 {
        return 0.0;
    }
    let weighted: f64 = results
        .iter()
        .filter(|(_, result)| result.passed)
        .map(|(layer, result)| layer.weight() * result.confidence)
        .sum();
    weighted / total_weight
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Classification, Consumer, Destination, Semantics};
    use crate::oracle::{MockOracle, OracleCall};
    use crate::verification::SafetyLevel;

    fn create_test_operation(request: &str, axes: Option<(Destination, Consumer, Semantics)>) -> Operation {
        let mut op = Operation::new(request, "test_user", "cairn");
        if let Some((d, c, s)) = axes {
            let mut classification = Classification::new(d, c, s);
            classification.confident = true;
            op.classify(classification);
        }
        op
    }

    fn context() -> VerificationContext {
        VerificationContext::new("test_user", "cairn")
    }

    #[tokio::test]
    async fn test_blocked_request_halts_at_safety() {
        let pipeline = VerificationPipeline::new(VerificationMode::Standard);
        let op = create_test_operation(
            "rm -rf /",
            Some((Destination::Process, Consumer::Machine, Semantics::Execute)),
        );

        let result = pipeline.verify(&op, &context()).await;

        assert!(!result.passed);
        assert!(result.halted);
        assert_eq!(result.status, OperationStatus::Failed);
        assert_eq!(result.blocking_layer, Some(VerificationLayer::Safety));
        assert_eq!(
            result.layers_run(),
            vec![VerificationLayer::Syntax, VerificationLayer::Safety]
        );
        assert!(result.warnings.iter().any(|w| w.starts_with("[safety] BLOCKED")));
    }

    #[tokio::test]
    async fn test_too_short_halts_at_syntax() {
        let pipeline = VerificationPipeline::default();
        let op = create_test_operation("a", None);

        let result = pipeline.verify(&op, &context()).await;

        assert_eq!(result.blocking_layer, Some(VerificationLayer::Syntax));
        assert_eq!(result.layers_run(), vec![VerificationLayer::Syntax]);
        assert_eq!(result.overall_confidence, 0.0);
    }

    #[tokio::test]
    async fn test_clean_request_goes_to_executing() {
        let pipeline = VerificationPipeline::new(VerificationMode::Standard);
        let op = create_test_operation(
            "show memory usage",
            Some((Destination::Stream, Consumer::Human, Semantics::Read)),
        );

        let result = pipeline.verify(&op, &context()).await;

        assert!(result.passed, "warnings: {:?}", result.warnings);
        assert_eq!(result.status, OperationStatus::Executing);
        assert_eq!(result.results.len(), 4);
        assert!(result.overall_confidence > 0.0 && result.overall_confidence <= 1.0);
        for r in result.results.values() {
            assert!((0.0..=1.0).contains(&r.confidence));
        }
    }

    #[tokio::test]
    async fn test_warnings_need_approval() {
        let pipeline = VerificationPipeline::new(VerificationMode::Standard);
        let op = create_test_operation(
            "sudo systemctl restart nginx",
            Some((Destination::Process, Consumer::Machine, Semantics::Execute)),
        );

        let result = pipeline.verify(&op, &context()).await;

        assert!(result.passed);
        assert_eq!(result.status, OperationStatus::AwaitingApproval);
        assert!(result.warnings.iter().any(|w| w.starts_with("[behavioral]")));
    }

    #[tokio::test]
    async fn test_fast_mode_runs_two_layers() {
        let pipeline = VerificationPipeline::new(VerificationMode::Standard);
        let op = create_test_operation(
            "show memory usage",
            Some((Destination::Stream, Consumer::Human, Semantics::Read)),
        );

        let result = pipeline
            .verify_in_mode(&op, &context(), VerificationMode::Fast)
            .await;

        assert_eq!(
            result.layers_run(),
            vec![VerificationLayer::Syntax, VerificationLayer::Safety]
        );
    }

    #[tokio::test]
    async fn test_full_mode_without_oracle_skips_intent() {
        let pipeline = VerificationPipeline::new(VerificationMode::Full);
        let op = create_test_operation(
            "show memory usage",
            Some((Destination::Stream, Consumer::Human, Semantics::Read)),
        );

        let result = pipeline.verify(&op, &context()).await;
        assert!(!result.results.contains_key(&VerificationLayer::Intent));
    }

    #[tokio::test]
    async fn test_intent_mismatch_fails_without_halting() {
        let oracle = MockOracle::new().reply(
            OracleCall::Intent,
            r#"{"aligned": false, "confidence": 0.9, "reasoning": "wrong target"}"#,
        );
        let ctx = context().with_oracle(Some(Arc::new(oracle)));
        let pipeline = VerificationPipeline::new(VerificationMode::Full);
        let op = create_test_operation(
            "show memory usage",
            Some((Destination::Stream, Consumer::Human, Semantics::Read)),
        );

        let result = pipeline.verify(&op, &ctx).await;

        assert!(!result.passed);
        assert!(!result.halted);
        assert_eq!(result.blocking_layer, Some(VerificationLayer::Intent));
        assert_eq!(result.status, OperationStatus::Failed);
        assert_eq!(result.results.len(), 5);
    }

    #[tokio::test]
    async fn test_batch_and_reset() {
        let pipeline = VerificationPipeline::default();
        let ctx = context().with_safety_level(SafetyLevel::Permissive);
        let ops: Vec<Operation> = ["show memory", "list files", "a"]
            .iter()
            .map(|r| create_test_operation(r, None))
            .collect();

        let results = pipeline.verify_batch(&ops, &ctx).await;
        assert_eq!(results.len(), 3);
        assert!(!results[2].passed);
        // The too-short request never reaches the safety layer.
        assert_eq!(pipeline.safety().operation_count(), 2);

        pipeline.reset();
        assert_eq!(pipeline.safety().operation_count(), 0);
    }

    #[test]
    fn test_overall_confidence_renormalizes() {
        let mut results = BTreeMap::new();
        results.insert(
            VerificationLayer::Syntax,
            VerificationResult::pass(VerificationLayer::Syntax, ""),
        );
        results.insert(
            VerificationLayer::Safety,
            VerificationResult::fail(VerificationLayer::Safety, vec![], ""),
        );
        let expected = 0.15 / (0.15 + 0.25);
        assert!((overall_confidence(&results) - expected).abs() < 1e-9);
        assert_eq!(overall_confidence(&BTreeMap::new()), 0.0);
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("FULL".parse::<VerificationMode>().unwrap(), VerificationMode::Full);
        assert!("thorough".parse::<VerificationMode>().is_err());
    }
}
