//! Intent layer
//!
//! Asks the oracle whether the classification matches what the user meant.
//! Without an oracle, or when the oracle call fails, a set of heuristics
//! stands in.

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{contains_word, Verifier, VerificationContext};
use crate::models::{Operation, Semantics, VerificationLayer, VerificationResult};
use crate::oracle::{ask, IntentReply, Oracle, OracleCall, OracleRequest};

const LAYER: VerificationLayer = VerificationLayer::Intent;

const RECENT_FOR_ORACLE: usize = 5;
const RECENT_PREVIEW_CHARS: usize = 50;
const REPEAT_WINDOW: usize = 3;
const REPEAT_THRESHOLD: usize = 2;

const DESTRUCTIVE_WORDS: &[&str] = &["delete", "remove", "kill", "stop", "clear"];
const READ_WORDS: &[&str] = &["show", "display", "list"];
const READ_PHRASES: &[&str] = &["what is", "what are"];

const SYSTEM_PROMPT: &str = r#"You verify that a system's interpretation of a user request matches what the user intended.

The classification has three axes:
- destination: stream (shown once), file (persisted), process (spawns or controls a process)
- consumer: human or machine
- semantics: read (observe), interpret (analyze or explain), execute (change state)

Return ONLY a JSON object:
{"aligned": true|false, "confidence": 0.0-1.0, "reasoning": "one sentence"}"#;

pub struct IntentVerifier;

#[async_trait]
impl Verifier for IntentVerifier {
    async fn verify(&self, operation: &Operation, context: &VerificationContext) -> VerificationResult {
        if let Some(oracle) = &context.oracle {
            if operation.classification.is_some() {
                if let Some(result) = verify_with_oracle(oracle.as_ref(), operation, context).await {
                    return result;
                }
            }
        }
        verify_heuristic(operation, context)
    }
}

/// `None` when the oracle could not give a usable answer.
async fn verify_with_oracle(
    oracle: &dyn Oracle,
    operation: &Operation,
    context: &VerificationContext,
) -> Option<VerificationResult> {
    let classification = operation.classification.as_ref()?;

    let mut user = format!(
        "Request: {}\nClassification: destination={}, consumer={}, semantics={}",
        operation.user_request,
        classification.destination,
        classification.consumer,
        classification.semantics
    );
    if !context.recent_operations.is_empty() {
        let recent: Vec<String> = context
            .recent_operations
            .iter()
            .take(RECENT_FOR_ORACLE)
            .map(|r| r.chars().take(RECENT_PREVIEW_CHARS).collect())
            .collect();
        user.push_str(&format!("\nRecent operations: {}", recent.join(", ")));
    }

    let request = OracleRequest::new(OracleCall::Intent, SYSTEM_PROMPT, user);
    match ask::<IntentReply>(oracle, &request).await {
        Ok(reply) => {
            debug!(aligned = reply.aligned, confidence = reply.confidence, "Oracle intent check");
            Some(if reply.aligned {
                VerificationResult::pass(LAYER, format!("Intent verified: {}", reply.reasoning))
                    .with_confidence(reply.confidence)
            } else {
                VerificationResult::fail(
                    LAYER,
                    vec![format!("Intent mismatch: {}", reply.reasoning)],
                    "",
                )
                .with_confidence(reply.confidence)
            })
        }
        Err(e) => {
            warn!(
                error = %e,
                oracle_failure = e.is_oracle_failure(),
                "Intent oracle unavailable, using heuristics"
            );
            None
        }
    }
}

pub fn verify_heuristic(operation: &Operation, context: &VerificationContext) -> VerificationResult {
    let Some(classification) = &operation.classification else {
        return VerificationResult::warn(
            LAYER,
            vec!["Cannot verify intent without classification".to_string()],
            0.5,
            "",
        );
    };

    let mut issues = Vec::new();
    let request = operation.user_request.to_lowercase();

    if !classification.confident {
        issues.push("Classification not confident - possible misinterpretation".to_string());
    }

    if request.contains('?') && classification.semantics == Semantics::Execute {
        issues.push("Question classified as execute action".to_string());
    }

    let destructive = contains_word(DESTRUCTIVE_WORDS, &request);
    if destructive && classification.semantics == Semantics::Read {
        issues.push("Destructive action classified as read-only".to_string());
    }

    let reads = contains_word(READ_WORDS, &request)
        || READ_PHRASES.iter().any(|phrase| request.contains(phrase));
    if reads && !destructive && classification.semantics == Semantics::Execute {
        issues.push("Read request classified as execute action".to_string());
    }

    let normalized = request.trim();
    let repeats = context
        .recent_operations
        .iter()
        .take(REPEAT_WINDOW)
        .filter(|prior| prior.trim().to_lowercase() == normalized)
        .count();
    if repeats >= REPEAT_THRESHOLD {
        issues.push("Repeated request - possible retry or confusion".to_string());
    }

    let confidence = operation.inherited_confidence();
    if issues.is_empty() {
        VerificationResult::pass(LAYER, "Intent appears aligned (heuristic check)")
            .with_confidence(confidence)
    } else {
        VerificationResult::warn(LAYER, issues, confidence * 0.7, "")
    }
}
