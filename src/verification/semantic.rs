//! Semantic layer: does the classification agree with what the request says?

use async_trait::async_trait;

use super::{Verifier, VerificationContext};
use crate::models::{
    Classification, Consumer, Destination, Operation, Semantics, VerificationLayer,
    VerificationResult,
};

const LAYER: VerificationLayer = VerificationLayer::Semantic;

const ACTION_SEMANTICS: &[(&str, Semantics)] = &[
    ("show", Semantics::Read),
    ("display", Semantics::Read),
    ("list", Semantics::Read),
    ("get", Semantics::Read),
    ("find", Semantics::Read),
    ("search", Semantics::Read),
    ("check", Semantics::Read),
    ("explain", Semantics::Interpret),
    ("analyze", Semantics::Interpret),
    ("summarize", Semantics::Interpret),
    ("describe", Semantics::Interpret),
    ("what", Semantics::Interpret),
    ("why", Semantics::Interpret),
    ("how", Semantics::Interpret),
    ("create", Semantics::Execute),
    ("make", Semantics::Execute),
    ("add", Semantics::Execute),
    ("write", Semantics::Execute),
    ("save", Semantics::Execute),
    ("run", Semantics::Execute),
    ("execute", Semantics::Execute),
    ("start", Semantics::Execute),
    ("stop", Semantics::Execute),
    ("kill", Semantics::Execute),
    ("delete", Semantics::Execute),
    ("remove", Semantics::Execute),
    ("update", Semantics::Execute),
    ("install", Semantics::Execute),
];

const OBJECT_DESTINATION: &[(&str, Destination)] = &[
    ("memory", Destination::Stream),
    ("cpu", Destination::Stream),
    ("status", Destination::Stream),
    ("info", Destination::Stream),
    ("calendar", Destination::Stream),
    ("file", Destination::File),
    ("document", Destination::File),
    ("notes", Destination::File),
    ("config", Destination::File),
    ("scene", Destination::File),
    ("act", Destination::File),
    ("process", Destination::Process),
    ("service", Destination::Process),
    ("container", Destination::Process),
    ("docker", Destination::Process),
    ("test", Destination::Process),
    ("pytest", Destination::Process),
];

const MACHINE_CUES: &[&str] = &["json", "csv", "xml", "structured", "for parsing", "output format"];
const HUMAN_CUES: &[&str] = &["?", "explain", "tell me", "show me", "what is", "why"];

/// Combinations each source agent should not be asked to perform.
const AGENT_LIMITS: &[(&str, Destination, Semantics, &str)] = &[
    (
        "cairn",
        Destination::Process,
        Semantics::Execute,
        "cairn typically doesn't execute processes (consider routing to reos)",
    ),
    (
        "reos",
        Destination::File,
        Semantics::Interpret,
        "reos typically doesn't interpret files (consider routing to cairn)",
    ),
];

pub struct SemanticVerifier;

#[async_trait]
impl Verifier for SemanticVerifier {
    async fn verify(&self, operation: &Operation, _context: &VerificationContext) -> VerificationResult {
        check_semantics(operation)
    }
}

pub fn check_semantics(operation: &Operation) -> VerificationResult {
    let Some(classification) = &operation.classification else {
        return VerificationResult::warn(
            LAYER,
            vec!["No classification available for semantic check".to_string()],
            0.5,
            "",
        );
    };

    let request = operation.user_request.to_lowercase();
    let words: Vec<&str> = request
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();

    let mut issues = Vec::new();
    issues.extend(semantics_mismatch(&words, classification.semantics));
    issues.extend(destination_mismatch(&words, classification.destination));
    issues.extend(consumer_mismatch(&request, classification.consumer));
    issues.extend(agent_mismatch(&operation.source_agent, classification));
    if !classification.confident {
        issues.push("Classification not confident".to_string());
    }

    let mut confidence = operation.inherited_confidence();
    if issues.is_empty() {
        VerificationResult::pass(
            LAYER,
            format!("Semantically coherent ({})", classification.semantics),
        )
        .with_confidence(confidence)
    } else {
        confidence *= 0.7;
        VerificationResult::warn(LAYER, issues, confidence, "")
    }
}

/// Table values hit by `words`, first-seen order, deduplicated.
fn expected<T: Copy + PartialEq>(words: &[&str], table: &[(&str, T)]) -> Vec<T> {
    let mut found: Vec<T> = Vec::new();
    for word in words {
        if let Some((_, value)) = table.iter().find(|(key, _)| key == word) {
            if !found.contains(value) {
                found.push(*value);
            }
        }
    }
    found
}

fn join<T: std::fmt::Display>(values: &[T]) -> String {
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn semantics_mismatch(words: &[&str], semantics: Semantics) -> Option<String> {
    let expected = expected(words, ACTION_SEMANTICS);
    if expected.is_empty() || expected.contains(&semantics) {
        return None;
    }
    Some(format!(
        "Action words suggest {}, but classified as {}",
        join(&expected),
        semantics
    ))
}

fn destination_mismatch(words: &[&str], destination: Destination) -> Option<String> {
    let expected = expected(words, OBJECT_DESTINATION);
    if expected.is_empty() || expected.contains(&destination) {
        return None;
    }
    Some(format!(
        "Target objects suggest {}, but classified as {}",
        join(&expected),
        destination
    ))
}

fn consumer_mismatch(request: &str, consumer: Consumer) -> Option<String> {
    let machine = MACHINE_CUES.iter().any(|cue| request.contains(cue));
    let human = HUMAN_CUES.iter().any(|cue| request.contains(cue));

    match consumer {
        Consumer::Human if machine => {
            Some("Request suggests machine consumer but classified as human".to_string())
        }
        Consumer::Machine if human && !machine => {
            Some("Request suggests human consumer but classified as machine".to_string())
        }
        _ => None,
    }
}

fn agent_mismatch(source_agent: &str, classification: &Classification) -> Option<String> {
    AGENT_LIMITS
        .iter()
        .find(|(agent, destination, semantics, _)| {
            source_agent.eq_ignore_ascii_case(agent)
                && classification.destination == *destination
                && classification.semantics == *semantics
        })
        .map(|(_, _, _, message)| message.to_string())
}
