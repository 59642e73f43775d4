//! Behavioral layer: predict blast radius.
//!
//! Pattern families only, never an oracle call. Everything found here is
//! surfaced for approval; this layer does not fail an operation.

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;

use super::{compile_table, extract_paths, SafetyLevel, Verifier, VerificationContext};
use crate::models::{
    Consumer, Destination, Operation, Semantics, VerificationLayer, VerificationResult,
};

pub const MAX_CHILD_OPERATIONS: usize = 10;

const LAYER: VerificationLayer = VerificationLayer::Behavioral;

const BROAD_PATTERNS: &[(&str, &str)] = &[
    (r"\b(all|every|each)\b.*\b(file|folder|dir)", "Affects all files/directories"),
    (r"\brecursive\b", "Recursive operation"),
    (r"\s-[rR]\b", "Recursive flag"),
    (r"\s-rf\b", "Recursive force flag"),
    (r"\*\*/", "Glob all subdirectories"),
    (r"/\*$", "Glob all in directory"),
];

const SYSTEM_PATTERNS: &[(&str, &str)] = &[
    (r"\bsudo\b", "Requires root privileges"),
    (r#"(?:^|[\s"'])/etc/"#, "Modifies system configuration"),
    (r#"(?:^|[\s"'])/usr/"#, "Modifies system files"),
    (r#"(?:^|[\s"'])/var/"#, "Modifies system data"),
    (r"\bsystemctl\b", "Controls system services"),
    (r"\b(apt|dnf|pacman|zypper)\b", "Package management"),
];

const RESOURCE_PATTERNS: &[(&str, &str)] = &[
    (r"\bfind\s+/(\s|$)", "Searches from root"),
    (r"\bgrep\s+-r\s+/(\s|$)", "Recursive grep from root"),
    (r"\bdd\b", "Direct disk operation"),
    (r"\btar\b.*\bczf\b", "Creating compressed archive"),
    (r"\brsync\b", "Synchronization operation"),
];

const PREDICTIONS: &[((Destination, Consumer, Semantics), &str)] = &[
    (
        (Destination::Stream, Consumer::Human, Semantics::Read),
        "Will display information to user",
    ),
    (
        (Destination::Stream, Consumer::Human, Semantics::Interpret),
        "Will explain/analyze and display to user",
    ),
    (
        (Destination::Stream, Consumer::Machine, Semantics::Read),
        "Will output structured data",
    ),
    (
        (Destination::File, Consumer::Human, Semantics::Read),
        "Will read and display file contents",
    ),
    (
        (Destination::File, Consumer::Human, Semantics::Execute),
        "Will create or modify a file",
    ),
    (
        (Destination::File, Consumer::Machine, Semantics::Execute),
        "Will write structured data to file",
    ),
    (
        (Destination::Process, Consumer::Machine, Semantics::Execute),
        "Will run a system command",
    ),
    (
        (Destination::Process, Consumer::Human, Semantics::Execute),
        "Will launch an interactive application",
    ),
];

lazy_static! {
    static ref BROAD: Vec<(Regex, &'static str)> = compile_table(BROAD_PATTERNS);
    static ref SYSTEM: Vec<(Regex, &'static str)> = compile_table(SYSTEM_PATTERNS);
    static ref RESOURCE: Vec<(Regex, &'static str)> = compile_table(RESOURCE_PATTERNS);
}

pub struct BehavioralVerifier;

#[async_trait]
impl Verifier for BehavioralVerifier {
    async fn verify(&self, operation: &Operation, context: &VerificationContext) -> VerificationResult {
        check_behavior(operation, context)
    }
}

pub fn check_behavior(operation: &Operation, context: &VerificationContext) -> VerificationResult {
    let request = operation.user_request.as_str();
    let mut issues = Vec::new();
    let mut system_level = false;

    for (pattern, description) in BROAD.iter() {
        if pattern.is_match(request) {
            issues.push(format!("Broad operation: {}", description));
        }
    }

    for (pattern, description) in SYSTEM.iter() {
        if pattern.is_match(request) {
            system_level = true;
            issues.push(match context.safety_level {
                SafetyLevel::Strict => format!(
                    "System operation requires approval in strict mode: {}",
                    description
                ),
                _ => format!("System operation: {}", description),
            });
        }
    }

    for (pattern, description) in RESOURCE.iter() {
        if pattern.is_match(request) {
            issues.push(format!("Resource-intensive: {}", description));
        }
    }

    if operation.is_decomposed && operation.child_ids.len() > MAX_CHILD_OPERATIONS {
        issues.push(format!(
            "Decomposed into {} operations (max recommended: {})",
            operation.child_ids.len(),
            MAX_CHILD_OPERATIONS
        ));
    }

    issues.extend(scope_issues(operation, context));

    let prediction = predict_behavior(operation);
    if issues.is_empty() {
        return VerificationResult::pass(LAYER, prediction);
    }

    let confidence = (1.0 - issues.len() as f64 * 0.1).max(0.3);
    let details = if system_level {
        format!("System-level operation - requires approval. {}", prediction)
    } else {
        prediction
    };
    VerificationResult::warn(LAYER, issues, confidence, details)
}

fn scope_issues(operation: &Operation, context: &VerificationContext) -> Vec<String> {
    let mut issues = Vec::new();
    let Some(classification) = &operation.classification else {
        return issues;
    };
    if classification.semantics != Semantics::Execute {
        return issues;
    }

    match classification.destination {
        Destination::File if !context.allowed_paths.is_empty() => {
            for path in extract_paths(&operation.user_request) {
                let allowed = context
                    .allowed_paths
                    .iter()
                    .any(|prefix| path.starts_with(prefix.as_str()));
                if !allowed {
                    issues.push(format!("Path '{}' outside allowed directories", path));
                }
            }
        }
        Destination::Process => {
            let blocked = context.blocked_words_in(&operation.user_request);
            if !blocked.is_empty() {
                issues.push(format!("Blocked commands detected: {}", blocked.join(", ")));
            }
        }
        _ => {}
    }
    issues
}

/// Human-readable forecast of what the operation will do.
pub fn predict_behavior(operation: &Operation) -> String {
    let Some(c) = &operation.classification else {
        return "Behavior unknown (no classification)".to_string();
    };
    let key = (c.destination, c.consumer, c.semantics);
    PREDICTIONS
        .iter()
        .find(|(axes, _)| *axes == key)
        .map(|(_, text)| text.to_string())
        .unwrap_or_else(|| format!("Will {} to {} for {}", c.semantics, c.destination, c.consumer))
}
