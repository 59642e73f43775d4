//! Syntax layer: is the request well-formed text, free of shell injection?

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;

use super::{extract_paths, Verifier, VerificationContext};
use crate::models::{Operation, VerificationLayer, VerificationResult};

pub const MIN_REQUEST_CHARS: usize = 2;
pub const MAX_REQUEST_CHARS: usize = 8192;
const MAX_REPEATED_CHAR_RUN: usize = 10;
const MAX_TRAVERSALS: usize = 2;

const LAYER: VerificationLayer = VerificationLayer::Syntax;

lazy_static! {
    static ref ONLY_SYMBOLS: Regex = Regex::new(r"^[\s\W]+$").expect("valid regex");

    // NUL is left to the path check so it is reported as a soft issue.
    static ref CONTROL_CHARS: Regex =
        Regex::new(r"[\x01-\x08\x0b\x0c\x0e-\x1f]").expect("valid regex");

    // Any one of these is enough to look like a command or a question.
    static ref VALID_SHAPES: Vec<Regex> = [
        r"^\s*\w+",
        r"(?i)\b(show|list|get|find|search|create|make|add|write|save|run|execute|start|stop|kill|delete|remove|update|open|install)\b",
        r"(?i)\b(what|how|why|when|where|who|which|is|are|can|do|does)\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid regex"))
    .collect();

    static ref INJECTION: Vec<Regex> = [
        r";\s*rm\s",
        r"\|\s*rm\s",
        r"&&\s*rm\s",
        r"`[^`]*`",
        r"\$\([^)]+\)",
        r">\s*/dev/",
        r">>\s*/etc/",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid regex"))
    .collect();
}

pub struct SyntaxVerifier;

#[async_trait]
impl Verifier for SyntaxVerifier {
    async fn verify(&self, operation: &Operation, _context: &VerificationContext) -> VerificationResult {
        check_syntax(&operation.user_request)
    }
}

/// The whole syntax check; synchronous and side-effect free.
pub fn check_syntax(raw: &str) -> VerificationResult {
    let request = raw.trim();
    let length = request.chars().count();

    if length == 0 {
        return VerificationResult::fail(LAYER, vec!["Request is empty".into()], "");
    }
    if length < MIN_REQUEST_CHARS {
        return VerificationResult::fail(LAYER, vec!["Request too short".into()], "");
    }
    if length > MAX_REQUEST_CHARS {
        return VerificationResult::fail(
            LAYER,
            vec!["Request exceeds maximum length (8KB)".into()],
            "",
        );
    }
    if ONLY_SYMBOLS.is_match(request) || CONTROL_CHARS.is_match(request) || is_single_char_run(request)
    {
        return VerificationResult::fail(
            LAYER,
            vec!["Request contains invalid characters or patterns".into()],
            "",
        );
    }

    let mut issues = Vec::new();

    if !VALID_SHAPES.iter().any(|shape| shape.is_match(request)) {
        issues.push("Request may not be a recognizable command or question".to_string());
    }

    if let Some(fragment) = find_injection(request) {
        issues.push(format!("Potential command injection detected: {}", fragment));
        return VerificationResult::fail(LAYER, issues, "Injection pattern found");
    }

    issues.extend(path_issues(request));

    let word_count = request.split_whitespace().count();
    let confidence = (0.5 + word_count as f64 * 0.1).min(1.0);

    if issues.is_empty() {
        VerificationResult::pass(LAYER, format!("{} words, well-formed", word_count))
            .with_confidence(confidence)
    } else {
        VerificationResult::warn(LAYER, issues, confidence * 0.8, "")
    }
}

/// The same character repeated more than ten times and nothing else.
fn is_single_char_run(request: &str) -> bool {
    let mut chars = request.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    let mut count = 1;
    for c in chars {
        if c != first {
            return false;
        }
        count += 1;
    }
    count > MAX_REPEATED_CHAR_RUN
}

fn find_injection(request: &str) -> Option<&str> {
    INJECTION
        .iter()
        .find_map(|pattern| pattern.find(request))
        .map(|m| m.as_str())
}

fn path_issues(request: &str) -> Vec<String> {
    let mut issues = Vec::new();
    for path in extract_paths(request) {
        if path.matches("/../").count() > MAX_TRAVERSALS {
            issues.push(format!("Suspicious path traversal: {}", path));
        }
        if path.contains("//") && !path.starts_with("//") {
            issues.push(format!("Path contains double slash: {}", path));
        }
        if path.contains('\0') {
            issues.push(format!("Path contains null byte: {}", path.replace('\0', "\\0")));
        }
    }
    issues
}
