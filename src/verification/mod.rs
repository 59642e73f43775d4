//! Verification layers
//!
//! Five independent checks run before anything touches the system:
//! syntax → safety → semantic → behavioral → intent.
//!
//! Each layer is a `Verifier`; the pipeline owns an ordered list of
//! `(layer, verifier)` pairs and decides which subset a mode runs.

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use crate::error::AtomicOpsError;
use crate::models::{Operation, VerificationLayer, VerificationResult};
use crate::oracle::Oracle;
use crate::Result;

pub mod behavioral;
pub mod intent;
pub mod pipeline;
pub mod safety;
pub mod semantic;
pub mod syntax;

pub use behavioral::BehavioralVerifier;
pub use intent::IntentVerifier;
pub use pipeline::{PipelineResult, VerificationMode, VerificationPipeline};
pub use safety::SafetyVerifier;
pub use semantic::SemanticVerifier;
pub use syntax::SyntaxVerifier;

/// One verification layer.
#[async_trait]
pub trait Verifier: Send + Sync {
    async fn verify(&self, operation: &Operation, context: &VerificationContext)
        -> VerificationResult;
}

/// Run a verifier and record how long it took.
pub async fn timed_verify(
    layer: VerificationLayer,
    verifier: &dyn Verifier,
    operation: &Operation,
    context: &VerificationContext,
) -> VerificationResult {
    let started = Instant::now();
    let mut result = verifier.verify(operation, context).await;
    result.layer = layer;
    result.execution_time_ms = started.elapsed().as_millis() as u64;
    result
}

//
// ================= Safety Level =================
//

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SafetyLevel {
    Permissive,
    #[default]
    Standard,
    Strict,
}

impl SafetyLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SafetyLevel::Permissive => "permissive",
            SafetyLevel::Standard => "standard",
            SafetyLevel::Strict => "strict",
        }
    }
}

impl FromStr for SafetyLevel {
    type Err = AtomicOpsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "permissive" => Ok(SafetyLevel::Permissive),
            "standard" => Ok(SafetyLevel::Standard),
            "strict" => Ok(SafetyLevel::Strict),
            other => Err(AtomicOpsError::ConfigError(format!(
                "unknown safety level '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for SafetyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

//
// ================= Context =================
//

/// What the layers know about the caller beyond the operation itself.
#[derive(Clone, Default)]
pub struct VerificationContext {
    pub user_id: String,
    pub source_agent: String,
    /// Prior request texts, newest first.
    pub recent_operations: Vec<String>,
    pub current_directory: Option<String>,
    pub safety_level: SafetyLevel,
    pub blocked_commands: Vec<String>,
    pub allowed_paths: Vec<String>,
    pub oracle: Option<Arc<dyn Oracle>>,
    pub additional_context: Option<String>,
}

impl VerificationContext {
    pub fn new(user_id: &str, source_agent: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            source_agent: source_agent.to_string(),
            ..Default::default()
        }
    }

    pub fn with_safety_level(mut self, level: SafetyLevel) -> Self {
        self.safety_level = level;
        self
    }

    pub fn with_oracle(mut self, oracle: Option<Arc<dyn Oracle>>) -> Self {
        self.oracle = oracle;
        self
    }

    pub fn with_recent_operations(mut self, recent: Vec<String>) -> Self {
        self.recent_operations = recent;
        self
    }

    pub fn has_oracle(&self) -> bool {
        self.oracle.is_some()
    }

    /// Request words that appear in the configured block list.
    pub fn blocked_words_in(&self, request: &str) -> Vec<String> {
        let lowered = request.to_lowercase();
        let mut hits: Vec<String> = lowered
            .split_whitespace()
            .filter(|word| {
                self.blocked_commands
                    .iter()
                    .any(|blocked| blocked.eq_ignore_ascii_case(word))
            })
            .map(str::to_string)
            .collect();
        hits.sort();
        hits.dedup();
        hits
    }
}

//
// ================= Shared Helpers =================
//

/// Compile a table of `(pattern, description)` pairs, case-insensitive.
pub(crate) fn compile_table(table: &[(&str, &'static str)]) -> Vec<(Regex, &'static str)> {
    table
        .iter()
        .map(|(pattern, description)| {
            let regex = Regex::new(&format!("(?i){}", pattern)).expect("valid verifier pattern");
            (regex, *description)
        })
        .collect()
}

lazy_static! {
    static ref PATH_TOKEN: Regex =
        Regex::new(r#"(?:^|[\s"'])([/~][\w./\x00-]+|\.{1,2}/[\w./\x00-]*)"#)
            .expect("valid path pattern");
}

/// Path-like tokens in a request (`/x`, `~/x`, `./x`, `../x`).
pub(crate) fn extract_paths(request: &str) -> Vec<String> {
    PATH_TOKEN
        .captures_iter(request)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .collect()
}

pub(crate) fn contains_word(words: &[&str], request_lower: &str) -> bool {
    request_lower
        .split(|c: char| !c.is_alphanumeric() && c != '\'')
        .any(|token| words.contains(&token))
}
