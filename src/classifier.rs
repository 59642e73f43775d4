//! Request Classifier
//!
//! Maps a request onto the destination / consumer / semantics taxonomy:
//! - Oracle path: taxonomy prompt + few-shot corrections + optional memory context
//! - Fallback path: fixed keyword groups over the lower-cased word set
//!
//! The fallback never claims confidence and is a pure function of its input.

use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::models::{Classification, Consumer, Correction, Destination, Semantics};
use crate::oracle::{ask, ClassificationReply, Oracle, OracleCall, OracleRequest};

pub const FALLBACK_MODEL: &str = "keyword_fallback";
pub const FALLBACK_REASONING: &str = "keyword fallback (LLM unavailable)";
pub const MAX_PROMPT_CORRECTIONS: usize = 5;

/// Static keyword groups
const FILE_WORDS: &[&str] = &["save", "write", "create", "update", "add", "note", "scene"];
const PROCESS_WORDS: &[&str] = &[
    "run", "start", "stop", "kill", "restart", "install", "build", "push",
];
const MACHINE_WORDS: &[&str] = &["json", "csv", "parse", "pytest", "test", "build", "docker"];
const READ_WORDS: &[&str] = &["show", "list", "get", "what", "display", "status", "check"];
const EXECUTE_WORDS: &[&str] = &[
    "run", "start", "stop", "kill", "create", "save", "delete", "install", "build",
];

/// First matching group wins.
const DOMAIN_GROUPS: &[(&str, &[&str])] = &[
    ("calendar", &["calendar", "schedule", "event", "meeting", "appointment"]),
    ("contacts", &["contact", "person", "people", "email", "phone"]),
    ("system", &["cpu", "memory", "ram", "disk", "process", "system", "uptime", "docker"]),
    ("play", &["act", "scene", "play"]),
    ("tasks", &["todo", "task", "reminder", "deadline"]),
    ("undo", &["undo", "revert", "reverse"]),
    (
        "health",
        &["health", "checkup", "wellness", "vitality", "freshness", "integrity", "snapshot"],
    ),
    (
        "conversation",
        &["hi", "hello", "hey", "morning", "afternoon", "evening", "thanks", "bye"],
    ),
];

const ACTION_GROUPS: &[(&str, &[&str])] = &[
    ("view", &["show", "list", "display", "view", "what"]),
    ("search", &["find", "search", "where", "look"]),
    ("create", &["create", "add", "new", "make"]),
    ("update", &["update", "change", "modify", "move", "rename", "fix"]),
    ("delete", &["delete", "remove", "cancel"]),
    ("status", &["status", "check"]),
];

const SYSTEM_PROMPT: &str = r#"You classify requests sent to a local assistant before anything is executed.

Answer along five dimensions.

1. destination: where the result goes
   - "stream": shown once and gone (answers, greetings, status read-outs)
   - "file": written to persistent storage (notes, scenes, documents, config)
   - "process": starts, stops or controls a system process (run, install, kill)

2. consumer: who uses the result
   - "human": a person reads it
   - "machine": another program parses it (JSON, CSV, test runners, CI)

3. semantics: what the request does
   - "read": fetch or display existing data with no side effects
   - "interpret": explain, analyse, summarise or converse
   - "execute": cause a side effect (create, delete, run, install)

4. domain: calendar, contacts, system, play, tasks, health, undo, conversation, or null

5. action_hint: view, search, create, update, delete, status, or null

Rules:
- Greetings and small talk are stream/human/interpret with domain "conversation".
- Questions such as "what's X?" or "show me Y" are stream/human/read.
- "save X" is file/human/execute.
- "run pytest" is process/machine/execute with domain "system".
- "create a new scene in Career" is file/human/execute, domain "play", action_hint "create".
- When unsure, lean toward stream/human/interpret and set confident to false.
{corrections}
Reply with exactly one JSON object:
{"destination": "...", "consumer": "...", "semantics": "...", "confident": true, "reasoning": "...", "domain": null, "action_hint": null}"#;

/// Classification plus the name of whatever produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifierOutcome {
    pub classification: Classification,
    pub model: String,
}

pub struct AtomicClassifier {
    oracle: Option<Arc<dyn Oracle>>,
}

impl AtomicClassifier {
    pub fn new(oracle: Option<Arc<dyn Oracle>>) -> Self {
        Self { oracle }
    }

    pub fn has_oracle(&self) -> bool {
        self.oracle.is_some()
    }

    /// Classify `request`. Oracle failures are absorbed by the keyword fallback.
    pub async fn classify(
        &self,
        request: &str,
        corrections: &[Correction],
        memory_context: Option<&str>,
    ) -> ClassifierOutcome {
        if let Some(oracle) = &self.oracle {
            let call = OracleRequest::new(
                OracleCall::Classification,
                build_system_prompt(corrections),
                build_user_prompt(request, memory_context),
            );

            match ask::<ClassificationReply>(oracle.as_ref(), &call).await {
                Ok(reply) => {
                    let classification = reply.into_classification();
                    debug!(
                        label = %classification.label(),
                        confident = classification.confident,
                        "Oracle classification"
                    );
                    return ClassifierOutcome {
                        classification,
                        model: oracle.model_name().to_string(),
                    };
                }
                Err(e) => {
                    warn!(error = %e, "Oracle classification failed, using keyword fallback");
                }
            }
        }

        ClassifierOutcome {
            classification: fallback_classify(request),
            model: FALLBACK_MODEL.to_string(),
        }
    }
}

/// Taxonomy prompt with up to five past corrections as counter-examples.
pub fn build_system_prompt(corrections: &[Correction]) -> String {
    let block = if corrections.is_empty() {
        String::new()
    } else {
        let lines: Vec<String> = corrections
            .iter()
            .take(MAX_PROMPT_CORRECTIONS)
            .map(Correction::render)
            .collect();
        format!("\nPAST CORRECTIONS (learn from these):\n{}\n", lines.join("\n"))
    };

    SYSTEM_PROMPT.replace("{corrections}", &block)
}

pub fn build_user_prompt(request: &str, memory_context: Option<&str>) -> String {
    let mut prompt = format!("Classify this request: \"{}\"", request);
    if let Some(memory) = memory_context.map(str::trim).filter(|m| !m.is_empty()) {
        prompt.push_str("\n\nRelevant prior context (use for domain/intent clues):\n");
        prompt.push_str(memory);
    }
    prompt
}

/// Keyword classification. Deterministic, never confident.
pub fn fallback_classify(request: &str) -> Classification {
    let lowered = request.to_lowercase();
    let words: HashSet<&str> = lowered
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()))
        .filter(|w| !w.is_empty())
        .collect();

    let has_any = |group: &[&str]| contains_any(&words, group);

    let destination = if has_any(FILE_WORDS) {
        Destination::File
    } else if has_any(PROCESS_WORDS) {
        Destination::Process
    } else {
        Destination::Stream
    };

    let consumer = if has_any(MACHINE_WORDS) {
        Consumer::Machine
    } else {
        Consumer::Human
    };

    let semantics = if has_any(READ_WORDS) {
        Semantics::Read
    } else if has_any(EXECUTE_WORDS) {
        Semantics::Execute
    } else {
        Semantics::Interpret
    };

    Classification {
        destination,
        consumer,
        semantics,
        confident: false,
        reasoning: FALLBACK_REASONING.to_string(),
        domain: first_group(&words, DOMAIN_GROUPS),
        action_hint: first_group(&words, ACTION_GROUPS),
    }
}

fn contains_any(words: &HashSet<&str>, group: &[&str]) -> bool {
    group.iter().any(|kw| words.contains(kw))
}

fn first_group(words: &HashSet<&str>, groups: &[(&str, &[&str])]) -> Option<String> {
    groups
        .iter()
        .find(|(_, keywords)| contains_any(words, keywords))
        .map(|(name, _)| name.to_string())
}
