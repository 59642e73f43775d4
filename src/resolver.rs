//! Entity resolution
//!
//! Binds what the user said ("the career scene") to one of the entities the
//! caller knows about. The match is a semantic judgment made by the oracle,
//! never fuzzy string matching. Anything short of one confident match comes
//! back with a question for the user.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::oracle::{
    ask, EntityAlternative, EntityListReply, EntityReply, Oracle, OracleCall, OracleRequest,
};

/// Below this the oracle's pick is treated as a guess.
pub const MATCH_THRESHOLD: f64 = 0.8;

const MAX_CANDIDATES: usize = 50;
const MAX_CONVERSATION_CHARS: usize = 1500;

const SINGLE_PROMPT: &str = r#"You are an ENTITY RESOLVER. Match the user's reference to one of the available entities.

RULES:
1. Only match if you are CONFIDENT (>0.8) the user means that specific entity
2. If several entities could match, return ALL candidates with your confidence for each
3. If you are not confident, say so; asking is better than guessing wrong
4. Use the conversation to understand what the user is referring to

Return ONLY a JSON object:
{
    "matched": true/false,
    "entity_id": "the exact title if matched, null otherwise",
    "confidence": 0.0-1.0,
    "reasoning": "why you chose this match or why uncertain",
    "alternatives": [{"title": "...", "confidence": 0.X}],
    "needs_clarification": true if confidence < 0.8 or several good matches,
    "clarification_prompt": "Which one did you mean: X or Y?"
}"#;

const MULTIPLE_PROMPT: &str = r#"You are an ENTITY RESOLVER. The user is referring to ONE OR MORE entities.

Identify ALL entities the user refers to. Users often say things like:
- "the X and Y scenes" (two entities)
- "the scenes about Z" (possibly several)
- "those Career scenes" (several in one group)

Return ONLY a JSON object:
{
    "entities": [
        {
            "reference": "the part of the user's words naming this entity",
            "matched_title": "exact title or null",
            "confidence": 0.0-1.0,
            "reasoning": "why this match"
        }
    ],
    "needs_clarification": true if any match is uncertain,
    "clarification_prompt": "question to ask if needed"
}"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Scene,
    Act,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Scene => "scene",
            EntityKind::Act => "act",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something the user could be referring to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityCandidate {
    pub id: String,
    pub title: String,
    /// Enclosing group shown to the oracle, e.g. a scene's act.
    #[serde(default)]
    pub group: Option<String>,
}

impl EntityCandidate {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            group: None,
        }
    }

    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolvedEntity {
    pub kind: EntityKind,
    pub entity_id: Option<String>,
    pub entity_name: Option<String>,
    pub confidence: f64,
    pub reasoning: String,
    pub alternatives: Vec<EntityAlternative>,
    pub needs_clarification: bool,
    pub clarification_prompt: Option<String>,
}

impl ResolvedEntity {
    fn unresolved(kind: EntityKind, reasoning: impl Into<String>) -> Self {
        Self {
            kind,
            entity_id: None,
            entity_name: None,
            confidence: 0.0,
            reasoning: reasoning.into(),
            alternatives: Vec::new(),
            needs_clarification: false,
            clarification_prompt: None,
        }
    }

    fn failed(kind: EntityKind, reference: &str, reasoning: String) -> Self {
        Self {
            needs_clarification: true,
            clarification_prompt: Some(format!(
                "I couldn't understand which {} you meant by '{}'. Could you be more specific?",
                kind, reference
            )),
            ..Self::unresolved(kind, reasoning)
        }
    }

    /// A single confident match to a known candidate.
    pub fn is_bound(&self) -> bool {
        self.entity_id.is_some() && !self.needs_clarification
    }

    /// What to ask the user when the match is not bound.
    pub fn question(&self, reference: &str) -> String {
        if let Some(prompt) = self
            .clarification_prompt
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
        {
            return prompt.to_string();
        }
        match self.alternatives.as_slice() {
            [] => format!(
                "I couldn't find a {} matching '{}'. Which one did you mean?",
                self.kind, reference
            ),
            alternatives => {
                let titles: Vec<&str> = alternatives.iter().map(|a| a.title.as_str()).collect();
                format!("Which {} did you mean: {}?", self.kind, titles.join(" or "))
            }
        }
    }
}

pub struct EntityResolver {
    oracle: Option<Arc<dyn Oracle>>,
}

impl EntityResolver {
    pub fn new(oracle: Option<Arc<dyn Oracle>>) -> Self {
        Self { oracle }
    }

    /// Resolve a reference to exactly one entity of `kind`.
    pub async fn resolve(
        &self,
        kind: EntityKind,
        reference: &str,
        candidates: &[EntityCandidate],
        conversation: Option<&str>,
    ) -> ResolvedEntity {
        if candidates.is_empty() {
            return ResolvedEntity::unresolved(kind, format!("No {}s available", kind));
        }
        let Some(oracle) = &self.oracle else {
            return ResolvedEntity::failed(
                kind,
                reference,
                "No oracle available for entity resolution".to_string(),
            );
        };

        let user = format!(
            "AVAILABLE {}S:\n{}\n\nRECENT CONVERSATION:\n{}\n\nUSER REFERS TO: \"{}\"\n\nWhich {} is the user referring to?",
            kind.as_str().to_uppercase(),
            candidate_list(candidates),
            conversation_tail(conversation),
            reference,
            kind
        );
        let call = OracleRequest::new(OracleCall::Entity, SINGLE_PROMPT, user);

        let reply = match ask::<EntityReply>(oracle.as_ref(), &call).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(error = %e, reference = %reference, "Entity resolution failed");
                return ResolvedEntity::failed(
                    kind,
                    reference,
                    format!("Entity resolution failed: {}", e),
                );
            }
        };

        let candidate = reply
            .entity_id
            .as_deref()
            .filter(|_| reply.matched)
            .and_then(|title| find_candidate(candidates, title));

        let needs_clarification =
            reply.needs_clarification || candidate.is_none() || reply.confidence < MATCH_THRESHOLD;

        debug!(
            reference = %reference,
            matched = candidate.is_some(),
            confidence = reply.confidence,
            needs_clarification,
            "Entity resolved"
        );

        ResolvedEntity {
            kind,
            entity_id: candidate.map(|c| c.id.clone()),
            entity_name: candidate.map(|c| c.title.clone()),
            confidence: reply.confidence,
            reasoning: reply.reasoning,
            alternatives: reply.alternatives,
            needs_clarification,
            clarification_prompt: reply.clarification_prompt,
        }
    }

    /// Resolve an utterance that may name several entities of `kind`.
    pub async fn resolve_many(
        &self,
        kind: EntityKind,
        reference: &str,
        candidates: &[EntityCandidate],
        conversation: Option<&str>,
    ) -> Vec<ResolvedEntity> {
        if candidates.is_empty() {
            return Vec::new();
        }
        let Some(oracle) = &self.oracle else {
            return vec![ResolvedEntity::failed(
                kind,
                reference,
                "No oracle available for entity resolution".to_string(),
            )];
        };

        let user = format!(
            "AVAILABLE {}S:\n{}\n\nRECENT CONVERSATION:\n{}\n\nUSER SAYS: \"{}\"\n\nHow many {}s is the user referring to, and which ones?",
            kind.as_str().to_uppercase(),
            candidate_list(candidates),
            conversation_tail(conversation),
            reference,
            kind
        );
        let call = OracleRequest::new(OracleCall::Entity, MULTIPLE_PROMPT, user);

        let reply = match ask::<EntityListReply>(oracle.as_ref(), &call).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(error = %e, reference = %reference, "Multi-entity resolution failed");
                let mut failed = ResolvedEntity::failed(
                    kind,
                    reference,
                    format!("Multi-entity resolution failed: {}", e),
                );
                failed.clarification_prompt = Some(format!(
                    "I couldn't understand which {}s you meant. Could you list them specifically?",
                    kind
                ));
                return vec![failed];
            }
        };

        reply
            .entities
            .into_iter()
            .map(|entity| {
                let candidate = entity
                    .matched_title
                    .as_deref()
                    .and_then(|title| find_candidate(candidates, title));
                ResolvedEntity {
                    kind,
                    entity_id: candidate.map(|c| c.id.clone()),
                    entity_name: candidate.map(|c| c.title.clone()),
                    confidence: entity.confidence,
                    reasoning: entity.reasoning,
                    alternatives: Vec::new(),
                    needs_clarification: reply.needs_clarification
                        || candidate.is_none()
                        || entity.confidence < MATCH_THRESHOLD,
                    clarification_prompt: reply.clarification_prompt.clone(),
                }
            })
            .collect()
    }
}

fn find_candidate<'a>(candidates: &'a [EntityCandidate], title: &str) -> Option<&'a EntityCandidate> {
    let title = title.trim().to_lowercase();
    candidates.iter().find(|c| c.title.to_lowercase() == title)
}

fn candidate_list(candidates: &[EntityCandidate]) -> String {
    candidates
        .iter()
        .take(MAX_CANDIDATES)
        .map(|c| match &c.group {
            Some(group) => format!("- \"{}\" (in {})", c.title, group),
            None => format!("- \"{}\"", c.title),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn conversation_tail(conversation: Option<&str>) -> String {
    match conversation.map(str::trim).filter(|c| !c.is_empty()) {
        Some(text) => {
            let skip = text.chars().count().saturating_sub(MAX_CONVERSATION_CHARS);
            text.chars().skip(skip).collect()
        }
        None => "No prior context".to_string(),
    }
}
