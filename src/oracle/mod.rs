//! Language-model oracle contract
//!
//! Four call sites consult the oracle: classification, decomposition,
//! intent verification and entity resolution. Each sends a system + user text pair and expects a
//! single JSON object back. The reply is parsed into the call site's typed
//! contract here, so a malformed or out-of-taxonomy reply surfaces as
//! `InvalidOracleResponse` and never reaches the pipeline as data.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::config::PipelineConfig;
use crate::error::AtomicOpsError;
use crate::models::{Classification, Consumer, Destination, Semantics};
use crate::Result;

pub mod gemini;
pub use gemini::GeminiOracle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OracleCall {
    Classification,
    Decomposition,
    Intent,
    Entity,
}

#[derive(Debug, Clone)]
pub struct OracleRequest {
    pub call: OracleCall,
    pub system: String,
    pub user: String,
}

impl OracleRequest {
    pub fn new(call: OracleCall, system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            call,
            system: system.into(),
            user: user.into(),
        }
    }
}

/// Structured-reply language model.
#[async_trait]
pub trait Oracle: Send + Sync {
    /// Name recorded in the classification log.
    fn model_name(&self) -> &str;

    /// Return the raw text of a single JSON object.
    async fn complete(&self, request: &OracleRequest) -> Result<String>;
}

/// The configured oracle, or `None` when no API key is set.
pub fn from_config(config: &PipelineConfig) -> Result<Option<Arc<dyn Oracle>>> {
    let Some(api_key) = &config.gemini_api_key else {
        info!("GEMINI_API_KEY not set, running with keyword fallback only");
        return Ok(None);
    };
    let oracle = GeminiOracle::new(api_key.clone(), config.gemini_model.clone())?;
    info!(model = %config.gemini_model, "Gemini oracle enabled");
    Ok(Some(Arc::new(oracle)))
}

/// A typed reply with checks serde cannot express.
pub trait OracleReply: DeserializeOwned {
    fn validate(&self) -> Result<()> {
        Ok(())
    }
}

/// Send `request` and parse the reply into `T`.
pub async fn ask<T: OracleReply>(oracle: &dyn Oracle, request: &OracleRequest) -> Result<T> {
    let raw = oracle.complete(request).await?;
    let reply: T = parse_reply(&raw)?;
    reply.validate()?;
    Ok(reply)
}

/// Strip markdown fences and any prose around the outermost JSON object.
pub fn parse_reply<T: DeserializeOwned>(raw: &str) -> Result<T> {
    let cleaned = raw
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    let body = match (cleaned.find('{'), cleaned.rfind('}')) {
        (Some(start), Some(end)) if start < end => &cleaned[start..=end],
        _ => cleaned,
    };

    serde_json::from_str(body).map_err(|e| {
        debug!(error = %e, raw = %raw, "Oracle reply rejected");
        AtomicOpsError::InvalidOracleResponse(format!("{} | raw={}", e, raw))
    })
}

//
// ================= Reply Contracts =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationReply {
    pub destination: Destination,
    pub consumer: Consumer,
    pub semantics: Semantics,
    #[serde(default)]
    pub confident: bool,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub action_hint: Option<String>,
}

impl OracleReply for ClassificationReply {}

impl ClassificationReply {
    pub fn into_classification(self) -> Classification {
        Classification {
            destination: self.destination,
            consumer: self.consumer,
            semantics: self.semantics,
            confident: self.confident,
            reasoning: self.reasoning,
            domain: non_empty(self.domain),
            action_hint: non_empty(self.action_hint),
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_lowercase())
        .filter(|v| !v.is_empty() && v != "null" && v != "none")
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DecompositionReply {
    #[serde(default)]
    pub needs_decomposition: bool,
    #[serde(default)]
    pub operation_count: Option<u32>,
    #[serde(default)]
    pub sub_requests: Vec<String>,
    #[serde(default)]
    pub confident: bool,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub needs_clarification: bool,
    #[serde(default)]
    pub clarification_prompt: Option<String>,
}

impl OracleReply for DecompositionReply {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentReply {
    pub aligned: bool,
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: String,
}

impl OracleReply for IntentReply {
    fn validate(&self) -> Result<()> {
        check_confidence("intent", self.confidence)
    }
}

fn default_entity_confidence() -> f64 {
    0.5
}

fn check_confidence(what: &str, confidence: f64) -> Result<()> {
    if (0.0..=1.0).contains(&confidence) {
        Ok(())
    } else {
        Err(AtomicOpsError::InvalidOracleResponse(format!(
            "{} confidence {} outside [0, 1]",
            what, confidence
        )))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityAlternative {
    pub title: String,
    #[serde(default = "default_entity_confidence")]
    pub confidence: f64,
}

/// One reference matched against a candidate list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityReply {
    #[serde(default)]
    pub matched: bool,
    /// Title of the matched candidate, as the oracle wrote it.
    #[serde(default)]
    pub entity_id: Option<String>,
    #[serde(default = "default_entity_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub alternatives: Vec<EntityAlternative>,
    #[serde(default)]
    pub needs_clarification: bool,
    #[serde(default)]
    pub clarification_prompt: Option<String>,
}

impl OracleReply for EntityReply {
    fn validate(&self) -> Result<()> {
        check_confidence("entity", self.confidence)?;
        for alternative in &self.alternatives {
            check_confidence("alternative", alternative.confidence)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityReference {
    #[serde(default)]
    pub reference: String,
    #[serde(default)]
    pub matched_title: Option<String>,
    #[serde(default = "default_entity_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: String,
}

/// Several references found in one utterance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityListReply {
    #[serde(default)]
    pub entities: Vec<EntityReference>,
    #[serde(default)]
    pub needs_clarification: bool,
    #[serde(default)]
    pub clarification_prompt: Option<String>,
}

impl OracleReply for EntityListReply {
    fn validate(&self) -> Result<()> {
        for entity in &self.entities {
            check_confidence("entity", entity.confidence)?;
        }
        Ok(())
    }
}

//
// ================= Mock Oracle =================
//

enum ScriptedReply {
    Text(String),
    Fail(String),
}

struct ScriptedRule {
    call: OracleCall,
    needle: Option<String>,
    reply: ScriptedReply,
}

/// Scripted oracle for development & testing.
///
/// Rules are checked in insertion order; the first rule whose call kind
/// matches and whose needle (if any) occurs in the user prompt wins.
pub struct MockOracle {
    model: String,
    rules: Vec<ScriptedRule>,
    calls: Mutex<Vec<OracleCall>>,
}

impl MockOracle {
    pub fn new() -> Self {
        Self {
            model: "mock-oracle".to_string(),
            rules: Vec::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn reply(mut self, call: OracleCall, text: impl Into<String>) -> Self {
        self.rules.push(ScriptedRule {
            call,
            needle: None,
            reply: ScriptedReply::Text(text.into()),
        });
        self
    }

    pub fn reply_when(
        mut self,
        call: OracleCall,
        needle: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        self.rules.push(ScriptedRule {
            call,
            needle: Some(needle.into()),
            reply: ScriptedReply::Text(text.into()),
        });
        self
    }

    pub fn fail(mut self, call: OracleCall, message: impl Into<String>) -> Self {
        self.rules.push(ScriptedRule {
            call,
            needle: None,
            reply: ScriptedReply::Fail(message.into()),
        });
        self
    }

    /// Call kinds received so far, in order.
    pub fn calls(&self) -> Vec<OracleCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

impl Default for MockOracle {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Oracle for MockOracle {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &OracleRequest) -> Result<String> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(request.call);
        }

        let rule = self.rules.iter().find(|rule| {
            rule.call == request.call
                && rule
                    .needle
                    .as_deref()
                    .map_or(true, |needle| request.user.contains(needle))
        });

        match rule.map(|r| &r.reply) {
            Some(ScriptedReply::Text(text)) => Ok(text.clone()),
            Some(ScriptedReply::Fail(message)) => Err(AtomicOpsError::OracleError(message.clone())),
            None => Err(AtomicOpsError::OracleError(format!(
                "no scripted reply for {:?}",
                request.call
            ))),
        }
    }
}
