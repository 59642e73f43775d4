//! Core data models for the atomic operations pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::AtomicOpsError;
use crate::Result;

//
// ================= Taxonomy =================
//

/// Where the output of an operation goes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Destination {
    Stream,
    File,
    Process,
}

/// Who consumes the output.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Consumer {
    Human,
    Machine,
}

/// What the operation does with its target.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Semantics {
    Read,
    Interpret,
    Execute,
}

impl Destination {
    pub fn as_str(&self) -> &'static str {
        match self {
            Destination::Stream => "stream",
            Destination::File => "file",
            Destination::Process => "process",
        }
    }
}

impl Consumer {
    pub fn as_str(&self) -> &'static str {
        match self {
            Consumer::Human => "human",
            Consumer::Machine => "machine",
        }
    }
}

impl Semantics {
    pub fn as_str(&self) -> &'static str {
        match self {
            Semantics::Read => "read",
            Semantics::Interpret => "interpret",
            Semantics::Execute => "execute",
        }
    }
}

impl FromStr for Destination {
    type Err = AtomicOpsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "stream" => Ok(Destination::Stream),
            "file" => Ok(Destination::File),
            "process" => Ok(Destination::Process),
            other => Err(AtomicOpsError::ValidationError(format!(
                "unknown destination '{}'",
                other
            ))),
        }
    }
}

impl FromStr for Consumer {
    type Err = AtomicOpsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "human" => Ok(Consumer::Human),
            "machine" => Ok(Consumer::Machine),
            other => Err(AtomicOpsError::ValidationError(format!(
                "unknown consumer '{}'",
                other
            ))),
        }
    }
}

impl FromStr for Semantics {
    type Err = AtomicOpsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "read" => Ok(Semantics::Read),
            "interpret" => Ok(Semantics::Interpret),
            "execute" => Ok(Semantics::Execute),
            other => Err(AtomicOpsError::ValidationError(format!(
                "unknown semantics '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for Semantics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

//
// ================= Classification =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Classification {
    pub destination: Destination,
    pub consumer: Consumer,
    pub semantics: Semantics,
    /// Binary "safe to proceed" signal. Independent of verification confidence.
    pub confident: bool,
    pub reasoning: String,
    pub domain: Option<String>,
    pub action_hint: Option<String>,
}

impl Classification {
    pub fn new(destination: Destination, consumer: Consumer, semantics: Semantics) -> Self {
        Self {
            destination,
            consumer,
            semantics,
            confident: false,
            reasoning: String::new(),
            domain: None,
            action_hint: None,
        }
    }

    /// `destination/consumer/semantics`
    pub fn label(&self) -> String {
        format!("{}/{}/{}", self.destination, self.consumer, self.semantics)
    }

    pub fn snapshot(&self) -> ClassificationSnapshot {
        ClassificationSnapshot {
            destination: self.destination,
            consumer: self.consumer,
            semantics: self.semantics,
            confident: self.confident,
        }
    }
}

//
// ================= Status & Layers =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Classifying,
    AwaitingVerification,
    AwaitingApproval,
    Executing,
    Complete,
    Failed,
    Decomposed,
}

impl OperationStatus {
    pub const ALL: [OperationStatus; 7] = [
        OperationStatus::Classifying,
        OperationStatus::AwaitingVerification,
        OperationStatus::AwaitingApproval,
        OperationStatus::Executing,
        OperationStatus::Complete,
        OperationStatus::Failed,
        OperationStatus::Decomposed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Classifying => "classifying",
            OperationStatus::AwaitingVerification => "awaiting_verification",
            OperationStatus::AwaitingApproval => "awaiting_approval",
            OperationStatus::Executing => "executing",
            OperationStatus::Complete => "complete",
            OperationStatus::Failed => "failed",
            OperationStatus::Decomposed => "decomposed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationStatus::Complete | OperationStatus::Failed | OperationStatus::Decomposed
        )
    }

    /// Feedback may only reference operations that reached a decision point.
    pub fn accepts_feedback(&self) -> bool {
        self.is_terminal() || *self == OperationStatus::AwaitingApproval
    }
}

impl FromStr for OperationStatus {
    type Err = AtomicOpsError;

    fn from_str(s: &str) -> Result<Self> {
        OperationStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| AtomicOpsError::ValidationError(format!("unknown status '{}'", s)))
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Verification layers, declared in pipeline execution order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum VerificationLayer {
    Syntax,
    Safety,
    Semantic,
    Behavioral,
    Intent,
}

impl VerificationLayer {
    pub const ORDER: [VerificationLayer; 5] = [
        VerificationLayer::Syntax,
        VerificationLayer::Safety,
        VerificationLayer::Semantic,
        VerificationLayer::Behavioral,
        VerificationLayer::Intent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationLayer::Syntax => "syntax",
            VerificationLayer::Safety => "safety",
            VerificationLayer::Semantic => "semantic",
            VerificationLayer::Behavioral => "behavioral",
            VerificationLayer::Intent => "intent",
        }
    }

    /// Weight in the aggregate confidence.
    pub fn weight(&self) -> f64 {
        match self {
            VerificationLayer::Syntax => 0.15,
            VerificationLayer::Safety => 0.25,
            VerificationLayer::Semantic => 0.20,
            VerificationLayer::Behavioral => 0.20,
            VerificationLayer::Intent => 0.20,
        }
    }

    /// A failure in these layers halts the pipeline.
    pub fn is_blocking(&self) -> bool {
        matches!(self, VerificationLayer::Syntax | VerificationLayer::Safety)
    }
}

impl FromStr for VerificationLayer {
    type Err = AtomicOpsError;

    fn from_str(s: &str) -> Result<Self> {
        VerificationLayer::ORDER
            .into_iter()
            .find(|layer| layer.as_str() == s)
            .ok_or_else(|| AtomicOpsError::ValidationError(format!("unknown layer '{}'", s)))
    }
}

impl fmt::Display for VerificationLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

//
// ================= Verification Result =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VerificationResult {
    pub layer: VerificationLayer,
    pub passed: bool,
    pub confidence: f64,
    pub issues: Vec<String>,
    pub details: String,
    pub execution_time_ms: u64,
}

impl VerificationResult {
    pub fn pass(layer: VerificationLayer, details: impl Into<String>) -> Self {
        Self::build(layer, true, 1.0, Vec::new(), details.into())
    }

    pub fn fail(layer: VerificationLayer, issues: Vec<String>, details: impl Into<String>) -> Self {
        Self::build(layer, false, 1.0, issues, details.into())
    }

    /// Passes, but carries issues that need a human look.
    pub fn warn(
        layer: VerificationLayer,
        issues: Vec<String>,
        confidence: f64,
        details: impl Into<String>,
    ) -> Self {
        Self::build(layer, true, confidence, issues, details.into())
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = clamp_unit(confidence);
        self
    }

    fn build(
        layer: VerificationLayer,
        passed: bool,
        confidence: f64,
        issues: Vec<String>,
        details: String,
    ) -> Self {
        Self {
            layer,
            passed,
            confidence: clamp_unit(confidence),
            issues,
            details,
            execution_time_ms: 0,
        }
    }
}

pub(crate) fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

//
// ================= Execution Records =================
//

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExecutionResult {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub files_affected: Vec<String>,
    pub processes_spawned: Vec<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FileState {
    pub exists: bool,
    pub hash: Option<String>,
    pub backup_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessState {
    pub pid: u32,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateSnapshot {
    pub timestamp: DateTime<Utc>,
    pub files: BTreeMap<String, FileState>,
    pub processes: Vec<ProcessState>,
    pub system_metrics: BTreeMap<String, f64>,
}

impl StateSnapshot {
    pub fn empty() -> Self {
        Self {
            timestamp: Utc::now(),
            files: BTreeMap::new(),
            processes: Vec::new(),
            system_metrics: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UndoMethod {
    RestoreBackup,
    InverseCommand,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ReversibilityInfo {
    pub reversible: bool,
    pub method: Option<UndoMethod>,
    pub undo_commands: Vec<String>,
    /// original path → backup path
    pub backup_files: BTreeMap<String, String>,
    pub reason: String,
}

/// Everything an executor hands back for one operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionRecord {
    pub result: ExecutionResult,
    pub state_before: Option<StateSnapshot>,
    pub state_after: Option<StateSnapshot>,
    pub reversibility: Option<ReversibilityInfo>,
}

//
// ================= Operation =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub id: Uuid,
    pub user_request: String,
    pub user_id: String,
    pub classification: Option<Classification>,

    pub is_decomposed: bool,
    pub parent_id: Option<Uuid>,
    pub child_ids: Vec<Uuid>,

    pub verification_results: BTreeMap<VerificationLayer, VerificationResult>,
    pub status: OperationStatus,

    pub execution_result: Option<ExecutionResult>,
    pub state_before: Option<StateSnapshot>,
    pub state_after: Option<StateSnapshot>,
    pub reversibility: Option<ReversibilityInfo>,

    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub source_agent: String,
}

impl Operation {
    pub fn new(user_request: &str, user_id: &str, source_agent: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_request: user_request.to_string(),
            user_id: user_id.to_string(),
            classification: None,
            is_decomposed: false,
            parent_id: None,
            child_ids: Vec::new(),
            verification_results: BTreeMap::new(),
            status: OperationStatus::Classifying,
            execution_result: None,
            state_before: None,
            state_after: None,
            reversibility: None,
            created_at: Utc::now(),
            completed_at: None,
            source_agent: source_agent.to_string(),
        }
    }

    /// Attach a classification and move to `awaiting_verification`.
    pub fn classify(&mut self, classification: Classification) {
        self.classification = Some(classification);
        self.status = OperationStatus::AwaitingVerification;
    }

    /// Turn this operation into a decomposed parent of `child_ids`.
    pub fn decompose_into(&mut self, child_ids: Vec<Uuid>) {
        self.classification = None;
        self.is_decomposed = true;
        self.child_ids = child_ids;
        self.status = OperationStatus::Decomposed;
    }

    pub fn inherited_confidence(&self) -> f64 {
        match &self.classification {
            Some(c) if c.confident => 0.9,
            Some(_) => 0.3,
            None => 0.0,
        }
    }

    pub fn is_confident(&self) -> bool {
        self.classification.as_ref().is_some_and(|c| c.confident)
    }

    pub fn apply_execution(&mut self, record: ExecutionRecord) {
        self.execution_result = Some(record.result);
        self.state_before = record.state_before;
        self.state_after = record.state_after;
        self.reversibility = record.reversibility;
    }

    pub fn check_invariants(&self) -> Result<()> {
        if self.is_decomposed {
            if self.classification.is_some() {
                return Err(AtomicOpsError::ValidationError(format!(
                    "decomposed operation {} must not carry a classification",
                    self.id
                )));
            }
            if self.child_ids.is_empty() {
                return Err(AtomicOpsError::ValidationError(format!(
                    "decomposed operation {} has no children",
                    self.id
                )));
            }
        } else if !self.child_ids.is_empty() {
            return Err(AtomicOpsError::ValidationError(format!(
                "operation {} lists children but is not decomposed",
                self.id
            )));
        }
        if self.parent_id == Some(self.id) {
            return Err(AtomicOpsError::ValidationError(format!(
                "operation {} is its own parent",
                self.id
            )));
        }
        Ok(())
    }
}

//
// ================= Feedback =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackType {
    Approval,
    Rejection,
    Correction,
}

impl FeedbackType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedbackType::Approval => "approval",
            FeedbackType::Rejection => "rejection",
            FeedbackType::Correction => "correction",
        }
    }
}

impl FromStr for FeedbackType {
    type Err = AtomicOpsError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "approval" => Ok(FeedbackType::Approval),
            "rejection" => Ok(FeedbackType::Rejection),
            "correction" => Ok(FeedbackType::Correction),
            other => Err(AtomicOpsError::ValidationError(format!(
                "unknown feedback type '{}'",
                other
            ))),
        }
    }
}

/// The system's classification at the moment feedback was given.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClassificationSnapshot {
    pub destination: Destination,
    pub consumer: Consumer,
    pub semantics: Semantics,
    pub confident: bool,
}

/// Axis values supplied by the user. Unset axes keep the system's value.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CorrectedAxes {
    pub destination: Option<Destination>,
    pub consumer: Option<Consumer>,
    pub semantics: Option<Semantics>,
}

impl CorrectedAxes {
    pub fn is_empty(&self) -> bool {
        self.destination.is_none() && self.consumer.is_none() && self.semantics.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserFeedback {
    pub id: Uuid,
    pub operation_id: Uuid,
    pub user_id: String,
    pub feedback_type: FeedbackType,
    pub system_classification: Option<ClassificationSnapshot>,
    pub corrected: CorrectedAxes,
    pub correction_reasoning: Option<String>,
    pub approved: Option<bool>,
    pub time_to_decision_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl UserFeedback {
    pub fn new(operation_id: Uuid, user_id: &str, feedback_type: FeedbackType) -> Self {
        Self {
            id: Uuid::new_v4(),
            operation_id,
            user_id: user_id.to_string(),
            feedback_type,
            system_classification: None,
            corrected: CorrectedAxes::default(),
            correction_reasoning: None,
            approved: None,
            time_to_decision_ms: None,
            created_at: Utc::now(),
        }
    }
}

/// A stored correction, ready to be shown to the classifier as a counter-example.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Correction {
    pub operation_id: Uuid,
    pub user_request: String,
    pub system: (Destination, Consumer, Semantics),
    pub corrected: (Destination, Consumer, Semantics),
    pub reasoning: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Correction {
    pub fn render(&self) -> String {
        let (sd, sc, ss) = self.system;
        let (cd, cc, cs) = self.corrected;
        format!(
            "- \"{}\" was misclassified as {}/{}/{}, correct is {}/{}/{}",
            self.user_request, sd, sc, ss, cd, cc, cs
        )
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ClassificationStats {
    pub total_operations: i64,
    pub feedback_count: i64,
    pub accuracy: f64,
    pub correction_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClassificationLogEntry {
    pub id: Uuid,
    pub operation_id: Uuid,
    pub classification: Classification,
    pub model: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingClarification {
    pub id: Uuid,
    pub operation_id: Uuid,
    pub user_id: String,
    pub question: String,
    pub original_request: String,
    pub created_at: DateTime<Utc>,
}
