//! Bridge between the conversational layer and the atomic pipeline
//!
//! classify → decompose → verify → (approve) → execute, one transaction per
//! round trip. Execution itself belongs to the caller and is plugged in
//! through `OperationExecutor`; without one, verified operations are handed
//! off in `executing` and an external runner reports back through
//! `record_execution`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::{SqliteConnection, SqlitePool};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::classifier::AtomicClassifier;
use crate::config::PipelineConfig;
use crate::decomposer::AtomicDecomposer;
pub use crate::decomposer::DEFAULT_CLARIFICATION;
use crate::error::AtomicOpsError;
use crate::feedback::{FeedbackCollector, LearningAggregator};
use crate::models::{
    ClassificationStats, Consumer, CorrectedAxes, Destination, ExecutionRecord, ExecutionResult,
    Operation, OperationStatus, PendingClarification, Semantics, UserFeedback,
};
use crate::oracle::Oracle;
use crate::resolver::{EntityCandidate, EntityKind, EntityResolver, ResolvedEntity};
use crate::store::{self, db_err, OperationFilter};
use crate::verification::{
    PipelineResult, VerificationContext, VerificationMode, VerificationPipeline,
};
use crate::Result;

pub const DEFAULT_SOURCE_AGENT: &str = "cairn";

const RECENT_OPERATIONS: i64 = 5;
const NO_ENGINE: &str = "Operation approved but no execution engine available.";
const HANDED_OFF: &str = "Approved but execution not available.";
const SAFETY_WARNING: &str = "[safety]";
const APPROVAL_KEYWORDS: &[&str] = &[
    "destructive",
    "dangerous",
    "safety",
    "security",
    "execute",
    "delete",
    "remove",
    "kill",
    "process",
];

/// Caller-supplied context forwarded to classification and execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestContext {
    pub persona_context: Option<String>,
    pub conversation_context: Option<String>,
    pub memory_context: Option<String>,
}

/// Runs a verified operation. Implemented outside this crate.
#[async_trait]
pub trait OperationExecutor: Send + Sync {
    async fn execute(
        &self,
        operation: &Operation,
        context: &RequestContext,
    ) -> Result<ExecutionRecord>;
}

/// Ordered best to worst; a decomposed request reports its worst child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeOutcome {
    Completed,
    AwaitingExecution,
    AwaitingApproval,
    NeedsClarification,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct BridgeResult {
    pub operation_id: Option<Uuid>,
    pub outcome: BridgeOutcome,
    pub response: String,
    pub operations: Vec<Operation>,
    pub verification: Option<PipelineResult>,
    pub needs_approval: bool,
    pub needs_clarification: bool,
    pub clarification_prompt: Option<String>,
    pub warnings: Vec<String>,
    pub execution: Option<ExecutionResult>,
}

impl BridgeResult {
    fn new(operation_id: Option<Uuid>, outcome: BridgeOutcome, response: impl Into<String>) -> Self {
        Self {
            operation_id,
            outcome,
            response: response.into(),
            operations: Vec::new(),
            verification: None,
            needs_approval: outcome == BridgeOutcome::AwaitingApproval,
            needs_clarification: outcome == BridgeOutcome::NeedsClarification,
            clarification_prompt: None,
            warnings: Vec::new(),
            execution: None,
        }
    }
}

/// Outcome of binding an entity reference.
#[derive(Debug, Clone)]
pub enum EntityBinding {
    Bound(ResolvedEntity),
    /// The question was recorded as the user's pending clarification.
    NeedsClarification(BridgeResult),
}

/// What happened to one leaf operation.
struct LeafResult {
    outcome: BridgeOutcome,
    response: String,
    verification: Option<PipelineResult>,
    execution: Option<ExecutionResult>,
}

pub struct AtomicBridge {
    pool: SqlitePool,
    config: PipelineConfig,
    oracle: Option<Arc<dyn Oracle>>,
    classifier: Arc<AtomicClassifier>,
    decomposer: AtomicDecomposer,
    resolver: EntityResolver,
    pipeline: VerificationPipeline,
    feedback: FeedbackCollector,
    learning: LearningAggregator,
    source_agent: String,
    last_operation_id: RwLock<Option<Uuid>>,
}

impl AtomicBridge {
    pub fn new(pool: SqlitePool, config: PipelineConfig, oracle: Option<Arc<dyn Oracle>>) -> Self {
        let classifier = Arc::new(AtomicClassifier::new(oracle.clone()));
        let decomposer = AtomicDecomposer::new(classifier.clone(), oracle.clone());
        let resolver = EntityResolver::new(oracle.clone());
        let pipeline = VerificationPipeline::new(config.verification_mode);
        let learning = LearningAggregator::new(config.correction_limit);

        info!(
            oracle = oracle.as_ref().map(|o| o.model_name()).unwrap_or("none"),
            mode = %config.verification_mode,
            safety_level = config.safety_level.as_str(),
            "Atomic bridge initialized"
        );

        Self {
            pool,
            config,
            oracle,
            classifier,
            decomposer,
            resolver,
            pipeline,
            feedback: FeedbackCollector::new(),
            learning,
            source_agent: DEFAULT_SOURCE_AGENT.to_string(),
            last_operation_id: RwLock::new(None),
        }
    }

    pub fn with_source_agent(mut self, source_agent: &str) -> Self {
        self.source_agent = source_agent.to_string();
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn pipeline(&self) -> &VerificationPipeline {
        &self.pipeline
    }

    //
    // ================= Request Processing =================
    //

    pub async fn process_request(
        &self,
        user_input: &str,
        user_id: &str,
        executor: Option<&dyn OperationExecutor>,
        context: &RequestContext,
    ) -> Result<BridgeResult> {
        if user_input.trim().is_empty() {
            return Ok(BridgeResult::new(None, BridgeOutcome::Failed, "Empty request"));
        }

        let mut tx = self.pool.begin().await.map_err(db_err("Failed to begin transaction"))?;
        let result = self
            .run_request(&mut tx, user_input, user_id, executor, context)
            .await?;
        tx.commit().await.map_err(db_err("Failed to commit request"))?;

        Ok(result)
    }

    async fn run_request(
        &self,
        conn: &mut SqliteConnection,
        user_input: &str,
        user_id: &str,
        executor: Option<&dyn OperationExecutor>,
        context: &RequestContext,
    ) -> Result<BridgeResult> {
        let corrections = self
            .learning
            .get_recent_corrections(conn, Some(user_id), self.learning.limit())
            .await?;

        let recent: Vec<String> = store::list_operations(
            conn,
            &OperationFilter {
                user_id: Some(user_id.to_string()),
                limit: RECENT_OPERATIONS,
                ..Default::default()
            },
        )
        .await?
        .into_iter()
        .map(|op| op.user_request)
        .collect();

        let decomposition = self
            .decomposer
            .decompose(user_input, user_id, &self.source_agent, None, false)
            .await;

        if let Some(question) = decomposition.clarification_question() {
            let placeholder = match decomposition.operations.first() {
                Some(op) if !decomposition.decomposed => op.clone(),
                _ => self.placeholder(user_input, user_id),
            };
            return self.ask_clarification(conn, &placeholder, question).await;
        }

        let mut operations = if decomposition.decomposed {
            let tree = self
                .decomposer
                .expand_tree(
                    decomposition.operations,
                    user_id,
                    &self.source_agent,
                    self.config.max_decomposition_depth.max(1),
                )
                .await;
            if let Some(question) = tree.clarification {
                let placeholder = self.placeholder(user_input, user_id);
                return self.ask_clarification(conn, &placeholder, question).await;
            }
            tree.operations
        } else {
            decomposition.operations
        };

        // Final classification, now with corrections and memory in the prompt.
        let mut models = HashMap::new();
        for op in operations.iter_mut().filter(|op| !op.is_decomposed) {
            let outcome = self
                .classifier
                .classify(&op.user_request, &corrections, context.memory_context.as_deref())
                .await;
            op.classify(outcome.classification);
            models.insert(op.id, outcome.model);
        }

        for op in &operations {
            store::create_operation(conn, op).await?;
            if let (Some(classification), Some(model)) = (&op.classification, models.get(&op.id)) {
                store::log_classification(conn, op.id, classification, model).await?;
            }
        }

        let verification_context = self.verification_context(user_id, recent, context);
        let order = leaf_order(&operations);

        let mut leaves = Vec::with_capacity(order.len());
        for index in order {
            let leaf = self
                .process_leaf(conn, &mut operations[index], &verification_context, executor, context)
                .await?;
            leaves.push(leaf);
        }

        let root_id = operations.first().map(|op| op.id);
        let decomposed = operations.first().is_some_and(|op| op.is_decomposed);

        let result = if !decomposed && leaves.len() == 1 {
            let leaf = leaves.remove(0);
            let mut result = BridgeResult::new(root_id, leaf.outcome, leaf.response);
            result.warnings = leaf
                .verification
                .as_ref()
                .map(|v| v.warnings.clone())
                .unwrap_or_default();
            result.verification = leaf.verification;
            result.execution = leaf.execution;
            result
        } else {
            let outcome = leaves
                .iter()
                .map(|leaf| leaf.outcome)
                .max()
                .unwrap_or(BridgeOutcome::Failed);
            let response = if leaves.is_empty() {
                "No operations completed.".to_string()
            } else {
                leaves
                    .iter()
                    .map(|leaf| leaf.response.as_str())
                    .collect::<Vec<_>>()
                    .join("\n\n")
            };
            let mut result = BridgeResult::new(root_id, outcome, response);
            result.needs_approval = leaves
                .iter()
                .any(|leaf| leaf.outcome == BridgeOutcome::AwaitingApproval);
            result.warnings = leaves
                .iter()
                .filter_map(|leaf| leaf.verification.as_ref())
                .flat_map(|v| v.warnings.iter().cloned())
                .collect();
            result
        };

        info!(
            operation_id = ?root_id,
            operations = operations.len(),
            outcome = ?result.outcome,
            "Request processed"
        );

        Ok(BridgeResult {
            operations,
            ..result
        })
    }

    /// Unclassified stand-in for a request that is waiting on an answer.
    fn placeholder(&self, user_input: &str, user_id: &str) -> Operation {
        let mut placeholder = Operation::new(user_input, user_id, &self.source_agent);
        placeholder.status = OperationStatus::AwaitingVerification;
        placeholder
    }

    async fn ask_clarification(
        &self,
        conn: &mut SqliteConnection,
        placeholder: &Operation,
        question: String,
    ) -> Result<BridgeResult> {
        store::create_operation(conn, placeholder).await?;
        store::store_clarification(conn, placeholder.id, &placeholder.user_id, &question).await?;

        info!(operation_id = %placeholder.id, "Clarification requested");

        let mut result =
            BridgeResult::new(Some(placeholder.id), BridgeOutcome::NeedsClarification, &question);
        result.clarification_prompt = Some(question);
        result.operations = vec![placeholder.clone()];
        Ok(result)
    }

    async fn process_leaf(
        &self,
        conn: &mut SqliteConnection,
        operation: &mut Operation,
        verification_context: &VerificationContext,
        executor: Option<&dyn OperationExecutor>,
        context: &RequestContext,
    ) -> Result<LeafResult> {
        let mode = self.mode_for(operation);
        let verification = self
            .pipeline
            .verify_in_mode(operation, verification_context, mode)
            .await;

        for result in verification.results.values() {
            store::store_verification(conn, operation.id, result).await?;
        }
        operation.verification_results = verification.results.clone();

        if !verification.passed {
            set_status(conn, operation, OperationStatus::Failed).await?;
            return Ok(LeafResult {
                outcome: BridgeOutcome::Failed,
                response: failure_response(&verification),
                verification: Some(verification),
                execution: None,
            });
        }

        if needs_user_approval(operation, &verification) {
            set_status(conn, operation, OperationStatus::AwaitingApproval).await?;
            self.feedback.start_session(operation).await;
            self.feedback.present_for_approval(operation.id).await;
            return Ok(LeafResult {
                outcome: BridgeOutcome::AwaitingApproval,
                response: approval_request(operation, &verification),
                verification: Some(verification),
                execution: None,
            });
        }

        let mut leaf = match executor {
            Some(executor) => self.execute(conn, operation, executor, context).await?,
            None => {
                // Handed off; the runner reports through `record_execution`.
                set_status(conn, operation, OperationStatus::Executing).await?;
                LeafResult {
                    outcome: BridgeOutcome::AwaitingExecution,
                    response: NO_ENGINE.to_string(),
                    verification: None,
                    execution: None,
                }
            }
        };
        leaf.verification = Some(verification);
        Ok(leaf)
    }

    async fn execute(
        &self,
        conn: &mut SqliteConnection,
        operation: &mut Operation,
        executor: &dyn OperationExecutor,
        context: &RequestContext,
    ) -> Result<LeafResult> {
        set_status(conn, operation, OperationStatus::Executing).await?;

        let record = match executor.execute(operation, context).await {
            Ok(record) => record,
            Err(e) => {
                warn!(operation_id = %operation.id, error = %e, "Execution failed");
                set_status(conn, operation, OperationStatus::Failed).await?;
                return Ok(LeafResult {
                    outcome: BridgeOutcome::Failed,
                    response: format!("Execution failed: {}", e),
                    verification: None,
                    execution: None,
                });
            }
        };

        self.finish_execution(conn, operation, record).await
    }

    async fn finish_execution(
        &self,
        conn: &mut SqliteConnection,
        operation: &mut Operation,
        record: ExecutionRecord,
    ) -> Result<LeafResult> {
        store::store_execution(conn, operation.id, &record).await?;
        let succeeded = record.result.success;
        let response = if succeeded {
            record.result.stdout.clone()
        } else {
            record.result.stderr.clone()
        };
        let execution = record.result.clone();
        operation.apply_execution(record);

        let (status, outcome) = if succeeded {
            (OperationStatus::Complete, BridgeOutcome::Completed)
        } else {
            (OperationStatus::Failed, BridgeOutcome::Failed)
        };
        set_status(conn, operation, status).await?;

        if succeeded {
            *self.last_operation_id.write().await = Some(operation.id);
        }

        debug!(
            operation_id = %operation.id,
            success = succeeded,
            duration_ms = execution.duration_ms,
            "Operation executed"
        );

        Ok(LeafResult {
            outcome,
            response,
            verification: None,
            execution: Some(execution),
        })
    }

    fn verification_context(
        &self,
        user_id: &str,
        recent: Vec<String>,
        context: &RequestContext,
    ) -> VerificationContext {
        let mut verification_context = VerificationContext::new(user_id, &self.source_agent)
            .with_safety_level(self.config.safety_level)
            .with_oracle(self.oracle.clone())
            .with_recent_operations(recent);
        verification_context.blocked_commands = self.config.blocked_commands.clone();
        verification_context.allowed_paths = self.config.allowed_paths.clone();
        verification_context.additional_context = context.conversation_context.clone();
        verification_context
    }

    /// Display-only requests get the fast pipeline.
    fn mode_for(&self, operation: &Operation) -> VerificationMode {
        match &operation.classification {
            Some(c)
                if c.destination == Destination::Stream
                    && matches!(c.semantics, Semantics::Read | Semantics::Interpret) =>
            {
                VerificationMode::Fast
            }
            _ => self.config.verification_mode,
        }
    }

    //
    // ================= Decisions =================
    //

    pub async fn approve_operation(
        &self,
        operation_id: Uuid,
        executor: Option<&dyn OperationExecutor>,
        context: &RequestContext,
    ) -> Result<BridgeResult> {
        let mut tx = self.pool.begin().await.map_err(db_err("Failed to begin transaction"))?;

        let mut operation = store::require_operation(&mut tx, operation_id).await?;
        if operation.status != OperationStatus::AwaitingApproval {
            return Err(AtomicOpsError::InvalidState(format!(
                "Operation {} is {}, not awaiting approval",
                operation_id, operation.status
            )));
        }

        self.feedback.collect_approval(&mut tx, &operation, true).await?;
        self.feedback.end_session(operation_id).await;

        let leaf = match executor {
            Some(executor) => self.execute(&mut tx, &mut operation, executor, context).await?,
            None => {
                set_status(&mut tx, &mut operation, OperationStatus::Executing).await?;
                LeafResult {
                    outcome: BridgeOutcome::AwaitingExecution,
                    response: HANDED_OFF.to_string(),
                    verification: None,
                    execution: None,
                }
            }
        };

        tx.commit().await.map_err(db_err("Failed to commit approval"))?;

        info!(operation_id = %operation_id, outcome = ?leaf.outcome, "Operation approved");

        let mut result = BridgeResult::new(Some(operation_id), leaf.outcome, leaf.response);
        result.execution = leaf.execution;
        result.operations = vec![operation];
        Ok(result)
    }

    /// Record a rejection. Only an operation still awaiting approval is
    /// moved to `failed`; a finished one keeps its status.
    pub async fn reject_operation(&self, operation_id: Uuid) -> Result<UserFeedback> {
        let mut tx = self.pool.begin().await.map_err(db_err("Failed to begin transaction"))?;

        let mut operation = store::require_operation(&mut tx, operation_id).await?;
        let feedback = self.feedback.collect_approval(&mut tx, &operation, false).await?;
        self.feedback.end_session(operation_id).await;
        if operation.status == OperationStatus::AwaitingApproval {
            set_status(&mut tx, &mut operation, OperationStatus::Failed).await?;
        }

        tx.commit().await.map_err(db_err("Failed to commit rejection"))?;

        info!(operation_id = %operation_id, status = %operation.status, "Operation rejected");
        Ok(feedback)
    }

    /// Report the result of an operation that was handed off without an executor.
    pub async fn record_execution(
        &self,
        operation_id: Uuid,
        record: ExecutionRecord,
    ) -> Result<BridgeResult> {
        let mut tx = self.pool.begin().await.map_err(db_err("Failed to begin transaction"))?;

        let mut operation = store::require_operation(&mut tx, operation_id).await?;
        if operation.status != OperationStatus::Executing {
            return Err(AtomicOpsError::InvalidState(format!(
                "Operation {} is {}, not executing",
                operation_id, operation.status
            )));
        }

        let leaf = self.finish_execution(&mut tx, &mut operation, record).await?;
        tx.commit().await.map_err(db_err("Failed to commit execution"))?;

        info!(operation_id = %operation_id, outcome = ?leaf.outcome, "External execution recorded");

        let mut result = BridgeResult::new(Some(operation_id), leaf.outcome, leaf.response);
        result.execution = leaf.execution;
        result.operations = vec![operation];
        Ok(result)
    }

    pub async fn record_user_correction(
        &self,
        operation_id: Uuid,
        corrected: CorrectedAxes,
        reasoning: Option<String>,
    ) -> Result<UserFeedback> {
        let mut tx = self.pool.begin().await.map_err(db_err("Failed to begin transaction"))?;

        let operation = store::require_operation(&mut tx, operation_id).await?;
        let feedback = self
            .feedback
            .collect_correction(&mut tx, &operation, corrected, reasoning)
            .await?;

        tx.commit().await.map_err(db_err("Failed to commit correction"))?;
        Ok(feedback)
    }

    //
    // ================= Clarifications =================
    //

    pub async fn pending_clarification(&self, user_id: &str) -> Result<Option<PendingClarification>> {
        let mut conn = self.pool.acquire().await.map_err(db_err("Failed to acquire connection"))?;
        store::get_pending_clarification(&mut conn, user_id).await
    }

    /// Resolve the user's open question and rerun the request with the answer appended.
    pub async fn answer_clarification(
        &self,
        user_id: &str,
        response: &str,
        executor: Option<&dyn OperationExecutor>,
        context: &RequestContext,
    ) -> Result<BridgeResult> {
        let mut tx = self.pool.begin().await.map_err(db_err("Failed to begin transaction"))?;

        let pending = store::get_pending_clarification(&mut tx, user_id)
            .await?
            .ok_or_else(|| {
                AtomicOpsError::InvalidState(format!("No pending clarification for {}", user_id))
            })?;

        store::resolve_clarification(&mut tx, pending.id, response).await?;
        store::update_operation_status(&mut tx, pending.operation_id, OperationStatus::Failed).await?;

        let clarified = format!("{} ({})", pending.original_request, response.trim());
        info!(
            clarification_id = %pending.id,
            operation_id = %pending.operation_id,
            "Clarification answered"
        );

        let result = self
            .run_request(&mut tx, &clarified, user_id, executor, context)
            .await?;
        tx.commit().await.map_err(db_err("Failed to commit clarification"))?;

        Ok(result)
    }

    /// Bind `reference` in `request` to one of `candidates`.
    ///
    /// An unsure match is never guessed: the question is stored as the
    /// user's pending clarification for `request`, and answering it reruns
    /// the request through `answer_clarification`.
    pub async fn resolve_entity(
        &self,
        request: &str,
        user_id: &str,
        kind: EntityKind,
        reference: &str,
        candidates: &[EntityCandidate],
        conversation_context: Option<&str>,
    ) -> Result<EntityBinding> {
        let resolved = self
            .resolver
            .resolve(kind, reference, candidates, conversation_context)
            .await;
        if resolved.is_bound() {
            return Ok(EntityBinding::Bound(resolved));
        }

        let question = resolved.question(reference);
        let placeholder = self.placeholder(request, user_id);

        let mut tx = self.pool.begin().await.map_err(db_err("Failed to begin transaction"))?;
        let result = self.ask_clarification(&mut tx, &placeholder, question).await?;
        tx.commit().await.map_err(db_err("Failed to commit clarification"))?;

        Ok(EntityBinding::NeedsClarification(result))
    }

    //
    // ================= Queries =================
    //

    pub async fn get_operation(&self, operation_id: Uuid) -> Result<Option<Operation>> {
        let mut conn = self.pool.acquire().await.map_err(db_err("Failed to acquire connection"))?;
        store::get_operation(&mut conn, operation_id).await
    }

    /// Operations still waiting on verification or on the user.
    pub async fn get_pending_operations(&self, user_id: &str) -> Result<Vec<Operation>> {
        let mut conn = self.pool.acquire().await.map_err(db_err("Failed to acquire connection"))?;
        store::get_operations_by_status(
            &mut conn,
            user_id,
            &[
                OperationStatus::AwaitingVerification,
                OperationStatus::AwaitingApproval,
            ],
        )
        .await
    }

    pub async fn stats(&self, user_id: &str) -> Result<ClassificationStats> {
        let mut conn = self.pool.acquire().await.map_err(db_err("Failed to acquire connection"))?;
        self.learning.compute_metrics(&mut conn, user_id).await
    }

    pub async fn few_shot_lines(&self, user_id: Option<&str>) -> Result<Vec<String>> {
        let mut conn = self.pool.acquire().await.map_err(db_err("Failed to acquire connection"))?;
        self.learning.few_shot_lines(&mut conn, user_id).await
    }

    pub async fn last_operation_id(&self) -> Option<Uuid> {
        *self.last_operation_id.read().await
    }
}

async fn set_status(
    conn: &mut SqliteConnection,
    operation: &mut Operation,
    status: OperationStatus,
) -> Result<()> {
    store::update_operation_status(conn, operation.id, status).await?;
    operation.status = status;
    Ok(())
}

/// Leaves in depth-first child order, so responses read in request order.
fn leaf_order(operations: &[Operation]) -> Vec<usize> {
    if operations.is_empty() {
        return Vec::new();
    }
    let index: HashMap<Uuid, usize> = operations
        .iter()
        .enumerate()
        .map(|(i, op)| (op.id, i))
        .collect();

    let mut order = Vec::new();
    let mut stack = vec![0];
    while let Some(i) = stack.pop() {
        let op = &operations[i];
        if op.is_decomposed {
            stack.extend(op.child_ids.iter().rev().filter_map(|id| index.get(id).copied()));
        } else {
            order.push(i);
        }
    }
    order
}

pub fn needs_user_approval(operation: &Operation, verification: &PipelineResult) -> bool {
    if !verification.passed {
        return false;
    }
    let Some(c) = &operation.classification else {
        return false;
    };
    let confidence = operation.inherited_confidence();

    // Safety findings always reach the user, whatever the classification.
    if verification.status == OperationStatus::AwaitingApproval
        && verification.warnings.iter().any(|w| w.starts_with(SAFETY_WARNING))
    {
        return true;
    }

    let low_risk = matches!(c.semantics, Semantics::Read | Semantics::Interpret)
        && c.destination == Destination::Stream
        && c.consumer == Consumer::Human;
    if low_risk {
        return confidence < 0.5;
    }

    if c.semantics == Semantics::Execute
        && matches!(c.destination, Destination::File | Destination::Process)
    {
        return true;
    }

    let alarming = verification.warnings.iter().any(|w| {
        let lowered = w.to_lowercase();
        APPROVAL_KEYWORDS.iter().any(|k| lowered.contains(k))
    });

    alarming || confidence < 0.7
}

fn failure_response(verification: &PipelineResult) -> String {
    let Some(layer) = verification.blocking_layer else {
        return "I can't perform that operation due to safety checks.".to_string();
    };
    let reason = verification.results.get(&layer).and_then(|r| {
        r.issues
            .first()
            .cloned()
            .or_else(|| (!r.details.is_empty()).then(|| r.details.clone()))
    });
    match reason {
        Some(reason) => format!(
            "I can't perform that operation. {} verification failed: {}",
            layer, reason
        ),
        None => format!("I can't perform that operation. {} verification failed.", layer),
    }
}

fn approval_request(operation: &Operation, verification: &PipelineResult) -> String {
    let mut parts = vec![
        "I'd like to confirm before proceeding:".to_string(),
        format!("\nRequest: {}", operation.user_request),
    ];
    if let Some(c) = &operation.classification {
        parts.push(format!("This will {} data ({}).", c.semantics, c.destination));
    }
    if !verification.warnings.is_empty() {
        parts.push("\nNotes:".to_string());
        parts.extend(verification.warnings.iter().map(|w| format!("  - {}", w)));
    }
    parts.push("\nShall I proceed? (yes/no)".to_string());
    parts.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Classification, VerificationLayer};
    use crate::oracle::{MockOracle, OracleCall};
    use tokio_test::assert_ok;

    const READ_REPLY: &str = r#"{"destination": "stream", "consumer": "human", "semantics": "read", "confident": true, "reasoning": "display"}"#;
    const SAVE_REPLY: &str = r#"{"destination": "file", "consumer": "human", "semantics": "execute", "confident": true, "reasoning": "saves a note"}"#;
    const NO_SPLIT: &str = r#"{"needs_decomposition": false, "confident": true}"#;

    struct EchoExecutor;

    #[async_trait]
    impl OperationExecutor for EchoExecutor {
        async fn execute(
            &self,
            operation: &Operation,
            _context: &RequestContext,
        ) -> Result<ExecutionRecord> {
            Ok(ExecutionRecord {
                result: ExecutionResult {
                    success: true,
                    exit_code: Some(0),
                    stdout: format!("ran: {}", operation.user_request),
                    ..Default::default()
                },
                state_before: None,
                state_after: None,
                reversibility: None,
            })
        }
    }

    async fn create_test_bridge(oracle: Option<MockOracle>) -> AtomicBridge {
        let pool = store::connect_in_memory().await.unwrap();
        let oracle = oracle.map(|o| Arc::new(o) as Arc<dyn Oracle>);
        AtomicBridge::new(pool, PipelineConfig::default(), oracle)
    }

    #[tokio::test]
    async fn test_empty_request() {
        let bridge = create_test_bridge(None).await;
        let result = bridge
            .process_request("   ", "u1", None, &RequestContext::default())
            .await
            .unwrap();

        assert_eq!(result.outcome, BridgeOutcome::Failed);
        assert_eq!(result.response, "Empty request");
        assert!(result.operation_id.is_none());
        assert_eq!(bridge.stats("u1").await.unwrap().total_operations, 0);
    }

    #[tokio::test]
    async fn test_blocked_request_states_reason() {
        let bridge = create_test_bridge(None).await;
        let result = bridge
            .process_request("rm -rf /", "u1", None, &RequestContext::default())
            .await
            .unwrap();

        assert_eq!(result.outcome, BridgeOutcome::Failed);
        assert!(result
            .response
            .starts_with("I can't perform that operation. safety verification failed: BLOCKED"));
        let verification = result.verification.unwrap();
        assert_eq!(verification.blocking_layer, Some(VerificationLayer::Safety));

        let stored = bridge
            .get_operation(result.operation_id.unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, OperationStatus::Failed);
        assert_eq!(stored.verification_results.len(), 2);
    }

    #[tokio::test]
    async fn test_read_request_with_and_without_engine() {
        let oracle = MockOracle::new().reply(OracleCall::Classification, READ_REPLY);
        let bridge = create_test_bridge(Some(oracle)).await;
        let context = RequestContext::default();

        let result = bridge
            .process_request("show memory usage", "u1", None, &context)
            .await
            .unwrap();
        assert_eq!(result.outcome, BridgeOutcome::AwaitingExecution);
        assert_eq!(result.response, NO_ENGINE);
        assert!(!result.needs_approval);
        assert_eq!(
            result.verification.as_ref().unwrap().layers_run(),
            vec![VerificationLayer::Syntax, VerificationLayer::Safety]
        );
        assert!(bridge.last_operation_id().await.is_none());

        let result = bridge
            .process_request("show memory usage", "u1", Some(&EchoExecutor), &context)
            .await
            .unwrap();
        assert_eq!(result.outcome, BridgeOutcome::Completed);
        assert_eq!(result.response, "ran: show memory usage");
        assert_eq!(bridge.last_operation_id().await, result.operation_id);

        let stored = bridge
            .get_operation(result.operation_id.unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, OperationStatus::Complete);
        assert!(stored.execution_result.is_some_and(|r| r.success));
    }

    #[tokio::test]
    async fn test_execute_request_needs_approval_then_runs() {
        let oracle = MockOracle::new().reply(OracleCall::Classification, SAVE_REPLY);
        let bridge = create_test_bridge(Some(oracle)).await;
        let context = RequestContext::default();

        let result = bridge
            .process_request("save a note about groceries", "u1", None, &context)
            .await
            .unwrap();
        assert_eq!(result.outcome, BridgeOutcome::AwaitingApproval);
        assert!(result.needs_approval);
        assert!(result.response.starts_with("I'd like to confirm before proceeding:"));
        assert!(result.response.contains("\nRequest: save a note about groceries"));
        assert!(result.response.contains("This will execute data (file)."));
        assert!(result.response.ends_with("Shall I proceed? (yes/no)"));

        let id = result.operation_id.unwrap();
        let pending = bridge.get_pending_operations("u1").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id);

        let approved = bridge
            .approve_operation(id, Some(&EchoExecutor), &context)
            .await
            .unwrap();
        assert_eq!(approved.outcome, BridgeOutcome::Completed);
        assert_eq!(approved.response, "ran: save a note about groceries");

        let stats = bridge.stats("u1").await.unwrap();
        assert_eq!(stats.feedback_count, 1);
        assert_eq!(stats.accuracy, 1.0);

        let err = bridge.approve_operation(id, None, &context).await.unwrap_err();
        assert!(matches!(err, AtomicOpsError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_sensitive_read_still_needs_approval() {
        let oracle = MockOracle::new().reply(OracleCall::Classification, READ_REPLY);
        let bridge = create_test_bridge(Some(oracle)).await;

        let result = bridge
            .process_request(
                "show the contents of .aws/credentials",
                "u1",
                Some(&EchoExecutor),
                &RequestContext::default(),
            )
            .await
            .unwrap();

        assert_eq!(result.outcome, BridgeOutcome::AwaitingApproval);
        assert!(result
            .response
            .contains("[safety] Sensitive access: AWS credentials"));
        assert!(result.execution.is_none());
        assert!(bridge.last_operation_id().await.is_none());
    }

    #[tokio::test]
    async fn test_handoff_without_executor() {
        let oracle = MockOracle::new()
            .reply_when(OracleCall::Classification, "save a note", SAVE_REPLY)
            .reply(OracleCall::Classification, READ_REPLY);
        let bridge = create_test_bridge(Some(oracle)).await;
        let context = RequestContext::default();

        // Verified and needing no approval: handed straight off.
        let read = bridge
            .process_request("show memory usage", "u1", None, &context)
            .await
            .unwrap();
        let read_id = read.operation_id.unwrap();
        let stored = bridge.get_operation(read_id).await.unwrap().unwrap();
        assert_eq!(stored.status, OperationStatus::Executing);
        assert!(bridge.get_pending_operations("u1").await.unwrap().is_empty());

        let finished = bridge
            .record_execution(
                read_id,
                ExecutionRecord {
                    result: ExecutionResult {
                        success: true,
                        stdout: "4 GiB free".into(),
                        ..Default::default()
                    },
                    state_before: None,
                    state_after: None,
                    reversibility: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(finished.outcome, BridgeOutcome::Completed);
        assert_eq!(finished.response, "4 GiB free");
        let stored = bridge.get_operation(read_id).await.unwrap().unwrap();
        assert_eq!(stored.status, OperationStatus::Complete);

        // Needing approval: pending until approved, then handed off.
        let save = bridge
            .process_request("save a note about groceries", "u1", None, &context)
            .await
            .unwrap();
        let save_id = save.operation_id.unwrap();
        let pending = bridge.get_pending_operations("u1").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].status, OperationStatus::AwaitingApproval);

        let approved = bridge.approve_operation(save_id, None, &context).await.unwrap();
        assert_eq!(approved.outcome, BridgeOutcome::AwaitingExecution);
        let stored = bridge.get_operation(save_id).await.unwrap().unwrap();
        assert_eq!(stored.status, OperationStatus::Executing);
        assert!(bridge.get_pending_operations("u1").await.unwrap().is_empty());

        let failed = bridge
            .record_execution(
                save_id,
                ExecutionRecord {
                    result: ExecutionResult {
                        success: false,
                        stderr: "disk full".into(),
                        ..Default::default()
                    },
                    state_before: None,
                    state_after: None,
                    reversibility: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(failed.outcome, BridgeOutcome::Failed);
        let stored = bridge.get_operation(save_id).await.unwrap().unwrap();
        assert_eq!(stored.status, OperationStatus::Failed);

        let err = bridge
            .record_execution(read_id, ExecutionRecord {
                result: ExecutionResult::default(),
                state_before: None,
                state_after: None,
                reversibility: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AtomicOpsError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_reject_after_completion_keeps_status() {
        let oracle = MockOracle::new().reply(OracleCall::Classification, READ_REPLY);
        let bridge = create_test_bridge(Some(oracle)).await;

        let result = bridge
            .process_request(
                "show memory usage",
                "u1",
                Some(&EchoExecutor),
                &RequestContext::default(),
            )
            .await
            .unwrap();
        let id = result.operation_id.unwrap();

        let feedback = bridge.reject_operation(id).await.unwrap();
        assert_eq!(feedback.approved, Some(false));

        let stored = bridge.get_operation(id).await.unwrap().unwrap();
        assert_eq!(stored.status, OperationStatus::Complete);

        let err = bridge
            .approve_operation(id, Some(&EchoExecutor), &RequestContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AtomicOpsError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_reject_marks_failed() {
        let oracle = MockOracle::new().reply(OracleCall::Classification, SAVE_REPLY);
        let bridge = create_test_bridge(Some(oracle)).await;

        let result = bridge
            .process_request("save a note about groceries", "u1", None, &RequestContext::default())
            .await
            .unwrap();
        let id = result.operation_id.unwrap();

        let feedback = bridge.reject_operation(id).await.unwrap();
        assert_eq!(feedback.approved, Some(false));

        let stored = bridge.get_operation(id).await.unwrap().unwrap();
        assert_eq!(stored.status, OperationStatus::Failed);
        assert!(stored.completed_at.is_some());
        assert!(bridge.get_pending_operations("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clarification_round_trip() {
        let oracle = MockOracle::new()
            .reply_when(OracleCall::Decomposition, "(the job-search", NO_SPLIT)
            .reply_when(
                OracleCall::Decomposition,
                "move those two scenes",
                r#"{"needs_decomposition": false, "confident": false, "needs_clarification": true,
                    "clarification_prompt": "Which two scenes do you mean?"}"#,
            )
            .reply(OracleCall::Classification, SAVE_REPLY);
        let bridge = create_test_bridge(Some(oracle)).await;
        let context = RequestContext::default();

        let result = bridge
            .process_request("move those two scenes to Career", "u1", None, &context)
            .await
            .unwrap();
        assert_eq!(result.outcome, BridgeOutcome::NeedsClarification);
        assert!(result.needs_clarification);
        assert_eq!(result.response, "Which two scenes do you mean?");

        let pending = bridge.pending_clarification("u1").await.unwrap().unwrap();
        assert_eq!(pending.original_request, "move those two scenes to Career");
        assert_eq!(pending.operation_id, result.operation_id.unwrap());

        let answered = bridge
            .answer_clarification("u1", " the job-search and career scenes ", None, &context)
            .await
            .unwrap();
        assert_ne!(answered.outcome, BridgeOutcome::NeedsClarification);
        assert_eq!(
            answered.operations[0].user_request,
            "move those two scenes to Career (the job-search and career scenes)"
        );
        assert!(bridge.pending_clarification("u1").await.unwrap().is_none());

        let placeholder = bridge.get_operation(pending.operation_id).await.unwrap().unwrap();
        assert_eq!(placeholder.status, OperationStatus::Failed);

        let err = bridge
            .answer_clarification("u1", "again", None, &context)
            .await
            .unwrap_err();
        assert!(matches!(err, AtomicOpsError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_ambiguous_part_of_split_asks_first() {
        let oracle = MockOracle::new()
            .reply_when(
                OracleCall::Decomposition,
                "\"tidy the thing and show cpu\"",
                r#"{"needs_decomposition": true, "sub_requests": ["tidy the thing", "show cpu"], "confident": true}"#,
            )
            .reply_when(
                OracleCall::Decomposition,
                "\"tidy the thing\"",
                r#"{"needs_decomposition": false, "confident": false, "needs_clarification": true,
                    "clarification_prompt": "Which thing do you mean?"}"#,
            )
            .reply(OracleCall::Decomposition, NO_SPLIT)
            .reply(OracleCall::Classification, READ_REPLY);
        let bridge = create_test_bridge(Some(oracle)).await;

        let result = bridge
            .process_request(
                "tidy the thing and show cpu",
                "u1",
                Some(&EchoExecutor),
                &RequestContext::default(),
            )
            .await
            .unwrap();

        assert_eq!(result.outcome, BridgeOutcome::NeedsClarification);
        assert_eq!(result.response, "Which thing do you mean?");
        assert!(result.execution.is_none());
        assert!(bridge.last_operation_id().await.is_none());

        let pending = bridge.pending_clarification("u1").await.unwrap().unwrap();
        assert_eq!(pending.original_request, "tidy the thing and show cpu");
        assert_eq!(Some(pending.operation_id), result.operation_id);
    }

    #[tokio::test]
    async fn test_unsure_split_with_question_asks() {
        let oracle = MockOracle::new()
            .reply_when(
                OracleCall::Decomposition,
                "\"tidy the garage and show cpu\"",
                r#"{"needs_decomposition": true, "sub_requests": ["tidy the garage", "show cpu"],
                    "confident": true, "clarification_prompt": "The garage or the shed?"}"#,
            )
            .reply(OracleCall::Decomposition, NO_SPLIT)
            .reply_when(
                OracleCall::Classification,
                "tidy the garage",
                r#"{"destination": "file", "consumer": "human", "semantics": "execute", "confident": false}"#,
            )
            .reply(OracleCall::Classification, READ_REPLY);
        let bridge = create_test_bridge(Some(oracle)).await;

        let result = bridge
            .process_request(
                "tidy the garage and show cpu",
                "u1",
                Some(&EchoExecutor),
                &RequestContext::default(),
            )
            .await
            .unwrap();

        assert_eq!(result.outcome, BridgeOutcome::NeedsClarification);
        assert_eq!(result.clarification_prompt.as_deref(), Some("The garage or the shed?"));
        assert!(bridge.last_operation_id().await.is_none());
    }

    #[tokio::test]
    async fn test_unsure_entity_becomes_clarification() {
        let candidates = vec![
            EntityCandidate::new("s1", "Job search"),
            EntityCandidate::new("s2", "Career goals"),
        ];
        let oracle = MockOracle::new().reply(
            OracleCall::Entity,
            r#"{"matched": false, "confidence": 0.4, "needs_clarification": true,
                "clarification_prompt": "Job search or Career goals?"}"#,
        );
        let bridge = create_test_bridge(Some(oracle)).await;

        let binding = bridge
            .resolve_entity(
                "move the career scene to archive",
                "u1",
                EntityKind::Scene,
                "the career scene",
                &candidates,
                None,
            )
            .await
            .unwrap();
        let EntityBinding::NeedsClarification(result) = binding else {
            panic!("expected a clarification");
        };
        assert_eq!(result.response, "Job search or Career goals?");

        let pending = bridge.pending_clarification("u1").await.unwrap().unwrap();
        assert_eq!(pending.original_request, "move the career scene to archive");

        let oracle = MockOracle::new().reply(
            OracleCall::Entity,
            r#"{"matched": true, "entity_id": "Career goals", "confidence": 0.92}"#,
        );
        let bridge = create_test_bridge(Some(oracle)).await;
        let binding = bridge
            .resolve_entity(
                "move the career goals scene to archive",
                "u1",
                EntityKind::Scene,
                "the career goals scene",
                &candidates,
                None,
            )
            .await
            .unwrap();
        assert!(matches!(
            binding,
            EntityBinding::Bound(ref entity) if entity.entity_id.as_deref() == Some("s2")
        ));
        assert!(bridge.pending_clarification("u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_decomposed_request_joins_responses() {
        let oracle = MockOracle::new()
            .reply_when(
                OracleCall::Decomposition,
                "\"show memory and show cpu\"",
                r#"{"needs_decomposition": true, "sub_requests": ["show memory", "show cpu"], "confident": true}"#,
            )
            .reply(OracleCall::Decomposition, NO_SPLIT)
            .reply(OracleCall::Classification, READ_REPLY);
        let bridge = create_test_bridge(Some(oracle)).await;

        let result = bridge
            .process_request(
                "show memory and show cpu",
                "u1",
                Some(&EchoExecutor),
                &RequestContext::default(),
            )
            .await
            .unwrap();

        assert_eq!(result.outcome, BridgeOutcome::Completed);
        assert_eq!(result.response, "ran: show memory\n\nran: show cpu");
        assert_eq!(result.operations.len(), 3);
        assert!(result.verification.is_none());

        let parent = bridge
            .get_operation(result.operation_id.unwrap())
            .await
            .unwrap()
            .unwrap();
        assert!(parent.is_decomposed);
        assert_eq!(parent.status, OperationStatus::Decomposed);
        assert_eq!(parent.child_ids.len(), 2);
    }

    #[tokio::test]
    async fn test_correction_reaches_learning_loop() {
        let oracle = MockOracle::new().reply(OracleCall::Classification, READ_REPLY);
        let bridge = create_test_bridge(Some(oracle)).await;

        let result = bridge
            .process_request(
                "show memory usage",
                "u1",
                Some(&EchoExecutor),
                &RequestContext::default(),
            )
            .await
            .unwrap();
        let id = result.operation_id.unwrap();

        let corrected = CorrectedAxes {
            semantics: Some(Semantics::Interpret),
            ..Default::default()
        };
        assert_ok!(
            bridge
                .record_user_correction(id, corrected, Some("wanted an explanation".into()))
                .await
        );

        let lines = bridge.few_shot_lines(Some("u1")).await.unwrap();
        assert_eq!(
            lines,
            vec![
                "- \"show memory usage\" was misclassified as stream/human/read, correct is stream/human/interpret"
            ]
        );

        let stats = bridge.stats("u1").await.unwrap();
        assert_eq!(stats.total_operations, 1);
        assert_eq!(stats.correction_rate, 1.0);
    }

    #[test]
    fn test_approval_rules() {
        let mut op = Operation::new("show memory", "u1", "cairn");
        op.classify(Classification::new(
            Destination::Stream,
            Consumer::Human,
            Semantics::Read,
        ));
        let verification = PipelineResult {
            passed: true,
            status: OperationStatus::Executing,
            results: Default::default(),
            blocking_layer: None,
            halted: false,
            overall_confidence: 1.0,
            total_time_ms: 0,
            warnings: Vec::new(),
        };

        // Unconfident display request.
        assert!(needs_user_approval(&op, &verification));

        if let Some(c) = op.classification.as_mut() {
            c.confident = true;
        }
        assert!(!needs_user_approval(&op, &verification));

        if let Some(c) = op.classification.as_mut() {
            c.destination = Destination::File;
        }
        let mut warned = verification.clone();
        warned.warnings = vec!["[behavioral] Resource-intensive: Direct disk operation".into()];
        assert!(!needs_user_approval(&op, &warned));
        warned.warnings = vec!["[safety] Sensitive: process listing".into()];
        assert!(needs_user_approval(&op, &warned));

        // Safety findings on a confident display request.
        if let Some(c) = op.classification.as_mut() {
            c.destination = Destination::Stream;
        }
        let mut sensitive = verification.clone();
        sensitive.status = OperationStatus::AwaitingApproval;
        sensitive.warnings = vec!["[safety] Sensitive access: SSH directory".into()];
        assert!(needs_user_approval(&op, &sensitive));
        sensitive.warnings = vec!["[semantic] Action 'show' suggests read".into()];
        assert!(!needs_user_approval(&op, &sensitive));

        let mut failed = verification;
        failed.passed = false;
        assert!(!needs_user_approval(&op, &failed));
    }
}
