//! Feedback collection and the learning loop
//!
//! Approvals, rejections and corrections are recorded against operations.
//! Corrections come back out as few-shot counter-examples for the
//! classifier; nothing is trained.

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::error::AtomicOpsError;
use crate::models::{
    ClassificationStats, CorrectedAxes, Correction, FeedbackType, Operation, UserFeedback,
};
use crate::store;
use crate::Result;

/// Decision-latency tracking for one operation.
#[derive(Debug, Clone)]
pub struct FeedbackSession {
    pub operation_id: Uuid,
    pub user_id: String,
    pub started_at: DateTime<Utc>,
    pub presented_at: Option<DateTime<Utc>>,
    pub decided_at: Option<DateTime<Utc>>,
}

impl FeedbackSession {
    fn new(operation: &Operation) -> Self {
        Self {
            operation_id: operation.id,
            user_id: operation.user_id.clone(),
            started_at: Utc::now(),
            presented_at: None,
            decided_at: None,
        }
    }
}

//
// ================= Collector =================
//

#[derive(Default)]
pub struct FeedbackCollector {
    sessions: RwLock<HashMap<Uuid, FeedbackSession>>,
}

impl FeedbackCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn start_session(&self, operation: &Operation) -> FeedbackSession {
        let session = FeedbackSession::new(operation);
        self.sessions
            .write()
            .await
            .insert(operation.id, session.clone());
        session
    }

    pub async fn get_session(&self, operation_id: Uuid) -> Option<FeedbackSession> {
        self.sessions.read().await.get(&operation_id).cloned()
    }

    pub async fn end_session(&self, operation_id: Uuid) -> Option<FeedbackSession> {
        self.sessions.write().await.remove(&operation_id)
    }

    /// Mark the moment the operation was shown to the user for a decision.
    pub async fn present_for_approval(&self, operation_id: Uuid) {
        if let Some(session) = self.sessions.write().await.get_mut(&operation_id) {
            session.presented_at = Some(Utc::now());
        }
    }

    /// Record an approval or rejection. Latency is measured from
    /// `present_for_approval` when a session exists.
    pub async fn collect_approval(
        &self,
        conn: &mut SqliteConnection,
        operation: &Operation,
        approved: bool,
    ) -> Result<UserFeedback> {
        ensure_accepts_feedback(operation)?;

        let time_to_decision_ms = {
            let mut sessions = self.sessions.write().await;
            sessions.get_mut(&operation.id).and_then(|session| {
                let decided = Utc::now();
                session.decided_at = Some(decided);
                session
                    .presented_at
                    .map(|presented| (decided - presented).num_milliseconds())
            })
        };

        let feedback_type = if approved {
            FeedbackType::Approval
        } else {
            FeedbackType::Rejection
        };
        let mut feedback = UserFeedback::new(operation.id, &operation.user_id, feedback_type);
        feedback.approved = Some(approved);
        feedback.time_to_decision_ms = time_to_decision_ms;
        feedback.system_classification = operation.classification.as_ref().map(|c| c.snapshot());

        store::store_feedback(conn, &feedback).await?;

        info!(
            operation_id = %operation.id,
            approved,
            time_to_decision_ms = ?time_to_decision_ms,
            "Approval feedback recorded"
        );
        Ok(feedback)
    }

    /// Record a classification correction.
    pub async fn collect_correction(
        &self,
        conn: &mut SqliteConnection,
        operation: &Operation,
        corrected: CorrectedAxes,
        reasoning: Option<String>,
    ) -> Result<UserFeedback> {
        ensure_accepts_feedback(operation)?;

        if corrected.is_empty() {
            return Err(AtomicOpsError::ValidationError(
                "A correction must change at least one axis".to_string(),
            ));
        }

        let mut feedback =
            UserFeedback::new(operation.id, &operation.user_id, FeedbackType::Correction);
        feedback.system_classification = operation.classification.as_ref().map(|c| c.snapshot());
        feedback.corrected = corrected;
        feedback.correction_reasoning = reasoning.filter(|r| !r.trim().is_empty());

        store::store_feedback(conn, &feedback).await?;

        info!(operation_id = %operation.id, "Correction feedback recorded");
        Ok(feedback)
    }
}

fn ensure_accepts_feedback(operation: &Operation) -> Result<()> {
    if operation.status.accepts_feedback() {
        Ok(())
    } else {
        Err(AtomicOpsError::InvalidState(format!(
            "Operation {} is {} and cannot take feedback yet",
            operation.id, operation.status
        )))
    }
}

//
// ================= Learning =================
//

/// Read side of the loop: recent corrections and per-user ratios.
pub struct LearningAggregator {
    limit: usize,
}

impl LearningAggregator {
    pub fn new(limit: usize) -> Self {
        Self { limit }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub async fn get_recent_corrections(
        &self,
        conn: &mut SqliteConnection,
        user_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Correction>> {
        store::get_recent_corrections(conn, user_id, limit as i64).await
    }

    /// The rendered lines the classifier's few-shot block would contain.
    pub async fn few_shot_lines(
        &self,
        conn: &mut SqliteConnection,
        user_id: Option<&str>,
    ) -> Result<Vec<String>> {
        let corrections = self.get_recent_corrections(conn, user_id, self.limit).await?;
        Ok(corrections.iter().map(Correction::render).collect())
    }

    pub async fn compute_metrics(
        &self,
        conn: &mut SqliteConnection,
        user_id: &str,
    ) -> Result<ClassificationStats> {
        store::get_classification_stats(conn, user_id).await
    }
}

impl Default for LearningAggregator {
    fn default() -> Self {
        Self::new(5)
    }
}
