//! Operation store
//!
//! Thin CRUD over the SQLite schema. Every function takes a bare
//! `&mut SqliteConnection`; none of them begins or commits a transaction.
//! Callers wrap a full round trip in `pool.begin()` / `tx.commit()` and pass
//! `&mut *tx`, so a failure half-way leaves no partial operation graph.

use chrono::Utc;
use serde::de::DeserializeOwned;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection, SqlitePool};
use std::collections::BTreeMap;
use std::str::FromStr;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::AtomicOpsError;
use crate::models::{
    Classification, ClassificationLogEntry, ClassificationSnapshot, ClassificationStats,
    CorrectedAxes, Correction, Consumer, Destination, ExecutionRecord, ExecutionResult,
    FeedbackType, Operation, OperationStatus, PendingClarification, Semantics, UserFeedback,
    VerificationLayer, VerificationResult,
};
use crate::Result;

pub mod schema;
pub use schema::{init_schema, schema_version, SCHEMA_VERSION};

/// Filter for `list_operations`. Unset fields do not constrain.
#[derive(Debug, Clone)]
pub struct OperationFilter {
    pub user_id: Option<String>,
    pub status: Option<OperationStatus>,
    pub source_agent: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

impl Default for OperationFilter {
    fn default() -> Self {
        Self {
            user_id: None,
            status: None,
            source_agent: None,
            limit: 100,
            offset: 0,
        }
    }
}

//
// ================= Connection =================
//

/// Open a pool and bring the schema up to date.
pub async fn connect(database_url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)
        .map_err(db_err("Invalid database URL"))?
        .create_if_missing(true)
        .foreign_keys(true);

    // Each connection to an in-memory database is its own database.
    let pool_options = if database_url.contains(":memory:") {
        SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(5)
    };

    let pool = pool_options
        .connect_with(options)
        .await
        .map_err(db_err("Failed to connect to database"))?;

    let mut tx = pool.begin().await.map_err(db_err("Failed to begin schema transaction"))?;
    init_schema(&mut *tx).await?;
    tx.commit().await.map_err(db_err("Failed to commit schema"))?;

    info!(database_url = %database_url, version = SCHEMA_VERSION, "Operation store ready");
    Ok(pool)
}

pub async fn connect_in_memory() -> Result<SqlitePool> {
    connect("sqlite::memory:").await
}

//
// ================= Operations =================
//

pub async fn create_operation(conn: &mut SqliteConnection, op: &Operation) -> Result<()> {
    op.check_invariants()?;

    let c = op.classification.as_ref();
    sqlx::query(
        r#"
        INSERT INTO operations
          (id, user_request, user_id, destination, consumer, semantics, domain, action_hint,
           classification_confident, classification_reasoning, is_decomposed, parent_id,
           child_ids, status, source_agent, created_at, completed_at)
        VALUES
          (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(op.id.to_string())
    .bind(&op.user_request)
    .bind(&op.user_id)
    .bind(c.map(|c| c.destination.as_str()))
    .bind(c.map(|c| c.consumer.as_str()))
    .bind(c.map(|c| c.semantics.as_str()))
    .bind(c.and_then(|c| c.domain.clone()))
    .bind(c.and_then(|c| c.action_hint.clone()))
    .bind(c.is_some_and(|c| c.confident))
    .bind(c.map(|c| c.reasoning.clone()))
    .bind(op.is_decomposed)
    .bind(op.parent_id.map(|id| id.to_string()))
    .bind(serde_json::to_string(&op.child_ids)?)
    .bind(op.status.as_str())
    .bind(&op.source_agent)
    .bind(op.created_at)
    .bind(op.completed_at)
    .execute(&mut *conn)
    .await
    .map_err(db_err("Failed to insert operation"))?;

    debug!(operation_id = %op.id, status = %op.status, "Operation stored");
    Ok(())
}

/// Load an operation with its verification results and latest execution record.
pub async fn get_operation(conn: &mut SqliteConnection, id: Uuid) -> Result<Option<Operation>> {
    let row = sqlx::query("SELECT * FROM operations WHERE id = ?")
        .bind(id.to_string())
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_err("Failed to load operation"))?;

    let Some(row) = row else {
        return Ok(None);
    };

    let mut op = row_to_operation(&row)?;
    op.verification_results = get_verification_results(conn, id).await?;
    if let Some(record) = get_execution(conn, id).await? {
        op.apply_execution(record);
    }
    Ok(Some(op))
}

/// Like `get_operation`, but a missing id is an error.
pub async fn require_operation(conn: &mut SqliteConnection, id: Uuid) -> Result<Operation> {
    get_operation(conn, id)
        .await?
        .ok_or(AtomicOpsError::OperationNotFound(id))
}

/// Set the status; `complete` and `failed` also stamp `completed_at`.
pub async fn update_operation_status(
    conn: &mut SqliteConnection,
    id: Uuid,
    status: OperationStatus,
) -> Result<()> {
    let completed_at = matches!(status, OperationStatus::Complete | OperationStatus::Failed)
        .then(Utc::now);

    let result = sqlx::query(
        "UPDATE operations SET status = ?, completed_at = COALESCE(?, completed_at) WHERE id = ?",
    )
    .bind(status.as_str())
    .bind(completed_at)
    .bind(id.to_string())
    .execute(&mut *conn)
    .await
    .map_err(db_err("Failed to update operation status"))?;

    if result.rows_affected() == 0 {
        return Err(AtomicOpsError::OperationNotFound(id));
    }
    Ok(())
}

pub async fn update_operation_classification(
    conn: &mut SqliteConnection,
    id: Uuid,
    classification: &Classification,
) -> Result<()> {
    let result = sqlx::query(
        r#"
        UPDATE operations
        SET destination = ?, consumer = ?, semantics = ?, domain = ?, action_hint = ?,
            classification_confident = ?, classification_reasoning = ?
        WHERE id = ? AND is_decomposed = 0
        "#,
    )
    .bind(classification.destination.as_str())
    .bind(classification.consumer.as_str())
    .bind(classification.semantics.as_str())
    .bind(&classification.domain)
    .bind(&classification.action_hint)
    .bind(classification.confident)
    .bind(&classification.reasoning)
    .bind(id.to_string())
    .execute(&mut *conn)
    .await
    .map_err(db_err("Failed to update operation classification"))?;

    if result.rows_affected() == 0 {
        return Err(AtomicOpsError::OperationNotFound(id));
    }
    Ok(())
}

/// Newest first.
pub async fn list_operations(
    conn: &mut SqliteConnection,
    filter: &OperationFilter,
) -> Result<Vec<Operation>> {
    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT * FROM operations WHERE 1 = 1");
    if let Some(user_id) = &filter.user_id {
        qb.push(" AND user_id = ").push_bind(user_id.clone());
    }
    if let Some(status) = filter.status {
        qb.push(" AND status = ").push_bind(status.as_str());
    }
    if let Some(agent) = &filter.source_agent {
        qb.push(" AND source_agent = ").push_bind(agent.clone());
    }
    qb.push(" ORDER BY created_at DESC, rowid DESC LIMIT ")
        .push_bind(filter.limit)
        .push(" OFFSET ")
        .push_bind(filter.offset);

    let rows = qb
        .build()
        .fetch_all(&mut *conn)
        .await
        .map_err(db_err("Failed to list operations"))?;

    rows.iter().map(row_to_operation).collect()
}

/// Oldest first, so pending work is handled in arrival order.
pub async fn get_operations_by_status(
    conn: &mut SqliteConnection,
    user_id: &str,
    statuses: &[OperationStatus],
) -> Result<Vec<Operation>> {
    if statuses.is_empty() {
        return Ok(Vec::new());
    }

    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT * FROM operations WHERE user_id = ");
    qb.push_bind(user_id.to_string());
    qb.push(" AND status IN (");
    let mut separated = qb.separated(", ");
    for status in statuses {
        separated.push_bind(status.as_str());
    }
    separated.push_unseparated(") ORDER BY created_at ASC, rowid ASC");

    let rows = qb
        .build()
        .fetch_all(&mut *conn)
        .await
        .map_err(db_err("Failed to load operations by status"))?;

    rows.iter().map(row_to_operation).collect()
}

fn row_to_operation(row: &SqliteRow) -> Result<Operation> {
    let destination: Option<Destination> = parse_opt(row, "destination")?;
    let consumer: Option<Consumer> = parse_opt(row, "consumer")?;
    let semantics: Option<Semantics> = parse_opt(row, "semantics")?;

    let classification = match (destination, consumer, semantics) {
        (Some(destination), Some(consumer), Some(semantics)) => Some(Classification {
            destination,
            consumer,
            semantics,
            confident: col(row, "classification_confident")?,
            reasoning: col::<Option<String>>(row, "classification_reasoning")?.unwrap_or_default(),
            domain: col(row, "domain")?,
            action_hint: col(row, "action_hint")?,
        }),
        _ => None,
    };

    let parent_id: Option<String> = col(row, "parent_id")?;
    let child_ids: String = col(row, "child_ids")?;
    let status: String = col(row, "status")?;

    Ok(Operation {
        id: parse_uuid(row, "id")?,
        user_request: col(row, "user_request")?,
        user_id: col(row, "user_id")?,
        classification,
        is_decomposed: col(row, "is_decomposed")?,
        parent_id: parent_id.as_deref().map(Uuid::parse_str).transpose()?,
        child_ids: serde_json::from_str(&child_ids)?,
        verification_results: BTreeMap::new(),
        status: status.parse()?,
        execution_result: None,
        state_before: None,
        state_after: None,
        reversibility: None,
        created_at: col(row, "created_at")?,
        completed_at: col(row, "completed_at")?,
        source_agent: col(row, "source_agent")?,
    })
}

//
// ================= Classification Log =================
//

/// Append one classification attempt to the audit log.
pub async fn log_classification(
    conn: &mut SqliteConnection,
    operation_id: Uuid,
    classification: &Classification,
    model: &str,
) -> Result<Uuid> {
    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO classification_log
          (id, operation_id, destination, consumer, semantics, domain, action_hint,
           confident, reasoning, model, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(id.to_string())
    .bind(operation_id.to_string())
    .bind(classification.destination.as_str())
    .bind(classification.consumer.as_str())
    .bind(classification.semantics.as_str())
    .bind(&classification.domain)
    .bind(&classification.action_hint)
    .bind(classification.confident)
    .bind(&classification.reasoning)
    .bind(model)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await
    .map_err(db_err("Failed to log classification"))?;

    Ok(id)
}

pub async fn get_classification_log(
    conn: &mut SqliteConnection,
    operation_id: Uuid,
) -> Result<Vec<ClassificationLogEntry>> {
    let rows = sqlx::query(
        "SELECT * FROM classification_log WHERE operation_id = ? ORDER BY created_at ASC, rowid ASC",
    )
    .bind(operation_id.to_string())
    .fetch_all(&mut *conn)
    .await
    .map_err(db_err("Failed to load classification log"))?;

    rows.iter()
        .map(|row| -> Result<ClassificationLogEntry> {
            Ok(ClassificationLogEntry {
                id: parse_uuid(row, "id")?,
                operation_id: parse_uuid(row, "operation_id")?,
                classification: Classification {
                    destination: parse_col(row, "destination")?,
                    consumer: parse_col(row, "consumer")?,
                    semantics: parse_col(row, "semantics")?,
                    confident: col(row, "confident")?,
                    reasoning: col::<Option<String>>(row, "reasoning")?.unwrap_or_default(),
                    domain: col(row, "domain")?,
                    action_hint: col(row, "action_hint")?,
                },
                model: col(row, "model")?,
                created_at: col(row, "created_at")?,
            })
        })
        .collect()
}

//
// ================= Verification =================
//

/// One row per layer per operation; re-verifying a layer replaces its row.
pub async fn store_verification(
    conn: &mut SqliteConnection,
    operation_id: Uuid,
    result: &VerificationResult,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO operation_verification
          (id, operation_id, layer, passed, confidence, issues_json, details, execution_time_ms, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (operation_id, layer) DO UPDATE SET
          passed = excluded.passed,
          confidence = excluded.confidence,
          issues_json = excluded.issues_json,
          details = excluded.details,
          execution_time_ms = excluded.execution_time_ms,
          created_at = excluded.created_at
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(operation_id.to_string())
    .bind(result.layer.as_str())
    .bind(result.passed)
    .bind(result.confidence)
    .bind(serde_json::to_string(&result.issues)?)
    .bind(&result.details)
    .bind(result.execution_time_ms as i64)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await
    .map_err(db_err("Failed to store verification result"))?;

    Ok(())
}

pub async fn get_verification_results(
    conn: &mut SqliteConnection,
    operation_id: Uuid,
) -> Result<BTreeMap<VerificationLayer, VerificationResult>> {
    let rows = sqlx::query("SELECT * FROM operation_verification WHERE operation_id = ?")
        .bind(operation_id.to_string())
        .fetch_all(&mut *conn)
        .await
        .map_err(db_err("Failed to load verification results"))?;

    let mut results = BTreeMap::new();
    for row in &rows {
        let layer: VerificationLayer = parse_col(row, "layer")?;
        let elapsed: i64 = col(row, "execution_time_ms")?;
        results.insert(
            layer,
            VerificationResult {
                layer,
                passed: col(row, "passed")?,
                confidence: col(row, "confidence")?,
                issues: json_col(row, "issues_json")?,
                details: col::<Option<String>>(row, "details")?.unwrap_or_default(),
                execution_time_ms: elapsed.max(0) as u64,
            },
        );
    }
    Ok(results)
}

//
// ================= Execution =================
//

pub async fn store_execution(
    conn: &mut SqliteConnection,
    operation_id: Uuid,
    record: &ExecutionRecord,
) -> Result<Uuid> {
    let id = Uuid::new_v4();
    let result = &record.result;

    sqlx::query(
        r#"
        INSERT INTO operation_execution
          (id, operation_id, success, exit_code, stdout, stderr, duration_ms, files_affected,
           processes_spawned, state_before, state_after, reversibility, executed_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(id.to_string())
    .bind(operation_id.to_string())
    .bind(result.success)
    .bind(result.exit_code)
    .bind(&result.stdout)
    .bind(&result.stderr)
    .bind(result.duration_ms as i64)
    .bind(serde_json::to_string(&result.files_affected)?)
    .bind(serde_json::to_string(&result.processes_spawned)?)
    .bind(to_json_opt(&record.state_before)?)
    .bind(to_json_opt(&record.state_after)?)
    .bind(to_json_opt(&record.reversibility)?)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await
    .map_err(db_err("Failed to store execution record"))?;

    Ok(id)
}

/// Most recent execution record for an operation.
pub async fn get_execution(
    conn: &mut SqliteConnection,
    operation_id: Uuid,
) -> Result<Option<ExecutionRecord>> {
    let row = sqlx::query(
        "SELECT * FROM operation_execution WHERE operation_id = ? ORDER BY executed_at DESC, rowid DESC LIMIT 1",
    )
    .bind(operation_id.to_string())
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_err("Failed to load execution record"))?;

    let Some(row) = row else {
        return Ok(None);
    };

    let duration: i64 = col(&row, "duration_ms")?;
    Ok(Some(ExecutionRecord {
        result: ExecutionResult {
            success: col(&row, "success")?,
            exit_code: col(&row, "exit_code")?,
            stdout: col::<Option<String>>(&row, "stdout")?.unwrap_or_default(),
            stderr: col::<Option<String>>(&row, "stderr")?.unwrap_or_default(),
            duration_ms: duration.max(0) as u64,
            files_affected: json_col(&row, "files_affected")?,
            processes_spawned: json_col(&row, "processes_spawned")?,
        },
        state_before: json_col_opt(&row, "state_before")?,
        state_after: json_col_opt(&row, "state_after")?,
        reversibility: json_col_opt(&row, "reversibility")?,
    }))
}

//
// ================= Feedback =================
//

pub async fn store_feedback(conn: &mut SqliteConnection, feedback: &UserFeedback) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO user_feedback
          (id, operation_id, user_id, feedback_type, system_classification,
           user_corrected_destination, user_corrected_consumer, user_corrected_semantics,
           correction_reasoning, approved, time_to_decision_ms, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(feedback.id.to_string())
    .bind(feedback.operation_id.to_string())
    .bind(&feedback.user_id)
    .bind(feedback.feedback_type.as_str())
    .bind(to_json_opt(&feedback.system_classification)?)
    .bind(feedback.corrected.destination.map(|d| d.as_str()))
    .bind(feedback.corrected.consumer.map(|c| c.as_str()))
    .bind(feedback.corrected.semantics.map(|s| s.as_str()))
    .bind(&feedback.correction_reasoning)
    .bind(feedback.approved)
    .bind(feedback.time_to_decision_ms)
    .bind(feedback.created_at)
    .execute(&mut *conn)
    .await
    .map_err(db_err("Failed to store feedback"))?;

    debug!(
        feedback_id = %feedback.id,
        operation_id = %feedback.operation_id,
        feedback_type = feedback.feedback_type.as_str(),
        "Feedback stored"
    );
    Ok(())
}

pub async fn get_feedback_for_operation(
    conn: &mut SqliteConnection,
    operation_id: Uuid,
) -> Result<Vec<UserFeedback>> {
    let rows = sqlx::query(
        "SELECT * FROM user_feedback WHERE operation_id = ? ORDER BY created_at ASC, rowid ASC",
    )
    .bind(operation_id.to_string())
    .fetch_all(&mut *conn)
    .await
    .map_err(db_err("Failed to load feedback"))?;

    rows.iter()
        .map(|row| -> Result<UserFeedback> {
            Ok(UserFeedback {
                id: parse_uuid(row, "id")?,
                operation_id: parse_uuid(row, "operation_id")?,
                user_id: col(row, "user_id")?,
                feedback_type: parse_col(row, "feedback_type")?,
                system_classification: json_col_opt(row, "system_classification")?,
                corrected: CorrectedAxes {
                    destination: parse_opt(row, "user_corrected_destination")?,
                    consumer: parse_opt(row, "user_corrected_consumer")?,
                    semantics: parse_opt(row, "user_corrected_semantics")?,
                },
                correction_reasoning: col(row, "correction_reasoning")?,
                approved: col(row, "approved")?,
                time_to_decision_ms: col(row, "time_to_decision_ms")?,
                created_at: col(row, "created_at")?,
            })
        })
        .collect()
}

/// Most recent corrections, newest first, from the `classification_history` view.
///
/// The system side comes from the snapshot taken when the correction was
/// recorded, falling back to the operation's stored classification.
pub async fn get_recent_corrections(
    conn: &mut SqliteConnection,
    user_id: Option<&str>,
    limit: i64,
) -> Result<Vec<Correction>> {
    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
        "SELECT * FROM classification_history WHERE feedback_type = 'correction'",
    );
    if let Some(user_id) = user_id {
        qb.push(" AND feedback_user_id = ").push_bind(user_id.to_string());
    }
    qb.push(" ORDER BY feedback_at DESC, feedback_seq DESC LIMIT ")
        .push_bind(limit);

    let rows = qb
        .build()
        .fetch_all(&mut *conn)
        .await
        .map_err(db_err("Failed to load recent corrections"))?;

    let mut corrections = Vec::with_capacity(rows.len());
    for row in &rows {
        let snapshot: Option<ClassificationSnapshot> = json_col_opt(row, "system_classification")?;
        let system = match snapshot {
            Some(s) => (s.destination, s.consumer, s.semantics),
            None => {
                let stored = (
                    parse_opt::<Destination>(row, "system_destination")?,
                    parse_opt::<Consumer>(row, "system_consumer")?,
                    parse_opt::<Semantics>(row, "system_semantics")?,
                );
                match stored {
                    (Some(d), Some(c), Some(s)) => (d, c, s),
                    // Nothing to contrast the correction with.
                    _ => continue,
                }
            }
        };

        let corrected = (
            parse_opt::<Destination>(row, "user_corrected_destination")?.unwrap_or(system.0),
            parse_opt::<Consumer>(row, "user_corrected_consumer")?.unwrap_or(system.1),
            parse_opt::<Semantics>(row, "user_corrected_semantics")?.unwrap_or(system.2),
        );

        corrections.push(Correction {
            operation_id: parse_uuid(row, "operation_id")?,
            user_request: col(row, "user_request")?,
            system,
            corrected,
            reasoning: col(row, "correction_reasoning")?,
            created_at: col(row, "feedback_at")?,
        });
    }

    Ok(corrections)
}

/// Approval and correction ratios over a user's operations.
pub async fn get_classification_stats(
    conn: &mut SqliteConnection,
    user_id: &str,
) -> Result<ClassificationStats> {
    let row = sqlx::query("SELECT COUNT(*) AS total FROM operations WHERE user_id = ?")
        .bind(user_id)
        .fetch_one(&mut *conn)
        .await
        .map_err(db_err("Failed to count operations"))?;
    let total_operations: i64 = col(&row, "total")?;

    let row = sqlx::query(
        r#"
        SELECT
            COUNT(*) AS total,
            SUM(CASE WHEN uf.approved = 1 THEN 1 ELSE 0 END) AS approved,
            SUM(CASE WHEN uf.feedback_type = 'correction' THEN 1 ELSE 0 END) AS corrected
        FROM operations o
        JOIN user_feedback uf ON uf.operation_id = o.id
        WHERE o.user_id = ? AND uf.feedback_type IN ('approval', 'correction')
        "#,
    )
    .bind(user_id)
    .fetch_one(&mut *conn)
    .await
    .map_err(db_err("Failed to aggregate feedback"))?;

    let feedback_count: i64 = col(&row, "total")?;
    let approved = col::<Option<i64>>(&row, "approved")?.unwrap_or(0);
    let corrected = col::<Option<i64>>(&row, "corrected")?.unwrap_or(0);

    let ratio = |n: i64| {
        if feedback_count > 0 {
            n as f64 / feedback_count as f64
        } else {
            0.0
        }
    };

    Ok(ClassificationStats {
        total_operations,
        feedback_count,
        accuracy: ratio(approved),
        correction_rate: ratio(corrected),
    })
}

//
// ================= Clarifications =================
//

pub async fn store_clarification(
    conn: &mut SqliteConnection,
    operation_id: Uuid,
    user_id: &str,
    question: &str,
) -> Result<Uuid> {
    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO classification_clarifications
          (id, operation_id, user_id, question, resolved, created_at)
        VALUES (?, ?, ?, ?, 0, ?)
        "#,
    )
    .bind(id.to_string())
    .bind(operation_id.to_string())
    .bind(user_id)
    .bind(question)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await
    .map_err(db_err("Failed to store clarification"))?;

    Ok(id)
}

/// Latest unresolved clarification for a user, with the request that raised it.
pub async fn get_pending_clarification(
    conn: &mut SqliteConnection,
    user_id: &str,
) -> Result<Option<PendingClarification>> {
    let row = sqlx::query(
        r#"
        SELECT cc.id, cc.operation_id, cc.user_id, cc.question, cc.created_at,
               o.user_request AS original_request
        FROM classification_clarifications cc
        JOIN operations o ON o.id = cc.operation_id
        WHERE cc.user_id = ? AND cc.resolved = 0
        ORDER BY cc.created_at DESC, cc.rowid DESC
        LIMIT 1
        "#,
    )
    .bind(user_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_err("Failed to load pending clarification"))?;

    row.map(|row| -> Result<PendingClarification> {
        Ok(PendingClarification {
            id: parse_uuid(&row, "id")?,
            operation_id: parse_uuid(&row, "operation_id")?,
            user_id: col(&row, "user_id")?,
            question: col(&row, "question")?,
            original_request: col(&row, "original_request")?,
            created_at: col(&row, "created_at")?,
        })
    })
    .transpose()
}

pub async fn resolve_clarification(
    conn: &mut SqliteConnection,
    clarification_id: Uuid,
    response: &str,
) -> Result<()> {
    let result = sqlx::query(
        r#"
        UPDATE classification_clarifications
        SET user_response = ?, resolved = 1, resolved_at = ?
        WHERE id = ? AND resolved = 0
        "#,
    )
    .bind(response)
    .bind(Utc::now())
    .bind(clarification_id.to_string())
    .execute(&mut *conn)
    .await
    .map_err(db_err("Failed to resolve clarification"))?;

    if result.rows_affected() == 0 {
        return Err(AtomicOpsError::InvalidState(format!(
            "clarification {} is unknown or already resolved",
            clarification_id
        )));
    }
    Ok(())
}

//
// ================= Row Helpers =================
//

pub(crate) fn db_err(context: &'static str) -> impl FnOnce(sqlx::Error) -> AtomicOpsError {
    move |e| AtomicOpsError::DatabaseError(format!("{}: {}", context, e))
}

fn col<'r, T>(row: &'r SqliteRow, name: &str) -> Result<T>
where
    T: sqlx::Decode<'r, Sqlite> + sqlx::Type<Sqlite>,
{
    row.try_get(name)
        .map_err(|e| AtomicOpsError::DatabaseError(format!("Failed to read column {}: {}", name, e)))
}

fn parse_col<T>(row: &SqliteRow, name: &str) -> Result<T>
where
    T: FromStr<Err = AtomicOpsError>,
{
    let raw: String = col(row, name)?;
    raw.parse()
}

fn parse_opt<T>(row: &SqliteRow, name: &str) -> Result<Option<T>>
where
    T: FromStr<Err = AtomicOpsError>,
{
    let raw: Option<String> = col(row, name)?;
    raw.as_deref().map(str::parse).transpose()
}

fn parse_uuid(row: &SqliteRow, name: &str) -> Result<Uuid> {
    let raw: String = col(row, name)?;
    Ok(Uuid::parse_str(&raw)?)
}

fn json_col<T: DeserializeOwned>(row: &SqliteRow, name: &str) -> Result<T> {
    let raw: String = col(row, name)?;
    Ok(serde_json::from_str(&raw)?)
}

fn json_col_opt<T: DeserializeOwned>(row: &SqliteRow, name: &str) -> Result<Option<T>> {
    let raw: Option<String> = col(row, name)?;
    Ok(raw.as_deref().map(serde_json::from_str).transpose()?)
}

fn to_json_opt<T: serde::Serialize>(value: &Option<T>) -> Result<Option<String>> {
    Ok(value.as_ref().map(serde_json::to_string).transpose()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ReversibilityInfo, StateSnapshot, UndoMethod};
    use tokio_test::assert_ok;

    async fn setup() -> SqlitePool {
        connect_in_memory().await.unwrap()
    }

    fn create_test_operation(request: &str, user_id: &str) -> Operation {
        let mut op = Operation::new(request, user_id, "cairn");
        let mut c = Classification::new(Destination::Stream, Consumer::Human, Semantics::Read);
        c.domain = Some("calendar".to_string());
        c.action_hint = Some("view".to_string());
        c.reasoning = "asks to see something".to_string();
        op.classify(c);
        op
    }

    #[tokio::test]
    async fn test_init_schema_is_idempotent() {
        let pool = setup().await;
        let mut conn = pool.acquire().await.unwrap();

        assert_ok!(init_schema(&mut conn).await);
        assert_ok!(init_schema(&mut conn).await);
        assert_eq!(schema_version(&mut conn).await.unwrap(), SCHEMA_VERSION);

        let row = sqlx::query("SELECT COUNT(*) AS n FROM atomic_ops_schema_version")
            .fetch_one(&mut *conn)
            .await
            .unwrap();
        let n: i64 = row.try_get("n").unwrap();
        assert_eq!(n, SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn test_operation_round_trip() {
        let pool = setup().await;
        let mut tx = pool.begin().await.unwrap();

        let mut parent = Operation::new("move a and b", "u1", "cairn");
        let mut child_a = create_test_operation("move a", "u1");
        let mut child_b = create_test_operation("move b", "u1");
        child_a.parent_id = Some(parent.id);
        child_b.parent_id = Some(parent.id);
        parent.decompose_into(vec![child_a.id, child_b.id]);

        for op in [&parent, &child_a, &child_b] {
            create_operation(&mut *tx, op).await.unwrap();
        }
        tx.commit().await.unwrap();

        let mut conn = pool.acquire().await.unwrap();
        let loaded_parent = get_operation(&mut conn, parent.id).await.unwrap().unwrap();
        assert!(loaded_parent.is_decomposed);
        assert!(loaded_parent.classification.is_none());
        assert_eq!(loaded_parent.status, OperationStatus::Decomposed);
        assert_eq!(loaded_parent.child_ids, vec![child_a.id, child_b.id]);

        let loaded_child = get_operation(&mut conn, child_a.id).await.unwrap().unwrap();
        assert_eq!(loaded_child.classification, child_a.classification);
        assert_eq!(loaded_child.status, child_a.status);
        assert_eq!(loaded_child.parent_id, Some(parent.id));
        assert_eq!(loaded_child.user_request, "move a");
        assert_eq!(loaded_child.created_at, child_a.created_at);
    }

    #[tokio::test]
    async fn test_invalid_operation_rejected() {
        let pool = setup().await;
        let mut conn = pool.acquire().await.unwrap();

        let mut op = Operation::new("broken", "u1", "cairn");
        op.is_decomposed = true;
        let err = create_operation(&mut conn, &op).await.unwrap_err();
        assert!(matches!(err, AtomicOpsError::ValidationError(_)));
    }

    #[tokio::test]
    async fn test_status_update_stamps_completion() {
        let pool = setup().await;
        let mut conn = pool.acquire().await.unwrap();
        let op = create_test_operation("show cpu", "u1");
        create_operation(&mut conn, &op).await.unwrap();

        update_operation_status(&mut conn, op.id, OperationStatus::Executing).await.unwrap();
        let loaded = require_operation(&mut conn, op.id).await.unwrap();
        assert!(loaded.completed_at.is_none());

        update_operation_status(&mut conn, op.id, OperationStatus::Complete).await.unwrap();
        let loaded = require_operation(&mut conn, op.id).await.unwrap();
        assert_eq!(loaded.status, OperationStatus::Complete);
        assert!(loaded.completed_at.is_some());

        let missing = update_operation_status(&mut conn, Uuid::new_v4(), OperationStatus::Failed).await;
        assert!(matches!(missing, Err(AtomicOpsError::OperationNotFound(_))));
    }

    #[tokio::test]
    async fn test_verification_and_execution_records() {
        let pool = setup().await;
        let mut conn = pool.acquire().await.unwrap();
        let op = create_test_operation("save notes", "u1");
        create_operation(&mut conn, &op).await.unwrap();

        let mut result = VerificationResult::warn(
            VerificationLayer::Behavioral,
            vec!["Broad operation: recursive".to_string()],
            0.9,
            "Will create or modify a file",
        );
        result.execution_time_ms = 3;
        store_verification(&mut conn, op.id, &result).await.unwrap();
        store_verification(&mut conn, op.id, &result).await.unwrap();

        let mut snapshot = StateSnapshot::empty();
        snapshot.system_metrics.insert("cpu".to_string(), 0.25);
        let record = ExecutionRecord {
            result: ExecutionResult {
                success: true,
                exit_code: Some(0),
                stdout: "ok".to_string(),
                files_affected: vec!["/tmp/notes.md".to_string()],
                ..Default::default()
            },
            state_before: Some(snapshot.clone()),
            state_after: None,
            reversibility: Some(ReversibilityInfo {
                reversible: true,
                method: Some(UndoMethod::RestoreBackup),
                backup_files: [("/tmp/notes.md".to_string(), "/tmp/notes.md.bak".to_string())]
                    .into_iter()
                    .collect(),
                ..Default::default()
            }),
        };
        store_execution(&mut conn, op.id, &record).await.unwrap();

        let loaded = require_operation(&mut conn, op.id).await.unwrap();
        assert_eq!(loaded.verification_results.len(), 1);
        assert_eq!(loaded.verification_results[&VerificationLayer::Behavioral], result);
        assert_eq!(loaded.execution_result, Some(record.result.clone()));
        assert_eq!(loaded.state_before, Some(snapshot));
        assert_eq!(loaded.reversibility, record.reversibility);
    }

    #[tokio::test]
    async fn test_classification_log_appends() {
        let pool = setup().await;
        let mut conn = pool.acquire().await.unwrap();
        let op = create_test_operation("show calendar", "u1");
        create_operation(&mut conn, &op).await.unwrap();

        let first = op.classification.clone().unwrap();
        let mut second = first.clone();
        second.confident = true;
        log_classification(&mut conn, op.id, &first, "keyword_fallback").await.unwrap();
        log_classification(&mut conn, op.id, &second, "gemini-2.0-flash").await.unwrap();

        let log = get_classification_log(&mut conn, op.id).await.unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].model, "keyword_fallback");
        assert_eq!(log[1].classification, second);
    }

    #[tokio::test]
    async fn test_recent_corrections_and_stats() {
        let pool = setup().await;
        let mut conn = pool.acquire().await.unwrap();

        let op = create_test_operation("note that the meeting moved", "u1");
        create_operation(&mut conn, &op).await.unwrap();

        let mut correction = UserFeedback::new(op.id, "u1", FeedbackType::Correction);
        correction.system_classification = op.classification.as_ref().map(|c| c.snapshot());
        correction.corrected = CorrectedAxes {
            destination: Some(Destination::File),
            consumer: None,
            semantics: Some(Semantics::Execute),
        };
        store_feedback(&mut conn, &correction).await.unwrap();

        let mut approval = UserFeedback::new(op.id, "u1", FeedbackType::Approval);
        approval.approved = Some(true);
        store_feedback(&mut conn, &approval).await.unwrap();

        let corrections = get_recent_corrections(&mut conn, Some("u1"), 5).await.unwrap();
        assert_eq!(corrections.len(), 1);
        assert_eq!(
            corrections[0].render(),
            "- \"note that the meeting moved\" was misclassified as stream/human/read, correct is file/human/execute"
        );
        assert!(get_recent_corrections(&mut conn, Some("u2"), 5).await.unwrap().is_empty());

        let stats = get_classification_stats(&mut conn, "u1").await.unwrap();
        assert_eq!(stats.total_operations, 1);
        assert_eq!(stats.feedback_count, 2);
        assert_eq!(stats.accuracy, 0.5);
        assert_eq!(stats.correction_rate, 0.5);

        let feedback = get_feedback_for_operation(&mut conn, op.id).await.unwrap();
        assert_eq!(feedback.len(), 2);
        assert_eq!(feedback[0].corrected.destination, Some(Destination::File));
    }

    #[tokio::test]
    async fn test_clarification_lifecycle() {
        let pool = setup().await;
        let mut conn = pool.acquire().await.unwrap();
        let op = Operation::new("move it there", "u1", "cairn");
        create_operation(&mut conn, &op).await.unwrap();

        let id = store_clarification(&mut conn, op.id, "u1", "Which scene do you mean?")
            .await
            .unwrap();
        let pending = get_pending_clarification(&mut conn, "u1").await.unwrap().unwrap();
        assert_eq!(pending.id, id);
        assert_eq!(pending.original_request, "move it there");

        resolve_clarification(&mut conn, id, "the career scene").await.unwrap();
        assert!(get_pending_clarification(&mut conn, "u1").await.unwrap().is_none());
        assert!(resolve_clarification(&mut conn, id, "again").await.is_err());
    }

    #[tokio::test]
    async fn test_list_and_status_queries() {
        let pool = setup().await;
        let mut conn = pool.acquire().await.unwrap();

        let first = create_test_operation("show cpu", "u1");
        let second = create_test_operation("show disk", "u1");
        let other = create_test_operation("show ram", "u2");
        for op in [&first, &second, &other] {
            create_operation(&mut conn, op).await.unwrap();
        }
        update_operation_status(&mut conn, second.id, OperationStatus::AwaitingApproval)
            .await
            .unwrap();

        let filter = OperationFilter {
            user_id: Some("u1".to_string()),
            ..Default::default()
        };
        let listed = list_operations(&mut conn, &filter).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, second.id);

        let pending = get_operations_by_status(
            &mut conn,
            "u1",
            &[OperationStatus::AwaitingVerification, OperationStatus::AwaitingApproval],
        )
        .await
        .unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].id, first.id);
    }
}
