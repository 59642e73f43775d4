//! Versioned schema for the operation store
//!
//! Each migration step runs only when the recorded version lags behind it,
//! so `init_schema` can be called on every start-up.

use chrono::Utc;
use sqlx::{Row, SqliteConnection};
use tracing::info;

use super::db_err;
use crate::error::AtomicOpsError;
use crate::Result;

pub const SCHEMA_VERSION: i64 = 2;

const V1_CORE_TABLES: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS operations (
        id TEXT PRIMARY KEY,
        user_request TEXT NOT NULL,
        user_id TEXT NOT NULL,
        destination TEXT CHECK (destination IN ('stream', 'file', 'process')),
        consumer TEXT CHECK (consumer IN ('human', 'machine')),
        semantics TEXT CHECK (semantics IN ('read', 'interpret', 'execute')),
        classification_confident INTEGER NOT NULL DEFAULT 0,
        classification_reasoning TEXT,
        is_decomposed INTEGER NOT NULL DEFAULT 0,
        parent_id TEXT REFERENCES operations(id),
        child_ids TEXT NOT NULL DEFAULT '[]',
        status TEXT NOT NULL CHECK (status IN (
            'classifying', 'awaiting_verification', 'awaiting_approval',
            'executing', 'complete', 'failed', 'decomposed'
        )),
        source_agent TEXT NOT NULL,
        created_at TEXT NOT NULL,
        completed_at TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_operations_user ON operations (user_id, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_operations_status ON operations (status)",
    "CREATE INDEX IF NOT EXISTS idx_operations_parent ON operations (parent_id)",
    r#"
    CREATE TABLE IF NOT EXISTS classification_log (
        id TEXT PRIMARY KEY,
        operation_id TEXT NOT NULL REFERENCES operations(id),
        destination TEXT NOT NULL,
        consumer TEXT NOT NULL,
        semantics TEXT NOT NULL,
        confident INTEGER NOT NULL,
        reasoning TEXT,
        model TEXT NOT NULL,
        created_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_classification_log_operation ON classification_log (operation_id)",
    r#"
    CREATE TABLE IF NOT EXISTS user_feedback (
        id TEXT PRIMARY KEY,
        operation_id TEXT NOT NULL REFERENCES operations(id),
        user_id TEXT NOT NULL,
        feedback_type TEXT NOT NULL CHECK (feedback_type IN ('approval', 'correction', 'rejection')),
        system_classification TEXT,
        user_corrected_destination TEXT CHECK (user_corrected_destination IN ('stream', 'file', 'process')),
        user_corrected_consumer TEXT CHECK (user_corrected_consumer IN ('human', 'machine')),
        user_corrected_semantics TEXT CHECK (user_corrected_semantics IN ('read', 'interpret', 'execute')),
        correction_reasoning TEXT,
        approved INTEGER,
        time_to_decision_ms INTEGER,
        created_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_user_feedback_operation ON user_feedback (operation_id)",
    "CREATE INDEX IF NOT EXISTS idx_user_feedback_user ON user_feedback (user_id, feedback_type, created_at)",
    r#"
    CREATE TABLE IF NOT EXISTS operation_verification (
        id TEXT PRIMARY KEY,
        operation_id TEXT NOT NULL REFERENCES operations(id),
        layer TEXT NOT NULL CHECK (layer IN ('syntax', 'safety', 'semantic', 'behavioral', 'intent')),
        passed INTEGER NOT NULL,
        confidence REAL NOT NULL,
        issues_json TEXT NOT NULL DEFAULT '[]',
        details TEXT,
        execution_time_ms INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        UNIQUE (operation_id, layer)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS operation_execution (
        id TEXT PRIMARY KEY,
        operation_id TEXT NOT NULL REFERENCES operations(id),
        success INTEGER NOT NULL,
        exit_code INTEGER,
        stdout TEXT,
        stderr TEXT,
        duration_ms INTEGER NOT NULL DEFAULT 0,
        files_affected TEXT NOT NULL DEFAULT '[]',
        processes_spawned TEXT NOT NULL DEFAULT '[]',
        state_before TEXT,
        state_after TEXT,
        reversibility TEXT,
        executed_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_operation_execution_operation ON operation_execution (operation_id)",
    r#"
    CREATE TABLE IF NOT EXISTS classification_clarifications (
        id TEXT PRIMARY KEY,
        operation_id TEXT NOT NULL REFERENCES operations(id),
        user_id TEXT NOT NULL,
        question TEXT NOT NULL,
        user_response TEXT,
        resolved INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        resolved_at TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_clarifications_pending ON classification_clarifications (user_id, resolved)",
];

/// Nominal classification columns and the few-shot view.
const V2_DOMAIN_AND_HISTORY: &[&str] = &[
    "ALTER TABLE operations ADD COLUMN domain TEXT",
    "ALTER TABLE operations ADD COLUMN action_hint TEXT",
    "ALTER TABLE classification_log ADD COLUMN domain TEXT",
    "ALTER TABLE classification_log ADD COLUMN action_hint TEXT",
    r#"
    CREATE VIEW IF NOT EXISTS classification_history AS
    SELECT
        o.id AS operation_id,
        o.user_request,
        o.user_id AS operation_user_id,
        o.destination AS system_destination,
        o.consumer AS system_consumer,
        o.semantics AS system_semantics,
        o.classification_confident AS system_confident,
        uf.id AS feedback_id,
        uf.rowid AS feedback_seq,
        uf.user_id AS feedback_user_id,
        uf.feedback_type,
        uf.approved,
        uf.system_classification,
        uf.user_corrected_destination,
        uf.user_corrected_consumer,
        uf.user_corrected_semantics,
        uf.correction_reasoning,
        uf.created_at AS feedback_at
    FROM operations o
    JOIN user_feedback uf ON uf.operation_id = o.id
    WHERE uf.approved = 1
       OR uf.user_corrected_destination IS NOT NULL
       OR uf.user_corrected_consumer IS NOT NULL
       OR uf.user_corrected_semantics IS NOT NULL
    "#,
];

const MIGRATIONS: &[(i64, &[&str])] = &[(1, V1_CORE_TABLES), (2, V2_DOMAIN_AND_HISTORY)];

/// Bring the schema up to `SCHEMA_VERSION`. Idempotent.
pub async fn init_schema(conn: &mut SqliteConnection) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS atomic_ops_schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL
        )
        "#,
    )
    .execute(&mut *conn)
    .await
    .map_err(db_err("Failed to create schema version table"))?;

    let current = schema_version(conn).await?;
    if current > SCHEMA_VERSION {
        return Err(AtomicOpsError::DatabaseError(format!(
            "Database schema version {} is newer than supported version {}",
            current, SCHEMA_VERSION
        )));
    }

    for (version, statements) in MIGRATIONS {
        if current >= *version {
            continue;
        }

        for statement in statements.iter() {
            sqlx::query(statement)
                .execute(&mut *conn)
                .await
                .map_err(|e| {
                    AtomicOpsError::DatabaseError(format!(
                        "Migration to schema version {} failed: {}",
                        version, e
                    ))
                })?;
        }

        sqlx::query("INSERT INTO atomic_ops_schema_version (version, applied_at) VALUES (?, ?)")
            .bind(*version)
            .bind(Utc::now())
            .execute(&mut *conn)
            .await
            .map_err(db_err("Failed to record schema version"))?;

        info!(version = *version, "Applied atomic ops schema migration");
    }

    Ok(())
}

pub async fn schema_version(conn: &mut SqliteConnection) -> Result<i64> {
    let row = sqlx::query("SELECT MAX(version) AS version FROM atomic_ops_schema_version")
        .fetch_one(&mut *conn)
        .await
        .map_err(db_err("Failed to read schema version"))?;

    let version: Option<i64> = row
        .try_get("version")
        .map_err(db_err("Failed to decode schema version"))?;

    Ok(version.unwrap_or(0))
}
