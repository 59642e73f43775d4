//! Atomic Operations Pipeline
//!
//! Turns a free-form user request into classified, verified operations:
//! - Classifies each request on three axes (destination, consumer, semantics)
//! - Decomposes compound requests into a parent/children tree
//! - Asks the user instead of guessing ambiguous requests or entity references
//! - Runs five verification layers before anything executes
//! - Persists operations, verification, execution and feedback in SQLite
//! - Feeds user corrections back into the classifier as few-shot examples
//!
//! FLOW:
//! REQUEST → CLASSIFY → DECOMPOSE → VERIFY → APPROVE? → EXECUTE → FEEDBACK

pub mod api;
pub mod bridge;
pub mod classifier;
pub mod config;
pub mod decomposer;
pub mod error;
pub mod feedback;
pub mod models;
pub mod oracle;
pub mod resolver;
pub mod store;
pub mod verification;

pub use error::{AtomicOpsError, Result};

// Re-export common types
pub use bridge::{
    AtomicBridge, BridgeOutcome, BridgeResult, EntityBinding, OperationExecutor, RequestContext,
};
pub use config::PipelineConfig;
pub use models::*;
