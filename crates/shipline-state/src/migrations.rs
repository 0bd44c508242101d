//! SurrealDB schema initialization
//!
//! Safe to call on every connection (all statements are idempotent).

use crate::error::StateError;
use crate::Result;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

/// Initialize all Shipline tables
pub async fn init_schema(db: &Surreal<Any>) -> Result<()> {
    info!("Initializing Shipline history schema");
    init_pipeline_runs_table(db).await?;
    Ok(())
}

/// Initialize `pipeline_runs` table
///
/// Schema:
/// ```text
/// TABLE pipeline_runs {
///   run_id:          STRING (unique)
///   pipeline:        STRING (indexed)
///   outcome:         STRING (succeeded | failed | denied)
///   finished_at_ms:  INT (indexed)
///   entry:           STRING (JSON-encoded RunEntry)
/// }
/// ```
///
/// Rows are append-only: updates and deletes are not permitted.
async fn init_pipeline_runs_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing pipeline_runs table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS pipeline_runs AS
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update NONE
                FOR delete NONE;

        DEFINE INDEX IF NOT EXISTS idx_run_id ON TABLE pipeline_runs COLUMNS run_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_pipeline ON TABLE pipeline_runs COLUMNS pipeline;
        DEFINE INDEX IF NOT EXISTS idx_finished_at ON TABLE pipeline_runs COLUMNS finished_at_ms;
    "#;

    db.query(sql)
        .await
        .map_err(|e| StateError::SchemaSetup(e.to_string()))?
        .check()
        .map_err(|e| StateError::SchemaSetup(e.to_string()))?;
    Ok(())
}
