//! SurrealDB-backed RunHistory implementation
//!
//! Uses `schema::RunRow` for persistence, converting to/from
//! `storage_traits::RunEntry` at the boundary.

use async_trait::async_trait;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

use crate::error::{StateError, StorageError};
use crate::migrations;
use crate::schema::RunRow;
use crate::storage_traits::{RunEntry, RunHistory, RunId, StorageResult};

const NAMESPACE: &str = "shipline";
const DATABASE: &str = "main";
const DEFAULT_LOCAL_PATH: &str = ".shipline/db";

/// SurrealDB-backed implementation of [`RunHistory`].
pub struct SurrealRunHistory {
    db: Surreal<Any>,
}

impl SurrealRunHistory {
    /// Create an in-memory instance for testing.
    pub async fn in_memory() -> crate::Result<Self> {
        let history = Self::connect("mem://").await?;
        info!("SurrealRunHistory connected (in-memory)");
        Ok(history)
    }

    /// Connect to any SurrealDB endpoint (`mem://`, `surrealkv://path`, `ws://host`).
    pub async fn connect(endpoint: &str) -> crate::Result<Self> {
        let db = surrealdb::engine::any::connect(endpoint)
            .await
            .map_err(|e| StateError::Connection(format!("{endpoint}: {e}")))?;

        db.use_ns(NAMESPACE)
            .use_db(DATABASE)
            .await
            .map_err(|e| StateError::Connection(e.to_string()))?;

        migrations::init_schema(&db).await?;
        Ok(Self { db })
    }

    /// Create from environment variables.
    ///
    /// Uses `SURREALDB_URL` when set, otherwise local persistence under
    /// `.shipline/db`.
    pub async fn from_env() -> crate::Result<Self> {
        if let Ok(url) = std::env::var("SURREALDB_URL") {
            let history = Self::connect(&url).await?;
            info!("SurrealRunHistory connected ({})", url);
            return Ok(history);
        }

        std::fs::create_dir_all(DEFAULT_LOCAL_PATH).map_err(|e| {
            StateError::Connection(format!(
                "Failed to create database directory {}: {}",
                DEFAULT_LOCAL_PATH, e
            ))
        })?;
        let url = format!("surrealkv://{}", DEFAULT_LOCAL_PATH);
        info!("No SURREALDB_URL found, using local persistence: {}", url);
        Self::connect(&url).await
    }

    async fn fetch_rows(
        &self,
        sql: &'static str,
        binds: Vec<(&'static str, String)>,
        limit: usize,
    ) -> StorageResult<Vec<RunEntry>> {
        let mut query = self.db.query(sql).bind(("limit", limit as i64));
        for (key, value) in binds {
            query = query.bind((key, value));
        }
        let mut res = query
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let rows: Vec<RunRow> = res
            .take(0)
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        rows.into_iter().map(RunRow::into_entry).collect()
    }
}

#[async_trait]
impl RunHistory for SurrealRunHistory {
    async fn append(&self, entry: RunEntry) -> StorageResult<()> {
        if self.get(&entry.run_id).await.is_ok() {
            return Err(StorageError::Duplicate {
                run_id: entry.run_id.0.clone(),
            });
        }

        let row = RunRow::from_entry(&entry)?;
        debug!(run_id = %entry.run_id, "archiving run");

        self.db
            .query("CREATE pipeline_runs CONTENT $row")
            .bind(("row", row))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?
            .check()
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        Ok(())
    }

    async fn get(&self, run_id: &RunId) -> StorageResult<RunEntry> {
        let mut res = self
            .db
            .query(
                "SELECT run_id, pipeline, outcome, finished_at_ms, entry \
                 FROM pipeline_runs WHERE run_id = $rid",
            )
            .bind(("rid", run_id.0.clone()))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let rows: Vec<RunRow> = res
            .take(0)
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        rows.into_iter()
            .next()
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.0.clone(),
            })?
            .into_entry()
    }

    async fn list(&self, limit: usize) -> StorageResult<Vec<RunEntry>> {
        self.fetch_rows(
            "SELECT run_id, pipeline, outcome, finished_at_ms, entry \
             FROM pipeline_runs ORDER BY finished_at_ms DESC LIMIT $limit",
            Vec::new(),
            limit,
        )
        .await
    }

    async fn list_for_pipeline(
        &self,
        pipeline: &str,
        limit: usize,
    ) -> StorageResult<Vec<RunEntry>> {
        self.fetch_rows(
            "SELECT run_id, pipeline, outcome, finished_at_ms, entry \
             FROM pipeline_runs WHERE pipeline = $pipeline \
             ORDER BY finished_at_ms DESC LIMIT $limit",
            vec![("pipeline", pipeline.to_string())],
            limit,
        )
        .await
    }
}
