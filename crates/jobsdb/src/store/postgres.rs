//! Postgres-backed job storage.
//!
//! Every dataset is a pair of tables, `{prefix}_jobs_{index}` and
//! `{prefix}_job_status_{index}`. Job ids and status ids come from two
//! queue-wide sequences so they stay monotonic across datasets and survive
//! migrations between them. The catalog of datasets is `pg_tables` itself.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError | Scenario |
//! |------------|----------------------|------------|----------|
//! | Database (undefined table) | `42P01` | `DatasetNotFound` | Dataset dropped or never created |
//! | Database (other) | Any other | `Storage` | Constraint or query errors |
//! | PoolClosed | N/A | `Storage` | Connection pool was closed |
//! | Other | N/A | `Storage` | Network errors, connection failures, etc. |

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;
use uuid::Uuid;

use strata_core::{JobId, JobState, TenantId};

use super::query::ExportQuery;
use super::r#trait::{
    AppendOutcome, ExportBatch, ExportMode, JobStorage, PickupQuery, RawJournalEntry, RawRange,
    Retention, StoreError,
};
use crate::dataset::Dataset;
use crate::job::{Job, NewJob, NewStatus};

const JOURNAL_TABLE: &str = "strata_journal";

/// Postgres-backed job storage.
///
/// `Send + Sync`; all operations go through the SQLx connection pool and every
/// multi-statement mutation runs in one transaction.
#[derive(Debug, Clone)]
pub struct PostgresJobStorage {
    pool: Arc<PgPool>,
}

impl PostgresJobStorage {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create the shared journal table.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS "{JOURNAL_TABLE}" (
                id BIGSERIAL PRIMARY KEY,
                owner TEXT NOT NULL,
                operation TEXT NOT NULL,
                payload JSONB NOT NULL,
                start_time TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#
        ))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    async fn begin(&self, operation: &str) -> Result<Transaction<'_, Postgres>, StoreError> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error(operation, e))
    }
}

fn job_id_sequence(prefix: &str) -> String {
    format!("{prefix}_jobs_id_seq")
}

fn status_id_sequence(prefix: &str) -> String {
    format!("{prefix}_job_status_id_seq")
}

fn dataset_ddl(dataset: &Dataset) -> Vec<String> {
    let jobs = &dataset.job_table;
    let status = &dataset.status_table;
    let job_seq = job_id_sequence(&dataset.prefix);
    let status_seq = status_id_sequence(&dataset.prefix);
    vec![
        format!(r#"CREATE SEQUENCE IF NOT EXISTS "{job_seq}""#),
        format!(r#"CREATE SEQUENCE IF NOT EXISTS "{status_seq}""#),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS "{jobs}" (
                job_id BIGINT PRIMARY KEY DEFAULT nextval('"{job_seq}"'),
                workspace_id UUID NOT NULL,
                uuid UUID NOT NULL,
                user_id TEXT NOT NULL,
                parameters JSONB NOT NULL,
                custom_val TEXT NOT NULL,
                event_payload JSONB NOT NULL,
                event_count INTEGER NOT NULL DEFAULT 1,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                expire_at TIMESTAMPTZ
            )
            "#
        ),
        format!(r#"CREATE INDEX IF NOT EXISTS "{jobs}_workspace_idx" ON "{jobs}" (workspace_id, job_id)"#),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS "{status}" (
                id BIGINT PRIMARY KEY DEFAULT nextval('"{status_seq}"'),
                job_id BIGINT NOT NULL,
                job_state TEXT NOT NULL,
                attempt INTEGER NOT NULL,
                exec_time TIMESTAMPTZ NOT NULL,
                retry_time TIMESTAMPTZ NOT NULL,
                error_code TEXT NOT NULL,
                error_response JSONB NOT NULL,
                parameters JSONB NOT NULL
            )
            "#
        ),
        format!(r#"CREATE INDEX IF NOT EXISTS "{status}_job_idx" ON "{status}" (job_id, id DESC)"#),
    ]
}

/// Lateral join exposing each job's latest status as `l`.
fn latest_status_join(dataset: &Dataset) -> String {
    format!(
        r#"LEFT JOIN LATERAL (
            SELECT s.job_state, s.retry_time
            FROM "{status}" s
            WHERE s.job_id = j.job_id
            ORDER BY s.id DESC
            LIMIT 1
        ) l ON TRUE"#,
        status = dataset.status_table
    )
}

/// Pickable predicate over `l`; `$param` binds the current time.
fn pickable_predicate(param: usize) -> String {
    format!(
        "(l.job_state IS NULL OR l.job_state IN ('{}', '{}') OR (l.job_state = '{}' AND l.retry_time <= ${param}))",
        JobState::Waiting.as_str(),
        JobState::Throttled.as_str(),
        JobState::Failed.as_str(),
    )
}

/// Jobs `retention` does not let stay behind, over `l`.
fn unfinished_predicate(retention: Retention) -> String {
    let settled: Vec<String> = retention
        .settled_states()
        .iter()
        .map(|state| format!("'{}'", state.as_str()))
        .collect();
    format!(
        "(l.job_state IS NULL OR l.job_state NOT IN ({}))",
        settled.join(", ")
    )
}

fn job_from_row(row: &PgRow) -> Result<Job, sqlx::Error> {
    Ok(Job {
        job_id: JobId::new(row.try_get("job_id")?),
        workspace_id: TenantId::from_uuid(row.try_get::<Uuid, _>("workspace_id")?),
        uuid: row.try_get("uuid")?,
        user_id: row.try_get("user_id")?,
        parameters: row.try_get("parameters")?,
        custom_val: row.try_get("custom_val")?,
        event_payload: row.try_get("event_payload")?,
        event_count: row.try_get("event_count")?,
        created_at: row.try_get("created_at")?,
        expire_at: row.try_get("expire_at")?,
    })
}

#[async_trait]
impl JobStorage for PostgresJobStorage {
    #[instrument(skip(self), err)]
    async fn list_datasets(&self, prefix: &str) -> Result<Vec<Dataset>, StoreError> {
        let tables: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT tablename::TEXT
            FROM pg_catalog.pg_tables
            WHERE schemaname = current_schema() AND tablename LIKE $1
            "#,
        )
        .bind(format!("{prefix}\\_jobs\\_%"))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_datasets", e))?;

        Ok(tables
            .iter()
            .filter_map(|table| Dataset::from_job_table(prefix, table))
            .collect())
    }

    #[instrument(skip(self, dataset), fields(dataset = %dataset), err)]
    async fn create_dataset(&self, dataset: &Dataset) -> Result<(), StoreError> {
        let mut tx = self.begin("create_dataset").await?;
        for statement in dataset_ddl(dataset) {
            sqlx::query(&statement)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("create_dataset", e))?;
        }
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("create_dataset", e))
    }

    #[instrument(skip(self, dataset), fields(dataset = %dataset), err)]
    async fn drop_dataset(&self, dataset: &Dataset) -> Result<(), StoreError> {
        sqlx::query(&format!(
            r#"DROP TABLE IF EXISTS "{}", "{}""#,
            dataset.job_table, dataset.status_table
        ))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("drop_dataset", e))?;
        Ok(())
    }

    async fn job_range(&self, dataset: &Dataset) -> Result<Option<RawRange>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT MIN(job_id) AS min_id, MAX(job_id) AS max_id,
                   MIN(created_at) AS min_created, MAX(created_at) AS max_created
            FROM "{}"
            "#,
            dataset.job_table
        ))
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("job_range", e))?;

        let decode = |row: &PgRow| -> Result<Option<RawRange>, sqlx::Error> {
            let min_id: Option<i64> = row.try_get("min_id")?;
            let max_id: Option<i64> = row.try_get("max_id")?;
            let min_created: Option<DateTime<Utc>> = row.try_get("min_created")?;
            let max_created: Option<DateTime<Utc>> = row.try_get("max_created")?;
            Ok(match (min_id, max_id, min_created, max_created) {
                (Some(min_id), Some(max_id), Some(min_created), Some(max_created)) => Some(RawRange {
                    min_job_id: JobId::new(min_id),
                    max_job_id: JobId::new(max_id),
                    min_created_at: min_created,
                    max_created_at: max_created,
                }),
                _ => None,
            })
        };
        decode(&row).map_err(|e| StoreError::Serialization(format!("job_range row: {e}")))
    }

    async fn count_jobs(&self, dataset: &Dataset) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(&format!(r#"SELECT COUNT(*) FROM "{}""#, dataset.job_table))
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("count_jobs", e))?;
        Ok(count as u64)
    }

    #[instrument(skip(self, dataset, jobs), fields(dataset = %dataset, job_count = jobs.len()), err)]
    async fn insert_jobs(&self, dataset: &Dataset, jobs: &[NewJob]) -> Result<Vec<JobId>, StoreError> {
        if jobs.is_empty() {
            return Ok(vec![]);
        }

        let sql = format!(
            r#"
            INSERT INTO "{}" (
                workspace_id, uuid, user_id, parameters, custom_val,
                event_payload, event_count, expire_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING job_id
            "#,
            dataset.job_table
        );

        let mut tx = self.begin("insert_jobs").await?;
        let mut ids = Vec::with_capacity(jobs.len());
        for job in jobs {
            let id: i64 = sqlx::query_scalar(&sql)
                .bind(job.workspace_id.as_uuid())
                .bind(job.uuid)
                .bind(&job.user_id)
                .bind(&job.parameters)
                .bind(&job.custom_val)
                .bind(&job.event_payload)
                .bind(job.event_count)
                .bind(job.expire_at)
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("insert_job", e))?;
            ids.push(JobId::new(id));
        }
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("insert_jobs", e))?;
        Ok(ids)
    }

    #[instrument(
        skip(self, dataset, status),
        fields(dataset = %dataset, job_id = %status.job_id, state = %status.job_state),
        err
    )]
    async fn append_status(
        &self,
        dataset: &Dataset,
        status: &NewStatus,
    ) -> Result<AppendOutcome, StoreError> {
        let mut tx = self.begin("append_status").await?;

        // The row lock serializes concurrent appends for the same job.
        let workspace: Option<Uuid> = sqlx::query_scalar(&format!(
            r#"SELECT workspace_id FROM "{}" WHERE job_id = $1 FOR UPDATE"#,
            dataset.job_table
        ))
        .bind(status.job_id.get())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("lock_job", e))?;

        let Some(workspace) = workspace else {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Ok(AppendOutcome::UnknownJob);
        };

        let current: Option<String> = sqlx::query_scalar(&format!(
            r#"SELECT job_state FROM "{}" WHERE job_id = $1 ORDER BY id DESC LIMIT 1"#,
            dataset.status_table
        ))
        .bind(status.job_id.get())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("latest_status", e))?;
        let current = current
            .map(|s| s.parse::<JobState>())
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        if !JobState::can_transition(current, status.job_state) {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Ok(AppendOutcome::Rejected { current });
        }

        let status_id: i64 = sqlx::query_scalar(&format!(
            r#"
            INSERT INTO "{}" (
                job_id, job_state, attempt, exec_time, retry_time,
                error_code, error_response, parameters
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id
            "#,
            dataset.status_table
        ))
        .bind(status.job_id.get())
        .bind(status.job_state.as_str())
        .bind(i32::try_from(status.attempt).unwrap_or(i32::MAX))
        .bind(status.exec_time)
        .bind(status.retry_time)
        .bind(&status.error_code)
        .bind(&status.error_response)
        .bind(&status.parameters)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_status", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("append_status", e))?;

        Ok(AppendOutcome::Appended {
            status_id,
            workspace_id: TenantId::from_uuid(workspace),
        })
    }

    #[instrument(skip(self, dataset), fields(dataset = %dataset), err)]
    async fn compact_statuses(&self, dataset: &Dataset, keep: usize) -> Result<u64, StoreError> {
        let result = sqlx::query(&format!(
            r#"
            DELETE FROM "{status}"
            WHERE id IN (
                SELECT id FROM (
                    SELECT id, ROW_NUMBER() OVER (PARTITION BY job_id ORDER BY id DESC) AS rank
                    FROM "{status}"
                ) ranked
                WHERE ranked.rank > $1
            )
            "#,
            status = dataset.status_table
        ))
        .bind(i64::try_from(keep).unwrap_or(i64::MAX))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("compact_statuses", e))?;
        Ok(result.rows_affected())
    }

    async fn pickable_jobs(&self, dataset: &Dataset, query: &PickupQuery) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT j.*
            FROM "{jobs}" j
            {latest}
            WHERE j.workspace_id = $1 AND {pickable}
            ORDER BY j.job_id ASC
            LIMIT $2
            "#,
            jobs = dataset.job_table,
            latest = latest_status_join(dataset),
            pickable = pickable_predicate(3),
        ))
        .bind(query.tenant.as_uuid())
        .bind(i64::try_from(query.limit).unwrap_or(i64::MAX))
        .bind(query.now)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("pickable_jobs", e))?;

        rows.iter()
            .map(job_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StoreError::Serialization(format!("failed to deserialize job row: {e}")))
    }

    async fn pending_counts(
        &self,
        dataset: &Dataset,
        now: DateTime<Utc>,
    ) -> Result<HashMap<TenantId, u64>, StoreError> {
        let rows: Vec<(Uuid, i64)> = sqlx::query_as(&format!(
            r#"
            SELECT j.workspace_id, COUNT(*)
            FROM "{jobs}" j
            {latest}
            WHERE {pickable}
            GROUP BY j.workspace_id
            "#,
            jobs = dataset.job_table,
            latest = latest_status_join(dataset),
            pickable = pickable_predicate(1),
        ))
        .bind(now)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("pending_counts", e))?;

        Ok(rows
            .into_iter()
            .map(|(workspace, count)| (TenantId::from_uuid(workspace), count as u64))
            .collect())
    }

    async fn count_unfinished(&self, dataset: &Dataset, retention: Retention) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(&format!(
            r#"
            SELECT COUNT(*) FROM "{jobs}" j
            {latest}
            WHERE {unfinished}
            "#,
            jobs = dataset.job_table,
            latest = latest_status_join(dataset),
            unfinished = unfinished_predicate(retention),
        ))
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("count_unfinished", e))?;
        Ok(count as u64)
    }

    #[instrument(skip(self, from, to), fields(from = %from, to = %to), err)]
    async fn migrate_unfinished(
        &self,
        from: &Dataset,
        to: &Dataset,
        retention: Retention,
    ) -> Result<u64, StoreError> {
        let mut tx = self.begin("migrate_unfinished").await?;

        sqlx::query(&format!(
            r#"LOCK TABLE "{}", "{}" IN EXCLUSIVE MODE"#,
            from.job_table, from.status_table
        ))
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("lock_source", e))?;

        for statement in dataset_ddl(to) {
            sqlx::query(&statement)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("create_target", e))?;
        }

        let moved = sqlx::query(&format!(
            r#"
            INSERT INTO "{to_jobs}"
            SELECT j.*
            FROM "{from_jobs}" j
            {latest}
            WHERE {unfinished}
            "#,
            to_jobs = to.job_table,
            from_jobs = from.job_table,
            latest = latest_status_join(from),
            unfinished = unfinished_predicate(retention),
        ))
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("move_jobs", e))?
        .rows_affected();

        let statements = [
            format!(
                r#"INSERT INTO "{}" SELECT s.* FROM "{}" s WHERE s.job_id IN (SELECT job_id FROM "{}")"#,
                to.status_table, from.status_table, to.job_table
            ),
            format!(
                r#"DELETE FROM "{}" WHERE job_id IN (SELECT job_id FROM "{}")"#,
                from.status_table, to.job_table
            ),
            format!(
                r#"DELETE FROM "{}" WHERE job_id IN (SELECT job_id FROM "{}")"#,
                from.job_table, to.job_table
            ),
        ];
        for statement in &statements {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("move_statuses", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("migrate_unfinished", e))?;
        Ok(moved)
    }

    #[instrument(skip(self, dataset, tenants), fields(dataset = %dataset, tenants = tenants.len()), err)]
    async fn delete_jobs_for_tenants(
        &self,
        dataset: &Dataset,
        tenants: &[TenantId],
    ) -> Result<u64, StoreError> {
        let ids: Vec<Uuid> = tenants.iter().map(|t| *t.as_uuid()).collect();
        let mut tx = self.begin("delete_jobs_for_tenants").await?;

        sqlx::query(&format!(
            r#"DELETE FROM "{}" WHERE job_id IN (SELECT job_id FROM "{}" WHERE workspace_id = ANY($1))"#,
            dataset.status_table, dataset.job_table
        ))
        .bind(&ids)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("delete_statuses", e))?;

        let deleted = sqlx::query(&format!(
            r#"DELETE FROM "{}" WHERE workspace_id = ANY($1)"#,
            dataset.job_table
        ))
        .bind(&ids)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("delete_jobs", e))?
        .rows_affected();

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("delete_jobs_for_tenants", e))?;
        Ok(deleted)
    }

    async fn count_export_rows(&self, dataset: &Dataset, mode: ExportMode) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(&ExportQuery::count(mode, dataset))
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("count_export_rows", e))?;
        Ok(count as u64)
    }

    #[instrument(skip(self, dataset, mode, batch), fields(dataset = %dataset, mode = mode.as_str(), offset = batch.offset), err)]
    async fn export_batch(
        &self,
        dataset: &Dataset,
        mode: ExportMode,
        batch: &ExportBatch,
    ) -> Result<Vec<JsonValue>, StoreError> {
        let query = ExportQuery::build(mode, dataset, batch);
        let [limit, offset, max_payload] = query.binds;
        sqlx::query_scalar(&query.sql)
            .bind(limit)
            .bind(offset)
            .bind(max_payload)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("export_batch", e))
    }

    async fn journal_insert(
        &self,
        owner: &str,
        operation: &str,
        payload: &JsonValue,
    ) -> Result<i64, StoreError> {
        sqlx::query_scalar(&format!(
            r#"INSERT INTO "{JOURNAL_TABLE}" (owner, operation, payload) VALUES ($1, $2, $3) RETURNING id"#
        ))
        .bind(owner)
        .bind(operation)
        .bind(payload)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("journal_insert", e))
    }

    async fn journal_delete(&self, id: i64) -> Result<(), StoreError> {
        sqlx::query(&format!(r#"DELETE FROM "{JOURNAL_TABLE}" WHERE id = $1"#))
            .bind(id)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("journal_delete", e))?;
        Ok(())
    }

    async fn journal_entries(&self, owner: &str) -> Result<Vec<RawJournalEntry>, StoreError> {
        let rows: Vec<(i64, String, String, JsonValue, DateTime<Utc>)> = sqlx::query_as(&format!(
            r#"
            SELECT id, owner, operation, payload, start_time
            FROM "{JOURNAL_TABLE}"
            WHERE owner = $1
            ORDER BY id ASC
            "#
        ))
        .bind(owner)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("journal_entries", e))?;

        Ok(rows
            .into_iter()
            .map(|(id, owner, operation, payload, start_time)| RawJournalEntry {
                id,
                owner,
                operation,
                payload,
                start_time,
            })
            .collect())
    }
}

/// Map SQLx errors to `StoreError`.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("42P01") => StoreError::DatasetNotFound(msg),
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => StoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}
