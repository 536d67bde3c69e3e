//! Export query builders.
//!
//! Each export mode maps to one parameterized statement. Pages are windowed
//! in SQL: a running `SUM(pg_column_size(..))` over the page's ordering plus
//! `ROW_NUMBER()`, keeping rows while the running size fits the budget and
//! always the first row. The statement returns one JSON object per row.

use strata_core::JobState;

use super::r#trait::{ExportBatch, ExportMode};
use crate::dataset::Dataset;

/// A prepared export statement and its bind values (`$1` limit, `$2` offset,
/// `$3` max payload bytes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportQuery {
    pub sql: String,
    pub binds: [i64; 3],
}

impl ExportQuery {
    pub fn build(mode: ExportMode, dataset: &Dataset, batch: &ExportBatch) -> Self {
        let sql = match mode {
            ExportMode::Complete => complete_sql(dataset),
            ExportMode::StatusOnly => status_only_sql(dataset),
            ExportMode::FailedOnly => failed_only_sql(dataset),
        };
        Self {
            sql,
            binds: [
                i64::try_from(batch.limit).unwrap_or(i64::MAX),
                i64::try_from(batch.offset).unwrap_or(i64::MAX),
                i64::try_from(batch.max_payload_bytes).unwrap_or(i64::MAX),
            ],
        }
    }

    /// Statement counting the rows an export will produce.
    pub fn count(mode: ExportMode, dataset: &Dataset) -> String {
        match mode {
            ExportMode::Complete => format!(r#"SELECT COUNT(*) FROM "{}""#, dataset.job_table),
            ExportMode::StatusOnly => format!(r#"SELECT COUNT(*) FROM "{}""#, dataset.status_table),
            ExportMode::FailedOnly => format!(
                r#"{latest}
SELECT COUNT(*)
FROM "{jobs}" j
JOIN latest l ON l.job_id = j.job_id
WHERE l.job_state IN ({failed})"#,
                latest = latest_status_cte(dataset),
                jobs = dataset.job_table,
                failed = failure_states(),
            ),
        }
    }
}

fn failure_states() -> String {
    format!(
        "'{}', '{}'",
        JobState::Failed.as_str(),
        JobState::Aborted.as_str()
    )
}

fn latest_status_cte(dataset: &Dataset) -> String {
    format!(
        r#"WITH latest AS (
    SELECT DISTINCT ON (s.job_id) s.*
    FROM "{status}" s
    ORDER BY s.job_id, s.id DESC
)"#,
        status = dataset.status_table
    )
}

fn windowed(page: &str, size_column: &str, order: &str) -> String {
    format!(
        r#"{page},
windowed AS (
    SELECT p.*,
           SUM(pg_column_size(p.{size_column})) OVER (ORDER BY {order}) AS running_payload_size,
           ROW_NUMBER() OVER (ORDER BY {order}) AS row_num
    FROM page p
)
SELECT to_jsonb(w) - 'running_payload_size' - 'row_num' AS row
FROM windowed w
WHERE w.running_payload_size <= $3 OR w.row_num = 1
ORDER BY {order}"#
    )
}

fn complete_sql(dataset: &Dataset) -> String {
    let page = format!(
        r#"WITH page AS (
    SELECT *
    FROM "{jobs}"
    ORDER BY job_id ASC
    LIMIT $1 OFFSET $2
)"#,
        jobs = dataset.job_table
    );
    windowed(&page, "event_payload", "job_id ASC")
}

fn status_only_sql(dataset: &Dataset) -> String {
    let page = format!(
        r#"WITH page AS (
    SELECT *
    FROM "{status}"
    ORDER BY job_id ASC, id ASC
    LIMIT $1 OFFSET $2
)"#,
        status = dataset.status_table
    );
    windowed(&page, "error_response", "job_id ASC, id ASC")
}

fn failed_only_sql(dataset: &Dataset) -> String {
    let page = format!(
        r#"{latest},
page AS (
    SELECT j.job_id, j.workspace_id, j.uuid, j.user_id, j.parameters, j.custom_val,
           j.event_payload, j.event_count, j.created_at, j.expire_at,
           l.id AS status_id, l.job_state, l.attempt, l.exec_time, l.retry_time,
           l.error_code, l.error_response, l.parameters AS status_parameters
    FROM "{jobs}" j
    JOIN latest l ON l.job_id = j.job_id
    WHERE l.job_state IN ({failed})
    ORDER BY j.custom_val ASC, j.job_id ASC, l.exec_time ASC
    LIMIT $1 OFFSET $2
)"#,
        latest = latest_status_cte(dataset),
        jobs = dataset.job_table,
        failed = failure_states(),
    );
    windowed(
        &page,
        "event_payload",
        "custom_val ASC, job_id ASC, exec_time ASC",
    )
}
