//! Jobs and job status rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use strata_core::{JobId, JobState, TenantId};

/// An enqueued unit of work. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: JobId,
    pub workspace_id: TenantId,
    pub uuid: Uuid,
    pub user_id: String,
    pub parameters: JsonValue,
    pub custom_val: String,
    pub event_payload: JsonValue,
    pub event_count: i32,
    pub created_at: DateTime<Utc>,
    pub expire_at: Option<DateTime<Utc>>,
}

/// A job as submitted by a producer; the store assigns id and creation time.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub workspace_id: TenantId,
    pub uuid: Uuid,
    pub user_id: String,
    pub parameters: JsonValue,
    pub custom_val: String,
    pub event_payload: JsonValue,
    pub event_count: i32,
    pub expire_at: Option<DateTime<Utc>>,
}

impl NewJob {
    pub fn new(workspace_id: TenantId, custom_val: impl Into<String>, event_payload: JsonValue) -> Self {
        Self {
            workspace_id,
            uuid: Uuid::new_v4(),
            user_id: String::new(),
            parameters: JsonValue::Object(Default::default()),
            custom_val: custom_val.into(),
            event_payload,
            event_count: 1,
            expire_at: None,
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = user_id.into();
        self
    }

    pub fn with_parameters(mut self, parameters: JsonValue) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_event_count(mut self, count: i32) -> Self {
        self.event_count = count;
        self
    }

    pub fn with_expiry(mut self, expire_at: DateTime<Utc>) -> Self {
        self.expire_at = Some(expire_at);
        self
    }

    pub(crate) fn into_job(self, job_id: JobId, created_at: DateTime<Utc>) -> Job {
        Job {
            job_id,
            workspace_id: self.workspace_id,
            uuid: self.uuid,
            user_id: self.user_id,
            parameters: self.parameters,
            custom_val: self.custom_val,
            event_payload: self.event_payload,
            event_count: self.event_count,
            created_at,
            expire_at: self.expire_at,
        }
    }
}

/// One recorded state transition of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub id: i64,
    pub job_id: JobId,
    pub job_state: JobState,
    pub attempt: u32,
    pub exec_time: DateTime<Utc>,
    pub retry_time: DateTime<Utc>,
    pub error_code: String,
    pub error_response: JsonValue,
    pub parameters: JsonValue,
}

/// A status update reported by a consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct NewStatus {
    pub job_id: JobId,
    pub job_state: JobState,
    pub attempt: u32,
    pub exec_time: DateTime<Utc>,
    pub retry_time: DateTime<Utc>,
    pub error_code: String,
    pub error_response: JsonValue,
    pub parameters: JsonValue,
}

impl NewStatus {
    pub fn new(job_id: JobId, job_state: JobState, attempt: u32) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            job_state,
            attempt,
            exec_time: now,
            retry_time: now,
            error_code: String::new(),
            error_response: JsonValue::Object(Default::default()),
            parameters: JsonValue::Object(Default::default()),
        }
    }

    pub fn with_error(mut self, code: impl Into<String>, response: JsonValue) -> Self {
        self.error_code = code.into();
        self.error_response = response;
        self
    }

    pub fn with_retry_at(mut self, retry_time: DateTime<Utc>) -> Self {
        self.retry_time = retry_time;
        self
    }

    pub fn with_parameters(mut self, parameters: JsonValue) -> Self {
        self.parameters = parameters;
        self
    }

    pub(crate) fn into_status(self, id: i64) -> JobStatus {
        JobStatus {
            id,
            job_id: self.job_id,
            job_state: self.job_state,
            attempt: self.attempt,
            exec_time: self.exec_time,
            retry_time: self.retry_time,
            error_code: self.error_code,
            error_response: self.error_response,
            parameters: self.parameters,
        }
    }
}

/// Row shape of a failed-only export: the job and its latest failure status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedJobRow {
    #[serde(flatten)]
    pub job: Job,
    pub status_id: i64,
    pub job_state: JobState,
    pub attempt: u32,
    pub exec_time: DateTime<Utc>,
    pub retry_time: DateTime<Utc>,
    pub error_code: String,
    pub error_response: JsonValue,
    pub status_parameters: JsonValue,
}

impl FailedJobRow {
    pub fn new(job: Job, status: JobStatus) -> Self {
        Self {
            job,
            status_id: status.id,
            job_state: status.job_state,
            attempt: status.attempt,
            exec_time: status.exec_time,
            retry_time: status.retry_time,
            error_code: status.error_code,
            error_response: status.error_response,
            status_parameters: status.parameters,
        }
    }
}

/// Serialized size of a JSON value, used to bound export batches.
pub(crate) fn payload_size(value: &JsonValue) -> u64 {
    serde_json::to_vec(value).map(|bytes| bytes.len() as u64).unwrap_or(0)
}
