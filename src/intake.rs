use std::collections::HashMap;

use chrono::{
    TimeZone, Utc
};
use log::info;
use serde::Serialize;
use serde_json::Value;

use crate::{
    broker::Broker,
    config::Config,
    error::{
        BrokerError, IntakeError, ValidationError
    },
    job::{
        self,
        JobRequest,
    },
};

/// Parses and validates a job description, writes the initial record and
/// puts the job on this stage's queue. Returns the new job id.
pub async fn submit_raw(
    broker: &dyn Broker,
    config: &Config,
    raw: &str,
    endpoint: &str,
) -> Result<String, IntakeError> {
    let request: JobRequest = serde_json::from_str(raw)
        .map_err(ValidationError::Malformed)?;
    submit(broker, config, &request, endpoint).await
}

pub async fn submit(
    broker: &dyn Broker,
    config: &Config,
    request: &JobRequest,
    endpoint: &str,
) -> Result<String, IntakeError> {
    request.validate()?;
    let input = serde_json::to_string(request)
        .map_err(ValidationError::Malformed)?;

    let job_id = job::new_job_id();
    broker
        .hash_set(
            &config.record_key(&job_id),
            &[
                (job::FIELD_STATUS, job::QUEUED_STATUS.to_string()),
                (job::FIELD_INPUT, input),
                (job::FIELD_CREATED_AT, Utc::now().timestamp_millis().to_string()),
                (job::FIELD_ENDPOINT, endpoint.to_string()),
            ]
        )
        .await?;
    broker.enqueue(&config.queues.input, &job_id).await?;
    info!("[{job_id}] Queued for processing");
    Ok(job_id)
}

/// Client-facing view of a job record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatusView {
    pub request_id: String,

    pub status: String,

    pub stage_status: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `None` when no record exists for `job_id`.
pub async fn status(
    broker: &dyn Broker,
    config: &Config,
    job_id: &str,
) -> Result<Option<JobStatusView>, BrokerError> {
    let record = broker.hash_get_all(&config.record_key(job_id)).await?;
    if record.is_empty() {
        return Ok(None);
    }
    Ok(Some(view(job_id, &record, config)))
}

fn view(job_id: &str, record: &HashMap<String, String>, config: &Config) -> JobStatusView {
    let created_at = record.get(job::FIELD_CREATED_AT)
        .and_then(|ms| ms.parse::<i64>().ok())
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .map(|t| t.to_rfc3339());
    // results are stored as json text
    let result = record.get(job::FIELD_RESULT)
        .map(|raw| serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone())));
    JobStatusView {
        request_id: job_id.to_string(),
        status: record.get(job::FIELD_STATUS)
            .cloned()
            .unwrap_or_else(|| "unknown".to_string()),
        stage_status: record.get(&config.stage_field(job::STAGE_STATUS))
            .cloned()
            .unwrap_or_else(|| "pending".to_string()),
        created_at: created_at,
        result: result,
        error: record.get(job::FIELD_ERROR).cloned(),
    }
}
