use std::time::Instant;

use chrono::Utc;
use log::warn;
use serde::Serialize;

use crate::{
    broker::Broker,
    config::Config,
    error::ValidationError,
    job::{
        JobRequest, Payload,
    },
};

pub const STEPS: [&str; 3] = ["validate", "normalize", "cleaned"];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessResponse {
    pub processed_data: Vec<f64>,

    pub steps: Vec<String>,

    // milliseconds
    pub duration: f64,

    pub service: String,
}

/// Scales every value by the maximum so the largest becomes 1. Data whose
/// maximum is not positive is returned unchanged.
pub fn normalize(values: &[f64]) -> Vec<f64> {
    let max = values.iter().copied().fold(0.0_f64, f64::max);
    if max > 0.0 {
        values.iter().map(|v| v / max).collect()
    } else {
        values.to_vec()
    }
}

/// Handles a numeric job inline, without going through the queue.
pub async fn process_now(
    broker: &dyn Broker,
    config: &Config,
    request: &JobRequest,
) -> Result<ProcessResponse, ValidationError> {
    let start = Instant::now();
    let values: Vec<f64> = match request.payload() {
        Ok(Payload::Numeric(numbers)) => numbers.iter()
            .filter_map(|n| n.as_f64())
            .collect(),

        _ => return Err(ValidationError::NotNumeric),
    };
    let processed = normalize(&values);

    let line = format!(
        "Processed {} values at {}",
        values.len(),
        Utc::now().to_rfc3339()
    );
    if let Err(e) = broker.enqueue(&config.queues.logs, &line).await {
        warn!("Failed to append processing log: `{e}`");
    }

    Ok(ProcessResponse {
        processed_data: processed,
        steps: STEPS.iter().map(|s| s.to_string()).collect(),
        duration: start.elapsed().as_secs_f64() * 1000.0,
        service: config.service_name.clone(),
    })
}
