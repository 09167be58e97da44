use std::sync::Arc;

use chrono::Utc;
use log::{
    error, info, warn
};
use tokio::{
    sync::watch,
    time::sleep,
};

use crate::{
    broker::Broker,
    config::Config,
    error::{
        BrokerError, JobError
    },
    job::{
        self,
        JobRequest, Payload, StageStatus,
    },
    tensor::ImageFetcher,
};

#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed,

    // carries the reason written to the record
    Failed(&'static str),
}

/// Consumes this stage's work queue, applies the transform and hands
/// completed jobs to the next stage.
pub struct Worker {
    broker: Arc<dyn Broker>,
    fetcher: ImageFetcher,
    config: Arc<Config>,
}

impl Worker {
    pub fn new(
        broker: Arc<dyn Broker>,
        fetcher: ImageFetcher,
        config: Arc<Config>,
    ) -> Self {
        Self {
            broker: broker,
            fetcher: fetcher,
            config: config,
        }
    }

    /// Runs until `shutdown` flips to true or its sender goes away. The signal
    /// is looked at between pops, which wait at most `worker.poll_ms`, so a
    /// pop is never abandoned while the store may still deliver it. A job in
    /// progress is finished first.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let queue = self.config.queues.input.clone();
        info!("Stage worker is waiting for jobs on `{queue}`.");
        while !stopping(&shutdown) {
            match self.broker.dequeue_blocking(&queue, self.config.worker.poll()).await {
                Ok(Some(job_id)) => {
                    info!("Picked job `{job_id}`");
                    if let Err(e) = self.process_job(&job_id).await {
                        //@ the pop is consumed, so the record may be left in `started`
                        error!("Store unavailable while handling job `{job_id}`: `{e}`");
                    }
                },

                Ok(None) => {},

                Err(e) => {
                    warn!(
                        "Dequeue from `{queue}` failed, retrying in {:?}: `{e}`",
                        self.config.worker.backoff()
                    );
                    // nothing is in flight here, so the pause can be cut short
                    tokio::select! {
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        },
                        _ = sleep(self.config.worker.backoff()) => {},
                    }
                },
            }
        }
        info!("Stage worker stopped.");
    }

    /// Takes one claimed job to a terminal status. Job-level failures are
    /// recorded and reported as `JobOutcome::Failed`; only store errors while
    /// writing the outcome come back as `Err`.
    pub async fn process_job(&self, job_id: &str) -> Result<JobOutcome, BrokerError> {
        info!("Processing job `{job_id}`");
        let key = self.config.record_key(job_id);
        if let Err(e) = self.mark(&key, StageStatus::Started).await {
            warn!("Failed to mark job `{job_id}` as started: `{e}`");
        }

        match self.run_job(&key).await {
            Ok(result) => {
                self.complete(&key, result).await?;
                self.broker.handoff(&self.config.queues.next, job_id).await?;
                info!(
                    "Job `{job_id}` is processed and handed to `{}`",
                    self.config.queues.next
                );
                Ok(JobOutcome::Completed)
            },

            Err(e) => {
                warn!("Job `{job_id}` failed: `{e}`");
                self.fail(&key, e.reason()).await?;
                Ok(JobOutcome::Failed(e.reason()))
            },
        }
    }

    // returns the serialized payload to hand on
    async fn run_job(&self, key: &str) -> Result<String, JobError> {
        let input = self.broker
            .hash_get(key, job::FIELD_INPUT)
            .await
            .map_err(JobError::InputUnreadable)?
            .ok_or(JobError::InputNotFound)?;
        let request = JobRequest::from_json(&input)?;
        let result = match request.payload()? {
            Payload::Image(url) => {
                let tensor = self.fetcher.image_to_tensor(&url).await?;
                serde_json::to_string(&tensor.flatten())?
            },

            other => serde_json::to_string(&other.to_value())?,
        };
        Ok(result)
    }

    async fn mark(&self, key: &str, status: StageStatus) -> Result<(), BrokerError> {
        let stage_status = self.config.stage_field(job::STAGE_STATUS);
        self.broker
            .hash_set(key, &[(stage_status.as_str(), status.as_str().to_string())])
            .await
    }

    async fn complete(&self, key: &str, result: String) -> Result<(), BrokerError> {
        let status = StageStatus::Completed;
        let stage_status = self.config.stage_field(job::STAGE_STATUS);
        let stage_result = self.config.stage_field(job::STAGE_RESULT);
        let stage_time = self.config.stage_field(job::STAGE_TIME);
        self.broker
            .hash_replace(
                key,
                &[
                    (stage_status.as_str(), status.as_str().to_string()),
                    (job::FIELD_STATUS, status.pipeline_status().unwrap_or_default().to_string()),
                    (job::FIELD_RESULT, result.clone()),
                    (stage_result.as_str(), result),
                    (stage_time.as_str(), Utc::now().timestamp().to_string()),
                ],
                // left over from an earlier failed run
                &[job::FIELD_ERROR],
            )
            .await
    }

    async fn fail(&self, key: &str, reason: &str) -> Result<(), BrokerError> {
        let status = StageStatus::Failed;
        let stage_status = self.config.stage_field(job::STAGE_STATUS);
        let stage_result = self.config.stage_field(job::STAGE_RESULT);
        self.broker
            .hash_replace(
                key,
                &[
                    (stage_status.as_str(), status.as_str().to_string()),
                    (job::FIELD_STATUS, status.pipeline_status().unwrap_or_default().to_string()),
                    (job::FIELD_ERROR, reason.to_string()),
                ],
                // left over from an earlier successful run
                &[job::FIELD_RESULT, stage_result.as_str()],
            )
            .await
    }
}

// true once shutdown was requested or can no longer be requested
fn stopping(shutdown: &watch::Receiver<bool>) -> bool {
    let requested = *shutdown.borrow();
    requested || shutdown.has_changed().is_err()
}

/// Periodically stamps `last_alive` so operators can tell the stage is up.
pub async fn heartbeat(
    broker: Arc<dyn Broker>,
    config: Arc<Config>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(config.worker.heartbeat());
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            },

            _ = ticker.tick() => {
                let now = Utc::now().timestamp().to_string();
                if let Err(e) = broker
                    .hash_set(&config.worker.metrics_key, &[("last_alive", now)])
                    .await
                {
                    warn!("Heartbeat failed: `{e}`");
                }
            },
        }
    }
}
