use std::{
    env,
    fs,
    time::Duration,
};

use anyhow::Context;
use serde::Deserialize;

// the value of `redis_url` that selects the in-process broker
pub const MEMORY_BROKER_URL: &str = "memory://";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub host: String,

    pub port: u16,

    // actix worker threads
    pub workers: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3002,
            workers: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    // jobs waiting for this stage
    pub input: String,

    // jobs handed to the inference stage
    pub next: String,

    // log lines of synchronous processing
    pub logs: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            input: "queue:processing".to_string(),
            next: "queue:rust_inference".to_string(),
            logs: "data_processing_logs".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub timeout_secs: u64,

    pub user_agent: String,
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            user_agent: "Mozilla/5.0 (compatible; DataProcessor/1.0)".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    // pause after a failed dequeue
    pub backoff_ms: u64,

    // longest single wait on the work queue before shutdown is looked at again
    pub poll_ms: u64,

    pub heartbeat_secs: u64,

    // hash that receives `last_alive`
    pub metrics_key: String,
}

impl WorkerConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn poll(&self) -> Duration {
        Duration::from_millis(self.poll_ms.max(10))
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            backoff_ms: 1000,
            poll_ms: 1000,
            heartbeat_secs: 30,
            metrics_key: "service_metrics:data-processor".to_string(),
        }
    }
}

/// Runtime configuration, read from an optional TOML file and then
/// overridden by the environment and the command line.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub service_name: String,

    pub redis_url: String,

    // record key = prefix + job id
    pub record_prefix: String,

    // per-stage record fields are `<prefix>_status`, `<prefix>_result` and `<prefix>_time`
    pub stage_field_prefix: String,

    pub http: HttpConfig,

    pub queues: QueueConfig,

    pub fetch: FetchConfig,

    pub worker: WorkerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: "data-processor".to_string(),
            redis_url: "redis://127.0.0.1:6379".to_string(),
            record_prefix: "request:".to_string(),
            stage_field_prefix: "go".to_string(),
            http: HttpConfig::default(),
            queues: QueueConfig::default(),
            fetch: FetchConfig::default(),
            worker: WorkerConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: Option<&str>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_toml(
                &fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file `{path}`"))?
            )?,

            None => Self::default(),
        };
        if let Ok(url) = env::var("REDIS_URL") {
            config.redis_url = url;
        }
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> anyhow::Result<Self> {
        toml::from_str(raw).context("Invalid config file")
    }

    pub fn uses_memory_broker(&self) -> bool {
        self.redis_url == MEMORY_BROKER_URL
    }

    pub fn record_key(&self, job_id: &str) -> String {
        format!("{}{}", self.record_prefix, job_id)
    }

    pub fn stage_field(&self, suffix: &str) -> String {
        format!("{}_{}", self.stage_field_prefix, suffix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_pipeline_layout() {
        let config = Config::default();
        assert_eq!(config.queues.input, "queue:processing");
        assert_eq!(config.queues.next, "queue:rust_inference");
        assert_eq!(config.fetch.timeout(), Duration::from_secs(10));
        assert_eq!(config.record_key("req_1"), "request:req_1");
        assert_eq!(config.stage_field("result"), "go_result");
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let config = Config::from_toml(r#"
            redis_url = "memory://"
            stage_field_prefix = "pre"

            [http]
            port = 8080

            [worker]
            backoff_ms = 50
        "#).unwrap();
        assert!(config.uses_memory_broker());
        assert_eq!(config.http.port, 8080);
        assert_eq!(config.http.host, "0.0.0.0");
        assert_eq!(config.worker.backoff(), Duration::from_millis(50));
        assert_eq!(config.worker.heartbeat_secs, 30);
        assert_eq!(config.worker.poll(), Duration::from_secs(1));
        assert_eq!(config.stage_field("status"), "pre_status");
    }

    #[test]
    fn shipped_config_parses() {
        let config = Config::from_toml(include_str!("../processor.toml")).unwrap();
        assert_eq!(config.redis_url, "redis://redis:6379");
        assert_eq!(config.http.port, 3002);
        assert_eq!(config.worker.metrics_key, "service_metrics:data-processor");
        assert_eq!(config.worker.poll_ms, 1000);
    }

    #[test]
    fn zero_poll_never_means_wait_forever() {
        let config = Config::from_toml("[worker]\npoll_ms = 0").unwrap();
        assert_eq!(config.worker.poll(), Duration::from_millis(10));
    }

    #[test]
    fn malformed_file_is_rejected() {
        assert!(Config::from_toml("[http]\nport = \"eighty\"").is_err());
    }
}
