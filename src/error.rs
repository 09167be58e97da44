use std::time::Duration;

use thiserror::Error;

/// Failures of the image-to-tensor transform. Every variant is terminal for
/// the job that triggered it.
#[derive(Debug, Error)]
pub enum TransformError {
    #[error("HTTP error while fetching image: {0}")]
    Fetch(#[from] reqwest::Error),
    #[error("image fetch timed out after {0:?}")]
    Timeout(Duration),
    #[error("bad response status: {0}")]
    Status(reqwest::StatusCode),
    #[error("image decode error: {0}")]
    Decode(#[from] image::ImageError),
    #[error("image decode task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl TransformError {
    pub fn is_fetch(&self) -> bool {
        matches!(
            self,
            TransformError::Fetch(_) | TransformError::Timeout(_) | TransformError::Status(_)
        )
    }

    pub fn is_decode(&self) -> bool {
        matches!(self, TransformError::Decode(_))
    }
}

/// The shared store or queue could not be reached.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Job-level failures. They are written to the job record and never escape
/// the worker loop.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("input not found")]
    InputNotFound,
    #[error("input could not be read: {0}")]
    InputUnreadable(#[source] BrokerError),
    #[error("invalid json: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("invalid image url")]
    InvalidImageUrl,
    #[error("image processing failed: {0}")]
    Transform(#[from] TransformError),
}

impl JobError {
    /// Short machine-readable reason stored in the record's `error` field.
    pub fn reason(&self) -> &'static str {
        match self {
            JobError::InputNotFound | JobError::InputUnreadable(_) => "input not found",
            JobError::InvalidJson(_) => "invalid json",
            JobError::InvalidImageUrl => "invalid image url",
            JobError::Transform(_) => "image processing failed",
        }
    }
}

/// Rejections raised at intake, before anything is written.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("invalid job description: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("image jobs need a non-empty url in `data`")]
    MissingImageUrl,
    #[error("image jobs need non-zero `options.{0}`")]
    MissingOption(&'static str),
    #[error("`data` must be a list of numbers")]
    NotNumeric,
}

#[derive(Debug, Error)]
pub enum IntakeError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    #[error(transparent)]
    Store(#[from] BrokerError),
}
