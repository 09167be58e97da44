use chrono::Utc;
use serde::{
    Deserialize, Deserializer, Serialize
};
use serde_json::{
    Number, Value
};
use uuid::Uuid;

use crate::error::{
    JobError, ValidationError
};

pub const IMAGE_TYPE: &str = "image";

// record fields shared by every stage
pub const FIELD_INPUT: &str = "input";
pub const FIELD_STATUS: &str = "status";
pub const FIELD_RESULT: &str = "result";
pub const FIELD_ERROR: &str = "error";
pub const FIELD_CREATED_AT: &str = "created_at";
pub const FIELD_ENDPOINT: &str = "endpoint";

// per-stage field suffixes, see `Config::stage_field`
pub const STAGE_STATUS: &str = "status";
pub const STAGE_RESULT: &str = "result";
pub const STAGE_TIME: &str = "time";

// a missing field and an explicit `null` both mean the default
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Carried along with the job; only intake looks at the values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    #[serde(default, deserialize_with = "null_as_default")]
    pub width: i64,

    #[serde(default, deserialize_with = "null_as_default")]
    pub height: i64,

    #[serde(default, deserialize_with = "null_as_default")]
    pub quality: i64,
}

/// Job description as written to the record's `input` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    #[serde(default)]
    pub data: Value,

    #[serde(rename = "type", default, deserialize_with = "null_as_default")]
    pub kind: String,

    #[serde(default, deserialize_with = "null_as_default")]
    pub options: JobOptions,
}

/// The `data` field resolved against the declared type.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Image(String),

    // numbers keep their original textual form on passthrough
    Numeric(Vec<Number>),

    Other(Value),
}

impl Payload {
    pub fn to_value(&self) -> Value {
        match self {
            Payload::Image(url) => Value::String(url.clone()),
            Payload::Numeric(values) => Value::Array(
                values.iter().cloned().map(Value::Number).collect()
            ),
            Payload::Other(value) => value.clone(),
        }
    }
}

impl JobRequest {
    pub fn from_json(raw: &str) -> Result<Self, JobError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn is_image(&self) -> bool {
        self.kind == IMAGE_TYPE
    }

    pub fn payload(&self) -> Result<Payload, JobError> {
        if self.is_image() {
            return match &self.data {
                Value::String(url) if !url.is_empty() => Ok(Payload::Image(url.clone())),
                _ => Err(JobError::InvalidImageUrl),
            };
        }
        if let Value::Array(items) = &self.data {
            let numbers: Option<Vec<Number>> = items.iter()
                .map(|item| match item {
                    Value::Number(n) => Some(n.clone()),
                    _ => None,
                })
                .collect();
            if let Some(numbers) = numbers {
                return Ok(Payload::Numeric(numbers));
            }
        }
        Ok(Payload::Other(self.data.clone()))
    }

    /// Intake-side checks, stricter than what the worker enforces.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !self.is_image() {
            return Ok(());
        }
        if !matches!(self.payload(), Ok(Payload::Image(_))) {
            return Err(ValidationError::MissingImageUrl);
        }
        for (name, value) in [
            ("width", self.options.width),
            ("height", self.options.height),
            ("quality", self.options.quality),
        ] {
            if value == 0 {
                return Err(ValidationError::MissingOption(name));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
    Started,
    Completed,
    Failed,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Started => "started",
            StageStatus::Completed => "completed",
            StageStatus::Failed => "failed",
        }
    }

    // vocabulary of the pipeline-wide `status` field
    pub fn pipeline_status(&self) -> Option<&'static str> {
        match self {
            StageStatus::Started => None,
            StageStatus::Completed => Some("Processed"),
            StageStatus::Failed => Some("failed"),
        }
    }
}

pub const QUEUED_STATUS: &str = "queued";

// e.g. `req_1718031234567_3f9a0c1b2`
pub fn new_job_id() -> String {
    format!(
        "req_{}_{}",
        Utc::now().timestamp_millis(),
        &Uuid::new_v4().simple().to_string()[..9]
    )
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn image_payload_needs_a_url() {
        let req = JobRequest::from_json(r#"{"data":"http://x/cat.png","type":"image"}"#).unwrap();
        assert_eq!(req.payload().unwrap(), Payload::Image("http://x/cat.png".into()));

        for raw in [
            r#"{"data":"","type":"image"}"#,
            r#"{"data":[1,2],"type":"image"}"#,
            r#"{"type":"image"}"#,
        ] {
            let req = JobRequest::from_json(raw).unwrap();
            assert!(matches!(req.payload(), Err(JobError::InvalidImageUrl)), "{raw}");
        }
    }

    #[test]
    fn numeric_payload_keeps_number_form() {
        let req = JobRequest::from_json(r#"{"data":[1,2.5,3],"type":"numeric"}"#).unwrap();
        let payload = req.payload().unwrap();
        assert!(matches!(payload, Payload::Numeric(ref v) if v.len() == 3));
        assert_eq!(serde_json::to_string(&payload.to_value()).unwrap(), "[1,2.5,3]");
    }

    #[test]
    fn anything_else_is_opaque() {
        let req = JobRequest::from_json(r#"{"data":{"k":[1,"a"]},"type":"text"}"#).unwrap();
        assert_eq!(req.payload().unwrap(), Payload::Other(json!({"k":[1,"a"]})));
        let mixed = JobRequest::from_json(r#"{"data":[1,"a"]}"#).unwrap();
        assert_eq!(mixed.payload().unwrap(), Payload::Other(json!([1, "a"])));
    }

    #[test]
    fn nulls_and_signed_options_are_accepted() {
        let req = JobRequest::from_json(
            r#"{"data":[1,2,3],"type":"numeric","options":{"width":-1,"height":null}}"#
        ).unwrap();
        assert_eq!(req.options, JobOptions { width: -1, height: 0, quality: 0 });
        assert!(matches!(req.payload().unwrap(), Payload::Numeric(_)));

        let req = JobRequest::from_json(r#"{"data":[1],"type":null,"options":null}"#).unwrap();
        assert_eq!(req.kind, "");
        assert_eq!(req.options, JobOptions::default());
        assert!(req.validate().is_ok());
    }

    #[test]
    fn wrong_field_types_are_invalid_json() {
        let err = JobRequest::from_json(r#"{"data":"u","type":"image","options":{"width":"wide"}}"#)
            .unwrap_err();
        assert_eq!(err.reason(), "invalid json");
    }

    #[test]
    fn intake_requires_image_options() {
        let mut req = JobRequest {
            data: json!("http://x/cat.png"),
            kind: IMAGE_TYPE.into(),
            options: JobOptions { width: 1, height: 1, quality: 1 },
        };
        assert!(req.validate().is_ok());
        req.options.quality = 0;
        assert!(matches!(req.validate(), Err(ValidationError::MissingOption("quality"))));
        req.data = json!("");
        assert!(matches!(req.validate(), Err(ValidationError::MissingImageUrl)));

        let numeric = JobRequest {
            data: json!([1, 2, 3]),
            kind: "numeric".into(),
            options: JobOptions::default(),
        };
        assert!(numeric.validate().is_ok());
    }

    #[test]
    fn job_ids_are_unique() {
        let a = new_job_id();
        let b = new_job_id();
        assert!(a.starts_with("req_"));
        assert_ne!(a, b);
    }
}
