//! Error bodies returned by the ingestion API.
//!
//! The pipeline API is not consistent about its error shape. Validation
//! failures carry a `detail` list of `{loc, msg}` entries, most other errors a
//! `detail` string, and some proxies in front of it answer with `message`,
//! `error` or plain text. [`UpstreamErrorBody::parse`] picks the most specific
//! shape present, in that order.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One entry of a validation `detail` list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    /// Location path, e.g. `["body", "file"]`.
    pub loc: Vec<String>,
    pub msg: Option<String>,
}

impl FieldError {
    fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let loc: Vec<String> = obj
            .get("loc")
            .and_then(Value::as_array)
            .map(|parts| parts.iter().map(loc_segment).collect())
            .unwrap_or_default();
        let msg = obj.get("msg").and_then(Value::as_str).map(str::to_string);
        if loc.is_empty() && msg.is_none() {
            return None;
        }
        Some(Self { loc, msg })
    }

    /// Dotted location path, falling back to the message when no location
    /// was given.
    pub fn path(&self) -> String {
        if self.loc.is_empty() {
            self.msg.clone().unwrap_or_default()
        } else {
            self.loc.join(".")
        }
    }
}

fn loc_segment(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Error payload of a non-success upstream response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamErrorBody {
    FieldErrors(Vec<FieldError>),
    Detail(String),
    Message(String),
    Error(String),
    Raw(String),
}

impl UpstreamErrorBody {
    /// Classify a response body. Never fails: anything unrecognised is kept
    /// as raw text.
    pub fn parse(body: &str) -> Self {
        match serde_json::from_str::<Value>(body) {
            Ok(value) => Self::from_value(&value).unwrap_or_else(|| Self::Raw(body.trim().to_string())),
            Err(_) => Self::Raw(body.trim().to_string()),
        }
    }

    /// Classify an already parsed JSON value. Returns `None` when it carries
    /// none of the known fields.
    pub fn from_value(value: &Value) -> Option<Self> {
        if let Value::String(text) = value {
            return non_empty(text).map(Self::Raw);
        }
        let obj = value.as_object()?;

        match obj.get("detail") {
            Some(Value::Array(items)) => {
                let fields: Vec<FieldError> =
                    items.iter().filter_map(FieldError::from_value).collect();
                if !fields.is_empty() {
                    return Some(Self::FieldErrors(fields));
                }
            }
            Some(Value::String(detail)) => {
                if let Some(detail) = non_empty(detail) {
                    return Some(Self::Detail(detail));
                }
            }
            _ => {}
        }

        if let Some(message) = obj.get("message").and_then(Value::as_str).and_then(non_empty) {
            return Some(Self::Message(message));
        }
        if let Some(error) = obj.get("error").and_then(Value::as_str).and_then(non_empty) {
            return Some(Self::Error(error));
        }
        None
    }

    /// Human readable message. Field errors are rendered as
    /// `<missing_fields_prefix>: body.file, body.title`.
    pub fn describe(&self, missing_fields_prefix: &str) -> String {
        match self {
            Self::FieldErrors(fields) => {
                let paths: Vec<String> = fields.iter().map(FieldError::path).collect();
                format!("{}: {}", missing_fields_prefix, paths.join(", "))
            }
            Self::Detail(text) | Self::Message(text) | Self::Error(text) | Self::Raw(text) => {
                text.clone()
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Raw(text) if text.is_empty())
    }
}

fn non_empty(text: &str) -> Option<String> {
    let trimmed = text.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
