//! Validation of the job request's `input` payload.
//!
//! The payload carries the workflow graph itself, an optional list of
//! base64-encoded input images to upload before submission, and an
//! optional callback URL for result delivery. The whole payload may
//! also arrive as a JSON-encoded string, which some callers produce.

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

/// An input image to upload before the workflow runs.
#[derive(Debug, Clone, Deserialize)]
pub struct InputImage {
    /// Filename the workflow references (e.g. via a LoadImage node).
    pub name: String,
    /// Base64-encoded image bytes.
    pub image: String,
}

/// A validated job input.
#[derive(Debug, Clone)]
pub struct JobInput {
    /// The workflow graph, passed through to ComfyUI as-is.
    pub workflow: Value,
    /// Images to upload before submission (may be empty).
    pub images: Vec<InputImage>,
    /// URL to POST the final result to, if the caller wants a push.
    pub callback: Option<String>,
}

#[derive(Debug, Error)]
pub enum InputError {
    #[error("Please provide input")]
    Missing,
    #[error("Invalid JSON format in input")]
    InvalidJson,
    #[error("Missing 'workflow' parameter")]
    MissingWorkflow,
    #[error("'images' must be a list of objects with 'name' and 'image' keys")]
    InvalidImages,
}

/// Validate the raw `input` field of a job request.
pub fn validate_input(raw: Option<&Value>) -> Result<JobInput, InputError> {
    let raw = raw.ok_or(InputError::Missing)?;
    if raw.is_null() {
        return Err(InputError::Missing);
    }

    // Accept the string-encoded form of the input object.
    let decoded;
    let input = match raw.as_str() {
        Some(text) => {
            decoded = serde_json::from_str::<Value>(text).map_err(|_| InputError::InvalidJson)?;
            &decoded
        }
        None => raw,
    };

    let workflow = input
        .get("workflow")
        .filter(|w| !w.is_null())
        .cloned()
        .ok_or(InputError::MissingWorkflow)?;

    let images = match input.get("images") {
        None | Some(Value::Null) => Vec::new(),
        Some(value) => {
            serde_json::from_value(value.clone()).map_err(|_| InputError::InvalidImages)?
        }
    };

    let callback = input
        .get("callback")
        .and_then(|c| c.as_str())
        .map(str::to_string);

    Ok(JobInput {
        workflow,
        images,
        callback,
    })
}
