//! Shared JSON output schema types.
//!
//! All stdout output is JSON only; tracing logs go to stderr. Schema version
//! is fixed at "0.1". This keeps the envelope shape the teacher uses for its
//! CLI responses (`Response<T>`/`ErrorResponse`, a single `print_json_to_stdout`
//! choke point) while the payload types name scheduler concepts instead of a
//! single job runner's concepts.

use serde::{Deserialize, Serialize};

pub const SCHEMA_VERSION: &str = "0.1";

/// Serialize `value` to a JSON string and print it as a single line to
/// stdout. The single place where stdout JSON output is written.
fn print_json_to_stdout(value: &impl Serialize) {
    println!("{}", serde_json::to_string(value).expect("JSON serialization failed"));
}

/// Top-level envelope used for every successful response.
#[derive(Debug, Serialize, Deserialize)]
pub struct Response<T: Serialize> {
    pub schema_version: &'static str,
    pub ok: bool,
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(flatten)]
    pub data: T,
}

impl<T: Serialize> Response<T> {
    pub fn new(kind: &'static str, data: T) -> Self {
        Response {
            schema_version: SCHEMA_VERSION,
            ok: true,
            kind,
            data,
        }
    }

    pub fn print(&self) {
        print_json_to_stdout(self);
    }
}

/// Top-level envelope for error responses.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub schema_version: &'static str,
    pub ok: bool,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

impl ErrorResponse {
    pub fn new(code: impl Into<String>, message: impl Into<String>, retryable: bool) -> Self {
        ErrorResponse {
            schema_version: SCHEMA_VERSION,
            ok: false,
            kind: "error",
            error: ErrorDetail {
                code: code.into(),
                message: message.into(),
                retryable,
            },
        }
    }

    pub fn print(&self) {
        print_json_to_stdout(self);
    }
}

// ---------- Command-specific response payloads ----------

/// Response for `submit`.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitData {
    pub request_id: i64,
}

/// Response for `cancel`.
#[derive(Debug, Serialize, Deserialize)]
pub struct CancelData {
    pub request_id: i64,
    pub job_id: i64,
}

/// Response for `status`.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusData {
    pub job_id: i64,
    pub job_type: String,
    pub state: String,
    pub description: String,
    pub result: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_date_actual: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_date: Option<i64>,
}

/// Summary of a single job, included in `list` responses.
#[derive(Debug, Serialize, Deserialize)]
pub struct JobSummary {
    pub job_id: i64,
    pub job_type: String,
    pub state: String,
    pub priority: i32,
    pub submit_date: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_date_actual: Option<i64>,
}

/// Response for `list`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ListData {
    pub jobs: Vec<JobSummary>,
    pub truncated: bool,
}
