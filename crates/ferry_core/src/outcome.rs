use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{FerryError, Tuple};

/// Marker some servers put before the useful part of a verbose error.
const ERROR_MESSAGE_MARKER: &str = "error message:";

/// Structured per-tuple failure reason.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TupleError {
    pub code: String,
    pub message: String,
}

impl TupleError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Build a reason from raw server text, keeping only what follows the
    /// `error message:` marker when the server includes one.
    pub fn from_server_text(code: impl Into<String>, raw: &str) -> Self {
        Self::new(code, extract_reason(raw))
    }
}

impl From<&FerryError> for TupleError {
    fn from(err: &FerryError) -> Self {
        Self::from_server_text(err.code(), err.message())
    }
}

impl fmt::Display for TupleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

pub fn extract_reason(raw: &str) -> &str {
    match raw.find(ERROR_MESSAGE_MARKER) {
        Some(idx) => raw[idx + ERROR_MESSAGE_MARKER.len()..].trim(),
        None => raw,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Write,
    Delete,
}

/// What the client reports for one tuple of a batch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TupleOutcome {
    pub tuple: Tuple,
    pub operation: Operation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TupleError>,
}

impl TupleOutcome {
    pub fn succeeded(tuple: Tuple, operation: Operation) -> Self {
        Self {
            tuple,
            operation,
            error: None,
        }
    }

    pub fn failed(tuple: Tuple, operation: Operation, error: TupleError) -> Self {
        Self {
            tuple,
            operation,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FailedTuple {
    pub tuple: Tuple,
    pub reason: TupleError,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ImportResult {
    pub successful: Vec<Tuple>,
    pub failed: Vec<FailedTuple>,
}

impl ImportResult {
    pub fn success_count(&self) -> usize {
        self.successful.len()
    }

    pub fn failure_count(&self) -> usize {
        self.failed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.successful.is_empty() && self.failed.is_empty()
    }
}
