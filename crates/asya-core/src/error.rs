// SPDX-License-Identifier: MIT OR Apache-2.0
//! The closed error-code taxonomy and the error-end report payload.

use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Severity
// ---------------------------------------------------------------------------

/// Whether a failed invocation may succeed on a later envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Transient pressure; the next envelope may go through.
    Recoverable,
    /// The invocation is lost; redelivery will not help.
    Fatal,
}

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// Machine-readable error code, stable on the wire.
///
/// This is a closed set: handlers and sidecars never invent codes outside
/// it. Each code serializes to its snake_case wire string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// The sidecar-owned deadline expired before the handler answered.
    #[serde(rename = "timeout_error")]
    Timeout,
    /// Host memory exhausted inside the handler.
    #[serde(rename = "oom_error")]
    Oom,
    /// Accelerator memory exhausted inside the handler.
    #[serde(rename = "cuda_oom_error")]
    CudaOom,
    /// The user handler raised.
    #[serde(rename = "processing_error")]
    Processing,
    /// Input failed handler (or envelope-shape) validation.
    #[serde(rename = "validation_error")]
    Validation,
    /// Frame body was not parseable JSON.
    #[serde(rename = "invalid_json")]
    InvalidJson,
    /// Frame body exceeded the configured cap.
    #[serde(rename = "message_too_large")]
    MessageTooLarge,
    /// The socket dropped mid-exchange.
    #[serde(rename = "connection_error")]
    Connection,
    /// Internal endpoint failure.
    #[serde(rename = "server_error")]
    Server,
}

impl ErrorCode {
    /// The stable wire string (e.g. `"timeout_error"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout_error",
            Self::Oom => "oom_error",
            Self::CudaOom => "cuda_oom_error",
            Self::Processing => "processing_error",
            Self::Validation => "validation_error",
            Self::InvalidJson => "invalid_json",
            Self::MessageTooLarge => "message_too_large",
            Self::Connection => "connection_error",
            Self::Server => "server_error",
        }
    }

    /// The default severity for this code.
    ///
    /// Only the memory-pressure classes are recoverable; everything else
    /// loses the invocation.
    pub fn default_severity(&self) -> Severity {
        match self {
            Self::Oom | Self::CudaOom => Severity::Recoverable,
            _ => Severity::Fatal,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ErrorDetails
// ---------------------------------------------------------------------------

/// The error object a handler (or the sidecar, synthesizing) produces.
///
/// On the wire this is the body of `{"status":"error", ...}` responses and
/// the `error_details` field of error-end reports. `severity` and
/// `retry_after` are advisory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Machine-readable code from the closed set.
    pub error: ErrorCode,
    /// Human-readable description.
    pub message: String,
    /// Exception/type name from the handler runtime, if any.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Advisory severity; defaults per code when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    /// Advisory retry delay in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl ErrorDetails {
    /// Build details with the code's default severity left implicit.
    pub fn new(error: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error,
            message: message.into(),
            kind: None,
            severity: None,
            retry_after: None,
        }
    }

    /// Attach the originating exception/type name.
    #[must_use]
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    /// The effective severity: explicit if set, else the code's default.
    pub fn effective_severity(&self) -> Severity {
        self.severity.unwrap_or_else(|| self.error.default_severity())
    }
}

// ---------------------------------------------------------------------------
// ErrorReport
// ---------------------------------------------------------------------------

/// The message the sidecar publishes to the error-end queue.
///
/// `original_message` carries the raw inbound bytes so nothing is lost even
/// when the envelope itself never parsed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    /// Job correlation id, when the inbound envelope carried one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    /// Human-readable summary of what went wrong.
    pub error: String,
    /// The inbound message, verbatim.
    pub original_message: String,
    /// Structured details, when the failure produced them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_details: Option<ErrorDetails>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
