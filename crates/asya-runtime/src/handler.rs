// SPDX-License-Identifier: MIT OR Apache-2.0
//! The handler contract.

use asya_core::{Envelope, ErrorCode, ErrorDetails};
use async_trait::async_trait;
use serde_json::Value;

/// What a handler receives, depending on the configured mode.
#[derive(Debug, Clone, PartialEq)]
pub enum Invocation {
    /// Payload mode: the payload alone; routing stays sidecar-side.
    Payload(Value),
    /// Envelope mode: the full envelope; future steps may be rewritten.
    Envelope(Envelope),
}

/// What a handler produces on success.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutcome {
    /// One next payload.
    Value(Value),
    /// Fan-out payloads, one downstream envelope each.
    Values(Vec<Value>),
    /// Nothing to do; abort with success.
    None,
    /// Envelope mode: the (possibly route-mutated) envelope.
    Envelope(Box<Envelope>),
}

/// A categorized handler failure.
///
/// Carries the wire error code so the endpoint never has to guess how to
/// classify what went wrong.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct HandlerFailure {
    /// Wire code from the closed set.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
    /// Originating error/exception type name, if meaningful.
    pub kind: Option<String>,
}

impl HandlerFailure {
    /// A failure with an explicit code.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            kind: None,
        }
    }

    /// The handler raised on otherwise-valid input.
    pub fn processing(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Processing, message)
    }

    /// The input failed the handler's own validation.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Validation, message)
    }

    /// Host memory pressure.
    pub fn oom(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Oom, message)
    }

    /// Accelerator memory pressure.
    pub fn cuda_oom(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::CudaOom, message)
    }

    /// Attach the originating type name.
    #[must_use]
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }
}

impl From<&HandlerFailure> for ErrorDetails {
    fn from(failure: &HandlerFailure) -> Self {
        let mut details = ErrorDetails::new(failure.code, failure.message.clone());
        details.kind = failure.kind.clone();
        details
    }
}

/// User code behind the runtime endpoint.
///
/// Implementations are constructed once per process (model loading and
/// similar setup amortizes across envelopes) and invoked once per
/// connection.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Process one invocation.
    async fn invoke(&self, invocation: Invocation) -> Result<HandlerOutcome, HandlerFailure>;
}

/// Adapter turning a plain function into a payload-mode [`Handler`].
///
/// The workhorse for tests and simple transformation actors.
pub struct PayloadFn<F>(pub F);

#[async_trait]
impl<F> Handler for PayloadFn<F>
where
    F: Fn(Value) -> Result<HandlerOutcome, HandlerFailure> + Send + Sync,
{
    async fn invoke(&self, invocation: Invocation) -> Result<HandlerOutcome, HandlerFailure> {
        match invocation {
            Invocation::Payload(payload) => (self.0)(payload),
            Invocation::Envelope(envelope) => (self.0)(envelope.payload),
        }
    }
}
