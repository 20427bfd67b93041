// SPDX-License-Identifier: MIT OR Apache-2.0
//! The envelope traversing queues and the route it carries.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Route
// ---------------------------------------------------------------------------

/// Ordered sequence of step names plus a 0-based cursor.
///
/// `steps[i]` for `i < current` is history and is immutable once traversed;
/// `steps[current]` is the step the envelope is addressed to next. When
/// `current == steps.len()` the route is terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Step names, in execution order.
    pub steps: Vec<String>,
    /// Index of the next step to execute.
    pub current: usize,
}

impl Route {
    /// A route positioned at its first step.
    pub fn new(steps: Vec<String>) -> Self {
        Self { steps, current: 0 }
    }

    /// The step this envelope is addressed to, or `None` when terminal.
    pub fn next_step(&self) -> Option<&str> {
        self.steps.get(self.current).map(String::as_str)
    }

    /// True once the cursor has walked past the last step.
    pub fn is_terminal(&self) -> bool {
        self.current >= self.steps.len()
    }

    /// The route after one successful handler invocation.
    ///
    /// The cursor saturates at `steps.len()`: a terminal route stays
    /// terminal, it never points past the end by more than the length.
    #[must_use]
    pub fn advanced(&self) -> Route {
        Route {
            steps: self.steps.clone(),
            current: (self.current + 1).min(self.steps.len()),
        }
    }

    /// The already-traversed prefix `steps[0..current]`.
    pub fn history(&self) -> &[String] {
        &self.steps[..self.current.min(self.steps.len())]
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// The unit of work flowing through the pipeline.
///
/// Field order matches the canonical wire layout; the whole struct is plain
/// UTF-8 JSON on every queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Opaque id, unique per envelope. Distinct from the job id.
    pub id: String,
    /// Correlates many envelopes to one externally tracked job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    /// Where this envelope has been and where it goes next.
    pub route: Route,
    /// Small string map for trace / priority metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,
    /// Arbitrary JSON payload handed to the handler.
    pub payload: Value,
}

impl Envelope {
    /// Create an envelope at the start of the given route with a fresh id.
    pub fn new(steps: Vec<String>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            job_id: None,
            route: Route::new(steps),
            headers: None,
            payload,
        }
    }

    /// Attach a job correlation id.
    #[must_use]
    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    /// A fan-out child: fresh id, same job id, same headers, same route,
    /// the given payload.
    ///
    /// The caller advances the route once for the whole sibling set; all
    /// children share the post-increment cursor.
    #[must_use]
    pub fn child(&self, payload: Value) -> Envelope {
        Envelope {
            id: Uuid::new_v4().to_string(),
            job_id: self.job_id.clone(),
            route: self.route.clone(),
            headers: self.headers.clone(),
            payload,
        }
    }

    /// The same envelope with its route advanced by one step.
    #[must_use]
    pub fn advanced(&self) -> Envelope {
        Envelope {
            route: self.route.advanced(),
            ..self.clone()
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
