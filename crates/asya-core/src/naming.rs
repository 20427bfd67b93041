// SPDX-License-Identifier: MIT OR Apache-2.0
//! Queue-name derivation shared by producers and consumers.

use serde::{Deserialize, Serialize};

/// Reserved terminal step for successful completion (and abort-with-success).
pub const HAPPY_END: &str = "happy-end";

/// Reserved terminal step for failures.
pub const ERROR_END: &str = "error-end";

/// Default queue-name prefix.
pub const DEFAULT_PREFIX: &str = "asya-";

/// Deterministic step-name → queue-name policy.
///
/// The prefix is operator-wide configuration; both the sidecar publishing a
/// message and the sidecar consuming it derive the same wire name from the
/// same step name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueNaming {
    /// Prefix prepended to every step name.
    pub prefix: String,
}

impl Default for QueueNaming {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
        }
    }
}

impl QueueNaming {
    /// A policy with a custom prefix.
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Wire queue name for a step.
    pub fn queue_for(&self, step: &str) -> String {
        format!("{}{step}", self.prefix)
    }

    /// Wire queue name of the happy-end sink.
    pub fn happy_end_queue(&self) -> String {
        self.queue_for(HAPPY_END)
    }

    /// Wire queue name of the error-end sink.
    pub fn error_end_queue(&self) -> String {
        self.queue_for(ERROR_END)
    }

    /// Whether a step name is one of the reserved terminal sinks.
    pub fn is_terminal_step(step: &str) -> bool {
        step == HAPPY_END || step == ERROR_END
    }
}
