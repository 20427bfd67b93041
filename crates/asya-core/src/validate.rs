// SPDX-License-Identifier: MIT OR Apache-2.0
//! Envelope-shape and route-mutation validators.
//!
//! Both validators fail closed: anything outside the documented envelope
//! invariants is rejected rather than repaired.

use crate::envelope::{Envelope, Route};
use crate::naming::QueueNaming;
use thiserror::Error;

/// Why an envelope or a route mutation was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// `route.steps` was empty.
    #[error("route has no steps")]
    EmptySteps,

    /// `route.current` pointed past `len(steps)`.
    #[error("route cursor {current} out of bounds for {len} steps")]
    CursorOutOfBounds {
        /// The offending cursor value.
        current: usize,
        /// Number of steps in the route.
        len: usize,
    },

    /// A step used one of the reserved terminal sink names.
    #[error("step '{0}' is a reserved terminal name")]
    ReservedStep(String),

    /// A step name was not DNS-1123 compatible.
    #[error("step '{0}' is not a valid DNS-1123 name")]
    InvalidStepName(String),

    /// An envelope-mode handler rewrote an already-traversed step.
    #[error("route history mutated at index {index}")]
    HistoryMutated {
        /// Index of the first rewritten history entry.
        index: usize,
    },

    /// An envelope-mode handler moved the cursor backwards.
    #[error("route cursor moved backwards ({from} -> {to})")]
    CursorRegressed {
        /// Inbound cursor.
        from: usize,
        /// Outbound cursor.
        to: usize,
    },

    /// An envelope-mode handler advanced the cursor by more than one.
    #[error("route cursor skipped ahead ({from} -> {to})")]
    CursorSkipped {
        /// Inbound cursor.
        from: usize,
        /// Outbound cursor.
        to: usize,
    },
}

/// DNS-1123 label: lowercase alphanumerics and `-`, must start and end with
/// an alphanumeric, at most 63 characters.
fn is_dns1123_label(s: &str) -> bool {
    if s.is_empty() || s.len() > 63 {
        return false;
    }
    let bytes = s.as_bytes();
    let alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    if !alnum(bytes[0]) || !alnum(bytes[bytes.len() - 1]) {
        return false;
    }
    bytes.iter().all(|&b| alnum(b) || b == b'-')
}

/// Check the envelope invariants at ingress.
///
/// Rejects empty routes, cursors past the end, reserved step names, and
/// step names that cannot be actor names.
pub fn validate_envelope(envelope: &Envelope) -> Result<(), ValidationError> {
    let route = &envelope.route;
    if route.steps.is_empty() {
        return Err(ValidationError::EmptySteps);
    }
    if route.current > route.steps.len() {
        return Err(ValidationError::CursorOutOfBounds {
            current: route.current,
            len: route.steps.len(),
        });
    }
    for step in &route.steps {
        if QueueNaming::is_terminal_step(step) {
            return Err(ValidationError::ReservedStep(step.clone()));
        }
        if !is_dns1123_label(step) {
            return Err(ValidationError::InvalidStepName(step.clone()));
        }
    }
    Ok(())
}

/// Check an envelope-mode handler's route mutation.
///
/// History (`steps[0..current]`) must be byte-identical between inbound and
/// outbound. Future steps may be appended or replaced. The cursor may stay
/// put or advance by exactly one; it never regresses or skips.
pub fn validate_route_mutation(before: &Route, after: &Route) -> Result<(), ValidationError> {
    if after.current < before.current {
        return Err(ValidationError::CursorRegressed {
            from: before.current,
            to: after.current,
        });
    }
    if after.current > before.current + 1 {
        return Err(ValidationError::CursorSkipped {
            from: before.current,
            to: after.current,
        });
    }
    if after.steps.len() < before.current {
        return Err(ValidationError::HistoryMutated {
            index: after.steps.len(),
        });
    }
    for (index, step) in before.history().iter().enumerate() {
        if after.steps[index] != *step {
            return Err(ValidationError::HistoryMutated { index });
        }
    }
    for step in &after.steps[before.current..] {
        if QueueNaming::is_terminal_step(step) {
            return Err(ValidationError::ReservedStep(step.clone()));
        }
        if !is_dns1123_label(step) {
            return Err(ValidationError::InvalidStepName(step.clone()));
        }
    }
    Ok(())
}
