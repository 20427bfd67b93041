// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! asya-core
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The envelope is the unit of work: an opaque id, an optional job
//! correlation id, a [`Route`] (ordered step names plus a cursor), optional
//! string headers, and an arbitrary JSON payload. Everything else in the
//! system (the sidecar router, the runtime endpoint, the operator) agrees
//! on these shapes and on the queue-name derivation in [`naming`].

mod envelope;
mod error;
pub mod naming;
pub mod validate;

pub use envelope::{Envelope, Route};
pub use error::{ErrorCode, ErrorDetails, ErrorReport, Severity};
pub use naming::{ERROR_END, HAPPY_END, QueueNaming};
pub use validate::{ValidationError, validate_envelope, validate_route_mutation};
