// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! asya-protocol
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! One connection carries exactly one request frame (the full envelope) and
//! one response frame; both sides close afterwards. Keeping the exchange to
//! a single frame per connection guarantees clean state between envelopes
//! and lets the sidecar and the handler runtime be updated independently.

mod frame;
mod mode;
mod response;

pub use frame::{DEFAULT_MAX_FRAME, FrameError, read_frame, write_frame};
pub use mode::{HandlerMode, UnknownModeError};
pub use response::{HandlerResponse, error_body};
