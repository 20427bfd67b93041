// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! asya-gateway-client
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod client;
mod reporter;

pub use client::{FinalStatus, GatewayClient, GatewayError, HeartbeatStatus};
pub use reporter::{ProgressReporter, ReporterHandle, Signal};
