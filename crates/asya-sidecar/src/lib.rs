// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! asya-sidecar
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Per envelope, the router walks a fixed state machine:
//! `Received → HandlerInvoked → {Published | HappyEnd | ErrorEnd} → Acked`.
//! Any failure before the ack nacks the delivery back to the transport,
//! with one exception: inbound bytes that never parsed are terminal and go
//! straight to the error sink, acked, so a poison message cannot loop
//! forever.

pub mod config;
pub mod http;
pub mod ipc;
pub mod metrics;
pub mod router;
pub mod run;

pub use config::{SidecarConfig, TerminalRole};
pub use metrics::SidecarMetrics;
pub use router::{Outcome, Router};
