// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! asya-runtime
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! This crate is the counterpart to the sidecar's IPC client: while the
//! sidecar connects, writes one envelope frame and reads one response, this
//! side listens, invokes the configured handler, and answers. The sidecar
//! and the handler process can be updated independently as long as both
//! speak the framed protocol.

mod config;
mod handler;
mod registry;
mod server;

pub use asya_protocol::HandlerMode;
pub use config::{ConfigError, DEFAULT_SOCKET_PATH, RuntimeConfig};
pub use handler::{Handler, HandlerFailure, HandlerOutcome, Invocation, PayloadFn};
pub use registry::{HandlerRegistry, RegistryError};
pub use server::{PressureHooks, RuntimeServer, ServerError};
