// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! asya-operator
#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod builder;
pub mod config;
pub mod crd;
pub mod queues;
pub mod reconciler;
pub mod runtime_configmap;
pub mod scaler;

pub use config::OperatorConfig;
pub use crd::{AsyncActor, AsyncActorSpec, AsyncActorStatus};
pub use reconciler::{Context, Error, run_controller};
