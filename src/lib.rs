// SPDX-License-Identifier: MIT OR Apache-2.0
//! Asya — a Kubernetes-native asynchronous actor runtime.
//!
//! Pipelines are data, not code: each [`asya_core::Envelope`] carries its own
//! route through a chain of stateless actors. A per-pod sidecar
//! ([`asya_sidecar`]) consumes envelopes from a queue, exchanges a single
//! framed request with the co-located handler over a local socket
//! ([`asya_runtime`], [`asya_protocol`]), and publishes the result downstream
//! or to a terminal sink. The operator (in `asya-operator`) reconciles
//! declarative `AsyncActor` resources into the running topology.
//!
//! This façade re-exports the library crates; the end-to-end suite in
//! `tests/` exercises them together.

#![deny(unsafe_code)]

pub use asya_core as core;
pub use asya_gateway_client as gateway_client;
pub use asya_protocol as protocol;
pub use asya_runtime as runtime;
pub use asya_sidecar as sidecar;
pub use asya_transport as transport;
