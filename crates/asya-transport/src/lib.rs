// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! asya-transport
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The sidecar is the only component that touches the transport: handlers
//! never publish directly. A [`Delivery`] is exclusively owned between
//! receive and ack/nack; acknowledgement goes back through the transport
//! that produced it.

mod amqp;
mod config;
mod memory;

pub use amqp::AmqpTransport;
pub use config::{TransportConfig, TransportKind};
pub use memory::MemoryTransport;

use async_trait::async_trait;
use futures::stream::Stream;
use std::pin::Pin;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// AMQP-level failure.
    #[error("amqp error: {0}")]
    Amqp(#[from] lapin::Error),

    /// The broker refused to confirm a publish.
    #[error("publish to '{queue}' was not confirmed")]
    PublishNotConfirmed {
        /// Target queue.
        queue: String,
    },

    /// A delivery was acknowledged through a transport that did not
    /// produce it.
    #[error("delivery handle does not belong to this transport")]
    ForeignHandle,

    /// The transport is not reachable.
    #[error("transport unavailable: {0}")]
    Unavailable(String),

    /// Configuration problem (bad env, unknown kind).
    #[error("transport configuration error: {0}")]
    Config(String),
}

// ---------------------------------------------------------------------------
// Delivery
// ---------------------------------------------------------------------------

/// Per-transport acknowledgement state carried by a [`Delivery`].
#[derive(Debug)]
pub enum AckHandle {
    /// In-memory transport: queue name plus the redelivery token.
    Memory {
        /// Queue the message was taken from.
        queue: String,
        /// Token identifying the unacked entry.
        token: u64,
    },
    /// AMQP transport: the lapin acker bound to the consumer channel.
    Amqp(lapin::acker::Acker),
}

/// One received message, exclusively owned until acked or nacked.
#[derive(Debug)]
pub struct Delivery {
    /// Queue this message was consumed from.
    pub queue: String,
    /// Raw message bytes (UTF-8 JSON envelope on conforming queues).
    pub body: Vec<u8>,
    /// Acknowledgement handle, consumed by `ack`/`nack`.
    pub handle: AckHandle,
}

/// Stream of incoming deliveries for one consumer.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, TransportError>> + Send>>;

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Façade every concrete transport implements.
///
/// Queue names arriving here are already wire names (prefix applied);
/// naming policy lives in `asya-core`.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Declare the queue if it does not exist. Idempotent.
    async fn ensure_queue(&self, queue: &str) -> Result<(), TransportError>;

    /// Open a consumer on the queue.
    async fn consume(&self, queue: &str) -> Result<DeliveryStream, TransportError>;

    /// Publish raw bytes to a queue.
    async fn publish(&self, queue: &str, body: &[u8]) -> Result<(), TransportError>;

    /// Acknowledge a delivery; the message is done.
    async fn ack(&self, delivery: &Delivery) -> Result<(), TransportError>;

    /// Negatively acknowledge; `requeue` puts the message back for
    /// redelivery.
    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), TransportError>;

    /// Cheap connectivity probe.
    async fn health_check(&self) -> Result<(), TransportError>;

    /// Number of messages waiting in the queue.
    async fn queue_depth(&self, queue: &str) -> Result<u64, TransportError>;
}
