// SPDX-License-Identifier: MIT OR Apache-2.0
//! Prometheus metrics for the router.

use prometheus::{
    Encoder, HistogramVec, IntCounterVec, IntGaugeVec, Registry, TextEncoder, histogram_opts, opts,
};

/// Router metrics behind their own registry.
///
/// Registration failures can only come from duplicate names inside this
/// constructor, so the `expect`s are compile-time-style assertions.
#[derive(Clone)]
pub struct SidecarMetrics {
    registry: Registry,
    /// Envelope outcomes: delivered, happy_end, error_end, requeued.
    pub messages_total: IntCounterVec,
    /// Wall-clock seconds of the IPC exchange.
    pub handler_seconds: HistogramVec,
    /// Children produced by fan-out responses.
    pub fanout_children_total: IntCounterVec,
    /// Heartbeats that never reached the gateway.
    pub heartbeat_failures_total: IntCounterVec,
    /// Envelopes currently being processed.
    pub inflight: IntGaugeVec,
}

impl SidecarMetrics {
    /// Create and register the metric families.
    pub fn new() -> Self {
        let registry = Registry::new();

        let messages_total = IntCounterVec::new(
            opts!(
                "asya_sidecar_messages_total",
                "Envelopes processed, by outcome"
            ),
            &["actor", "outcome"],
        )
        .expect("metric can be created");

        let handler_seconds = HistogramVec::new(
            histogram_opts!(
                "asya_sidecar_handler_seconds",
                "Duration of the handler IPC exchange in seconds"
            ),
            &["actor"],
        )
        .expect("metric can be created");

        let fanout_children_total = IntCounterVec::new(
            opts!(
                "asya_sidecar_fanout_children_total",
                "Envelopes created by fan-out responses"
            ),
            &["actor"],
        )
        .expect("metric can be created");

        let heartbeat_failures_total = IntCounterVec::new(
            opts!(
                "asya_sidecar_heartbeat_failures_total",
                "Progress signals dropped or refused by the gateway"
            ),
            &["actor"],
        )
        .expect("metric can be created");

        let inflight = IntGaugeVec::new(
            opts!("asya_sidecar_inflight", "Envelopes currently in flight"),
            &["actor"],
        )
        .expect("metric can be created");

        for collector in [
            Box::new(messages_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(handler_seconds.clone()),
            Box::new(fanout_children_total.clone()),
            Box::new(heartbeat_failures_total.clone()),
            Box::new(inflight.clone()),
        ] {
            registry.register(collector).expect("metric can be registered");
        }

        Self {
            registry,
            messages_total,
            handler_seconds,
            fanout_children_total,
            heartbeat_failures_total,
            inflight,
        }
    }

    /// Render the registry in Prometheus text format.
    pub fn encode(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if encoder.encode(&self.registry.gather(), &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for SidecarMetrics {
    fn default() -> Self {
        Self::new()
    }
}
