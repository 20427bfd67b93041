// SPDX-License-Identifier: MIT OR Apache-2.0
//! The per-envelope routing state machine.

use crate::config::{SidecarConfig, TerminalRole};
use crate::ipc;
use crate::metrics::SidecarMetrics;
use asya_core::{
    Envelope, ErrorCode, ErrorDetails, ErrorReport, validate_envelope, validate_route_mutation,
};
use asya_gateway_client::{FinalStatus, HeartbeatStatus, ReporterHandle, Signal};
use asya_protocol::{HandlerMode, HandlerResponse};
use asya_transport::{Delivery, Transport};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

/// Where one envelope ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Published downstream to the named queue.
    Published {
        /// Target queue.
        queue: String,
        /// Number of messages (1, or the fan-out arity).
        count: usize,
    },
    /// Routed to the happy-end sink.
    HappyEnd,
    /// Routed to the error-end sink.
    ErrorEnd,
    /// Consumed by a terminal sidecar and reported to the gateway.
    Finalized,
    /// Nacked back to the transport for redelivery.
    Requeued,
}

impl Outcome {
    fn metric_label(&self) -> &'static str {
        match self {
            Outcome::Published { .. } => "delivered",
            Outcome::HappyEnd => "happy_end",
            Outcome::ErrorEnd => "error_end",
            Outcome::Finalized => "finalized",
            Outcome::Requeued => "requeued",
        }
    }
}

/// The router: owns an envelope from receive to ack/nack.
pub struct Router {
    config: SidecarConfig,
    transport: Arc<dyn Transport>,
    reporter: ReporterHandle,
    metrics: Arc<SidecarMetrics>,
}

impl Router {
    /// Assemble a router over the given transport and reporter.
    pub fn new(
        config: SidecarConfig,
        transport: Arc<dyn Transport>,
        reporter: ReporterHandle,
        metrics: Arc<SidecarMetrics>,
    ) -> Self {
        Self {
            config,
            transport,
            reporter,
            metrics,
        }
    }

    /// The sidecar configuration in effect.
    pub fn config(&self) -> &SidecarConfig {
        &self.config
    }

    /// Process one delivery to completion (acked or nacked).
    pub async fn process(&self, delivery: Delivery) -> Outcome {
        let actor = self.config.actor_name.as_str();
        self.metrics.inflight.with_label_values(&[actor]).inc();
        let outcome = self.process_inner(&delivery).await;
        self.metrics.inflight.with_label_values(&[actor]).dec();
        self.metrics
            .messages_total
            .with_label_values(&[actor, outcome.metric_label()])
            .inc();
        outcome
    }

    async fn process_inner(&self, delivery: &Delivery) -> Outcome {
        if let Some(role) = self.config.terminal_role() {
            return self.finalize(delivery, role).await;
        }

        let raw = delivery.body.as_slice();

        if raw.len() > self.config.max_message_size {
            let details = ErrorDetails::new(
                ErrorCode::MessageTooLarge,
                format!(
                    "inbound message of {} bytes exceeds cap of {}",
                    raw.len(),
                    self.config.max_message_size
                ),
            );
            return self.reject(delivery, None, details).await;
        }

        // Parse failures are terminal: the raw bytes go to the error sink
        // and the inbound is acked, so a poison message cannot redeliver
        // forever.
        let envelope = match serde_json::from_slice::<Envelope>(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                let details = ErrorDetails::new(
                    ErrorCode::InvalidJson,
                    format!("inbound message is not a valid envelope: {e}"),
                );
                return self.reject(delivery, None, details).await;
            }
        };

        if let Err(e) = validate_envelope(&envelope) {
            let details =
                ErrorDetails::new(ErrorCode::Validation, e.to_string()).with_kind("EnvelopeShape");
            self.heartbeat(&envelope, HeartbeatStatus::Error, Some(e.to_string()));
            return self.reject(delivery, envelope.job_id.clone(), details).await;
        }

        match envelope.route.next_step() {
            Some(step) if step != self.config.actor_name => {
                // The router never silently relocates an envelope.
                warn!(
                    expected = %step,
                    actor = %self.config.actor_name,
                    envelope = %envelope.id,
                    "envelope addressed to a different step, processing anyway"
                );
            }
            None => {
                warn!(
                    envelope = %envelope.id,
                    "terminal envelope arrived on an actor queue"
                );
            }
            _ => {}
        }

        self.heartbeat(&envelope, HeartbeatStatus::PickedUp, None);
        self.heartbeat(&envelope, HeartbeatStatus::Processing, None);

        let started = Instant::now();
        let response = ipc::invoke_handler(
            &self.config.socket_path,
            raw,
            self.config.runtime_timeout,
            self.config.max_message_size,
        )
        .await;
        self.metrics
            .handler_seconds
            .with_label_values(&[&self.config.actor_name])
            .observe(started.elapsed().as_secs_f64());

        match response {
            HandlerResponse::Error(details) => {
                self.heartbeat(&envelope, HeartbeatStatus::Error, Some(details.message.clone()));
                self.reject(delivery, envelope.job_id.clone(), details).await
            }
            HandlerResponse::Abort => {
                // Abort-with-success: the original envelope, cursor
                // untouched, byte-identical, onto the happy sink.
                self.heartbeat(&envelope, HeartbeatStatus::Completed, None);
                let queue = self.config.naming.queue_for(&self.config.happy_end);
                match self.publish_all(&queue, std::slice::from_ref(&delivery.body)).await {
                    Ok(()) => self.ack_as(delivery, Outcome::HappyEnd).await,
                    Err(()) => self.requeue(delivery).await,
                }
            }
            HandlerResponse::Single(value) => {
                self.heartbeat(&envelope, HeartbeatStatus::Completed, None);
                match self.successor(delivery, &envelope, value).await {
                    Ok(next) => self.dispatch(delivery, vec![next]).await,
                    Err(outcome) => outcome,
                }
            }
            HandlerResponse::FanOut(values) => {
                self.heartbeat(&envelope, HeartbeatStatus::Completed, None);
                let advanced = envelope.advanced();
                self.metrics
                    .fanout_children_total
                    .with_label_values(&[&self.config.actor_name])
                    .inc_by(values.len() as u64);
                let children = values
                    .into_iter()
                    .map(|payload| advanced.child(payload))
                    .collect();
                self.dispatch(delivery, children).await
            }
        }
    }

    /// Build the downstream envelope for a single-object response.
    async fn successor(
        &self,
        delivery: &Delivery,
        inbound: &Envelope,
        value: Value,
    ) -> Result<Envelope, Outcome> {
        match self.config.handler_mode {
            HandlerMode::Payload => {
                let mut next = inbound.clone();
                next.route = inbound.route.advanced();
                next.payload = value;
                Ok(next)
            }
            HandlerMode::Envelope => {
                let outbound = match serde_json::from_value::<Envelope>(value) {
                    Ok(outbound) => outbound,
                    Err(e) => {
                        let details = ErrorDetails::new(
                            ErrorCode::Validation,
                            format!("envelope-mode handler returned a non-envelope: {e}"),
                        );
                        return Err(self.reject(delivery, inbound.job_id.clone(), details).await);
                    }
                };
                if let Err(e) = validate_route_mutation(&inbound.route, &outbound.route) {
                    let details = ErrorDetails::new(ErrorCode::Validation, e.to_string())
                        .with_kind("RouteMutation");
                    return Err(self.reject(delivery, inbound.job_id.clone(), details).await);
                }
                // The handler may advance the cursor itself; when it does
                // not, the sidecar does.
                if outbound.route.current == inbound.route.current {
                    Ok(outbound.advanced())
                } else {
                    Ok(outbound)
                }
            }
        }
    }

    /// Serialize, size-check, publish and ack a set of sibling envelopes.
    ///
    /// All siblings share one route cursor, so they share one target queue.
    async fn dispatch(&self, delivery: &Delivery, envelopes: Vec<Envelope>) -> Outcome {
        // Fan-out of size zero behaves like abort-with-success, but the
        // interpreter already folds `[]` into Abort; an empty set here can
        // only come from that same path.
        let Some(first) = envelopes.first() else {
            let queue = self.config.naming.queue_for(&self.config.happy_end);
            return match self.publish_all(&queue, std::slice::from_ref(&delivery.body)).await {
                Ok(()) => self.ack_as(delivery, Outcome::HappyEnd).await,
                Err(()) => self.requeue(delivery).await,
            };
        };

        let (queue, terminal) = match first.route.next_step() {
            Some(step) => (self.config.naming.queue_for(step), false),
            None => (self.config.naming.queue_for(&self.config.happy_end), true),
        };

        let mut bodies = Vec::with_capacity(envelopes.len());
        for envelope in &envelopes {
            let bytes = match serde_json::to_vec(envelope) {
                Ok(bytes) => bytes,
                Err(e) => {
                    let details = ErrorDetails::new(
                        ErrorCode::Server,
                        format!("failed to encode downstream envelope: {e}"),
                    );
                    return self.reject(delivery, envelope.job_id.clone(), details).await;
                }
            };
            if bytes.len() > self.config.max_message_size {
                let details = ErrorDetails::new(
                    ErrorCode::MessageTooLarge,
                    format!(
                        "outbound envelope of {} bytes exceeds cap of {}",
                        bytes.len(),
                        self.config.max_message_size
                    ),
                );
                return self.reject(delivery, envelope.job_id.clone(), details).await;
            }
            bodies.push(bytes);
        }

        let count = bodies.len();
        match self.publish_all(&queue, &bodies).await {
            Ok(()) => {
                let outcome = if terminal {
                    Outcome::HappyEnd
                } else {
                    Outcome::Published {
                        queue: queue.clone(),
                        count,
                    }
                };
                self.ack_as(delivery, outcome).await
            }
            Err(()) => self.requeue(delivery).await,
        }
    }

    /// Publish an error report and ack the inbound.
    async fn reject(
        &self,
        delivery: &Delivery,
        job_id: Option<String>,
        details: ErrorDetails,
    ) -> Outcome {
        let report = ErrorReport {
            job_id: job_id.clone(),
            error: details.message.clone(),
            original_message: String::from_utf8_lossy(&delivery.body).into_owned(),
            error_details: Some(details),
        };
        let body = match serde_json::to_vec(&report) {
            Ok(body) => body,
            Err(e) => {
                error!(error = %e, "failed to encode error report");
                return self.requeue(delivery).await;
            }
        };
        let queue = self.config.naming.queue_for(&self.config.error_end);
        match self.publish_all(&queue, std::slice::from_ref(&body)).await {
            Ok(()) => self.ack_as(delivery, Outcome::ErrorEnd).await,
            Err(()) => self.requeue(delivery).await,
        }
    }

    /// Terminal sidecar: consume, report the job outcome, never forward.
    async fn finalize(&self, delivery: &Delivery, role: TerminalRole) -> Outcome {
        match role {
            TerminalRole::HappyEnd => match serde_json::from_slice::<Envelope>(&delivery.body) {
                Ok(envelope) => {
                    info!(envelope = %envelope.id, "pipeline completed");
                    if let Some(job_id) = &envelope.job_id {
                        self.reporter.report(Signal::Final {
                            job_id: job_id.clone(),
                            status: FinalStatus::Succeeded,
                            result: Some(envelope.payload.clone()),
                            error: None,
                        });
                    }
                }
                Err(e) => {
                    warn!(error = %e, "unparseable message on the happy sink");
                }
            },
            TerminalRole::ErrorEnd => match serde_json::from_slice::<ErrorReport>(&delivery.body) {
                Ok(report) => {
                    warn!(error = %report.error, "pipeline failed");
                    if let Some(job_id) = &report.job_id {
                        let error = report
                            .error_details
                            .as_ref()
                            .and_then(|d| serde_json::to_value(d).ok())
                            .unwrap_or_else(|| Value::String(report.error.clone()));
                        self.reporter.report(Signal::Final {
                            job_id: job_id.clone(),
                            status: FinalStatus::Failed,
                            result: None,
                            error: Some(error),
                        });
                    }
                }
                Err(e) => {
                    warn!(error = %e, "unparseable message on the error sink");
                }
            },
        }
        self.ack_as(delivery, Outcome::Finalized).await
    }

    async fn publish_all(&self, queue: &str, bodies: &[Vec<u8>]) -> Result<(), ()> {
        for body in bodies {
            if let Err(e) = self.transport.publish(queue, body).await {
                error!(queue = %queue, error = %e, "publish failed");
                return Err(());
            }
        }
        Ok(())
    }

    async fn ack_as(&self, delivery: &Delivery, outcome: Outcome) -> Outcome {
        match self.transport.ack(delivery).await {
            Ok(()) => outcome,
            Err(e) => {
                // The transport will redeliver the unacked message; report
                // it as such.
                error!(error = %e, "ack failed");
                Outcome::Requeued
            }
        }
    }

    async fn requeue(&self, delivery: &Delivery) -> Outcome {
        if let Err(e) = self.transport.nack(delivery, true).await {
            error!(error = %e, "nack failed; message will redeliver on channel close");
        }
        Outcome::Requeued
    }

    fn heartbeat(&self, envelope: &Envelope, status: HeartbeatStatus, message: Option<String>) {
        let Some(job_id) = &envelope.job_id else {
            return;
        };
        if !self.reporter.is_enabled() {
            return;
        }
        let accepted = self.reporter.report(Signal::Heartbeat {
            job_id: job_id.clone(),
            actor: self.config.actor_name.clone(),
            status,
            message,
            step_index: envelope.route.current,
            total_steps: envelope.route.steps.len(),
        });
        if !accepted {
            self.metrics
                .heartbeat_failures_total
                .with_label_values(&[&self.config.actor_name])
                .inc();
        }
    }
}
