// SPDX-License-Identifier: MIT OR Apache-2.0
//! Fire-and-forget progress reporting.

use crate::client::{FinalStatus, GatewayClient, HeartbeatStatus};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Queue capacity. Reporting is advisory; a small buffer is enough and a
/// full one means the gateway is behind, not the pipeline.
const QUEUE_CAPACITY: usize = 64;

/// One queued report.
#[derive(Debug)]
pub enum Signal {
    /// A per-step heartbeat.
    Heartbeat {
        /// Job id the heartbeat belongs to.
        job_id: String,
        /// Reporting actor name.
        actor: String,
        /// Step lifecycle state.
        status: HeartbeatStatus,
        /// Optional human-readable context.
        message: Option<String>,
        /// Explicit step index (`route.current`).
        step_index: usize,
        /// Total steps in the route.
        total_steps: usize,
    },
    /// A terminal outcome.
    Final {
        /// Job id being finalized.
        job_id: String,
        /// Terminal status.
        status: FinalStatus,
        /// Result payload on success.
        result: Option<Value>,
        /// Error payload on failure.
        error: Option<Value>,
    },
}

/// Cheap handle the router holds; dropping every handle stops the drain
/// task once the queue empties.
#[derive(Clone, Debug)]
pub struct ReporterHandle {
    tx: Option<mpsc::Sender<Signal>>,
}

impl ReporterHandle {
    /// A handle that drops every signal (gateway not configured).
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Whether reporting is wired to a gateway.
    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    /// Enqueue a signal. Never blocks: a full queue or a missing gateway
    /// drops the signal with a log line. Returns whether the signal was
    /// accepted, so callers can meter drops.
    pub fn report(&self, signal: Signal) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };
        match tx.try_send(signal) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "progress queue full, dropping signal");
                false
            }
        }
    }
}

/// Owns the background drain task feeding the gateway.
pub struct ProgressReporter {
    handle: ReporterHandle,
    task: tokio::task::JoinHandle<()>,
}

impl ProgressReporter {
    /// Spawn the drain task against the given client.
    pub fn spawn(client: GatewayClient) -> Self {
        let (tx, mut rx) = mpsc::channel::<Signal>(QUEUE_CAPACITY);
        let task = tokio::spawn(async move {
            while let Some(signal) = rx.recv().await {
                deliver(&client, signal).await;
            }
            debug!("progress reporter drained and stopped");
        });
        Self {
            handle: ReporterHandle { tx: Some(tx) },
            task,
        }
    }

    /// The handle the router clones into envelope tasks.
    pub fn handle(&self) -> ReporterHandle {
        self.handle.clone()
    }

    /// Drop the sender and wait for queued signals to flush.
    pub async fn shutdown(self) {
        drop(self.handle);
        let _ = self.task.await;
    }
}

async fn deliver(client: &GatewayClient, signal: Signal) {
    match signal {
        Signal::Heartbeat {
            job_id,
            actor,
            status,
            message,
            step_index,
            total_steps,
        } => {
            if let Err(e) = client
                .heartbeat(&job_id, &actor, status, message.as_deref())
                .await
            {
                warn!(job_id = %job_id, error = %e, "heartbeat failed");
                return;
            }
            // The explicit progress form rides along so the gateway never
            // has to infer the step index from actor names.
            if let Err(e) = client
                .progress(&job_id, &actor, step_index, total_steps, status)
                .await
            {
                debug!(job_id = %job_id, error = %e, "progress post failed");
            }
        }
        Signal::Final {
            job_id,
            status,
            result,
            error,
        } => {
            if let Err(e) = client
                .finalize(&job_id, status, result.as_ref(), error.as_ref())
                .await
            {
                warn!(job_id = %job_id, error = %e, "final status post failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn heartbeat(job: &str, status: HeartbeatStatus) -> Signal {
        Signal::Heartbeat {
            job_id: job.into(),
            actor: "infer".into(),
            status,
            message: None,
            step_index: 0,
            total_steps: 1,
        }
    }

    #[tokio::test]
    async fn signals_drain_in_order() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/jobs/j1/heartbeat"))
            .respond_with(ResponseTemplate::new(200))
            .expect(3)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/jobs/j1/progress"))
            .respond_with(ResponseTemplate::new(200))
            .expect(3)
            .mount(&server)
            .await;

        let reporter = ProgressReporter::spawn(GatewayClient::new(server.uri()));
        let handle = reporter.handle();
        handle.report(heartbeat("j1", HeartbeatStatus::PickedUp));
        handle.report(heartbeat("j1", HeartbeatStatus::Processing));
        handle.report(heartbeat("j1", HeartbeatStatus::Completed));
        drop(handle);
        reporter.shutdown().await;
    }

    #[tokio::test]
    async fn gateway_failure_does_not_stop_the_drain() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/jobs/bad/heartbeat"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/jobs/good/heartbeat"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/jobs/good/progress"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let reporter = ProgressReporter::spawn(GatewayClient::new(server.uri()));
        let handle = reporter.handle();
        handle.report(heartbeat("bad", HeartbeatStatus::Error));
        handle.report(heartbeat("good", HeartbeatStatus::Completed));
        drop(handle);
        reporter.shutdown().await;
    }

    #[tokio::test]
    async fn final_signal_posts_outcome() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/jobs/j9/final"))
            .and(body_partial_json(json!({"status": "failed"})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let reporter = ProgressReporter::spawn(GatewayClient::new(server.uri()));
        reporter.handle().report(Signal::Final {
            job_id: "j9".into(),
            status: FinalStatus::Failed,
            result: None,
            error: Some(json!({"error": "processing_error"})),
        });
        reporter.shutdown().await;
    }

    #[test]
    fn disabled_handle_swallows_signals() {
        let handle = ReporterHandle::disabled();
        assert!(!handle.is_enabled());
        handle.report(Signal::Final {
            job_id: "j".into(),
            status: FinalStatus::Succeeded,
            result: None,
            error: None,
        });
    }
}
