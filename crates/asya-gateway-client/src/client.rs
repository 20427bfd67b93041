// SPDX-License-Identifier: MIT OR Apache-2.0
//! The gateway HTTP surface consumed by sidecars and terminal actors.

use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// Default per-request timeout. Heartbeats are advisory; nothing waits
/// long for the gateway.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors talking to the gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Transport-level failure (connect, timeout, DNS).
    #[error("gateway request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The gateway answered with an unexpected status.
    #[error("gateway returned {status} for {path}")]
    UnexpectedStatus {
        /// HTTP status received.
        status: u16,
        /// Request path for context.
        path: String,
    },
}

/// Per-step lifecycle states the gateway aggregates into job progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HeartbeatStatus {
    /// The sidecar received the envelope.
    PickedUp,
    /// The handler is running.
    Processing,
    /// The handler finished successfully.
    Completed,
    /// The handler (or the sidecar on its behalf) failed.
    Error,
}

/// Terminal job outcome posted by terminal actors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalStatus {
    /// The pipeline completed (including abort-with-success).
    Succeeded,
    /// The pipeline ended on the error sink.
    Failed,
}

#[derive(Serialize)]
struct HeartbeatBody<'a> {
    actor: &'a str,
    status: HeartbeatStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<&'a str>,
}

#[derive(Serialize)]
struct ProgressBody<'a> {
    step: &'a str,
    step_index: usize,
    total_steps: usize,
    status: HeartbeatStatus,
}

#[derive(Serialize)]
struct FinalBody<'a> {
    status: FinalStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<&'a Value>,
}

/// Thin typed wrapper over the gateway job endpoints.
#[derive(Debug, Clone)]
pub struct GatewayClient {
    base_url: String,
    http: reqwest::Client,
}

impl GatewayClient {
    /// A client for the gateway at `base_url` (no trailing slash needed).
    pub fn new(base_url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        }
    }

    fn url(&self, job_id: &str, tail: &str) -> String {
        format!("{}/jobs/{job_id}/{tail}", self.base_url)
    }

    async fn post_json<B: Serialize>(&self, url: &str, body: &B) -> Result<(), GatewayError> {
        let response = self.http.post(url).json(body).send().await?;
        if !response.status().is_success() {
            return Err(GatewayError::UnexpectedStatus {
                status: response.status().as_u16(),
                path: url.to_string(),
            });
        }
        Ok(())
    }

    /// `POST /jobs/{id}/heartbeat`: the gateway computes progress from the
    /// step index and status weight.
    pub async fn heartbeat(
        &self,
        job_id: &str,
        actor: &str,
        status: HeartbeatStatus,
        message: Option<&str>,
    ) -> Result<(), GatewayError> {
        self.post_json(
            &self.url(job_id, "heartbeat"),
            &HeartbeatBody {
                actor,
                status,
                message,
            },
        )
        .await
    }

    /// `POST /jobs/{id}/progress`: the explicit form carrying the step
    /// index, preferred over having the gateway guess from actor names.
    pub async fn progress(
        &self,
        job_id: &str,
        step: &str,
        step_index: usize,
        total_steps: usize,
        status: HeartbeatStatus,
    ) -> Result<(), GatewayError> {
        self.post_json(
            &self.url(job_id, "progress"),
            &ProgressBody {
                step,
                step_index,
                total_steps,
                status,
            },
        )
        .await
    }

    /// `POST /jobs/{id}/final`: terminal actors report the job outcome.
    pub async fn finalize(
        &self,
        job_id: &str,
        status: FinalStatus,
        result: Option<&Value>,
        error: Option<&Value>,
    ) -> Result<(), GatewayError> {
        self.post_json(
            &self.url(job_id, "final"),
            &FinalBody {
                status,
                result,
                error,
                metadata: None,
            },
        )
        .await
    }

    /// `GET /jobs/{id}/active`: `Ok(true)` on 200, `Ok(false)` on 410
    /// Gone (terminal or timed out).
    pub async fn is_active(&self, job_id: &str) -> Result<bool, GatewayError> {
        let url = self.url(job_id, "active");
        let response = self.http.get(&url).send().await?;
        match response.status().as_u16() {
            200 => Ok(true),
            410 => Ok(false),
            status => Err(GatewayError::UnexpectedStatus { status, path: url }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn heartbeat_posts_actor_and_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/jobs/j1/heartbeat"))
            .and(body_partial_json(json!({"actor": "infer", "status": "processing"})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let client = GatewayClient::new(server.uri());
        client
            .heartbeat("j1", "infer", HeartbeatStatus::Processing, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn progress_carries_explicit_step_index() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/jobs/j1/progress"))
            .and(body_partial_json(json!({
                "step": "infer",
                "step_index": 1,
                "total_steps": 3,
                "status": "completed",
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let client = GatewayClient::new(server.uri());
        client
            .progress("j1", "infer", 1, 3, HeartbeatStatus::Completed)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn finalize_posts_result() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/jobs/j1/final"))
            .and(body_partial_json(json!({
                "status": "succeeded",
                "result": {"answer": 42},
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let client = GatewayClient::new(server.uri());
        client
            .finalize("j1", FinalStatus::Succeeded, Some(&json!({"answer": 42})), None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn is_active_maps_200_and_410() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/jobs/live/active"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/jobs/done/active"))
            .respond_with(ResponseTemplate::new(410))
            .mount(&server)
            .await;

        let client = GatewayClient::new(server.uri());
        assert!(client.is_active("live").await.unwrap());
        assert!(!client.is_active("done").await.unwrap());
    }

    #[tokio::test]
    async fn non_success_surfaces_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/jobs/j1/heartbeat"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = GatewayClient::new(server.uri());
        let err = client
            .heartbeat("j1", "a", HeartbeatStatus::PickedUp, None)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::UnexpectedStatus { status: 503, .. }));
    }

    #[test]
    fn trailing_slash_is_trimmed() {
        let client = GatewayClient::new("http://gw/");
        assert_eq!(client.url("j", "final"), "http://gw/jobs/j/final");
    }
}
