// SPDX-License-Identifier: MIT OR Apache-2.0
//! The socket server: one framed exchange per connection.

use crate::config::RuntimeConfig;
use crate::handler::{Handler, HandlerOutcome, Invocation};
use asya_core::{Envelope, ErrorCode, ErrorDetails, validate_envelope, validate_route_mutation};
use asya_protocol::{FrameError, HandlerMode, error_body, read_frame, write_frame};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

/// Errors that take the whole server down (per-connection failures are
/// answered on the wire instead).
#[derive(Debug, Error)]
pub enum ServerError {
    /// Socket setup or accept failure.
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    /// The configured handler could not be resolved or constructed.
    #[error(transparent)]
    Registry(#[from] crate::registry::RegistryError),
}

/// Best-effort cleanup hooks run on memory-pressure errors.
///
/// The endpoint returns the error either way; hooks only try to make the
/// next envelope more likely to succeed.
#[derive(Default)]
pub struct PressureHooks {
    /// Invoked on `oom_error` when detection is enabled.
    pub on_oom: Option<Box<dyn Fn() + Send + Sync>>,
    /// Invoked on `cuda_oom_error` when accelerator cleanup is enabled.
    pub on_cuda_oom: Option<Box<dyn Fn() + Send + Sync>>,
}

/// The runtime protocol endpoint.
///
/// Accepts connections on a Unix socket; every connection carries exactly
/// one envelope frame in and one response frame out, then closes.
pub struct RuntimeServer {
    config: RuntimeConfig,
    handler: Arc<dyn Handler>,
    hooks: Arc<PressureHooks>,
    listener: UnixListener,
}

impl RuntimeServer {
    /// Bind the socket, unlinking any stale one, and drop the readiness
    /// marker once listening.
    pub async fn bind(
        config: RuntimeConfig,
        handler: Arc<dyn Handler>,
    ) -> Result<Self, ServerError> {
        Self::bind_with_hooks(config, handler, PressureHooks::default()).await
    }

    /// Resolve `config.handler` against the registry (once, at startup)
    /// and bind.
    pub async fn from_registry(
        config: RuntimeConfig,
        registry: &crate::registry::HandlerRegistry,
    ) -> Result<Self, ServerError> {
        let handler = registry.instantiate(&config.handler, &serde_json::Value::Null)?;
        Self::bind(config, handler).await
    }

    /// [`bind`](Self::bind) with explicit pressure hooks.
    pub async fn bind_with_hooks(
        config: RuntimeConfig,
        handler: Arc<dyn Handler>,
        hooks: PressureHooks,
    ) -> Result<Self, ServerError> {
        if let Some(parent) = config.socket_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        match tokio::fs::remove_file(&config.socket_path).await {
            Ok(()) => debug!(path = %config.socket_path.display(), "removed stale socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let listener = UnixListener::bind(&config.socket_path)?;
        tokio::fs::write(config.ready_path(), b"ok").await?;
        info!(
            path = %config.socket_path.display(),
            handler = %config.handler,
            mode = ?config.mode,
            "runtime endpoint listening"
        );
        Ok(Self {
            config,
            handler,
            hooks: Arc::new(hooks),
            listener,
        })
    }

    /// Accept loop. Runs until the task is cancelled or accept fails hard.
    pub async fn serve(self) -> Result<(), ServerError> {
        loop {
            let (stream, _addr) = self.listener.accept().await?;
            let handler = self.handler.clone();
            let config = self.config.clone();
            let hooks = self.hooks.clone();
            tokio::spawn(async move {
                if let Err(e) = serve_connection(stream, &config, handler, &hooks).await {
                    warn!(error = %e, "connection aborted");
                }
            });
        }
    }
}

/// One connection: read a frame, answer a frame, close.
async fn serve_connection(
    mut stream: UnixStream,
    config: &RuntimeConfig,
    handler: Arc<dyn Handler>,
    hooks: &PressureHooks,
) -> Result<(), ServerError> {
    let body = match read_frame(&mut stream, config.max_message_size).await {
        Ok(body) => body,
        Err(FrameError::TooLarge { len, max }) => {
            let details = ErrorDetails::new(
                ErrorCode::MessageTooLarge,
                format!("frame of {len} bytes exceeds cap of {max}"),
            );
            return answer(&mut stream, config, &details_to_body(&details)).await;
        }
        Err(FrameError::Eof) => {
            // Peer gave up before sending a full frame; nothing to answer.
            return Ok(());
        }
        Err(FrameError::Io(e)) => return Err(e.into()),
    };

    let response = process_body(&body, config, handler.as_ref(), hooks).await;
    answer(&mut stream, config, &response).await
}

async fn answer(
    stream: &mut UnixStream,
    config: &RuntimeConfig,
    body: &[u8],
) -> Result<(), ServerError> {
    match write_frame(stream, body, config.max_message_size).await {
        Ok(()) => Ok(()),
        Err(FrameError::TooLarge { len, max }) => {
            // The handler's own output blew the cap; downgrade to an error
            // response, which is always small.
            let details = ErrorDetails::new(
                ErrorCode::MessageTooLarge,
                format!("response of {len} bytes exceeds cap of {max}"),
            );
            write_frame(stream, &details_to_body(&details), config.max_message_size)
                .await
                .map_err(io_of_frame)?;
            Ok(())
        }
        Err(e) => Err(io_of_frame(e)),
    }
}

fn io_of_frame(e: FrameError) -> ServerError {
    match e {
        FrameError::Io(io) => ServerError::Io(io),
        other => ServerError::Io(std::io::Error::other(other)),
    }
}

fn details_to_body(details: &ErrorDetails) -> Vec<u8> {
    error_body(details)
}

/// Classify, dispatch, and encode a single request body.
async fn process_body(
    body: &[u8],
    config: &RuntimeConfig,
    handler: &dyn Handler,
    hooks: &PressureHooks,
) -> Vec<u8> {
    let envelope: Envelope = match serde_json::from_slice(body) {
        Ok(envelope) => envelope,
        Err(e) => {
            return details_to_body(&ErrorDetails::new(
                ErrorCode::InvalidJson,
                format!("request frame is not a valid envelope: {e}"),
            ));
        }
    };

    if config.enable_validation {
        if let Err(e) = validate_envelope(&envelope) {
            return details_to_body(
                &ErrorDetails::new(ErrorCode::Validation, e.to_string())
                    .with_kind("EnvelopeValidation"),
            );
        }
    }

    let inbound_route = envelope.route.clone();
    let invocation = match config.mode {
        HandlerMode::Payload => Invocation::Payload(envelope.payload),
        HandlerMode::Envelope => Invocation::Envelope(envelope),
    };

    let outcome = match handler.invoke(invocation).await {
        Ok(outcome) => outcome,
        Err(failure) => {
            run_pressure_hooks(failure.code, config, hooks);
            return details_to_body(&(&failure).into());
        }
    };

    let value: Value = match outcome {
        HandlerOutcome::Value(value) => value,
        HandlerOutcome::Values(values) => Value::Array(values),
        HandlerOutcome::None => Value::Null,
        HandlerOutcome::Envelope(outbound) => {
            if let Err(e) = validate_route_mutation(&inbound_route, &outbound.route) {
                return details_to_body(
                    &ErrorDetails::new(ErrorCode::Validation, e.to_string())
                        .with_kind("RouteMutation"),
                );
            }
            match serde_json::to_value(&*outbound) {
                Ok(value) => value,
                Err(e) => {
                    return details_to_body(&ErrorDetails::new(
                        ErrorCode::Server,
                        format!("failed to encode envelope: {e}"),
                    ));
                }
            }
        }
    };

    match serde_json::to_vec(&value) {
        Ok(bytes) => bytes,
        Err(e) => details_to_body(&ErrorDetails::new(
            ErrorCode::Server,
            format!("failed to encode response: {e}"),
        )),
    }
}

fn run_pressure_hooks(code: ErrorCode, config: &RuntimeConfig, hooks: &PressureHooks) {
    match code {
        ErrorCode::Oom if config.enable_oom_detection => {
            warn!("host memory pressure reported; running cleanup hook");
            if let Some(hook) = &hooks.on_oom {
                hook();
            }
        }
        ErrorCode::CudaOom if config.cuda_cleanup_on_oom => {
            warn!("accelerator memory pressure reported; releasing caches");
            if let Some(hook) = &hooks.on_cuda_oom {
                hook();
            }
        }
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{HandlerFailure, PayloadFn};
    use asya_protocol::HandlerResponse;
    use async_trait::async_trait;
    use serde_json::json;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_config(dir: &tempfile::TempDir) -> RuntimeConfig {
        RuntimeConfig {
            socket_path: dir.path().join("app.sock"),
            handler: "tests.handler".into(),
            ..RuntimeConfig::default()
        }
    }

    async fn spawn_server(
        config: RuntimeConfig,
        handler: Arc<dyn Handler>,
    ) -> (PathBuf, tokio::task::JoinHandle<()>) {
        let path = config.socket_path.clone();
        let server = RuntimeServer::bind(config, handler).await.unwrap();
        let join = tokio::spawn(async move {
            let _ = server.serve().await;
        });
        (path, join)
    }

    async fn exchange(path: &PathBuf, body: &[u8]) -> Vec<u8> {
        let mut stream = UnixStream::connect(path).await.unwrap();
        write_frame(&mut stream, body, asya_protocol::DEFAULT_MAX_FRAME)
            .await
            .unwrap();
        read_frame(&mut stream, asya_protocol::DEFAULT_MAX_FRAME)
            .await
            .unwrap()
    }

    fn envelope_bytes(steps: &[&str], payload: Value) -> Vec<u8> {
        let envelope = Envelope::new(steps.iter().map(|s| s.to_string()).collect(), payload);
        serde_json::to_vec(&envelope).unwrap()
    }

    #[tokio::test]
    async fn payload_mode_returns_handler_value() {
        let dir = tempfile::tempdir().unwrap();
        let handler = Arc::new(PayloadFn(|p: Value| {
            let n = p["n"].as_i64().unwrap_or(0);
            Ok(HandlerOutcome::Value(json!({"n": n + 1})))
        }));
        let (path, join) = spawn_server(test_config(&dir), handler).await;

        let body = exchange(&path, &envelope_bytes(&["a"], json!({"n": 1}))).await;
        assert_eq!(
            HandlerResponse::from_bytes(&body),
            HandlerResponse::Single(json!({"n": 2}))
        );
        join.abort();
    }

    #[tokio::test]
    async fn readiness_marker_appears() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let ready = config.ready_path();
        let handler = Arc::new(PayloadFn(|p| Ok(HandlerOutcome::Value(p))));
        let (_path, join) = spawn_server(config, handler).await;
        assert!(tokio::fs::try_exists(&ready).await.unwrap());
        join.abort();
    }

    #[tokio::test]
    async fn invalid_json_is_classified() {
        let dir = tempfile::tempdir().unwrap();
        let handler = Arc::new(PayloadFn(|p| Ok(HandlerOutcome::Value(p))));
        let (path, join) = spawn_server(test_config(&dir), handler).await;

        let body = exchange(&path, b"{not an envelope").await;
        match HandlerResponse::from_bytes(&body) {
            HandlerResponse::Error(d) => assert_eq!(d.error, ErrorCode::InvalidJson),
            other => panic!("expected error, got {other:?}"),
        }
        join.abort();
    }

    #[tokio::test]
    async fn oversize_request_is_message_too_large() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(&dir);
        config.max_message_size = 256;
        let handler = Arc::new(PayloadFn(|p| Ok(HandlerOutcome::Value(p))));
        let (path, join) = spawn_server(config, handler).await;

        let mut stream = UnixStream::connect(&path).await.unwrap();
        let big = envelope_bytes(&["a"], json!({"blob": "x".repeat(512)}));
        // Write with a generous cap so the oversize body actually leaves.
        write_frame(&mut stream, &big, asya_protocol::DEFAULT_MAX_FRAME)
            .await
            .unwrap();
        let body = read_frame(&mut stream, asya_protocol::DEFAULT_MAX_FRAME)
            .await
            .unwrap();
        match HandlerResponse::from_bytes(&body) {
            HandlerResponse::Error(d) => assert_eq!(d.error, ErrorCode::MessageTooLarge),
            other => panic!("expected error, got {other:?}"),
        }
        join.abort();
    }

    #[tokio::test]
    async fn validation_rejects_reserved_step() {
        let dir = tempfile::tempdir().unwrap();
        let handler = Arc::new(PayloadFn(|p| Ok(HandlerOutcome::Value(p))));
        let (path, join) = spawn_server(test_config(&dir), handler).await;

        let body = exchange(&path, &envelope_bytes(&["a", "happy-end"], json!({}))).await;
        match HandlerResponse::from_bytes(&body) {
            HandlerResponse::Error(d) => assert_eq!(d.error, ErrorCode::Validation),
            other => panic!("expected error, got {other:?}"),
        }
        join.abort();
    }

    #[tokio::test]
    async fn handler_failure_carries_its_code() {
        let dir = tempfile::tempdir().unwrap();
        let handler = Arc::new(PayloadFn(|_| {
            Err(HandlerFailure::validation("n must be positive").with_kind("ValueError"))
        }));
        let (path, join) = spawn_server(test_config(&dir), handler).await;

        let body = exchange(&path, &envelope_bytes(&["a"], json!({"n": -1}))).await;
        match HandlerResponse::from_bytes(&body) {
            HandlerResponse::Error(d) => {
                assert_eq!(d.error, ErrorCode::Validation);
                assert_eq!(d.kind.as_deref(), Some("ValueError"));
            }
            other => panic!("expected error, got {other:?}"),
        }
        join.abort();
    }

    #[tokio::test]
    async fn fanout_and_abort_encode_as_array_and_null() {
        let dir = tempfile::tempdir().unwrap();
        let handler = Arc::new(PayloadFn(|p: Value| {
            if p["mode"] == "fanout" {
                Ok(HandlerOutcome::Values(vec![json!({"v": 1}), json!({"v": 2})]))
            } else {
                Ok(HandlerOutcome::None)
            }
        }));
        let (path, join) = spawn_server(test_config(&dir), handler).await;

        let body = exchange(&path, &envelope_bytes(&["a"], json!({"mode": "fanout"}))).await;
        assert!(matches!(
            HandlerResponse::from_bytes(&body),
            HandlerResponse::FanOut(items) if items.len() == 2
        ));

        let body = exchange(&path, &envelope_bytes(&["a"], json!({"mode": "abort"}))).await;
        assert_eq!(HandlerResponse::from_bytes(&body), HandlerResponse::Abort);
        join.abort();
    }

    struct RouteRewriter {
        rewrite_history: bool,
    }

    #[async_trait]
    impl Handler for RouteRewriter {
        async fn invoke(&self, invocation: Invocation) -> Result<HandlerOutcome, HandlerFailure> {
            let Invocation::Envelope(mut envelope) = invocation else {
                return Err(HandlerFailure::processing("expected envelope mode"));
            };
            if self.rewrite_history {
                envelope.route.steps[0] = "rewritten".into();
            } else {
                envelope.route.steps.push("extra".into());
            }
            Ok(HandlerOutcome::Envelope(Box::new(envelope)))
        }
    }

    #[tokio::test]
    async fn envelope_mode_allows_future_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(&dir);
        config.mode = HandlerMode::Envelope;
        let (path, join) = spawn_server(
            config,
            Arc::new(RouteRewriter {
                rewrite_history: false,
            }),
        )
        .await;

        let mut envelope = Envelope::new(vec!["a".into(), "b".into()], json!({}));
        envelope.route.current = 1;
        let body = exchange(&path, &serde_json::to_vec(&envelope).unwrap()).await;
        match HandlerResponse::from_bytes(&body) {
            HandlerResponse::Single(value) => {
                let out: Envelope = serde_json::from_value(value).unwrap();
                assert_eq!(out.route.steps, vec!["a", "b", "extra"]);
            }
            other => panic!("expected envelope, got {other:?}"),
        }
        join.abort();
    }

    #[tokio::test]
    async fn envelope_mode_rejects_history_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(&dir);
        config.mode = HandlerMode::Envelope;
        let (path, join) = spawn_server(
            config,
            Arc::new(RouteRewriter {
                rewrite_history: true,
            }),
        )
        .await;

        let mut envelope = Envelope::new(vec!["a".into(), "b".into()], json!({}));
        envelope.route.current = 1;
        let body = exchange(&path, &serde_json::to_vec(&envelope).unwrap()).await;
        match HandlerResponse::from_bytes(&body) {
            HandlerResponse::Error(d) => {
                assert_eq!(d.error, ErrorCode::Validation);
                assert_eq!(d.kind.as_deref(), Some("RouteMutation"));
            }
            other => panic!("expected error, got {other:?}"),
        }
        join.abort();
    }

    #[tokio::test]
    async fn oom_failure_runs_hook_when_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(&dir);
        config.enable_oom_detection = true;
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let hooks = PressureHooks {
            on_oom: Some(Box::new(move || {
                seen.fetch_add(1, Ordering::SeqCst);
            })),
            on_cuda_oom: None,
        };
        let handler: Arc<dyn Handler> =
            Arc::new(PayloadFn(|_| Err(HandlerFailure::oom("allocator failed"))));
        let path = config.socket_path.clone();
        let server = RuntimeServer::bind_with_hooks(config, handler, hooks)
            .await
            .unwrap();
        let join = tokio::spawn(async move {
            let _ = server.serve().await;
        });

        let body = exchange(&path, &envelope_bytes(&["a"], json!({}))).await;
        match HandlerResponse::from_bytes(&body) {
            HandlerResponse::Error(d) => assert_eq!(d.error, ErrorCode::Oom),
            other => panic!("expected error, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        join.abort();
    }

    #[tokio::test]
    async fn from_registry_rejects_unknown_handler() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let registry = crate::registry::HandlerRegistry::new();
        let err = RuntimeServer::from_registry(config, &registry).await;
        assert!(matches!(err, Err(ServerError::Registry(_))));
    }

    #[tokio::test]
    async fn stale_socket_is_replaced_on_bind() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let handler: Arc<dyn Handler> = Arc::new(PayloadFn(|p| Ok(HandlerOutcome::Value(p))));

        let first = RuntimeServer::bind(config.clone(), handler.clone()).await.unwrap();
        drop(first);
        // The socket file is left behind; a second bind must still succeed.
        let second = RuntimeServer::bind(config, handler).await;
        assert!(second.is_ok());
    }
}
