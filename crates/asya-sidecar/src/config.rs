// SPDX-License-Identifier: MIT OR Apache-2.0
//! Sidecar configuration from the `ASYA_*` environment.

use asya_core::{ERROR_END, HAPPY_END, QueueNaming};
use asya_protocol::{DEFAULT_MAX_FRAME, HandlerMode};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Default sidecar-owned IPC deadline.
pub const DEFAULT_RUNTIME_TIMEOUT: Duration = Duration::from_secs(300);

/// Default budget for in-flight envelopes during shutdown.
pub const DEFAULT_GRACEFUL_SHUTDOWN: Duration = Duration::from_secs(30);

/// Errors reading the sidecar environment.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Neither `ASYA_ACTOR_NAME` nor `ASYA_QUEUE_NAME` was set.
    #[error("ASYA_ACTOR_NAME (or ASYA_QUEUE_NAME) must be set")]
    MissingActorName,

    /// A variable held an unparseable value.
    #[error("{var} has invalid value '{value}': {reason}")]
    BadValue {
        /// Variable name.
        var: &'static str,
        /// Offending value.
        value: String,
        /// Parse failure detail.
        reason: String,
    },
}

/// Which terminal sink this sidecar serves, if any.
///
/// Terminal sidecars consume but never publish downstream; they only post
/// the final job outcome to the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalRole {
    /// Consuming the happy-end queue.
    HappyEnd,
    /// Consuming the error-end queue.
    ErrorEnd,
}

/// Everything the router needs to run one actor's sidecar.
#[derive(Debug, Clone)]
pub struct SidecarConfig {
    /// This actor's step name; also names the consumed queue.
    pub actor_name: String,
    /// Pod-local IPC socket path (shared with the user container).
    pub socket_path: PathBuf,
    /// Sidecar-owned deadline for the whole IPC exchange.
    pub runtime_timeout: Duration,
    /// Frame/envelope size cap in bytes, ingress and egress.
    pub max_message_size: usize,
    /// Handler invocation mode; must match the runtime's setting.
    pub handler_mode: HandlerMode,
    /// Step name of the success sink.
    pub happy_end: String,
    /// Step name of the failure sink.
    pub error_end: String,
    /// Gateway base URL; heartbeats are enabled when set.
    pub gateway_url: Option<String>,
    /// Step-name → queue-name policy.
    pub naming: QueueNaming,
    /// Max envelopes in flight at once.
    pub prefetch: u16,
    /// How long in-flight envelopes may finish after a stop signal.
    pub graceful_shutdown: Duration,
    /// Bind address of the metrics/health server.
    pub metrics_addr: SocketAddr,
}

impl SidecarConfig {
    /// A config for the given actor with spec defaults everywhere else.
    pub fn for_actor(actor_name: impl Into<String>) -> Self {
        Self {
            actor_name: actor_name.into(),
            socket_path: PathBuf::from("/tmp/sockets/app.sock"),
            runtime_timeout: DEFAULT_RUNTIME_TIMEOUT,
            max_message_size: DEFAULT_MAX_FRAME,
            handler_mode: HandlerMode::Payload,
            happy_end: HAPPY_END.to_string(),
            error_end: ERROR_END.to_string(),
            gateway_url: None,
            naming: QueueNaming::default(),
            prefetch: 1,
            graceful_shutdown: DEFAULT_GRACEFUL_SHUTDOWN,
            metrics_addr: ([0, 0, 0, 0], 9090).into(),
        }
    }

    /// Read the `ASYA_*` variables of the pod environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let actor_name = std::env::var("ASYA_ACTOR_NAME")
            .or_else(|_| std::env::var("ASYA_QUEUE_NAME"))
            .map_err(|_| ConfigError::MissingActorName)?;
        let mut config = Self::for_actor(actor_name);

        if let Ok(path) = std::env::var("ASYA_SOCKET_PATH") {
            config.socket_path = PathBuf::from(path);
        }
        if let Ok(value) = std::env::var("ASYA_RUNTIME_TIMEOUT") {
            config.runtime_timeout = parse_duration("ASYA_RUNTIME_TIMEOUT", &value)?;
        }
        if let Ok(value) = std::env::var("ASYA_GRACEFUL_SHUTDOWN") {
            config.graceful_shutdown = parse_duration("ASYA_GRACEFUL_SHUTDOWN", &value)?;
        }
        if let Ok(value) = std::env::var("ASYA_MAX_MESSAGE_SIZE") {
            config.max_message_size = value.parse().map_err(|e: std::num::ParseIntError| {
                ConfigError::BadValue {
                    var: "ASYA_MAX_MESSAGE_SIZE",
                    value,
                    reason: e.to_string(),
                }
            })?;
        }
        if let Ok(value) = std::env::var("ASYA_HANDLER_MODE") {
            config.handler_mode = value.parse().map_err(|e: asya_protocol::UnknownModeError| {
                ConfigError::BadValue {
                    var: "ASYA_HANDLER_MODE",
                    value,
                    reason: e.to_string(),
                }
            })?;
        }
        if let Ok(value) = std::env::var("ASYA_STEP_HAPPY_END") {
            config.happy_end = value;
        }
        if let Ok(value) = std::env::var("ASYA_STEP_ERROR_END") {
            config.error_end = value;
        }
        if let Ok(value) = std::env::var("ASYA_GATEWAY_URL") {
            if !value.is_empty() {
                config.gateway_url = Some(value);
            }
        }
        if let Ok(value) = std::env::var("ASYA_QUEUE_PREFIX") {
            config.naming = QueueNaming::with_prefix(value);
        }
        if let Ok(value) = std::env::var("ASYA_PREFETCH") {
            config.prefetch = value.parse().map_err(|e: std::num::ParseIntError| {
                ConfigError::BadValue {
                    var: "ASYA_PREFETCH",
                    value,
                    reason: e.to_string(),
                }
            })?;
        }
        if let Ok(value) = std::env::var("ASYA_METRICS_ADDR") {
            config.metrics_addr = value.parse().map_err(|e: std::net::AddrParseError| {
                ConfigError::BadValue {
                    var: "ASYA_METRICS_ADDR",
                    value,
                    reason: e.to_string(),
                }
            })?;
        }
        Ok(config)
    }

    /// The queue this sidecar consumes.
    pub fn own_queue(&self) -> String {
        self.naming.queue_for(&self.actor_name)
    }

    /// Terminal role, derived from the actor name.
    pub fn terminal_role(&self) -> Option<TerminalRole> {
        if self.actor_name == self.happy_end {
            Some(TerminalRole::HappyEnd)
        } else if self.actor_name == self.error_end {
            Some(TerminalRole::ErrorEnd)
        } else {
            None
        }
    }
}

fn parse_duration(var: &'static str, value: &str) -> Result<Duration, ConfigError> {
    // Accept bare seconds as well as humantime forms like "5m" or "90s".
    if let Ok(secs) = value.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(value).map_err(|e| ConfigError::BadValue {
        var,
        value: value.to_string(),
        reason: e.to_string(),
    })
}
