// SPDX-License-Identifier: MIT OR Apache-2.0
//! Endpoint configuration from the `ASYA_*` environment.

use asya_protocol::{DEFAULT_MAX_FRAME, HandlerMode};
use std::path::PathBuf;
use thiserror::Error;

/// Default socket path shared with the sidecar.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/sockets/app.sock";

/// Errors reading the runtime environment.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required variable is missing.
    #[error("{0} must be set")]
    Missing(&'static str),

    /// A variable held an unparseable value.
    #[error("{var} has invalid value '{value}' (expected {expected})")]
    BadValue {
        /// Variable name.
        var: &'static str,
        /// Offending value.
        value: String,
        /// What would have been accepted.
        expected: &'static str,
    },
}

/// Runtime endpoint settings.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Filesystem path of the listening socket.
    pub socket_path: PathBuf,
    /// Symbolic handler reference resolved against the registry.
    pub handler: String,
    /// Invocation mode.
    pub mode: HandlerMode,
    /// Whether envelope-shape validation runs before dispatch.
    pub enable_validation: bool,
    /// Frame body cap in bytes.
    pub max_message_size: usize,
    /// Run the host-memory cleanup hook on `oom_error`.
    pub enable_oom_detection: bool,
    /// Run the accelerator cache-release hook on `cuda_oom_error`.
    pub cuda_cleanup_on_oom: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            handler: String::new(),
            mode: HandlerMode::Payload,
            enable_validation: true,
            max_message_size: DEFAULT_MAX_FRAME,
            enable_oom_detection: false,
            cuda_cleanup_on_oom: false,
        }
    }
}

fn env_bool(var: &'static str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(var) {
        Ok(value) => match value.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => Err(ConfigError::BadValue {
                var,
                value: other.to_string(),
                expected: "a boolean",
            }),
        },
        Err(_) => Ok(default),
    }
}

impl RuntimeConfig {
    /// Read the `ASYA_*` variables; `ASYA_HANDLER` is required.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let handler =
            std::env::var("ASYA_HANDLER").map_err(|_| ConfigError::Missing("ASYA_HANDLER"))?;
        let socket_path = std::env::var("ASYA_SOCKET_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.socket_path);
        let mode = match std::env::var("ASYA_HANDLER_MODE") {
            Ok(value) => value.parse().map_err(|_| ConfigError::BadValue {
                var: "ASYA_HANDLER_MODE",
                value,
                expected: "payload or envelope",
            })?,
            Err(_) => HandlerMode::Payload,
        };
        let max_message_size = match std::env::var("ASYA_MAX_MESSAGE_SIZE") {
            Ok(value) => value.parse::<usize>().map_err(|_| ConfigError::BadValue {
                var: "ASYA_MAX_MESSAGE_SIZE",
                value,
                expected: "a byte count",
            })?,
            Err(_) => defaults.max_message_size,
        };
        Ok(Self {
            socket_path,
            handler,
            mode,
            enable_validation: env_bool("ASYA_ENABLE_VALIDATION", defaults.enable_validation)?,
            max_message_size,
            enable_oom_detection: env_bool(
                "ASYA_ENABLE_OOM_DETECTION",
                defaults.enable_oom_detection,
            )?,
            cuda_cleanup_on_oom: env_bool("ASYA_CUDA_CLEANUP_ON_OOM", defaults.cuda_cleanup_on_oom)?,
        })
    }

    /// Path of the readiness marker, next to the data socket.
    pub fn ready_path(&self) -> PathBuf {
        let mut os = self.socket_path.clone().into_os_string();
        os.push(".ready");
        PathBuf::from(os)
    }
}
