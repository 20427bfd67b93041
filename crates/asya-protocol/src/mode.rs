// SPDX-License-Identifier: MIT OR Apache-2.0
//! Handler invocation modes.

use thiserror::Error;

/// How the endpoint presents work to the handler.
///
/// Part of the protocol contract: the sidecar and the runtime must agree,
/// so the operator sets the same value on both containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandlerMode {
    /// Handler sees only the payload; the sidecar manages routing.
    #[default]
    Payload,
    /// Handler sees the full envelope and may rewrite future steps.
    Envelope,
}

/// Parse failure for [`HandlerMode`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown handler mode '{0}' (expected payload or envelope)")]
pub struct UnknownModeError(pub String);

impl std::str::FromStr for HandlerMode {
    type Err = UnknownModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "payload" => Ok(Self::Payload),
            "envelope" => Ok(Self::Envelope),
            other => Err(UnknownModeError(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_both_modes() {
        assert_eq!("payload".parse::<HandlerMode>().unwrap(), HandlerMode::Payload);
        assert_eq!("envelope".parse::<HandlerMode>().unwrap(), HandlerMode::Envelope);
    }

    #[test]
    fn rejects_unknown_mode() {
        let err = "full".parse::<HandlerMode>().unwrap_err();
        assert_eq!(err, UnknownModeError("full".into()));
    }

    #[test]
    fn default_is_payload() {
        assert_eq!(HandlerMode::default(), HandlerMode::Payload);
    }
}
