// SPDX-License-Identifier: MIT OR Apache-2.0
//! The sidecar side of the runtime protocol: one exchange per envelope.

use asya_core::{ErrorCode, ErrorDetails};
use asya_protocol::{FrameError, HandlerResponse, read_frame, write_frame};
use std::path::Path;
use std::time::Duration;
use tokio::net::UnixStream;
use tracing::debug;

/// Send the envelope bytes over a fresh connection and interpret the
/// single response frame, all under the sidecar-owned deadline.
///
/// Never returns an error: every failure mode maps into the closed code
/// set so the caller has exactly one path to the error sink. On deadline
/// expiry the connection is dropped, which the runtime observes as a
/// closed peer.
pub async fn invoke_handler(
    socket_path: &Path,
    envelope_bytes: &[u8],
    timeout: Duration,
    max_frame: usize,
) -> HandlerResponse {
    match tokio::time::timeout(timeout, exchange(socket_path, envelope_bytes, max_frame)).await {
        Ok(Ok(response)) => response,
        Ok(Err(details)) => HandlerResponse::Error(details),
        Err(_elapsed) => HandlerResponse::Error(ErrorDetails::new(
            ErrorCode::Timeout,
            format!(
                "handler did not answer within {}",
                humantime::format_duration(timeout)
            ),
        )),
    }
}

async fn exchange(
    socket_path: &Path,
    envelope_bytes: &[u8],
    max_frame: usize,
) -> Result<HandlerResponse, ErrorDetails> {
    if envelope_bytes.len() > max_frame {
        return Err(ErrorDetails::new(
            ErrorCode::MessageTooLarge,
            format!(
                "envelope of {} bytes exceeds cap of {max_frame}",
                envelope_bytes.len()
            ),
        ));
    }

    let mut stream = UnixStream::connect(socket_path).await.map_err(|e| {
        ErrorDetails::new(
            ErrorCode::Connection,
            format!("connect to {} failed: {e}", socket_path.display()),
        )
    })?;
    debug!(path = %socket_path.display(), "handler connection opened");

    write_frame(&mut stream, envelope_bytes, max_frame)
        .await
        .map_err(connection_details)?;

    let body = match read_frame(&mut stream, max_frame).await {
        Ok(body) => body,
        Err(FrameError::TooLarge { len, max }) => {
            return Err(ErrorDetails::new(
                ErrorCode::MessageTooLarge,
                format!("handler response of {len} bytes exceeds cap of {max}"),
            ));
        }
        Err(e) => return Err(connection_details(e)),
    };

    Ok(HandlerResponse::from_bytes(&body))
}

fn connection_details(e: FrameError) -> ErrorDetails {
    match e {
        FrameError::TooLarge { len, max } => ErrorDetails::new(
            ErrorCode::MessageTooLarge,
            format!("frame of {len} bytes exceeds cap of {max}"),
        ),
        FrameError::Eof => ErrorDetails::new(
            ErrorCode::Connection,
            "handler closed the socket mid-exchange",
        ),
        FrameError::Io(e) => {
            ErrorDetails::new(ErrorCode::Connection, format!("socket I/O failed: {e}"))
        }
    }
}
