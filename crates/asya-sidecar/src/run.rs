// SPDX-License-Identifier: MIT OR Apache-2.0
//! The consume loop with bounded concurrency and graceful drain.

use crate::router::Router;
use asya_transport::{Transport, TransportError};
use futures::StreamExt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

/// Errors that stop the consume loop.
#[derive(Debug, Error)]
pub enum RunError {
    /// The transport failed while setting up or consuming.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Consume the actor's queue until `shutdown` resolves, then drain.
///
/// Up to `prefetch` envelopes are in flight at once; each gets its own
/// task owning its IPC connection from connect through response. After the
/// stop signal, intake ends and in-flight envelopes get
/// `graceful_shutdown` to finish; whatever remains is redelivered by the
/// transport.
pub async fn consume_loop(
    router: Arc<Router>,
    transport: Arc<dyn Transport>,
    shutdown: impl Future<Output = ()>,
) -> Result<(), RunError> {
    let config = router.config().clone();
    let queue = config.own_queue();

    transport.ensure_queue(&queue).await?;
    transport
        .ensure_queue(&config.naming.queue_for(&config.happy_end))
        .await?;
    transport
        .ensure_queue(&config.naming.queue_for(&config.error_end))
        .await?;

    let mut stream = transport.consume(&queue).await?;
    let limiter = Arc::new(Semaphore::new(config.prefetch.max(1) as usize));
    let mut inflight = JoinSet::new();

    info!(queue = %queue, prefetch = config.prefetch, "consuming");
    tokio::pin!(shutdown);

    loop {
        // Reap finished tasks so the set does not grow unbounded.
        while inflight.try_join_next().is_some() {}

        let permit = tokio::select! {
            () = &mut shutdown => break,
            permit = limiter.clone().acquire_owned() => {
                // The semaphore lives as long as the loop; acquire cannot
                // fail.
                match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                }
            }
        };

        let item = tokio::select! {
            () = &mut shutdown => break,
            item = stream.next() => item,
        };

        match item {
            Some(Ok(delivery)) => {
                let router = router.clone();
                inflight.spawn(async move {
                    let outcome = router.process(delivery).await;
                    drop(permit);
                    outcome
                });
            }
            Some(Err(e)) => {
                warn!(error = %e, "consume error");
                drop(permit);
            }
            None => {
                warn!(queue = %queue, "consumer stream ended");
                break;
            }
        }
    }

    info!(
        pending = inflight.len(),
        "stopping intake, draining in-flight envelopes"
    );
    let drain = async {
        while inflight.join_next().await.is_some() {}
    };
    if tokio::time::timeout(config.graceful_shutdown, drain).await.is_err() {
        warn!(
            "graceful shutdown budget exhausted; unacked envelopes will redeliver"
        );
        inflight.abort_all();
    }
    Ok(())
}
