// SPDX-License-Identifier: MIT OR Apache-2.0
//! In-process transport with competing-consumer and redelivery semantics.

use crate::{AckHandle, Delivery, DeliveryStream, Transport, TransportError};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Default)]
struct QueueState {
    ready: VecDeque<(u64, Vec<u8>)>,
    unacked: HashMap<u64, Vec<u8>>,
}

struct Shared {
    queues: Mutex<HashMap<String, QueueState>>,
    notify: Notify,
    next_token: AtomicU64,
}

/// In-memory transport backing tests and single-process runs.
///
/// Messages live in per-queue FIFO buffers. A consumed message moves to an
/// unacked set until acked (dropped) or nacked (optionally requeued at the
/// front, mimicking broker redelivery). Clones share the same queues.
#[derive(Clone)]
pub struct MemoryTransport {
    shared: Arc<Shared>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    /// A fresh, empty transport.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                queues: Mutex::new(HashMap::new()),
                notify: Notify::new(),
                next_token: AtomicU64::new(1),
            }),
        }
    }

    /// Drain every message currently ready on a queue (test helper).
    pub fn drain(&self, queue: &str) -> Vec<Vec<u8>> {
        let mut queues = self.shared.queues.lock().unwrap_or_else(|e| e.into_inner());
        queues
            .entry(queue.to_string())
            .or_default()
            .ready
            .drain(..)
            .map(|(_, body)| body)
            .collect()
    }

    /// Remove a queue and everything on it.
    pub async fn delete_queue(&self, queue: &str) -> Result<(), TransportError> {
        self.lock().remove(queue);
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, QueueState>> {
        // Lock poisoning only happens when a holder panicked; queue state
        // itself stays coherent, so recover the guard.
        self.shared.queues.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn ensure_queue(&self, queue: &str) -> Result<(), TransportError> {
        self.lock().entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream, TransportError> {
        self.ensure_queue(queue).await?;
        let shared = self.shared.clone();
        let queue = queue.to_string();
        let stream = futures::stream::unfold((shared, queue), |(shared, queue)| async move {
            loop {
                let popped = {
                    let mut queues = shared.queues.lock().unwrap_or_else(|e| e.into_inner());
                    let state = queues.entry(queue.clone()).or_default();
                    state.ready.pop_front().map(|(token, body)| {
                        state.unacked.insert(token, body.clone());
                        (token, body)
                    })
                };
                if let Some((token, body)) = popped {
                    let delivery = Delivery {
                        queue: queue.clone(),
                        body,
                        handle: AckHandle::Memory {
                            queue: queue.clone(),
                            token,
                        },
                    };
                    return Some((Ok(delivery), (shared, queue)));
                }
                // Short poll fallback so a wakeup lost to the check/wait
                // race cannot strand the consumer.
                let _ = tokio::time::timeout(Duration::from_millis(20), shared.notify.notified())
                    .await;
            }
        });
        Ok(Box::pin(stream))
    }

    async fn publish(&self, queue: &str, body: &[u8]) -> Result<(), TransportError> {
        let token = self.shared.next_token.fetch_add(1, Ordering::Relaxed);
        self.lock()
            .entry(queue.to_string())
            .or_default()
            .ready
            .push_back((token, body.to_vec()));
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), TransportError> {
        match &delivery.handle {
            AckHandle::Memory { queue, token } => {
                self.lock().entry(queue.clone()).or_default().unacked.remove(token);
                Ok(())
            }
            AckHandle::Amqp(_) => Err(TransportError::ForeignHandle),
        }
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), TransportError> {
        match &delivery.handle {
            AckHandle::Memory { queue, token } => {
                let mut queues = self.lock();
                let state = queues.entry(queue.clone()).or_default();
                if let Some(body) = state.unacked.remove(token) {
                    if requeue {
                        state.ready.push_front((*token, body));
                        drop(queues);
                        self.shared.notify.notify_waiters();
                    }
                }
                Ok(())
            }
            AckHandle::Amqp(_) => Err(TransportError::ForeignHandle),
        }
    }

    async fn health_check(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn queue_depth(&self, queue: &str) -> Result<u64, TransportError> {
        Ok(self
            .lock()
            .get(queue)
            .map(|state| state.ready.len() as u64)
            .unwrap_or(0))
    }
}
