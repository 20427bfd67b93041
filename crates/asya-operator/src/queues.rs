// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-actor queue provisioning.

use crate::config::TransportEntry;
use asya_transport::{AmqpTransport, Transport, TransportError};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Declares and deletes per-actor queues, caching one broker connection
/// per configured transport.
#[derive(Default)]
pub struct QueueProvisioner {
    connections: Mutex<HashMap<String, Arc<AmqpTransport>>>,
}

impl QueueProvisioner {
    /// An empty provisioner.
    pub fn new() -> Self {
        Self::default()
    }

    async fn connection(
        &self,
        name: &str,
        entry: &TransportEntry,
    ) -> Result<Arc<AmqpTransport>, TransportError> {
        let mut connections = self.connections.lock().await;
        if let Some(existing) = connections.get(name) {
            if existing.health_check().await.is_ok() {
                return Ok(existing.clone());
            }
            debug!(transport = %name, "cached broker connection unhealthy, reconnecting");
            connections.remove(name);
        }
        let TransportEntry::Amqp { url, .. } = entry;
        let transport = Arc::new(AmqpTransport::connect(url, 1).await?);
        connections.insert(name.to_string(), transport.clone());
        Ok(transport)
    }

    /// Declare the queue on the transport; idempotent.
    pub async fn ensure(
        &self,
        transport_name: &str,
        entry: &TransportEntry,
        queue: &str,
    ) -> Result<(), TransportError> {
        let connection = self.connection(transport_name, entry).await?;
        connection.ensure_queue(queue).await?;
        info!(queue = %queue, transport = %transport_name, "queue ensured");
        Ok(())
    }

    /// Delete the queue; used on actor teardown when configured.
    pub async fn delete(
        &self,
        transport_name: &str,
        entry: &TransportEntry,
        queue: &str,
    ) -> Result<(), TransportError> {
        let connection = self.connection(transport_name, entry).await?;
        connection.delete_queue(queue).await?;
        info!(queue = %queue, transport = %transport_name, "queue deleted");
        Ok(())
    }
}
