// SPDX-License-Identifier: MIT OR Apache-2.0
//! AMQP transport on lapin.

use crate::{AckHandle, Delivery, DeliveryStream, Transport, TransportError};
use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tracing::debug;

/// AMQP transport: one connection, one channel, publisher confirms on.
///
/// Queues are declared durable; messages publish persistent. Prefetch is
/// applied per consumer channel so one slow envelope does not starve the
/// pod's siblings.
pub struct AmqpTransport {
    connection: Connection,
    channel: Channel,
    prefetch: u16,
}

impl AmqpTransport {
    /// Connect and prepare the publishing channel.
    pub async fn connect(url: &str, prefetch: u16) -> Result<Self, TransportError> {
        let connection = Connection::connect(
            url,
            ConnectionProperties::default()
                .with_executor(tokio_executor_trait::Tokio::current())
                .with_reactor(tokio_reactor_trait::Tokio),
        )
        .await?;
        let channel = connection.create_channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        debug!(prefetch, "amqp transport connected");
        Ok(Self {
            connection,
            channel,
            prefetch,
        })
    }

    fn durable_declare() -> QueueDeclareOptions {
        QueueDeclareOptions {
            durable: true,
            ..QueueDeclareOptions::default()
        }
    }

    /// Delete a queue outright. Operator teardown path; consumers use the
    /// [`Transport`] façade instead.
    pub async fn delete_queue(&self, queue: &str) -> Result<(), TransportError> {
        self.channel
            .queue_delete(queue, lapin::options::QueueDeleteOptions::default())
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn ensure_queue(&self, queue: &str) -> Result<(), TransportError> {
        self.channel
            .queue_declare(queue, Self::durable_declare(), FieldTable::default())
            .await?;
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream, TransportError> {
        // Consumers get their own channel so qos and channel-level errors
        // stay isolated from the publish path.
        let channel = self.connection.create_channel().await?;
        channel
            .basic_qos(self.prefetch, BasicQosOptions::default())
            .await?;
        channel
            .queue_declare(queue, Self::durable_declare(), FieldTable::default())
            .await?;
        let consumer = channel
            .basic_consume(
                queue,
                "asya-sidecar",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        let queue = queue.to_string();
        let stream = consumer.map(move |item| {
            item.map(|delivery| Delivery {
                queue: queue.clone(),
                body: delivery.data,
                handle: AckHandle::Amqp(delivery.acker),
            })
            .map_err(TransportError::from)
        });
        Ok(Box::pin(stream))
    }

    async fn publish(&self, queue: &str, body: &[u8]) -> Result<(), TransportError> {
        let confirm = self
            .channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                body,
                BasicProperties::default().with_delivery_mode(2),
            )
            .await?
            .await?;
        match confirm {
            Confirmation::Nack(_) => Err(TransportError::PublishNotConfirmed {
                queue: queue.to_string(),
            }),
            Confirmation::Ack(_) | Confirmation::NotRequested => Ok(()),
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), TransportError> {
        match &delivery.handle {
            AckHandle::Amqp(acker) => {
                acker.ack(BasicAckOptions::default()).await?;
                Ok(())
            }
            AckHandle::Memory { .. } => Err(TransportError::ForeignHandle),
        }
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), TransportError> {
        match &delivery.handle {
            AckHandle::Amqp(acker) => {
                acker
                    .nack(BasicNackOptions {
                        requeue,
                        ..BasicNackOptions::default()
                    })
                    .await?;
                Ok(())
            }
            AckHandle::Memory { .. } => Err(TransportError::ForeignHandle),
        }
    }

    async fn health_check(&self) -> Result<(), TransportError> {
        if self.connection.status().connected() {
            Ok(())
        } else {
            Err(TransportError::Unavailable(
                "amqp connection is not open".into(),
            ))
        }
    }

    async fn queue_depth(&self, queue: &str) -> Result<u64, TransportError> {
        let declared = self
            .channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    passive: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(u64::from(declared.message_count()))
    }
}
