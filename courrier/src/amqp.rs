//! Optional RabbitMQ intake.
//!
//! Consumes submissions from a durable queue and feeds them through the same
//! [`MailRouter`] as the RPC. The mailbox key travels in the routing key
//! (`<routing_prefix>.<key>`); the body is JSON with the remaining
//! `send_email` arguments.

use std::time::Duration;

use anyhow::{Context, Result};
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions,
        QueueDeclareOptions,
    },
    types::FieldTable,
    Channel, Connection, ConnectionProperties, Consumer,
};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::AmqpConfig;
use crate::router::{MailRouter, SendEmailRequest, SendOutcome};

const CONSUMER_TAG: &str = "courrier";

/// How long a delivery is held before being handed back for redelivery.
pub const REQUEUE_DELAY: Duration = Duration::from_secs(2);

/// Message body expected on the queue.
#[derive(Debug, Deserialize)]
pub struct AmqpSubmission {
    pub recipients: Vec<String>,
    pub subject: String,
    pub text: String,
    #[serde(default)]
    pub html: Option<String>,
}

/// What to tell the broker about a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    /// Drop it: resubmitting the same bytes can never succeed.
    Reject,
    /// Hand it back to the broker for a later attempt.
    Requeue,
}

impl Disposition {
    /// Pause before settling, so a failing spool is not fed the same
    /// delivery in a tight loop.
    pub fn delay(self) -> Option<Duration> {
        match self {
            Self::Requeue => Some(REQUEUE_DELAY),
            Self::Ack | Self::Reject => None,
        }
    }
}

impl From<SendOutcome> for Disposition {
    fn from(outcome: SendOutcome) -> Self {
        if outcome.is_enqueued() {
            Self::Ack
        } else if outcome.is_retryable() {
            Self::Requeue
        } else {
            Self::Reject
        }
    }
}

/// Extract the mailbox key from a routing key such as `mailing.newsletter`.
pub fn mailbox_key<'a>(routing_key: &'a str, prefix: &str) -> &'a str {
    routing_key
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('.'))
        .unwrap_or(routing_key)
}

/// Turn one delivery into a router request.
pub fn parse_submission(
    routing_key: &str,
    prefix: &str,
    body: &[u8],
) -> Result<SendEmailRequest, serde_json::Error> {
    let submission: AmqpSubmission = serde_json::from_slice(body)?;
    Ok(SendEmailRequest {
        key: mailbox_key(routing_key, prefix).to_string(),
        recipients: submission.recipients,
        subject: submission.subject,
        text: submission.text,
        html: submission.html,
    })
}

/// A connected consumer, ready to run.
pub struct AmqpIntake {
    config: AmqpConfig,
    connection: Connection,
    channel: Channel,
    consumer: Consumer,
}

impl AmqpIntake {
    /// Connect, declare the queue and register the consumer.
    pub async fn connect(config: &AmqpConfig) -> Result<Self> {
        info!(url_length = config.url.len(), "rabbitmq_connecting");

        let connection = Connection::connect(&config.url, ConnectionProperties::default())
            .await
            .context("Failed to connect to RabbitMQ")?;

        let channel = connection
            .create_channel()
            .await
            .context("Failed to create channel")?;

        channel
            .basic_qos(config.prefetch, BasicQosOptions::default())
            .await
            .context("Failed to set QoS")?;

        channel
            .queue_declare(
                &config.queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .context("Failed to declare queue")?;

        let consumer = channel
            .basic_consume(
                &config.queue,
                CONSUMER_TAG,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .context("Failed to start consumer")?;

        info!(queue = %config.queue, prefetch = config.prefetch, "rabbitmq_consumer_started");

        Ok(Self {
            config: config.clone(),
            connection,
            channel,
            consumer,
        })
    }

    /// Consume until `cancel` fires or the broker closes the consumer.
    ///
    /// Deliveries are handled one at a time: the handler is a quick spool
    /// write, and once this returns nothing is left in flight. Requeued
    /// deliveries are held for [`REQUEUE_DELAY`] first, cut short by `cancel`.
    pub async fn run(mut self, router: MailRouter, cancel: CancellationToken) -> Result<()> {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("rabbitmq_intake_stopping");
                    break;
                }
                delivery = self.consumer.next() => {
                    match delivery {
                        Some(Ok(delivery)) => {
                            let disposition = self
                                .handle(&router, delivery.routing_key.as_str(), &delivery.data)
                                .await;
                            if let Some(delay) = disposition.delay() {
                                tokio::select! {
                                    _ = cancel.cancelled() => {}
                                    _ = tokio::time::sleep(delay) => {}
                                }
                            }
                            self.settle(delivery.delivery_tag, disposition).await;
                        }
                        Some(Err(e)) => {
                            error!(error = %e, "rabbitmq_delivery_error");
                        }
                        None => {
                            warn!("rabbitmq_consumer_closed");
                            break;
                        }
                    }
                }
            }
        }

        if let Err(e) = self.channel.close(200, "Normal shutdown").await {
            warn!(error = %e, "rabbitmq_channel_close_error");
        }
        if let Err(e) = self.connection.close(200, "Normal shutdown").await {
            warn!(error = %e, "rabbitmq_connection_close_error");
        }

        info!("rabbitmq_intake_stopped");
        Ok(())
    }

    async fn handle(&self, router: &MailRouter, routing_key: &str, body: &[u8]) -> Disposition {
        let request = match parse_submission(routing_key, &self.config.routing_prefix, body) {
            Ok(request) => request,
            Err(e) => {
                warn!(routing_key = %routing_key, error = %e, "rabbitmq_submission_invalid");
                return Disposition::Reject;
            }
        };

        router.send_email(&request).await.into()
    }

    async fn settle(&self, delivery_tag: u64, disposition: Disposition) {
        let result = match disposition {
            Disposition::Ack => {
                self.channel
                    .basic_ack(delivery_tag, BasicAckOptions::default())
                    .await
            }
            Disposition::Reject | Disposition::Requeue => {
                self.channel
                    .basic_nack(
                        delivery_tag,
                        BasicNackOptions {
                            requeue: disposition == Disposition::Requeue,
                            ..Default::default()
                        },
                    )
                    .await
            }
        };

        if let Err(e) = result {
            error!(delivery_tag = delivery_tag, disposition = ?disposition, error = %e, "rabbitmq_settle_failed");
        }
    }
}
