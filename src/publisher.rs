// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! This module provides functionality for publishing messages to RabbitMQ exchanges
//! through any [`BrokerChannel`], normally an HA channel so publishes survive a
//! reconnection. OpenTelemetry trace context is propagated in the message headers.

use crate::{broker::BrokerChannel, errors::AmqpError, message::OutboundMessage, otel};
use lapin::{
    options::BasicPublishOptions,
    types::{FieldTable, ShortString},
};
use opentelemetry::Context;
use std::sync::Arc;
use tracing::{debug, error};
use uuid::Uuid;

/// Publishes [`OutboundMessage`]s.
pub struct HaPublisher {
    channel: Arc<dyn BrokerChannel>,
}

impl HaPublisher {
    /// Creates a new publisher.
    ///
    /// # Parameters
    /// * `channel` - The channel to publish through
    ///
    /// # Returns
    /// An Arc-wrapped HaPublisher instance for thread-safe sharing
    pub fn new(channel: Arc<dyn BrokerChannel>) -> Arc<HaPublisher> {
        Arc::new(HaPublisher { channel })
    }

    /// Publishes `message`, stamping a UUID v4 message id when it has none and
    /// injecting `ctx` into the headers.
    pub async fn publish(&self, ctx: &Context, message: &OutboundMessage) -> Result<(), AmqpError> {
        let mut headers = message
            .properties
            .headers()
            .as_ref()
            .map(|headers| headers.inner().clone())
            .unwrap_or_default();
        otel::inject(ctx, &mut headers);

        let mut properties = message
            .properties
            .clone()
            .with_headers(FieldTable::from(headers));
        if properties.message_id().is_none() {
            properties =
                properties.with_message_id(ShortString::from(Uuid::new_v4().to_string()));
        }

        self.channel
            .basic_publish(
                &message.exchange,
                &message.routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                &message.body,
                properties,
            )
            .await
            .map_err(|err| {
                error!(
                    error = err.to_string(),
                    exchange = message.exchange,
                    "error publishing message"
                );
                err
            })?;

        debug!(
            exchange = message.exchange,
            routing_key = message.routing_key,
            "message published"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{broker::MockBrokerChannel, errors::ShutdownSignal, message::JSON_CONTENT_TYPE};
    use lapin::BasicProperties;

    #[tokio::test]
    async fn stamps_a_message_id() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_basic_publish()
            .withf(|exchange, key, _, payload, props| {
                exchange == "orders"
                    && key == "created"
                    && payload == br#"{"id":1}"#
                    && props.message_id().as_ref().is_some_and(|id| {
                        Uuid::parse_str(id.as_str()).is_ok()
                    })
                    && props.content_type() == &Some(ShortString::from(JSON_CONTENT_TYPE))
            })
            .times(1)
            .returning(|_, _, _, _, _| Ok(()));
        let publisher = HaPublisher::new(Arc::new(channel));

        let message = OutboundMessage::json("orders", "created", &serde_json::json!({"id": 1}))
            .unwrap();

        publisher
            .publish(&Context::current(), &message)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn keeps_an_existing_message_id() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_basic_publish()
            .withf(|_, _, _, _, props| {
                props.message_id() == &Some(ShortString::from("order-1"))
            })
            .times(1)
            .returning(|_, _, _, _, _| Ok(()));
        let publisher = HaPublisher::new(Arc::new(channel));

        let message = OutboundMessage::new(
            "orders",
            "",
            BasicProperties::default().with_message_id(ShortString::from("order-1")),
            vec![],
        )
        .unwrap();

        publisher
            .publish(&Context::current(), &message)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn propagates_failures() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_basic_publish()
            .returning(|_, _, _, _, _| Err(ShutdownSignal::by_application("closed").into()));
        let publisher = HaPublisher::new(Arc::new(channel));
        let message =
            OutboundMessage::new("orders", "", BasicProperties::default(), vec![]).unwrap();

        let err = publisher
            .publish(&Context::current(), &message)
            .await
            .unwrap_err();

        assert!(!err.is_recoverable());
    }
}
