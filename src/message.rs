// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messages
//!
//! The inbound and outbound message types used by the publisher and the listener
//! container, and the listener interface applications implement.

use crate::{consumer::Delivery, errors::AmqpError};
use async_trait::async_trait;
use lapin::{
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties,
};
use opentelemetry::Context;
use serde::{de::DeserializeOwned, Serialize};
use tracing::error;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// A message received from a queue.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub exchange: String,
    pub routing_key: String,
    pub properties: BasicProperties,
    pub body: Vec<u8>,
    pub delivery_tag: u64,
    pub redelivered: bool,
}

impl From<Delivery> for InboundMessage {
    fn from(delivery: Delivery) -> Self {
        InboundMessage {
            exchange: delivery.exchange,
            routing_key: delivery.routing_key,
            properties: delivery.properties,
            body: delivery.body,
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
        }
    }
}

impl InboundMessage {
    /// The `type` property, empty when unset.
    pub fn msg_type(&self) -> String {
        self.properties
            .kind()
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default()
    }

    /// Deserializes a JSON body.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, AmqpError> {
        serde_json::from_slice(&self.body).map_err(|err| {
            error!(error = err.to_string(), "failure to parse payload");
            AmqpError::ParsePayloadError
        })
    }
}

/// A message to publish.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub(crate) exchange: String,
    pub(crate) routing_key: String,
    pub(crate) properties: BasicProperties,
    pub(crate) body: Vec<u8>,
}

impl OutboundMessage {
    /// Creates a message. The exchange name is required.
    pub fn new(
        exchange: &str,
        routing_key: &str,
        properties: BasicProperties,
        body: Vec<u8>,
    ) -> Result<Self, AmqpError> {
        if exchange.is_empty() {
            return Err(AmqpError::PublishingError(
                "exchange name is required".to_owned(),
            ));
        }

        Ok(OutboundMessage {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            properties,
            body,
        })
    }

    /// Creates a message with a JSON body and the `application/json` content type.
    pub fn json<T: Serialize>(
        exchange: &str,
        routing_key: &str,
        payload: &T,
    ) -> Result<Self, AmqpError> {
        let body = serde_json::to_vec(payload).map_err(|err| {
            error!(error = err.to_string(), "failure to serialize payload");
            AmqpError::ParsePayloadError
        })?;

        let properties =
            BasicProperties::default().with_content_type(ShortString::from(JSON_CONTENT_TYPE));
        OutboundMessage::new(exchange, routing_key, properties, body)
    }

    /// Sets the `type` property.
    pub fn with_type(mut self, msg_type: &str) -> Self {
        self.properties = self.properties.with_type(ShortString::from(msg_type));
        self
    }

    pub fn with_header(mut self, key: &str, value: AMQPValue) -> Self {
        let mut headers = self
            .properties
            .headers()
            .as_ref()
            .map(|headers| headers.inner().clone())
            .unwrap_or_default();
        headers.insert(ShortString::from(key), value);

        self.properties = self.properties.with_headers(FieldTable::from(headers));
        self
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn properties(&self) -> &BasicProperties {
        &self.properties
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }
}

/// Handles messages delivered to a listener container.
///
/// Returning an error rejects the message without requeueing it, so it is
/// dead-lettered when the queue has a dead letter exchange.
#[async_trait]
pub trait MessageListener: Send + Sync {
    async fn on_message(&self, ctx: &Context, message: &InboundMessage) -> Result<(), AmqpError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::types::LongString;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct OrderCreated {
        id: u32,
    }

    #[test]
    fn json_messages_carry_the_content_type() {
        let message = OutboundMessage::json("orders", "created", &OrderCreated { id: 7 })
            .unwrap()
            .with_type("OrderCreated");

        assert_eq!(message.body(), br#"{"id":7}"#);
        assert_eq!(
            message.properties().content_type(),
            &Some(ShortString::from(JSON_CONTENT_TYPE))
        );
        assert_eq!(
            message.properties().kind(),
            &Some(ShortString::from("OrderCreated"))
        );
    }

    #[test]
    fn exchange_is_required() {
        let result = OutboundMessage::new("", "created", BasicProperties::default(), vec![]);

        assert!(matches!(result, Err(AmqpError::PublishingError(_))));
    }

    #[test]
    fn headers_accumulate() {
        let message = OutboundMessage::new("orders", "", BasicProperties::default(), vec![])
            .unwrap()
            .with_header("a", AMQPValue::LongString(LongString::from("1")))
            .with_header("b", AMQPValue::LongString(LongString::from("2")));

        let headers = message.properties().headers().clone().unwrap();
        assert_eq!(headers.inner().len(), 2);
    }

    #[test]
    fn inbound_messages_parse_json_bodies() {
        let message = InboundMessage::from(Delivery {
            delivery_tag: 3,
            exchange: "orders".to_owned(),
            routing_key: "created".to_owned(),
            redelivered: true,
            properties: BasicProperties::default().with_type(ShortString::from("OrderCreated")),
            body: br#"{"id":7}"#.to_vec(),
            channel_generation: 1,
        });

        assert_eq!(message.json::<OrderCreated>().unwrap(), OrderCreated { id: 7 });
        assert_eq!(message.msg_type(), "OrderCreated");
        assert_eq!(message.delivery_tag, 3);
        assert!(message.redelivered);

        let broken = InboundMessage {
            body: b"not json".to_vec(),
            ..message
        };
        assert_eq!(
            broken.json::<OrderCreated>().unwrap_err(),
            AmqpError::ParsePayloadError
        );
    }
}
