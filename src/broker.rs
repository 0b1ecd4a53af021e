// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Client Abstraction
//!
//! The HA layer never talks to the wire protocol directly. It drives the broker
//! through the three traits in this module: a client that dials, the connections it
//! returns, and the channels those connections open. The [`crate::amqp`] module
//! implements them on top of lapin; tests implement them with in-memory fakes and
//! mocks.
//!
//! The HA channel handle implements [`BrokerChannel`] too, so application code
//! written against the trait works unchanged on top of the HA layer.

use crate::{consumer::Consumer, errors::AmqpError, errors::ShutdownSignal};
use async_trait::async_trait;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, ExchangeKind,
};
use std::{fmt, str::FromStr, sync::Arc};

/// Default AMQP port
pub const DEFAULT_AMQP_PORT: u16 = 5672;

/// Numeric id of a channel within its connection.
pub type ChannelId = u16;

/// Callback invoked by a connection when it shuts down.
pub type ShutdownListener = Box<dyn Fn(ShutdownSignal) + Send + Sync>;

/// A broker host and port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Address {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Address {
    type Err = AmqpError;

    /// Parses `host` or `host:port`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(AmqpError::InvalidConfiguration("empty broker address".to_owned()));
        }

        match s.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| {
                    AmqpError::InvalidConfiguration(format!("invalid port in address `{}`", s))
                })?;
                Ok(Address::new(host, port))
            }
            None => Ok(Address::new(s, DEFAULT_AMQP_PORT)),
        }
    }
}

/// Formats an address list as `[host:port,host:port]` for logging.
pub fn addresses_to_string(addresses: &[Address]) -> String {
    let joined = addresses
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",");

    format!("[{}]", joined)
}

/// Result of a queue declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// Entry point of the broker client library.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Connects to the first reachable address of the list.
    async fn dial(&self, addresses: &[Address]) -> Result<Arc<dyn BrokerConnection>, AmqpError>;
}

/// An established broker connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Opens a channel, asking for a specific id when one is given.
    async fn create_channel(
        &self,
        id: Option<ChannelId>,
    ) -> Result<Arc<dyn BrokerChannel>, AmqpError>;

    /// Registers a callback fired when the connection shuts down.
    fn on_shutdown(&self, listener: ShutdownListener);

    fn is_open(&self) -> bool;

    /// Other broker nodes advertised by the server.
    fn known_hosts(&self) -> Vec<Address> {
        Vec::new()
    }

    async fn close(&self, reply_code: u16, reply_text: &str) -> Result<(), AmqpError>;
}

/// The operation surface of a channel.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    fn id(&self) -> ChannelId;

    fn is_open(&self) -> bool;

    async fn exchange_declare(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError>;

    async fn queue_declare(
        &self,
        queue: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<QueueInfo, AmqpError>;

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        options: QueueBindOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError>;

    async fn basic_qos(&self, prefetch_count: u16, options: BasicQosOptions)
        -> Result<(), AmqpError>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: BasicPublishOptions,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError>;

    /// Starts consuming `queue`, returning the consumer tag in use.
    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: BasicConsumeOptions,
        arguments: FieldTable,
        consumer: Arc<dyn Consumer>,
    ) -> Result<String, AmqpError>;

    async fn basic_cancel(
        &self,
        consumer_tag: &str,
        options: BasicCancelOptions,
    ) -> Result<(), AmqpError>;

    async fn basic_ack(&self, delivery_tag: u64, options: BasicAckOptions)
        -> Result<(), AmqpError>;

    async fn basic_nack(
        &self,
        delivery_tag: u64,
        options: BasicNackOptions,
    ) -> Result<(), AmqpError>;

    async fn close(&self, reply_code: u16, reply_text: &str) -> Result<(), AmqpError>;
}
