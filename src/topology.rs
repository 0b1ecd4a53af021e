// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! Declarative definitions of exchanges, queues and the bindings between them,
//! installed through any [`BrokerChannel`]. Queues support Dead Letter Queues
//! (DLQs) and delayed retry queues.
//!
//! Exclusive and auto-delete resources vanish with the connection that declared
//! them. [`TopologyListener`] re-installs a topology every time a connection is
//! (re)established, before the channel gates reopen, so application traffic never
//! hits a missing queue after a broker restart.

use crate::{
    broker::BrokerChannel,
    connection::HaConnection,
    errors::{AmqpError, REPLY_SUCCESS},
    listener::HaConnectionListener,
};
use async_trait::async_trait;
use lapin::{
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::{AMQPValue, FieldTable, LongInt, LongString, ShortString},
};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error};

/// Constant for the header field used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the header field used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Constant for the header field used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the header field used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Constant for the header field used to specify maximum queue size in bytes
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";
/// Constant for the header field used to specify the delayed exchange type
pub const AMQP_HEADERS_DELAYED_EXCHANGE_TYPE: &str = "x-delayed-type";

/// Exchange types, including the delayed message plugin type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
    XMessageDelayed,
}

impl From<&ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: &ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::XMessageDelayed => {
                lapin::ExchangeKind::Custom("x-delayed-message".to_owned())
            }
        }
    }
}

/// Definition of an exchange.
#[derive(Debug, Clone, Default)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) delete: bool,
    pub(crate) durable: bool,
    pub(crate) passive: bool,
    pub(crate) internal: bool,
    pub(crate) params: BTreeMap<ShortString, AMQPValue>,
}

impl ExchangeDefinition {
    /// Creates a non-durable direct exchange definition.
    pub fn new(name: &str) -> Self {
        ExchangeDefinition {
            name: name.to_owned(),
            ..ExchangeDefinition::default()
        }
    }

    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn fanout(self) -> Self {
        self.kind(ExchangeKind::Fanout)
    }

    pub fn topic(self) -> Self {
        self.kind(ExchangeKind::Topic)
    }

    /// Creates a delayed exchange routing like `delayed_type` once the delay expired.
    ///
    /// This requires the x-delayed-message plugin to be installed on the RabbitMQ server.
    pub fn delayed(mut self, delayed_type: &str) -> Self {
        self.kind = ExchangeKind::XMessageDelayed;
        self.params.insert(
            ShortString::from(AMQP_HEADERS_DELAYED_EXCHANGE_TYPE),
            AMQPValue::LongString(LongString::from(delayed_type)),
        );
        self
    }

    pub fn param(mut self, key: &str, value: AMQPValue) -> Self {
        self.params.insert(ShortString::from(key), value);
        self
    }

    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Only checks the exchange exists.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }
}

/// Definition of a queue with its optional DLQ and retry queue.
#[derive(Debug, Clone, Default)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) passive: bool,
    pub(crate) ttl: Option<i32>,
    pub(crate) max_length: Option<i32>,
    pub(crate) max_length_bytes: Option<i32>,
    pub(crate) dlq_name: Option<String>,
    pub(crate) retry_name: Option<String>,
    pub(crate) retry_ttl: Option<i32>,
}

impl QueueDefinition {
    pub fn new(name: &str) -> Self {
        QueueDefinition {
            name: name.to_owned(),
            ..QueueDefinition::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Exclusive queues are deleted when the declaring connection closes.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    /// Message TTL in milliseconds.
    pub fn ttl(mut self, ttl: i32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn max_length(mut self, max: i32) -> Self {
        self.max_length = Some(max);
        self
    }

    pub fn max_length_bytes(mut self, max_bytes: i32) -> Self {
        self.max_length_bytes = Some(max_bytes);
        self
    }

    /// Adds a `<name>-dlq` queue receiving rejected and expired messages.
    pub fn with_dlq(mut self) -> Self {
        self.dlq_name = Some(format!("{}-dlq", self.name));
        self
    }

    /// Adds a `<name>-retry` queue holding rejected messages for `ttl` milliseconds
    /// before routing them back to this queue.
    pub fn with_retry(mut self, ttl: i32) -> Self {
        self.retry_name = Some(format!("{}-retry", self.name));
        self.retry_ttl = Some(ttl);
        self
    }

    fn options(&self) -> QueueDeclareOptions {
        QueueDeclareOptions {
            passive: self.passive,
            durable: self.durable,
            exclusive: self.exclusive,
            auto_delete: self.delete,
            nowait: false,
        }
    }
}

/// Binding of a queue to an exchange.
#[derive(Debug, Clone, Default)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
}

impl QueueBinding {
    pub fn new(queue: &str) -> Self {
        QueueBinding {
            queue_name: queue.to_owned(),
            ..QueueBinding::default()
        }
    }

    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }
}

/// A set of exchanges, queues and bindings installed together.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    pub(crate) exchanges: Vec<ExchangeDefinition>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) bindings: Vec<QueueBinding>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    pub fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    pub fn queue_binding(mut self, binding: QueueBinding) -> Self {
        self.bindings.push(binding);
        self
    }

    /// Declares exchanges, then queues (retry and dead letter queues first), then
    /// bindings.
    pub async fn install(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        self.install_exchanges(channel).await?;
        self.install_queues(channel).await?;
        self.bind_queues(channel).await
    }

    async fn install_exchanges(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        for exch in &self.exchanges {
            debug!("creating exchange: {}", exch.name);

            channel
                .exchange_declare(
                    &exch.name,
                    (&exch.kind).into(),
                    ExchangeDeclareOptions {
                        passive: exch.passive,
                        durable: exch.durable,
                        auto_delete: exch.delete,
                        internal: exch.internal,
                        nowait: false,
                    },
                    FieldTable::from(exch.params.clone()),
                )
                .await
                .map_err(|err| {
                    error!(
                        error = err.to_string(),
                        name = exch.name,
                        "error to declare the exchange"
                    );
                    err
                })?;

            debug!("exchange: {} was created", exch.name);
        }

        Ok(())
    }

    async fn install_queues(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        for def in &self.queues {
            debug!("creating queue: {}", def.name);

            let mut queue_args = BTreeMap::new();

            if let Some(retry_name) = &def.retry_name {
                Self::declare_retry(channel, def, retry_name).await?;
                dead_letter_to(&mut queue_args, retry_name);
            }

            if let Some(dlq_name) = &def.dlq_name {
                Self::declare_plain(channel, def, dlq_name).await?;
                if def.retry_name.is_none() {
                    dead_letter_to(&mut queue_args, dlq_name);
                }
            }

            let limits = [
                (AMQP_HEADERS_MESSAGE_TTL, def.ttl),
                (AMQP_HEADERS_MAX_LENGTH, def.max_length),
                (AMQP_HEADERS_MAX_LENGTH_BYTES, def.max_length_bytes),
            ];
            for (header, value) in limits {
                if let Some(value) = value {
                    queue_args.insert(
                        ShortString::from(header),
                        AMQPValue::LongInt(LongInt::from(value)),
                    );
                }
            }

            channel
                .queue_declare(&def.name, def.options(), FieldTable::from(queue_args))
                .await
                .map_err(|err| {
                    error!(error = err.to_string(), name = def.name, "error to declare the queue");
                    err
                })?;

            debug!("queue: {} was created", def.name);
        }

        Ok(())
    }

    /// The retry queue dead-letters expired messages back to the main queue.
    async fn declare_retry(
        channel: &dyn BrokerChannel,
        def: &QueueDefinition,
        retry_name: &str,
    ) -> Result<(), AmqpError> {
        let mut args = BTreeMap::new();
        dead_letter_to(&mut args, &def.name);
        if let Some(ttl) = def.retry_ttl {
            args.insert(
                ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
                AMQPValue::LongInt(LongInt::from(ttl)),
            );
        }

        channel
            .queue_declare(retry_name, def.options(), FieldTable::from(args))
            .await
            .map(|_| ())
            .map_err(|err| {
                error!(error = err.to_string(), "failure to declare retry queue");
                err
            })
    }

    async fn declare_plain(
        channel: &dyn BrokerChannel,
        def: &QueueDefinition,
        name: &str,
    ) -> Result<(), AmqpError> {
        channel
            .queue_declare(name, def.options(), FieldTable::default())
            .await
            .map(|_| ())
            .map_err(|err| {
                error!(error = err.to_string(), "failure to declare dead letter queue");
                err
            })
    }

    async fn bind_queues(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        for binding in &self.bindings {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                binding.queue_name, binding.exchange_name, binding.routing_key
            );

            channel
                .queue_bind(
                    &binding.queue_name,
                    &binding.exchange_name,
                    &binding.routing_key,
                    QueueBindOptions { nowait: false },
                    FieldTable::default(),
                )
                .await
                .map_err(|err| {
                    error!(error = err.to_string(), "error to bind queue to exchange");
                    err
                })?;
        }

        Ok(())
    }
}

fn dead_letter_to(args: &mut BTreeMap<ShortString, AMQPValue>, queue: &str) {
    args.insert(
        ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
        AMQPValue::LongString(LongString::from("")),
    );
    args.insert(
        ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
        AMQPValue::LongString(LongString::from(queue)),
    );
}

/// Installs a topology on every connection and reconnection.
pub struct TopologyListener {
    topology: Arc<Topology>,
}

impl TopologyListener {
    pub fn new(topology: Topology) -> Self {
        TopologyListener {
            topology: Arc::new(topology),
        }
    }

    async fn install(&self, connection: &HaConnection) -> Result<(), AmqpError> {
        let channel = connection.create_channel().await?;
        let result = self.topology.install(&channel).await;
        channel.close(REPLY_SUCCESS, "topology installed").await?;
        result
    }
}

#[async_trait]
impl HaConnectionListener for TopologyListener {
    async fn on_connect(&self, connection: &HaConnection) {
        if let Err(err) = self.install(connection).await {
            error!(error = err.to_string(), "failure to install topology");
        }
    }

    async fn on_reconnection(&self, connection: &HaConnection) {
        if let Err(err) = self.install(connection).await {
            error!(error = err.to_string(), "failure to re-install topology");
        }
    }
}
