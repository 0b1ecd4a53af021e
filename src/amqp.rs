// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # lapin Broker Client
//!
//! Implements the broker traits on top of lapin. Connection URIs are built from
//! [`RabbitMQConfigs`] credentials for every address tried, and the connection is
//! named after the application so it is recognisable in the management UI.
//!
//! lapin reports connection failures through `on_error`; those errors are turned
//! into [`ShutdownSignal`]s and fanned out to the registered shutdown listeners.
//! Consumer streams are pumped by a task per subscription that forwards
//! deliveries and, when the stream fails, the shutdown signal to the consumer.

use crate::{
    broker::{
        Address, BrokerChannel, BrokerClient, BrokerConnection, ChannelId, QueueInfo,
        ShutdownListener,
    },
    config::HaConfigs,
    consumer::Consumer,
    errors::{from_lapin, AmqpError, ShutdownSignal, CONNECTION_FORCED},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::{FieldTable, LongString},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, PoisonError,
};
use tracing::{debug, error, warn};

/// Dials RabbitMQ with lapin.
pub struct LapinClient {
    app_name: String,
    user: String,
    password: String,
    vhost: String,
}

impl LapinClient {
    pub fn new(cfg: &HaConfigs) -> Self {
        LapinClient {
            app_name: cfg.app_name.clone(),
            user: cfg.rabbitmq.user.clone(),
            password: cfg.rabbitmq.password.clone(),
            vhost: cfg.rabbitmq.vhost.clone(),
        }
    }

    fn uri(&self, address: &Address) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.user, self.password, address.host, address.port, self.vhost
        )
    }
}

#[async_trait]
impl BrokerClient for LapinClient {
    async fn dial(&self, addresses: &[Address]) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        let mut last_error = AmqpError::ConnectionError("no address to connect to".to_owned());

        for address in addresses {
            debug!(address = address.to_string(), "creating amqp connection...");
            let options = ConnectionProperties::default()
                .with_connection_name(LongString::from(self.app_name.clone()));

            match Connection::connect(&self.uri(address), options).await {
                Ok(conn) => {
                    debug!(address = address.to_string(), "amqp connected");
                    return Ok(Arc::new(LapinConnection::new(conn)));
                }
                Err(err) => {
                    warn!(
                        address = address.to_string(),
                        error = err.to_string(),
                        "failure to connect"
                    );
                    last_error = from_lapin(err, false, AmqpError::ConnectionError);
                }
            }
        }

        Err(last_error)
    }
}

type Listeners = Arc<Mutex<Vec<ShutdownListener>>>;

fn fire(listeners: &Listeners, signal: ShutdownSignal) {
    let listeners = listeners.lock().unwrap_or_else(PoisonError::into_inner);
    for listener in listeners.iter() {
        listener(signal.clone());
    }
}

/// A lapin connection.
pub struct LapinConnection {
    conn: Connection,
    closed_by_app: Arc<AtomicBool>,
    listeners: Listeners,
}

impl LapinConnection {
    fn new(conn: Connection) -> Self {
        let closed_by_app = Arc::new(AtomicBool::new(false));
        let listeners: Listeners = Arc::default();

        let closed = closed_by_app.clone();
        let notified = listeners.clone();
        conn.on_error(move |err| {
            let closed = closed.load(Ordering::SeqCst);
            let signal = match from_lapin(err, closed, AmqpError::ConnectionError) {
                AmqpError::Shutdown(signal) => signal,
                other => ShutdownSignal::by_broker(CONNECTION_FORCED, other.to_string()),
            };

            error!(signal = signal.to_string(), "amqp connection lost");
            fire(&notified, signal);
        });

        LapinConnection {
            conn,
            closed_by_app,
            listeners,
        }
    }
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn create_channel(
        &self,
        id: Option<ChannelId>,
    ) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        debug!(requested = id, "creating amqp channel...");

        let closed = self.closed_by_app.load(Ordering::SeqCst);
        let channel = self.conn.create_channel().await.map_err(|err| {
            error!(error = err.to_string(), "error to create the channel");
            from_lapin(err, closed, AmqpError::ChannelError)
        })?;

        debug!(channel = channel.id(), "channel created");
        Ok(Arc::new(LapinChannel {
            channel,
            closed_by_app: Arc::new(AtomicBool::new(false)),
            connection_closed: self.closed_by_app.clone(),
        }))
    }

    fn on_shutdown(&self, listener: ShutdownListener) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    fn is_open(&self) -> bool {
        self.conn.status().connected()
    }

    async fn close(&self, reply_code: u16, reply_text: &str) -> Result<(), AmqpError> {
        self.closed_by_app.store(true, Ordering::SeqCst);

        let result = self
            .conn
            .close(reply_code, reply_text)
            .await
            .map_err(|err| from_lapin(err, true, AmqpError::ConnectionError));

        fire(&self.listeners, ShutdownSignal::by_application(reply_text));
        result
    }
}

/// A lapin channel.
pub struct LapinChannel {
    channel: Channel,
    closed_by_app: Arc<AtomicBool>,
    connection_closed: Arc<AtomicBool>,
}

impl LapinChannel {
    fn closed_by_app(&self) -> bool {
        self.closed_by_app.load(Ordering::SeqCst) || self.connection_closed.load(Ordering::SeqCst)
    }

    fn error<F>(&self, err: lapin::Error, otherwise: F) -> AmqpError
    where
        F: FnOnce(String) -> AmqpError,
    {
        error!(channel = self.channel.id(), error = err.to_string(), "amqp operation failed");
        from_lapin(err, self.closed_by_app(), otherwise)
    }
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    fn id(&self) -> ChannelId {
        self.channel.id()
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn exchange_declare(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        self.channel
            .exchange_declare(exchange, kind, options, arguments)
            .await
            .map_err(|err| self.error(err, |_| AmqpError::DeclareExchangeError(exchange.to_owned())))
    }

    async fn queue_declare(
        &self,
        queue: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<QueueInfo, AmqpError> {
        let declared = self
            .channel
            .queue_declare(queue, options, arguments)
            .await
            .map_err(|err| self.error(err, |_| AmqpError::DeclareQueueError(queue.to_owned())))?;

        Ok(QueueInfo {
            name: declared.name().to_string(),
            message_count: declared.message_count(),
            consumer_count: declared.consumer_count(),
        })
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        options: QueueBindOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        self.channel
            .queue_bind(queue, exchange, routing_key, options, arguments)
            .await
            .map_err(|err| {
                self.error(err, |_| {
                    AmqpError::BindingExchangeToQueueError(exchange.to_owned(), queue.to_owned())
                })
            })
    }

    async fn basic_qos(
        &self,
        prefetch_count: u16,
        options: BasicQosOptions,
    ) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(prefetch_count, options)
            .await
            .map_err(|err| self.error(err, AmqpError::QoSDeclarationError))
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: BasicPublishOptions,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        self.channel
            .basic_publish(exchange, routing_key, options, payload, properties)
            .await
            .map(|_| ())
            .map_err(|err| self.error(err, AmqpError::PublishingError))
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: BasicConsumeOptions,
        arguments: FieldTable,
        consumer: Arc<dyn Consumer>,
    ) -> Result<String, AmqpError> {
        let mut stream = self
            .channel
            .basic_consume(queue, consumer_tag, options, arguments)
            .await
            .map_err(|err| self.error(err, |_| AmqpError::BindingConsumerError(queue.to_owned())))?;

        let tag = stream.tag().to_string();
        consumer.handle_consume_ok(&tag).await;

        let channel = self.channel.clone();
        let closed_by_app = self.closed_by_app.clone();
        let connection_closed = self.connection_closed.clone();
        let consumer_tag = tag.clone();

        tokio::spawn(async move {
            let closed = || {
                closed_by_app.load(Ordering::SeqCst) || connection_closed.load(Ordering::SeqCst)
            };

            while let Some(result) = stream.next().await {
                match result {
                    Ok(delivery) => {
                        consumer
                            .handle_delivery(&consumer_tag, delivery.into())
                            .await;
                    }
                    Err(err) => {
                        error!(consumer_tag, error = err.to_string(), "consumer stream failed");
                        let signal = match from_lapin(err, closed(), AmqpError::ConsumerError) {
                            AmqpError::Shutdown(signal) => signal,
                            other => ShutdownSignal::by_broker(CONNECTION_FORCED, other.to_string()),
                        };
                        consumer.handle_shutdown_signal(&consumer_tag, &signal).await;
                        return;
                    }
                }
            }

            if closed() {
                let signal = ShutdownSignal::by_application("channel closed");
                consumer.handle_shutdown_signal(&consumer_tag, &signal).await;
            } else if !channel.status().connected() {
                let signal = ShutdownSignal::by_broker(CONNECTION_FORCED, "channel closed");
                consumer.handle_shutdown_signal(&consumer_tag, &signal).await;
            } else {
                debug!(consumer_tag, "consumer cancelled");
            }
        });

        Ok(tag)
    }

    async fn basic_cancel(
        &self,
        consumer_tag: &str,
        options: BasicCancelOptions,
    ) -> Result<(), AmqpError> {
        self.channel
            .basic_cancel(consumer_tag, options)
            .await
            .map_err(|err| {
                self.error(err, |_| AmqpError::CancelConsumerError(consumer_tag.to_owned()))
            })
    }

    async fn basic_ack(&self, delivery_tag: u64, options: BasicAckOptions) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, options)
            .await
            .map_err(|err| self.error(err, |_| AmqpError::AckMessageError))
    }

    async fn basic_nack(
        &self,
        delivery_tag: u64,
        options: BasicNackOptions,
    ) -> Result<(), AmqpError> {
        self.channel
            .basic_nack(delivery_tag, options)
            .await
            .map_err(|err| self.error(err, |_| AmqpError::NackMessageError))
    }

    async fn close(&self, reply_code: u16, reply_text: &str) -> Result<(), AmqpError> {
        self.closed_by_app.store(true, Ordering::SeqCst);

        self.channel
            .close(reply_code, reply_text)
            .await
            .map_err(|err| from_lapin(err, true, AmqpError::ChannelError))
    }
}
