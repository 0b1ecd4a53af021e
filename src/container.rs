// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Listener Container
//!
//! Consumes a queue through HA channels and hands every delivery to a
//! [`MessageListener`]. Each unit of concurrency gets its own channel, so the
//! subscriptions are replayed by the channel itself when the connection is
//! recovered and the container has nothing to do on reconnection.
//!
//! Every delivery runs inside a consumer span whose parent is the trace context
//! carried in the message headers. Successful deliveries are acknowledged unless
//! the container runs in auto-ack mode; failed deliveries are rejected without
//! requeueing.

use crate::{
    broker::BrokerChannel,
    channel::HaChannel,
    config::HaConfigs,
    connection::HaConnection,
    consumer::{Consumer, Delivery},
    errors::{AmqpError, ShutdownSignal, REPLY_SUCCESS},
    message::{InboundMessage, MessageListener},
    otel,
};
use async_trait::async_trait;
use lapin::{
    options::{BasicCancelOptions, BasicConsumeOptions, BasicQosOptions},
    types::FieldTable,
};
use opentelemetry::{
    global::{self, BoxedTracer},
    trace::{Span, Status},
};
use std::{borrow::Cow, sync::Arc};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// A running subscription: the channel and the consumer tag it was given.
struct Worker {
    channel: HaChannel,
    consumer_tag: String,
}

pub struct SimpleHaMessageListenerContainer {
    connection: HaConnection,
    listener: Arc<dyn MessageListener>,
    queue: String,
    concurrency: u16,
    auto_ack: bool,
    prefetch: u16,
    workers: Mutex<Vec<Worker>>,
}

impl SimpleHaMessageListenerContainer {
    /// Creates a stopped container with a single consumer.
    pub fn new(
        connection: HaConnection,
        queue: &str,
        listener: Arc<dyn MessageListener>,
    ) -> Result<Self, AmqpError> {
        if queue.is_empty() {
            return Err(AmqpError::InvalidConfiguration(
                "queue name is required".to_owned(),
            ));
        }

        Ok(SimpleHaMessageListenerContainer {
            connection,
            listener,
            queue: queue.to_owned(),
            concurrency: 1,
            auto_ack: false,
            prefetch: 0,
            workers: Mutex::new(vec![]),
        })
    }

    /// Creates a container with `consumers` from the configs as its concurrency.
    pub fn from_configs(
        connection: HaConnection,
        queue: &str,
        listener: Arc<dyn MessageListener>,
        cfg: &HaConfigs,
    ) -> Result<Self, AmqpError> {
        Self::new(connection, queue, listener)?.with_concurrency(cfg.consumers)
    }

    /// Number of channels consuming the queue in parallel.
    pub fn with_concurrency(mut self, concurrency: u16) -> Result<Self, AmqpError> {
        if concurrency == 0 {
            return Err(AmqpError::InvalidConfiguration(
                "concurrency must be at least 1".to_owned(),
            ));
        }

        self.concurrency = concurrency;
        Ok(self)
    }

    pub fn with_auto_ack(mut self, auto_ack: bool) -> Self {
        self.auto_ack = auto_ack;
        self
    }

    /// Per channel prefetch, restored on every channel the connection recovers.
    /// Zero leaves the broker default.
    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn concurrency(&self) -> u16 {
        self.concurrency
    }

    /// Opens one channel per unit of concurrency and subscribes each to the queue.
    ///
    /// If any subscription fails the ones already made are torn down.
    pub async fn start(&self) -> Result<(), AmqpError> {
        let mut workers = self.workers.lock().await;
        if !workers.is_empty() {
            return Err(AmqpError::ConsumerError(format!(
                "container for `{}` is already running",
                self.queue
            )));
        }

        for _ in 0..self.concurrency {
            match self.subscribe().await {
                Ok(worker) => workers.push(worker),
                Err(err) => {
                    error!(
                        error = err.to_string(),
                        queue = self.queue,
                        "failure to start listener container"
                    );
                    Self::stop(workers.drain(..).collect()).await;
                    return Err(err);
                }
            }
        }

        info!(
            queue = self.queue,
            concurrency = self.concurrency,
            "listener container started"
        );
        Ok(())
    }

    /// Cancels every subscription and closes the channels.
    pub async fn shutdown(&self) {
        let workers: Vec<Worker> = self.workers.lock().await.drain(..).collect();
        if workers.is_empty() {
            return;
        }

        Self::stop(workers).await;
        info!(queue = self.queue, "listener container stopped");
    }

    pub async fn is_running(&self) -> bool {
        !self.workers.lock().await.is_empty()
    }

    async fn subscribe(&self) -> Result<Worker, AmqpError> {
        let channel = self.connection.create_channel().await?;

        if self.prefetch > 0 {
            if let Err(err) = channel
                .basic_qos(self.prefetch, BasicQosOptions { global: false })
                .await
            {
                let _ = channel.close(REPLY_SUCCESS, "OK").await;
                return Err(err);
            }
        }

        let consumer = Arc::new(ListenerConsumer {
            channel: channel.clone(),
            listener: self.listener.clone(),
            queue: self.queue.clone(),
            auto_ack: self.auto_ack,
            tracer: global::tracer("amqp consumer"),
        });

        let consumer_tag = match channel
            .basic_consume(
                &self.queue,
                "",
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: self.auto_ack,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
                consumer,
            )
            .await
        {
            Ok(tag) => tag,
            Err(err) => {
                let _ = channel.close(REPLY_SUCCESS, "OK").await;
                return Err(err);
            }
        };

        debug!(
            queue = self.queue,
            consumer_tag, "listener subscribed to queue"
        );
        Ok(Worker {
            channel,
            consumer_tag,
        })
    }

    async fn stop(workers: Vec<Worker>) {
        for worker in workers {
            if let Err(err) = worker
                .channel
                .basic_cancel(&worker.consumer_tag, BasicCancelOptions { nowait: false })
                .await
            {
                warn!(
                    error = err.to_string(),
                    consumer_tag = worker.consumer_tag,
                    "failure to cancel consumer"
                );
            }

            // closing the HA channel never fails
            let _ = worker.channel.close(REPLY_SUCCESS, "OK").await;
        }
    }
}

/// Bridges channel deliveries to the application listener.
struct ListenerConsumer {
    channel: HaChannel,
    listener: Arc<dyn MessageListener>,
    queue: String,
    auto_ack: bool,
    tracer: BoxedTracer,
}

impl ListenerConsumer {
    async fn settle(
        &self,
        generation: u64,
        delivery_tag: u64,
        success: bool,
    ) -> Result<(), AmqpError> {
        if self.auto_ack {
            return Ok(());
        }

        let settled = self
            .channel
            .settle(generation, delivery_tag, success)
            .await?;
        if !settled {
            warn!(
                delivery_tag,
                queue = self.queue,
                "message came from a replaced channel, it will be redelivered"
            );
        }
        Ok(())
    }
}

#[async_trait]
impl Consumer for ListenerConsumer {
    async fn handle_delivery(&self, consumer_tag: &str, delivery: Delivery) {
        let generation = delivery.channel_generation;
        let message = InboundMessage::from(delivery);
        let msg_type = message.msg_type();
        let span_name = if msg_type.is_empty() {
            self.queue.clone()
        } else {
            msg_type
        };

        let (ctx, mut span) = otel::new_span(&message.properties, &self.tracer, &span_name);

        debug!(
            consumer_tag,
            delivery_tag = message.delivery_tag,
            "message received"
        );

        let result = self.listener.on_message(&ctx, &message).await;
        match &result {
            Ok(()) => span.set_status(Status::Ok),
            Err(e) => {
                error!(
                    error = e.to_string(),
                    queue = self.queue,
                    "listener failed to process message"
                );
                span.record_error(e);
                span.set_status(Status::Error {
                    description: Cow::from("listener failed to process message"),
                });
            }
        }

        if let Err(e) = self.settle(generation, message.delivery_tag, result.is_ok()).await {
            error!(
                error = e.to_string(),
                delivery_tag = message.delivery_tag,
                "failure to settle message"
            );
            span.record_error(&e);
        }
    }

    async fn handle_shutdown_signal(&self, consumer_tag: &str, signal: &ShutdownSignal) {
        debug!(
            consumer_tag,
            signal = signal.to_string(),
            "listener consumer shut down"
        );
    }
}
