// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # HA Channel
//!
//! `HaChannel` is the handle applications use instead of a raw broker channel. It
//! implements [`BrokerChannel`] by forwarding every operation to the channel it
//! currently wraps (its *target*) and, when an operation fails because the
//! connection went away, asks the connection's [`RetryStrategy`] whether to try
//! again. A blocking strategy parks the caller on the channel's gate until the
//! connection manager swaps in a live target and reopens the gate.
//!
//! Dispatch and target replacement share one per-channel lock, so an operation
//! never observes a half-replaced target.
//!
//! A channel can also die on its own while the connection stays up, for instance
//! when the broker closes it after a failed declaration. Dispatch then opens a
//! fresh broker channel on the live connection and carries on, since no
//! reconnection would ever replace that target.

use crate::{
    broker::{BrokerChannel, ChannelId, QueueInfo},
    connection::{ConnectionInner, HaConnection},
    consumer::{Consumer, HaConsumer, Subscription},
    errors::AmqpError,
    gate::Gate,
    listener::HaConnectionListener,
    retry::RetryStrategy,
    scheduler::TaskScheduler,
};
use async_trait::async_trait;
use futures_util::future::{BoxFuture, FutureExt};
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, ExchangeKind,
};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU16, Ordering},
        Arc, Mutex, PoisonError, Weak,
    },
};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

/// The broker channel an `HaChannel` currently forwards to.
#[derive(Clone)]
pub(crate) struct Target {
    pub(crate) channel: Arc<dyn BrokerChannel>,
    // bumped on every replacement, starts at 1
    pub(crate) generation: u64,
}

pub(crate) struct ChannelInner {
    key: u64,
    channel_id: AtomicU16,
    target: AsyncMutex<Target>,
    gate: Gate,
    consumers: Mutex<HashMap<usize, Arc<HaConsumer>>>,
    // last prefetch set through the handle, replayed on every new target
    qos: Mutex<Option<(u16, BasicQosOptions)>>,
    connection: Weak<ConnectionInner>,
    retry_strategy: Arc<dyn RetryStrategy>,
    scheduler: TaskScheduler,
    closed: AtomicBool,
    this: Weak<ChannelInner>,
}

impl ChannelInner {
    pub(crate) fn new(
        key: u64,
        target: Arc<dyn BrokerChannel>,
        retry_strategy: Arc<dyn RetryStrategy>,
        scheduler: TaskScheduler,
        connection: Weak<ConnectionInner>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| ChannelInner {
            key,
            channel_id: AtomicU16::new(target.id()),
            target: AsyncMutex::new(Target {
                channel: target,
                generation: 1,
            }),
            gate: Gate::default(),
            consumers: Mutex::new(HashMap::new()),
            qos: Mutex::new(None),
            connection,
            retry_strategy,
            scheduler,
            closed: AtomicBool::new(false),
            this: this.clone(),
        })
    }

    pub(crate) fn key(&self) -> u64 {
        self.key
    }

    pub(crate) fn channel_id(&self) -> ChannelId {
        self.channel_id.load(Ordering::SeqCst)
    }

    pub(crate) fn gate(&self) -> &Gate {
        &self.gate
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Marks the channel closed without talking to the broker, waking every
    /// caller parked on the gate so it fails with `AlreadyClosed`.
    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.consumers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.gate.open();
    }

    fn owner(&self) -> Option<HaConnection> {
        HaConnection::upgrade(&self.connection)
    }

    /// Reopens the gate when the owning connection is up and no reconnection is
    /// running. Detached channels are left alone.
    pub(crate) fn reopen_if_live(&self) {
        if self.is_closed() {
            return;
        }

        if let Some(connection) = self.owner() {
            if connection.is_open() && !connection.is_reconnecting() {
                self.gate.open();
            }
        }
    }

    fn closed_error(&self) -> AmqpError {
        AmqpError::AlreadyClosed(format!("channel {}", self.channel_id()))
    }

    pub(crate) async fn generation(&self) -> u64 {
        self.target.lock().await.generation
    }

    /// Swaps the target under the dispatch lock. The gate is left as is.
    pub(crate) async fn replace_target(&self, channel: Arc<dyn BrokerChannel>) {
        let mut target = self.target.lock().await;
        self.swap(&mut target, channel).await;
    }

    async fn swap(&self, target: &mut Target, channel: Arc<dyn BrokerChannel>) {
        let old = target.channel.id();
        target.channel = channel;
        target.generation += 1;
        self.channel_id.store(target.channel.id(), Ordering::SeqCst);

        let qos = *self.qos.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((prefetch_count, options)) = qos {
            if let Err(err) = target.channel.basic_qos(prefetch_count, options).await {
                warn!(
                    channel = target.channel.id(),
                    prefetch_count,
                    error = err.to_string(),
                    "failure to restore prefetch on the new channel"
                );
            }
        }

        debug!(
            old_channel = old,
            new_channel = target.channel.id(),
            generation = target.generation,
            "replaced channel target"
        );
    }

    pub(crate) fn remember_qos(&self, prefetch_count: u16, options: BasicQosOptions) {
        *self.qos.lock().unwrap_or_else(PoisonError::into_inner) = Some((prefetch_count, options));
    }

    /// Replaces a target of generation `failed` that died while the connection
    /// stayed up. Returns whether a live target is now in place.
    async fn recover(&self, failed: u64) -> bool {
        let Some(connection) = self.owner() else {
            return false;
        };
        if !connection.is_open() || connection.is_reconnecting() {
            return false;
        }

        {
            let mut target = self.target.lock().await;
            if target.generation != failed {
                return true;
            }

            let id = self.channel_id();
            let replacement = match connection.open_broker_channel(Some(id)).await {
                Ok(replacement) => replacement,
                Err(err) => {
                    debug!(
                        channel = id,
                        error = err.to_string(),
                        "failure to reopen channel on the live connection"
                    );
                    return false;
                }
            };

            self.swap(&mut target, replacement).await;
            warn!(
                channel = id,
                generation = target.generation,
                "channel died on a live connection, reopened it"
            );
        }

        self.reopen_if_live();
        true
    }

    /// Acks or rejects a delivery on the target of `generation`, the only one
    /// that knows its tag. Returns `false` without touching the broker when that
    /// target was replaced meanwhile.
    pub(crate) async fn settle(
        &self,
        generation: u64,
        delivery_tag: u64,
        ack: bool,
    ) -> Result<bool, AmqpError> {
        if self.is_closed() {
            return Err(self.closed_error());
        }

        let target = self.target.lock().await;
        if target.generation != generation {
            return Ok(false);
        }

        if ack {
            target
                .channel
                .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
                .await?;
        } else {
            target
                .channel
                .basic_nack(
                    delivery_tag,
                    BasicNackOptions {
                        multiple: false,
                        requeue: false,
                    },
                )
                .await?;
        }
        Ok(true)
    }

    /// Runs `call` against the current target until it succeeds, fails with an
    /// unrecoverable error, or the retry strategy gives up.
    pub(crate) async fn dispatch<'a, T, F>(
        &self,
        operation: &'static str,
        call: F,
    ) -> Result<T, AmqpError>
    where
        T: Send,
        F: Fn(Target) -> BoxFuture<'a, Result<T, AmqpError>> + Send,
    {
        let mut attempt: u32 = 1;

        loop {
            if self.is_closed() {
                return Err(self.closed_error());
            }

            let (result, generation) = {
                let target = self.target.lock().await;
                (call(target.clone()).await, target.generation)
            };

            let err = match result {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !err.is_recoverable() {
                warn!(
                    operation,
                    attempt,
                    channel = self.channel_id(),
                    error = err.to_string(),
                    "operation failed with an unrecoverable error"
                );
                return Err(err);
            }

            debug!(
                operation,
                attempt,
                channel = self.channel_id(),
                error = err.to_string(),
                "operation failed, consulting the retry strategy"
            );

            self.recover(generation).await;

            if !self.retry_strategy.should_retry(&err, attempt, &self.gate).await {
                warn!(
                    operation,
                    attempt,
                    channel = self.channel_id(),
                    strategy = self.retry_strategy.name(),
                    error = err.to_string(),
                    "retry strategy gave up on the operation"
                );
                return Err(err);
            }

            attempt += 1;
        }
    }

    /// Returns the wrapper of `consumer`, creating it on first use.
    fn wrap_consumer(
        &self,
        consumer: Arc<dyn Consumer>,
        subscription: Subscription,
    ) -> Arc<HaConsumer> {
        let key = Arc::as_ptr(&consumer) as *const () as usize;
        let mut consumers = self
            .consumers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = consumers.get(&key) {
            existing.set_subscription(subscription);
            return existing.clone();
        }

        let wrapper = HaConsumer::new(
            consumer,
            self.this.clone(),
            self.scheduler.clone(),
            subscription,
        );
        consumers.insert(key, wrapper.clone());
        wrapper
    }

    /// Subscribes `consumer` on the current target, returning the consumer tag and
    /// the generation of the target it was registered on.
    pub(crate) async fn consume_with(
        &self,
        consumer: &Arc<HaConsumer>,
    ) -> Result<(String, u64), AmqpError> {
        let subscription = consumer.subscription();
        let subscription = &subscription;

        let (tag, generation) = self
            .dispatch("basic_consume", move |target| {
                async move {
                    let tag = target
                        .channel
                        .basic_consume(
                            &subscription.queue,
                            &subscription.consumer_tag,
                            subscription.options,
                            subscription.arguments.clone(),
                            consumer.registration(target.generation),
                        )
                        .await?;
                    Ok((tag, target.generation))
                }
                .boxed()
            })
            .await?;

        consumer.registered(&tag, generation);
        Ok((tag, generation))
    }

    fn consumer_count(&self) -> usize {
        self.consumers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// A channel handle that survives connection loss.
///
/// Cloning yields another handle to the same channel.
#[derive(Clone)]
pub struct HaChannel {
    inner: Arc<ChannelInner>,
}

impl HaChannel {
    pub(crate) fn from_inner(inner: Arc<ChannelInner>) -> Self {
        HaChannel { inner }
    }

    /// The id of the current target. Kept stable across reconnections.
    pub fn channel_id(&self) -> ChannelId {
        self.inner.channel_id()
    }

    /// The gate callers park on while the channel is being recovered.
    pub fn gate(&self) -> &Gate {
        &self.inner.gate
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// The owning connection, unless it was dropped.
    pub fn connection(&self) -> Option<HaConnection> {
        self.inner.connection.upgrade().map(HaConnection::from_inner)
    }

    /// Registers a lifecycle listener on the owning connection.
    pub fn add_reconnect_listener(
        &self,
        listener: Arc<dyn HaConnectionListener>,
    ) -> Result<(), AmqpError> {
        match self.connection() {
            Some(connection) => {
                connection.add_listener(listener);
                Ok(())
            }
            None => Err(AmqpError::AlreadyClosed("connection was dropped".to_owned())),
        }
    }

    /// Number of distinct application consumers subscribed through this channel.
    pub fn consumer_count(&self) -> usize {
        self.inner.consumer_count()
    }

    /// Generation of the current target, bumped on every replacement.
    pub async fn generation(&self) -> u64 {
        self.inner.generation().await
    }

    /// Acks (`ack`) or rejects without requeue a delivery received from the target
    /// of `generation`. Returns `false` when that target is gone.
    pub(crate) async fn settle(
        &self,
        generation: u64,
        delivery_tag: u64,
        ack: bool,
    ) -> Result<bool, AmqpError> {
        self.inner.settle(generation, delivery_tag, ack).await
    }

    /// Points the channel at a new broker channel without reopening the gate.
    pub async fn replace_target(&self, channel: Arc<dyn BrokerChannel>) {
        self.inner.replace_target(channel).await
    }
}

#[async_trait]
impl BrokerChannel for HaChannel {
    fn id(&self) -> ChannelId {
        self.channel_id()
    }

    fn is_open(&self) -> bool {
        !self.is_closed() && self.inner.gate.is_open()
    }

    async fn exchange_declare(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        self.inner
            .dispatch("exchange_declare", move |target| {
                let kind = kind.clone();
                let arguments = arguments.clone();
                async move {
                    target
                        .channel
                        .exchange_declare(exchange, kind, options, arguments)
                        .await
                }
                .boxed()
            })
            .await
    }

    async fn queue_declare(
        &self,
        queue: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<QueueInfo, AmqpError> {
        self.inner
            .dispatch("queue_declare", move |target| {
                let arguments = arguments.clone();
                async move { target.channel.queue_declare(queue, options, arguments).await }
                    .boxed()
            })
            .await
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        options: QueueBindOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        self.inner
            .dispatch("queue_bind", move |target| {
                let arguments = arguments.clone();
                async move {
                    target
                        .channel
                        .queue_bind(queue, exchange, routing_key, options, arguments)
                        .await
                }
                .boxed()
            })
            .await
    }

    async fn basic_qos(
        &self,
        prefetch_count: u16,
        options: BasicQosOptions,
    ) -> Result<(), AmqpError> {
        self.inner
            .dispatch("basic_qos", move |target| {
                async move { target.channel.basic_qos(prefetch_count, options).await }.boxed()
            })
            .await?;

        self.inner.remember_qos(prefetch_count, options);
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: BasicPublishOptions,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        self.inner
            .dispatch("basic_publish", move |target| {
                let properties = properties.clone();
                async move {
                    target
                        .channel
                        .basic_publish(exchange, routing_key, options, payload, properties)
                        .await
                }
                .boxed()
            })
            .await
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: BasicConsumeOptions,
        arguments: FieldTable,
        consumer: Arc<dyn Consumer>,
    ) -> Result<String, AmqpError> {
        if self.is_closed() {
            return Err(self.inner.closed_error());
        }

        let subscription = Subscription {
            queue: queue.to_owned(),
            consumer_tag: consumer_tag.to_owned(),
            options,
            arguments,
        };
        let wrapper = self.inner.wrap_consumer(consumer, subscription);

        let (tag, _) = self.inner.consume_with(&wrapper).await?;
        debug!(queue, consumer_tag = tag, "consumer subscribed");
        Ok(tag)
    }

    async fn basic_cancel(
        &self,
        consumer_tag: &str,
        options: BasicCancelOptions,
    ) -> Result<(), AmqpError> {
        self.inner
            .dispatch("basic_cancel", move |target| {
                async move { target.channel.basic_cancel(consumer_tag, options).await }.boxed()
            })
            .await?;

        self.inner
            .consumers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|_, consumer| consumer.consumer_tag() != consumer_tag);
        Ok(())
    }

    async fn basic_ack(&self, delivery_tag: u64, options: BasicAckOptions) -> Result<(), AmqpError> {
        self.inner
            .dispatch("basic_ack", move |target| {
                async move { target.channel.basic_ack(delivery_tag, options).await }.boxed()
            })
            .await
    }

    async fn basic_nack(
        &self,
        delivery_tag: u64,
        options: BasicNackOptions,
    ) -> Result<(), AmqpError> {
        self.inner
            .dispatch("basic_nack", move |target| {
                async move { target.channel.basic_nack(delivery_tag, options).await }.boxed()
            })
            .await
    }

    /// Closes the target and unregisters the channel from its connection.
    ///
    /// Never retried and never fails: the channel is discarded either way.
    async fn close(&self, reply_code: u16, reply_text: &str) -> Result<(), AmqpError> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            debug!(channel = self.channel_id(), "channel already closed");
            return Ok(());
        }

        {
            let target = self.inner.target.lock().await;
            if let Err(err) = target.channel.close(reply_code, reply_text).await {
                debug!(
                    channel = self.channel_id(),
                    error = err.to_string(),
                    "failure to close channel, ignoring"
                );
            }
        }

        self.inner.mark_closed();
        if let Some(connection) = self.inner.connection.upgrade() {
            connection.remove_channel(self.inner.key);
        }

        debug!(channel = self.channel_id(), "channel closed");
        Ok(())
    }
}
