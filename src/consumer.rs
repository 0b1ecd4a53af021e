// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # HA Consumer Wrapper
//!
//! This module defines the consumer callback interface and `HaConsumer`, the wrapper
//! an HA channel puts around every application consumer it subscribes.
//!
//! When the broker pushes a shutdown notice to a wrapped consumer, the wrapper:
//! 1. Closes the owning channel's gate so new operations queue behind the coming reconnection
//! 2. Schedules a replay of the first subscribe call through the channel's normal dispatch
//!    path, which parks on the gate until the channel has a live target again
//!
//! Every registration with a broker channel is stamped with the generation of the
//! channel target it was made on. Notices coming from an older registration than
//! the live one are stale duplicates and ignored, so a burst of notices for the
//! same channel death produces exactly one re-subscription.

use crate::{
    channel::ChannelInner,
    errors::{AmqpError, ShutdownSignal},
    scheduler::TaskScheduler,
};
use async_trait::async_trait;
use lapin::{options::BasicConsumeOptions, types::FieldTable, BasicProperties};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex, PoisonError, Weak,
};
use tracing::{debug, error};

/// A message pushed by the broker to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub body: Vec<u8>,
    /// Generation of the HA channel target the message came from, 0 outside an HA channel.
    /// Delivery tags are only meaningful to that target.
    pub channel_generation: u64,
}

impl From<lapin::message::Delivery> for Delivery {
    fn from(delivery: lapin::message::Delivery) -> Self {
        Delivery {
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange.to_string(),
            routing_key: delivery.routing_key.to_string(),
            redelivered: delivery.redelivered,
            properties: delivery.properties,
            body: delivery.data,
            channel_generation: 0,
        }
    }
}

/// Callbacks the broker invokes on a subscribed consumer.
///
/// Only `handle_delivery` is required.
#[async_trait]
pub trait Consumer: Send + Sync {
    async fn handle_delivery(&self, consumer_tag: &str, delivery: Delivery);

    async fn handle_consume_ok(&self, _consumer_tag: &str) {}

    async fn handle_cancel(&self, _consumer_tag: &str) {}

    async fn handle_cancel_ok(&self, _consumer_tag: &str) {}

    async fn handle_recover_ok(&self, _consumer_tag: &str) {}

    async fn handle_shutdown_signal(&self, _consumer_tag: &str, _signal: &ShutdownSignal) {}
}

/// Parameters of the subscribe call, kept so it can be replayed.
#[derive(Debug, Clone, Default)]
pub(crate) struct Subscription {
    pub(crate) queue: String,
    pub(crate) consumer_tag: String,
    pub(crate) options: BasicConsumeOptions,
    pub(crate) arguments: FieldTable,
}

/// Wraps an application consumer so its subscription survives reconnections.
pub struct HaConsumer {
    target: Arc<dyn Consumer>,
    channel: Weak<ChannelInner>,
    scheduler: TaskScheduler,
    subscription: Mutex<Subscription>,
    // generation of the channel target holding the live registration, 0 = none
    registered: AtomicU64,
    // highest generation a notice arrived for while a replay was pending
    pending: AtomicU64,
    resubscribing: AtomicBool,
    this: Weak<HaConsumer>,
}

impl HaConsumer {
    pub(crate) fn new(
        target: Arc<dyn Consumer>,
        channel: Weak<ChannelInner>,
        scheduler: TaskScheduler,
        subscription: Subscription,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| HaConsumer {
            target,
            channel,
            scheduler,
            subscription: Mutex::new(subscription),
            registered: AtomicU64::new(0),
            pending: AtomicU64::new(0),
            resubscribing: AtomicBool::new(false),
            this: this.clone(),
        })
    }

    /// The wrapped application consumer.
    pub fn target(&self) -> &Arc<dyn Consumer> {
        &self.target
    }

    /// The consumer tag of the current subscription.
    pub fn consumer_tag(&self) -> String {
        self.subscription().consumer_tag
    }

    /// Whether a re-subscription is scheduled or in flight.
    pub fn is_resubscribing(&self) -> bool {
        self.resubscribing.load(Ordering::SeqCst)
    }

    pub(crate) fn subscription(&self) -> Subscription {
        self.subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_subscription(&self, subscription: Subscription) {
        *self
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = subscription;
    }

    /// Records a successful registration made on the target of `generation`.
    ///
    /// The broker-assigned tag replaces an empty one so replays keep the same tag.
    pub(crate) fn registered(&self, consumer_tag: &str, generation: u64) {
        {
            let mut subscription = self
                .subscription
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            subscription.consumer_tag = consumer_tag.to_owned();
        }

        self.registered.fetch_max(generation, Ordering::SeqCst);
    }

    /// Builds the per-registration consumer handed to a broker channel.
    pub(crate) fn registration(self: &Arc<Self>, generation: u64) -> Arc<dyn Consumer> {
        Arc::new(Registration {
            consumer: Arc::clone(self),
            generation,
        })
    }

    async fn on_shutdown(&self, consumer_tag: &str, signal: &ShutdownSignal, generation: u64) {
        if signal.initiated_by_application {
            debug!(consumer_tag, "consumer shut down by the application, not re-registering");
            self.target.handle_shutdown_signal(consumer_tag, signal).await;
            return;
        }

        if generation < self.registered.load(Ordering::SeqCst) {
            debug!(consumer_tag, generation, "ignoring shutdown notice of a replaced registration");
            return;
        }

        let Some(channel) = self.channel.upgrade().filter(|c| !c.is_closed()) else {
            debug!(consumer_tag, "owning channel is closed, not re-registering");
            self.target.handle_shutdown_signal(consumer_tag, signal).await;
            return;
        };

        debug!(
            consumer_tag,
            signal = signal.to_string(),
            "consumer asked to handle shutdown signal, re-registering consume"
        );

        // a late notice for a target that was already replaced must not close
        // the gate of the live one, nobody would reopen it
        if generation >= channel.generation().await {
            channel.gate().close();
        }

        self.pending.fetch_max(generation, Ordering::SeqCst);
        if self.resubscribing.swap(true, Ordering::SeqCst) {
            debug!(consumer_tag, "re-registration already scheduled");
            return;
        }

        let Some(this) = self.this.upgrade() else {
            return;
        };

        let signal = signal.clone();
        self.scheduler
            .spawn("consumer-resubscribe", async move { this.resubscribe(signal).await });
    }

    async fn resubscribe(self: Arc<Self>, signal: ShutdownSignal) {
        loop {
            let result = match self.channel.upgrade() {
                Some(channel) => channel
                    .consume_with(&self)
                    .await
                    .map(|(_, generation)| generation),
                None => Err(AmqpError::AlreadyClosed("channel was dropped".to_owned())),
            };

            let generation = match result {
                Ok(generation) => generation,
                Err(err) => {
                    error!(error = err.to_string(), "failure to re-register consumer");
                    self.resubscribing.store(false, Ordering::SeqCst);
                    self.target
                        .handle_shutdown_signal(&self.consumer_tag(), &signal)
                        .await;
                    return;
                }
            };

            debug!(
                consumer_tag = self.consumer_tag(),
                generation, "consumer re-registered"
            );

            if let Some(channel) = self.channel.upgrade() {
                channel.reopen_if_live();
            }

            self.resubscribing.store(false, Ordering::SeqCst);

            // a notice from the fresh registration may have been coalesced meanwhile
            if self.pending.load(Ordering::SeqCst) < generation
                || self.resubscribing.swap(true, Ordering::SeqCst)
            {
                return;
            }
        }
    }
}

/// One registration of an `HaConsumer` with a broker channel.
struct Registration {
    consumer: Arc<HaConsumer>,
    generation: u64,
}

#[async_trait]
impl Consumer for Registration {
    async fn handle_delivery(&self, consumer_tag: &str, mut delivery: Delivery) {
        delivery.channel_generation = self.generation;
        self.consumer
            .target
            .handle_delivery(consumer_tag, delivery)
            .await;
    }

    async fn handle_consume_ok(&self, consumer_tag: &str) {
        self.consumer.target.handle_consume_ok(consumer_tag).await;
    }

    async fn handle_cancel(&self, consumer_tag: &str) {
        self.consumer.target.handle_cancel(consumer_tag).await;
    }

    async fn handle_cancel_ok(&self, consumer_tag: &str) {
        self.consumer.target.handle_cancel_ok(consumer_tag).await;
    }

    async fn handle_recover_ok(&self, consumer_tag: &str) {
        self.consumer.target.handle_recover_ok(consumer_tag).await;
    }

    async fn handle_shutdown_signal(&self, consumer_tag: &str, signal: &ShutdownSignal) {
        self.consumer
            .on_shutdown(consumer_tag, signal, self.generation)
            .await;
    }
}
