// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # HA Connection
//!
//! `HaConnection` wraps the broker connection currently in use and tracks every
//! channel created through it. On reconnection the connection manager installs a
//! new target here, then every tracked channel gets a fresh broker channel with
//! the same numeric id. Gates are reopened only once the whole set was swapped.

use crate::{
    broker::{addresses_to_string, Address, BrokerChannel, BrokerConnection, ChannelId},
    channel::{ChannelInner, HaChannel},
    errors::{AmqpError, REPLY_SUCCESS},
    listener::{HaConnectionListener, ListenerSet},
    retry::RetryStrategy,
    scheduler::TaskScheduler,
};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, PoisonError, RwLock, Weak,
    },
    time::Duration,
};
use futures_util::FutureExt;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

pub(crate) struct ConnectionInner {
    addresses: Vec<Address>,
    target: RwLock<Option<Arc<dyn BrokerConnection>>>,
    // bumped every time the target is installed or retired
    generation: AtomicU64,
    channels: Mutex<HashMap<u64, Arc<ChannelInner>>>,
    next_key: AtomicU64,
    retry_strategy: Arc<dyn RetryStrategy>,
    scheduler: TaskScheduler,
    listeners: ListenerSet,
    closed: AtomicBool,
    reconnecting: AtomicBool,
    // a shutdown of the live target arrived while a reconnection was running
    lost_during_recovery: AtomicBool,
    wake: Notify,
}

impl ConnectionInner {
    pub(crate) fn remove_channel(&self, key: u64) {
        let removed = self
            .channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key);

        if removed.is_some() {
            debug!(key, "channel removed from the tracked set");
        }
    }

    fn snapshot(&self) -> Vec<Arc<ChannelInner>> {
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}

/// A connection handle that survives broker restarts and network failures.
///
/// Cloning yields another handle to the same connection.
#[derive(Clone)]
pub struct HaConnection {
    inner: Arc<ConnectionInner>,
}

impl HaConnection {
    pub(crate) fn new(
        addresses: &[Address],
        target: Option<Arc<dyn BrokerConnection>>,
        retry_strategy: Arc<dyn RetryStrategy>,
        scheduler: TaskScheduler,
    ) -> Self {
        HaConnection {
            inner: Arc::new(ConnectionInner {
                addresses: addresses.to_vec(),
                target: RwLock::new(target),
                generation: AtomicU64::new(1),
                channels: Mutex::new(HashMap::new()),
                next_key: AtomicU64::new(1),
                retry_strategy,
                scheduler,
                listeners: ListenerSet::new(),
                closed: AtomicBool::new(false),
                reconnecting: AtomicBool::new(false),
                lost_during_recovery: AtomicBool::new(false),
                wake: Notify::new(),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<ConnectionInner>) -> Self {
        HaConnection { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<ConnectionInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(weak: &Weak<ConnectionInner>) -> Option<Self> {
        weak.upgrade().map(HaConnection::from_inner)
    }

    /// Opens a channel on the current target and starts tracking it.
    pub async fn create_channel(&self) -> Result<HaChannel, AmqpError> {
        if self.is_closed() {
            return Err(AmqpError::AlreadyClosed("connection".to_owned()));
        }

        let target = self.target().ok_or_else(|| {
            AmqpError::ConnectionError(format!(
                "not connected to {}",
                addresses_to_string(&self.inner.addresses)
            ))
        })?;

        let channel = target.create_channel(None).await?;
        let key = self.inner.next_key.fetch_add(1, Ordering::SeqCst);
        let inner = ChannelInner::new(
            key,
            channel,
            self.inner.retry_strategy.clone(),
            self.inner.scheduler.clone(),
            self.downgrade(),
        );

        self.inner
            .channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, inner.clone());

        debug!(channel = inner.channel_id(), "channel created");
        Ok(HaChannel::from_inner(inner))
    }

    /// Closes the gate of every tracked channel.
    pub fn close_gates(&self) {
        for channel in self.inner.snapshot() {
            channel.gate().close();
        }
    }

    pub(crate) fn open_gates(&self) {
        for channel in self.inner.snapshot() {
            channel.gate().open();
        }
    }

    /// Installs `target`, moves every tracked channel onto it, then reopens the gates.
    pub async fn replace_all_channels(
        &self,
        target: Arc<dyn BrokerConnection>,
    ) -> Result<(), AmqpError> {
        self.install(target);
        self.swap_all_channels().await?;
        self.open_gates();
        Ok(())
    }

    /// Opens a fresh broker channel with the same id for every tracked channel
    /// and swaps it in. Gates are left closed.
    pub(crate) async fn swap_all_channels(&self) -> Result<(), AmqpError> {
        for channel in self.inner.snapshot() {
            if channel.is_closed() {
                continue;
            }

            let replacement = self.open_broker_channel(Some(channel.channel_id())).await?;
            channel.replace_target(replacement).await;
        }

        Ok(())
    }

    /// Opens a broker channel on the current target, asking for `id`.
    pub(crate) async fn open_broker_channel(
        &self,
        id: Option<ChannelId>,
    ) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let target = self
            .target()
            .ok_or_else(|| AmqpError::ConnectionError("no connection installed".to_owned()))?;

        let channel = target.create_channel(id).await?;
        if let Some(id) = id.filter(|id| *id != channel.id()) {
            warn!(
                requested = id,
                assigned = channel.id(),
                "broker assigned a different channel id"
            );
        }

        Ok(channel)
    }

    /// Installs a new target, returning its generation.
    pub(crate) fn install(&self, target: Arc<dyn BrokerConnection>) -> u64 {
        let mut current = self
            .inner
            .target
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *current = Some(target);
        self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Drops the current target so its shutdown notices are ignored.
    pub(crate) fn retire(&self) -> Option<Arc<dyn BrokerConnection>> {
        let mut current = self
            .inner
            .target
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        current.take()
    }

    pub(crate) fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    fn target(&self) -> Option<Arc<dyn BrokerConnection>> {
        self.inner
            .target
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn begin_reconnection(&self) -> bool {
        !self.inner.reconnecting.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn end_reconnection(&self) {
        self.inner.reconnecting.store(false, Ordering::SeqCst);
        // drop a wake-up that arrived after the last wait
        let _ = self.inner.wake.notified().now_or_never();
    }

    pub fn is_reconnecting(&self) -> bool {
        self.inner.reconnecting.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_lost(&self) {
        self.inner.lost_during_recovery.store(true, Ordering::SeqCst);
    }

    pub(crate) fn take_lost(&self) -> bool {
        self.inner.lost_during_recovery.swap(false, Ordering::SeqCst)
    }

    /// Sleeps for `wait`, or less when `reconnect_now` is called meanwhile.
    pub(crate) async fn pause(&self, wait: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = self.inner.wake.notified() => {
                debug!("reconnection wait interrupted, reconnecting now");
            }
        }
    }

    /// Cuts the current reconnection wait short. Does nothing while connected.
    pub fn reconnect_now(&self) {
        if self.is_reconnecting() {
            self.inner.wake.notify_one();
        }
    }

    pub(crate) fn listeners(&self) -> &ListenerSet {
        &self.inner.listeners
    }

    /// Registers a listener for the lifecycle events of this connection only.
    pub fn add_listener(&self, listener: Arc<dyn HaConnectionListener>) {
        self.inner.listeners.add(listener);
    }

    pub fn addresses(&self) -> &[Address] {
        &self.inner.addresses
    }

    /// Other nodes advertised by the broker currently connected to.
    pub fn known_hosts(&self) -> Vec<Address> {
        self.target()
            .map(|target| target.known_hosts())
            .unwrap_or_default()
    }

    pub fn is_open(&self) -> bool {
        !self.is_closed() && self.target().is_some_and(|target| target.is_open())
    }

    /// Whether the application closed the connection.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn channel_count(&self) -> usize {
        self.inner
            .channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Handles of every tracked channel.
    pub fn channels(&self) -> Vec<HaChannel> {
        self.inner
            .snapshot()
            .into_iter()
            .map(HaChannel::from_inner)
            .collect()
    }

    /// Closes the connection for good.
    ///
    /// Every tracked channel is marked closed, so callers blocked on a gate wake up
    /// and fail with `AlreadyClosed`. A running reconnection stops at its next step.
    pub async fn close(&self) -> Result<(), AmqpError> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let channels: Vec<_> = self
            .inner
            .channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, channel)| channel)
            .collect();
        for channel in channels {
            channel.mark_closed();
        }

        self.reconnect_now();

        info!(
            addresses = addresses_to_string(&self.inner.addresses),
            "closing connection"
        );

        match self.target() {
            Some(target) => target.close(REPLY_SUCCESS, "OK").await,
            None => Ok(()),
        }
    }
}
