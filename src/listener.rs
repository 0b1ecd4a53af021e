// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Lifecycle Listeners
//!
//! Observers notified by the connection manager. Callbacks run on the reconnection
//! task, in registration order, and are awaited before any channel gate reopens:
//! a listener that re-declares topology on `on_reconnection` is guaranteed to
//! finish before application traffic resumes. A listener that never returns
//! stalls recovery.

use crate::{
    connection::HaConnection,
    errors::{AmqpError, ShutdownSignal},
};
use async_trait::async_trait;
use std::sync::{Arc, PoisonError, RwLock};

/// Receives connection lifecycle events. Every callback defaults to a no-op.
#[async_trait]
pub trait HaConnectionListener: Send + Sync {
    /// The first connection attempt succeeded after one or more failures.
    async fn on_connect(&self, _connection: &HaConnection) {}

    /// An initial connection attempt failed.
    async fn on_connect_failure(&self, _connection: &HaConnection, _error: &AmqpError) {}

    /// The connection shut down, for whatever reason.
    async fn on_disconnect(&self, _connection: &HaConnection, _signal: &ShutdownSignal) {}

    /// The connection and all of its channels were re-established.
    async fn on_reconnection(&self, _connection: &HaConnection) {}

    /// A reconnection attempt failed, another one will follow.
    async fn on_reconnect_failure(&self, _connection: &HaConnection, _error: &AmqpError) {}
}

/// An ordered, shareable set of listeners.
#[derive(Clone, Default)]
pub struct ListenerSet {
    listeners: Arc<RwLock<Vec<Arc<dyn HaConnectionListener>>>>,
}

impl ListenerSet {
    /// An empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `listener`. Listeners are notified in registration order.
    pub fn add(&self, listener: Arc<dyn HaConnectionListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // listeners may register more listeners, so never notify under the lock
    fn snapshot(&self) -> Vec<Arc<dyn HaConnectionListener>> {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) async fn connected(&self, connection: &HaConnection, reconnection: bool) {
        for listener in self.snapshot() {
            if reconnection {
                listener.on_reconnection(connection).await;
            } else {
                listener.on_connect(connection).await;
            }
        }
    }

    pub(crate) async fn connect_failed(
        &self,
        connection: &HaConnection,
        error: &AmqpError,
        reconnection: bool,
    ) {
        for listener in self.snapshot() {
            if reconnection {
                listener.on_reconnect_failure(connection, error).await;
            } else {
                listener.on_connect_failure(connection, error).await;
            }
        }
    }

    pub(crate) async fn disconnected(&self, connection: &HaConnection, signal: &ShutdownSignal) {
        for listener in self.snapshot() {
            listener.on_disconnect(connection, signal).await;
        }
    }
}
