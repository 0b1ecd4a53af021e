// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Manager
//!
//! `HaConnectionFactory` dials the broker, hands out [`HaConnection`]s and keeps
//! them alive. Every broker connection it installs gets a shutdown listener; when
//! the broker or the network tears it down, the factory closes every channel gate
//! of the connection and runs a reconnection task on the scheduler:
//!
//! 1. wait the reconnection interval (cut short by `HaConnection::reconnect_now`)
//! 2. dial the address list, looping on failure
//! 3. install the new broker connection and swap every tracked channel onto it
//! 4. notify listeners, then reopen the gates so blocked operations resume
//!
//! Application-initiated shutdowns are never recovered from.

use crate::{
    broker::{addresses_to_string, Address, BrokerClient, BrokerConnection},
    config::HaConfigs,
    connection::HaConnection,
    errors::{AmqpError, ShutdownSignal, REPLY_SUCCESS},
    listener::{HaConnectionListener, ListenerSet},
    retry::{BlockingRetry, RetryStrategy},
    scheduler::TaskScheduler,
};
use std::{sync::Arc, time::Duration};
use tracing::{debug, info, warn};

/// Default wait between reconnection attempts.
pub const DEFAULT_RECONNECTION_WAIT: Duration = Duration::from_secs(1);

/// Creates HA connections and recovers them when they are lost.
#[derive(Clone)]
pub struct HaConnectionFactory {
    client: Arc<dyn BrokerClient>,
    reconnection_wait: Duration,
    retry_strategy: Arc<dyn RetryStrategy>,
    listeners: ListenerSet,
    scheduler: TaskScheduler,
}

impl HaConnectionFactory {
    /// Creates a factory waiting [`DEFAULT_RECONNECTION_WAIT`] between attempts and
    /// blocking failed operations until the connection comes back.
    pub fn new(client: Arc<dyn BrokerClient>, scheduler: TaskScheduler) -> Self {
        HaConnectionFactory {
            client,
            reconnection_wait: DEFAULT_RECONNECTION_WAIT,
            retry_strategy: Arc::new(BlockingRetry::new()),
            listeners: ListenerSet::new(),
            scheduler,
        }
    }

    /// Creates a factory from the crate configuration.
    pub fn from_configs(
        client: Arc<dyn BrokerClient>,
        cfg: &HaConfigs,
        scheduler: TaskScheduler,
    ) -> Result<Self, AmqpError> {
        cfg.validate()?;

        Ok(HaConnectionFactory::new(client, scheduler)
            .with_reconnection_wait(cfg.reconnection_wait())?
            .with_retry_strategy(cfg.retry.build()?))
    }

    /// Sets the wait between reconnection attempts, which must be positive.
    pub fn with_reconnection_wait(mut self, wait: Duration) -> Result<Self, AmqpError> {
        if wait.is_zero() {
            return Err(AmqpError::InvalidConfiguration(
                "reconnection wait must be greater than zero".to_owned(),
            ));
        }

        self.reconnection_wait = wait;
        Ok(self)
    }

    /// Sets the strategy shared by every channel of the connections created from now on.
    pub fn with_retry_strategy(mut self, strategy: Arc<dyn RetryStrategy>) -> Self {
        self.retry_strategy = strategy;
        self
    }

    pub fn reconnection_wait(&self) -> Duration {
        self.reconnection_wait
    }

    pub fn retry_strategy(&self) -> &Arc<dyn RetryStrategy> {
        &self.retry_strategy
    }

    /// Registers a listener notified for every connection of this factory.
    pub fn add_listener(&self, listener: Arc<dyn HaConnectionListener>) {
        self.listeners.add(listener);
    }

    /// Connects to the first reachable address.
    ///
    /// When no broker is reachable the call keeps trying, waiting the
    /// reconnection interval between attempts, and only returns once connected.
    pub async fn new_connection(&self, addresses: &[Address]) -> Result<HaConnection, AmqpError> {
        if addresses.is_empty() {
            return Err(AmqpError::InvalidConfiguration(
                "at least one broker address is required".to_owned(),
            ));
        }

        let addresses_str = addresses_to_string(addresses);
        debug!(addresses = addresses_str, "creating connection");

        match self.client.dial(addresses).await {
            Ok(target) => {
                let connection = HaConnection::new(
                    addresses,
                    Some(target.clone()),
                    self.retry_strategy.clone(),
                    self.scheduler.clone(),
                );
                self.watch(&connection, &target, connection.generation());

                info!(addresses = addresses_str, "connected");
                Ok(connection)
            }
            Err(err) => {
                warn!(
                    addresses = addresses_str,
                    error = err.to_string(),
                    "initial connection failed, wrapping anyway and reconnecting"
                );

                let connection = HaConnection::new(
                    addresses,
                    None,
                    self.retry_strategy.clone(),
                    self.scheduler.clone(),
                );
                self.connect_failed(&connection, &err, false).await;
                connection.begin_reconnection();
                ReconnectionTask::new(self.clone(), connection.clone(), false)
                    .run()
                    .await;

                Ok(connection)
            }
        }
    }

    /// Registers the shutdown listener of a freshly installed target.
    fn watch(
        &self,
        connection: &HaConnection,
        target: &Arc<dyn BrokerConnection>,
        generation: u64,
    ) {
        let factory = self.clone();
        let weak = connection.downgrade();

        target.on_shutdown(Box::new(move |signal| {
            if let Some(connection) = HaConnection::upgrade(&weak) {
                factory.on_shutdown(connection, generation, signal);
            }
        }));
    }

    fn on_shutdown(&self, connection: HaConnection, generation: u64, signal: ShutdownSignal) {
        if generation != connection.generation() {
            debug!(
                generation,
                signal = signal.to_string(),
                "ignoring shutdown of a replaced connection"
            );
            return;
        }

        let recover = !signal.initiated_by_application && !connection.is_closed();
        if recover {
            connection.close_gates();
            connection.mark_lost();
        }

        let factory = self.clone();
        self.scheduler.spawn("connection-shutdown", async move {
            factory.disconnected(&connection, &signal).await;

            if !recover {
                debug!(
                    signal = signal.to_string(),
                    "connection shut down by the application, not reconnecting"
                );
                return;
            }

            if !connection.begin_reconnection() {
                debug!("reconnection already running");
                return;
            }

            ReconnectionTask::new(factory, connection, true).run().await;
        });
    }

    async fn connected(&self, connection: &HaConnection, reconnection: bool) {
        self.listeners.connected(connection, reconnection).await;
        connection
            .listeners()
            .connected(connection, reconnection)
            .await;
    }

    async fn connect_failed(&self, connection: &HaConnection, err: &AmqpError, reconnection: bool) {
        self.listeners
            .connect_failed(connection, err, reconnection)
            .await;
        connection
            .listeners()
            .connect_failed(connection, err, reconnection)
            .await;
    }

    async fn disconnected(&self, connection: &HaConnection, signal: &ShutdownSignal) {
        self.listeners.disconnected(connection, signal).await;
        connection.listeners().disconnected(connection, signal).await;
    }
}

/// Re-establishes one connection. Runs until connected or the connection is closed.
struct ReconnectionTask {
    factory: HaConnectionFactory,
    connection: HaConnection,
    reconnection: bool,
}

impl ReconnectionTask {
    fn new(factory: HaConnectionFactory, connection: HaConnection, reconnection: bool) -> Self {
        ReconnectionTask {
            factory,
            connection,
            reconnection,
        }
    }

    async fn run(mut self) {
        loop {
            self.reconnect().await;
            self.connection.end_reconnection();

            // the new target may have died before the flag was cleared
            if self.connection.is_closed()
                || !self.connection.take_lost()
                || !self.connection.begin_reconnection()
            {
                return;
            }

            warn!("connection lost during recovery, reconnecting again");
            self.connection.close_gates();
            self.reconnection = true;
        }
    }

    async fn reconnect(&self) {
        let addresses = addresses_to_string(self.connection.addresses());
        self.connection.close_gates();

        info!(
            addresses,
            wait_ms = self.factory.reconnection_wait.as_millis() as u64,
            "reconnecting"
        );

        let mut attempt: u64 = 0;
        loop {
            self.connection.pause(self.factory.reconnection_wait).await;

            if self.connection.is_closed() {
                debug!(addresses, "connection closed, abandoning reconnection");
                return;
            }

            attempt += 1;
            match self.attempt().await {
                Ok(()) => {
                    info!(addresses, attempt, "reconnection complete");
                    return;
                }
                Err(err) => {
                    warn!(
                        addresses,
                        attempt,
                        error = err.to_string(),
                        "failed to reconnect, retrying"
                    );
                    self.factory
                        .connect_failed(&self.connection, &err, self.reconnection)
                        .await;
                }
            }
        }
    }

    async fn attempt(&self) -> Result<(), AmqpError> {
        self.connection.take_lost();

        let target = self
            .factory
            .client
            .dial(self.connection.addresses())
            .await?;

        let generation = self.connection.install(target.clone());
        self.factory.watch(&self.connection, &target, generation);

        if let Err(err) = self.connection.swap_all_channels().await {
            self.connection.retire();
            if let Err(close_err) = target
                .close(REPLY_SUCCESS, "channel replacement failed")
                .await
            {
                debug!(
                    error = close_err.to_string(),
                    "failure to close abandoned connection, ignoring"
                );
            }
            return Err(err);
        }

        self.factory
            .connected(&self.connection, self.reconnection)
            .await;
        self.connection.open_gates();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broker::{BrokerChannel, BrokerConnection as _, MockBrokerClient},
        config::{HaConfigs, RabbitMQConfigs},
        retry::RetryPolicy,
        testing::{eventually, FakeBroker, RecordingConsumer, RecordingListener},
    };
    use lapin::{
        options::{BasicConsumeOptions, BasicPublishOptions},
        types::FieldTable,
        BasicProperties,
    };
    use std::sync::atomic::Ordering;

    const WAIT: Duration = Duration::from_millis(10);

    fn factory(broker: &Arc<FakeBroker>) -> HaConnectionFactory {
        HaConnectionFactory::new(broker.clone(), TaskScheduler::current())
            .with_reconnection_wait(WAIT)
            .unwrap()
    }

    fn addresses() -> Vec<Address> {
        vec![Address::new("rabbit-1", 5672), Address::new("rabbit-2", 5672)]
    }

    #[tokio::test]
    async fn zero_reconnection_wait_is_rejected() {
        let client = Arc::new(MockBrokerClient::new());

        let result = HaConnectionFactory::new(client, TaskScheduler::current())
            .with_reconnection_wait(Duration::ZERO);

        assert!(matches!(result, Err(AmqpError::InvalidConfiguration(_))));
    }

    #[tokio::test]
    async fn builds_from_configs() {
        let cfg = HaConfigs {
            reconnection_wait_ms: 250,
            retry: RetryPolicy::Never,
            rabbitmq: RabbitMQConfigs::default(),
            ..HaConfigs::default()
        };

        let factory =
            HaConnectionFactory::from_configs(FakeBroker::new(), &cfg, TaskScheduler::current())
                .unwrap();

        assert_eq!(factory.reconnection_wait(), Duration::from_millis(250));
        assert_eq!(factory.retry_strategy().name(), "never");
    }

    #[tokio::test]
    async fn rejects_empty_address_lists() {
        let broker = FakeBroker::new();

        let result = factory(&broker).new_connection(&[]).await;

        assert!(matches!(result, Err(AmqpError::InvalidConfiguration(_))));
        assert_eq!(broker.dial_count(), 0);
    }

    #[tokio::test]
    async fn initial_failures_are_retried_until_connected() {
        let broker = FakeBroker::new();
        broker.refuse_dials(2);
        let factory = factory(&broker);
        let listener = Arc::new(RecordingListener::default());
        factory.add_listener(listener.clone());

        let connection = factory.new_connection(&addresses()).await.unwrap();

        assert!(connection.is_open());
        assert!(!connection.is_reconnecting());
        assert_eq!(broker.dial_count(), 3);
        assert_eq!(
            listener.events(),
            vec!["connect_failure", "connect_failure", "connect"]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reconnects_every_channel_before_opening_gates() {
        let broker = FakeBroker::new();
        let factory = factory(&broker);
        let listener = Arc::new(RecordingListener::default());
        factory.add_listener(listener.clone());

        let connection = factory.new_connection(&addresses()).await.unwrap();
        let channels = vec![
            connection.create_channel().await.unwrap(),
            connection.create_channel().await.unwrap(),
            connection.create_channel().await.unwrap(),
        ];
        let ids: Vec<_> = channels.iter().map(|c| c.channel_id()).collect();
        let first = broker.latest();

        broker.refuse_dials(2);
        first.kill().await;

        assert!(eventually(|| listener.count("reconnection") == 1).await);
        assert!(eventually(|| channels.iter().all(|c| c.gate().is_open())).await);

        assert_eq!(broker.dial_count(), 4);
        assert_eq!(listener.count("disconnect"), 1);
        assert_eq!(listener.count("reconnect_failure"), 2);
        assert_eq!(*listener.gates_open_on_connect.lock().unwrap(), vec![false; 3]);

        let second = broker.latest();
        assert_eq!(second.number(), 2);
        let mut replaced: Vec<_> = second.channels().iter().map(|c| c.id()).collect();
        replaced.sort();
        let mut expected = ids.clone();
        expected.sort();
        assert_eq!(replaced, expected);
        assert_eq!(channels.iter().map(|c| c.channel_id()).collect::<Vec<_>>(), ids);

        channels[1]
            .basic_publish(
                "",
                "orders",
                BasicPublishOptions::default(),
                b"{}",
                BasicProperties::default(),
            )
            .await
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn blocked_operations_resume_after_reconnection() {
        let broker = FakeBroker::new();
        let factory = factory(&broker);
        let connection = factory.new_connection(&addresses()).await.unwrap();
        let channel = connection.create_channel().await.unwrap();
        let first = broker.latest();

        broker.refuse_dials(3);
        first.kill().await;

        let result = channel
            .basic_publish(
                "",
                "orders",
                BasicPublishOptions::default(),
                b"{}",
                BasicProperties::default(),
            )
            .await;

        assert!(result.is_ok());
        assert_eq!(broker.latest().number(), 2);
        assert_eq!(broker.latest().channels()[0].calls("basic_publish"), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn consumers_are_resubscribed_on_the_new_connection() {
        let broker = FakeBroker::new();
        let factory = factory(&broker);
        let connection = factory.new_connection(&addresses()).await.unwrap();
        let channel = connection.create_channel().await.unwrap();
        let consumer = Arc::new(RecordingConsumer::default());

        channel
            .basic_consume(
                "orders",
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
                consumer.clone(),
            )
            .await
            .unwrap();

        broker.latest().kill().await;

        assert!(eventually(|| broker.connection_count() == 2).await);
        let second = broker.latest();
        assert!(eventually(|| second
            .channels()
            .first()
            .is_some_and(|c| c.consumer_count() == 1))
        .await);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(second.channels()[0].calls("basic_consume"), 1);
        assert_eq!(consumer.consume_oks.load(Ordering::SeqCst), 2);

        second.channels()[0].deliver(b"hello").await;
        assert_eq!(*consumer.deliveries.lock().unwrap(), vec![b"hello".to_vec()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn application_close_does_not_reconnect() {
        let broker = FakeBroker::new();
        let factory = factory(&broker);
        let listener = Arc::new(RecordingListener::default());
        factory.add_listener(listener.clone());
        let connection = factory.new_connection(&addresses()).await.unwrap();

        connection.close().await.unwrap();

        assert!(eventually(|| listener.count("disconnect") == 1).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(broker.dial_count(), 1);
        assert!(!connection.is_reconnecting());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stale_shutdowns_are_ignored() {
        let broker = FakeBroker::new();
        let factory = factory(&broker);
        let connection = factory.new_connection(&addresses()).await.unwrap();
        let first = broker.latest();

        first.kill().await;
        assert!(eventually(|| broker.connection_count() == 2 && connection.is_open()).await);
        assert!(eventually(|| !connection.is_reconnecting()).await);

        // the dead connection reports its shutdown once more
        first.kill().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(broker.dial_count(), 2);
        assert!(connection.is_open());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_channel_replacement_dials_again() {
        let broker = FakeBroker::new();
        let factory = factory(&broker);
        let listener = Arc::new(RecordingListener::default());
        let connection = factory.new_connection(&addresses()).await.unwrap();
        connection.add_listener(listener.clone());
        let channel = connection.create_channel().await.unwrap();

        broker.break_channels_of_next_dials(1);
        broker.latest().kill().await;

        assert!(eventually(|| listener.count("reconnection") == 1).await);
        assert!(eventually(|| channel.gate().is_open()).await);

        assert_eq!(broker.dial_count(), 3);
        assert_eq!(listener.count("reconnect_failure"), 1);
        assert!(!broker.connection(2).is_open());
        assert_eq!(broker.latest().number(), 3);
        assert!(connection.is_open());
        assert!(!connection.is_reconnecting());
    }

    #[tokio::test]
    async fn reconnect_now_skips_the_wait() {
        let broker = FakeBroker::new();
        let factory = HaConnectionFactory::new(broker.clone(), TaskScheduler::current())
            .with_reconnection_wait(Duration::from_secs(3600))
            .unwrap();
        let connection = factory.new_connection(&addresses()).await.unwrap();
        let channel = connection.create_channel().await.unwrap();

        broker.latest().kill().await;
        assert!(eventually(|| connection.is_reconnecting()).await);
        connection.reconnect_now();

        assert!(eventually(|| channel.gate().is_open() && broker.connection_count() == 2).await);
    }
}
