// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker used by the unit tests to script connection loss,
//! failing operations and reconnections.

use crate::{
    broker::{
        Address, BrokerChannel, BrokerClient, BrokerConnection, ChannelId, QueueInfo,
        ShutdownListener,
    },
    connection::HaConnection,
    consumer::{Consumer, Delivery},
    errors::{AmqpError, ShutdownSignal, CONNECTION_FORCED},
    listener::HaConnectionListener,
};
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
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

pub(crate) fn broker_shutdown() -> AmqpError {
    ShutdownSignal::by_broker(CONNECTION_FORCED, "connection forced").into()
}

/// Polls `condition` until it holds or two seconds went by.
pub(crate) async fn eventually<F>(condition: F) -> bool
where
    F: Fn() -> bool,
{
    for _ in 0..400 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

pub(crate) struct FakeChannel {
    id: ChannelId,
    connection: u32,
    open: AtomicBool,
    closed_by_app: AtomicBool,
    fail_always: Mutex<Option<AmqpError>>,
    failures: Mutex<VecDeque<AmqpError>>,
    calls: Mutex<Vec<&'static str>>,
    consumers: Mutex<Vec<(String, Arc<dyn Consumer>)>>,
    next_tag: AtomicU32,
}

impl FakeChannel {
    pub(crate) fn new(id: ChannelId, connection: u32) -> Arc<Self> {
        Arc::new(FakeChannel {
            id,
            connection,
            open: AtomicBool::new(true),
            closed_by_app: AtomicBool::new(false),
            fail_always: Mutex::new(None),
            failures: Mutex::new(VecDeque::new()),
            calls: Mutex::new(vec![]),
            consumers: Mutex::new(vec![]),
            next_tag: AtomicU32::new(1),
        })
    }

    pub(crate) fn connection(&self) -> u32 {
        self.connection
    }

    /// Every call fails with `err` from now on.
    pub(crate) fn fail_always(&self, err: AmqpError) {
        *self.fail_always.lock().unwrap() = Some(err);
    }

    /// The next call fails with `err`.
    pub(crate) fn fail_next(&self, err: AmqpError) {
        self.failures.lock().unwrap().push_back(err);
    }

    pub(crate) fn calls(&self, operation: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|op| **op == operation)
            .count()
    }

    pub(crate) fn consumer_count(&self) -> usize {
        self.consumers.lock().unwrap().len()
    }

    pub(crate) fn is_closed_by_app(&self) -> bool {
        self.closed_by_app.load(Ordering::SeqCst)
    }

    /// Pushes a delivery to every consumer of the channel.
    pub(crate) async fn deliver(&self, body: &[u8]) {
        let consumers = self.consumers.lock().unwrap().clone();
        for (tag, consumer) in consumers {
            let delivery = Delivery {
                delivery_tag: self.next_tag.fetch_add(1, Ordering::SeqCst) as u64,
                exchange: "".to_owned(),
                routing_key: "".to_owned(),
                redelivered: false,
                properties: BasicProperties::default(),
                body: body.to_vec(),
                channel_generation: 0,
            };
            consumer.handle_delivery(&tag, delivery).await;
        }
    }

    /// Simulates the broker tearing the channel down, notifying `notices` times.
    pub(crate) async fn kill(&self, notices: usize) {
        self.open.store(false, Ordering::SeqCst);

        let signal = ShutdownSignal::by_broker(CONNECTION_FORCED, "channel forced");
        let consumers = self.consumers.lock().unwrap().clone();
        for _ in 0..notices {
            for (tag, consumer) in &consumers {
                consumer.handle_shutdown_signal(tag, &signal).await;
            }
        }
    }

    fn invoke(&self, operation: &'static str) -> Result<(), AmqpError> {
        self.calls.lock().unwrap().push(operation);

        if self.closed_by_app.load(Ordering::SeqCst) {
            return Err(ShutdownSignal::by_application("channel closed").into());
        }
        if !self.open.load(Ordering::SeqCst) {
            return Err(broker_shutdown());
        }
        if let Some(err) = self.fail_always.lock().unwrap().clone() {
            return Err(err);
        }
        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for FakeChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn exchange_declare(
        &self,
        _: &str,
        _: ExchangeKind,
        _: ExchangeDeclareOptions,
        _: FieldTable,
    ) -> Result<(), AmqpError> {
        self.invoke("exchange_declare")
    }

    async fn queue_declare(
        &self,
        queue: &str,
        _: QueueDeclareOptions,
        _: FieldTable,
    ) -> Result<QueueInfo, AmqpError> {
        self.invoke("queue_declare")?;
        Ok(QueueInfo {
            name: queue.to_owned(),
            ..QueueInfo::default()
        })
    }

    async fn queue_bind(
        &self,
        _: &str,
        _: &str,
        _: &str,
        _: QueueBindOptions,
        _: FieldTable,
    ) -> Result<(), AmqpError> {
        self.invoke("queue_bind")
    }

    async fn basic_qos(&self, _: u16, _: BasicQosOptions) -> Result<(), AmqpError> {
        self.invoke("basic_qos")
    }

    async fn basic_publish(
        &self,
        _: &str,
        _: &str,
        _: BasicPublishOptions,
        _: &[u8],
        _: BasicProperties,
    ) -> Result<(), AmqpError> {
        self.invoke("basic_publish")
    }

    async fn basic_consume(
        &self,
        _: &str,
        consumer_tag: &str,
        _: BasicConsumeOptions,
        _: FieldTable,
        consumer: Arc<dyn Consumer>,
    ) -> Result<String, AmqpError> {
        self.invoke("basic_consume")?;

        let tag = if consumer_tag.is_empty() {
            format!(
                "amq.ctag-{}-{}",
                self.id,
                self.next_tag.fetch_add(1, Ordering::SeqCst)
            )
        } else {
            consumer_tag.to_owned()
        };

        self.consumers
            .lock()
            .unwrap()
            .push((tag.clone(), consumer.clone()));
        consumer.handle_consume_ok(&tag).await;

        Ok(tag)
    }

    async fn basic_cancel(&self, consumer_tag: &str, _: BasicCancelOptions) -> Result<(), AmqpError> {
        self.invoke("basic_cancel")?;

        let removed = {
            let mut consumers = self.consumers.lock().unwrap();
            let position = consumers.iter().position(|(tag, _)| tag == consumer_tag);
            position.map(|index| consumers.remove(index))
        };

        if let Some((tag, consumer)) = removed {
            consumer.handle_cancel_ok(&tag).await;
        }
        Ok(())
    }

    async fn basic_ack(&self, _: u64, _: BasicAckOptions) -> Result<(), AmqpError> {
        self.invoke("basic_ack")
    }

    async fn basic_nack(&self, _: u64, _: BasicNackOptions) -> Result<(), AmqpError> {
        self.invoke("basic_nack")
    }

    async fn close(&self, _: u16, _: &str) -> Result<(), AmqpError> {
        self.invoke("close")?;
        self.closed_by_app.store(true, Ordering::SeqCst);
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }
}

pub(crate) struct FakeConnection {
    number: u32,
    open: AtomicBool,
    next_id: AtomicU16,
    fail_channel_creation: AtomicBool,
    listeners: Mutex<Vec<Arc<ShutdownListener>>>,
    channels: Mutex<Vec<Arc<FakeChannel>>>,
}

impl FakeConnection {
    pub(crate) fn new(number: u32) -> Arc<Self> {
        Arc::new(FakeConnection {
            number,
            open: AtomicBool::new(true),
            next_id: AtomicU16::new(1),
            fail_channel_creation: AtomicBool::new(false),
            listeners: Mutex::new(vec![]),
            channels: Mutex::new(vec![]),
        })
    }

    pub(crate) fn number(&self) -> u32 {
        self.number
    }

    pub(crate) fn channels(&self) -> Vec<Arc<FakeChannel>> {
        self.channels.lock().unwrap().clone()
    }

    pub(crate) fn fail_channel_creation(&self, fail: bool) {
        self.fail_channel_creation.store(fail, Ordering::SeqCst);
    }

    fn fire(&self, signal: ShutdownSignal) {
        let listeners = self.listeners.lock().unwrap().clone();
        for listener in listeners {
            listener(signal.clone());
        }
    }

    /// Simulates the broker dropping the connection: every channel dies, its
    /// consumers get one shutdown notice, then the connection listeners fire.
    pub(crate) async fn kill(&self) {
        self.open.store(false, Ordering::SeqCst);
        for channel in self.channels() {
            channel.kill(1).await;
        }
        self.fire(ShutdownSignal::by_broker(CONNECTION_FORCED, "connection forced"));
    }
}

#[async_trait]
impl BrokerConnection for FakeConnection {
    async fn create_channel(
        &self,
        id: Option<ChannelId>,
    ) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(broker_shutdown());
        }
        if self.fail_channel_creation.load(Ordering::SeqCst) {
            return Err(AmqpError::ChannelError("channel limit reached".to_owned()));
        }

        let id = match id {
            Some(id) => {
                self.next_id.fetch_max(id + 1, Ordering::SeqCst);
                id
            }
            None => self.next_id.fetch_add(1, Ordering::SeqCst),
        };

        let channel = FakeChannel::new(id, self.number);
        self.channels.lock().unwrap().push(channel.clone());
        Ok(channel)
    }

    fn on_shutdown(&self, listener: ShutdownListener) {
        self.listeners.lock().unwrap().push(Arc::new(listener));
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn known_hosts(&self) -> Vec<Address> {
        vec![Address::new(format!("node-{}", self.number), 5672)]
    }

    async fn close(&self, _: u16, _: &str) -> Result<(), AmqpError> {
        self.open.store(false, Ordering::SeqCst);
        for channel in self.channels() {
            channel.closed_by_app.store(true, Ordering::SeqCst);
        }
        self.fire(ShutdownSignal::by_application("connection closed"));
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct FakeBroker {
    dial_failures: AtomicU32,
    broken_dials: AtomicU32,
    dials: AtomicU32,
    connections: Mutex<Vec<Arc<FakeConnection>>>,
}

impl FakeBroker {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(FakeBroker::default())
    }

    /// The next `count` dials are refused.
    pub(crate) fn refuse_dials(&self, count: u32) {
        self.dial_failures.store(count, Ordering::SeqCst);
    }

    /// The next `count` dialed connections refuse to open channels.
    pub(crate) fn break_channels_of_next_dials(&self, count: u32) {
        self.broken_dials.store(count, Ordering::SeqCst);
    }

    pub(crate) fn dial_count(&self) -> u32 {
        self.dials.load(Ordering::SeqCst)
    }

    pub(crate) fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    /// The `number`th connection dialed successfully, starting at 1.
    pub(crate) fn connection(&self, number: usize) -> Arc<FakeConnection> {
        self.connections.lock().unwrap()[number - 1].clone()
    }

    pub(crate) fn latest(&self) -> Arc<FakeConnection> {
        self.connections
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no connection was dialed")
    }
}

#[async_trait]
impl BrokerClient for FakeBroker {
    async fn dial(&self, _: &[Address]) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        self.dials.fetch_add(1, Ordering::SeqCst);

        let refused = self
            .dial_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(AmqpError::ConnectionError("connection refused".to_owned()));
        }

        let mut connections = self.connections.lock().unwrap();
        let connection = FakeConnection::new(connections.len() as u32 + 1);
        let broken = self
            .broken_dials
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        connection.fail_channel_creation(broken);
        connections.push(connection.clone());
        Ok(connection)
    }
}

/// Records every callback it receives.
#[derive(Default)]
pub(crate) struct RecordingConsumer {
    pub(crate) deliveries: Mutex<Vec<Vec<u8>>>,
    pub(crate) consume_oks: AtomicU32,
    pub(crate) shutdowns: AtomicU32,
}

#[async_trait]
impl Consumer for RecordingConsumer {
    async fn handle_delivery(&self, _: &str, delivery: Delivery) {
        self.deliveries.lock().unwrap().push(delivery.body);
    }

    async fn handle_consume_ok(&self, _: &str) {
        self.consume_oks.fetch_add(1, Ordering::SeqCst);
    }

    async fn handle_shutdown_signal(&self, _: &str, _: &ShutdownSignal) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

/// Records lifecycle events, and on every (re)connection the open state of the
/// gates of every channel of the connection.
#[derive(Default)]
pub(crate) struct RecordingListener {
    pub(crate) events: Mutex<Vec<String>>,
    pub(crate) gates_open_on_connect: Mutex<Vec<bool>>,
}

impl RecordingListener {
    pub(crate) fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub(crate) fn count(&self, event: &str) -> usize {
        self.events().iter().filter(|e| *e == event).count()
    }

    fn record(&self, event: &str) {
        self.events.lock().unwrap().push(event.to_owned());
    }

    fn record_gates(&self, connection: &HaConnection) {
        let mut gates = self.gates_open_on_connect.lock().unwrap();
        gates.extend(connection.channels().iter().map(|c| c.gate().is_open()));
    }
}

#[async_trait]
impl HaConnectionListener for RecordingListener {
    async fn on_connect(&self, connection: &HaConnection) {
        self.record_gates(connection);
        self.record("connect");
    }

    async fn on_connect_failure(&self, _: &HaConnection, _: &AmqpError) {
        self.record("connect_failure");
    }

    async fn on_disconnect(&self, _: &HaConnection, _: &ShutdownSignal) {
        self.record("disconnect");
    }

    async fn on_reconnection(&self, connection: &HaConnection) {
        self.record_gates(connection);
        self.record("reconnection");
    }

    async fn on_reconnect_failure(&self, _: &HaConnection, _: &AmqpError) {
        self.record("reconnect_failure");
    }
}
