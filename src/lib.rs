// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;

#[cfg(test)]
mod testing;

pub mod amqp;
pub mod broker;
pub mod channel;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod container;
pub mod errors;
pub mod gate;
pub mod listener;
pub mod manager;
pub mod message;
pub mod publisher;
pub mod retry;
pub mod scheduler;
pub mod topology;
