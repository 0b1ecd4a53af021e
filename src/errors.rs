// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the HA Layer
//!
//! This module provides the error taxonomy shared by every handle in the crate.
//! The `AmqpError` enum covers connection, channel and operation failures, and
//! `ShutdownSignal` describes why a connection or channel was torn down.
//!
//! The key decision made here is which failures are *recoverable*: only a shutdown
//! the application did not initiate (or a raw I/O failure) is retried or triggers a
//! reconnection. Everything else propagates to the caller immediately.

use std::fmt;
use thiserror::Error;

/// AMQP reply code sent by the broker when it forces a connection closed.
pub const CONNECTION_FORCED: u16 = 320;
/// AMQP reply code sent by the broker when it hits an internal error.
pub const INTERNAL_ERROR: u16 = 541;
/// AMQP reply code used for a normal, application-requested close.
pub const REPLY_SUCCESS: u16 = 200;

/// Describes the shutdown of a connection or a channel.
///
/// A signal is either initiated by the application (an explicit `close`) or by
/// the broker / network. Only the latter is ever recovered from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownSignal {
    pub initiated_by_application: bool,
    pub reply_code: u16,
    pub reply_text: String,
}

impl ShutdownSignal {
    /// Creates a signal for a shutdown the broker or the network caused.
    pub fn by_broker(reply_code: u16, reply_text: impl Into<String>) -> Self {
        ShutdownSignal {
            initiated_by_application: false,
            reply_code,
            reply_text: reply_text.into(),
        }
    }

    /// Creates a signal for a shutdown the application asked for.
    pub fn by_application(reply_text: impl Into<String>) -> Self {
        ShutdownSignal {
            initiated_by_application: true,
            reply_code: REPLY_SUCCESS,
            reply_text: reply_text.into(),
        }
    }

    /// Returns true when the shutdown can be recovered from by reconnecting.
    pub fn is_recoverable(&self) -> bool {
        !self.initiated_by_application
    }
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let initiator = if self.initiated_by_application {
            "application"
        } else {
            "broker"
        };

        write!(
            f,
            "{} initiated shutdown ({}: {})",
            initiator, self.reply_code, self.reply_text
        )
    }
}

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Each variant provides specific context about what operation failed. Use
/// [`AmqpError::is_recoverable`] to decide whether the failure is a connectivity
/// problem worth retrying.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect `{0}`")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel `{0}`")]
    ChannelError(String),

    /// The transport failed underneath a connection or channel
    #[error("i/o failure `{0}`")]
    IoError(String),

    /// The connection or channel was shut down
    #[error("{0}")]
    Shutdown(ShutdownSignal),

    /// The handle was explicitly closed by the application
    #[error("already closed `{0}`")]
    AlreadyClosed(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error cancelling a consumer
    #[error("failure to cancel consumer `{0}`")]
    CancelConsumerError(String),

    /// Error publishing a message
    #[error("failure to publish `{0}`")]
    PublishingError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error parsing a message payload
    #[error("failure to parse payload")]
    ParsePayloadError,

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// Configuration values that cannot be used
    #[error("invalid configuration `{0}`")]
    InvalidConfiguration(String),
}

impl AmqpError {
    /// Returns true for connectivity failures not caused by the application.
    ///
    /// Application-initiated shutdowns, already-closed handles and protocol or
    /// logic errors are never recoverable.
    pub fn is_recoverable(&self) -> bool {
        match self {
            AmqpError::IoError(_) => true,
            AmqpError::Shutdown(signal) => signal.is_recoverable(),
            _ => false,
        }
    }

    /// Returns the shutdown signal carried by this error, if any.
    pub fn shutdown_signal(&self) -> Option<&ShutdownSignal> {
        match self {
            AmqpError::Shutdown(signal) => Some(signal),
            _ => None,
        }
    }
}

impl From<ShutdownSignal> for AmqpError {
    fn from(signal: ShutdownSignal) -> Self {
        AmqpError::Shutdown(signal)
    }
}

/// Translates a lapin error into the crate's taxonomy.
///
/// `closed_by_app` tells whether the application already closed the resource the
/// error came from; state errors on such resources are application-initiated.
/// Errors that are not about connectivity are turned into the operation-specific
/// error built by `otherwise`.
pub(crate) fn from_lapin<F>(err: lapin::Error, closed_by_app: bool, otherwise: F) -> AmqpError
where
    F: FnOnce(String) -> AmqpError,
{
    match &err {
        lapin::Error::IOError(io) => AmqpError::IoError(io.to_string()),
        lapin::Error::MissingHeartbeatError => {
            ShutdownSignal::by_broker(CONNECTION_FORCED, err.to_string()).into()
        }
        lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidConnectionState(_) => {
            if closed_by_app {
                ShutdownSignal::by_application(err.to_string()).into()
            } else {
                ShutdownSignal::by_broker(CONNECTION_FORCED, err.to_string()).into()
            }
        }
        lapin::Error::ProtocolError(amqp) => {
            let code = u16::from(amqp.get_id());
            if code == CONNECTION_FORCED || code == INTERNAL_ERROR {
                ShutdownSignal::by_broker(code, err.to_string()).into()
            } else {
                otherwise(err.to_string())
            }
        }
        _ => otherwise(err.to_string()),
    }
}
