// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Operation Retry Strategies
//!
//! A retry strategy is consulted by an HA channel every time an operation fails
//! with a recoverable error. It decides whether the operation is invoked again and
//! may wait before answering, either by sleeping or by parking on the channel's
//! connection gate until a reconnection completes.
//!
//! One strategy instance is normally shared by every channel of a connection, so
//! implementations keep no per-operation state: everything they need arrives as
//! arguments.

use crate::{errors::AmqpError, gate::Gate};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tracing::{debug, warn};

/// Default number of invocations for [`BoundedSleepRetry`] (one retry).
pub const DEFAULT_MAX_OPERATION_INVOCATIONS: u32 = 2;
/// Default sleep between invocations for [`BoundedSleepRetry`].
pub const DEFAULT_OPERATION_RETRY_SLEEP: Duration = Duration::from_secs(10);

/// Decides whether a failed operation should be invoked again.
#[async_trait]
pub trait RetryStrategy: Send + Sync {
    /// Called after every recoverable failure.
    ///
    /// # Parameters
    /// * `error` - The failure of the last invocation
    /// * `attempt` - The number of invocations made so far, starting at 1
    /// * `gate` - The channel's connection gate, opened once the channel is live again
    ///
    /// # Returns
    /// true to invoke the operation again, false to propagate `error`
    async fn should_retry(&self, error: &AmqpError, attempt: u32, gate: &Gate) -> bool;

    /// Human-readable name used in logs.
    fn name(&self) -> &str;
}

/// Never retries: the first failure is propagated.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverRetry;

#[async_trait]
impl RetryStrategy for NeverRetry {
    async fn should_retry(&self, _: &AmqpError, _: u32, _: &Gate) -> bool {
        false
    }

    fn name(&self) -> &str {
        "never"
    }
}

/// Always retries immediately.
///
/// The task yields to the runtime before every new attempt so that a tight retry
/// loop cannot starve the reconnection task it is waiting for.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysRetry;

#[async_trait]
impl RetryStrategy for AlwaysRetry {
    async fn should_retry(&self, _: &AmqpError, _: u32, _: &Gate) -> bool {
        tokio::task::yield_now().await;
        true
    }

    fn name(&self) -> &str {
        "always"
    }
}

/// Parks the caller on the connection gate, then retries.
///
/// Without a timeout the caller waits until the channel is live again. With a
/// timeout the strategy retries even when the gate is still closed, unless a hard
/// cap on invocations was configured and has been reached.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockingRetry {
    timeout: Option<Duration>,
    max_attempts: Option<u32>,
}

impl BlockingRetry {
    /// Waits on the gate without a time limit and never gives up.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bounds each wait on the gate.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Gives up once `max_attempts` invocations have failed.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

#[async_trait]
impl RetryStrategy for BlockingRetry {
    async fn should_retry(&self, error: &AmqpError, attempt: u32, gate: &Gate) -> bool {
        if let Some(max) = self.max_attempts {
            if attempt >= max {
                debug!(attempt, max, "max number of operation invocations reached, not retrying");
                return false;
            }
        }

        debug!(
            error = error.to_string(),
            timeout = ?self.timeout,
            "waiting for connection gate to open"
        );

        let opened = gate.wait_until_open(self.timeout).await;
        if !opened {
            warn!(attempt, "timed out waiting for the connection gate, retrying anyway");
        }

        debug!(opened, "waited for connection gate");

        true
    }

    fn name(&self) -> &str {
        "blocking"
    }
}

/// Retries up to a fixed number of invocations, sleeping between them.
///
/// Does not look at the gate at all.
#[derive(Debug, Clone, Copy)]
pub struct BoundedSleepRetry {
    max_attempts: u32,
    sleep: Duration,
}

impl BoundedSleepRetry {
    /// Creates the strategy.
    ///
    /// # Parameters
    /// * `max_attempts` - Total number of invocations, must be 2 or greater
    /// * `sleep` - Pause before every retry, zero retries immediately
    pub fn new(max_attempts: u32, sleep: Duration) -> Result<Self, AmqpError> {
        if max_attempts < 2 {
            return Err(AmqpError::InvalidConfiguration(
                "max operation invocations must be 2 or greater, otherwise use a simpler strategy"
                    .to_owned(),
            ));
        }

        Ok(BoundedSleepRetry {
            max_attempts,
            sleep,
        })
    }

    /// Attempts made before the last error is returned, the first one included.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

impl Default for BoundedSleepRetry {
    fn default() -> Self {
        BoundedSleepRetry {
            max_attempts: DEFAULT_MAX_OPERATION_INVOCATIONS,
            sleep: DEFAULT_OPERATION_RETRY_SLEEP,
        }
    }
}

#[async_trait]
impl RetryStrategy for BoundedSleepRetry {
    async fn should_retry(&self, error: &AmqpError, attempt: u32, _: &Gate) -> bool {
        debug!(
            attempt,
            max = self.max_attempts,
            error = error.to_string(),
            "operation invocation failed"
        );

        if attempt >= self.max_attempts {
            debug!(max = self.max_attempts, "max number of operation invocations reached, not retrying");
            return false;
        }

        if !self.sleep.is_zero() {
            debug!(sleep = ?self.sleep, "sleeping before next operation invocation");
            tokio::time::sleep(self.sleep).await;
        }

        true
    }

    fn name(&self) -> &str {
        "bounded_sleep"
    }
}

/// Strategy selection as it appears in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum RetryPolicy {
    Never,
    Always,
    Blocking {
        #[serde(default)]
        timeout_ms: Option<u64>,
        #[serde(default)]
        max_attempts: Option<u32>,
    },
    BoundedSleep {
        #[serde(default = "default_max_attempts")]
        max_attempts: u32,
        #[serde(default = "default_sleep_ms")]
        sleep_ms: u64,
    },
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_OPERATION_INVOCATIONS
}

fn default_sleep_ms() -> u64 {
    DEFAULT_OPERATION_RETRY_SLEEP.as_millis() as u64
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Blocking {
            timeout_ms: None,
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    /// Builds the shared strategy instance this policy describes.
    pub fn build(&self) -> Result<Arc<dyn RetryStrategy>, AmqpError> {
        match *self {
            RetryPolicy::Never => Ok(Arc::new(NeverRetry)),
            RetryPolicy::Always => Ok(Arc::new(AlwaysRetry)),
            RetryPolicy::Blocking {
                timeout_ms,
                max_attempts,
            } => {
                let mut strategy = BlockingRetry::new();
                if let Some(timeout) = timeout_ms {
                    strategy = strategy.with_timeout(Duration::from_millis(timeout));
                }
                if let Some(max) = max_attempts {
                    strategy = strategy.with_max_attempts(max);
                }
                Ok(Arc::new(strategy))
            }
            RetryPolicy::BoundedSleep {
                max_attempts,
                sleep_ms,
            } => Ok(Arc::new(BoundedSleepRetry::new(
                max_attempts,
                Duration::from_millis(sleep_ms),
            )?)),
        }
    }
}
