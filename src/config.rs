// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Configuration
//!
//! Settings of the HA layer, loaded with figment from built-in defaults overridden
//! by `AMQP_HA_`-prefixed environment variables. Nested keys are separated by a
//! double underscore:
//!
//! ```text
//! AMQP_HA_APP_NAME=billing
//! AMQP_HA_RABBITMQ__HOST=rabbit-1,rabbit-2:5673
//! AMQP_HA_RECONNECTION_WAIT_MS=2000
//! AMQP_HA_RETRY__STRATEGY=bounded_sleep
//! AMQP_HA_RETRY__MAX_ATTEMPTS=3
//! ```

use crate::{
    broker::{Address, DEFAULT_AMQP_PORT},
    errors::AmqpError,
    retry::RetryPolicy,
};
use figment::{
    providers::{Env, Serialized},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error};

/// Prefix of the environment variables read by [`HaConfigs::from_env`].
pub const ENV_PREFIX: &str = "AMQP_HA_";

/// Broker credentials and location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RabbitMQConfigs {
    /// One host or a comma-separated list, each optionally with its own port
    pub host: String,
    /// Port used by hosts listed without one
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
}

impl Default for RabbitMQConfigs {
    fn default() -> Self {
        RabbitMQConfigs {
            host: "localhost".to_owned(),
            port: DEFAULT_AMQP_PORT,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: "".to_owned(),
        }
    }
}

impl RabbitMQConfigs {
    /// Parses `host` into the address list handed to the connection factory.
    pub fn addresses(&self) -> Result<Vec<Address>, AmqpError> {
        self.host
            .split(',')
            .map(str::trim)
            .filter(|host| !host.is_empty())
            .map(|host| {
                if host.contains(':') {
                    host.parse()
                } else {
                    Ok(Address::new(host, self.port))
                }
            })
            .collect()
    }
}

/// Settings of the HA layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HaConfigs {
    /// Reported to the broker as the connection name
    pub app_name: String,
    pub rabbitmq: RabbitMQConfigs,
    /// Wait between reconnection attempts
    pub reconnection_wait_ms: u64,
    pub retry: RetryPolicy,
    /// Channels opened by a listener container
    pub consumers: u16,
}

impl Default for HaConfigs {
    fn default() -> Self {
        HaConfigs {
            app_name: "rabbitmq-ha".to_owned(),
            rabbitmq: RabbitMQConfigs::default(),
            reconnection_wait_ms: 1000,
            retry: RetryPolicy::default(),
            consumers: 1,
        }
    }
}

impl HaConfigs {
    /// Loads the defaults overridden by the environment, then validates them.
    pub fn from_env() -> Result<Self, AmqpError> {
        let cfg: HaConfigs = Figment::new()
            .merge(Serialized::defaults(HaConfigs::default()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|err| {
                error!(error = err.to_string(), "failure to load configuration");
                AmqpError::InvalidConfiguration(err.to_string())
            })?;

        cfg.validate()?;
        debug!(app = cfg.app_name, "configuration loaded");
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), AmqpError> {
        if self.reconnection_wait_ms == 0 {
            return Err(AmqpError::InvalidConfiguration(
                "reconnection_wait_ms must be greater than zero".to_owned(),
            ));
        }

        if self.consumers == 0 {
            return Err(AmqpError::InvalidConfiguration(
                "consumers must be at least 1".to_owned(),
            ));
        }

        if self.rabbitmq.addresses()?.is_empty() {
            return Err(AmqpError::InvalidConfiguration(
                "no broker host configured".to_owned(),
            ));
        }

        self.retry.build().map(|_| ())
    }

    pub fn reconnection_wait(&self) -> Duration {
        Duration::from_millis(self.reconnection_wait_ms)
    }
}
