//! Broker configuration.
//!
//! [`BrokerConfig`] controls the deferred-delivery window, the size of the
//! consumption pool and the initial route table.  Defaults come from the
//! [`Default`] implementation, individual fields can be overridden with the
//! builder-style `with_*` methods, and whole configurations load from TOML:
//!
//! ```toml
//! message_timeout_secs = 30
//! workers = 4
//! event_capacity = 256
//!
//! [[routes]]
//! from = "web"
//! filter = "(&(type=order)(region=eu))"
//! to = "orders-eu"
//!
//! [[routes]]
//! filter = "*"
//! to = "audit"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BrokerError, Result};
use crate::filter::Filter;
use crate::router::ANY_SOURCE;

/// Configuration for a [`MessageQueue`](crate::MessageQueue).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// How long a message addressed to an unregistered endpoint waits for
    /// that endpoint before it is dropped.
    ///
    /// Default: **30 s**.  Serialized in seconds; fractions are allowed.
    #[serde(rename = "message_timeout_secs", with = "duration_secs")]
    pub message_timeout: Duration,

    /// Number of worker tasks consuming messages.
    ///
    /// Default: **4**.
    pub workers: usize,

    /// Capacity of the broker event channel.
    ///
    /// Default: **256**.
    pub event_capacity: usize,

    /// Initial route rules, evaluated in order.
    pub routes: Vec<RouteConfig>,
}

/// One configured route rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Sending endpoint id, or `*` for every sender.
    #[serde(default = "any_source")]
    pub from: String,
    /// Filter expression over message properties.
    pub filter: String,
    /// Destination endpoint id.
    pub to: String,
}

fn any_source() -> String {
    ANY_SOURCE.to_owned()
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            message_timeout: Duration::from_secs(30),
            workers: 4,
            event_capacity: 256,
            routes: Vec::new(),
        }
    }
}

impl BrokerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a configuration from TOML text and validate it.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a TOML configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&text)?;
        tracing::info!(path = %path.display(), routes = config.routes.len(), "broker config loaded");
        Ok(config)
    }

    /// Check the configuration for values the broker cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.message_timeout.is_zero() {
            return Err(BrokerError::Config(
                "message_timeout_secs must be greater than zero".into(),
            ));
        }
        if self.workers == 0 {
            return Err(BrokerError::Config("workers must be at least 1".into()));
        }
        if self.event_capacity == 0 {
            return Err(BrokerError::Config(
                "event_capacity must be at least 1".into(),
            ));
        }
        for route in &self.routes {
            if route.to.trim().is_empty() {
                return Err(BrokerError::Config(format!(
                    "route with filter `{}` has no destination",
                    route.filter
                )));
            }
            Filter::parse(&route.filter)?;
        }
        Ok(())
    }

    /// Set the deferred-delivery window.
    pub fn with_message_timeout(mut self, timeout: Duration) -> Self {
        self.message_timeout = timeout;
        self
    }

    /// Set the number of consumption workers.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the event channel capacity.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Append a route rule.
    pub fn with_route(
        mut self,
        from: impl Into<String>,
        filter: impl Into<String>,
        to: impl Into<String>,
    ) -> Self {
        self.routes.push(RouteConfig {
            from: from.into(),
            filter: filter.into(),
            to: to.into(),
        });
        self
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    /// Whole seconds stay integers; anything finer is written as a float.
    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        if value.subsec_nanos() == 0 {
            serializer.serialize_u64(value.as_secs())
        } else {
            serializer.serialize_f64(value.as_secs_f64())
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs)
            .map_err(|e| D::Error::custom(format!("invalid duration {secs}: {e}")))
    }
}
