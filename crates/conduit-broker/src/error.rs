//! Broker error types.
//!
//! Every public API in this crate reports failures through [`BrokerError`].
//! Only registration, producer-state, configuration and handler-resolution
//! errors are ever returned to callers.  The delivery-path variants
//! (`RoutingMiss`, `HandlerRejected`, `ConsumerFault`, `DeliveryTimeout`,
//! `ComponentUnavailable`) are built for logging and for drop events; a
//! producer never sees them because `send` is best-effort.

/// Unified error type for the Conduit broker.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    // -- Registry errors ----------------------------------------------------
    /// An endpoint could not be registered (blank id, duplicate id, or the
    /// dispatcher has been shut down).
    #[error("cannot register endpoint `{endpoint_id}`: {reason}")]
    Registration { endpoint_id: String, reason: String },

    /// `send` or `create_message` was called after the endpoint was
    /// unregistered.
    #[error("producer for endpoint `{endpoint_id}` is closed")]
    ProducerClosed { endpoint_id: String },

    // -- Delivery errors (logged, never returned from send) ------------------
    /// No route matched a message that carried no destination.
    #[error("no route from `{endpoint_id}` matched message {message_id}")]
    RoutingMiss { endpoint_id: String, message_id: u64 },

    /// A pre- or post-handler vetoed the message.
    #[error("handler `{handler_id}` on `{endpoint_id}` rejected message {message_id}")]
    HandlerRejected {
        endpoint_id: String,
        handler_id: String,
        message_id: u64,
    },

    /// The hosted component failed while consuming a message.
    #[error("component behind `{endpoint_id}` failed on message {message_id}: {reason}")]
    ConsumerFault {
        endpoint_id: String,
        message_id: u64,
        reason: String,
    },

    /// A parked message aged out before its destination registered.
    #[error("message {message_id} to `{destination}` timed out waiting for registration")]
    DeliveryTimeout { destination: String, message_id: u64 },

    /// The service locator could not resolve the component behind an
    /// endpoint, or it lacks the capability the endpoint role requires.
    #[error("component behind `{endpoint_id}` is unavailable")]
    ComponentUnavailable { endpoint_id: String },

    // -- Handler pool errors ------------------------------------------------
    /// A handler id is not known to the handler pool.
    #[error("handler not found: {handler_id}")]
    HandlerNotFound { handler_id: String },

    // -- Routing / configuration --------------------------------------------
    /// A route filter expression could not be parsed.
    #[error("invalid filter `{filter}`: {reason}")]
    InvalidFilter { filter: String, reason: String },

    /// Configuration is structurally valid TOML but semantically wrong.
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    // -- Runtime ------------------------------------------------------------
    /// The worker pool has been shut down and will not accept new jobs.
    #[error("worker pool is shut down")]
    PoolShutdown,

    /// The broker was started outside a tokio runtime.
    #[error("runtime error: {0}")]
    Runtime(String),
}

/// Convenience alias used throughout the broker crate.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Error type returned by hosted components.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result of a component callback.
pub type ComponentResult = std::result::Result<(), BoxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_error_names_endpoint() {
        let err = BrokerError::Registration {
            endpoint_id: "orders".into(),
            reason: "id already bound".into(),
        };
        assert_eq!(
            err.to_string(),
            "cannot register endpoint `orders`: id already bound"
        );
    }

    #[test]
    fn timeout_error_display() {
        let err = BrokerError::DeliveryTimeout {
            destination: "B".into(),
            message_id: 7,
        };
        assert!(err.to_string().contains("message 7 to `B`"));
    }

    #[test]
    fn toml_error_converts() {
        let parse = toml::from_str::<toml::Value>("= broken").unwrap_err();
        let err: BrokerError = parse.into();
        assert!(matches!(err, BrokerError::Toml(_)));
    }
}
