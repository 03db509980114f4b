//! Conduit embedded message broker.
//!
//! Hosted components exchange [`Message`]s through named endpoints managed by
//! a [`MessageQueue`]:
//!
//! - **[`message`]** -- Pooled message carrier with string properties,
//!   identity-keyed storage and an optional attachment.
//! - **[`endpoint`]** -- Per-component proxy: producer state, pre/post
//!   handler chains and lazy component activation.
//! - **[`dispatcher`]** -- Endpoint registry plus dispatch, with deferred
//!   delivery to endpoints that register late.
//! - **[`timeout`]** -- One-shot cancellable notifiers driving the delivery
//!   window.
//! - **[`handler`]** -- Reference-counted pool of message interceptors.
//! - **[`router`]** / **[`filter`]** -- Property-filter routing for messages
//!   sent without a destination.
//! - **[`locator`]** -- Component contract and service resolution.
//! - **[`pool`]** -- Worker pool running consumption off the sender's path.
//! - **[`events`]** -- Broadcast bus reporting registry changes and message
//!   outcomes.
//! - **[`config`]** / **[`telemetry`]** / **[`error`]** -- Configuration,
//!   tracing setup and the unified error type.
//!
//! All public types are `Send + Sync` and expect a tokio runtime.

pub mod config;
pub mod dispatcher;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod filter;
pub mod handler;
pub mod locator;
pub mod message;
pub mod pool;
pub mod router;
pub mod telemetry;
pub mod timeout;

pub use config::{BrokerConfig, RouteConfig};
pub use dispatcher::MessageQueue;
pub use endpoint::{ActivationState, Endpoint, Producer, ProducerState};
pub use error::{BoxError, BrokerError, ComponentResult, Result};
pub use events::{BrokerEvent, DropReason, EventBus};
pub use filter::Filter;
pub use handler::{HandlerChain, HandlerFactory, HandlerPool, MessageHandler};
pub use locator::{
    Capability, ComponentRef, Consumer, InMemoryLocator, Lifecycle, Processor, Role,
    ServiceHandle, ServiceLocator,
};
pub use message::{Closeable, Destination, Message, Properties, StorageKey};
pub use pool::WorkerPool;
pub use router::{RouteTable, Router};
pub use timeout::{Notifier, NotifierState, TimeoutService};
