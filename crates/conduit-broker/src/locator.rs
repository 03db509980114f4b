//! Hosted components and how the broker finds them.
//!
//! The broker never owns application code directly.  A host registers an
//! endpoint with a [`ServiceHandle`] that names the component; the first time
//! the endpoint has to consume a message it asks a [`ServiceLocator`] to
//! resolve that handle into a [`ComponentRef`].
//!
//! Components expose one of two capabilities:
//!
//! - [`Consumer`] -- receives messages addressed to its endpoint.
//! - [`Processor`] -- transforms each message, which the endpoint then
//!   forwards onward through its own `send`.
//!
//! and may optionally implement [`Lifecycle`] to be started on activation.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::ComponentResult;
use crate::message::Message;

// ---------------------------------------------------------------------------
// Component contract
// ---------------------------------------------------------------------------

/// A component that receives messages.
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Handle one message.  The broker closes the message afterwards, so
    /// detach anything that must outlive the call.
    async fn on_message(&self, message: &mut Message) -> ComponentResult;
}

/// A component that transforms messages in flight.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Mutate the message in place.  On success the endpoint re-sends it; set
    /// `to` to pick the next hop, or leave it unset to use the route table.
    async fn process(&self, message: &mut Message) -> ComponentResult;
}

/// Optional start hook run once when an endpoint activates its component.
pub trait Lifecycle: Send + Sync {
    fn start(&self) -> ComponentResult;
}

/// Which capability an endpoint expects from its component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Consumer,
    Processor,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Consumer => write!(f, "consumer"),
            Self::Processor => write!(f, "processor"),
        }
    }
}

/// The capability a resolved component offers.
#[derive(Clone)]
pub enum Capability {
    Consumer(Arc<dyn Consumer>),
    Processor(Arc<dyn Processor>),
}

impl Capability {
    pub fn role(&self) -> Role {
        match self {
            Self::Consumer(_) => Role::Consumer,
            Self::Processor(_) => Role::Processor,
        }
    }
}

/// A resolved component.
#[derive(Clone)]
pub struct ComponentRef {
    capability: Capability,
    lifecycle: Option<Arc<dyn Lifecycle>>,
}

impl ComponentRef {
    pub fn consumer(consumer: Arc<dyn Consumer>) -> Self {
        Self {
            capability: Capability::Consumer(consumer),
            lifecycle: None,
        }
    }

    pub fn processor(processor: Arc<dyn Processor>) -> Self {
        Self {
            capability: Capability::Processor(processor),
            lifecycle: None,
        }
    }

    /// Attach a start hook.
    pub fn with_lifecycle(mut self, lifecycle: Arc<dyn Lifecycle>) -> Self {
        self.lifecycle = Some(lifecycle);
        self
    }

    pub fn capability(&self) -> &Capability {
        &self.capability
    }

    pub fn lifecycle(&self) -> Option<&Arc<dyn Lifecycle>> {
        self.lifecycle.as_ref()
    }
}

// ---------------------------------------------------------------------------
// Service handles
// ---------------------------------------------------------------------------

/// What the host hands the broker when registering an endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceHandle {
    service: String,
    role: Role,
    pre_handlers: Vec<String>,
    post_handlers: Vec<String>,
}

impl ServiceHandle {
    /// Handle for a consumer component.
    pub fn consumer(service: impl Into<String>) -> Self {
        Self::new(service, Role::Consumer)
    }

    /// Handle for a processor component.
    pub fn processor(service: impl Into<String>) -> Self {
        Self::new(service, Role::Processor)
    }

    fn new(service: impl Into<String>, role: Role) -> Self {
        Self {
            service: service.into(),
            role,
            pre_handlers: Vec::new(),
            post_handlers: Vec::new(),
        }
    }

    /// Pre-handler ids installed when the endpoint registers.
    pub fn with_pre_handlers<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.pre_handlers = ids.into_iter().map(Into::into).collect();
        self
    }

    /// Post-handler ids installed when the endpoint registers.
    pub fn with_post_handlers<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.post_handlers = ids.into_iter().map(Into::into).collect();
        self
    }

    /// Service name; unique per registered component.
    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn pre_handlers(&self) -> &[String] {
        &self.pre_handlers
    }

    pub fn post_handlers(&self) -> &[String] {
        &self.post_handlers
    }
}

// ---------------------------------------------------------------------------
// Locator
// ---------------------------------------------------------------------------

/// Resolves service handles into components.
pub trait ServiceLocator: Send + Sync {
    /// Look up the component behind `handle`.  `None` means it is not
    /// available (yet); the broker will ask again on the next message.
    fn resolve(&self, handle: &ServiceHandle) -> Option<ComponentRef>;

    /// Start a freshly resolved component if it has a [`Lifecycle`].  Start
    /// failures are logged and otherwise ignored.
    fn try_start(&self, component: &ComponentRef) {
        if let Some(lifecycle) = component.lifecycle() {
            if let Err(err) = lifecycle.start() {
                tracing::warn!(error = %err, "component failed to start");
            }
        }
    }
}

/// A [`ServiceLocator`] backed by an in-memory map of service names.
#[derive(Default)]
pub struct InMemoryLocator {
    services: DashMap<String, ComponentRef>,
}

impl InMemoryLocator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a component resolvable under `service`.
    pub fn register(&self, service: impl Into<String>, component: ComponentRef) {
        let service = service.into();
        tracing::debug!(service = %service, role = %component.capability().role(), "component registered");
        self.services.insert(service, component);
    }

    pub fn remove(&self, service: &str) -> bool {
        self.services.remove(service).is_some()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

impl ServiceLocator for InMemoryLocator {
    fn resolve(&self, handle: &ServiceHandle) -> Option<ComponentRef> {
        self.services
            .get(handle.service())
            .map(|entry| entry.value().clone())
    }
}
