//! Endpoints: the broker-side proxy for one hosted component.
//!
//! An [`Endpoint`] is both a producer and a consumer:
//!
//! - **Producer side** -- the component creates messages and sends them
//!   through its [`Producer`] handle.  `send` stamps `from`, runs the
//!   post-handler chain, resolves `to` through the route table when unset
//!   and hands the message to the dispatcher.
//! - **Consumer side** -- the dispatcher schedules [`Endpoint::consume`] on
//!   the worker pool.  It runs the pre-handler chain, clears `to` and invokes
//!   the component.
//!
//! # State machines
//!
//! ```text
//! Producer:    Open --------unbind--------> Closed
//! Activation:  Uninitialized --first use--> Initialized
//! ```
//!
//! Both are one-way.  A closed producer fails `send` and `create_message`
//! with [`BrokerError::ProducerClosed`].  Activation resolves the component
//! through the [`ServiceLocator`] at most once; after that reads are
//! lock-free.
//!
//! # Processors
//!
//! An endpoint registered with [`Role::Processor`] hands each message to
//! [`Processor::process`] and then re-sends the same message through its own
//! `send`, so the transformed message is routed onward from this endpoint.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use futures::FutureExt;
use serde::{Deserialize, Serialize};

use crate::dispatcher::{QueueInner, Shared};
use crate::error::{BrokerError, Result};
use crate::events::{BrokerEvent, DropReason};
use crate::handler::{HandlerChain, HandlerPool};
use crate::locator::{Capability, ComponentRef, Role, ServiceHandle, ServiceLocator};
use crate::message::Message;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Whether an endpoint may still send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProducerState {
    Open,
    Closed,
}

/// Whether an endpoint has resolved its component yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActivationState {
    Uninitialized,
    Initialized,
}

// ---------------------------------------------------------------------------
// Activation
// ---------------------------------------------------------------------------

/// One-shot lazy resolution of the wrapped component.
///
/// The published value lives in a [`OnceLock`] so initialized reads never
/// lock.  The mutex only serializes the Uninitialized -> Initialized
/// transition; a failed resolution publishes nothing and is retried later.
#[derive(Default)]
struct Activation {
    resolved: OnceLock<ComponentRef>,
    transition: Mutex<()>,
}

impl Activation {
    fn state(&self) -> ActivationState {
        if self.resolved.get().is_some() {
            ActivationState::Initialized
        } else {
            ActivationState::Uninitialized
        }
    }

    fn activate(
        &self,
        endpoint_id: &str,
        handle: &ServiceHandle,
        locator: &dyn ServiceLocator,
    ) -> Option<&ComponentRef> {
        if let Some(component) = self.resolved.get() {
            return Some(component);
        }

        let _transition = self
            .transition
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(component) = self.resolved.get() {
            return Some(component);
        }

        let component = locator.resolve(handle)?;
        locator.try_start(&component);
        tracing::info!(
            endpoint_id = %endpoint_id,
            service = %handle.service(),
            role = %handle.role(),
            "component activated"
        );
        Some(self.resolved.get_or_init(|| component))
    }
}

// ---------------------------------------------------------------------------
// Handler chains
// ---------------------------------------------------------------------------

struct InstalledChain {
    ids: Vec<String>,
    handlers: HandlerChain,
}

impl InstalledChain {
    fn empty() -> Self {
        Self {
            ids: Vec::new(),
            handlers: Arc::from(Vec::new()),
        }
    }
}

/// Id of the first handler in `chain` that rejects the message.
fn run_chain(chain: &HandlerChain, message: &mut Message) -> Option<String> {
    chain
        .iter()
        .find(|(_, handler)| !handler.handle(message))
        .map(|(id, _)| id.clone())
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn panic_reason(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "component panicked".to_owned())
}

// ---------------------------------------------------------------------------
// Endpoint
// ---------------------------------------------------------------------------

/// Broker-side proxy for one registered component.
pub struct Endpoint {
    id: RwLock<String>,
    handle: ServiceHandle,
    open: AtomicBool,
    pre: RwLock<InstalledChain>,
    post: RwLock<InstalledChain>,
    activation: Activation,
    shared: Arc<Shared>,
    queue: Weak<QueueInner>,
}

impl Endpoint {
    pub(crate) fn new(
        id: String,
        handle: ServiceHandle,
        shared: Arc<Shared>,
        queue: Weak<QueueInner>,
    ) -> Self {
        Self {
            id: RwLock::new(id),
            handle,
            open: AtomicBool::new(true),
            pre: RwLock::new(InstalledChain::empty()),
            post: RwLock::new(InstalledChain::empty()),
            activation: Activation::default(),
            shared,
            queue,
        }
    }

    /// Current endpoint id.  It changes if the endpoint is rebound.
    pub fn id(&self) -> String {
        read(&self.id).clone()
    }

    pub fn handle(&self) -> &ServiceHandle {
        &self.handle
    }

    pub fn role(&self) -> Role {
        self.handle.role()
    }

    pub fn producer_state(&self) -> ProducerState {
        if self.open.load(Ordering::Acquire) {
            ProducerState::Open
        } else {
            ProducerState::Closed
        }
    }

    pub fn activation_state(&self) -> ActivationState {
        self.activation.state()
    }

    pub fn pre_handler_ids(&self) -> Vec<String> {
        read(&self.pre).ids.clone()
    }

    pub fn post_handler_ids(&self) -> Vec<String> {
        read(&self.post).ids.clone()
    }

    // -- Producer side ------------------------------------------------------

    /// Obtain a fresh message to fill and send.
    pub fn create_message(&self) -> Result<Message> {
        if self.producer_state() == ProducerState::Closed {
            return Err(BrokerError::ProducerClosed {
                endpoint_id: self.id(),
            });
        }
        Ok(Message::acquire())
    }

    /// Send a message from this endpoint.
    ///
    /// Returns an error only if the producer is closed.  Every other failure
    /// (handler veto, no route, destination never registering) drops the
    /// message and is reported through logs and [`BrokerEvent`]s.
    pub fn send(&self, mut message: Message) -> Result<()> {
        let id = self.id();

        if self.producer_state() == ProducerState::Closed {
            tracing::debug!(endpoint_id = %id, message_id = message.id(), "send on closed producer");
            self.publish_drop(message.id(), &id, DropReason::ProducerClosed);
            message.close();
            return Err(BrokerError::ProducerClosed { endpoint_id: id });
        }

        message.set_from(id.as_str());

        let chain = read(&self.post).handlers.clone();
        if let Some(handler_id) = run_chain(&chain, &mut message) {
            self.reject(&id, &handler_id, message);
            return Ok(());
        }

        if message.destination().is_none() {
            match self.shared.routes.route(&id, &message) {
                Some(destination) => message.set_to(destination),
                None => {
                    let err = BrokerError::RoutingMiss {
                        endpoint_id: id.clone(),
                        message_id: message.id(),
                    };
                    tracing::warn!(
                        endpoint_id = %id,
                        message_id = message.id(),
                        properties = ?message.properties(),
                        "{err}"
                    );
                    self.publish_drop(message.id(), &id, DropReason::RoutingMiss);
                    message.close();
                    return Ok(());
                }
            }
        }

        match self.queue.upgrade() {
            Some(queue) => queue.dispatch(message),
            None => {
                tracing::warn!(endpoint_id = %id, message_id = message.id(), "dispatcher is gone, message dropped");
                message.close();
            }
        }
        Ok(())
    }

    // -- Consumer side ------------------------------------------------------

    /// Deliver a message to the wrapped component.  Only the dispatcher
    /// calls this, from a pool worker.
    pub(crate) async fn consume(self: Arc<Self>, mut message: Message) {
        let id = self.id();

        let chain = read(&self.pre).handlers.clone();
        if let Some(handler_id) = run_chain(&chain, &mut message) {
            self.reject(&id, &handler_id, message);
            return;
        }

        message.clear_to();

        let component =
            self.activation
                .activate(&id, &self.handle, self.shared.locator.as_ref());
        let capability = match component.map(ComponentRef::capability) {
            Some(capability) if capability.role() == self.handle.role() => capability,
            _ => {
                let err = BrokerError::ComponentUnavailable {
                    endpoint_id: id.clone(),
                };
                tracing::error!(
                    endpoint_id = %id,
                    service = %self.handle.service(),
                    message_id = message.id(),
                    "{err}"
                );
                self.publish_drop(message.id(), &id, DropReason::ComponentUnavailable);
                message.close();
                return;
            }
        };

        let message_id = message.id();
        let outcome = match capability {
            Capability::Consumer(consumer) => {
                AssertUnwindSafe(consumer.on_message(&mut message))
                    .catch_unwind()
                    .await
            }
            Capability::Processor(processor) => {
                AssertUnwindSafe(processor.process(&mut message))
                    .catch_unwind()
                    .await
            }
        };

        let fault = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(err.to_string()),
            Err(payload) => Some(panic_reason(payload.as_ref())),
        };

        if let Some(reason) = fault {
            let err = BrokerError::ConsumerFault {
                endpoint_id: id.clone(),
                message_id,
                reason,
            };
            tracing::error!(
                endpoint_id = %id,
                message_id,
                properties = ?message.properties(),
                "{err}"
            );
            self.publish_drop(message_id, &id, DropReason::ConsumerFault);
            message.close();
            return;
        }

        tracing::trace!(endpoint_id = %id, message_id, "message consumed");
        self.shared
            .events
            .publish(BrokerEvent::delivered(&id, message_id));

        match capability {
            Capability::Consumer(_) => message.close(),
            Capability::Processor(_) => {
                if let Err(err) = self.send(message) {
                    tracing::debug!(endpoint_id = %id, message_id, error = %err, "processed message not forwarded");
                }
            }
        }
    }

    // -- Handler chains -----------------------------------------------------

    /// Replace the pre-handler chain.  Unknown ids leave the current chain in
    /// place and return [`BrokerError::HandlerNotFound`]; an unbound endpoint
    /// refuses with [`BrokerError::ProducerClosed`].
    pub fn set_pre_handlers<I, S>(&self, ids: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ids = ids.into_iter().map(Into::into).collect();
        self.install(&self.pre, &self.shared.pre_handlers, ids, "pre")
    }

    /// Replace the post-handler chain.
    pub fn set_post_handlers<I, S>(&self, ids: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ids = ids.into_iter().map(Into::into).collect();
        self.install(&self.post, &self.shared.post_handlers, ids, "post")
    }

    fn install(
        &self,
        slot: &RwLock<InstalledChain>,
        pool: &HandlerPool,
        ids: Vec<String>,
        stage: &'static str,
    ) -> Result<()> {
        let closed = || BrokerError::ProducerClosed {
            endpoint_id: self.id(),
        };
        if self.producer_state() == ProducerState::Closed {
            return Err(closed());
        }
        if read(slot).ids == ids {
            return Ok(());
        }

        let handlers = pool.acquire(&ids)?;
        tracing::debug!(endpoint_id = %self.id(), stage, handlers = ?ids, "handler chain installed");
        let previous = std::mem::replace(&mut *write(slot), InstalledChain { ids, handlers });
        pool.release(&previous.ids);

        // Unbound while installing: whatever is in the slot now is ours to
        // give back, since the unbind may already have emptied it.
        if self.producer_state() == ProducerState::Closed {
            let stale = std::mem::replace(&mut *write(slot), InstalledChain::empty());
            pool.release(&stale.ids);
            return Err(closed());
        }
        Ok(())
    }

    // -- Registry hooks -----------------------------------------------------

    pub(crate) fn set_id(&self, id: String) {
        *write(&self.id) = id;
    }

    /// One-way transition to [`ProducerState::Closed`].
    pub(crate) fn close_producer(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            tracing::debug!(endpoint_id = %self.id(), "producer closed");
        }
    }

    /// Give every handler reference back to the pools.
    pub(crate) fn release_handlers(&self) {
        let pre = std::mem::replace(&mut *write(&self.pre), InstalledChain::empty());
        self.shared.pre_handlers.release(&pre.ids);
        let post = std::mem::replace(&mut *write(&self.post), InstalledChain::empty());
        self.shared.post_handlers.release(&post.ids);
    }

    // -- Helpers ------------------------------------------------------------

    fn reject(&self, endpoint_id: &str, handler_id: &str, message: Message) {
        let err = BrokerError::HandlerRejected {
            endpoint_id: endpoint_id.to_owned(),
            handler_id: handler_id.to_owned(),
            message_id: message.id(),
        };
        tracing::warn!(
            endpoint_id = %endpoint_id,
            handler_id = %handler_id,
            message_id = message.id(),
            properties = ?message.properties(),
            "{err}"
        );
        self.publish_drop(message.id(), endpoint_id, DropReason::HandlerRejected);
        message.close();
    }

    fn publish_drop(&self, message_id: u64, endpoint_id: &str, reason: DropReason) {
        self.shared
            .events
            .publish(BrokerEvent::dropped(message_id, Some(endpoint_id), reason));
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.id())
            .field("service", &self.handle.service())
            .field("role", &self.handle.role())
            .field("producer", &self.producer_state())
            .field("activation", &self.activation_state())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Producer
// ---------------------------------------------------------------------------

/// The send capability handed to a component when its endpoint registers.
#[derive(Clone, Debug)]
pub struct Producer {
    endpoint: Arc<Endpoint>,
}

impl Producer {
    pub(crate) fn new(endpoint: Arc<Endpoint>) -> Self {
        Self { endpoint }
    }

    pub fn endpoint_id(&self) -> String {
        self.endpoint.id()
    }

    pub fn state(&self) -> ProducerState {
        self.endpoint.producer_state()
    }

    /// See [`Endpoint::create_message`].
    pub fn create_message(&self) -> Result<Message> {
        self.endpoint.create_message()
    }

    /// See [`Endpoint::send`].
    pub fn send(&self, message: Message) -> Result<()> {
        self.endpoint.send(message)
    }

    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }
}
