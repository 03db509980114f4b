//! The dispatcher: endpoint registry and deferred delivery.
//!
//! [`MessageQueue`] owns every registered [`Endpoint`], the route table, the
//! handler pools and the consumption [`WorkerPool`].
//!
//! # Dispatch
//!
//! 1. A message addressed to the drop sentinel is closed.
//! 2. If the destination is registered, the message is queued on the worker
//!    pool for consumption by that endpoint.
//! 3. Otherwise it is appended to the destination's pending list and a
//!    one-shot timeout [`Notifier`] is armed.  The registry is checked once
//!    more; if the destination appeared meanwhile and the notifier can still
//!    be cancelled, the message is taken back out and delivered.
//! 4. When the timeout fires, the message is removed from the list, logged
//!    and dropped.
//! 5. When an endpoint registers, its pending list is drained in FIFO order.
//!    Each entry whose notifier this thread cancels is delivered; an entry
//!    whose notifier cannot be cancelled belongs to the timer, which drops
//!    it.
//!
//! # Exactly once
//!
//! For a parked message, delivery and timeout are decided solely by the
//! notifier's cancel-vs-fire arbitration.  The winner takes the message out
//! of the shared [`PendingDelivery`] slot; the loser never touches it.  No
//! lock is held across the two paths.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::runtime::Handle;

use crate::config::BrokerConfig;
use crate::endpoint::{Endpoint, Producer};
use crate::error::{BrokerError, Result};
use crate::events::{BrokerEvent, DropReason, EventBus};
use crate::handler::{HandlerChain, HandlerFactory, HandlerPool};
use crate::locator::{ServiceHandle, ServiceLocator};
use crate::message::{Destination, Message};
use crate::pool::WorkerPool;
use crate::router::RouteTable;
use crate::timeout::{Notifier, TimeoutService};

// ---------------------------------------------------------------------------
// Internal types
// ---------------------------------------------------------------------------

/// Collaborators every endpoint needs.
pub(crate) struct Shared {
    pub(crate) routes: RouteTable,
    pub(crate) pre_handlers: HandlerPool,
    pub(crate) post_handlers: HandlerPool,
    pub(crate) events: EventBus,
    pub(crate) locator: Arc<dyn ServiceLocator>,
}

/// A parked message.  Whoever wins the notifier race takes the message.
pub(crate) struct PendingDelivery {
    seq: u64,
    destination: String,
    message: Mutex<Option<Message>>,
}

impl PendingDelivery {
    fn take(&self) -> Option<Message> {
        self.message
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

struct PendingEntry {
    delivery: Arc<PendingDelivery>,
    notifier: Notifier<Arc<PendingDelivery>>,
}

pub(crate) struct QueueInner {
    endpoints: DashMap<String, Arc<Endpoint>>,
    /// Service name -> endpoint id.
    services: DashMap<String, String>,
    pending: DashMap<String, VecDeque<PendingEntry>>,
    timeouts: TimeoutService<Arc<PendingDelivery>>,
    workers: WorkerPool,
    shared: Arc<Shared>,
    message_timeout: Duration,
    next_seq: AtomicU64,
    closed: AtomicBool,
    /// Serializes registry writes so `endpoints` and `services` change
    /// together.  Lookups go straight to the maps.
    registry: Mutex<()>,
}

// ---------------------------------------------------------------------------
// MessageQueue
// ---------------------------------------------------------------------------

/// The broker's dispatcher and endpoint registry.
///
/// Cheaply cloneable (`Arc`-backed) and `Send + Sync`.
#[derive(Clone)]
pub struct MessageQueue {
    inner: Arc<QueueInner>,
}

impl MessageQueue {
    /// Start a broker on the current tokio runtime.
    ///
    /// Fails with [`BrokerError::Runtime`] outside a runtime, or with a
    /// configuration error if `config` does not validate.
    pub fn start(config: BrokerConfig, locator: Arc<dyn ServiceLocator>) -> Result<Self> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|e| BrokerError::Runtime(e.to_string()))?;

        let shared = Arc::new(Shared {
            routes: RouteTable::from_config(&config.routes)?,
            pre_handlers: HandlerPool::new(),
            post_handlers: HandlerPool::new(),
            events: EventBus::new(config.event_capacity),
            locator,
        });
        let workers = WorkerPool::start(config.workers, &runtime);

        let inner = Arc::new_cyclic(|weak: &Weak<QueueInner>| {
            let weak = weak.clone();
            QueueInner {
                endpoints: DashMap::new(),
                services: DashMap::new(),
                pending: DashMap::new(),
                timeouts: TimeoutService::new(runtime, move |delivery: Arc<PendingDelivery>| {
                    if let Some(queue) = weak.upgrade() {
                        queue.expire(&delivery);
                    }
                }),
                workers,
                shared,
                message_timeout: config.message_timeout,
                next_seq: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                registry: Mutex::new(()),
            }
        });

        tracing::info!(
            workers = config.workers,
            message_timeout_ms = config.message_timeout.as_millis() as u64,
            routes = config.routes.len(),
            "message queue started"
        );
        Ok(Self { inner })
    }

    // -- Registry -----------------------------------------------------------

    /// Register an endpoint under `id` for the component behind `handle`.
    ///
    /// Rejects blank ids, ids that are already bound and services that are
    /// already registered; the existing registration is left untouched.
    /// Messages parked for `id` are woken.  The returned [`Producer`] is the
    /// component's send capability.
    pub fn bind(&self, id: &str, handle: ServiceHandle) -> Result<Producer> {
        let id = id.trim();
        if id.is_empty() {
            return Err(self.registration_error(id, "endpoint id is blank"));
        }

        let service = handle.service().to_owned();
        let pre = handle.pre_handlers().to_vec();
        let post = handle.post_handlers().to_vec();
        let endpoint = Arc::new(Endpoint::new(
            id.to_owned(),
            handle,
            Arc::clone(&self.inner.shared),
            Arc::downgrade(&self.inner),
        ));

        // Chains go in before the endpoint becomes visible.
        endpoint.set_pre_handlers(pre)?;
        if let Err(err) = endpoint.set_post_handlers(post) {
            endpoint.release_handlers();
            return Err(err);
        }

        {
            let _registry = self.inner.lock_registry();
            let conflict = if self.inner.closed.load(Ordering::Acquire) {
                Some("message queue is shut down".to_owned())
            } else if let Some(existing) = self.inner.services.get(&service) {
                Some(format!("service is already bound as `{}`", existing.value()))
            } else if self.inner.endpoints.contains_key(id) {
                Some("id is already bound".to_owned())
            } else {
                None
            };
            if let Some(reason) = conflict {
                endpoint.release_handlers();
                return Err(self.registration_error(id, &reason));
            }
            self.inner
                .endpoints
                .insert(id.to_owned(), Arc::clone(&endpoint));
            self.inner.services.insert(service.clone(), id.to_owned());
        }

        tracing::info!(endpoint_id = %id, service = %service, role = %endpoint.role(), "endpoint bound");
        self.inner.shared.events.publish(BrokerEvent::EndpointBound {
            endpoint_id: id.to_owned(),
            service,
            timestamp: chrono::Utc::now(),
        });

        self.inner.wake(id);
        Ok(Producer::new(endpoint))
    }

    /// Unregister the endpoint bound for `handle` and close its producer.
    ///
    /// Returns `false` if the handle was not bound.
    pub fn unbind(&self, handle: &ServiceHandle) -> bool {
        let (id, endpoint) = {
            let _registry = self.inner.lock_registry();
            let Some((_, id)) = self.inner.services.remove(handle.service()) else {
                tracing::debug!(service = %handle.service(), "unbind of unknown service ignored");
                return false;
            };
            let Some((_, endpoint)) = self.inner.endpoints.remove(&id) else {
                return false;
            };
            (id, endpoint)
        };

        endpoint.close_producer();
        endpoint.release_handlers();

        tracing::info!(endpoint_id = %id, service = %handle.service(), "endpoint unbound");
        self.inner.shared.events.publish(BrokerEvent::EndpointUnbound {
            endpoint_id: id,
            timestamp: chrono::Utc::now(),
        });
        true
    }

    /// Move an already registered endpoint to `new_id`.
    ///
    /// If `new_id` is blank or taken, the registry is left unchanged and a
    /// registration error is returned.
    pub fn rebind(&self, handle: &ServiceHandle, new_id: &str) -> Result<()> {
        let new_id = new_id.trim();
        if new_id.is_empty() {
            return Err(self.registration_error(new_id, "endpoint id is blank"));
        }

        let old_id = {
            let _registry = self.inner.lock_registry();
            let old_id = match self.inner.services.get(handle.service()) {
                Some(entry) => entry.value().clone(),
                None => return Err(self.registration_error(new_id, "service is not bound")),
            };
            if old_id == new_id {
                return Ok(());
            }
            if self.inner.endpoints.contains_key(new_id) {
                return Err(self.registration_error(new_id, "id is already bound"));
            }
            let Some((_, endpoint)) = self.inner.endpoints.remove(&old_id) else {
                return Err(self.registration_error(new_id, "service is not bound"));
            };
            endpoint.set_id(new_id.to_owned());
            self.inner.endpoints.insert(new_id.to_owned(), endpoint);
            self.inner
                .services
                .insert(handle.service().to_owned(), new_id.to_owned());
            old_id
        };

        tracing::info!(old_id = %old_id, new_id = %new_id, "endpoint rebound");
        self.inner.shared.events.publish(BrokerEvent::EndpointRebound {
            old_id,
            new_id: new_id.to_owned(),
            timestamp: chrono::Utc::now(),
        });

        self.inner.wake(new_id);
        Ok(())
    }

    fn registration_error(&self, id: &str, reason: &str) -> BrokerError {
        let err = BrokerError::Registration {
            endpoint_id: id.to_owned(),
            reason: reason.to_owned(),
        };
        tracing::error!(endpoint_id = %id, "{err}");
        err
    }

    // -- Dispatch -----------------------------------------------------------

    /// Route an addressed message to its destination.  Never blocks and
    /// never fails from the caller's point of view.
    pub fn dispatch(&self, message: Message) {
        self.inner.dispatch(message);
    }

    // -- Handler pools ------------------------------------------------------

    pub fn register_pre_handler(&self, id: impl Into<String>, factory: HandlerFactory) {
        self.inner.shared.pre_handlers.register(id, factory);
    }

    pub fn register_post_handler(&self, id: impl Into<String>, factory: HandlerFactory) {
        self.inner.shared.post_handlers.register(id, factory);
    }

    /// Acquire pre-handler instances for `ids`.  Pair with
    /// [`release_pre_handlers`](Self::release_pre_handlers).
    pub fn pre_handlers(&self, ids: &[String]) -> Result<HandlerChain> {
        self.inner.shared.pre_handlers.acquire(ids)
    }

    /// Acquire post-handler instances for `ids`.
    pub fn post_handlers(&self, ids: &[String]) -> Result<HandlerChain> {
        self.inner.shared.post_handlers.acquire(ids)
    }

    pub fn release_pre_handlers(&self, ids: &[String]) {
        self.inner.shared.pre_handlers.release(ids);
    }

    pub fn release_post_handlers(&self, ids: &[String]) {
        self.inner.shared.post_handlers.release(ids);
    }

    pub fn pre_handler_pool(&self) -> &HandlerPool {
        &self.inner.shared.pre_handlers
    }

    pub fn post_handler_pool(&self) -> &HandlerPool {
        &self.inner.shared.post_handlers
    }

    // -- Introspection ------------------------------------------------------

    pub fn routes(&self) -> &RouteTable {
        &self.inner.shared.routes
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.shared.events
    }

    pub fn endpoint(&self, id: &str) -> Option<Arc<Endpoint>> {
        self.inner.lookup(id)
    }

    /// Producer capability of a registered endpoint.
    pub fn producer(&self, id: &str) -> Option<Producer> {
        self.inner.lookup(id).map(Producer::new)
    }

    pub fn is_bound(&self, id: &str) -> bool {
        self.inner.endpoints.contains_key(id)
    }

    pub fn endpoint_ids(&self) -> Vec<String> {
        self.inner
            .endpoints
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Number of messages parked for `destination`.
    pub fn pending_count(&self, destination: &str) -> usize {
        self.inner
            .pending
            .get(destination)
            .map(|list| list.len())
            .unwrap_or(0)
    }

    pub fn message_timeout(&self) -> Duration {
        self.inner.message_timeout
    }

    // -- Shutdown -----------------------------------------------------------

    /// Close every producer, drop every parked message this call can still
    /// claim from its timer, and stop the worker pool after it drains.
    pub fn shutdown(&self) {
        {
            let _registry = self.inner.lock_registry();
            if self.inner.closed.swap(true, Ordering::AcqRel) {
                return;
            }
            for entry in self.inner.endpoints.iter() {
                entry.value().close_producer();
            }
        }
        tracing::info!("message queue shutdown requested");

        let destinations: Vec<String> = self
            .inner
            .pending
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for destination in destinations {
            let Some((_, entries)) = self.inner.pending.remove(&destination) else {
                continue;
            };
            for entry in entries {
                if !entry.notifier.cancel() {
                    continue;
                }
                if let Some(message) = entry.delivery.take() {
                    tracing::warn!(destination = %destination, message_id = message.id(), "parked message dropped at shutdown");
                    self.inner.shared.events.publish(BrokerEvent::dropped(
                        message.id(),
                        Some(&destination),
                        DropReason::Shutdown,
                    ));
                    message.close();
                }
            }
        }

        self.inner.workers.shutdown();
    }

    /// Wait for the worker pool to finish after [`shutdown`](Self::shutdown).
    pub async fn join(&self) {
        self.inner.workers.join().await;
    }
}

// ---------------------------------------------------------------------------
// Dispatch internals
// ---------------------------------------------------------------------------

impl QueueInner {
    fn lock_registry(&self) -> MutexGuard<'_, ()> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lookup(&self, id: &str) -> Option<Arc<Endpoint>> {
        self.endpoints.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub(crate) fn dispatch(&self, message: Message) {
        let destination = match message.destination() {
            Some(Destination::Endpoint(id)) => id.clone(),
            Some(Destination::Drop) => {
                tracing::trace!(message_id = message.id(), "message addressed to drop sentinel");
                self.shared.events.publish(BrokerEvent::dropped(
                    message.id(),
                    message.from(),
                    DropReason::Sentinel,
                ));
                message.close();
                return;
            }
            None => {
                tracing::warn!(
                    message_id = message.id(),
                    from = ?message.from(),
                    "dispatch without destination, message dropped"
                );
                self.shared.events.publish(BrokerEvent::dropped(
                    message.id(),
                    message.from(),
                    DropReason::RoutingMiss,
                ));
                message.close();
                return;
            }
        };

        match self.lookup(&destination) {
            Some(endpoint) => self.submit(endpoint, message),
            None => self.defer(destination, message),
        }
    }

    /// Queue the message for consumption on the worker pool.
    fn submit(&self, endpoint: Arc<Endpoint>, message: Message) {
        let message_id = message.id();
        tracing::trace!(endpoint_id = %endpoint.id(), message_id, "message submitted");
        if let Err(err) = self.workers.submit(endpoint.consume(message)) {
            // The rejected job owned the message; dropping it released it.
            tracing::warn!(message_id, error = %err, "message dropped, worker pool unavailable");
            self.shared.events.publish(BrokerEvent::dropped(
                message_id,
                None,
                DropReason::Shutdown,
            ));
        }
    }

    /// Park a message until `destination` registers or the timeout fires.
    fn defer(&self, destination: String, message: Message) {
        let message_id = message.id();
        let delivery = Arc::new(PendingDelivery {
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            destination: destination.clone(),
            message: Mutex::new(Some(message)),
        });
        let notifier = self.timeouts.create_notifier(Arc::clone(&delivery));

        self.pending
            .entry(destination.clone())
            .or_default()
            .push_back(PendingEntry {
                delivery: Arc::clone(&delivery),
                notifier: notifier.clone(),
            });
        notifier.schedule(self.message_timeout);

        tracing::debug!(
            destination = %destination,
            message_id,
            timeout_ms = self.message_timeout.as_millis() as u64,
            "destination not bound, message parked"
        );

        // The destination may have registered between the lookup and the
        // append above, after its wake had already drained the list.
        if let Some(endpoint) = self.lookup(&destination) {
            if notifier.cancel() {
                self.remove_pending(&destination, delivery.seq);
                if let Some(message) = delivery.take() {
                    self.submit(endpoint, message);
                }
            }
        }
    }

    /// Deliver everything parked for a newly registered endpoint.
    fn wake(&self, id: &str) {
        let Some((_, entries)) = self.pending.remove(id) else {
            return;
        };
        tracing::debug!(endpoint_id = %id, parked = entries.len(), "waking parked messages");

        for entry in entries {
            if !entry.notifier.cancel() {
                // The timer fired first and owns this message.
                continue;
            }
            let Some(message) = entry.delivery.take() else {
                continue;
            };
            match self.lookup(id) {
                Some(endpoint) => self.submit(endpoint, message),
                // Unbound again before we got here: park afresh.
                None => self.defer(id.to_owned(), message),
            }
        }
    }

    /// Timeout listener: drop a parked message whose destination never came.
    fn expire(&self, delivery: &PendingDelivery) {
        self.remove_pending(&delivery.destination, delivery.seq);
        let Some(message) = delivery.take() else {
            return;
        };

        let err = BrokerError::DeliveryTimeout {
            destination: delivery.destination.clone(),
            message_id: message.id(),
        };
        tracing::warn!(
            destination = %delivery.destination,
            message_id = message.id(),
            from = ?message.from(),
            timeout_ms = self.message_timeout.as_millis() as u64,
            properties = ?message.properties(),
            "{err}"
        );
        self.shared.events.publish(BrokerEvent::dropped(
            message.id(),
            Some(&delivery.destination),
            DropReason::DeliveryTimeout,
        ));
        message.close();
    }

    fn remove_pending(&self, destination: &str, seq: u64) {
        if let Some(mut list) = self.pending.get_mut(destination) {
            list.retain(|entry| entry.delivery.seq != seq);
        }
        self.pending.remove_if(destination, |_, list| list.is_empty());
    }
}

impl Drop for QueueInner {
    fn drop(&mut self) {
        // Workers only hold the pool, so they would otherwise idle forever.
        self.workers.shutdown();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::ProducerState;
    use crate::error::ComponentResult;
    use crate::locator::{ComponentRef, Consumer, InMemoryLocator};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Counter {
        received: AtomicUsize,
    }

    #[async_trait]
    impl Consumer for Counter {
        async fn on_message(&self, _message: &mut Message) -> ComponentResult {
            self.received.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn queue_with(timeout: Duration) -> (MessageQueue, Arc<InMemoryLocator>, Arc<Counter>) {
        let locator = Arc::new(InMemoryLocator::new());
        let counter = Arc::new(Counter::default());
        locator.register("counter", ComponentRef::consumer(counter.clone()));
        let queue = MessageQueue::start(
            BrokerConfig::new().with_message_timeout(timeout).with_workers(2),
            locator.clone(),
        )
        .expect("start queue");
        (queue, locator, counter)
    }

    fn addressed(to: &str) -> Message {
        let mut message = Message::acquire();
        message.set_to(to);
        message
    }

    #[test]
    fn start_outside_runtime_fails() {
        let result = MessageQueue::start(BrokerConfig::new(), Arc::new(InMemoryLocator::new()));
        assert!(matches!(result, Err(BrokerError::Runtime(_))));
    }

    #[tokio::test]
    async fn bind_rejects_blank_and_duplicate_ids() {
        let (queue, _, _) = queue_with(Duration::from_secs(5));

        let blank = queue.bind("  ", ServiceHandle::consumer("counter"));
        assert!(matches!(blank, Err(BrokerError::Registration { .. })));

        queue.bind("B", ServiceHandle::consumer("counter")).unwrap();
        let duplicate = queue.bind("B", ServiceHandle::consumer("other"));
        assert!(matches!(duplicate, Err(BrokerError::Registration { .. })));
        assert_eq!(queue.endpoint("B").unwrap().handle().service(), "counter");

        let same_service = queue.bind("C", ServiceHandle::consumer("counter"));
        assert!(matches!(same_service, Err(BrokerError::Registration { .. })));
        assert!(!queue.is_bound("C"));
    }

    #[tokio::test]
    async fn dispatch_to_bound_endpoint_delivers_once() {
        let (queue, _, counter) = queue_with(Duration::from_secs(5));
        queue.bind("B", ServiceHandle::consumer("counter")).unwrap();

        queue.dispatch(addressed("B"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.received.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn drop_sentinel_is_never_delivered() {
        let (queue, _, counter) = queue_with(Duration::from_secs(5));
        queue.bind("B", ServiceHandle::consumer("counter")).unwrap();
        let mut rx = queue.events().subscribe();

        let mut message = Message::acquire();
        message.set_drop();
        queue.dispatch(message);

        let event = rx.recv().await.unwrap();
        assert!(matches!(
            event.as_ref(),
            BrokerEvent::MessageDropped {
                reason: DropReason::Sentinel,
                ..
            }
        ));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(counter.received.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn parked_message_delivered_on_bind() {
        let (queue, _, counter) = queue_with(Duration::from_secs(2));

        queue.dispatch(addressed("B"));
        assert_eq!(queue.pending_count("B"), 1);

        tokio::time::sleep(Duration::from_secs(1)).await;
        queue.bind("B", ServiceHandle::consumer("counter")).unwrap();
        assert_eq!(queue.pending_count("B"), 0);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(counter.received.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn parked_message_expires() {
        let (queue, _, counter) = queue_with(Duration::from_secs(2));
        let mut rx = queue.events().subscribe();

        queue.dispatch(addressed("B"));
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(queue.pending_count("B"), 0);

        queue.bind("B", ServiceHandle::consumer("counter")).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(counter.received.load(Ordering::SeqCst), 0);

        let event = rx.recv().await.unwrap();
        assert!(matches!(
            event.as_ref(),
            BrokerEvent::MessageDropped {
                reason: DropReason::DeliveryTimeout,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn wake_preserves_fifo_order_of_parked_list() {
        let (queue, _, _) = queue_with(Duration::from_secs(10));
        for _ in 0..3 {
            queue.dispatch(addressed("later"));
        }
        let seqs: Vec<u64> = queue
            .inner
            .pending
            .get("later")
            .unwrap()
            .iter()
            .map(|entry| entry.delivery.seq)
            .collect();
        assert!(seqs.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(queue.pending_count("later"), 3);
    }

    #[tokio::test]
    async fn unbind_closes_producer() {
        let (queue, _, _) = queue_with(Duration::from_secs(5));
        let handle = ServiceHandle::consumer("counter");
        let producer = queue.bind("B", handle.clone()).unwrap();

        assert!(queue.unbind(&handle));
        assert!(!queue.unbind(&handle));
        assert!(!queue.is_bound("B"));
        assert!(matches!(
            producer.create_message(),
            Err(BrokerError::ProducerClosed { .. })
        ));
    }

    #[tokio::test]
    async fn rebind_moves_and_reverts() {
        let (queue, locator, _) = queue_with(Duration::from_secs(5));
        locator.register("other", ComponentRef::consumer(Arc::new(Counter::default())));

        let handle = ServiceHandle::consumer("counter");
        let producer = queue.bind("A", handle.clone()).unwrap();
        queue.bind("C", ServiceHandle::consumer("other")).unwrap();

        queue.rebind(&handle, "B").unwrap();
        assert!(queue.is_bound("B"));
        assert!(!queue.is_bound("A"));
        assert_eq!(producer.endpoint_id(), "B");

        let collision = queue.rebind(&handle, "C");
        assert!(matches!(collision, Err(BrokerError::Registration { .. })));
        assert!(queue.is_bound("B"));
        assert_eq!(producer.endpoint_id(), "B");
        assert_eq!(queue.endpoint("C").unwrap().handle().service(), "other");
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_drops_parked_messages_and_rejects_binds() {
        let (queue, _, _) = queue_with(Duration::from_secs(30));
        let mut rx = queue.events().subscribe();
        queue.dispatch(addressed("nowhere"));

        queue.shutdown();
        queue.join().await;
        assert_eq!(queue.pending_count("nowhere"), 0);

        let event = rx.recv().await.unwrap();
        assert!(matches!(
            event.as_ref(),
            BrokerEvent::MessageDropped {
                reason: DropReason::Shutdown,
                ..
            }
        ));
        assert!(matches!(
            queue.bind("late", ServiceHandle::consumer("counter")),
            Err(BrokerError::Registration { .. })
        ));
    }

    fn timeouts(rx: &mut tokio::sync::broadcast::Receiver<Arc<BrokerEvent>>) -> usize {
        let mut count = 0;
        while let Ok(event) = rx.try_recv() {
            if let BrokerEvent::MessageDropped {
                reason: DropReason::DeliveryTimeout,
                ..
            } = event.as_ref()
            {
                count += 1;
            }
        }
        count
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn rejected_rebind_never_exposes_the_old_id() {
        let (queue, locator, _) = queue_with(Duration::from_secs(5));
        locator.register("intruder", ComponentRef::consumer(Arc::new(Counter::default())));
        let main = ServiceHandle::consumer("counter");
        let main_producer = queue.bind("A", main.clone()).unwrap();
        queue.bind("C", ServiceHandle::consumer("occupant")).unwrap();

        let stop = Arc::new(AtomicBool::new(false));
        let rejected = Arc::new(AtomicUsize::new(0));
        let rebinder = {
            let (queue, main) = (queue.clone(), main.clone());
            let (stop, rejected) = (Arc::clone(&stop), Arc::clone(&rejected));
            std::thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    if queue.rebind(&main, "C").is_err() {
                        rejected.fetch_add(1, Ordering::SeqCst);
                    }
                }
            })
        };
        while rejected.load(Ordering::SeqCst) == 0 {
            std::thread::yield_now();
        }

        let intruder = ServiceHandle::consumer("intruder");
        let mut stolen = 0;
        for _ in 0..2000 {
            if queue.bind("A", intruder.clone()).is_ok() {
                stolen += 1;
                queue.unbind(&intruder);
            }
        }
        stop.store(true, Ordering::SeqCst);
        rebinder.join().unwrap();

        assert_eq!(stolen, 0);
        assert_eq!(main_producer.state(), ProducerState::Open);
        assert_eq!(main_producer.endpoint_id(), "A");
        assert_eq!(queue.endpoint("A").unwrap().handle().service(), "counter");
        assert_eq!(queue.endpoint("C").unwrap().handle().service(), "occupant");
    }

    #[tokio::test]
    async fn unbind_racing_rebind_is_never_lost() {
        let (queue, _, _) = queue_with(Duration::from_secs(5));
        queue.bind("C", ServiceHandle::consumer("occupant")).unwrap();

        for round in 0..200 {
            let handle = ServiceHandle::consumer(format!("svc-{round}"));
            let producer = queue.bind("A", handle.clone()).unwrap();
            let rebinder = {
                let (queue, handle) = (queue.clone(), handle.clone());
                std::thread::spawn(move || {
                    let _ = queue.rebind(&handle, "C");
                })
            };
            assert!(queue.unbind(&handle));
            rebinder.join().unwrap();

            assert!(!queue.is_bound("A"));
            assert_eq!(producer.state(), ProducerState::Closed);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn parked_message_reclaimed_when_endpoint_appears_before_wake() {
        let (queue, _, counter) = queue_with(Duration::from_secs(2));
        let mut rx = queue.events().subscribe();

        // Registered without a wake, as when a bind lands between the
        // dispatch lookup and the append to the pending list.
        let endpoint = Arc::new(Endpoint::new(
            "B".to_owned(),
            ServiceHandle::consumer("counter"),
            Arc::clone(&queue.inner.shared),
            Arc::downgrade(&queue.inner),
        ));
        queue.inner.endpoints.insert("B".to_owned(), endpoint);

        queue.inner.defer("B".to_owned(), addressed("B"));
        assert_eq!(queue.pending_count("B"), 0);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(counter.received.load(Ordering::SeqCst), 1);
        assert_eq!(timeouts(&mut rx), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn woken_message_is_parked_again_when_endpoint_is_gone() {
        let (queue, _, counter) = queue_with(Duration::from_secs(2));
        let mut rx = queue.events().subscribe();

        queue.dispatch(addressed("B"));
        tokio::time::sleep(Duration::from_secs(1)).await;

        // Wake with no endpoint registered: the message gets a fresh window.
        queue.inner.wake("B");
        assert_eq!(queue.pending_count("B"), 1);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(queue.pending_count("B"), 1);
        assert_eq!(timeouts(&mut rx), 0);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(queue.pending_count("B"), 0);
        assert_eq!(timeouts(&mut rx), 1);
        assert_eq!(counter.received.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn dropping_last_handle_stops_workers() {
        let (queue, _, _) = queue_with(Duration::from_secs(5));
        let workers = queue.inner.workers.clone();
        assert!(!workers.is_shutdown());

        drop(queue);
        assert!(workers.is_shutdown());
        workers.join().await;
    }
}
