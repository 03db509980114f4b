//! Message interceptors and the shared handler pool.
//!
//! A [`MessageHandler`] runs on every message passing through an endpoint:
//! post-handlers on `send`, pre-handlers before consumption.  Returning
//! `false` vetoes the message, which is then dropped.
//!
//! Handler implementations are registered with a [`HandlerPool`] under an id
//! together with a factory.  Endpoints refer to handlers by id; the pool
//! creates one shared instance on first use and keeps a reference count per
//! id.  When the last endpoint releases an id the instance is deactivated
//! and discarded.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;

use crate::error::{BrokerError, Result};
use crate::message::Message;

/// An interceptor on the send or consume path.
pub trait MessageHandler: Send + Sync {
    /// Inspect or modify the message.  Return `false` to reject it.
    fn handle(&self, message: &mut Message) -> bool;

    /// Called once when the last endpoint using this instance releases it.
    fn deactivate(&self) {}
}

/// Creates handler instances on first use.
pub type HandlerFactory = Arc<dyn Fn() -> Arc<dyn MessageHandler> + Send + Sync>;

/// A resolved, ordered handler chain.  Entries keep their id for logging.
pub type HandlerChain = Arc<[(String, Arc<dyn MessageHandler>)]>;

struct ActiveHandler {
    instance: Arc<dyn MessageHandler>,
    refs: usize,
}

/// Reference-counted registry of handler implementations.
#[derive(Default)]
pub struct HandlerPool {
    factories: DashMap<String, HandlerFactory>,
    active: Mutex<HashMap<String, ActiveHandler>>,
}

impl HandlerPool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under `id`, replacing any previous one.  Instances
    /// already handed out keep running until released.
    pub fn register(&self, id: impl Into<String>, factory: HandlerFactory) {
        let id = id.into();
        tracing::debug!(handler_id = %id, "handler registered");
        self.factories.insert(id, factory);
    }

    /// Register a single shared instance under `id`.
    pub fn register_instance(&self, id: impl Into<String>, handler: Arc<dyn MessageHandler>) {
        self.register(id, Arc::new(move || Arc::clone(&handler)));
    }

    /// Forget the factory for `id`.  Active instances are unaffected.
    pub fn unregister(&self, id: &str) -> bool {
        self.factories.remove(id).is_some()
    }

    /// Resolve `ids` into a chain, taking one reference per id.
    ///
    /// Either every id is acquired or none is: an unknown id fails the whole
    /// call with [`BrokerError::HandlerNotFound`].
    pub fn acquire(&self, ids: &[String]) -> Result<HandlerChain> {
        let mut active = self.lock();

        for id in ids {
            if !active.contains_key(id) && !self.factories.contains_key(id) {
                return Err(BrokerError::HandlerNotFound {
                    handler_id: id.clone(),
                });
            }
        }

        let mut chain = Vec::with_capacity(ids.len());
        for id in ids {
            if !active.contains_key(id) {
                let factory = self
                    .factories
                    .get(id)
                    .map(|f| Arc::clone(f.value()))
                    .ok_or_else(|| BrokerError::HandlerNotFound {
                        handler_id: id.clone(),
                    })?;
                tracing::debug!(handler_id = %id, "handler activated");
                active.insert(
                    id.clone(),
                    ActiveHandler {
                        instance: factory(),
                        refs: 0,
                    },
                );
            }
            let Some(entry) = active.get_mut(id) else {
                continue;
            };
            entry.refs += 1;
            chain.push((id.clone(), Arc::clone(&entry.instance)));
        }

        Ok(chain.into())
    }

    /// Drop one reference per id.  Instances reaching zero are deactivated.
    pub fn release(&self, ids: &[String]) {
        let mut retired = Vec::new();
        {
            let mut active = self.lock();
            for id in ids {
                let Some(entry) = active.get_mut(id) else {
                    tracing::warn!(handler_id = %id, "release of inactive handler ignored");
                    continue;
                };
                entry.refs -= 1;
                if entry.refs == 0 {
                    if let Some(entry) = active.remove(id) {
                        retired.push((id.clone(), entry.instance));
                    }
                }
            }
        }

        for (id, instance) in retired {
            tracing::debug!(handler_id = %id, "handler deactivated");
            instance.deactivate();
        }
    }

    /// Current reference count for `id` (zero if inactive).
    pub fn ref_count(&self, id: &str) -> usize {
        self.lock().get(id).map(|entry| entry.refs).unwrap_or(0)
    }

    /// Number of live shared instances.
    pub fn active_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ActiveHandler>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
