//! One-shot cancellable timeouts.
//!
//! A [`TimeoutService`] owns a single listener and hands out [`Notifier`]s,
//! each bound to a subject.  When an armed notifier expires the listener is
//! called once with that subject.
//!
//! # Arbitration
//!
//! ```text
//! Idle --schedule--> Scheduled --fire---> Fired
//!                             \--cancel--> Cancelled
//! ```
//!
//! Both `fire` and `cancel` leave `Scheduled` through one compare-exchange on
//! the same atomic, so for any notifier exactly one of them wins.  Callers
//! rely on that: whoever wins owns the subject's outcome.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

const IDLE: u8 = 0;
const SCHEDULED: u8 = 1;
const FIRED: u8 = 2;
const CANCELLED: u8 = 3;

/// Observable state of a [`Notifier`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotifierState {
    /// Created, not yet armed.
    Idle,
    /// Armed and waiting to fire.
    Scheduled,
    /// The timer fired and the listener was (or is being) invoked.
    Fired,
    /// A caller disarmed the notifier before it fired.
    Cancelled,
}

type Listener<S> = Arc<dyn Fn(S) + Send + Sync>;

/// Factory for notifiers sharing one expiry listener.
pub struct TimeoutService<S> {
    runtime: Handle,
    listener: Listener<S>,
}

impl<S> TimeoutService<S>
where
    S: Clone + Send + Sync + 'static,
{
    /// Create a service whose timers run on `runtime` and call `listener` on
    /// expiry.
    pub fn new(runtime: Handle, listener: impl Fn(S) + Send + Sync + 'static) -> Self {
        Self {
            runtime,
            listener: Arc::new(listener),
        }
    }

    /// Create an idle notifier for `subject`.
    pub fn create_notifier(&self, subject: S) -> Notifier<S> {
        Notifier {
            inner: Arc::new(NotifierInner {
                state: AtomicU8::new(IDLE),
                subject,
                listener: Arc::clone(&self.listener),
                runtime: self.runtime.clone(),
                timer: Mutex::new(None),
            }),
        }
    }
}

/// A one-shot, cancellable timer handle.  Clones refer to the same timer.
pub struct Notifier<S> {
    inner: Arc<NotifierInner<S>>,
}

struct NotifierInner<S> {
    state: AtomicU8,
    subject: S,
    listener: Listener<S>,
    runtime: Handle,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl<S> Clone for Notifier<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S> Notifier<S>
where
    S: Clone + Send + Sync + 'static,
{
    /// Arm the notifier to fire after `after`.
    ///
    /// Returns `false` if it was already scheduled, fired or cancelled.
    pub fn schedule(&self, after: Duration) -> bool {
        if self
            .inner
            .state
            .compare_exchange(IDLE, SCHEDULED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let inner = Arc::clone(&self.inner);
        let timer = self.inner.runtime.spawn(async move {
            tokio::time::sleep(after).await;
            inner.fire();
        });
        *self
            .inner
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(timer);
        true
    }

    /// Disarm the notifier.
    ///
    /// Returns `true` iff this call won against the timer: the listener will
    /// never run for this notifier.  Returns `false` if it was never
    /// scheduled, already fired (or is firing right now), or already
    /// cancelled.
    pub fn cancel(&self) -> bool {
        if self
            .inner
            .state
            .compare_exchange(SCHEDULED, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        if let Some(timer) = self
            .inner
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            timer.abort();
        }
        true
    }

    pub fn state(&self) -> NotifierState {
        match self.inner.state.load(Ordering::Acquire) {
            IDLE => NotifierState::Idle,
            SCHEDULED => NotifierState::Scheduled,
            FIRED => NotifierState::Fired,
            _ => NotifierState::Cancelled,
        }
    }

    pub fn subject(&self) -> &S {
        &self.inner.subject
    }
}

impl<S: Clone> NotifierInner<S> {
    fn fire(&self) {
        if self
            .state
            .compare_exchange(SCHEDULED, FIRED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            (self.listener)(self.subject.clone());
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
