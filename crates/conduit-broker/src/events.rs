//! Broker event bus.
//!
//! Registry changes and message outcomes are published as [`BrokerEvent`]s on
//! a [`tokio::sync::broadcast`] channel.  Delivery failures are never
//! returned to producers, so the bus (together with the logs) is the only way
//! to observe why a message disappeared.
//!
//! Events are wrapped in [`Arc`] so broadcasting to several subscribers does
//! not clone the payload.
//!
//! ```rust,no_run
//! # use conduit_broker::events::{BrokerEvent, EventBus};
//! # async fn example() {
//! let bus = EventBus::new(64);
//! let mut rx = bus.subscribe();
//! bus.publish(BrokerEvent::EndpointUnbound {
//!     endpoint_id: "orders".into(),
//!     timestamp: chrono::Utc::now(),
//! });
//! let event = rx.recv().await.unwrap();
//! # }
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

/// Why a message was dropped instead of delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// The message was addressed to the drop sentinel.
    Sentinel,
    /// No route matched a message without a destination.
    RoutingMiss,
    /// A pre- or post-handler vetoed the message.
    HandlerRejected,
    /// The destination component failed while consuming it.
    ConsumerFault,
    /// The destination did not register within the delivery window.
    DeliveryTimeout,
    /// The destination component could not be resolved.
    ComponentUnavailable,
    /// The sending endpoint was already unregistered.
    ProducerClosed,
    /// The broker shut down while the message was parked.
    Shutdown,
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Sentinel => "sentinel",
            Self::RoutingMiss => "routing_miss",
            Self::HandlerRejected => "handler_rejected",
            Self::ConsumerFault => "consumer_fault",
            Self::DeliveryTimeout => "delivery_timeout",
            Self::ComponentUnavailable => "component_unavailable",
            Self::ProducerClosed => "producer_closed",
            Self::Shutdown => "shutdown",
        };
        f.write_str(text)
    }
}

/// An event published by the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BrokerEvent {
    /// An endpoint was registered.
    EndpointBound {
        endpoint_id: String,
        /// Service name of the hosted component.
        service: String,
        timestamp: DateTime<Utc>,
    },

    /// An endpoint was unregistered and its producer closed.
    EndpointUnbound {
        endpoint_id: String,
        timestamp: DateTime<Utc>,
    },

    /// A registered endpoint changed its id.
    EndpointRebound {
        old_id: String,
        new_id: String,
        timestamp: DateTime<Utc>,
    },

    /// The destination component accepted a message.
    MessageDelivered {
        endpoint_id: String,
        message_id: u64,
        timestamp: DateTime<Utc>,
    },

    /// A message was discarded.
    MessageDropped {
        message_id: u64,
        /// Endpoint involved when the drop happened (sender or destination).
        endpoint_id: Option<String>,
        reason: DropReason,
        timestamp: DateTime<Utc>,
    },
}

impl BrokerEvent {
    pub(crate) fn dropped(message_id: u64, endpoint_id: Option<&str>, reason: DropReason) -> Self {
        Self::MessageDropped {
            message_id,
            endpoint_id: endpoint_id.map(str::to_owned),
            reason,
            timestamp: Utc::now(),
        }
    }

    pub(crate) fn delivered(endpoint_id: &str, message_id: u64) -> Self {
        Self::MessageDelivered {
            endpoint_id: endpoint_id.to_owned(),
            message_id,
            timestamp: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Event bus
// ---------------------------------------------------------------------------

/// Publish/subscribe bus for [`BrokerEvent`]s.
///
/// Cheaply cloneable (`Arc`-backed) and `Send + Sync`.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<EventBusInner>,
}

struct EventBusInner {
    sender: broadcast::Sender<Arc<BrokerEvent>>,
}

impl EventBus {
    /// Create a bus with the given channel capacity.  Subscribers lagging by
    /// more than `capacity` events receive `RecvError::Lagged`.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(EventBusInner { sender }),
        }
    }

    /// Publish an event to all current subscribers and return how many will
    /// observe it.  Publishing with no subscribers is not an error.
    pub fn publish(&self, event: BrokerEvent) -> usize {
        match self.inner.sender.send(Arc::new(event)) {
            Ok(n) => {
                tracing::trace!(receivers = n, "broker event published");
                n
            }
            Err(_) => 0,
        }
    }

    /// Subscribe to all future events.  Past events are not replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<BrokerEvent>> {
        self.inner.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.sender.receiver_count()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
