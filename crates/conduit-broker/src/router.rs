//! Property-based message routing.
//!
//! When an endpoint sends a message without a destination, the broker asks
//! the [`RouteTable`] where it should go.  Routes are evaluated in two tiers:
//!
//! | Tier | Rules | Order |
//! |------|-------|-------|
//! | 1 | rules registered for the sending endpoint id | registration order |
//! | 2 | wildcard rules (source `*`) | registration order |
//!
//! The first rule whose [`Filter`] matches the message properties wins.  If
//! nothing matches, routing returns `None` and the caller drops the message.
//!
//! Routers are immutable once published; adding a rule swaps in a new
//! [`Router`] so concurrent senders never see a half-built rule list.
//!
//! ```rust
//! # use conduit_broker::{Message, RouteTable};
//! let table = RouteTable::new();
//! table.add_route("orders", "(type=invoice)", "billing").unwrap();
//! table.add_route("*", "*", "audit").unwrap();
//!
//! let mut message = Message::acquire();
//! message.set_property("type", "invoice");
//! assert_eq!(table.route("orders", &message).as_deref(), Some("billing"));
//! assert_eq!(table.route("shipping", &message).as_deref(), Some("audit"));
//! ```

use std::sync::Arc;

use dashmap::DashMap;

use crate::config::RouteConfig;
use crate::error::{BrokerError, Result};
use crate::filter::Filter;
use crate::message::Message;

/// Source id under which wildcard rules are registered.
pub const ANY_SOURCE: &str = "*";

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// A single route rule.
#[derive(Debug, Clone)]
pub struct Route {
    pub filter: Filter,
    /// Endpoint id the message is addressed to on match.
    pub destination: String,
}

/// Ordered route rules for one source.
#[derive(Debug, Clone, Default)]
pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a rule.  Later rules only apply if earlier ones do not match.
    pub fn add(&mut self, filter: Filter, destination: impl Into<String>) {
        self.routes.push(Route {
            filter,
            destination: destination.into(),
        });
    }

    /// Parse `filter` and append the rule.
    pub fn add_rule(&mut self, filter: &str, destination: impl Into<String>) -> Result<()> {
        self.add(Filter::parse(filter)?, destination);
        Ok(())
    }

    /// Destination of the first rule matching the message properties.
    pub fn route(&self, message: &Message) -> Option<&str> {
        self.routes
            .iter()
            .find(|route| route.filter.matches(message.properties()))
            .map(|route| route.destination.as_str())
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

// ---------------------------------------------------------------------------
// RouteTable
// ---------------------------------------------------------------------------

/// Routers keyed by source endpoint id, plus the wildcard router.
#[derive(Default)]
pub struct RouteTable {
    by_source: DashMap<String, Arc<Router>>,
}

impl RouteTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table from configured routes, in order.
    pub fn from_config(routes: &[RouteConfig]) -> Result<Self> {
        let table = Self::new();
        for route in routes {
            table.add_route(&route.from, &route.filter, &route.to)?;
        }
        Ok(table)
    }

    /// Append a rule for `source` (or [`ANY_SOURCE`]).
    pub fn add_route(&self, source: &str, filter: &str, destination: &str) -> Result<()> {
        let destination = destination.trim();
        if destination.is_empty() {
            return Err(BrokerError::Config(format!(
                "route from `{source}` with filter `{filter}` has no destination"
            )));
        }
        let filter = Filter::parse(filter)?;

        tracing::debug!(
            source = %source,
            filter = %filter,
            destination = %destination,
            "route added"
        );

        let mut slot = self.by_source.entry(source.to_owned()).or_default();
        let mut next = Router::clone(&slot);
        next.add(filter, destination);
        *slot = Arc::new(next);
        Ok(())
    }

    /// Drop every rule registered for `source`.
    pub fn clear_source(&self, source: &str) -> usize {
        self.by_source
            .remove(source)
            .map(|(_, router)| router.len())
            .unwrap_or(0)
    }

    /// Current router for `source`, not including wildcard rules.
    pub fn router_for(&self, source: &str) -> Option<Arc<Router>> {
        self.by_source
            .get(source)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Resolve the destination for a message sent by `source`.
    pub fn route(&self, source: &str, message: &Message) -> Option<String> {
        let tiers = [self.router_for(source), self.router_for(ANY_SOURCE)];
        for router in tiers.iter().flatten() {
            if let Some(destination) = router.route(message) {
                tracing::debug!(
                    source = %source,
                    message_id = message.id(),
                    destination = %destination,
                    "route matched"
                );
                return Some(destination.to_owned());
            }
        }
        tracing::debug!(source = %source, message_id = message.id(), "no route matched");
        None
    }

    /// Total number of rules across all sources.
    pub fn len(&self) -> usize {
        self.by_source.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn message_with(key: &str, value: &str) -> Message {
        let mut message = Message::acquire();
        message.set_property(key, value);
        message
    }

    #[test]
    fn first_matching_rule_wins() {
        let mut router = Router::new();
        router.add_rule("(type=order)", "orders").unwrap();
        router.add_rule("(type=*)", "catch-all").unwrap();

        assert_eq!(router.route(&message_with("type", "order")), Some("orders"));
        assert_eq!(router.route(&message_with("type", "refund")), Some("catch-all"));
        assert_eq!(router.route(&message_with("kind", "order")), None);
    }

    #[test]
    fn source_rules_precede_wildcard_rules() {
        let table = RouteTable::new();
        table.add_route(ANY_SOURCE, "(type=order)", "central").unwrap();
        table.add_route("web", "(type=order)", "web-orders").unwrap();

        let message = message_with("type", "order");
        assert_eq!(table.route("web", &message).as_deref(), Some("web-orders"));
        assert_eq!(table.route("mobile", &message).as_deref(), Some("central"));
    }

    #[test]
    fn no_match_returns_none() {
        let table = RouteTable::new();
        table.add_route("web", "(type=order)", "orders").unwrap();
        assert!(table.route("web", &message_with("type", "refund")).is_none());
        assert!(table.route("other", &message_with("type", "order")).is_none());
    }

    #[test]
    fn published_router_is_not_mutated() {
        let table = RouteTable::new();
        table.add_route("web", "(a=1)", "x").unwrap();
        let snapshot = table.router_for("web").unwrap();

        table.add_route("web", "(b=2)", "y").unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(table.router_for("web").unwrap().len(), 2);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn invalid_routes_are_rejected() {
        let table = RouteTable::new();
        assert!(matches!(
            table.add_route("web", "(broken", "x"),
            Err(BrokerError::InvalidFilter { .. })
        ));
        assert!(matches!(
            table.add_route("web", "*", "  "),
            Err(BrokerError::Config(_))
        ));
        assert!(table.is_empty());
    }

    #[test]
    fn from_config_preserves_order() {
        let routes = vec![
            RouteConfig {
                from: "*".into(),
                filter: "(priority=high)".into(),
                to: "fast-lane".into(),
            },
            RouteConfig {
                from: "*".into(),
                filter: "*".into(),
                to: "slow-lane".into(),
            },
        ];
        let table = RouteTable::from_config(&routes).unwrap();
        assert_eq!(
            table.route("any", &message_with("priority", "high")).as_deref(),
            Some("fast-lane")
        );
        assert_eq!(
            table.route("any", &message_with("priority", "low")).as_deref(),
            Some("slow-lane")
        );
        assert_eq!(table.clear_source("*"), 2);
    }
}
