//! State shared between a connection handle and its session task.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;

use super::ConnectionId;
use super::pending::PendingRequest;
use super::state::{ConnectionState, SeedStatus};
use crate::application::ports::PushSink;
use crate::domain::correlation::SequenceCorrelator;
use crate::domain::schema::{MetaDescriptor, SchemaRegistry};
use crate::domain::subscription::{SubscriptionId, SubscriptionRequest};
use crate::domain::universe::{MarketMap, SecurityIndex};
use crate::infrastructure::broadcast::{LifecycleEvent, SharedEventHub};

/// A subscription opened on this connection.
#[derive(Clone)]
pub(super) struct LocalSubscription {
    pub(super) request: SubscriptionRequest,
    pub(super) sink: PushSink,
    pub(super) confirmed: bool,
}

impl LocalSubscription {
    pub(super) fn new(request: SubscriptionRequest, sink: PushSink) -> Self {
        Self {
            request,
            sink,
            confirmed: false,
        }
    }

    /// Whether a push row of this shape, market and code belongs here.
    pub(super) fn accepts(&self, descriptor: &MetaDescriptor, market: &str, code: &str) -> bool {
        let request = &self.request;
        request.namespace == descriptor.namespace
            && request
                .qualified_names
                .iter()
                .any(|name| descriptor.matches_name(name))
            && (request.markets.is_empty() || request.markets.iter().any(|m| m == market))
            && (request.codes.is_empty() || request.codes.iter().any(|c| c == code))
    }
}

pub(super) struct Shared {
    pub(super) id: ConnectionId,
    state: RwLock<ConnectionState>,
    pub(super) schema: RwLock<Arc<SchemaRegistry>>,
    pub(super) markets: RwLock<Arc<MarketMap>>,
    pub(super) securities: RwLock<SecurityIndex>,
    pub(super) correlator: Mutex<SequenceCorrelator<PendingRequest>>,
    pub(super) subscriptions: RwLock<HashMap<SubscriptionId, LocalSubscription>>,
    pub(super) seeds: watch::Sender<SeedStatus>,
    pub(super) events: SharedEventHub,
}

impl Shared {
    pub(super) fn new(id: ConnectionId, events: SharedEventHub) -> Self {
        Self {
            id,
            state: RwLock::new(ConnectionState::Idle),
            schema: RwLock::new(Arc::new(SchemaRegistry::default())),
            markets: RwLock::new(Arc::new(MarketMap::new())),
            securities: RwLock::new(SecurityIndex::default()),
            correlator: Mutex::new(SequenceCorrelator::new()),
            subscriptions: RwLock::new(HashMap::new()),
            seeds: watch::Sender::new(SeedStatus::Pending),
            events,
        }
    }

    pub(super) fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Move to `next` unconditionally.
    pub(super) fn set_state(&self, next: ConnectionState) {
        let previous = std::mem::replace(&mut *self.state.write(), next);
        if previous != next {
            tracing::debug!(
                connection = self.id,
                from = %previous,
                to = %next,
                "Connection state changed"
            );
        }
    }

    /// Move to `Connecting` if no session is active.
    pub(super) fn try_begin(&self) -> Result<(), ConnectionState> {
        let mut state = self.state.write();
        if !state.can_connect() {
            return Err(*state);
        }
        *state = ConnectionState::Connecting;
        Ok(())
    }

    pub(super) fn schema(&self) -> Arc<SchemaRegistry> {
        Arc::clone(&self.schema.read())
    }

    pub(super) fn emit(&self, event: LifecycleEvent) {
        let _ = self.events.send_lifecycle(event);
    }

    /// Forget everything learned by a previous session.
    pub(super) fn reset(&self) {
        *self.schema.write() = Arc::new(SchemaRegistry::default());
        *self.markets.write() = Arc::new(MarketMap::new());
        *self.securities.write() = SecurityIndex::default();
        self.subscriptions.write().clear();
        self.seeds.send_replace(SeedStatus::Pending);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::schema::{FieldDescriptor, FieldType};

    fn quote() -> MetaDescriptor {
        MetaDescriptor::new(
            0,
            12,
            "global::SampleQuote",
            1,
            vec![FieldDescriptor::new("close", FieldType::Double, 0)],
        )
    }

    fn subscription(markets: &[&str], codes: &[&str]) -> LocalSubscription {
        LocalSubscription::new(
            SubscriptionRequest {
                markets: markets.iter().map(ToString::to_string).collect(),
                codes: codes.iter().map(ToString::to_string).collect(),
                qualified_names: vec!["SampleQuote".into()],
                namespace: 0,
                fields: Vec::new(),
                granularities: Vec::new(),
            },
            Arc::new(|_| {}),
        )
    }

    #[test]
    fn accepts_matching_shape_market_and_code() {
        let sub = subscription(&["DCE"], &["i2409"]);
        assert!(sub.accepts(&quote(), "DCE", "i2409"));
        assert!(!sub.accepts(&quote(), "SHFE", "i2409"));
        assert!(!sub.accepts(&quote(), "DCE", "m2409"));
    }

    #[test]
    fn empty_filters_accept_everything_of_the_shape() {
        let sub = subscription(&[], &[]);
        assert!(sub.accepts(&quote(), "SHFE", "rb2410"));
    }

    #[test]
    fn begin_refuses_active_session() {
        let shared = Shared::new(1, Arc::new(crate::infrastructure::broadcast::EventHub::with_defaults()));
        assert!(shared.try_begin().is_ok());
        assert_eq!(shared.try_begin(), Err(ConnectionState::Connecting));
        shared.set_state(ConnectionState::Closed);
        assert!(shared.try_begin().is_ok());
    }
}
